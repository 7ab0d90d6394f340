//! USI engine supervisor: owns at most one child process and its stdout
//! reader task.
//!
//! The supervisor performs configuration and search control; parsed engine
//! output flows to the analysis coordinator through an event channel. Every
//! search carries a generation number so output from a cancelled search can
//! be discarded by the receiver.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{BufReader, Lines};
use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::communication::{parse_engine_line, EngineLine};
use super::process::EngineProcess;
use super::types::{
    EngineError, EngineIdentity, EngineOutput, EngineResult, EngineSettings, EngineStatus,
    OutputKind, SupervisorState,
};

/// Result of [`EngineSupervisor::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureOutcome {
    /// A fresh process was spawned and is fully configured.
    Cold,
    /// Options were re-sent to the running process; the caller must await
    /// the `ReadyOk` event before analyzing.
    WarmPending,
}

pub struct EngineSupervisor {
    state: SupervisorState,
    process: Option<EngineProcess>,
    identity: Option<EngineIdentity>,
    settings: Option<EngineSettings>,
    generation: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<EngineOutput>,
    reader: Option<JoinHandle<()>>,
}

impl EngineSupervisor {
    pub fn new(events_tx: mpsc::UnboundedSender<EngineOutput>) -> EngineSupervisor {
        EngineSupervisor {
            state: SupervisorState::Idle,
            process: None,
            identity: None,
            settings: None,
            generation: Arc::new(AtomicU64::new(0)),
            events_tx,
            reader: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: Some(self.state),
            engine_id: self.settings.as_ref().map(|s| s.engine_id.clone()),
            name: self.identity.as_ref().map(|i| i.name.clone()),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Spawn (if needed) and configure the engine. A running, same-binary
    /// process is reconfigured in place; the caller then awaits `ReadyOk`.
    pub async fn configure(
        &mut self,
        binary: &Path,
        settings: &EngineSettings,
    ) -> EngineResult<ConfigureOutcome> {
        if self.state == SupervisorState::Searching {
            return Err(EngineError::NotReady);
        }

        let warm = match self.process.as_mut() {
            Some(process) => process.path() == binary && process.is_alive(),
            None => false,
        };

        if warm {
            debug!("warm engine reconfigure: {:?}", settings);
            let outcome = self.send_options(settings).await;
            match outcome {
                Ok(()) => {
                    // Reader task owns stdout now; readyok arrives as an event.
                    if let Some(process) = self.process.as_mut() {
                        process.send("isready").await?;
                    }
                    self.settings = Some(settings.clone());
                    self.state = SupervisorState::Ready;
                    Ok(ConfigureOutcome::WarmPending)
                }
                Err(e) => {
                    self.fail().await;
                    Err(e)
                }
            }
        } else {
            self.teardown().await;
            self.state = SupervisorState::Handshaking;
            let (process, identity, mut lines) = match EngineProcess::spawn(binary).await {
                Ok(spawned) => spawned,
                Err(e) => {
                    self.state = SupervisorState::Failed;
                    return Err(e);
                }
            };
            self.process = Some(process);
            self.identity = Some(identity);
            self.state = SupervisorState::Ready;

            if let Err(e) = self.send_options(settings).await {
                self.fail().await;
                return Err(e);
            }
            let ready = match self.process.as_mut() {
                Some(process) => process.wait_ready(&mut lines).await,
                None => Err(EngineError::NotReady),
            };
            if let Err(e) = ready {
                self.fail().await;
                return Err(e);
            }
            if let Err(e) = self.send_line("usinewgame").await {
                self.fail().await;
                return Err(e);
            }

            self.reader = Some(spawn_reader(
                lines,
                self.events_tx.clone(),
                self.generation.clone(),
            ));
            self.settings = Some(settings.clone());
            self.state = SupervisorState::Configured;
            info!(
                "engine configured: id={} threads={} hash={}MB multipv={}",
                settings.engine_id, settings.threads, settings.hash_mb, settings.multipv
            );
            Ok(ConfigureOutcome::Cold)
        }
    }

    async fn send_options(&mut self, settings: &EngineSettings) -> EngineResult<()> {
        let hash_name = self
            .identity
            .as_ref()
            .map(EngineIdentity::hash_option_name)
            .unwrap_or("Hash");
        let process = self.process.as_mut().ok_or(EngineError::NotReady)?;
        process.set_option("Threads", settings.threads).await?;
        process.set_option(hash_name, settings.hash_mb).await?;
        process.set_option("MultiPV", settings.multipv).await?;
        Ok(())
    }

    /// Mark a warm reconfigure complete once `ReadyOk` was observed.
    pub fn mark_ready_acknowledged(&mut self) {
        if self.state == SupervisorState::Ready {
            self.state = SupervisorState::Configured;
        }
    }

    /// Start an infinite search on the given position command. Returns the
    /// generation tag carried by this search's output events.
    pub async fn analyze(&mut self, position_command: &str) -> EngineResult<u64> {
        if self.state != SupervisorState::Configured {
            return Err(EngineError::NotReady);
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let result = async {
            let process = self.process.as_mut().ok_or(EngineError::NotReady)?;
            process.send(position_command).await?;
            process.send("go infinite").await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                self.state = SupervisorState::Searching;
                debug!("search started (generation {generation})");
                Ok(generation)
            }
            Err(e) => {
                self.fail().await;
                Err(e)
            }
        }
    }

    /// Ask the engine to stop the current search. The caller awaits the
    /// `BestMove` event (bounded) and then calls [`Self::on_bestmove`].
    pub async fn request_stop(&mut self) -> EngineResult<()> {
        if self.state != SupervisorState::Searching {
            return Ok(());
        }
        let process = self.process.as_mut().ok_or(EngineError::NotReady)?;
        process.send("stop").await
    }

    /// Record the `bestmove` that terminates a search.
    pub fn on_bestmove(&mut self) {
        if self.state == SupervisorState::Searching {
            self.state = SupervisorState::Configured;
        }
    }

    /// Drop to `Failed`, killing the child and reader task.
    pub async fn fail(&mut self) {
        warn!("engine supervisor entering failed state");
        self.teardown().await;
        self.state = SupervisorState::Failed;
    }

    /// Return from `Failed` (or any state) to `Idle` with no process.
    pub async fn reset(&mut self) {
        self.teardown().await;
        self.state = SupervisorState::Idle;
    }

    /// Graceful shutdown: `quit`, grace period, then kill.
    pub async fn shutdown(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.shutdown().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.identity = None;
        self.state = SupervisorState::Idle;
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.process
            .as_ref()
            .map(EngineProcess::stderr_tail)
            .unwrap_or_default()
    }

    async fn send_line(&mut self, line: &str) -> EngineResult<()> {
        let process = self.process.as_mut().ok_or(EngineError::NotReady)?;
        process.send(line).await
    }

    async fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut process) = self.process.take() {
            process.force_kill().await;
        }
        self.identity = None;
    }
}

/// Long-lived stdout reader: parses each line and forwards the interesting
/// ones, tagged with the generation active at read time. EOF (engine death)
/// surfaces as a terminal `Exited` event.
fn spawn_reader(
    mut lines: Lines<BufReader<ChildStdout>>,
    events_tx: mpsc::UnboundedSender<EngineOutput>,
    generation: Arc<AtomicU64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let kind = match parse_engine_line(&line) {
                        EngineLine::Info(info) => Some(OutputKind::Info(info)),
                        EngineLine::BestMove(mv) => Some(OutputKind::BestMove(mv)),
                        EngineLine::ReadyOk => Some(OutputKind::ReadyOk),
                        _ => None,
                    };
                    if let Some(kind) = kind {
                        let output = EngineOutput {
                            generation: generation.load(Ordering::SeqCst),
                            kind,
                        };
                        if events_tx.send(output).is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    debug!("engine stdout closed");
                    let _ = events_tx.send(EngineOutput {
                        generation: generation.load(Ordering::SeqCst),
                        kind: OutputKind::Exited,
                    });
                    break;
                }
                Err(e) => {
                    warn!("engine stdout read error: {e}");
                    let _ = events_tx.send(EngineOutput {
                        generation: generation.load(Ordering::SeqCst),
                        kind: OutputKind::Exited,
                    });
                    break;
                }
            }
        }
    })
}
