//! Analysis coordinator: binds the authoritative current node to the USI
//! engine supervisor.
//!
//! One task owns the supervisor, the engine event stream, and the emission
//! coalescer. Commands from the state synchronizer are acknowledged as soon
//! as their synchronous part (cancellation bookkeeping, `analysis:stopped`
//! broadcast) is done, so `game:state` broadcasts can never race a stale
//! analysis frame. The slow `stop` -> `bestmove` wait happens after the ack.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::engine::{
    AnalysisSnapshot, ConfigureOutcome, EngineError, EngineOutput, EngineSettings,
    EngineSupervisor, OutputKind, PvCollector, StatusCell, SupervisorState, HANDSHAKE_TIMEOUT,
    STOP_BESTMOVE_TIMEOUT,
};
use crate::server::hub::{frame, Hub};
use crate::server::protocol::{AnalysisStoppedPayload, AnalysisUpdatePayload, ToastPayload};

/// Coalescer tick resolution.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Flush cadence: one emission per 500 ms for the first 5000 ms of a
/// search, then one per 1000 ms.
const EARLY_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const STEADY_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);
const EARLY_PHASE: Duration = Duration::from_millis(5000);

// =============================================================================
// Commands and handle
// =============================================================================

#[derive(Debug)]
pub enum AnalysisCommand {
    SetEnabled {
        enabled: bool,
        ack: oneshot::Sender<()>,
    },
    SetMultiPv {
        multipv: u8,
        ack: oneshot::Sender<()>,
    },
    NodeChanged {
        node_id: String,
        position_command: String,
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Synchronizer-side handle; every call resolves when the coordinator has
/// finished the synchronous part of the command.
#[derive(Clone)]
pub struct AnalysisHandle {
    tx: mpsc::UnboundedSender<AnalysisCommand>,
}

impl AnalysisHandle {
    pub async fn set_enabled(&self, enabled: bool) {
        self.send(|ack| AnalysisCommand::SetEnabled { enabled, ack }).await;
    }

    pub async fn set_multipv(&self, multipv: u8) {
        self.send(|ack| AnalysisCommand::SetMultiPv { multipv, ack }).await;
    }

    pub async fn node_changed(&self, node_id: String, position_command: String) {
        self.send(|ack| AnalysisCommand::NodeChanged {
            node_id,
            position_command,
            ack,
        })
        .await;
    }

    pub async fn shutdown(&self) {
        self.send(|ack| AnalysisCommand::Shutdown { ack }).await;
    }

    async fn send<F>(&self, build: F)
    where
        F: FnOnce(oneshot::Sender<()>) -> AnalysisCommand,
    {
        let (ack, done) = oneshot::channel();
        if self.tx.send(build(ack)).is_err() {
            warn!("analysis coordinator is gone");
            return;
        }
        if done.await.is_err() {
            warn!("analysis coordinator dropped a command ack");
        }
    }
}

// =============================================================================
// Flush gate
// =============================================================================

/// Timing gate for `analysis:update` emissions. Consulted on every timer
/// tick together with the dirty flag.
#[derive(Debug)]
pub struct FlushGate {
    started: Instant,
    last_flush: Option<Instant>,
}

impl FlushGate {
    pub fn new(now: Instant) -> FlushGate {
        FlushGate {
            started: now,
            last_flush: None,
        }
    }

    fn interval_at(&self, now: Instant) -> Duration {
        if now.duration_since(self.started) < EARLY_PHASE {
            EARLY_FLUSH_INTERVAL
        } else {
            STEADY_FLUSH_INTERVAL
        }
    }

    /// Whether an emission is allowed at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        match self.last_flush {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval_at(now),
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.last_flush = Some(now);
    }

    pub fn elapsed_ms(&self, now: Instant) -> u64 {
        now.duration_since(self.started).as_millis() as u64
    }
}

// =============================================================================
// Coordinator
// =============================================================================

struct ActiveSearch {
    node_id: String,
    generation: u64,
    collector: PvCollector,
    dirty: bool,
    gate: FlushGate,
}

pub struct AnalysisCoordinator {
    commands: mpsc::UnboundedReceiver<AnalysisCommand>,
    engine_events: mpsc::UnboundedReceiver<EngineOutput>,
    supervisor: EngineSupervisor,
    hub: Hub,
    snapshot_tx: mpsc::UnboundedSender<AnalysisSnapshot>,
    status: StatusCell,
    engines: HashMap<String, PathBuf>,
    settings: EngineSettings,
    enabled: bool,
    last_node: Option<(String, String)>,
    active: Option<ActiveSearch>,
}

impl AnalysisCoordinator {
    /// Build the coordinator and its handle. `engines` maps engine ids to
    /// binaries; `settings` are the persisted engine settings.
    pub fn new(
        hub: Hub,
        snapshot_tx: mpsc::UnboundedSender<AnalysisSnapshot>,
        status: StatusCell,
        engines: HashMap<String, PathBuf>,
        settings: EngineSettings,
    ) -> (AnalysisCoordinator, AnalysisHandle) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (event_tx, engine_events) = mpsc::unbounded_channel();
        let supervisor = EngineSupervisor::new(event_tx);
        let coordinator = AnalysisCoordinator {
            commands,
            engine_events,
            supervisor,
            hub,
            snapshot_tx,
            status,
            engines,
            settings,
            enabled: false,
            last_node: None,
            active: None,
        };
        (coordinator, AnalysisHandle { tx: command_tx })
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(AnalysisCommand::Shutdown { ack }) => {
                            self.begin_cancel("shutdown");
                            self.supervisor.shutdown().await;
                            self.publish_status();
                            let _ = ack.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                event = self.engine_events.recv() => {
                    if let Some(event) = event {
                        self.handle_engine_event(event).await;
                    }
                }
                _ = ticker.tick() => {
                    self.maybe_flush();
                }
            }
        }
        info!("analysis coordinator stopped");
    }

    async fn handle_command(&mut self, command: AnalysisCommand) {
        match command {
            AnalysisCommand::SetEnabled { enabled, ack } => {
                if enabled {
                    self.enabled = true;
                    let _ = ack.send(());
                    if self.active.is_none() {
                        self.start_current().await;
                    }
                } else {
                    self.enabled = false;
                    let had_search = self.begin_cancel("disabled");
                    let _ = ack.send(());
                    if had_search {
                        self.finish_cancel().await;
                    }
                }
            }
            AnalysisCommand::SetMultiPv { multipv, ack } => {
                self.settings.multipv = multipv;
                let had_search = self.begin_cancel("multipv_changed");
                let _ = ack.send(());
                if had_search {
                    self.finish_cancel().await;
                }
                if self.enabled {
                    self.start_current().await;
                }
            }
            AnalysisCommand::NodeChanged {
                node_id,
                position_command,
                ack,
            } => {
                let same_node = self
                    .active
                    .as_ref()
                    .map(|a| a.node_id == node_id)
                    .unwrap_or(false);
                self.last_node = Some((node_id, position_command));
                if same_node {
                    let _ = ack.send(());
                    return;
                }
                let had_search = self.begin_cancel("position_changed");
                let _ = ack.send(());
                if had_search {
                    self.finish_cancel().await;
                }
                if self.enabled {
                    self.start_current().await;
                }
            }
            AnalysisCommand::Shutdown { .. } => {
                // Handled in the run loop.
            }
        }
    }

    async fn handle_engine_event(&mut self, event: EngineOutput) {
        match event.kind {
            OutputKind::Info(info) => {
                if let Some(active) = self.active.as_mut() {
                    if event.generation == active.generation && active.collector.apply(&info) {
                        active.dirty = true;
                    }
                }
            }
            OutputKind::BestMove(mv) => {
                // `go infinite` normally ends only via `stop`, but engines
                // may report a forced mate early. Flush what we have and
                // close out the search.
                debug!("unsolicited bestmove {mv}");
                self.supervisor.on_bestmove();
                let current = self
                    .active
                    .as_ref()
                    .map(|a| a.generation == event.generation)
                    .unwrap_or(false);
                if current {
                    self.flush_now();
                    self.begin_cancel("completed");
                }
                self.publish_status();
            }
            OutputKind::ReadyOk => {
                self.supervisor.mark_ready_acknowledged();
            }
            OutputKind::Exited => {
                warn!("engine exited unexpectedly");
                for line in self.supervisor.stderr_tail() {
                    debug!("[engine-stderr tail] {line}");
                }
                self.begin_cancel("exited");
                self.supervisor.fail().await;
                self.enabled = false;
                self.toast_error("engine process exited".to_string());
                self.publish_status();
            }
        }
    }

    /// Synchronous half of cancellation: detach the active search and emit
    /// the terminal `analysis:stopped`. After this returns no further
    /// `analysis:update` for the old node can be produced.
    fn begin_cancel(&mut self, reason: &str) -> bool {
        match self.active.take() {
            Some(active) => {
                self.hub.broadcast(frame(
                    "analysis:stopped",
                    AnalysisStoppedPayload {
                        node_id: Some(active.node_id),
                        reason: reason.to_string(),
                    },
                ));
                true
            }
            None => false,
        }
    }

    /// Asynchronous half: `stop`, bounded `bestmove` wait, kill on timeout.
    async fn finish_cancel(&mut self) {
        if self.supervisor.state() != SupervisorState::Searching {
            return;
        }
        if let Err(e) = self.supervisor.request_stop().await {
            warn!("stop not delivered: {e}");
            self.supervisor.fail().await;
            self.publish_status();
            return;
        }
        match self.await_bestmove().await {
            Ok(()) => {}
            Err(e) => {
                warn!("search did not stop cleanly: {e}");
                self.supervisor.fail().await;
            }
        }
        self.publish_status();
    }

    async fn await_bestmove(&mut self) -> Result<(), EngineError> {
        let deadline = Instant::now() + STOP_BESTMOVE_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, self.engine_events.recv()).await {
                Ok(Some(event)) => match event.kind {
                    OutputKind::BestMove(_) => {
                        self.supervisor.on_bestmove();
                        return Ok(());
                    }
                    OutputKind::Exited => return Err(EngineError::EngineExited),
                    OutputKind::ReadyOk => self.supervisor.mark_ready_acknowledged(),
                    OutputKind::Info(_) => {
                        // Residual lines from the stopped search; discarded.
                    }
                },
                Ok(None) => return Err(EngineError::EngineExited),
                Err(_) => return Err(EngineError::StopTimeout),
            }
        }
    }

    /// Configure (spawn if needed) and start a search on the last known
    /// node. Engine failures disable analysis and surface as events.
    async fn start_current(&mut self) {
        let Some((node_id, position_command)) = self.last_node.clone() else {
            debug!("analysis enabled with no current node yet");
            return;
        };

        if let Err(e) = self.ensure_configured().await {
            self.engine_failure(Some(node_id), e);
            return;
        }
        match self.supervisor.analyze(&position_command).await {
            Ok(generation) => {
                debug!("analyzing node {node_id} (generation {generation})");
                self.active = Some(ActiveSearch {
                    node_id,
                    generation,
                    collector: PvCollector::new(),
                    dirty: false,
                    gate: FlushGate::new(Instant::now()),
                });
                self.publish_status();
            }
            Err(e) => self.engine_failure(Some(node_id), e),
        }
    }

    async fn ensure_configured(&mut self) -> Result<(), EngineError> {
        let binary = self
            .engines
            .get(&self.settings.engine_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownEngine(self.settings.engine_id.clone()))?;

        if self.supervisor.state() == SupervisorState::Failed {
            self.supervisor.reset().await;
        }
        match self.supervisor.configure(&binary, &self.settings).await? {
            ConfigureOutcome::Cold => {}
            ConfigureOutcome::WarmPending => self.await_ready().await?,
        }
        self.publish_status();
        Ok(())
    }

    async fn await_ready(&mut self) -> Result<(), EngineError> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, self.engine_events.recv()).await {
                Ok(Some(event)) => match event.kind {
                    OutputKind::ReadyOk => {
                        self.supervisor.mark_ready_acknowledged();
                        return Ok(());
                    }
                    OutputKind::Exited => return Err(EngineError::EngineExited),
                    _ => {}
                },
                Ok(None) => return Err(EngineError::EngineExited),
                Err(_) => return Err(EngineError::HandshakeTimeout),
            }
        }
    }

    fn engine_failure(&mut self, node_id: Option<String>, error: EngineError) {
        warn!("engine failure: {error}");
        self.active = None;
        self.enabled = false;
        self.hub.broadcast(frame(
            "analysis:stopped",
            AnalysisStoppedPayload {
                node_id,
                reason: error.reason_tag().to_string(),
            },
        ));
        self.toast_error(error.to_string());
        self.publish_status();
    }

    fn maybe_flush(&mut self) {
        let now = Instant::now();
        let should = match self.active.as_ref() {
            Some(active) => active.dirty && active.gate.ready(now),
            None => false,
        };
        if should {
            self.flush_now();
        }
    }

    /// Emit the consolidated line set and queue a snapshot persist.
    fn flush_now(&mut self) {
        let now = Instant::now();
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let lines = active.collector.lines();
        if lines.is_empty() {
            active.dirty = false;
            return;
        }
        let elapsed_ms = active.gate.elapsed_ms(now);
        let payload = AnalysisUpdatePayload {
            node_id: active.node_id.clone(),
            elapsed_ms,
            multipv: self.settings.multipv,
            lines: lines.clone(),
            best: lines.first().cloned(),
        };
        active.dirty = false;
        active.gate.record(now);

        let snapshot = AnalysisSnapshot {
            id: Uuid::new_v4().to_string(),
            node_id: active.node_id.clone(),
            elapsed_ms,
            multipv: self.settings.multipv,
            lines,
            created_at: Utc::now(),
        };
        self.hub.broadcast(frame("analysis:update", payload));
        if self.snapshot_tx.send(snapshot).is_err() {
            debug!("snapshot channel closed");
        }
    }

    fn toast_error(&self, message: String) {
        self.hub.broadcast(frame(
            "toast",
            ToastPayload {
                level: "error",
                message,
            },
        ));
    }

    fn publish_status(&self) {
        self.status.set(self.supervisor.status());
    }
}
