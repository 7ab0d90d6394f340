use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

use super::communication::{parse_engine_line, EngineLine};
use super::types::{
    EngineError, EngineIdentity, EngineResult, HANDSHAKE_TIMEOUT, QUIT_GRACE,
    STDERR_RING_CAPACITY,
};

/// Low-level handle on one USI engine child process.
///
/// Owns stdin and the child; the stdout line reader is handed to the
/// supervisor, which runs the long-lived reader task. Stderr drains into a
/// bounded ring buffer so a chatty engine cannot grow memory.
#[derive(Debug)]
pub struct EngineProcess {
    path: PathBuf,
    stdin: ChildStdin,
    child: Child,
    stderr_ring: Arc<Mutex<VecDeque<String>>>,
}

impl EngineProcess {
    /// Spawn the engine binary and perform the `usi`/`usiok` handshake,
    /// collecting the engine name and declared option names.
    pub async fn spawn(path: &Path) -> EngineResult<(Self, EngineIdentity, Lines<BufReader<ChildStdout>>)> {
        info!("spawning engine: {:?}", path);

        let mut command = Command::new(path);
        // Engines resolve eval files relative to their own directory.
        let workdir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        command.current_dir(workdir);
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .env("TERM", "dumb");

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::SpawnFailed(format!("{:?}: {e}", path)))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            EngineError::SpawnFailed("no stdin handle on engine process".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::SpawnFailed("no stdout handle on engine process".to_string())
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let stderr_ring = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_RING_CAPACITY)));
        if let Some(stderr) = child.stderr.take() {
            let ring = stderr_ring.clone();
            tokio::spawn(async move {
                let mut stderr_lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = stderr_lines.next_line().await {
                    warn!("[engine-stderr] {}", line);
                    if let Ok(mut ring) = ring.lock() {
                        if ring.len() == STDERR_RING_CAPACITY {
                            ring.pop_front();
                        }
                        ring.push_back(line);
                    }
                }
            });
        }

        let mut process = EngineProcess {
            path: path.to_path_buf(),
            stdin,
            child,
            stderr_ring,
        };

        let identity = match timeout(HANDSHAKE_TIMEOUT, process.handshake(&mut lines)).await {
            Ok(Ok(identity)) => identity,
            Ok(Err(e)) => {
                error!("engine handshake failed for {:?}: {e}", path);
                process.force_kill().await;
                return Err(e);
            }
            Err(_) => {
                error!("engine handshake timed out for {:?}", path);
                process.force_kill().await;
                return Err(EngineError::HandshakeTimeout);
            }
        };

        info!("engine ready: {}", identity.name);
        Ok((process, identity, lines))
    }

    async fn handshake(
        &mut self,
        lines: &mut Lines<BufReader<ChildStdout>>,
    ) -> EngineResult<EngineIdentity> {
        self.send("usi").await?;
        let mut identity = EngineIdentity::default();
        loop {
            let line = lines
                .next_line()
                .await?
                .ok_or(EngineError::EngineExited)?;
            match parse_engine_line(&line) {
                EngineLine::IdName(name) => identity.name = name,
                EngineLine::OptionDecl(name) => identity.option_names.push(name),
                EngineLine::UsiOk => return Ok(identity),
                _ => debug!("handshake: ignoring '{}'", line),
            }
        }
    }

    /// Send `isready` and wait for `readyok` on the given reader. Only used
    /// before the reader task takes over the stdout stream.
    pub async fn wait_ready(
        &mut self,
        lines: &mut Lines<BufReader<ChildStdout>>,
    ) -> EngineResult<()> {
        self.send("isready").await?;
        let wait = async {
            loop {
                let line = lines
                    .next_line()
                    .await?
                    .ok_or(EngineError::EngineExited)?;
                if parse_engine_line(&line) == EngineLine::ReadyOk {
                    return Ok(());
                }
            }
        };
        match timeout(HANDSHAKE_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::HandshakeTimeout),
        }
    }

    /// Write one protocol line to engine stdin.
    pub async fn send(&mut self, command: &str) -> EngineResult<()> {
        debug!("[engine-stdin] {}", command);
        let payload = format!("{command}\n");
        self.stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(map_pipe_error)?;
        self.stdin.flush().await.map_err(map_pipe_error)?;
        Ok(())
    }

    pub async fn set_option(&mut self, name: &str, value: impl std::fmt::Display) -> EngineResult<()> {
        self.send(&format!("setoption name {name} value {value}")).await
    }

    /// Whether the child is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("engine exited with status {:?}", status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("could not check engine status: {e}");
                true
            }
        }
    }

    /// Last captured stderr lines, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_ring
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Graceful shutdown: `quit`, short grace period, then kill.
    pub async fn shutdown(&mut self) {
        if self.is_alive() {
            if let Err(e) = self.send("quit").await {
                debug!("quit not delivered: {e}");
            }
            tokio::time::sleep(QUIT_GRACE).await;
        }
        self.force_kill().await;
    }

    pub async fn force_kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("engine kill: {e}");
        }
        if let Err(e) = self.child.wait().await {
            warn!("waiting for engine exit failed: {e}");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn map_pipe_error(e: std::io::Error) -> EngineError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::ConnectionReset => {
            warn!("engine stdin pipe broken");
            EngineError::EngineExited
        }
        _ => EngineError::Io(e),
    }
}
