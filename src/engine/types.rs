use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Timeout for the `usi`/`usiok` and `isready`/`readyok` phases.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the `stop` -> `bestmove` wait; the process is killed after it.
pub const STOP_BESTMOVE_TIMEOUT: Duration = Duration::from_secs(3);

/// Grace period between `quit` and a forced kill.
pub const QUIT_GRACE: Duration = Duration::from_millis(300);

/// Retained engine stderr lines.
pub const STDERR_RING_CAPACITY: usize = 64;

// =============================================================================
// Error Types
// =============================================================================

/// Failures from the engine supervisor and its child process.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to spawn engine: {0}")]
    SpawnFailed(String),

    #[error("engine handshake timeout")]
    HandshakeTimeout,

    #[error("usi protocol error: {0}")]
    ProtocolError(String),

    #[error("engine process exited")]
    EngineExited,

    #[error("engine did not acknowledge stop")]
    StopTimeout,

    #[error("no engine configured with id '{0}'")]
    UnknownEngine(String),

    #[error("engine is not ready for this operation")]
    NotReady,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Short tag carried in `analysis:stopped{reason}` payloads.
    pub fn reason_tag(&self) -> &'static str {
        match self {
            EngineError::SpawnFailed(_) => "spawn_failed",
            EngineError::HandshakeTimeout => "handshake_timeout",
            EngineError::ProtocolError(_) => "protocol_error",
            EngineError::EngineExited => "exited",
            EngineError::StopTimeout => "stop_timeout",
            EngineError::UnknownEngine(_) => "unknown_engine",
            EngineError::NotReady => "not_ready",
            EngineError::Io(_) => "io_error",
        }
    }
}

// =============================================================================
// Supervisor state machine
// =============================================================================

/// Supervisor lifecycle states.
///
/// `Idle -> Handshaking -> Ready -> Configured <-> Searching`; any state may
/// drop to `Failed` on crash/exit, and `reset()` returns `Failed` to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Handshaking,
    Ready,
    Configured,
    Searching,
    Failed,
}

// =============================================================================
// Settings and status
// =============================================================================

/// Engine configuration applied via `setoption` during `configure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub engine_id: String,
    pub threads: u32,
    pub hash_mb: u32,
    pub multipv: u8,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            engine_id: "default".to_string(),
            threads: 2,
            hash_mb: 256,
            multipv: 1,
        }
    }
}

/// What the engine declared during the `usi` handshake.
#[derive(Debug, Clone, Default)]
pub struct EngineIdentity {
    pub name: String,
    pub option_names: Vec<String>,
}

impl EngineIdentity {
    pub fn declares_option(&self, name: &str) -> bool {
        self.option_names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }

    /// Option-name normalization: engines advertise either `USI_Hash` or
    /// plain `Hash` for the transposition table size.
    pub fn hash_option_name(&self) -> &'static str {
        if self.declares_option("USI_Hash") {
            "USI_Hash"
        } else {
            "Hash"
        }
    }
}

/// Shared snapshot of the supervisor for `/healthz` and `session:granted`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub state: Option<SupervisorState>,
    pub engine_id: Option<String>,
    pub name: Option<String>,
}

impl EngineStatus {
    /// Reachability flag for `/healthz`: the supervisor either has a live
    /// configured process or has not failed trying.
    pub fn is_reachable(&self) -> bool {
        !matches!(self.state, Some(SupervisorState::Failed))
    }
}

/// Clonable cell holding the latest [`EngineStatus`], written by the
/// coordinator and read by the HTTP surface and the synchronizer.
#[derive(Debug, Clone, Default)]
pub struct StatusCell(std::sync::Arc<std::sync::RwLock<EngineStatus>>);

impl StatusCell {
    pub fn new() -> StatusCell {
        StatusCell::default()
    }

    pub fn set(&self, status: EngineStatus) {
        if let Ok(mut slot) = self.0.write() {
            *slot = status;
        }
    }

    pub fn snapshot(&self) -> EngineStatus {
        self.0
            .read()
            .map(|status| status.clone())
            .unwrap_or_default()
    }
}

// =============================================================================
// Analysis results
// =============================================================================

/// Score classification for one principal variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreType {
    Cp,
    Mate,
    Unknown,
}

/// One consolidated principal variation. Mate scores are signed from the
/// side to move at the analyzed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvLine {
    pub pv_index: u8,
    pub score_type: ScoreType,
    pub score_value: i32,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seldepth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nps: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashfull: Option<u32>,
    pub pv_usi: Vec<String>,
}

impl PvLine {
    pub fn empty(pv_index: u8) -> PvLine {
        PvLine {
            pv_index,
            score_type: ScoreType::Unknown,
            score_value: 0,
            depth: 0,
            seldepth: None,
            nodes: None,
            nps: None,
            hashfull: None,
            pv_usi: Vec::new(),
        }
    }
}

/// Append-only persisted analysis result for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSnapshot {
    pub id: String,
    pub node_id: String,
    pub elapsed_ms: u64,
    pub multipv: u8,
    pub lines: Vec<PvLine>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Engine output stream
// =============================================================================

/// Parsed fields of one `info` line. Absent fields leave the consolidated
/// line untouched; in particular a line without `pv` never clears a stored
/// variation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoLine {
    pub multipv: Option<u8>,
    pub depth: Option<u32>,
    pub seldepth: Option<u32>,
    pub nodes: Option<u64>,
    pub nps: Option<u64>,
    pub hashfull: Option<u32>,
    pub score: Option<(ScoreType, i32)>,
    pub pv: Option<Vec<String>>,
}

/// Event forwarded from the stdout reader task to the coordinator, tagged
/// with the search generation active when the line was read.
#[derive(Debug)]
pub struct EngineOutput {
    pub generation: u64,
    pub kind: OutputKind,
}

#[derive(Debug)]
pub enum OutputKind {
    Info(InfoLine),
    BestMove(String),
    ReadyOk,
    Exited,
}
