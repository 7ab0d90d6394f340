// =============================================================================
// USI Engine Module
// =============================================================================
//
// Everything that touches the engine child process lives here:
//
// - **types**: shared type definitions, constants, and error types
// - **process**: child process lifecycle and stdin protocol writes
// - **communication**: USI line parsing and PV consolidation
// - **supervisor**: state machine, configure/analyze/cancel, reader task
//
// The analysis coordinator (`crate::analysis`) drives the supervisor and
// applies the emission cadence; nothing outside this module parses engine
// output.

mod communication;
mod process;
mod supervisor;
mod types;

pub use communication::{parse_engine_line, EngineLine, PvCollector};
pub use process::EngineProcess;
pub use supervisor::{ConfigureOutcome, EngineSupervisor};
pub use types::{
    AnalysisSnapshot, EngineError, EngineIdentity, EngineOutput, EngineResult, EngineSettings,
    EngineStatus, InfoLine, OutputKind, PvLine, ScoreType, StatusCell, SupervisorState,
    HANDSHAKE_TIMEOUT, QUIT_GRACE, STDERR_RING_CAPACITY, STOP_BESTMOVE_TIMEOUT,
};
