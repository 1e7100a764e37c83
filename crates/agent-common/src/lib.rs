// agent-common: shared services and infrastructure for the CI agent.
// Depends on `agent-sdk`.

pub mod config;
pub mod constants;
pub mod control_plane;
pub mod environment;
pub mod error_throttler;
pub mod errors;
pub mod host_context;
pub mod http_control_plane;
pub mod secret_masker;
pub mod tracing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use config::AgentSettings;
pub use constants::WellKnownDirectory;
pub use control_plane::{
    ArtifactsInstruction, CacheInstruction, CacheRetrievalAttempt, ChartPoint, Command,
    CommandStatus, ControlPlane, ExecutionBehavior, FileInstruction, FileSource, FinalReport,
    Instruction, InstructionKind, LogStream, Plan, ResourceUtilization, ScriptInstruction,
    StatusUpdate, UploadCacheInstruction, WaitForTerminalInstruction,
};
pub use environment::{is_boxed_value, stage_custom_environment, Environment};
pub use error_throttler::{retry, Attempts, ErrorThrottler};
pub use errors::{AgentError, LogStreamError};
pub use host_context::{HostContext, ShutdownReason};
pub use http_control_plane::HttpControlPlane;
pub use secret_masker::SecretMasker;
pub use tracing::{TraceEventType, TraceManager, TraceSetting, Tracing};
