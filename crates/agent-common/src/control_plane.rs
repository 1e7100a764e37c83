// Control-plane data model and the RPC seam the worker talks through.
//
// Only the shapes the worker needs are modelled. The JSON field names are
// the ones the HTTP transport puts on the wire.

use crate::errors::{AgentError, LogStreamError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Whether a command runs given the outcome of the previous ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionBehavior {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
    OnTimeout,
}

impl ExecutionBehavior {
    /// Run-policy table.
    pub fn should_run(self, failed_at_least_once: bool, timed_out: bool) -> bool {
        match self {
            ExecutionBehavior::OnSuccess => !failed_at_least_once,
            ExecutionBehavior::OnFailure => failed_at_least_once,
            ExecutionBehavior::Always => true,
            ExecutionBehavior::OnTimeout => timed_out,
        }
    }

    /// Behaviours that may keep running inside the grace window.
    pub fn uses_grace_window(self) -> bool {
        matches!(self, ExecutionBehavior::Always | ExecutionBehavior::OnTimeout)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptInstruction {
    pub scripts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneInstruction {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheInstruction {
    pub folders: Vec<String>,
    pub fingerprint_scripts: Vec<String>,
    pub fingerprint_key: Option<String>,
    pub populate_scripts: Vec<String>,
    pub reupload_on_changes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadCacheInstruction {
    pub cache_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsInstruction {
    pub paths: Vec<String>,
    pub format: String,
    #[serde(rename = "type")]
    pub artifact_type: String,
}

/// Where a file instruction takes its content from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    FromEnvironmentVariable(String),
    Content(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInstruction {
    pub destination_path: String,
    pub source: FileSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitForTerminalInstruction {
    pub terminal_server_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitInstruction {}

/// The instruction a command carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instruction {
    Script(ScriptInstruction),
    BackgroundScript(ScriptInstruction),
    Clone(CloneInstruction),
    Cache(CacheInstruction),
    UploadCache(UploadCacheInstruction),
    Artifacts(ArtifactsInstruction),
    File(FileInstruction),
    WaitForTerminal(WaitForTerminalInstruction),
    Exit(ExitInstruction),
}

/// Key used to look up the handler for an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    Script,
    BackgroundScript,
    Clone,
    Cache,
    UploadCache,
    Artifacts,
    File,
    WaitForTerminal,
    Exit,
}

impl Instruction {
    pub fn kind(&self) -> InstructionKind {
        match self {
            Instruction::Script(_) => InstructionKind::Script,
            Instruction::BackgroundScript(_) => InstructionKind::BackgroundScript,
            Instruction::Clone(_) => InstructionKind::Clone,
            Instruction::Cache(_) => InstructionKind::Cache,
            Instruction::UploadCache(_) => InstructionKind::UploadCache,
            Instruction::Artifacts(_) => InstructionKind::Artifacts,
            Instruction::File(_) => InstructionKind::File,
            Instruction::WaitForTerminal(_) => InstructionKind::WaitForTerminal,
            Instruction::Exit(_) => InstructionKind::Exit,
        }
    }
}

/// One named unit of work. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub instruction: Instruction,
    #[serde(default)]
    pub execution_behaviour: ExecutionBehavior,
}

/// Response of `FetchPlan`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Plan {
    pub commands: Vec<Command>,
    pub timeout_in_seconds: u64,
    pub environment: HashMap<String, String>,
    pub secrets_to_mask: Vec<String>,
    pub server_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Executing,
    Skipped,
    Completed,
    Failed,
}

/// One status transition of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub name: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub signaled_to_exit: bool,
    pub timestamp: i64,
}

impl StatusUpdate {
    pub fn new(name: impl Into<String>, status: CommandStatus) -> Self {
        Self {
            name: name.into(),
            status,
            duration_ms: 0,
            signaled_to_exit: false,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Outcome of one cache lookup, reported in the final report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheRetrievalAttempt {
    pub hit: bool,
    pub size_bytes: u64,
    pub downloaded_in_ms: u64,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub seconds_from_start: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceUtilization {
    pub cpu_chart: Vec<ChartPoint>,
    pub memory_chart: Vec<ChartPoint>,
    /// Logical CPUs available to the task.
    pub cpu_total: f64,
    /// Bytes of memory available to the task.
    pub memory_total: u64,
}

/// Payload of `ReportFinal`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalReport {
    pub history: Vec<StatusUpdate>,
    pub cache_retrieval_attempts: HashMap<String, CacheRetrievalAttempt>,
    pub resource_utilization: Option<ResourceUtilization>,
}

/// A live, chunked log stream for one command.
///
/// Held across awaits inside spawned tasks, so it must be `Sync` as well.
#[async_trait]
pub trait LogStream: Send + Sync {
    async fn send(&mut self, chunk: &[u8]) -> Result<(), LogStreamError>;

    async fn close(&mut self) -> Result<(), LogStreamError>;
}

/// The control-plane RPC surface.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn fetch_plan(&self) -> Result<Plan, AgentError>;

    async fn flush_statuses(&self, updates: &[StatusUpdate]) -> Result<(), AgentError>;

    /// Open a stream keyed by `command_name`. Opening again re-sends the key.
    async fn open_log_stream(&self, command_name: &str) -> Result<Box<dyn LogStream>, AgentError>;

    async fn save_full_log(&self, command_name: &str, content: Vec<u8>) -> Result<(), AgentError>;

    async fn report_final(&self, report: &FinalReport) -> Result<(), AgentError>;

    async fn report_warning(&self, message: &str) -> Result<(), AgentError>;

    async fn report_error(&self, message: &str) -> Result<(), AgentError>;

    async fn heartbeat(&self) -> Result<(), AgentError>;
}
