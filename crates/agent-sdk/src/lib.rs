// agent-sdk: Foundation layer for the CI agent.
// This crate has ZERO dependencies on other agent crates and provides the
// process, cancellation and tracing primitives the worker is built from.

pub mod cancel_util;
pub mod output_piper;
pub mod process_group;
pub mod process_launcher;
pub mod process_table;
pub mod shell_script;
pub mod string_util;
pub mod trace;

// Re-export commonly used items at crate root
pub use cancel_util::{all_cancelled, CancellationCause, DeadlineScope};
pub use output_piper::{OutputPiper, OutputSink};
pub use process_group::{ProcessGroupStrategy, PosixProcessGroup, WindowsProcessTree};
pub use process_launcher::{LaunchOptions, LaunchedProcess, ProcessError, ProcessLauncher, TIMEOUT_MARKER};
pub use shell_script::{Interpreter, ScriptPlatform, ShellScriptBuilder, DIRECT_SHELL};
pub use string_util::StringUtil;
pub use trace::{CollectingTraceWriter, NullTraceWriter, TraceLevel, TraceWriter};
