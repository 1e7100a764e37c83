// Detached background commands, reconciled only at the end of the run.

use agent_sdk::{LaunchedProcess, TraceWriter};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::log_streamer::LogStreamer;

/// A background command's running process and its log streamer.
pub struct CommandAndLogs {
    pub name: String,
    pub process: LaunchedProcess,
    pub logs: Arc<LogStreamer>,
}

#[derive(Default)]
pub struct BackgroundRegistry {
    commands: Mutex<Vec<CommandAndLogs>>,
}

impl BackgroundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, command: CommandAndLogs) {
        self.commands.lock().push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill every registered process tree, one at a time, and finalize its
    /// logs. The registry is empty afterwards.
    pub async fn kill_all(&self, trace: &dyn TraceWriter) {
        let commands = std::mem::take(&mut *self.commands.lock());
        for command in commands {
            trace.info(&format!(
                "Cleaning up background command {} (pid {})...",
                command.name,
                command.process.pid()
            ));
            command.process.kill().await;
            command.logs.finalize().await;
        }
    }
}
