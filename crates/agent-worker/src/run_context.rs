// Services and settings shared by every step of one run.

use agent_common::constants::variables;
use agent_common::{ControlPlane, Environment};
use agent_sdk::{ProcessGroupStrategy, ProcessLauncher, ShellScriptBuilder, TraceWriter};
use std::path::PathBuf;
use std::sync::Arc;

use crate::background::BackgroundRegistry;
use crate::collaborators::{CacheRegistry, Collaborators};
use crate::log_streamer::LogStreamerOptions;

pub struct RunServices {
    pub control_plane: Arc<dyn ControlPlane>,
    pub collaborators: Collaborators,
    pub caches: CacheRegistry,
    pub background: BackgroundRegistry,
    pub trace: Arc<dyn TraceWriter>,
    pub group: Arc<dyn ProcessGroupStrategy>,
    /// Default working directory when `CIRRUS_WORKING_DIR` is unset.
    pub working_directory: PathBuf,
    pub script_directory: PathBuf,
    /// Where ad-hoc environment files are created.
    pub env_file_directory: PathBuf,
    /// Agent-level switch; the task can still opt out via the escape hatch.
    pub kill_orphans: bool,
    /// Agent-level interpreter; `CIRRUS_SHELL` wins over it.
    pub shell_override: Option<String>,
    /// Agent-level timestamp switch; `CIRRUS_LOG_TIMESTAMP` can enable it.
    pub log_options: LogStreamerOptions,
}

impl RunServices {
    /// A launcher honouring the task's interpreter override.
    pub fn launcher(&self, environment: &Environment) -> ProcessLauncher {
        let shell = environment
            .get(variables::SHELL)
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.shell_override.clone());
        ProcessLauncher::new(
            Arc::clone(&self.trace),
            Arc::clone(&self.group),
            ShellScriptBuilder::for_current_platform().with_shell_override(shell),
        )
    }

    pub fn kill_orphans(&self, environment: &Environment) -> bool {
        self.kill_orphans && !environment.is_enabled(variables::ESCAPE_HATCH_NO_KILL)
    }

    pub fn working_directory(&self, environment: &Environment) -> PathBuf {
        environment
            .get(variables::WORKING_DIR)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.working_directory.clone())
    }

    pub fn log_options(&self, environment: &Environment) -> LogStreamerOptions {
        let mut options = self.log_options.clone();
        options.timestamps |= environment.is_enabled(variables::LOG_TIMESTAMP);
        options
    }
}
