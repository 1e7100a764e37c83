// HostContext: the agent's process-wide context.
//
// Owns the settings, the run's secret masker, trace sources, well-known
// directories and the shutdown token every run-wide scope derives from.

use crate::config::AgentSettings;
use crate::constants::{self, WellKnownDirectory};
use crate::secret_masker::SecretMasker;
use crate::tracing::{TraceManager, Tracing};

use agent_sdk::TraceWriter;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The reason the agent is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    UserCancelled,
    OperatingSystemShutdown,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::UserCancelled => write!(f, "UserCancelled"),
            ShutdownReason::OperatingSystemShutdown => write!(f, "OperatingSystemShutdown"),
        }
    }
}

pub struct HostContext {
    settings: AgentSettings,
    secret_masker: SecretMasker,
    trace_manager: TraceManager,
    shutdown_token: CancellationToken,
    shutdown_reason: Mutex<Option<ShutdownReason>>,
}

impl HostContext {
    pub fn new(settings: AgentSettings) -> Arc<Self> {
        let secret_masker = SecretMasker::new();
        secret_masker.add_value(&settings.client_token);
        secret_masker.add_value(&settings.server_token);

        Arc::new(Self {
            trace_manager: TraceManager::new(secret_masker.clone()),
            secret_masker,
            settings,
            shutdown_token: CancellationToken::new(),
            shutdown_reason: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn secret_masker(&self) -> &SecretMasker {
        &self.secret_masker
    }

    /// Get a trace source for the given component name.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    /// Resolve the path for a well-known directory.
    pub fn get_directory(&self, directory: WellKnownDirectory) -> PathBuf {
        match directory {
            WellKnownDirectory::Temp => self.settings.temp_directory(),
            WellKnownDirectory::Scripts => self
                .get_directory(WellKnownDirectory::Temp)
                .join(constants::path::SCRIPTS_DIRECTORY),
            WellKnownDirectory::Logs => self
                .get_directory(WellKnownDirectory::Temp)
                .join(constants::path::LOGS_DIRECTORY),
            WellKnownDirectory::Work => match &self.settings.pre_created_working_dir {
                Some(dir) => dir.clone(),
                None => self
                    .get_directory(WellKnownDirectory::Temp)
                    .join(constants::path::WORK_DIRECTORY),
            },
        }
    }

    /// Create every directory the agent writes into.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for directory in [
            WellKnownDirectory::Temp,
            WellKnownDirectory::Scripts,
            WellKnownDirectory::Logs,
        ] {
            std::fs::create_dir_all(self.get_directory(directory))?;
        }
        Ok(())
    }

    /// The token cancelled on agent shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        *self.shutdown_reason.lock()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        self.get_trace("HostContext")
            .info(&format!("Agent will be shutdown for {reason}"));
        *self.shutdown_reason.lock() = Some(reason);
        self.shutdown_token.cancel();
    }
}
