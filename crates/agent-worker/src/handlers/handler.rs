// Handler trait and the registry mapping instruction kinds to handlers.

use agent_common::{AgentError, Command, Environment, InstructionKind};
use agent_sdk::LaunchOptions;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::collaborators::CollaboratorCall;
use crate::log_streamer::LogStreamer;
use crate::run_context::RunServices;

/// Everything a handler needs to execute one step.
pub struct StepContext<'a> {
    pub command: &'a Command,
    /// The step's effective execution scope.
    pub cancel: CancellationToken,
    pub log: Arc<LogStreamer>,
    pub environment: &'a Environment,
    pub services: &'a RunServices,
    /// Ad-hoc environment file exposed to the step as `CIRRUS_ENV`.
    pub env_file: &'a Path,
}

impl StepContext<'_> {
    pub async fn log_line(&self, message: &str) {
        self.log.write_line(message).await;
    }

    pub fn collaborator_call(&self) -> CollaboratorCall<'_> {
        CollaboratorCall {
            cancel: self.cancel.clone(),
            sink: self.log.clone(),
            command_name: &self.command.name,
            environment: self.environment,
        }
    }

    /// Launch settings for a script step: the expanded task environment plus
    /// the ad-hoc environment file.
    pub fn launch_options(&self) -> LaunchOptions {
        let mut environment = self.environment.expanded();
        environment.insert(
            agent_common::constants::variables::ENV_FILE.to_string(),
            self.env_file.to_string_lossy().to_string(),
        );
        LaunchOptions {
            working_directory: Some(self.services.working_directory(self.environment)),
            environment,
            kill_orphans: self.services.kill_orphans(self.environment),
            script_directory: self.services.script_directory.clone(),
        }
    }
}

/// Result of one executed step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub success: bool,
    /// Killed by a signal that was not the agent's own timeout.
    pub signaled_to_exit: bool,
    /// The step left a background command running; its logs stay open.
    pub detached: bool,
}

impl StepOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }

    pub fn from_success(success: bool) -> Self {
        Self {
            success,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Execute the step. Only [`AgentError::ExitRequested`] is meant to stop
    /// the run; any other error fails the step.
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, AgentError>;
}

/// Lookup table from instruction kind to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<InstructionKind, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a handler for every instruction kind.
    pub fn with_defaults() -> Self {
        use super::delegated_handler::{
            ArtifactsHandler, CacheHandler, CloneHandler, TerminalHandler, UploadCacheHandler,
        };
        use super::exit_handler::ExitHandler;
        use super::file_handler::FileHandler;
        use super::script_handler::ScriptHandler;

        let mut registry = Self::new();
        registry.register(InstructionKind::Script, Arc::new(ScriptHandler::foreground()));
        registry.register(
            InstructionKind::BackgroundScript,
            Arc::new(ScriptHandler::background()),
        );
        registry.register(InstructionKind::Clone, Arc::new(CloneHandler));
        registry.register(InstructionKind::Cache, Arc::new(CacheHandler));
        registry.register(InstructionKind::UploadCache, Arc::new(UploadCacheHandler));
        registry.register(InstructionKind::Artifacts, Arc::new(ArtifactsHandler));
        registry.register(InstructionKind::File, Arc::new(FileHandler));
        registry.register(InstructionKind::WaitForTerminal, Arc::new(TerminalHandler));
        registry.register(InstructionKind::Exit, Arc::new(ExitHandler));
        registry
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: InstructionKind, handler: Arc<dyn Handler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: InstructionKind) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&kind).cloned()
    }
}
