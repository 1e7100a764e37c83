// ScriptHandler: runs script and background-script instructions through the
// process launcher.

use agent_common::constants::variables;
use agent_common::{AgentError, Instruction};
use agent_sdk::ProcessError;
use async_trait::async_trait;
use std::sync::Arc;

use crate::background::CommandAndLogs;
use crate::handlers::handler::{Handler, StepContext, StepOutcome};

pub struct ScriptHandler {
    background: bool,
}

impl ScriptHandler {
    pub fn foreground() -> Self {
        Self { background: false }
    }

    /// Starts the script, registers it for cleanup at the end of the run and
    /// succeeds without waiting for it.
    pub fn background() -> Self {
        Self { background: true }
    }
}

#[async_trait]
impl Handler for ScriptHandler {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, AgentError> {
        let scripts = match &ctx.command.instruction {
            Instruction::Script(s) | Instruction::BackgroundScript(s) => &s.scripts,
            other => {
                return Err(AgentError::NonRetryable(format!(
                    "script handler cannot run {:?} instructions",
                    other.kind()
                )))
            }
        };

        let mut options = ctx.launch_options();
        // The env file is consumed as soon as the step returns.
        if self.background {
            options.environment.remove(variables::ENV_FILE);
        }

        let launcher = ctx.services.launcher(ctx.environment);
        let process = match launcher.launch(scripts, &options, ctx.log.clone()) {
            Ok(process) => process,
            Err(e) => {
                ctx.log_line(&format!("Failed to start command: {e}")).await;
                return Ok(StepOutcome::failed());
            }
        };

        if self.background {
            ctx.log_line(&format!(
                "Started background command {} (pid {}).",
                ctx.command.name,
                process.pid()
            ))
            .await;
            ctx.services.background.register(CommandAndLogs {
                name: ctx.command.name.clone(),
                process,
                logs: Arc::clone(&ctx.log),
            });
            return Ok(StepOutcome {
                success: true,
                signaled_to_exit: false,
                detached: true,
            });
        }

        let outcome = match process.wait(ctx.cancel.clone()).await {
            Ok(()) => StepOutcome::succeeded(),
            // The launcher already wrote the timeout marker.
            Err(ProcessError::Timeout) => StepOutcome::failed(),
            Err(e @ ProcessError::Signaled(_)) => {
                ctx.log_line(&format!("\n{e}")).await;
                StepOutcome {
                    signaled_to_exit: true,
                    ..StepOutcome::failed()
                }
            }
            Err(ProcessError::ExitCode(code)) => {
                ctx.log_line(&format!("\nExit status: {code}")).await;
                StepOutcome::failed()
            }
            Err(e) => {
                ctx.log_line(&format!("\nFailed to wait for command: {e}")).await;
                StepOutcome::failed()
            }
        };
        Ok(outcome)
    }
}
