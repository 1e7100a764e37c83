use agent_common::AgentError;
use async_trait::async_trait;

use crate::handlers::handler::{Handler, StepContext, StepOutcome};

/// Ends the run immediately; nothing more is reported for the step.
pub struct ExitHandler;

#[async_trait]
impl Handler for ExitHandler {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, AgentError> {
        ctx.services
            .trace
            .info(&format!("Command {} requested the agent to exit.", ctx.command.name));
        Err(AgentError::ExitRequested)
    }
}
