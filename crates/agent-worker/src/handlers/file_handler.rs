// FileHandler: materializes an environment variable (or literal content) as a
// file, relative paths resolving against the working directory.

use agent_common::{AgentError, FileSource, Instruction};
use agent_sdk::StringUtil;
use async_trait::async_trait;
use std::path::PathBuf;

use crate::handlers::handler::{Handler, StepContext, StepOutcome};

pub struct FileHandler;

#[async_trait]
impl Handler for FileHandler {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, AgentError> {
        let Instruction::File(instruction) = &ctx.command.instruction else {
            return Err(AgentError::NonRetryable(format!(
                "file handler cannot run {:?} instructions",
                ctx.command.instruction.kind()
            )));
        };

        let content = match &instruction.source {
            FileSource::FromEnvironmentVariable(name) => match ctx.environment.get(name) {
                Some(value) => value,
                None => {
                    ctx.log_line(&format!("Environment variable {name} is not set!"))
                        .await;
                    return Ok(StepOutcome::failed());
                }
            },
            FileSource::Content(content) => content.clone(),
        };

        let expanded = ctx.environment.expanded();
        let destination = PathBuf::from(StringUtil::expand_text_fully(
            &instruction.destination_path,
            &expanded,
        ));
        let destination = if destination.is_absolute() {
            destination
        } else {
            ctx.services
                .working_directory(ctx.environment)
                .join(destination)
        };

        if let Some(parent) = destination.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                ctx.log_line(&format!("Failed to create {}: {e}", parent.display()))
                    .await;
                return Ok(StepOutcome::failed());
            }
        }
        if let Err(e) = tokio::fs::write(&destination, content.as_bytes()).await {
            ctx.log_line(&format!("Failed to write {}: {e}", destination.display()))
                .await;
            return Ok(StepOutcome::failed());
        }

        ctx.log_line(&format!("Created file {}!", destination.display()))
            .await;
        Ok(StepOutcome::succeeded())
    }
}
