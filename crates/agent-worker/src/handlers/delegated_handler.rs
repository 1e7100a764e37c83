// Handlers that delegate to an external collaborator and only interpret its
// boolean outcome.

use agent_common::{AgentError, Instruction};
use async_trait::async_trait;

use crate::handlers::handler::{Handler, StepContext, StepOutcome};

fn mismatch(handler: &str, instruction: &Instruction) -> AgentError {
    AgentError::NonRetryable(format!(
        "{handler} handler cannot run {:?} instructions",
        instruction.kind()
    ))
}

pub struct CacheHandler;

#[async_trait]
impl Handler for CacheHandler {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, AgentError> {
        let Instruction::Cache(instruction) = &ctx.command.instruction else {
            return Err(mismatch("cache", &ctx.command.instruction));
        };
        let services = ctx.services;
        let success = services
            .collaborators
            .cache
            .populate(&ctx.collaborator_call(), instruction, &services.caches)
            .await;
        Ok(StepOutcome::from_success(success))
    }
}

pub struct UploadCacheHandler;

#[async_trait]
impl Handler for UploadCacheHandler {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, AgentError> {
        let Instruction::UploadCache(instruction) = &ctx.command.instruction else {
            return Err(mismatch("upload cache", &ctx.command.instruction));
        };
        let services = ctx.services;
        let success = services
            .collaborators
            .cache
            .upload(&ctx.collaborator_call(), instruction, &services.caches)
            .await;
        Ok(StepOutcome::from_success(success))
    }
}

pub struct ArtifactsHandler;

#[async_trait]
impl Handler for ArtifactsHandler {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, AgentError> {
        let Instruction::Artifacts(instruction) = &ctx.command.instruction else {
            return Err(mismatch("artifacts", &ctx.command.instruction));
        };
        let success = ctx
            .services
            .collaborators
            .artifacts
            .upload(&ctx.collaborator_call(), instruction)
            .await;
        Ok(StepOutcome::from_success(success))
    }
}

pub struct CloneHandler;

#[async_trait]
impl Handler for CloneHandler {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, AgentError> {
        if !matches!(ctx.command.instruction, Instruction::Clone(_)) {
            return Err(mismatch("clone", &ctx.command.instruction));
        }
        let success = ctx
            .services
            .collaborators
            .cloner
            .clone_repository(&ctx.collaborator_call())
            .await;
        Ok(StepOutcome::from_success(success))
    }
}

pub struct TerminalHandler;

#[async_trait]
impl Handler for TerminalHandler {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, AgentError> {
        let Instruction::WaitForTerminal(instruction) = &ctx.command.instruction else {
            return Err(mismatch("terminal", &ctx.command.instruction));
        };
        let success = ctx
            .services
            .collaborators
            .terminal
            .wait(&ctx.collaborator_call(), instruction)
            .await;
        Ok(StepOutcome::from_success(success))
    }
}
