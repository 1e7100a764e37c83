// Worker: orchestrates one task run.
//
// Fetches the plan, stages the environment, runs the command loop, cleans up
// background commands and delivers the final report.

use agent_common::constants::{FINAL_REPORT_ATTEMPTS, RESOURCE_MONITOR_WAIT};
use agent_common::{
    retry, AgentError, Attempts, ControlPlane, FinalReport, HostContext, WellKnownDirectory,
};
use agent_sdk::cancel_util::sleep_or_cancelled;
use agent_sdk::{process_group, ProcessGroupStrategy, TraceWriter};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::background::BackgroundRegistry;
use crate::collaborators::{CacheRegistry, Collaborators};
use crate::environment_stager;
use crate::handlers::HandlerRegistry;
use crate::log_streamer::LogStreamerOptions;
use crate::run_context::RunServices;
use crate::steps_runner::{bounded_range, StepsRunner};

/// Used when the plan carries no timeout.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The command loop finished and a final report was attempted.
    Reported { failed: bool },
    /// An exit instruction stopped the run; nothing more was reported.
    ExitRequested,
    /// The run never started its commands.
    Aborted(String),
}

pub struct Worker {
    host_context: Arc<HostContext>,
    control_plane: Arc<dyn ControlPlane>,
    collaborators: Collaborators,
    handlers: HandlerRegistry,
    group: Arc<dyn ProcessGroupStrategy>,
}

impl Worker {
    pub fn new(host_context: Arc<HostContext>, control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            host_context,
            control_plane,
            collaborators: Collaborators::default(),
            handlers: HandlerRegistry::with_defaults(),
            group: process_group::platform_default(),
        }
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// [`Worker::run_async`], reporting unexpected failures to the control
    /// plane as agent errors.
    pub async fn run(&self) -> RunOutcome {
        match self.run_async().await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = format!("Agent failed with error: {e:#}");
                let trace = self.host_context.get_trace("Worker");
                trace.error(&message);
                if let Err(e) = self.control_plane.report_error(&message).await {
                    trace.error(&format!("Failed to report error: {e}"));
                }
                RunOutcome::Aborted(message)
            }
        }
    }

    pub async fn run_async(&self) -> Result<RunOutcome> {
        let trace = Arc::new(self.host_context.get_trace("Worker"));
        let settings = self.host_context.settings();
        let run_token = self.host_context.shutdown_token();

        self.host_context
            .ensure_directories()
            .context("Failed to create agent directories")?;

        trace.info(&format!("Fetching the plan of task {}...", settings.task_id));
        let control_plane = &self.control_plane;
        let plan = match retry("FetchPlan", Attempts::UntilCancelled, &run_token, move || {
            control_plane.fetch_plan()
        })
        .await
        {
            Ok(plan) => plan,
            Err(e) => {
                let message = format!("Failed to fetch the plan: {e}");
                trace.error(&message);
                return Ok(RunOutcome::Aborted(message));
            }
        };

        let masker = self.host_context.secret_masker().clone();
        masker.add_values(&plan.secrets_to_mask);
        masker.add_value(&plan.server_token);

        let run_end = run_token.child_token();
        let heartbeat = tokio::spawn(send_heartbeats(
            Arc::clone(&self.control_plane),
            settings.heartbeat_interval(),
            run_end.clone(),
            trace.clone(),
        ));
        let monitor = self.collaborators.resources.start(run_end.clone());

        let working_directory = self.host_context.get_directory(WellKnownDirectory::Work);
        if let Err(e) = std::fs::create_dir_all(&working_directory) {
            trace.warning(&format!(
                "Failed to create working directory {}: {e}",
                working_directory.display()
            ));
        }

        let process_environment: HashMap<String, String> = std::env::vars().collect();
        let environment = environment_stager::stage(
            &plan.environment,
            &process_environment,
            &working_directory,
            &settings.task_id,
            masker,
        );

        if let Err(e) = environment_stager::resolve_boxed_secrets(
            &environment,
            self.collaborators.secrets.as_ref(),
        )
        .await
        {
            let message = format!("Failed to unbox sensitive environment variables: {e}");
            trace.error(&message);
            if let Err(e) = self.control_plane.report_error(&message).await {
                trace.error(&format!("Failed to report error: {e}"));
            }
            run_end.cancel();
            let _ = heartbeat.await;
            return Ok(RunOutcome::Aborted(message));
        }

        let services = RunServices {
            control_plane: Arc::clone(&self.control_plane),
            collaborators: self.collaborators.clone(),
            caches: CacheRegistry::new(),
            background: BackgroundRegistry::new(),
            trace: trace.clone(),
            group: Arc::clone(&self.group),
            working_directory,
            script_directory: self.host_context.get_directory(WellKnownDirectory::Scripts),
            env_file_directory: self.host_context.get_directory(WellKnownDirectory::Temp),
            kill_orphans: settings.kill_orphans,
            shell_override: settings.shell_override.clone(),
            log_options: LogStreamerOptions::new(
                self.host_context.get_directory(WellKnownDirectory::Logs),
                settings.log_timestamps,
            ),
        };

        let timeout = match plan.timeout_in_seconds {
            0 => DEFAULT_TASK_TIMEOUT,
            secs => Duration::from_secs(secs),
        };
        let commands = bounded_range(
            &plan.commands,
            settings.command_from.as_deref(),
            settings.command_to.as_deref(),
        );
        trace.info(&format!(
            "Executing {} of {} command(s) with a timeout of {:?}.",
            commands.len(),
            plan.commands.len(),
            timeout
        ));

        let mut runner = StepsRunner::new(
            &services,
            &self.handlers,
            &environment,
            run_token.clone(),
            timeout,
        );
        let result = runner.run(commands).await;

        // Background commands never outlive the run, however it ended.
        services.background.kill_all(trace.as_ref()).await;

        match result {
            Ok(()) => {}
            Err(AgentError::ExitRequested) => {
                trace.info("Exiting as requested by the plan.");
                run_end.cancel();
                let _ = heartbeat.await;
                return Ok(RunOutcome::ExitRequested);
            }
            Err(e) => trace.error(&format!("Command loop failed: {e}")),
        }

        run_end.cancel();
        let _ = heartbeat.await;

        let resource_utilization = match tokio::time::timeout(RESOURCE_MONITOR_WAIT, monitor).await
        {
            Ok(Ok(result)) => {
                for error in &result.errors {
                    trace.warning(&format!("Resource monitor: {error}"));
                }
                result.utilization
            }
            Ok(Err(_)) => {
                trace.warning("Resource monitor stopped without a result.");
                None
            }
            Err(_) => {
                trace.warning("Timed out waiting for resource utilization.");
                None
            }
        };

        let report = FinalReport {
            history: runner.history().to_vec(),
            cache_retrieval_attempts: services.caches.attempts(),
            resource_utilization,
        };
        // The run-wide scope may already be cancelled; the report still goes out.
        let report_ref = &report;
        if let Err(e) = retry(
            "ReportFinal",
            Attempts::Limited(FINAL_REPORT_ATTEMPTS),
            &CancellationToken::new(),
            move || control_plane.report_final(report_ref),
        )
        .await
        {
            trace.error(&format!("Failed to report the final result: {e}"));
        }

        Ok(RunOutcome::Reported {
            failed: runner.failed_at_least_once(),
        })
    }
}

async fn send_heartbeats(
    control_plane: Arc<dyn ControlPlane>,
    interval: Duration,
    stop: CancellationToken,
    trace: Arc<dyn TraceWriter>,
) {
    while sleep_or_cancelled(interval, &stop).await {
        if let Err(e) = control_plane.heartbeat().await {
            trace.warning(&format!("Failed to send heartbeat: {e}"));
        }
    }
}
