// StepsRunner: the command loop of one run.
//
// Commands execute strictly one at a time. Each one is either recorded as
// SKIPPED or reported EXECUTING (flushed immediately), dispatched to its
// handler under the right cancellation scope, and reported COMPLETED or
// FAILED. The ad-hoc environment file is merged between steps.

use agent_common::constants::GRACE_WINDOW;
use agent_common::{AgentError, Command, CommandStatus, Environment, ExecutionBehavior, StatusUpdate};
use agent_sdk::{all_cancelled, DeadlineScope, TraceWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::file_command_manager::AdHocEnvFile;
use crate::handlers::{HandlerRegistry, StepContext, StepOutcome};
use crate::log_streamer::LogStreamer;
use crate::run_context::RunServices;
use crate::update_batcher::UpdateBatcher;

/// Commands from `from` (inclusive) up to `to` (exclusive). A bound that is
/// empty or names no command leaves that side open.
pub fn bounded_range<'a>(commands: &'a [Command], from: Option<&str>, to: Option<&str>) -> &'a [Command] {
    let position = |bound: Option<&str>| {
        bound
            .filter(|name| !name.is_empty())
            .and_then(|name| commands.iter().position(|c| c.name == name))
    };
    let start = position(from).unwrap_or(0);
    let end = position(to).unwrap_or(commands.len()).max(start);
    &commands[start..end]
}

pub struct StepsRunner<'a> {
    services: &'a RunServices,
    handlers: &'a HandlerRegistry,
    environment: &'a Environment,
    batcher: UpdateBatcher,
    run_token: CancellationToken,
    main: DeadlineScope,
    /// Main scope composed with the shared grace scope; created on first use.
    grace: Option<CancellationToken>,
    failed_at_least_once: bool,
}

impl<'a> StepsRunner<'a> {
    /// The main scope starts counting `timeout` now.
    pub fn new(
        services: &'a RunServices,
        handlers: &'a HandlerRegistry,
        environment: &'a Environment,
        run_token: CancellationToken,
        timeout: Duration,
    ) -> Self {
        Self {
            batcher: UpdateBatcher::new(
                Arc::clone(&services.control_plane),
                Arc::clone(&services.trace),
            ),
            main: DeadlineScope::with_timeout(&run_token, timeout),
            services,
            handlers,
            environment,
            run_token,
            grace: None,
            failed_at_least_once: false,
        }
    }

    /// Run `commands` in order. Returns early only with
    /// [`AgentError::ExitRequested`].
    pub async fn run(&mut self, commands: &[Command]) -> Result<(), AgentError> {
        for command in commands {
            let timed_out = self.main.is_deadline_exceeded();
            if !command
                .execution_behaviour
                .should_run(self.failed_at_least_once, timed_out)
            {
                self.services.trace.info(&format!(
                    "Skipping command {} ({:?}, failed: {}, timed out: {}).",
                    command.name, command.execution_behaviour, self.failed_at_least_once, timed_out
                ));
                self.batcher
                    .queue(StatusUpdate::new(&command.name, CommandStatus::Skipped));
                continue;
            }

            self.batcher
                .queue(StatusUpdate::new(&command.name, CommandStatus::Executing));
            self.batcher.flush().await;

            let scope = self.scope_for(command.execution_behaviour);
            let started = Instant::now();
            let outcome = match self.execute_step(command, scope).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.batcher.flush().await;
                    return Err(e);
                }
            };

            if !outcome.success {
                self.failed_at_least_once = true;
            }
            let status = if outcome.success {
                CommandStatus::Completed
            } else {
                CommandStatus::Failed
            };
            let mut update = StatusUpdate::new(&command.name, status);
            update.duration_ms = started.elapsed().as_millis() as u64;
            update.signaled_to_exit = outcome.signaled_to_exit;
            self.batcher.queue(update);
        }

        self.batcher.flush().await;
        Ok(())
    }

    pub fn history(&self) -> &[StatusUpdate] {
        self.batcher.history()
    }

    pub fn failed_at_least_once(&self) -> bool {
        self.failed_at_least_once
    }

    pub fn timed_out(&self) -> bool {
        self.main.is_deadline_exceeded()
    }

    /// The execution scope for a command with `behaviour`.
    ///
    /// ALWAYS and ON_TIMEOUT commands may outlive the main deadline by the
    /// grace window. The grace scope is shared by all of them, so no step
    /// can extend it.
    fn scope_for(&mut self, behaviour: ExecutionBehavior) -> CancellationToken {
        if !behaviour.uses_grace_window() {
            return self.main.token();
        }
        let main = self.main.token();
        let run_token = &self.run_token;
        self.grace
            .get_or_insert_with(|| {
                let grace = DeadlineScope::with_timeout(run_token, GRACE_WINDOW);
                all_cancelled(&[main, grace.token()])
            })
            .clone()
    }

    async fn execute_step(
        &mut self,
        command: &Command,
        cancel: CancellationToken,
    ) -> Result<StepOutcome, AgentError> {
        let services = self.services;
        let log = match LogStreamer::start(
            &command.name,
            Arc::clone(&services.control_plane),
            self.environment.clone(),
            services.log_options(self.environment),
            Arc::clone(&services.trace),
        ) {
            Ok(log) => log,
            Err(e) => {
                self.warn(&format!(
                    "Failed to initialize command {} log streamer: {e}",
                    command.name
                ))
                .await;
                return Ok(StepOutcome::failed());
            }
        };

        let env_file = match AdHocEnvFile::create(&services.env_file_directory) {
            Ok(file) => file,
            Err(e) => {
                let message = format!("Failed to initialize ad-hoc environment file: {e}");
                log.write_line(&message).await;
                log.finalize().await;
                self.warn(&message).await;
                return Ok(StepOutcome::failed());
            }
        };

        let result = match self.handlers.get(command.instruction.kind()) {
            Some(handler) => {
                let ctx = StepContext {
                    command,
                    cancel,
                    log: Arc::clone(&log),
                    environment: self.environment,
                    services,
                    env_file: env_file.path(),
                };
                handler.execute(&ctx).await
            }
            None => {
                log.write_line(&format!(
                    "Unsupported instruction {:?}!",
                    command.instruction.kind()
                ))
                .await;
                Ok(StepOutcome::failed())
            }
        };

        match env_file.consume() {
            Ok(variables) if !variables.is_empty() => {
                services.trace.verbose(&format!(
                    "Command {} exported {} variable(s).",
                    command.name,
                    variables.len()
                ));
                self.environment.merge(&variables);
            }
            Ok(_) => {}
            Err(e) => services
                .trace
                .warning(&format!("Failed to read ad-hoc environment file: {e}")),
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(AgentError::ExitRequested) => {
                log.finalize().await;
                return Err(AgentError::ExitRequested);
            }
            Err(e) => {
                log.write_line(&format!("{e}")).await;
                StepOutcome::failed()
            }
        };

        // Background commands keep their logs open until the end of the run.
        if !outcome.detached {
            log.finalize().await;
        }
        Ok(outcome)
    }

    async fn warn(&self, message: &str) {
        self.services.trace.warning(message);
        if let Err(e) = self.services.control_plane.report_warning(message).await {
            self.services
                .trace
                .warning(&format!("Failed to report warning: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::Handler;
    use crate::test_support::{self, FakeControlPlane};
    use agent_common::{InstructionKind, Instruction, ScriptInstruction};
    use agent_sdk::{CollectingTraceWriter, TraceLevel};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn command(name: &str, behaviour: ExecutionBehavior) -> Command {
        Command {
            name: name.into(),
            instruction: Instruction::Script(ScriptInstruction {
                scripts: vec![name.to_string()],
            }),
            execution_behaviour: behaviour,
        }
    }

    fn names(commands: &[Command]) -> Vec<&str> {
        commands.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn bounded_range_defaults_to_everything() {
        let commands: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|n| command(n, ExecutionBehavior::OnSuccess))
            .collect();
        assert_eq!(names(bounded_range(&commands, None, None)), ["a", "b", "c"]);
        assert_eq!(names(bounded_range(&commands, Some("x"), Some("y"))), ["a", "b", "c"]);
        assert_eq!(names(bounded_range(&commands, Some(""), Some(""))), ["a", "b", "c"]);
    }

    #[test]
    fn bounded_range_is_half_open() {
        let commands: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|n| command(n, ExecutionBehavior::OnSuccess))
            .collect();
        assert_eq!(names(bounded_range(&commands, Some("b"), Some("d"))), ["b", "c"]);
        assert_eq!(names(bounded_range(&commands, Some("c"), None)), ["c", "d"]);
        assert!(bounded_range(&commands, Some("b"), Some("b")).is_empty());
        assert!(bounded_range(&commands, Some("c"), Some("a")).is_empty());
    }

    /// Script handler stand-in: the first script line is a verb.
    ///
    /// `ok` succeeds, `fail` fails, `hang` waits for its scope and fails,
    /// `export` writes `FOO=bar` to the ad-hoc env file.
    #[derive(Default)]
    struct ScriptedHandler {
        waited: Mutex<Vec<(String, Duration)>>,
    }

    #[async_trait]
    impl Handler for ScriptedHandler {
        async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutcome, AgentError> {
            let Instruction::Script(script) = &ctx.command.instruction else {
                return Ok(StepOutcome::failed());
            };
            let verb = script.scripts.first().map(String::as_str).unwrap_or("ok");
            let verb = verb.split(':').next().unwrap_or(verb);
            match verb {
                "fail" => Ok(StepOutcome::failed()),
                "hang" => {
                    let started = Instant::now();
                    ctx.cancel.cancelled().await;
                    self.waited
                        .lock()
                        .push((ctx.command.name.clone(), started.elapsed()));
                    Ok(StepOutcome::failed())
                }
                "export" => {
                    std::fs::write(ctx.env_file, "FOO=bar\n").unwrap();
                    Ok(StepOutcome::succeeded())
                }
                "expect" => Ok(StepOutcome::from_success(
                    ctx.environment.get("FOO").as_deref() == Some("bar"),
                )),
                _ => Ok(StepOutcome::succeeded()),
            }
        }
    }

    fn scripted(name: &str, verb: &str, behaviour: ExecutionBehavior) -> Command {
        Command {
            name: name.into(),
            instruction: Instruction::Script(ScriptInstruction {
                scripts: vec![verb.to_string()],
            }),
            execution_behaviour: behaviour,
        }
    }

    fn statuses(history: &[StatusUpdate]) -> Vec<(String, CommandStatus)> {
        history
            .iter()
            .filter(|u| u.status != CommandStatus::Executing)
            .map(|u| (u.name.clone(), u.status))
            .collect()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        plane: FakeControlPlane,
        services: RunServices,
        handlers: HandlerRegistry,
        handler: Arc<ScriptedHandler>,
        environment: Environment,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let plane = FakeControlPlane::default();
        let services = test_support::services(dir.path(), Arc::new(plane.clone()));
        let handler = Arc::new(ScriptedHandler::default());
        let mut handlers = HandlerRegistry::with_defaults();
        handlers.register(InstructionKind::Script, handler.clone());
        Fixture {
            _dir: dir,
            plane,
            services,
            handlers,
            handler,
            environment: Environment::default(),
        }
    }

    #[tokio::test]
    async fn run_policy_after_failure() {
        let f = fixture();
        let mut runner = StepsRunner::new(
            &f.services,
            &f.handlers,
            &f.environment,
            CancellationToken::new(),
            Duration::from_secs(3600),
        );
        let commands = vec![
            scripted("build", "ok", ExecutionBehavior::OnSuccess),
            scripted("on_failure_early", "ok", ExecutionBehavior::OnFailure),
            scripted("test", "fail", ExecutionBehavior::OnSuccess),
            scripted("deploy", "ok", ExecutionBehavior::OnSuccess),
            scripted("report", "ok", ExecutionBehavior::OnFailure),
            scripted("cleanup", "ok", ExecutionBehavior::Always),
            scripted("timeout_only", "ok", ExecutionBehavior::OnTimeout),
        ];
        runner.run(&commands).await.unwrap();

        use CommandStatus::*;
        let expected = vec![
            ("build".to_string(), Completed),
            ("on_failure_early".to_string(), Skipped),
            ("test".to_string(), Failed),
            ("deploy".to_string(), Skipped),
            ("report".to_string(), Completed),
            ("cleanup".to_string(), Completed),
            ("timeout_only".to_string(), Skipped),
        ];
        assert_eq!(statuses(runner.history()), expected);
        assert!(runner.failed_at_least_once());
        assert!(!runner.timed_out());
    }

    #[tokio::test]
    async fn executing_is_flushed_before_the_step_runs() {
        let f = fixture();
        let mut runner = StepsRunner::new(
            &f.services,
            &f.handlers,
            &f.environment,
            CancellationToken::new(),
            Duration::from_secs(3600),
        );
        runner
            .run(&[scripted("only", "ok", ExecutionBehavior::OnSuccess)])
            .await
            .unwrap();

        let flushes = f.plane.flushes();
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0].len(), 1);
        assert_eq!(flushes[0][0].status, CommandStatus::Executing);
        assert_eq!(flushes[1][0].status, CommandStatus::Completed);
        assert_eq!(f.plane.saved_log("only").as_deref(), Some(""));
    }

    #[tokio::test]
    async fn ad_hoc_variables_reach_later_steps() {
        let f = fixture();
        let mut runner = StepsRunner::new(
            &f.services,
            &f.handlers,
            &f.environment,
            CancellationToken::new(),
            Duration::from_secs(3600),
        );
        runner
            .run(&[
                scripted("export", "export", ExecutionBehavior::OnSuccess),
                scripted("expect", "expect", ExecutionBehavior::OnSuccess),
            ])
            .await
            .unwrap();

        assert_eq!(f.environment.get("FOO").as_deref(), Some("bar"));
        assert!(!runner.failed_at_least_once());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_window_is_shared_after_timeout() {
        let f = fixture();
        let mut runner = StepsRunner::new(
            &f.services,
            &f.handlers,
            &f.environment,
            CancellationToken::new(),
            Duration::from_secs(10),
        );
        runner
            .run(&[
                scripted("main", "hang", ExecutionBehavior::OnSuccess),
                scripted("after", "ok", ExecutionBehavior::OnSuccess),
                scripted("cleanup", "hang:1", ExecutionBehavior::Always),
                scripted("diagnostics", "hang:2", ExecutionBehavior::OnTimeout),
            ])
            .await
            .unwrap();

        assert!(runner.timed_out());
        let waited = f.handler.waited.lock().clone();
        assert_eq!(waited.len(), 3);
        assert_eq!(waited[0].0, "main");
        assert!(waited[0].1 >= Duration::from_secs(10));
        assert_eq!(waited[1].0, "cleanup");
        assert!(waited[1].1 >= GRACE_WINDOW);
        // The window is spent; the next grace-eligible step gets nothing.
        assert_eq!(waited[2].0, "diagnostics");
        assert!(waited[2].1 < Duration::from_secs(1));

        use CommandStatus::*;
        assert_eq!(
            statuses(runner.history()),
            vec![
                ("main".to_string(), Failed),
                ("after".to_string(), Skipped),
                ("cleanup".to_string(), Failed),
                ("diagnostics".to_string(), Failed),
            ]
        );
    }

    #[tokio::test]
    async fn exit_stops_the_loop() {
        let f = fixture();
        let mut runner = StepsRunner::new(
            &f.services,
            &f.handlers,
            &f.environment,
            CancellationToken::new(),
            Duration::from_secs(3600),
        );
        let exit = Command {
            name: "exit".into(),
            instruction: Instruction::Exit(Default::default()),
            execution_behaviour: ExecutionBehavior::OnSuccess,
        };
        let result = runner
            .run(&[exit, scripted("never", "ok", ExecutionBehavior::Always)])
            .await;

        assert!(matches!(result, Err(AgentError::ExitRequested)));
        assert!(runner.history().iter().all(|u| u.name == "exit"));
        assert_eq!(runner.history().len(), 1);
    }

    #[tokio::test]
    async fn log_streamer_failure_fails_step_with_warning() {
        let mut f = fixture();
        let blocker = f._dir.path().join("blocked");
        std::fs::write(&blocker, "not a directory").unwrap();
        f.services.log_options.spool_directory = blocker.join("logs");

        let mut runner = StepsRunner::new(
            &f.services,
            &f.handlers,
            &f.environment,
            CancellationToken::new(),
            Duration::from_secs(3600),
        );
        runner
            .run(&[scripted("build", "ok", ExecutionBehavior::OnSuccess)])
            .await
            .unwrap();

        assert_eq!(
            statuses(runner.history()),
            vec![("build".to_string(), CommandStatus::Failed)]
        );
        assert_eq!(f.plane.warnings().len(), 1);
        assert!(f.plane.warnings()[0].contains("log streamer"));
    }

    #[tokio::test]
    async fn env_file_failure_fails_step_with_warning() {
        let mut f = fixture();
        let blocker = f._dir.path().join("blocked");
        std::fs::write(&blocker, "not a directory").unwrap();
        f.services.env_file_directory = blocker.join("env");
        let trace = Arc::new(CollectingTraceWriter::new());
        f.services.trace = trace.clone();

        let mut runner = StepsRunner::new(
            &f.services,
            &f.handlers,
            &f.environment,
            CancellationToken::new(),
            Duration::from_secs(3600),
        );
        runner
            .run(&[
                scripted("build", "ok", ExecutionBehavior::OnSuccess),
                scripted("report", "ok", ExecutionBehavior::OnFailure),
            ])
            .await
            .unwrap();

        assert!(f.handler.waited.lock().is_empty());
        let warnings = f.plane.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("ad-hoc environment file"));
        assert!(f
            .plane
            .saved_log("build")
            .unwrap()
            .contains("Failed to initialize ad-hoc environment file"));
        assert!(trace
            .messages()
            .iter()
            .any(|(level, m)| *level == TraceLevel::Warning && m.contains("ad-hoc environment file")));
        assert_eq!(
            statuses(runner.history()),
            vec![
                ("build".to_string(), CommandStatus::Failed),
                ("report".to_string(), CommandStatus::Failed),
            ]
        );
    }
}
