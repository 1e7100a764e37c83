use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::output_piper::{OutputPiper, OutputSink};
use crate::process_group::ProcessGroupStrategy;
use crate::process_table;
use crate::shell_script::ShellScriptBuilder;
use crate::trace::TraceWriter;

/// Written to the command's output when its execution scope ends first.
pub const TIMEOUT_MARKER: &str = "Timed out!";

/// Interval of the secondary exit poller.
const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Failures of a launched command, kept distinct so callers can tell a
/// timeout from an ordinary failure.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to launch process: {0}")]
    Launch(String),

    #[error("execution scope ended before the process exited")]
    Timeout,

    #[error("process exited with code {0}")]
    ExitCode(i32),

    #[error("process was terminated by signal {0}")]
    Signaled(i32),

    #[error("failed to wait for process: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProcessError::Timeout)
    }

    /// Abnormal termination that was not caused by the agent's own timeout.
    pub fn is_signaled(&self) -> bool {
        matches!(self, ProcessError::Signaled(_))
    }
}

/// Per-launch settings.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Working directory for the child; inherited when `None`.
    pub working_directory: Option<PathBuf>,
    /// Variables added on top of the agent's own environment.
    pub environment: HashMap<String, String>,
    /// Kill leftover group members after the main process exits.
    pub kill_orphans: bool,
    /// Where script files are written.
    pub script_directory: PathBuf,
}

/// Starts script batches as process trees and wires their output to a sink.
#[derive(Clone)]
pub struct ProcessLauncher {
    trace: Arc<dyn TraceWriter>,
    group: Arc<dyn ProcessGroupStrategy>,
    scripts: ShellScriptBuilder,
}

impl ProcessLauncher {
    pub fn new(
        trace: Arc<dyn TraceWriter>,
        group: Arc<dyn ProcessGroupStrategy>,
        scripts: ShellScriptBuilder,
    ) -> Self {
        Self {
            trace,
            group,
            scripts,
        }
    }

    /// Materialize `lines` and start them. Output from stdout and stderr is
    /// copied into `sink` until the process is waited on or killed.
    pub fn launch(
        &self,
        lines: &[String],
        options: &LaunchOptions,
        sink: Arc<dyn OutputSink>,
    ) -> Result<LaunchedProcess, ProcessError> {
        let invocation =
            self.scripts
                .materialize(lines, &options.environment, &options.script_directory)?;

        self.trace.info("Starting process:");
        self.trace.info(&format!("  Program: '{}'", invocation.program));
        self.trace.info(&format!("  Arguments: '{}'", invocation.args.join(" ")));
        self.trace
            .info(&format!("  Process group strategy: '{}'", self.group.name()));

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&options.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_directory {
            if dir.is_dir() {
                command.current_dir(dir);
            }
        }
        self.group.prepare(&mut command);

        let mut child = command.spawn().map_err(|e| {
            ProcessError::Launch(format!("failed to start '{}': {e}", invocation.program))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Launch("process exited before its pid was read".into()))?;

        let mut piper = OutputPiper::new();
        if let Some(stdout) = child.stdout.take() {
            piper.attach(stdout, Arc::clone(&sink));
        }
        if let Some(stderr) = child.stderr.take() {
            piper.attach(stderr, Arc::clone(&sink));
        }

        self.trace.info(&format!("Process started with id {pid}."));

        Ok(LaunchedProcess {
            child,
            pid,
            piper,
            sink,
            group: Arc::clone(&self.group),
            trace: Arc::clone(&self.trace),
            kill_orphans: options.kill_orphans,
            started: Instant::now(),
            _script_file: invocation.script_file,
        })
    }
}

/// A running process tree started by [`ProcessLauncher::launch`].
pub struct LaunchedProcess {
    child: Child,
    pid: u32,
    piper: OutputPiper,
    sink: Arc<dyn OutputSink>,
    group: Arc<dyn ProcessGroupStrategy>,
    trace: Arc<dyn TraceWriter>,
    kill_orphans: bool,
    started: Instant,
    _script_file: Option<TempPath>,
}

impl std::fmt::Debug for LaunchedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedProcess")
            .field("pid", &self.pid)
            .field("kill_orphans", &self.kill_orphans)
            .finish()
    }
}

impl LaunchedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the process to exit or for `scope` to be cancelled.
    ///
    /// On cancellation the process table is dumped to diagnostics, the whole
    /// tree is killed, [`TIMEOUT_MARKER`] is written to the output and
    /// [`ProcessError::Timeout`] is returned.
    pub async fn wait(mut self, scope: CancellationToken) -> Result<(), ProcessError> {
        let mut poller = tokio::time::interval(EXIT_POLL_INTERVAL);
        poller.tick().await;

        let status: ExitStatus = loop {
            tokio::select! {
                status = self.child.wait() => break status?,
                _ = scope.cancelled() => {
                    self.terminate_on_timeout().await;
                    return Err(ProcessError::Timeout);
                }
                _ = poller.tick() => {
                    // Exit notifications can be missed; poll as a fallback.
                    if let Some(status) = self.child.try_wait()? {
                        break status;
                    }
                }
            }
        };

        self.trace.info(&format!(
            "Process {} exited with {} after {:.2?}.",
            self.pid,
            status,
            self.started.elapsed()
        ));

        if self.kill_orphans {
            if let Err(e) = self.group.kill_tree(self.pid).await {
                self.trace
                    .warning(&format!("Failed to kill leftover processes of {}: {e}", self.pid));
            }
        }
        // Without the orphan kill, leftover descendants may hold the pipe open.
        self.piper.close(!self.kill_orphans).await;

        check_exit_status(status)
    }

    /// Forcibly terminate the whole tree and stop copying its output.
    pub async fn kill(mut self) {
        self.trace.info(&format!("Killing process tree of {}.", self.pid));
        if let Err(e) = self.group.kill_tree(self.pid).await {
            self.trace
                .warning(&format!("Failed to kill process tree of {}: {e}", self.pid));
        }
        let _ = self.child.kill().await;
        self.piper.close(true).await;
    }

    async fn terminate_on_timeout(&mut self) {
        self.trace.warning(&format!(
            "Execution scope ended after {:.2?}, terminating process tree of {}.",
            self.started.elapsed(),
            self.pid
        ));
        let table = process_table::dump_async().await;
        self.trace.info(&format!("Process table at timeout:\n{table}"));

        if let Err(e) = self.group.kill_tree(self.pid).await {
            self.trace
                .error(&format!("Failed to kill process tree of {}: {e}", self.pid));
        }
        let _ = self.child.kill().await;

        let piper = std::mem::take(&mut self.piper);
        piper.close(true).await;
        let _ = self
            .sink
            .write_output(format!("\n{TIMEOUT_MARKER}\n").as_bytes())
            .await;
    }
}

fn check_exit_status(status: ExitStatus) -> Result<(), ProcessError> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(ProcessError::Signaled(signal));
        }
    }
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(ProcessError::ExitCode(code)),
        None => Err(ProcessError::ExitCode(-1)),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process_group::PosixProcessGroup;
    use crate::shell_script::{ScriptPlatform, ShellScriptBuilder};
    use crate::trace::NullTraceWriter;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct BufferSink(Mutex<Vec<u8>>);

    impl BufferSink {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).to_string()
        }
    }

    #[async_trait::async_trait]
    impl OutputSink for BufferSink {
        async fn write_output(&self, data: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(data);
            Ok(data.len())
        }
    }

    fn launcher() -> ProcessLauncher {
        ProcessLauncher::new(
            Arc::new(NullTraceWriter),
            Arc::new(PosixProcessGroup),
            ShellScriptBuilder::new(ScriptPlatform::Posix, "/bin/sh"),
        )
    }

    fn options(dir: &tempfile::TempDir) -> LaunchOptions {
        LaunchOptions {
            kill_orphans: true,
            script_directory: dir.path().to_path_buf(),
            ..LaunchOptions::default()
        }
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn successful_script_streams_output() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(BufferSink::default());
        let process = launcher()
            .launch(&lines(&["echo hello", "echo world >&2"]), &options(&dir), sink.clone())
            .unwrap();
        process.wait(CancellationToken::new()).await.unwrap();

        let text = sink.text();
        assert!(text.contains("hello"));
        assert!(text.contains("world"));
        assert!(!text.contains(TIMEOUT_MARKER));
    }

    #[tokio::test]
    async fn fail_fast_stops_at_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(BufferSink::default());
        let process = launcher()
            .launch(&lines(&["exit 3", "echo unreachable-line-output"]), &options(&dir), sink.clone())
            .unwrap();
        let err = process.wait(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProcessError::ExitCode(3)));
        assert!(!sink.text().lines().any(|l| l == "unreachable-line-output"));
    }

    #[tokio::test]
    async fn environment_is_passed_to_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(BufferSink::default());
        let mut opts = options(&dir);
        opts.environment
            .insert("AGENT_TEST_VALUE".into(), "value-123".into());
        let process = launcher()
            .launch(&lines(&["echo \"got $AGENT_TEST_VALUE\""]), &opts, sink.clone())
            .unwrap();
        process.wait(CancellationToken::new()).await.unwrap();
        assert!(sink.text().contains("got value-123"));
    }

    #[tokio::test]
    async fn signal_termination_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(BufferSink::default());
        let process = launcher()
            .launch(&lines(&["kill -9 $$"]), &options(&dir), sink)
            .unwrap();
        let err = process.wait(CancellationToken::new()).await.unwrap_err();
        assert!(err.is_signaled());
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(
            Arc::new(NullTraceWriter),
            Arc::new(PosixProcessGroup),
            ShellScriptBuilder::new(ScriptPlatform::Posix, "/nonexistent/shell-xyz"),
        );
        let err = launcher
            .launch(&lines(&["true"]), &options(&dir), Arc::new(BufferSink::default()))
            .unwrap_err();
        assert!(matches!(err, ProcessError::Launch(_)));
    }

    #[tokio::test]
    async fn cancellation_kills_backgrounded_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(BufferSink::default());
        let process = launcher()
            .launch(
                &lines(&["sleep 86400 &", "echo \"bg-pid=$!\"", "sleep 60"]),
                &options(&dir),
                sink.clone(),
            )
            .unwrap();

        let scope = CancellationToken::new();
        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = process.wait(scope).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_signaled());
        assert!(started.elapsed() < Duration::from_secs(30));

        let text = sink.text();
        assert!(text.contains(TIMEOUT_MARKER));
        let background_pid: u32 = text
            .lines()
            .find_map(|l| l.strip_prefix("bg-pid="))
            .and_then(|pid| pid.trim().parse().ok())
            .expect("background pid should be printed");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!process_table::is_alive(background_pid));
    }

    #[tokio::test]
    async fn backgrounded_children_are_not_waited_for() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(BufferSink::default());
        let process = launcher()
            .launch(&lines(&["sleep 60 &", "sleep 1"]), &options(&dir), sink.clone())
            .unwrap();

        let started = Instant::now();
        process.wait(CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(!sink.text().contains(TIMEOUT_MARKER));
    }

    #[tokio::test]
    async fn escape_hatch_still_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(BufferSink::default());
        let mut opts = options(&dir);
        opts.kill_orphans = false;
        let process = launcher()
            .launch(&lines(&["sleep 5 &", "echo started"]), &opts, sink.clone())
            .unwrap();

        let started = Instant::now();
        process.wait(CancellationToken::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(sink.text().contains("started"));
    }

    #[tokio::test]
    async fn kill_terminates_a_running_tree() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(BufferSink::default());
        let process = launcher()
            .launch(&lines(&["sleep 120"]), &options(&dir), sink)
            .unwrap();
        let pid = process.pid();
        process.kill().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!process_table::is_alive(pid));
    }
}
