// In-memory control plane used by the worker's tests.

use agent_common::{
    AgentError, ControlPlane, FinalReport, LogStream, LogStreamError, Plan, StatusUpdate,
};
use agent_sdk::{process_group, NullTraceWriter};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::background::BackgroundRegistry;
use crate::collaborators::{CacheRegistry, Collaborators, MonitorResult, ResourceMonitor};
use crate::log_streamer::LogStreamerOptions;
use crate::run_context::RunServices;

/// Collaborators with a monitor that reports nothing as soon as it stops.
pub(crate) fn collaborators() -> Collaborators {
    Collaborators {
        resources: Arc::new(IdleResourceMonitor),
        ..Collaborators::default()
    }
}

/// Run services rooted at `dir`, talking to `control_plane`.
pub(crate) fn services(dir: &Path, control_plane: Arc<dyn ControlPlane>) -> RunServices {
    RunServices {
        control_plane,
        collaborators: collaborators(),
        caches: CacheRegistry::new(),
        background: BackgroundRegistry::new(),
        trace: Arc::new(NullTraceWriter),
        group: process_group::platform_default(),
        working_directory: dir.join("work"),
        script_directory: dir.join("scripts"),
        env_file_directory: dir.join("env"),
        kill_orphans: true,
        shell_override: None,
        log_options: LogStreamerOptions::new(dir.join("logs"), false),
    }
}

pub(crate) struct IdleResourceMonitor;

impl ResourceMonitor for IdleResourceMonitor {
    fn start(&self, cancel: CancellationToken) -> oneshot::Receiver<MonitorResult> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            cancel.cancelled().await;
            let _ = tx.send(MonitorResult::default());
        });
        rx
    }
}

#[derive(Default)]
struct StreamRecord {
    opened: u32,
    chunks: Vec<Vec<u8>>,
}

#[derive(Default)]
struct FakeState {
    plan: Option<Plan>,
    fetch_failures: u32,
    fetch_rejections: u32,
    fetch_calls: u32,
    fail_flushes: bool,
    flushes: Vec<Vec<StatusUpdate>>,
    streams: HashMap<String, StreamRecord>,
    end_first_stream_after: Option<usize>,
    saved: HashMap<String, Vec<u8>>,
    final_failures: u32,
    final_calls: u32,
    finals: Vec<FinalReport>,
    warnings: Vec<String>,
    errors: Vec<String>,
    heartbeats: u32,
}

#[derive(Default, Clone)]
pub(crate) struct FakeControlPlane {
    state: Arc<Mutex<FakeState>>,
}

impl FakeControlPlane {
    pub(crate) fn with_plan(plan: Plan) -> Self {
        let fake = Self::default();
        fake.state.lock().plan = Some(plan);
        fake
    }

    pub(crate) fn fail_fetches(&self, times: u32) {
        self.state.lock().fetch_failures = times;
    }

    /// The first `times` fetches fail with a non-retryable error.
    pub(crate) fn reject_fetches(&self, times: u32) {
        self.state.lock().fetch_rejections = times;
    }

    pub(crate) fn fail_flushes(&self, fail: bool) {
        self.state.lock().fail_flushes = fail;
    }

    pub(crate) fn fail_final_reports(&self, times: u32) {
        self.state.lock().final_failures = times;
    }

    /// The first stream opened reports end-of-stream after `sends` chunks.
    pub(crate) fn end_first_stream_after(&self, sends: usize) {
        self.state.lock().end_first_stream_after = Some(sends);
    }

    pub(crate) fn fetch_calls(&self) -> u32 {
        self.state.lock().fetch_calls
    }

    pub(crate) fn flushes(&self) -> Vec<Vec<StatusUpdate>> {
        self.state.lock().flushes.clone()
    }

    pub(crate) fn streams_opened(&self, command: &str) -> u32 {
        self.state
            .lock()
            .streams
            .get(command)
            .map(|s| s.opened)
            .unwrap_or(0)
    }

    pub(crate) fn streamed_text(&self, command: &str) -> String {
        let state = self.state.lock();
        let bytes: Vec<u8> = state
            .streams
            .get(command)
            .map(|s| s.chunks.concat())
            .unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub(crate) fn chunk_sizes(&self, command: &str) -> Vec<usize> {
        self.state
            .lock()
            .streams
            .get(command)
            .map(|s| s.chunks.iter().map(|c| c.len()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn saved_log(&self, command: &str) -> Option<String> {
        self.state
            .lock()
            .saved
            .get(command)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub(crate) fn final_reports(&self) -> Vec<FinalReport> {
        self.state.lock().finals.clone()
    }

    pub(crate) fn final_calls(&self) -> u32 {
        self.state.lock().final_calls
    }

    pub(crate) fn warnings(&self) -> Vec<String> {
        self.state.lock().warnings.clone()
    }

    pub(crate) fn errors(&self) -> Vec<String> {
        self.state.lock().errors.clone()
    }

    pub(crate) fn heartbeats(&self) -> u32 {
        self.state.lock().heartbeats
    }
}

struct FakeLogStream {
    state: Arc<Mutex<FakeState>>,
    command: String,
    first: bool,
    sent: usize,
}

#[async_trait]
impl LogStream for FakeLogStream {
    async fn send(&mut self, chunk: &[u8]) -> Result<(), LogStreamError> {
        let mut state = self.state.lock();
        if self.first {
            if let Some(limit) = state.end_first_stream_after {
                if self.sent >= limit {
                    return Err(LogStreamError::EndOfStream);
                }
            }
        }
        self.sent += 1;
        state
            .streams
            .entry(self.command.clone())
            .or_default()
            .chunks
            .push(chunk.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), LogStreamError> {
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn fetch_plan(&self) -> Result<Plan, AgentError> {
        let mut state = self.state.lock();
        state.fetch_calls += 1;
        if state.fetch_calls <= state.fetch_rejections {
            return Err(AgentError::NonRetryable(
                "FetchPlan returned HTTP 404: not ready".into(),
            ));
        }
        if state.fetch_calls <= state.fetch_failures {
            return Err(AgentError::rpc("FetchPlan", "unavailable"));
        }
        state
            .plan
            .clone()
            .ok_or_else(|| AgentError::rpc("FetchPlan", "no plan yet"))
    }

    async fn flush_statuses(&self, updates: &[StatusUpdate]) -> Result<(), AgentError> {
        let mut state = self.state.lock();
        if state.fail_flushes {
            return Err(AgentError::rpc("FlushStatuses", "unavailable"));
        }
        state.flushes.push(updates.to_vec());
        Ok(())
    }

    async fn open_log_stream(&self, command_name: &str) -> Result<Box<dyn LogStream>, AgentError> {
        let mut state = self.state.lock();
        let total_opened: u32 = state.streams.values().map(|s| s.opened).sum();
        let record = state.streams.entry(command_name.to_string()).or_default();
        record.opened += 1;
        Ok(Box::new(FakeLogStream {
            state: Arc::clone(&self.state),
            command: command_name.to_string(),
            first: total_opened == 0,
            sent: 0,
        }))
    }

    async fn save_full_log(&self, command_name: &str, content: Vec<u8>) -> Result<(), AgentError> {
        self.state
            .lock()
            .saved
            .insert(command_name.to_string(), content);
        Ok(())
    }

    async fn report_final(&self, report: &FinalReport) -> Result<(), AgentError> {
        let mut state = self.state.lock();
        state.final_calls += 1;
        if state.final_calls <= state.final_failures {
            return Err(AgentError::rpc("ReportFinal", "unavailable"));
        }
        state.finals.push(report.clone());
        Ok(())
    }

    async fn report_warning(&self, message: &str) -> Result<(), AgentError> {
        self.state.lock().warnings.push(message.to_string());
        Ok(())
    }

    async fn report_error(&self, message: &str) -> Result<(), AgentError> {
        self.state.lock().errors.push(message.to_string());
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), AgentError> {
        self.state.lock().heartbeats += 1;
        Ok(())
    }
}
