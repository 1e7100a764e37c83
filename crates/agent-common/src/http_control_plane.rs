// HttpControlPlane: Twirp-style JSON RPCs against the control-plane service.
//
// Every call is a POST to
//   {endpoint}/twirp/ci.agent.v1.ControlPlane/{Method}
// with Bearer auth using the client token and the task identification in
// the body. Log chunks are gzip-compressed and POSTed to StreamLogs.

use crate::config::AgentSettings;
use crate::control_plane::{ControlPlane, FinalReport, LogStream, Plan, StatusUpdate};
use crate::errors::{AgentError, LogStreamError};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::io::Write;
use std::time::Duration;

const SERVICE_PATH: &str = "twirp/ci.agent.v1.ControlPlane";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
struct TaskIdentification {
    task_id: String,
    secret: String,
}

#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
    identification: TaskIdentification,
}

impl HttpControlPlane {
    pub fn new(settings: &AgentSettings) -> Result<Self, AgentError> {
        let base_url = url::Url::parse(&settings.api_endpoint)
            .map_err(|e| AgentError::Config(format!("invalid api endpoint: {e}")))?
            .as_str()
            .trim_end_matches('/')
            .to_string();

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(format!("ci-agent/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            identification: TaskIdentification {
                task_id: settings.task_id.clone(),
                secret: settings.client_token.clone(),
            },
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}/{}", self.base_url, SERVICE_PATH, method)
    }

    async fn call(
        &self,
        method: &'static str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, AgentError> {
        let mut body = body;
        body["task_identification"] = serde_json::to_value(&self.identification)
            .map_err(|e| AgentError::rpc(method, e.to_string()))?;

        let response = self
            .client
            .post(self.method_url(method))
            .bearer_auth(&self.identification.secret)
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::rpc(method, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        tracing::debug!("{} returned HTTP {}: {}", method, status, text);
        if is_permanent_failure(status) {
            Err(AgentError::NonRetryable(format!(
                "{method} returned HTTP {status}: {text}"
            )))
        } else {
            Err(AgentError::rpc(method, format!("HTTP {status}: {text}")))
        }
    }
}

fn is_permanent_failure(status: StatusCode) -> bool {
    status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_plan(&self) -> Result<Plan, AgentError> {
        let response = self.call("FetchPlan", serde_json::json!({})).await?;
        response
            .json::<Plan>()
            .await
            .map_err(|e| AgentError::NonRetryable(format!("malformed plan: {e}")))
    }

    async fn flush_statuses(&self, updates: &[StatusUpdate]) -> Result<(), AgentError> {
        self.call("FlushStatuses", serde_json::json!({ "updates": updates }))
            .await
            .map(|_| ())
    }

    async fn open_log_stream(&self, command_name: &str) -> Result<Box<dyn LogStream>, AgentError> {
        let mut stream = HttpLogStream {
            client: self.client.clone(),
            url: self.method_url("StreamLogs"),
            token: self.identification.secret.clone(),
            task_id: self.identification.task_id.clone(),
            command_name: command_name.to_string(),
            open: true,
        };
        // The first request carries only the key.
        stream.post(Vec::new(), false).await.map_err(AgentError::from)?;
        Ok(Box::new(stream))
    }

    async fn save_full_log(&self, command_name: &str, content: Vec<u8>) -> Result<(), AgentError> {
        let compressed = gzip(&content).map_err(|e| AgentError::rpc("SaveLogs", e.to_string()))?;
        let response = self
            .client
            .post(self.method_url("SaveLogs"))
            .bearer_auth(&self.identification.secret)
            .header("Content-Encoding", "gzip")
            .header("X-Task-Id", &self.identification.task_id)
            .header("X-Command-Name", command_name)
            .body(compressed)
            .send()
            .await
            .map_err(|e| AgentError::rpc("SaveLogs", e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AgentError::rpc("SaveLogs", format!("HTTP {}", response.status())))
        }
    }

    async fn report_final(&self, report: &FinalReport) -> Result<(), AgentError> {
        let body = serde_json::to_value(report)
            .map_err(|e| AgentError::rpc("ReportFinal", e.to_string()))?;
        self.call("ReportFinal", body).await.map(|_| ())
    }

    async fn report_warning(&self, message: &str) -> Result<(), AgentError> {
        self.call("ReportWarning", serde_json::json!({ "message": message }))
            .await
            .map(|_| ())
    }

    async fn report_error(&self, message: &str) -> Result<(), AgentError> {
        self.call("ReportError", serde_json::json!({ "message": message }))
            .await
            .map(|_| ())
    }

    async fn heartbeat(&self) -> Result<(), AgentError> {
        self.call("Heartbeat", serde_json::json!({})).await.map(|_| ())
    }
}

/// A chunked StreamLogs session. Each chunk is one gzip-compressed POST that
/// carries the stream key in headers.
struct HttpLogStream {
    client: Client,
    url: String,
    token: String,
    task_id: String,
    command_name: String,
    open: bool,
}

impl HttpLogStream {
    async fn post(&mut self, chunk: Vec<u8>, last: bool) -> Result<(), LogStreamError> {
        let body = gzip(&chunk).map_err(|e| LogStreamError::Transport(e.to_string()))?;
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .header("Content-Encoding", "gzip")
            .header("X-Task-Id", &self.task_id)
            .header("X-Command-Name", &self.command_name)
            .header("X-Stream-Last", if last { "true" } else { "false" })
            .body(body)
            .send()
            .await
            .map_err(|e| LogStreamError::Transport(e.to_string()))?;

        if response.status() == StatusCode::GONE {
            self.open = false;
            return Err(LogStreamError::EndOfStream);
        }
        if !response.status().is_success() {
            return Err(LogStreamError::Transport(format!("HTTP {}", response.status())));
        }

        let text = response.text().await.unwrap_or_default();
        if response_signals_eof(&text) {
            self.open = false;
            return Err(LogStreamError::EndOfStream);
        }
        Ok(())
    }
}

fn response_signals_eof(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("eof").and_then(|eof| eof.as_bool()))
        .unwrap_or(false)
}

#[async_trait]
impl LogStream for HttpLogStream {
    async fn send(&mut self, chunk: &[u8]) -> Result<(), LogStreamError> {
        if !self.open {
            return Err(LogStreamError::EndOfStream);
        }
        self.post(chunk.to_vec(), false).await
    }

    async fn close(&mut self) -> Result<(), LogStreamError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        match self.post(Vec::new(), true).await {
            Ok(()) | Err(LogStreamError::EndOfStream) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
