// Error taxonomy shared by the control-plane client and the worker.

use thiserror::Error;

/// Errors surfaced by agent-level operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A failure that must not be retried (bad credentials, malformed plan).
    #[error("{0}")]
    NonRetryable(String),

    /// A control-plane call failed; may be retried.
    #[error("{method} failed: {message}")]
    Rpc { method: &'static str, message: String },

    /// The control plane closed a stream it considers finished.
    #[error("stream reached end of stream")]
    EndOfStream,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to resolve secret for {key}: {message}")]
    SecretResolution { key: String, message: String },

    /// An exit instruction ended the run.
    #[error("exit requested by the plan")]
    ExitRequested,
}

impl AgentError {
    pub fn rpc(method: &'static str, message: impl Into<String>) -> Self {
        AgentError::Rpc {
            method,
            message: message.into(),
        }
    }

    /// Whether a retry loop should try the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Rpc { .. } | AgentError::EndOfStream)
    }
}

/// Errors from a live log stream.
#[derive(Debug, Error)]
pub enum LogStreamError {
    /// The transport considers the stream finished; reopen to continue.
    #[error("log stream reached end of stream")]
    EndOfStream,

    #[error("log stream transport failed: {0}")]
    Transport(String),
}

impl From<LogStreamError> for AgentError {
    fn from(e: LogStreamError) -> Self {
        match e {
            LogStreamError::EndOfStream => AgentError::EndOfStream,
            LogStreamError::Transport(message) => AgentError::Rpc {
                method: "StreamLogs",
                message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(AgentError::rpc("FetchPlan", "503").is_retryable());
        assert!(AgentError::EndOfStream.is_retryable());
        assert!(!AgentError::NonRetryable("bad token".into()).is_retryable());
        assert!(!AgentError::ExitRequested.is_retryable());
    }

    #[test]
    fn test_log_stream_error_conversion() {
        let err: AgentError = LogStreamError::Transport("reset".into()).into();
        assert_eq!(err.to_string(), "StreamLogs failed: reset");
        let err: AgentError = LogStreamError::EndOfStream.into();
        assert!(matches!(err, AgentError::EndOfStream));
    }
}
