// Cancellation scopes built on `tokio_util::sync::CancellationToken`.
//
// A `CancellationToken` only knows *that* it was cancelled. Run policy also
// needs *why* (deadline vs. external cancellation), which `DeadlineScope`
// records. `all_cancelled` composes scopes so that the result fires only
// after every input has fired.

use once_cell::sync::OnceCell;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationCause {
    /// The scope's own deadline elapsed.
    DeadlineExceeded,
    /// The scope (or one of its parents) was cancelled explicitly.
    Cancelled,
}

/// A cancellation scope with a deadline and a recorded cause.
///
/// The first cause to be observed wins and never changes afterwards.
#[derive(Debug, Clone)]
pub struct DeadlineScope {
    token: CancellationToken,
    cause: Arc<OnceCell<CancellationCause>>,
}

impl DeadlineScope {
    /// Create a scope that is cancelled when `parent` is cancelled or when
    /// `timeout` elapses, whichever happens first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_timeout(parent: &CancellationToken, timeout: Duration) -> Self {
        let token = parent.child_token();
        let cause = Arc::new(OnceCell::new());

        let timer_token = token.clone();
        let timer_cause = Arc::clone(&cause);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    let _ = timer_cause.set(CancellationCause::DeadlineExceeded);
                    timer_token.cancel();
                }
                _ = timer_token.cancelled() => {
                    let _ = timer_cause.set(CancellationCause::Cancelled);
                }
            }
        });

        Self { token, cause }
    }

    /// The token observed by work running inside this scope.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the scope explicitly.
    pub fn cancel(&self) {
        let _ = self.cause.set(CancellationCause::Cancelled);
        self.token.cancel();
    }

    /// The cause, or `None` while the scope is still alive.
    pub fn cause(&self) -> Option<CancellationCause> {
        match self.cause.get() {
            Some(cause) => Some(*cause),
            // The timer task may not have observed a parent cancellation yet.
            None if self.token.is_cancelled() => Some(CancellationCause::Cancelled),
            None => None,
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.cause() == Some(CancellationCause::DeadlineExceeded)
    }
}

/// Returns a token that is cancelled only once *every* token in `tokens` has
/// been cancelled.
///
/// An empty input yields an already-cancelled token. Cancelling the returned
/// token directly is allowed and stops the internal watcher.
///
/// Must be called from within a Tokio runtime.
pub fn all_cancelled(tokens: &[CancellationToken]) -> CancellationToken {
    let combined = CancellationToken::new();
    if tokens.iter().all(|t| t.is_cancelled()) {
        combined.cancel();
        return combined;
    }

    let inputs: Vec<CancellationToken> = tokens.to_vec();
    let output = combined.clone();
    tokio::spawn(async move {
        let every = futures::future::join_all(inputs.iter().map(|t| t.cancelled()));
        tokio::select! {
            _ = every => output.cancel(),
            _ = output.cancelled() => {}
        }
    });

    combined
}

/// Sleep for `duration` unless `token` is cancelled first.
///
/// Returns `true` if the full duration elapsed.
pub async fn sleep_or_cancelled(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = token.cancelled() => false,
    }
}
