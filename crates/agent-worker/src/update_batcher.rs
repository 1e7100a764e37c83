// UpdateBatcher: accumulates command status transitions and flushes them to
// the control plane in order.
//
// `pending` is always the suffix of `history` not yet acknowledged by a
// successful flush. Only the main loop owns the batcher.

use agent_common::{ControlPlane, StatusUpdate};
use agent_sdk::TraceWriter;
use std::sync::Arc;

pub struct UpdateBatcher {
    control_plane: Arc<dyn ControlPlane>,
    trace: Arc<dyn TraceWriter>,
    history: Vec<StatusUpdate>,
    pending: Vec<StatusUpdate>,
}

impl UpdateBatcher {
    pub fn new(control_plane: Arc<dyn ControlPlane>, trace: Arc<dyn TraceWriter>) -> Self {
        Self {
            control_plane,
            trace,
            history: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn queue(&mut self, update: StatusUpdate) {
        self.history.push(update.clone());
        self.pending.push(update);
    }

    /// Send everything queued since the last successful flush as one call.
    ///
    /// Failures are logged and leave the pending updates for the next flush.
    pub async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        match self.control_plane.flush_statuses(&self.pending).await {
            Ok(()) => self.pending.clear(),
            Err(e) => self.trace.warning(&format!(
                "Failed to report {} status update(s), will retry on next flush: {e}",
                self.pending.len()
            )),
        }
    }

    /// Every update ever queued, in order.
    pub fn history(&self) -> &[StatusUpdate] {
        &self.history
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
