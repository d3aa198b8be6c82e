//! Human-approval request / resolve lifecycle.
//!
//! When a rule resolves to `approve`, the enforcement checkpoint parks
//! on [`ApprovalBroker::wait`]: a oneshot resolution future raced
//! against a deadline timer. An operator resolves through the control
//! socket; silence resolves to `TimedOut`, which callers fold into deny.
//! Requests are independent and their terminal state is set exactly
//! once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{oneshot, Mutex};

use agentwarden_core::ids::EventId;
use agentwarden_core::types::{PendingApproval, Resolution};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no pending approval for event {0}")]
    NotFound(EventId),
    #[error("approval for event {0} expired before the resolution arrived")]
    Expired(EventId),
}

struct PendingEntry {
    info: PendingApproval,
    tx: oneshot::Sender<Resolution>,
}

/// Mediates between enforcement checkpoints and the operator channel.
#[derive(Clone, Default)]
pub struct ApprovalBroker {
    pending: Arc<Mutex<HashMap<EventId, PendingEntry>>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the request and suspends the caller until an operator
    /// resolves it or the deadline passes. The wait is bounded by
    /// `timeout`, which the policy layer has already capped at the
    /// system ceiling.
    pub async fn wait(
        &self,
        event_id: EventId,
        rule: &str,
        message: &str,
        summary: &str,
        timeout: Duration,
    ) -> Resolution {
        let (tx, rx) = oneshot::channel();
        let requested_at = OffsetDateTime::now_utc();
        let info = PendingApproval {
            event_id,
            rule: rule.to_string(),
            message: message.to_string(),
            summary: summary.to_string(),
            requested_at,
            expires_at: requested_at + timeout,
        };
        self.pending
            .lock()
            .await
            .insert(event_id, PendingEntry { info, tx });

        let resolution = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resolution)) => resolution,
            // Sender dropped without a verdict; same fate as silence.
            Ok(Err(_)) => Resolution::TimedOut,
            Err(_) => Resolution::TimedOut,
        };

        // On resolve the entry is already gone; after a timeout it is
        // still ours to clean up.
        self.pending.lock().await.remove(&event_id);
        resolution
    }

    /// Operator verdict. The entry leaves the pending map before the
    /// waiter is woken, so a second resolution finds nothing to resolve.
    pub async fn resolve(&self, event_id: EventId, approve: bool) -> Result<(), ResolveError> {
        let entry = self
            .pending
            .lock()
            .await
            .remove(&event_id)
            .ok_or(ResolveError::NotFound(event_id))?;
        let resolution = if approve {
            Resolution::Approved
        } else {
            Resolution::Denied
        };
        entry
            .tx
            .send(resolution)
            .map_err(|_| ResolveError::Expired(event_id))
    }

    /// Pending requests, oldest first.
    pub async fn list(&self) -> Vec<PendingApproval> {
        let pending = self.pending.lock().await;
        let mut entries: Vec<PendingApproval> =
            pending.values().map(|entry| entry.info.clone()).collect();
        entries.sort_by_key(|entry| entry.requested_at);
        entries
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
