//! Cooperative cancellation and checkpoint publication.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crate::ChatMessage;

/// Cooperative cancellation token shared across the session and its caller.
///
/// Single-shot and idempotent: the first `cancel` wins, later calls are
/// no-ops.
#[derive(Debug, Clone, Default)]
pub struct CooperativeCancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
}

impl CooperativeCancellationToken {
    /// Creates a new, not-yet-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token as cancelled and wakes pending waiters.
    pub fn cancel(&self) {
        let already_cancelled = self.cancelled.swap(true, Ordering::SeqCst);
        if !already_cancelled {
            self.notify.notify_waiters();
        }
    }

    /// Returns true when cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Full transcript state delivered to the UI sink on each checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSnapshot {
    pub messages: Vec<ChatMessage>,
    pub is_streaming: bool,
}

/// Handler invoked with each published snapshot.
pub type SnapshotHandler = Arc<dyn Fn(TranscriptSnapshot) + Send + Sync>;

/// Rate limiter for snapshot publication.
///
/// At most one unforced publish per interval; forced publishes (the first
/// and last of a turn) always go through and reset the window.
#[derive(Debug)]
pub struct CheckpointScheduler {
    min_interval: Duration,
    last_publish: Option<Instant>,
}

impl CheckpointScheduler {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_publish: None,
        }
    }

    /// Decides whether a publish may happen now, recording it if so.
    pub fn should_publish(&mut self, force: bool) -> bool {
        let now = Instant::now();
        if force {
            self.last_publish = Some(now);
            return true;
        }
        let due = self
            .last_publish
            .map(|last| now.duration_since(last) >= self.min_interval)
            .unwrap_or(true);
        if due {
            self.last_publish = Some(now);
        }
        due
    }
}
