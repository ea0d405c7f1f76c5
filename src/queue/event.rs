//! Events published by a [`SessionQueue`](super::SessionQueue), and the
//! broadcast emitter shared with the gateway.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::broadcast;

/// Where an item was when it was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStage {
    /// Still waiting in the queue.
    Queued,
    /// Running.
    Active,
}

/// Lifecycle event of one queued injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QueueEvent {
    /// An item entered the queue.
    Enqueue {
        /// Session the queue serves.
        session_key: String,
        /// Item id.
        inject_id: u64,
        /// Item priority.
        priority: i32,
        /// Index the item was inserted at.
        position: usize,
    },
    /// An item left the pending list.
    Dequeue {
        /// Session the queue serves.
        session_key: String,
        /// Item id.
        inject_id: u64,
    },
    /// An item started executing.
    Start {
        /// Session the queue serves.
        session_key: String,
        /// Item id.
        inject_id: u64,
    },
    /// An item finished successfully.
    Complete {
        /// Session the queue serves.
        session_key: String,
        /// Item id.
        inject_id: u64,
        /// Execution time in milliseconds.
        elapsed_ms: u64,
    },
    /// An item failed.
    Error {
        /// Session the queue serves.
        session_key: String,
        /// Item id.
        inject_id: u64,
        /// Failure description.
        error: String,
    },
    /// An item was cancelled.
    Cancel {
        /// Session the queue serves.
        session_key: String,
        /// Item id.
        inject_id: u64,
        /// Whether it was queued or running.
        stage: CancelStage,
    },
    /// A message went straight into the running stream instead of the queue.
    #[serde(rename = "v2-inject")]
    DirectInject {
        /// Session the queue serves.
        session_key: String,
        /// Id of the running item that took the message.
        active_id: u64,
    },
}

impl QueueEvent {
    /// Id of the item the event is about.
    pub fn inject_id(&self) -> u64 {
        match self {
            Self::Enqueue { inject_id, .. }
            | Self::Dequeue { inject_id, .. }
            | Self::Start { inject_id, .. }
            | Self::Complete { inject_id, .. }
            | Self::Error { inject_id, .. }
            | Self::Cancel { inject_id, .. } => *inject_id,
            Self::DirectInject { active_id, .. } => *active_id,
        }
    }
}

/// Default broadcast channel capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Broadcast-based event emitter.
///
/// Non-blocking: `emit` never awaits. Slow receivers lag and lose the oldest
/// events rather than blocking the sender.
#[derive(Debug)]
pub struct EventEmitter<T> {
    tx: broadcast::Sender<T>,
    emit_count: AtomicU64,
}

impl<T: Clone> EventEmitter<T> {
    /// Create a new emitter with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new emitter with a custom channel capacity (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Emit an event to all subscribers. Returns how many received it.
    pub fn emit(&self, event: T) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total number of events emitted.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl<T: Clone> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}
