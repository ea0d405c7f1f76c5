//! Per-session execution queue.
//!
//! A [`SessionQueue`] is the only place a session's executions are started.
//! Items run one at a time in priority-then-arrival order; a single drain
//! task, guarded by the `processing` flag, pops and executes them.
//!
//! Cancellation is cooperative: each item carries a [`CancellationToken`]
//! that the executor must observe. Queued items that were cancelled are
//! rejected when the drain loop reaches them (or immediately by
//! [`SessionQueue::cancel`] and [`SessionQueue::cancel_queued`]).

pub mod event;
pub mod registry;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{ExecuteOptions, ExecutionError, Executor};
use crate::security::{CurrentContexts, SecurityContext};

pub use event::{CancelStage, EventEmitter, QueueEvent};
pub use registry::{QueueRegistry, QueuedExecutor};

/// Options for one injection.
#[derive(Debug, Clone, Default)]
pub struct InjectOptions {
    /// Higher runs first; ties keep arrival order.
    pub priority: i32,
    /// Security context handed to the executor.
    pub context: Option<Arc<SecurityContext>>,
    /// This execution is a long-lived stream that may take more input.
    pub streaming: bool,
    /// The caller accepts delivery straight into a running stream.
    pub allow_direct_inject: bool,
    /// Cancelling this token also cancels the item.
    pub parent_cancel: Option<CancellationToken>,
}

/// How an injection was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectOutcome {
    /// Executed as its own item; carries the executor response.
    Completed(String),
    /// Delivered into the stream that was already running.
    Injected,
}

impl InjectOutcome {
    /// Executor response for completed items.
    pub fn response(&self) -> Option<&str> {
        match self {
            Self::Completed(response) => Some(response),
            Self::Injected => None,
        }
    }
}

/// Why an injection did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InjectError {
    /// Cancelled while queued or while running.
    #[error("injection cancelled")]
    Cancelled,
    /// The executor failed or panicked.
    #[error(transparent)]
    Execution(ExecutionError),
    /// The queue went away without settling the item.
    #[error("queue dropped the injection")]
    Dropped,
}

impl InjectError {
    /// Returns `true` for the cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<ExecutionError> for InjectError {
    fn from(error: ExecutionError) -> Self {
        match error {
            ExecutionError::Cancelled => Self::Cancelled,
            other => Self::Execution(other),
        }
    }
}

type Responder = oneshot::Sender<Result<InjectOutcome, InjectError>>;

/// An item waiting in the pending list.
#[derive(Debug)]
pub struct QueuedInject {
    /// Per-queue id, starting at 1.
    pub id: u64,
    /// Session the item belongs to.
    pub session_key: String,
    /// Message text.
    pub message: String,
    /// Priority.
    pub priority: i32,
    /// Enqueue time.
    pub queued_at: DateTime<Utc>,
    cancel: CancellationToken,
    options: ExecuteOptions,
    responder: Responder,
}

/// The item currently executing.
#[derive(Debug, Clone)]
pub struct ActiveInject {
    /// Item id.
    pub id: u64,
    /// Session the item belongs to.
    pub session_key: String,
    /// When execution started.
    pub started_at: Instant,
    /// Started as a long-lived stream.
    pub streaming: bool,
    cancel: CancellationToken,
}

impl ActiveInject {
    /// Whether cancellation was signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Handle to one submitted item.
#[derive(Debug)]
pub struct InjectTicket {
    id: u64,
    cancel: CancellationToken,
    rx: oneshot::Receiver<Result<InjectOutcome, InjectError>>,
}

impl InjectTicket {
    /// Item id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Signal cancellation. A queued item is rejected when reached; a running
    /// one is asked to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the item to settle.
    ///
    /// # Errors
    ///
    /// `Cancelled`, `Execution`, or `Dropped`.
    pub async fn wait(self) -> Result<InjectOutcome, InjectError> {
        self.rx.await.unwrap_or(Err(InjectError::Dropped))
    }
}

/// What [`SessionQueue::cancel_all`] touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CancelSummary {
    /// An active item was signalled.
    pub active: bool,
    /// Queued items rejected.
    pub queued: usize,
}

/// The active item as seen by [`QueueStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveStats {
    /// Item id.
    pub id: u64,
    /// Milliseconds since execution started.
    pub running_ms: u64,
    /// Cancellation was signalled.
    pub cancelling: bool,
}

/// Snapshot of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Session the queue serves.
    pub session_key: String,
    /// Items waiting.
    pub queued: usize,
    /// The running item.
    pub active: Option<ActiveStats>,
    /// A drain task is running.
    pub processing: bool,
    /// Items that completed.
    pub completed: u64,
    /// Items that failed.
    pub failed: u64,
    /// Items that were cancelled.
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    cancelled: u64,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<QueuedInject>,
    active: Option<ActiveInject>,
    processing: bool,
    next_id: u64,
    counters: Counters,
}

/// Serializes the executions of one session.
pub struct SessionQueue {
    session_key: String,
    executor: Arc<dyn Executor>,
    contexts: Arc<CurrentContexts>,
    state: Mutex<QueueState>,
    events: EventEmitter<QueueEvent>,
}

impl std::fmt::Debug for SessionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionQueue")
            .field("session_key", &self.session_key)
            .finish_non_exhaustive()
    }
}

impl SessionQueue {
    /// Queue for `session_key` executing through `executor`.
    pub fn new(session_key: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self::with_event_capacity(session_key, executor, event::DEFAULT_CAPACITY)
    }

    /// Same as [`new`](Self::new) with a custom event channel capacity.
    pub fn with_event_capacity(
        session_key: impl Into<String>,
        executor: Arc<dyn Executor>,
        event_capacity: usize,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            executor,
            contexts: Arc::new(CurrentContexts::new()),
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                active: None,
                processing: false,
                next_id: 1,
                counters: Counters::default(),
            }),
            events: EventEmitter::with_capacity(event_capacity),
        }
    }

    /// Register running items' contexts in `contexts` instead of a private
    /// table.
    #[must_use]
    pub fn with_contexts(mut self, contexts: Arc<CurrentContexts>) -> Self {
        self.contexts = contexts;
        self
    }

    /// Context of the item currently executing, if it carried one.
    pub fn current_context(&self) -> Option<Arc<SecurityContext>> {
        self.contexts.current(&self.session_key)
    }

    /// Session this queue serves.
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Deliver `message`, preferring the running stream when allowed, and
    /// wait for the result.
    ///
    /// # Errors
    ///
    /// `Cancelled`, `Execution`, or `Dropped`.
    pub async fn enqueue(
        self: &Arc<Self>,
        message: impl Into<String>,
        options: InjectOptions,
    ) -> Result<InjectOutcome, InjectError> {
        let message = message.into();
        if options.allow_direct_inject {
            if let Some(active_id) = self.direct_inject_target() {
                match self
                    .executor
                    .inject_into_stream(&self.session_key, &message)
                    .await
                {
                    Ok(true) => {
                        debug!(session = %self.session_key, active_id, "injected into running stream");
                        self.events.emit(QueueEvent::DirectInject {
                            session_key: self.session_key.clone(),
                            active_id,
                        });
                        return Ok(InjectOutcome::Injected);
                    }
                    Ok(false) => {
                        debug!(session = %self.session_key, "stream declined input, queueing");
                    }
                    Err(e) => {
                        warn!(session = %self.session_key, error = %e, "direct inject failed, queueing");
                    }
                }
            }
        }
        self.submit(message, options).wait().await
    }

    /// Add `message` to the pending list and return its ticket.
    ///
    /// Starts the drain task on an idle queue, so it must be called inside a
    /// tokio runtime.
    pub fn submit(self: &Arc<Self>, message: impl Into<String>, options: InjectOptions) -> InjectTicket {
        let (tx, rx) = oneshot::channel();
        let cancel = options
            .parent_cancel
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let priority = options.priority;

        let (id, position, start_drain) = {
            let mut state = self.lock_state();
            let id = state.next_id;
            state.next_id = state.next_id.saturating_add(1);

            // After every item of equal or higher priority.
            let position = state
                .pending
                .iter()
                .position(|queued| queued.priority < priority)
                .unwrap_or(state.pending.len());
            state.pending.insert(
                position,
                QueuedInject {
                    id,
                    session_key: self.session_key.clone(),
                    message: message.into(),
                    priority,
                    queued_at: Utc::now(),
                    cancel: cancel.clone(),
                    options: ExecuteOptions {
                        priority,
                        context: options.context,
                        streaming: options.streaming,
                    },
                    responder: tx,
                },
            );

            let start_drain = !state.processing;
            state.processing = true;
            (id, position, start_drain)
        };

        debug!(session = %self.session_key, inject_id = id, priority, position, "enqueued");
        self.events.emit(QueueEvent::Enqueue {
            session_key: self.session_key.clone(),
            inject_id: id,
            priority,
            position,
        });

        if start_drain {
            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.drain().await });
        }

        InjectTicket { id, cancel, rx }
    }

    /// Signal cancellation to the running item. Returns whether one existed.
    ///
    /// The item stays active until the executor observes the signal.
    pub fn cancel_active(&self) -> bool {
        let active_id = {
            let state = self.lock_state();
            state.active.as_ref().map(|active| {
                active.cancel.cancel();
                active.id
            })
        };
        if let Some(id) = active_id {
            info!(session = %self.session_key, inject_id = id, "cancelling active injection");
        }
        active_id.is_some()
    }

    /// Reject and remove every item that has not started. Returns how many.
    pub fn cancel_queued(&self) -> usize {
        let drained: Vec<QueuedInject> = {
            let mut state = self.lock_state();
            let drained: Vec<QueuedInject> = state.pending.drain(..).collect();
            state.counters.cancelled = state
                .counters
                .cancelled
                .saturating_add(u64::try_from(drained.len()).unwrap_or(u64::MAX));
            drained
        };
        let count = drained.len();
        for item in drained {
            self.reject_cancelled(item);
        }
        if count > 0 {
            info!(session = %self.session_key, count, "cancelled queued injections");
        }
        count
    }

    /// Cancel queued items, then the running one.
    pub fn cancel_all(&self) -> CancelSummary {
        let queued = self.cancel_queued();
        let active = self.cancel_active();
        CancelSummary { active, queued }
    }

    /// Cancel one item by id, queued or running. Returns whether it was found.
    pub fn cancel(&self, inject_id: u64) -> bool {
        let removed = {
            let mut state = self.lock_state();
            let active_token = state
                .active
                .as_ref()
                .filter(|active| active.id == inject_id)
                .map(|active| active.cancel.clone());
            if let Some(token) = active_token {
                token.cancel();
                None
            } else {
                let Some(index) = state.pending.iter().position(|q| q.id == inject_id) else {
                    return false;
                };
                state.counters.cancelled = state.counters.cancelled.saturating_add(1);
                state.pending.remove(index)
            }
        };
        if let Some(item) = removed {
            self.reject_cancelled(item);
        }
        debug!(session = %self.session_key, inject_id, "cancelled injection");
        true
    }

    /// Whether an item is running.
    pub fn is_active(&self) -> bool {
        self.lock_state().active.is_some()
    }

    /// Whether items are waiting.
    pub fn has_queued(&self) -> bool {
        !self.lock_state().pending.is_empty()
    }

    /// Nothing running, nothing waiting, no drain task.
    pub fn is_idle(&self) -> bool {
        let state = self.lock_state();
        !state.processing && state.active.is_none() && state.pending.is_empty()
    }

    /// Snapshot of the running item.
    pub fn active(&self) -> Option<ActiveInject> {
        self.lock_state().active.clone()
    }

    /// Snapshot of the queue.
    pub fn stats(&self) -> QueueStats {
        let state = self.lock_state();
        QueueStats {
            session_key: self.session_key.clone(),
            queued: state.pending.len(),
            active: state.active.as_ref().map(|active| ActiveStats {
                id: active.id,
                running_ms: u64::try_from(active.started_at.elapsed().as_millis())
                    .unwrap_or(u64::MAX),
                cancelling: active.cancel.is_cancelled(),
            }),
            processing: state.processing,
            completed: state.counters.completed,
            failed: state.counters.failed,
            cancelled: state.counters.cancelled,
        }
    }

    /// Subscribe to queue events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    // -- internals ----------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Id of the running item if a message may go straight into its stream.
    ///
    /// Requires a running, uncancelled stream, nothing queued ahead of the
    /// message, and an executor that reports the stream open. The executor
    /// still has the last word in `inject_into_stream`.
    fn direct_inject_target(&self) -> Option<u64> {
        let active_id = {
            let state = self.lock_state();
            let active = state.active.as_ref()?;
            let eligible =
                active.streaming && !active.cancel.is_cancelled() && state.pending.is_empty();
            eligible.then_some(active.id)?
        };
        self.executor
            .accepts_stream_input(&self.session_key)
            .then_some(active_id)
    }

    fn reject_cancelled(&self, item: QueuedInject) {
        item.cancel.cancel();
        self.events.emit(QueueEvent::Cancel {
            session_key: self.session_key.clone(),
            inject_id: item.id,
            stage: CancelStage::Queued,
        });
        let _ = item.responder.send(Err(InjectError::Cancelled));
    }

    async fn drain(self: Arc<Self>) {
        loop {
            // Pop, cancellation check, and activation share one critical
            // section so cancel calls always find the item in `pending` or
            // `active`.
            let next = {
                let mut state = self.lock_state();
                let Some(item) = state.pending.pop_front() else {
                    state.processing = false;
                    return;
                };
                if item.cancel.is_cancelled() {
                    state.counters.cancelled = state.counters.cancelled.saturating_add(1);
                    Err(item)
                } else {
                    let started_at = Instant::now();
                    state.active = Some(ActiveInject {
                        id: item.id,
                        session_key: self.session_key.clone(),
                        started_at,
                        streaming: item.options.streaming,
                        cancel: item.cancel.clone(),
                    });
                    Ok((item, started_at))
                }
            };

            let (item, started_at) = match next {
                Ok(started) => started,
                Err(item) => {
                    self.events.emit(QueueEvent::Dequeue {
                        session_key: self.session_key.clone(),
                        inject_id: item.id,
                    });
                    debug!(session = %self.session_key, inject_id = item.id, "skipping cancelled injection");
                    self.reject_cancelled(item);
                    continue;
                }
            };

            let QueuedInject {
                id,
                message,
                cancel,
                options,
                responder,
                ..
            } = item;

            self.events.emit(QueueEvent::Dequeue {
                session_key: self.session_key.clone(),
                inject_id: id,
            });
            debug!(session = %self.session_key, inject_id = id, "starting injection");
            self.events.emit(QueueEvent::Start {
                session_key: self.session_key.clone(),
                inject_id: id,
            });

            let result = {
                let _current = options
                    .context
                    .clone()
                    .map(|ctx| self.contexts.enter(&self.session_key, ctx));
                let executor = Arc::clone(&self.executor);
                let session = self.session_key.clone();
                tokio::spawn(async move {
                    executor.execute(&session, &message, options, cancel).await
                })
                .await
                .unwrap_or_else(|join_err| Err(ExecutionError::Panicked(join_err.to_string())))
            };

            let elapsed_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
            let outcome = {
                let mut state = self.lock_state();
                state.active = None;
                let counters = &mut state.counters;
                match &result {
                    Ok(_) => counters.completed = counters.completed.saturating_add(1),
                    Err(ExecutionError::Cancelled) => {
                        counters.cancelled = counters.cancelled.saturating_add(1);
                    }
                    Err(_) => counters.failed = counters.failed.saturating_add(1),
                }
                result.map(InjectOutcome::Completed).map_err(InjectError::from)
            };

            match &outcome {
                Ok(_) => {
                    debug!(session = %self.session_key, inject_id = id, elapsed_ms, "injection complete");
                    self.events.emit(QueueEvent::Complete {
                        session_key: self.session_key.clone(),
                        inject_id: id,
                        elapsed_ms,
                    });
                }
                Err(InjectError::Cancelled) => {
                    info!(session = %self.session_key, inject_id = id, "injection cancelled while running");
                    self.events.emit(QueueEvent::Cancel {
                        session_key: self.session_key.clone(),
                        inject_id: id,
                        stage: CancelStage::Active,
                    });
                }
                Err(e) => {
                    warn!(session = %self.session_key, inject_id = id, error = %e, "injection failed");
                    self.events.emit(QueueEvent::Error {
                        session_key: self.session_key.clone(),
                        inject_id: id,
                        error: e.to_string(),
                    });
                }
            }

            let _ = responder.send(outcome);
        }
    }
}
