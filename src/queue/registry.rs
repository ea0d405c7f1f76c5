//! Session name to [`SessionQueue`] table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CancelSummary, InjectError, InjectOptions, InjectOutcome, QueueStats, SessionQueue};
use crate::config::QueueConfig;
use crate::executor::{ExecuteOptions, ExecutionError, Executor};
use crate::security::CurrentContexts;

/// Owns one queue per session. Distinct sessions never share a lock beyond
/// the brief table lookup.
///
/// Every queue registers the context of its running item in one shared
/// [`CurrentContexts`] table.
pub struct QueueRegistry {
    executor: Arc<dyn Executor>,
    event_capacity: usize,
    contexts: Arc<CurrentContexts>,
    queues: Mutex<HashMap<String, Arc<SessionQueue>>>,
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

impl QueueRegistry {
    /// Empty registry whose queues execute through `executor`.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self::with_config(executor, &QueueConfig::default())
    }

    /// Empty registry using `config` for new queues.
    pub fn with_config(executor: Arc<dyn Executor>, config: &QueueConfig) -> Self {
        Self {
            executor,
            event_capacity: config.event_capacity,
            contexts: Arc::new(CurrentContexts::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Table of the contexts currently executing in this registry's queues.
    /// Hand it to [`GatewayForwarder::with_contexts`](crate::gateway::GatewayForwarder::with_contexts)
    /// so the forwarder sees who is running.
    pub fn contexts(&self) -> &Arc<CurrentContexts> {
        &self.contexts
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionQueue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The queue of `session`, created on first use.
    pub fn queue(&self, session: &str) -> Arc<SessionQueue> {
        let mut queues = self.lock();
        let queue = queues.entry(session.to_owned()).or_insert_with(|| {
            debug!(session, "creating session queue");
            Arc::new(
                SessionQueue::with_event_capacity(
                    session,
                    Arc::clone(&self.executor),
                    self.event_capacity,
                )
                .with_contexts(Arc::clone(&self.contexts)),
            )
        });
        Arc::clone(queue)
    }

    /// The queue of `session` if it exists.
    pub fn get(&self, session: &str) -> Option<Arc<SessionQueue>> {
        self.lock().get(session).cloned()
    }

    /// Drop the queue of `session` if it is idle and nobody outside the
    /// registry holds it. Returns whether it was removed.
    pub fn remove(&self, session: &str) -> bool {
        let mut queues = self.lock();
        if queues.get(session).is_some_and(evictable) {
            queues.remove(session);
            return true;
        }
        false
    }

    /// Drop every queue [`remove`](Self::remove) would drop. Returns how many.
    pub fn prune_idle(&self) -> usize {
        let mut queues = self.lock();
        let before = queues.len();
        queues.retain(|_, queue| !evictable(queue));
        let pruned = before.saturating_sub(queues.len());
        if pruned > 0 {
            debug!(pruned, "pruned idle session queues");
        }
        pruned
    }

    /// Cancel everything in one session.
    pub fn cancel_session(&self, session: &str) -> Option<CancelSummary> {
        self.get(session).map(|queue| queue.cancel_all())
    }

    /// Cancel everything in every session. Returns how many sessions had
    /// something to cancel.
    pub fn cancel_everything(&self) -> usize {
        let queues: Vec<Arc<SessionQueue>> = self.lock().values().cloned().collect();
        let touched = queues
            .iter()
            .map(|queue| queue.cancel_all())
            .filter(|summary| summary.active || summary.queued > 0)
            .count();
        info!(sessions = touched, "cancelled all session queues");
        touched
    }

    /// Stats of every queue, sorted by session.
    pub fn stats(&self) -> Vec<QueueStats> {
        let queues: Vec<Arc<SessionQueue>> = self.lock().values().cloned().collect();
        let mut stats: Vec<QueueStats> = queues.iter().map(|queue| queue.stats()).collect();
        stats.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        stats
    }

    /// Number of queues.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no queues exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Idle and referenced only by the table. Must be called under the table
/// lock, which every [`QueueRegistry::queue`] clone also takes.
fn evictable(queue: &Arc<SessionQueue>) -> bool {
    Arc::strong_count(queue) == 1 && queue.is_idle()
}

/// [`Executor`] that runs through the target session's queue, so forwarded
/// executions are ordered with everything else injected into that session.
#[derive(Debug, Clone)]
pub struct QueuedExecutor {
    registry: Arc<QueueRegistry>,
}

impl QueuedExecutor {
    /// Executor enqueueing into `registry`.
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Executor for QueuedExecutor {
    async fn execute(
        &self,
        session_key: &str,
        message: &str,
        options: ExecuteOptions,
        cancel: CancellationToken,
    ) -> Result<String, ExecutionError> {
        let ticket = self.registry.queue(session_key).submit(
            message,
            InjectOptions {
                priority: options.priority,
                context: options.context,
                streaming: options.streaming,
                allow_direct_inject: false,
                parent_cancel: Some(cancel),
            },
        );
        match ticket.wait().await {
            Ok(InjectOutcome::Completed(response)) => Ok(response),
            Ok(InjectOutcome::Injected) => Ok(String::new()),
            Err(InjectError::Cancelled) => Err(ExecutionError::Cancelled),
            Err(InjectError::Execution(error)) => Err(error),
            Err(InjectError::Dropped) => {
                Err(ExecutionError::Failed("session queue dropped the request".to_owned()))
            }
        }
    }

    fn tracks_context(&self) -> bool {
        true
    }
}
