//! Which security context is executing in each session right now.
//!
//! A context is registered only while its execution runs, never while it
//! waits in a queue. Registrations stack per session so a forward running
//! inside another execution unwinds back to the outer caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::SecurityContext;

type Stacks = HashMap<String, Vec<(u64, Arc<SecurityContext>)>>;

/// Session name to stack of running contexts, shared by the queues and the
/// gateway forwarder.
#[derive(Default)]
pub struct CurrentContexts {
    stacks: Mutex<Stacks>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for CurrentContexts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CurrentContexts")
            .field("sessions", &self.lock().len())
            .finish_non_exhaustive()
    }
}

impl CurrentContexts {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Stacks> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Context of the execution currently running in `session`, if any.
    pub fn current(&self, session: &str) -> Option<Arc<SecurityContext>> {
        self.lock()
            .get(session)
            .and_then(|stack| stack.last())
            .map(|(_, ctx)| Arc::clone(ctx))
    }

    /// Register `ctx` as the current context of `session` until the guard
    /// is dropped.
    pub fn enter(self: &Arc<Self>, session: &str, ctx: Arc<SecurityContext>) -> ContextGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(session.to_owned())
            .or_default()
            .push((id, ctx));
        ContextGuard {
            table: Arc::clone(self),
            session: session.to_owned(),
            id,
        }
    }

    /// Number of sessions with a running context.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a context registered as current for a session until dropped.
#[derive(Debug)]
#[must_use = "the context is unregistered when the guard is dropped"]
pub struct ContextGuard {
    table: Arc<CurrentContexts>,
    session: String,
    id: u64,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let mut stacks = self.table.lock();
        if let Some(stack) = stacks.get_mut(&self.session) {
            stack.retain(|(id, _)| *id != self.id);
            if stack.is_empty() {
                stacks.remove(&self.session);
            }
        }
    }
}
