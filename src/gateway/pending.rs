//! Registry of forward requests: the pending set plus a bounded history of
//! finished requests.
//!
//! Every status transition happens under one lock, so a request can be
//! approved, rejected, or completed at most once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::request::{ForwardError, ForwardRequest, ForwardStatus};

#[derive(Debug, Default)]
struct Inner {
    requests: HashMap<String, ForwardRequest>,
    /// Ids of terminal requests, oldest first.
    finished: VecDeque<String>,
}

impl Inner {
    fn finish(&mut self, request_id: &str, history_limit: usize) {
        self.finished.push_back(request_id.to_owned());
        while self.finished.len() > history_limit {
            if let Some(oldest) = self.finished.pop_front() {
                self.requests.remove(&oldest);
            }
        }
    }
}

/// Forward requests owned by one [`GatewayForwarder`](super::GatewayForwarder).
#[derive(Debug)]
pub struct PendingForwards {
    inner: Mutex<Inner>,
    history_limit: usize,
}

impl PendingForwards {
    /// Empty registry remembering up to `history_limit` finished requests.
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            history_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a new request.
    pub fn insert(&self, request: ForwardRequest) {
        let mut inner = self.lock();
        let id = request.request_id.clone();
        let terminal = request.status.is_terminal();
        inner.requests.insert(id.clone(), request);
        if terminal {
            inner.finish(&id, self.history_limit);
        }
    }

    /// Snapshot of one request.
    pub fn get(&self, request_id: &str) -> Option<ForwardRequest> {
        self.lock().requests.get(request_id).cloned()
    }

    /// Requests still waiting for approval, oldest first.
    pub fn pending(&self) -> Vec<ForwardRequest> {
        let mut pending: Vec<ForwardRequest> = self
            .lock()
            .requests
            .values()
            .filter(|r| r.status == ForwardStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// Number of stored requests, pending and finished.
    pub fn len(&self) -> usize {
        self.lock().requests.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move a pending request to `Approved` and return it.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `NotPending` when the request already left
    /// the pending state, `Expired` when its deadline passed (the request is
    /// rejected as a side effect).
    pub fn begin_approval(
        &self,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ForwardRequest, ForwardError> {
        let mut inner = self.lock();
        let request = inner
            .requests
            .get_mut(request_id)
            .ok_or_else(|| ForwardError::NotFound {
                request_id: request_id.to_owned(),
            })?;

        if request.status != ForwardStatus::Pending {
            return Err(ForwardError::NotPending {
                request_id: request_id.to_owned(),
                status: request.status,
            });
        }
        if request.is_expired(now) {
            request.status = ForwardStatus::Rejected;
            request.error = Some("approval expired".to_owned());
            inner.finish(request_id, self.history_limit);
            return Err(ForwardError::Expired {
                request_id: request_id.to_owned(),
            });
        }

        request.status = ForwardStatus::Approved;
        Ok(request.clone())
    }

    /// Move a pending request to `Rejected`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `NotPending` for any other status.
    pub fn reject(&self, request_id: &str, reason: &str) -> Result<ForwardRequest, ForwardError> {
        let mut inner = self.lock();
        let request = inner
            .requests
            .get_mut(request_id)
            .ok_or_else(|| ForwardError::NotFound {
                request_id: request_id.to_owned(),
            })?;
        if request.status != ForwardStatus::Pending {
            return Err(ForwardError::NotPending {
                request_id: request_id.to_owned(),
                status: request.status,
            });
        }
        request.status = ForwardStatus::Rejected;
        request.error = Some(reason.to_owned());
        let rejected = request.clone();
        inner.finish(request_id, self.history_limit);
        Ok(rejected)
    }

    /// Record the end of an approved request's execution.
    ///
    /// Requests in any state other than `Approved` are left untouched.
    pub fn complete(&self, request_id: &str, result: Result<&str, String>) {
        let mut inner = self.lock();
        let Some(request) = inner.requests.get_mut(request_id) else {
            return;
        };
        if request.status != ForwardStatus::Approved {
            return;
        }
        request.status = ForwardStatus::Completed;
        match result {
            Ok(response) => request.response = Some(response.to_owned()),
            Err(error) => request.error = Some(error),
        }
        inner.finish(request_id, self.history_limit);
    }

    /// Reject every pending request whose deadline passed at `now`.
    /// Returns the affected ids.
    pub fn expire(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .requests
            .values_mut()
            .filter(|r| r.status == ForwardStatus::Pending && r.is_expired(now))
            .map(|r| {
                r.status = ForwardStatus::Rejected;
                r.error = Some("approval expired".to_owned());
                r.request_id.clone()
            })
            .collect();
        for id in &expired {
            inner.finish(id, self.history_limit);
        }
        expired
    }
}
