//! Forward request records, outcomes, and errors.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::executor::ExecutionError;
use crate::security::rate_limit::RateLimited;
use crate::security::{InjectionSource, PolicyViolation, SourceType};

pub use crate::security::ActionType;

/// Lifecycle state of a [`ForwardRequest`].
///
/// `Pending -> Approved -> Completed`, `Pending -> Rejected`, or straight to
/// `Approved -> Completed` when no approval is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    /// Waiting for approval.
    Pending,
    /// Approved and executing.
    Approved,
    /// Refused by an approver or expired.
    Rejected,
    /// Executed; the response or error is recorded.
    Completed,
}

impl ForwardStatus {
    /// Name used in logs and serialized output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
        }
    }

    /// `Rejected` and `Completed` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Completed)
    }
}

impl fmt::Display for ForwardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One gateway-mediated delegation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardRequest {
    /// Unique id (uuid v4).
    pub request_id: String,
    /// Gateway session the request came through.
    pub source_session: String,
    /// Session the message is delegated into.
    pub target_session: String,
    /// Message text.
    pub message: String,
    /// Caller on whose behalf the gateway forwards.
    pub original_source: InjectionSource,
    /// Kind of action.
    pub action_type: ActionType,
    /// Current state.
    pub status: ForwardStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Approval deadline; set only while approval is required.
    pub expires_at: Option<DateTime<Utc>>,
    /// Executor response once completed.
    pub response: Option<String>,
    /// Failure or rejection reason.
    pub error: Option<String>,
}

impl ForwardRequest {
    /// New request in the `Pending` state.
    pub fn new(
        source_session: impl Into<String>,
        target_session: impl Into<String>,
        message: impl Into<String>,
        original_source: InjectionSource,
        action_type: ActionType,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            source_session: source_session.into(),
            target_session: target_session.into(),
            message: message.into(),
            original_source,
            action_type,
            status: ForwardStatus::Pending,
            created_at: Utc::now(),
            expires_at: None,
            response: None,
            error: None,
        }
    }

    /// Whether the approval deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }
}

/// Per-call forwarding options.
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    /// Kind of action being forwarded.
    pub action_type: ActionType,
    /// Execute immediately even when the rules require approval.
    pub bypass_approval: bool,
    /// Priority handed to the executor.
    pub priority: i32,
    /// Cancels the forwarded execution when fired.
    pub cancel: Option<CancellationToken>,
}

impl ForwardOptions {
    /// Options for `action_type` with everything else defaulted.
    pub fn action(action_type: ActionType) -> Self {
        Self {
            action_type,
            ..Self::default()
        }
    }
}

/// Successful result of a forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Executed in the target session.
    Completed {
        /// Request id.
        request_id: String,
        /// Executor response.
        response: String,
    },
    /// Stored until someone approves it.
    PendingApproval {
        /// Request id to approve or reject.
        request_id: String,
    },
}

impl ForwardOutcome {
    /// Id of the request this outcome belongs to.
    pub fn request_id(&self) -> &str {
        match self {
            Self::Completed { request_id, .. } | Self::PendingApproval { request_id } => request_id,
        }
    }
}

/// Why a forward did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardError {
    /// The session carries no gateway policy for this caller.
    #[error("session {session} is not a gateway")]
    NotAGateway {
        /// Session that was used as a gateway.
        session: String,
    },
    /// The rules do not allow forwarding to the target.
    #[error("gateway {gateway} may not forward to {target}")]
    InvalidForwardTarget {
        /// Gateway session.
        gateway: String,
        /// Requested target.
        target: String,
    },
    /// The rules do not allow this kind of action.
    #[error("action type {action} is not allowed by the gateway")]
    ActionNotAllowed {
        /// Requested action.
        action: ActionType,
    },
    /// The gateway does not accept this kind of caller.
    #[error("gateway does not accept {source_type} sources")]
    SourceNotAccepted {
        /// Type of the original source.
        source_type: SourceType,
    },
    /// The gateway exceeded its forward rate.
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
    /// No gateway session can route this source to the target.
    #[error("no gateway routes {source_label} to {target}")]
    NoGateway {
        /// Label of the source.
        source_label: String,
        /// Requested target.
        target: String,
    },
    /// Unknown request id.
    #[error("forward request {request_id} not found")]
    NotFound {
        /// Requested id.
        request_id: String,
    },
    /// The request already left the pending state.
    #[error("forward request {request_id} is not pending (status: {status})")]
    NotPending {
        /// Requested id.
        request_id: String,
        /// Its current status.
        status: ForwardStatus,
    },
    /// The approval deadline passed; the request is now rejected.
    #[error("forward request {request_id} expired before approval")]
    Expired {
        /// Requested id.
        request_id: String,
    },
    /// The stored request was refused because its forwarded context failed a
    /// policy check.
    #[error("forward request {request_id} refused: {violation}")]
    Refused {
        /// Request id.
        request_id: String,
        /// The failed check.
        violation: PolicyViolation,
    },
    /// The executor failed.
    #[error("forward request {request_id} failed: {error}")]
    Execution {
        /// Request id.
        request_id: String,
        /// Executor failure.
        error: ExecutionError,
    },
    /// The forwarded execution was cancelled.
    #[error("forward request {request_id} cancelled")]
    Cancelled {
        /// Request id.
        request_id: String,
    },
}

impl ForwardError {
    /// Request id when one was created.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::NotFound { request_id }
            | Self::NotPending { request_id, .. }
            | Self::Expired { request_id }
            | Self::Refused { request_id, .. }
            | Self::Execution { request_id, .. }
            | Self::Cancelled { request_id } => Some(request_id),
            _ => None,
        }
    }

    /// Returns `true` for the cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Flat view of a forward result for collaborators that want
/// `{success, response, error, request_id, requires_approval}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardResult {
    /// The forward executed successfully.
    pub success: bool,
    /// Executor response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Error description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Request id, when a request was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// The request waits for approval.
    pub requires_approval: bool,
}

impl From<&Result<ForwardOutcome, ForwardError>> for ForwardResult {
    fn from(result: &Result<ForwardOutcome, ForwardError>) -> Self {
        match result {
            Ok(ForwardOutcome::Completed {
                request_id,
                response,
            }) => Self {
                success: true,
                response: Some(response.clone()),
                error: None,
                request_id: Some(request_id.clone()),
                requires_approval: false,
            },
            Ok(ForwardOutcome::PendingApproval { request_id }) => Self {
                success: false,
                response: None,
                error: None,
                request_id: Some(request_id.clone()),
                requires_approval: true,
            },
            Err(e) => Self {
                success: false,
                response: None,
                error: Some(e.to_string()),
                request_id: e.request_id().map(str::to_owned),
                requires_approval: false,
            },
        }
    }
}

impl From<Result<ForwardOutcome, ForwardError>> for ForwardResult {
    fn from(result: Result<ForwardOutcome, ForwardError>) -> Self {
        Self::from(&result)
    }
}

/// Lifecycle notifications published by the forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForwardEvent {
    /// A request is waiting for approval.
    ApprovalRequested {
        /// Request id.
        request_id: String,
        /// Gateway session.
        gateway: String,
        /// Target session.
        target: String,
    },
    /// A pending request was approved.
    Approved {
        /// Request id.
        request_id: String,
    },
    /// A pending request was rejected.
    Rejected {
        /// Request id.
        request_id: String,
        /// Rejection reason.
        reason: String,
    },
    /// A pending request passed its deadline.
    Expired {
        /// Request id.
        request_id: String,
    },
    /// A request finished executing.
    Completed {
        /// Request id.
        request_id: String,
        /// Whether the execution succeeded.
        success: bool,
    },
}
