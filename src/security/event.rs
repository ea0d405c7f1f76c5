//! Audit records produced by security checks.
//!
//! Events are written once and never read back for decisions. Each one is
//! also emitted as a `tracing` record so the daemon's log carries the audit
//! trail without a separate sink.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

/// Kind of security check that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    /// A capability lookup.
    CapabilityCheck,
    /// Session admission succeeded.
    AccessGranted,
    /// Session admission failed.
    AccessDenied,
    /// A tool check.
    ToolCheck,
    /// A forwarded child context was derived.
    ForwardDerived,
}

/// One audit entry in a [`SecurityContext`](super::context::SecurityContext) log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityEvent {
    /// Kind of check.
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Outcome of the check.
    pub allowed: bool,
    /// Why the check failed (or why it passed with a warning).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Tool the check concerned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Capability the check concerned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

impl SecurityEvent {
    /// New event stamped with the current time.
    pub fn new(event_type: SecurityEventType, allowed: bool) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            allowed,
            reason: None,
            tool: None,
            capability: None,
        }
    }

    /// Attach a reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach the tool name.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Attach the capability name.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    /// Mirror the event into the log. Denials log at `info`, the rest at `debug`.
    pub(crate) fn trace(&self, source: &str, session: &str) {
        if self.allowed {
            debug!(
                event = ?self.event_type,
                source,
                session,
                tool = ?self.tool,
                capability = ?self.capability,
                "security check passed"
            );
        } else {
            info!(
                event = ?self.event_type,
                source,
                session,
                tool = ?self.tool,
                capability = ?self.capability,
                reason = ?self.reason,
                "security check denied"
            );
        }
    }
}
