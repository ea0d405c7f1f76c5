//! Per-request security context.
//!
//! A [`SecurityContext`] binds one [`InjectionSource`] to one target session.
//! It resolves the policy lazily, at most once, and answers every capability,
//! session, and tool question from that single snapshot so answers cannot
//! shift mid-request. Every check appends a [`SecurityEvent`] to the
//! context's audit log.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::warn;

use super::event::{SecurityEvent, SecurityEventType};
use super::policy::{
    any_label_matches, EnforcementMode, GatewayForwardRules, PolicyResolver, ResolvedPolicy,
    SandboxConfig,
};
use super::source::{capability_set_allows, InjectionSource, TrustLevel, CAP_INJECT};

// ---------------------------------------------------------------------------
// Check results and violations
// ---------------------------------------------------------------------------

/// Outcome of a session admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCheck {
    /// Whether the source may inject into the session.
    pub allowed: bool,
    /// Why access was refused.
    pub reason: Option<String>,
}

/// Outcome of a tool check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCheck {
    /// Whether the tool may be used.
    pub allowed: bool,
    /// Why the tool was refused.
    pub reason: Option<String>,
    /// Set in warn mode when the tool would have been refused; callers must log it.
    pub warning: Option<String>,
}

/// A failed capability, session, or tool check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    /// The source lacks a capability.
    #[error("{source_label} lacks capability {capability}")]
    CapabilityDenied {
        /// Identity label of the source.
        source_label: String,
        /// The missing capability.
        capability: String,
    },
    /// The source may not inject into the session.
    #[error("access to session {session} denied: {reason}")]
    SessionDenied {
        /// Target session.
        session: String,
        /// Why access was refused.
        reason: String,
    },
    /// The source may not use the tool.
    #[error("tool {tool} denied: {reason}")]
    ToolDenied {
        /// Tool name.
        tool: String,
        /// Why the tool was refused.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// SecurityContext
// ---------------------------------------------------------------------------

/// Authorization state for one request against one session.
pub struct SecurityContext {
    source: InjectionSource,
    session: String,
    resolver: Arc<dyn PolicyResolver>,
    /// Upper bound on capabilities, set on contexts derived for forwarding.
    capability_ceiling: Option<BTreeSet<String>>,
    policy: OnceLock<ResolvedPolicy>,
    events: Mutex<Vec<SecurityEvent>>,
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("source", &self.source)
            .field("session", &self.session)
            .field("capability_ceiling", &self.capability_ceiling)
            .field("policy", &self.policy.get())
            .finish_non_exhaustive()
    }
}

impl SecurityContext {
    /// Create a context for `source` injecting into `session`.
    pub fn new(
        source: InjectionSource,
        session: impl Into<String>,
        resolver: Arc<dyn PolicyResolver>,
    ) -> Self {
        Self {
            source,
            session: session.into(),
            resolver,
            capability_ceiling: None,
            policy: OnceLock::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// The attributed source.
    pub fn source(&self) -> &InjectionSource {
        &self.source
    }

    /// The target session.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Trust level of the source.
    pub fn trust_level(&self) -> TrustLevel {
        self.source.trust_level
    }

    /// The resolved policy. Resolved on first call and cached for the
    /// lifetime of the context.
    pub fn policy(&self) -> &ResolvedPolicy {
        self.policy.get_or_init(|| {
            let mut policy = self.resolver.resolve(&self.source, &self.session);
            if let Some(ceiling) = &self.capability_ceiling {
                policy.capabilities = ceiling
                    .iter()
                    .filter(|cap| capability_set_allows(&policy.capabilities, cap))
                    .cloned()
                    .collect();
            }
            policy
        })
    }

    /// Whether the source holds `capability`.
    pub fn has_capability(&self, capability: &str) -> bool {
        let allowed = self.policy().allows(capability);
        self.record(
            SecurityEvent::new(SecurityEventType::CapabilityCheck, allowed)
                .with_capability(capability),
        );
        allowed
    }

    /// Whether the source may inject into the target session.
    ///
    /// Deny patterns win, then the `inject` capability is required, then an
    /// explicit allow pattern admits, and finally the trust level must reach
    /// the session's minimum.
    pub fn can_access_session(&self) -> AccessCheck {
        let policy = self.policy();
        let label = self.source.label();
        let refusal = if any_label_matches(&policy.access.deny, &self.source) {
            Some(format!("{label} is explicitly denied"))
        } else if !policy.allows(CAP_INJECT) {
            Some(format!("{label} lacks capability {CAP_INJECT}"))
        } else if any_label_matches(&policy.access.allow, &self.source) {
            None
        } else if self.source.trust_level < policy.access.min_trust {
            Some(format!(
                "trust level {} is below required {}",
                self.source.trust_level, policy.access.min_trust
            ))
        } else {
            None
        };

        let event = match &refusal {
            None => SecurityEvent::new(SecurityEventType::AccessGranted, true),
            Some(reason) => {
                SecurityEvent::new(SecurityEventType::AccessDenied, false).with_reason(reason.clone())
            }
        };
        self.record(event);

        AccessCheck {
            allowed: refusal.is_none(),
            reason: refusal,
        }
    }

    /// Whether the source may use `tool` in the target session.
    ///
    /// In warn mode a refused tool is reported as allowed with `warning` set,
    /// and the warning is logged here as well.
    pub fn can_use_tool(&self, tool: &str) -> ToolCheck {
        let policy = self.policy();
        let refusal = if policy.tools.denied.iter().any(|t| t == tool) {
            Some(format!("tool {tool} is denied in session {}", self.session))
        } else if policy
            .tools
            .allowed
            .as_ref()
            .is_some_and(|allowed| !allowed.iter().any(|t| t == tool))
        {
            Some(format!("tool {tool} is not allowed in session {}", self.session))
        } else {
            let capability = policy.tools.capability_for(tool);
            (!policy.allows(capability)).then(|| format!("missing capability {capability}"))
        };

        let check = match refusal {
            None => ToolCheck {
                allowed: true,
                reason: None,
                warning: None,
            },
            Some(reason) if policy.enforcement == EnforcementMode::Warn => {
                warn!(
                    source = %self.source,
                    session = %self.session,
                    tool,
                    reason = %reason,
                    "tool policy violation allowed in warn mode"
                );
                ToolCheck {
                    allowed: true,
                    reason: None,
                    warning: Some(reason),
                }
            }
            Some(reason) => ToolCheck {
                allowed: false,
                reason: Some(reason),
                warning: None,
            },
        };

        let mut event = SecurityEvent::new(SecurityEventType::ToolCheck, check.allowed).with_tool(tool);
        if let Some(reason) = check.reason.as_ref().or(check.warning.as_ref()) {
            event = event.with_reason(reason.clone());
        }
        self.record(event);
        check
    }

    /// The subset of `tools` the source may use, in input order.
    pub fn filter_tools<S: AsRef<str>>(&self, tools: &[S]) -> Vec<String> {
        tools
            .iter()
            .map(AsRef::as_ref)
            .filter(|tool| self.can_use_tool(tool).allowed)
            .map(str::to_owned)
            .collect()
    }

    /// Whether execution must happen in a sandbox.
    pub fn requires_sandbox(&self) -> bool {
        self.policy().sandbox.is_some()
    }

    /// Sandbox limits, when a sandbox is required.
    pub fn sandbox_config(&self) -> Option<&SandboxConfig> {
        self.policy().sandbox.as_ref()
    }

    /// Whether the target session is a gateway.
    pub fn is_gateway(&self) -> bool {
        self.policy().is_gateway
    }

    /// Whether the target session may forward requests.
    pub fn can_forward(&self) -> bool {
        self.policy().can_forward
    }

    /// Forward rules of the target session, when it is a gateway.
    pub fn forward_rules(&self) -> Option<&GatewayForwardRules> {
        self.policy().forward_rules.as_ref()
    }

    /// Whether the source must inject through a gateway.
    pub fn requires_gateway(&self) -> bool {
        self.policy().requires_gateway
    }

    /// Build the context a forwarded call runs under in `target`.
    ///
    /// The child is attributed to this context's session as a `gateway`
    /// source at exactly `semi-trusted`, and its capabilities are capped at
    /// the forward rules' allow-list. This context is left untouched apart
    /// from an audit entry.
    pub fn derive_for_forward(&self, target: impl Into<String>) -> SecurityContext {
        let target = target.into();
        let ceiling: BTreeSet<String> = self
            .forward_rules()
            .map(|rules| rules.allowed_capabilities.iter().cloned().collect())
            .unwrap_or_default();
        let source = InjectionSource::gateway(
            self.session.clone(),
            Some(self.source.label()),
            ceiling.clone(),
        );

        self.record(
            SecurityEvent::new(SecurityEventType::ForwardDerived, true)
                .with_reason(format!("forward to {target}")),
        );

        SecurityContext {
            source,
            session: target,
            resolver: Arc::clone(&self.resolver),
            capability_ceiling: Some(ceiling),
            policy: OnceLock::new(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// [`has_capability`](Self::has_capability) as a `Result`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyViolation::CapabilityDenied`] when the capability is missing.
    pub fn require_capability(&self, capability: &str) -> Result<(), PolicyViolation> {
        if self.has_capability(capability) {
            return Ok(());
        }
        Err(PolicyViolation::CapabilityDenied {
            source_label: self.source.label(),
            capability: capability.to_owned(),
        })
    }

    /// [`can_access_session`](Self::can_access_session) as a `Result`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyViolation::SessionDenied`] when access is refused.
    pub fn require_session_access(&self) -> Result<(), PolicyViolation> {
        let check = self.can_access_session();
        if check.allowed {
            return Ok(());
        }
        Err(PolicyViolation::SessionDenied {
            session: self.session.clone(),
            reason: check.reason.unwrap_or_default(),
        })
    }

    /// [`can_use_tool`](Self::can_use_tool) as a `Result`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyViolation::ToolDenied`] when the tool is refused.
    pub fn require_tool(&self, tool: &str) -> Result<(), PolicyViolation> {
        let check = self.can_use_tool(tool);
        if check.allowed {
            return Ok(());
        }
        Err(PolicyViolation::ToolDenied {
            tool: tool.to_owned(),
            reason: check.reason.unwrap_or_default(),
        })
    }

    /// Copy of the audit log.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, event: SecurityEvent) {
        event.trace(&self.source.label(), &self.session);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

/// Create a context for any source.
pub fn create_security_context(
    source: InjectionSource,
    session: impl Into<String>,
    resolver: Arc<dyn PolicyResolver>,
) -> SecurityContext {
    SecurityContext::new(source, session, resolver)
}

/// Context for the interactive CLI.
pub fn cli_context(session: impl Into<String>, resolver: Arc<dyn PolicyResolver>) -> SecurityContext {
    SecurityContext::new(InjectionSource::cli(None), session, resolver)
}

/// Context for the daemon itself.
pub fn daemon_context(
    session: impl Into<String>,
    resolver: Arc<dyn PolicyResolver>,
) -> SecurityContext {
    SecurityContext::new(InjectionSource::daemon(), session, resolver)
}

/// Context for a plugin.
pub fn plugin_context(
    plugin: impl Into<String>,
    session: impl Into<String>,
    resolver: Arc<dyn PolicyResolver>,
) -> SecurityContext {
    SecurityContext::new(InjectionSource::plugin(plugin), session, resolver)
}

/// Context for a scheduled job.
pub fn cron_context(
    job: impl Into<String>,
    session: impl Into<String>,
    resolver: Arc<dyn PolicyResolver>,
) -> SecurityContext {
    SecurityContext::new(InjectionSource::cron(job), session, resolver)
}

/// Context for an API client.
pub fn api_context(
    key_id: impl Into<String>,
    trust_level: TrustLevel,
    session: impl Into<String>,
    resolver: Arc<dyn PolicyResolver>,
) -> SecurityContext {
    SecurityContext::new(InjectionSource::api(key_id, trust_level), session, resolver)
}

/// Context for a connected P2P peer.
pub fn p2p_context(
    peer_key: impl Into<String>,
    trust_level: TrustLevel,
    grants: Option<BTreeSet<String>>,
    session: impl Into<String>,
    resolver: Arc<dyn PolicyResolver>,
) -> SecurityContext {
    SecurityContext::new(
        InjectionSource::p2p(peer_key, trust_level, grants, None),
        session,
        resolver,
    )
}

/// Context for a peer reached through discovery.
pub fn p2p_discovery_context(
    peer_key: impl Into<String>,
    topic: Option<String>,
    session: impl Into<String>,
    resolver: Arc<dyn PolicyResolver>,
) -> SecurityContext {
    SecurityContext::new(
        InjectionSource::p2p_discovery(peer_key, topic),
        session,
        resolver,
    )
}
