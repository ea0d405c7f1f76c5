//! Policy resolution: from an injection source and a target session to a
//! [`ResolvedPolicy`].
//!
//! Resolution layers, in order:
//! 1. global default capabilities
//! 2. trust-level defaults (missing levels fall back to `untrusted`)
//! 3. capabilities granted on the source itself
//! 4. the target session's rule (may widen or restrict)
//! 5. plugin-registered rules, in registration order (widen only)
//!
//! The result is a plain value. It never changes after it is produced; a
//! [`SecurityContext`](super::context::SecurityContext) caches exactly one.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{SecurityConfig, TrustLevelConfig};

use super::source::{capability_set_allows, label_matches, InjectionSource, SourceType, TrustLevel};

// ---------------------------------------------------------------------------
// Policy building blocks
// ---------------------------------------------------------------------------

/// Whether violations are blocked or only reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Failed checks deny the operation.
    #[default]
    Enforce,
    /// Failed checks are allowed but carry a warning the caller must log.
    Warn,
}

impl EnforcementMode {
    /// Config name of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enforce => "enforce",
            Self::Warn => "warn",
        }
    }
}

/// Resource limits for an isolated execution environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Memory limit in megabytes.
    #[serde(default = "default_sandbox_memory_mb")]
    pub memory_mb: u32,
    /// CPU core limit.
    #[serde(default = "default_sandbox_cpu_cores")]
    pub cpu_cores: f64,
    /// Whether the sandbox may reach the network.
    #[serde(default)]
    pub network: bool,
    /// Wall-clock limit per execution in seconds.
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_mb: default_sandbox_memory_mb(),
            cpu_cores: default_sandbox_cpu_cores(),
            network: false,
            timeout_secs: default_sandbox_timeout_secs(),
        }
    }
}

fn default_sandbox_memory_mb() -> u32 {
    512
}
fn default_sandbox_cpu_cores() -> f64 {
    1.0
}
fn default_sandbox_timeout_secs() -> u64 {
    300
}

/// Kind of action a gateway forwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Plain conversational message.
    #[default]
    Message,
    /// Read-only question about the target session.
    Query,
    /// Instruction expected to change state.
    Command,
}

impl ActionType {
    /// Config name of the action type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Query => "query",
            Self::Command => "command",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rules that make a session a gateway and bound what it may forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayForwardRules {
    /// Sessions the gateway may forward into; `"*"` means any other session.
    #[serde(default)]
    pub allowed_targets: Vec<String>,
    /// Action types the gateway may forward; empty means any.
    #[serde(default)]
    pub allowed_action_types: Vec<ActionType>,
    /// Source types whose requests the gateway accepts; empty means any.
    #[serde(default)]
    pub accept_sources: Vec<SourceType>,
    /// Capabilities a forwarded call carries into the target session.
    #[serde(default = "default_forward_capabilities")]
    pub allowed_capabilities: Vec<String>,
    /// Whether forwarded requests wait for human approval.
    #[serde(default)]
    pub require_approval: bool,
    /// Maximum forwards per minute through this gateway.
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
}

impl Default for GatewayForwardRules {
    fn default() -> Self {
        Self {
            allowed_targets: Vec::new(),
            allowed_action_types: Vec::new(),
            accept_sources: Vec::new(),
            allowed_capabilities: default_forward_capabilities(),
            require_approval: false,
            rate_limit_per_minute: None,
        }
    }
}

fn default_forward_capabilities() -> Vec<String> {
    vec![super::source::CAP_INJECT.to_owned()]
}

impl GatewayForwardRules {
    /// Whether `gateway` may forward into `target`. A gateway never targets itself.
    pub fn allows_target(&self, gateway: &str, target: &str) -> bool {
        if gateway == target {
            return false;
        }
        self.allowed_targets
            .iter()
            .any(|pattern| session_matches(pattern, target))
    }

    /// Whether the action type is forwardable.
    pub fn allows_action(&self, action: ActionType) -> bool {
        self.allowed_action_types.is_empty() || self.allowed_action_types.contains(&action)
    }

    /// Whether requests from this source type are accepted.
    pub fn accepts_source(&self, source_type: SourceType) -> bool {
        self.accept_sources.is_empty() || self.accept_sources.contains(&source_type)
    }
}

/// Whether a session-name pattern matches. Supports `"*"` and trailing `*`.
pub fn session_matches(pattern: &str, session: &str) -> bool {
    if pattern == "*" || pattern == session {
        return true;
    }
    pattern
        .strip_suffix('*')
        .is_some_and(|prefix| session.starts_with(prefix))
}

/// Who may inject into the target session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionAccess {
    /// Minimum trust level for callers without an explicit rule.
    pub min_trust: TrustLevel,
    /// Identity-label patterns that are always admitted.
    pub allow: Vec<String>,
    /// Identity-label patterns that are always refused. Checked first.
    pub deny: Vec<String>,
}

/// Tool restrictions for the target session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolPolicy {
    /// If set, only these tools may be used.
    pub allowed: Option<Vec<String>>,
    /// Tools that may never be used.
    pub denied: Vec<String>,
    /// Capability required per tool name.
    pub required_capability: BTreeMap<String, String>,
    /// Capability required by tools without an explicit mapping.
    pub default_capability: String,
}

impl ToolPolicy {
    /// Capability a caller needs to use `tool`.
    pub fn capability_for(&self, tool: &str) -> &str {
        self.required_capability
            .get(tool)
            .map_or(self.default_capability.as_str(), String::as_str)
    }
}

/// The effective policy for one (source, session) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPolicy {
    /// Trust level the policy was resolved for.
    pub trust_level: TrustLevel,
    /// Granted capability patterns.
    pub capabilities: BTreeSet<String>,
    /// Mandatory sandbox, if any.
    pub sandbox: Option<SandboxConfig>,
    /// Whether the target session is a gateway.
    pub is_gateway: bool,
    /// Whether the target session may forward anywhere.
    pub can_forward: bool,
    /// Forward rules when the session is a gateway.
    pub forward_rules: Option<GatewayForwardRules>,
    /// Whether the source must go through a gateway instead of injecting directly.
    pub requires_gateway: bool,
    /// Session admission rules.
    pub access: SessionAccess,
    /// Tool restrictions.
    pub tools: ToolPolicy,
    /// Enforcement mode for tool checks.
    pub enforcement: EnforcementMode,
}

impl ResolvedPolicy {
    /// Whether the capability set covers `capability`.
    pub fn allows(&self, capability: &str) -> bool {
        capability_set_allows(&self.capabilities, capability)
    }
}

// ---------------------------------------------------------------------------
// Plugin rules
// ---------------------------------------------------------------------------

/// Which requests a plugin rule applies to. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleMatch {
    /// Name of the plugin the source must be.
    pub source_plugin: Option<String>,
    /// Target session pattern.
    pub session: Option<String>,
}

impl RuleMatch {
    /// Whether the rule applies to `source` injecting into `session`.
    pub fn matches(&self, source: &InjectionSource, session: &str) -> bool {
        let plugin_ok = self
            .source_plugin
            .as_deref()
            .map_or(true, |wanted| source.plugin_name() == Some(wanted));
        let session_ok = self
            .session
            .as_deref()
            .map_or(true, |pattern| session_matches(pattern, session));
        plugin_ok && session_ok
    }
}

/// A policy rule registered at runtime by a plugin.
///
/// Rules only ever widen: they add capabilities, impose a sandbox, or mark a
/// session as a gateway. They cannot take away what an earlier layer granted.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginRule {
    /// Plugin that registered the rule.
    pub plugin: String,
    /// When the rule applies.
    pub matcher: RuleMatch,
    /// Capabilities added when the rule applies.
    pub add_capabilities: BTreeSet<String>,
    /// Sandbox imposed when the rule applies.
    pub sandbox: Option<SandboxConfig>,
    /// Gateway rules for the matched session.
    pub gateway: Option<GatewayForwardRules>,
}

impl PluginRule {
    /// Empty rule owned by `plugin` that matches everything.
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            matcher: RuleMatch::default(),
            add_capabilities: BTreeSet::new(),
            sandbox: None,
            gateway: None,
        }
    }

    /// Restrict the rule to sources that are the named plugin.
    pub fn for_source_plugin(mut self, name: impl Into<String>) -> Self {
        self.matcher.source_plugin = Some(name.into());
        self
    }

    /// Restrict the rule to sessions matching `pattern`.
    pub fn for_session(mut self, pattern: impl Into<String>) -> Self {
        self.matcher.session = Some(pattern.into());
        self
    }

    /// Add a capability.
    pub fn grant(mut self, capability: impl Into<String>) -> Self {
        self.add_capabilities.insert(capability.into());
        self
    }

    /// Require a sandbox.
    pub fn require_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Mark the matched session as a gateway.
    pub fn gateway(mut self, rules: GatewayForwardRules) -> Self {
        self.gateway = Some(rules);
        self
    }

    fn apply(&self, state: &mut ResolutionState) {
        state
            .capabilities
            .extend(self.add_capabilities.iter().cloned());
        if let Some(sandbox) = &self.sandbox {
            state.sandbox = Some(sandbox.clone());
        }
        if let Some(rules) = &self.gateway {
            state.forward_rules = Some(rules.clone());
        }
    }
}

/// Mutable accumulator used while layering rules.
struct ResolutionState {
    capabilities: BTreeSet<String>,
    sandbox: Option<SandboxConfig>,
    forward_rules: Option<GatewayForwardRules>,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Source of policy decisions for security contexts and the gateway.
pub trait PolicyResolver: Send + Sync {
    /// Resolve the effective policy for `source` injecting into `session`.
    fn resolve(&self, source: &InjectionSource, session: &str) -> ResolvedPolicy;

    /// Forward rules of `session`, or `None` if it is not a gateway.
    fn forward_rules(&self, session: &str) -> Option<GatewayForwardRules>;

    /// A gateway that accepts `source` and may forward into `target`.
    fn find_gateway_for_source(&self, source: &InjectionSource, target: &str) -> Option<String>;
}

/// Resolver backed by a [`SecurityConfig`] snapshot plus plugin rules.
#[derive(Debug)]
pub struct ConfigPolicyResolver {
    security: Arc<SecurityConfig>,
    rules: RwLock<Vec<PluginRule>>,
}

impl ConfigPolicyResolver {
    /// Create a resolver over a configuration snapshot.
    pub fn new(security: SecurityConfig) -> Self {
        Self {
            security: Arc::new(security),
            rules: RwLock::new(Vec::new()),
        }
    }

    /// The configuration snapshot in use.
    pub fn security(&self) -> &SecurityConfig {
        &self.security
    }

    /// Append a plugin rule. Rules apply in registration order.
    pub fn register_rule(&self, rule: PluginRule) {
        debug!(plugin = %rule.plugin, matcher = ?rule.matcher, "registering policy rule");
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule);
    }

    /// Remove every rule registered by `plugin`, returning how many were removed.
    pub fn unregister_plugin(&self, plugin: &str) -> usize {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = rules.len();
        rules.retain(|rule| rule.plugin != plugin);
        before.saturating_sub(rules.len())
    }

    /// Snapshot of the registered plugin rules.
    pub fn rules(&self) -> Vec<PluginRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Trust-level entry for `level`, falling back to the `untrusted` entry.
    fn trust_level_config(&self, level: TrustLevel) -> Option<&TrustLevelConfig> {
        self.security
            .trust_levels
            .get(level.as_str())
            .or_else(|| self.security.trust_levels.get(TrustLevel::Untrusted.as_str()))
    }

    /// Names of every session that is a gateway through config or a plugin rule.
    fn gateway_candidates(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self
            .security
            .sessions
            .iter()
            .filter(|(_, rule)| rule.gateway.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        names.extend(
            rules
                .iter()
                .filter(|rule| rule.gateway.is_some() && rule.matcher.source_plugin.is_none())
                .filter_map(|rule| rule.matcher.session.clone())
                .filter(|pattern| !pattern.contains('*')),
        );
        names
    }
}

impl PolicyResolver for ConfigPolicyResolver {
    fn resolve(&self, source: &InjectionSource, session: &str) -> ResolvedPolicy {
        let security = &self.security;
        let mut state = ResolutionState {
            capabilities: security.default_capabilities.iter().cloned().collect(),
            sandbox: None,
            forward_rules: None,
        };
        let mut requires_gateway = false;

        if let Some(level) = self.trust_level_config(source.trust_level) {
            state
                .capabilities
                .extend(level.capabilities.iter().cloned());
            state.sandbox = level.sandbox.clone();
            requires_gateway = level.require_gateway;
        }

        if let Some(grants) = &source.granted_capabilities {
            state.capabilities.extend(grants.iter().cloned());
        }

        let mut access = SessionAccess {
            min_trust: security.default_min_trust,
            allow: Vec::new(),
            deny: Vec::new(),
        };
        let mut tools = ToolPolicy {
            allowed: None,
            denied: Vec::new(),
            required_capability: security.tools.clone(),
            default_capability: security.default_tool_capability.clone(),
        };

        if let Some(rule) = security.sessions.get(session) {
            state
                .capabilities
                .extend(rule.grant_capabilities.iter().cloned());
            for revoked in &rule.revoke_capabilities {
                state.capabilities.remove(revoked);
            }
            if rule.disable_sandbox {
                state.sandbox = None;
            }
            if let Some(sandbox) = &rule.sandbox {
                state.sandbox = Some(sandbox.clone());
            }
            if let Some(min_trust) = rule.min_trust {
                access.min_trust = min_trust;
            }
            access.allow.clone_from(&rule.allow);
            access.deny.clone_from(&rule.deny);
            tools.allowed.clone_from(&rule.allowed_tools);
            tools.denied.clone_from(&rule.denied_tools);
            state.forward_rules.clone_from(&rule.gateway);
        }

        {
            let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
            for rule in rules.iter().filter(|rule| rule.matcher.matches(source, session)) {
                rule.apply(&mut state);
            }
        }

        let is_gateway = state.forward_rules.is_some();
        let can_forward = state
            .forward_rules
            .as_ref()
            .is_some_and(|rules| !rules.allowed_targets.is_empty());

        debug!(
            source = %source,
            session,
            capabilities = state.capabilities.len(),
            sandbox = state.sandbox.is_some(),
            is_gateway,
            "policy resolved"
        );

        ResolvedPolicy {
            trust_level: source.trust_level,
            capabilities: state.capabilities,
            sandbox: state.sandbox,
            is_gateway,
            can_forward,
            forward_rules: state.forward_rules,
            requires_gateway,
            access,
            tools,
            enforcement: security.enforcement,
        }
    }

    fn forward_rules(&self, session: &str) -> Option<GatewayForwardRules> {
        let mut found = self
            .security
            .sessions
            .get(session)
            .and_then(|rule| rule.gateway.clone());
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        for rule in rules.iter() {
            let session_hit = rule
                .matcher
                .session
                .as_deref()
                .is_some_and(|pattern| session_matches(pattern, session));
            if session_hit && rule.matcher.source_plugin.is_none() {
                if let Some(gateway) = &rule.gateway {
                    found = Some(gateway.clone());
                }
            }
        }
        found
    }

    fn find_gateway_for_source(&self, source: &InjectionSource, target: &str) -> Option<String> {
        self.gateway_candidates().into_iter().find(|gateway| {
            self.forward_rules(gateway).is_some_and(|rules| {
                rules.accepts_source(source.source_type) && rules.allows_target(gateway, target)
            })
        })
    }
}

/// Whether any identity pattern in `patterns` matches the source.
pub(crate) fn any_label_matches(patterns: &[String], source: &InjectionSource) -> bool {
    let label = source.label();
    patterns
        .iter()
        .any(|pattern| label_matches(pattern, &label))
}
