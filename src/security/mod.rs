//! Authorization: typed injection sources, policy resolution, and the
//! per-request [`SecurityContext`].

pub mod context;
pub mod current;
pub mod event;
pub mod policy;
pub mod rate_limit;
pub mod source;

pub use context::{
    api_context, cli_context, create_security_context, cron_context, daemon_context,
    p2p_context, p2p_discovery_context, plugin_context, AccessCheck, PolicyViolation,
    SecurityContext, ToolCheck,
};
pub use current::{ContextGuard, CurrentContexts};
pub use event::{SecurityEvent, SecurityEventType};
pub use policy::{
    ActionType, ConfigPolicyResolver, EnforcementMode, GatewayForwardRules, PluginRule,
    PolicyResolver, ResolvedPolicy, SandboxConfig,
};
pub use source::{InjectionSource, SourceIdentity, SourceType, TrustLevel};
