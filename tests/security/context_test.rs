//! Tests for `SecurityContext`.

use std::collections::BTreeSet;
use std::sync::Arc;

use conduit::config::{SecurityConfig, SessionRuleConfig};
use conduit::security::source::{CAP_CROSS_READ, CAP_INJECT, CAP_INJECT_EXEC, CAP_INJECT_TOOLS};
use conduit::security::{
    api_context, cli_context, create_security_context, cron_context, daemon_context, p2p_context,
    p2p_discovery_context, plugin_context, ConfigPolicyResolver, EnforcementMode,
    GatewayForwardRules, InjectionSource, PluginRule, PolicyResolver, PolicyViolation,
    SecurityContext, SecurityEventType, SourceIdentity, SourceType, TrustLevel,
};

fn resolver_with(security: SecurityConfig) -> Arc<ConfigPolicyResolver> {
    Arc::new(ConfigPolicyResolver::new(security))
}

fn dyn_resolver(security: SecurityConfig) -> Arc<dyn PolicyResolver> {
    resolver_with(security)
}

fn session(name: &str, rule: SessionRuleConfig) -> SecurityConfig {
    let mut security = SecurityConfig::default();
    security.sessions.insert(name.to_owned(), rule);
    security
}

fn gateway_config() -> SecurityConfig {
    session(
        "gw",
        SessionRuleConfig {
            gateway: Some(GatewayForwardRules {
                allowed_targets: vec!["main".to_owned()],
                allowed_capabilities: vec![CAP_INJECT.to_owned(), CAP_CROSS_READ.to_owned()],
                ..GatewayForwardRules::default()
            }),
            ..SessionRuleConfig::default()
        },
    )
}

#[test]
fn capability_checks_are_audited() {
    let ctx = cli_context("main", dyn_resolver(SecurityConfig::default()));
    assert!(ctx.has_capability(CAP_INJECT_EXEC));

    let events = ctx.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, SecurityEventType::CapabilityCheck);
    assert!(events[0].allowed);
    assert_eq!(events[0].capability.as_deref(), Some(CAP_INJECT_EXEC));
}

#[test]
fn session_access_uses_minimum_trust() {
    let resolver = dyn_resolver(session(
        "private",
        SessionRuleConfig {
            min_trust: Some(TrustLevel::Owner),
            ..SessionRuleConfig::default()
        },
    ));

    assert!(cli_context("private", Arc::clone(&resolver)).can_access_session().allowed);

    let plugin = plugin_context("memory", "private", Arc::clone(&resolver));
    let check = plugin.can_access_session();
    assert!(!check.allowed);
    assert!(check.reason.expect("reason").contains("below required"));
    assert_eq!(plugin.events()[0].event_type, SecurityEventType::AccessDenied);

    // Default minimum is semi-trusted.
    let api = api_context("key", TrustLevel::SemiTrusted, "open", Arc::clone(&resolver));
    assert!(api.can_access_session().allowed);
    let peer = p2p_discovery_context("peer", None, "open", resolver);
    assert!(!peer.can_access_session().allowed);
}

#[test]
fn explicit_allow_and_deny() {
    let resolver = dyn_resolver(session(
        "lobby",
        SessionRuleConfig {
            allow: vec!["p2p:friend".to_owned()],
            deny: vec!["cron".to_owned()],
            ..SessionRuleConfig::default()
        },
    ));

    let friend = p2p_context("friend", TrustLevel::Untrusted, None, "lobby", Arc::clone(&resolver));
    assert!(friend.can_access_session().allowed);

    let stranger = p2p_context("stranger", TrustLevel::Untrusted, None, "lobby", Arc::clone(&resolver));
    assert!(!stranger.can_access_session().allowed);

    let job = cron_context("nightly", "lobby", resolver);
    let check = job.can_access_session();
    assert!(!check.allowed);
    assert!(check.reason.expect("reason").contains("explicitly denied"));
}

#[test]
fn access_requires_inject_capability() {
    let resolver = dyn_resolver(session(
        "mute",
        SessionRuleConfig {
            revoke_capabilities: vec![CAP_INJECT.to_owned()],
            ..SessionRuleConfig::default()
        },
    ));
    let ctx = api_context("key", TrustLevel::Trusted, "mute", resolver);
    let err = ctx.require_session_access().unwrap_err();
    assert!(matches!(err, PolicyViolation::SessionDenied { .. }));
}

#[test]
fn filter_tools_keeps_only_allowed_in_order() {
    let resolver = dyn_resolver(session(
        "main",
        SessionRuleConfig {
            allowed_tools: Some(vec!["b".to_owned()]),
            ..SessionRuleConfig::default()
        },
    ));
    let ctx = cli_context("main", resolver);
    assert_eq!(ctx.filter_tools(&["a", "b", "c"]), vec!["b".to_owned()]);
}

#[test]
fn tool_checks() {
    let mut security = session(
        "main",
        SessionRuleConfig {
            denied_tools: vec!["shell".to_owned()],
            ..SessionRuleConfig::default()
        },
    );
    security
        .tools
        .insert("deploy".to_owned(), CAP_INJECT_EXEC.to_owned());
    let resolver = dyn_resolver(security);

    let owner = cli_context("main", Arc::clone(&resolver));
    assert!(!owner.can_use_tool("shell").allowed);
    assert!(owner.can_use_tool("deploy").allowed);

    let api = api_context("key", TrustLevel::SemiTrusted, "main", Arc::clone(&resolver));
    assert!(api.can_use_tool("search").allowed);
    let deploy = api.can_use_tool("deploy");
    assert!(!deploy.allowed);
    assert!(deploy.reason.expect("reason").contains(CAP_INJECT_EXEC));
    assert!(matches!(
        api.require_tool("deploy"),
        Err(PolicyViolation::ToolDenied { .. })
    ));

    let peer = p2p_context("peer", TrustLevel::Untrusted, None, "main", resolver);
    assert!(!peer.can_use_tool("search").allowed, "untrusted lacks {CAP_INJECT_TOOLS}");
}

#[test]
fn warn_mode_allows_with_warning() {
    let mut security = session(
        "main",
        SessionRuleConfig {
            denied_tools: vec!["shell".to_owned()],
            ..SessionRuleConfig::default()
        },
    );
    security.enforcement = EnforcementMode::Warn;
    let ctx = cli_context("main", dyn_resolver(security));

    let check = ctx.can_use_tool("shell");
    assert!(check.allowed);
    assert!(check.reason.is_none());
    assert!(check.warning.expect("warning").contains("shell"));
    assert_eq!(ctx.filter_tools(&["shell"]), vec!["shell".to_owned()]);
}

#[test]
fn policy_is_resolved_once_per_context() {
    let resolver = resolver_with(SecurityConfig::default());
    let shared: Arc<dyn PolicyResolver> = resolver.clone();
    let ctx = api_context("key", TrustLevel::SemiTrusted, "main", Arc::clone(&shared));
    assert!(!ctx.has_capability(CAP_CROSS_READ));

    resolver.register_rule(PluginRule::new("late").grant(CAP_CROSS_READ));

    // The existing context keeps its answer; a new one sees the rule.
    assert!(!ctx.has_capability(CAP_CROSS_READ));
    let fresh = api_context("key", TrustLevel::SemiTrusted, "main", shared);
    assert!(fresh.has_capability(CAP_CROSS_READ));
}

#[test]
fn sandbox_queries() {
    let resolver = dyn_resolver(SecurityConfig::default());
    let peer = p2p_context("peer", TrustLevel::Untrusted, None, "main", Arc::clone(&resolver));
    assert!(peer.requires_sandbox());
    assert!(peer.sandbox_config().is_some());

    let daemon = daemon_context("main", resolver);
    assert!(!daemon.requires_sandbox());
    assert!(daemon.sandbox_config().is_none());
}

#[test]
fn gateway_queries() {
    let resolver = dyn_resolver(gateway_config());
    let gw = cli_context("gw", Arc::clone(&resolver));
    assert!(gw.is_gateway());
    assert!(gw.can_forward());
    assert_eq!(
        gw.forward_rules().map(|r| r.allowed_targets.clone()),
        Some(vec!["main".to_owned()])
    );

    let main = cli_context("main", resolver);
    assert!(!main.is_gateway());
    assert!(!main.can_forward());
}

#[test]
fn derived_context_is_semi_trusted_gateway() {
    let resolver = dyn_resolver(gateway_config());
    let sources = [
        InjectionSource::cli(None),
        InjectionSource::plugin("bridge"),
        InjectionSource::p2p("peer", TrustLevel::Untrusted, None, None),
    ];

    for source in sources {
        let label = source.label();
        let parent = SecurityContext::new(source.clone(), "gw", Arc::clone(&resolver));
        let child = parent.derive_for_forward("main");

        assert_eq!(child.trust_level(), TrustLevel::SemiTrusted);
        assert_eq!(child.source().source_type, SourceType::Gateway);
        assert_eq!(child.session(), "main");
        assert_eq!(
            child.source().identity,
            SourceIdentity::Gateway {
                gateway_session: "gw".to_owned(),
                forwarded_for: Some(label),
            }
        );
        // Parent untouched.
        assert_eq!(parent.source(), &source);
        assert_eq!(parent.session(), "gw");
    }
}

#[test]
fn derived_capabilities_are_limited_to_forward_allow_list() {
    let resolver = dyn_resolver(gateway_config());
    let parent = cli_context("gw", resolver);
    let child = parent.derive_for_forward("main");

    assert_eq!(
        child.policy().capabilities,
        BTreeSet::from([CAP_CROSS_READ.to_owned(), CAP_INJECT.to_owned()])
    );
    assert!(child.has_capability(CAP_INJECT));
    assert!(!child.has_capability(CAP_INJECT_TOOLS));
    assert!(child.require_capability(CAP_INJECT_EXEC).is_err());

    let parent_events = parent.events();
    assert!(parent_events
        .iter()
        .any(|e| e.event_type == SecurityEventType::ForwardDerived));
    assert!(parent.has_capability(CAP_INJECT_EXEC), "owner parent keeps its policy");
}

#[test]
fn security_event_serializes_type_field() {
    let ctx = cli_context("main", dyn_resolver(SecurityConfig::default()));
    ctx.can_use_tool("search");
    let json = serde_json::to_value(&ctx.events()[0]).expect("serialize");
    assert_eq!(json["type"], "tool_check");
    assert_eq!(json["tool"], "search");
}

#[test]
fn generic_constructor_keeps_source() {
    let source = InjectionSource::internal("scheduler");
    let ctx = create_security_context(source.clone(), "main", dyn_resolver(SecurityConfig::default()));
    assert_eq!(ctx.source(), &source);
    assert_eq!(ctx.trust_level(), TrustLevel::Owner);
    assert!(ctx.events().is_empty(), "nothing checked yet");
}
