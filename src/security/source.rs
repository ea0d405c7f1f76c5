//! Typed injection sources and trust levels.
//!
//! Every message injected into a session is attributed to exactly one
//! [`InjectionSource`]. The source carries the caller's inherent
//! [`TrustLevel`] plus any capabilities explicitly granted to it (for example
//! a P2P peer that was issued an access grant). Sources are immutable once
//! built; forwarding produces a new source rather than editing one.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Matches every capability.
pub const CAP_ALL: &str = "*";
/// Inject a message into a session.
pub const CAP_INJECT: &str = "inject";
/// Let the session's agent call tools while handling the injection.
pub const CAP_INJECT_TOOLS: &str = "inject.tools";
/// Let tools reach the network.
pub const CAP_INJECT_NETWORK: &str = "inject.network";
/// Let tools run commands.
pub const CAP_INJECT_EXEC: &str = "inject.exec";
/// Read the session's conversation history.
pub const CAP_SESSION_HISTORY: &str = "session.history";
/// Read other sessions.
pub const CAP_CROSS_READ: &str = "cross.read";
/// Inject into other sessions.
pub const CAP_CROSS_INJECT: &str = "cross.inject";
/// Read daemon configuration.
pub const CAP_CONFIG_READ: &str = "config.read";
/// Modify daemon configuration.
pub const CAP_CONFIG_WRITE: &str = "config.write";
/// Forward requests through a gateway session.
pub const CAP_GATEWAY_FORWARD: &str = "gateway.forward";
/// Call other agents.
pub const CAP_A2A_CALL: &str = "a2a.call";

/// Whether a granted capability pattern covers `requested`.
///
/// Patterns are exact names, `"*"` for everything, or `"prefix.*"` for every
/// capability under `prefix.`.
pub fn capability_matches(granted: &str, requested: &str) -> bool {
    if granted == CAP_ALL || granted == requested {
        return true;
    }
    match granted.strip_suffix(".*") {
        Some(prefix) => requested
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}

/// Whether any pattern in `set` covers `requested`.
pub fn capability_set_allows(set: &BTreeSet<String>, requested: &str) -> bool {
    set.iter().any(|granted| capability_matches(granted, requested))
}

// ---------------------------------------------------------------------------
// Trust levels
// ---------------------------------------------------------------------------

/// Inherent trust of a caller, independent of specific grants.
///
/// Ordered from least to most trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustLevel {
    /// Anonymous or unknown callers such as discovered network peers.
    Untrusted,
    /// Known callers with limited standing, including gateway-forwarded calls.
    SemiTrusted,
    /// Vetted integrations and authorized peers.
    Trusted,
    /// The machine owner.
    Owner,
}

impl TrustLevel {
    /// All levels, least trusted first.
    pub const ALL: [TrustLevel; 4] = [
        TrustLevel::Untrusted,
        TrustLevel::SemiTrusted,
        TrustLevel::Trusted,
        TrustLevel::Owner,
    ];

    /// Config and wire name of the level.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untrusted => "untrusted",
            Self::SemiTrusted => "semi-trusted",
            Self::Trusted => "trusted",
            Self::Owner => "owner",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown trust level or source type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseNameError {
    /// What was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl FromStr for TrustLevel {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or_else(|| ParseNameError {
                kind: "trust level",
                value: s.to_owned(),
            })
    }
}

// ---------------------------------------------------------------------------
// Source types and identities
// ---------------------------------------------------------------------------

/// Kind of caller that produced an injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    /// Interactive command line.
    #[serde(rename = "cli")]
    Cli,
    /// The daemon itself.
    #[serde(rename = "daemon")]
    Daemon,
    /// Plugin code.
    #[serde(rename = "plugin")]
    Plugin,
    /// Scheduled job.
    #[serde(rename = "cron")]
    Cron,
    /// HTTP API client.
    #[serde(rename = "api")]
    Api,
    /// Peer-to-peer network peer.
    #[serde(rename = "p2p")]
    P2p,
    /// Peer found through discovery, not yet introduced.
    #[serde(rename = "p2p.discovery")]
    P2pDiscovery,
    /// Call forwarded by a gateway session.
    #[serde(rename = "gateway")]
    Gateway,
    /// Internal subsystem.
    #[serde(rename = "internal")]
    Internal,
}

impl SourceType {
    /// All source types.
    pub const ALL: [SourceType; 9] = [
        SourceType::Cli,
        SourceType::Daemon,
        SourceType::Plugin,
        SourceType::Cron,
        SourceType::Api,
        SourceType::P2p,
        SourceType::P2pDiscovery,
        SourceType::Gateway,
        SourceType::Internal,
    ];

    /// Config and wire name of the source type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Daemon => "daemon",
            Self::Plugin => "plugin",
            Self::Cron => "cron",
            Self::Api => "api",
            Self::P2p => "p2p",
            Self::P2pDiscovery => "p2p.discovery",
            Self::Gateway => "gateway",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseNameError {
                kind: "source type",
                value: s.to_owned(),
            })
    }
}

/// Source-specific identity of a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceIdentity {
    /// A local CLI user.
    Cli {
        /// OS user name, when known.
        user: Option<String>,
    },
    /// The daemon process.
    Daemon,
    /// A named plugin.
    Plugin {
        /// Plugin name.
        name: String,
    },
    /// A scheduled job.
    Cron {
        /// Job name.
        job: String,
    },
    /// An API client.
    Api {
        /// API key identifier (never the key itself).
        key_id: String,
    },
    /// A connected network peer.
    P2p {
        /// Peer public key.
        peer_key: String,
    },
    /// A peer seen through discovery.
    P2pDiscovery {
        /// Peer public key.
        peer_key: String,
        /// Discovery topic the peer was found on.
        topic: Option<String>,
    },
    /// A gateway session acting for another caller.
    Gateway {
        /// Session that forwarded the call.
        gateway_session: String,
        /// Identity label of the caller the gateway acted for.
        forwarded_for: Option<String>,
    },
    /// An internal subsystem.
    Internal {
        /// Component name.
        component: String,
    },
}

impl SourceIdentity {
    /// Matchable label, e.g. `plugin:memory`, `p2p:abcd`, `gateway:p2p-gw`.
    pub fn label(&self) -> String {
        match self {
            Self::Cli { user: Some(user) } => format!("cli:{user}"),
            Self::Cli { user: None } => "cli".to_owned(),
            Self::Daemon => "daemon".to_owned(),
            Self::Plugin { name } => format!("plugin:{name}"),
            Self::Cron { job } => format!("cron:{job}"),
            Self::Api { key_id } => format!("api:{key_id}"),
            Self::P2p { peer_key } => format!("p2p:{peer_key}"),
            Self::P2pDiscovery { peer_key, .. } => format!("p2p.discovery:{peer_key}"),
            Self::Gateway {
                gateway_session, ..
            } => format!("gateway:{gateway_session}"),
            Self::Internal { component } => format!("internal:{component}"),
        }
    }
}

/// Whether an identity-label pattern matches `label`.
///
/// Supports `"*"`, exact labels, and trailing-`*` prefixes (`"p2p:*"`). A bare
/// source type (`"p2p"`) matches every label of that type.
pub fn label_matches(pattern: &str, label: &str) -> bool {
    if pattern == "*" || pattern == label {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return label.starts_with(prefix);
    }
    label
        .strip_prefix(pattern)
        .is_some_and(|rest| rest.starts_with(':'))
}

// ---------------------------------------------------------------------------
// InjectionSource
// ---------------------------------------------------------------------------

/// The attributed origin of one injection request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionSource {
    /// Kind of caller.
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Inherent trust of the caller.
    pub trust_level: TrustLevel,
    /// Source-specific identity.
    pub identity: SourceIdentity,
    /// Capabilities granted on top of the trust-level defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_capabilities: Option<BTreeSet<String>>,
    /// Identifier of the grant that issued `granted_capabilities`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<String>,
}

impl InjectionSource {
    /// Build a source with no grants.
    pub fn new(source_type: SourceType, trust_level: TrustLevel, identity: SourceIdentity) -> Self {
        Self {
            source_type,
            trust_level,
            identity,
            granted_capabilities: None,
            grant_id: None,
        }
    }

    /// Interactive CLI caller; owner trust.
    pub fn cli(user: Option<String>) -> Self {
        Self::new(SourceType::Cli, TrustLevel::Owner, SourceIdentity::Cli { user })
    }

    /// The daemon itself; owner trust.
    pub fn daemon() -> Self {
        Self::new(SourceType::Daemon, TrustLevel::Owner, SourceIdentity::Daemon)
    }

    /// Plugin code; trusted by default.
    pub fn plugin(name: impl Into<String>) -> Self {
        Self::new(
            SourceType::Plugin,
            TrustLevel::Trusted,
            SourceIdentity::Plugin { name: name.into() },
        )
    }

    /// Scheduled job; owner trust (jobs are configured by the owner).
    pub fn cron(job: impl Into<String>) -> Self {
        Self::new(
            SourceType::Cron,
            TrustLevel::Owner,
            SourceIdentity::Cron { job: job.into() },
        )
    }

    /// HTTP API client with the trust level bound to its key.
    pub fn api(key_id: impl Into<String>, trust_level: TrustLevel) -> Self {
        Self::new(
            SourceType::Api,
            trust_level,
            SourceIdentity::Api {
                key_id: key_id.into(),
            },
        )
    }

    /// Connected P2P peer with an optional capability grant.
    pub fn p2p(
        peer_key: impl Into<String>,
        trust_level: TrustLevel,
        grants: Option<BTreeSet<String>>,
        grant_id: Option<String>,
    ) -> Self {
        Self {
            source_type: SourceType::P2p,
            trust_level,
            identity: SourceIdentity::P2p {
                peer_key: peer_key.into(),
            },
            granted_capabilities: grants,
            grant_id,
        }
    }

    /// Peer reached through discovery; always untrusted.
    pub fn p2p_discovery(peer_key: impl Into<String>, topic: Option<String>) -> Self {
        Self::new(
            SourceType::P2pDiscovery,
            TrustLevel::Untrusted,
            SourceIdentity::P2pDiscovery {
                peer_key: peer_key.into(),
                topic,
            },
        )
    }

    /// Call forwarded by a gateway session; always semi-trusted.
    pub fn gateway(
        gateway_session: impl Into<String>,
        forwarded_for: Option<String>,
        grants: BTreeSet<String>,
    ) -> Self {
        Self {
            source_type: SourceType::Gateway,
            trust_level: TrustLevel::SemiTrusted,
            identity: SourceIdentity::Gateway {
                gateway_session: gateway_session.into(),
                forwarded_for,
            },
            granted_capabilities: Some(grants),
            grant_id: None,
        }
    }

    /// Internal subsystem; owner trust.
    pub fn internal(component: impl Into<String>) -> Self {
        Self::new(
            SourceType::Internal,
            TrustLevel::Owner,
            SourceIdentity::Internal {
                component: component.into(),
            },
        )
    }

    /// Plugin name when this source is a plugin.
    pub fn plugin_name(&self) -> Option<&str> {
        match &self.identity {
            SourceIdentity::Plugin { name } => Some(name),
            _ => None,
        }
    }

    /// Matchable identity label, see [`SourceIdentity::label`].
    pub fn label(&self) -> String {
        self.identity.label()
    }
}

impl fmt::Display for InjectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.identity.label(), self.trust_level)
    }
}
