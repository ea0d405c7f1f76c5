//! Configuration loading and validation.
//!
//! The daemon reads one human-owned `config.toml`. Every section is optional;
//! missing sections fall back to built-in defaults. A handful of values can be
//! overridden from the environment.
//!
//! Precedence: env vars > config file > defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::security::policy::{EnforcementMode, GatewayForwardRules, SandboxConfig};
use crate::security::source::{
    TrustLevel, CAP_ALL, CAP_CONFIG_READ, CAP_CROSS_READ, CAP_INJECT, CAP_INJECT_NETWORK,
    CAP_INJECT_TOOLS, CAP_SESSION_HISTORY,
};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "CONDUIT_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level and destination.
    pub logging: LoggingConfig,
    /// Trust levels, capabilities, and per-session rules.
    pub security: SecurityConfig,
    /// Gateway approval settings.
    pub gateway: GatewayConfig,
    /// Session queue settings.
    pub queue: QueueConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Fallback filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rotated JSON logs. Defaults to `<config dir>/logs`.
    pub logs_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            logs_dir: None,
        }
    }
}

/// Authorization configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Whether tool violations are blocked or only warned about.
    pub enforcement: EnforcementMode,
    /// Capabilities every source starts with.
    pub default_capabilities: Vec<String>,
    /// Minimum trust for sessions without their own `min_trust`.
    pub default_min_trust: TrustLevel,
    /// Capability needed by tools without an explicit mapping.
    pub default_tool_capability: String,
    /// Defaults per trust level, keyed by level name (`owner`, `semi-trusted`, ...).
    pub trust_levels: BTreeMap<String, TrustLevelConfig>,
    /// Capability required per tool name.
    pub tools: BTreeMap<String, String>,
    /// Rules per session name.
    pub sessions: BTreeMap<String, SessionRuleConfig>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enforcement: EnforcementMode::Enforce,
            default_capabilities: Vec::new(),
            default_min_trust: TrustLevel::SemiTrusted,
            default_tool_capability: CAP_INJECT_TOOLS.to_owned(),
            trust_levels: default_trust_levels(),
            tools: BTreeMap::new(),
            sessions: BTreeMap::new(),
        }
    }
}

/// Defaults applied to every source at one trust level.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrustLevelConfig {
    /// Capabilities granted at this level.
    pub capabilities: Vec<String>,
    /// Sandbox mandated at this level.
    pub sandbox: Option<SandboxConfig>,
    /// Whether sources at this level must inject through a gateway.
    pub require_gateway: bool,
}

/// Access rules for one session.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionRuleConfig {
    /// Minimum trust level for callers without an explicit allow rule.
    pub min_trust: Option<TrustLevel>,
    /// Identity patterns always admitted (`"p2p:abcd"`, `"plugin:*"`, `"cron"`).
    pub allow: Vec<String>,
    /// Identity patterns always refused.
    pub deny: Vec<String>,
    /// Capabilities added for every caller of this session.
    pub grant_capabilities: Vec<String>,
    /// Capabilities removed for every caller of this session (exact names).
    pub revoke_capabilities: Vec<String>,
    /// If set, the only tools usable in this session.
    pub allowed_tools: Option<Vec<String>>,
    /// Tools never usable in this session.
    pub denied_tools: Vec<String>,
    /// Sandbox mandated for this session.
    pub sandbox: Option<SandboxConfig>,
    /// Lift a trust-level sandbox requirement for this session.
    pub disable_sandbox: bool,
    /// Makes the session a gateway.
    pub gateway: Option<GatewayForwardRules>,
}

/// Gateway approval settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Seconds a forward request may wait for approval before it expires.
    pub approval_timeout_secs: u64,
    /// Finished requests remembered for status queries.
    pub history_limit: usize,
    /// Capacity of the forward event channel.
    pub event_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: 300,
            history_limit: 256,
            event_capacity: 256,
        }
    }
}

/// Session queue settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity of each queue's event channel.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
        }
    }
}

fn default_trust_levels() -> BTreeMap<String, TrustLevelConfig> {
    let caps = |list: &[&str]| list.iter().map(|c| (*c).to_owned()).collect::<Vec<_>>();
    let mut levels = BTreeMap::new();
    levels.insert(
        TrustLevel::Owner.as_str().to_owned(),
        TrustLevelConfig {
            capabilities: caps(&[CAP_ALL]),
            sandbox: None,
            require_gateway: false,
        },
    );
    levels.insert(
        TrustLevel::Trusted.as_str().to_owned(),
        TrustLevelConfig {
            capabilities: caps(&[
                CAP_INJECT,
                CAP_INJECT_TOOLS,
                CAP_INJECT_NETWORK,
                CAP_SESSION_HISTORY,
                CAP_CROSS_READ,
                CAP_CONFIG_READ,
            ]),
            sandbox: None,
            require_gateway: false,
        },
    );
    levels.insert(
        TrustLevel::SemiTrusted.as_str().to_owned(),
        TrustLevelConfig {
            capabilities: caps(&[CAP_INJECT, CAP_INJECT_TOOLS, CAP_SESSION_HISTORY]),
            sandbox: None,
            require_gateway: false,
        },
    );
    levels.insert(
        TrustLevel::Untrusted.as_str().to_owned(),
        TrustLevelConfig {
            capabilities: caps(&[CAP_INJECT]),
            sandbox: Some(SandboxConfig::default()),
            require_gateway: false,
        },
    );
    levels
}

impl Config {
    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has wrong value types.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).map_err(|e| anyhow::anyhow!("failed to parse config TOML: {e}"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("CONDUIT_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env("CONDUIT_ENFORCEMENT") {
            match v.as_str() {
                "enforce" => self.security.enforcement = EnforcementMode::Enforce,
                "warn" => self.security.enforcement = EnforcementMode::Warn,
                _ => tracing::warn!(
                    var = "CONDUIT_ENFORCEMENT",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("CONDUIT_APPROVAL_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.gateway.approval_timeout_secs = n,
                Err(_) => tracing::warn!(
                    var = "CONDUIT_APPROVAL_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Check the config for mistakes that parse fine but make no sense.
    ///
    /// Returns one human-readable problem per entry; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for key in self.security.trust_levels.keys() {
            if key.parse::<TrustLevel>().is_err() {
                problems.push(format!("unknown trust level in [security.trust_levels]: {key}"));
            }
        }
        for (name, rule) in &self.security.sessions {
            if let Some(gateway) = &rule.gateway {
                if gateway.allowed_targets.is_empty() {
                    problems.push(format!("gateway session {name} has no allowed_targets"));
                }
                if gateway.allowed_targets.iter().any(|t| t == name) {
                    problems.push(format!("gateway session {name} lists itself as a target"));
                }
                if gateway.rate_limit_per_minute == Some(0) {
                    problems.push(format!("gateway session {name} has a zero rate limit"));
                }
            }
            let overlap: Vec<&String> = rule
                .allowed_tools
                .iter()
                .flatten()
                .filter(|tool| rule.denied_tools.contains(tool))
                .collect();
            if !overlap.is_empty() {
                problems.push(format!(
                    "session {name} both allows and denies tools: {overlap:?}"
                ));
            }
        }
        if self.gateway.event_capacity == 0 || self.queue.event_capacity == 0 {
            problems.push("event_capacity must be greater than zero".to_owned());
        }
        problems
    }
}

/// Load config from a TOML file and apply env overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let mut config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    config.apply_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

/// Load config from `path` if it exists, otherwise defaults plus env overrides.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        return load_config(path);
    }
    tracing::info!(path = %path.display(), "no config file found, using defaults");
    let mut config = Config::default();
    config.apply_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

/// Resolve the default config directory (`~/.conduit/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".conduit"))
}

/// Resolve the config file path: `$CONDUIT_CONFIG`, else `~/.conduit/config.toml`.
///
/// # Errors
///
/// Returns an error if neither the env var nor the home directory is available.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<PathBuf> {
    if let Some(p) = env(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(p));
    }
    Ok(config_dir()?.join("config.toml"))
}
