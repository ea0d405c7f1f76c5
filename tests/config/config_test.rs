//! Coverage for config loading and path resolution.

use std::fs;
use std::path::PathBuf;

use conduit::config::{
    config_dir, config_path_with, load_config, load_or_default, Config, CONFIG_PATH_ENV,
};
use conduit::security::{ActionType, EnforcementMode, SourceType, TrustLevel};

#[test]
fn config_dir_resolves() {
    let path = match config_dir() {
        Ok(path) => path,
        Err(err) => panic!("config dir should resolve: {err}"),
    };
    assert!(path.ends_with(".conduit"));
}

#[test]
fn config_path_prefers_env() {
    let path = config_path_with(|key| (key == CONFIG_PATH_ENV).then(|| "/etc/conduit.toml".to_owned()))
        .expect("path from env");
    assert_eq!(path, PathBuf::from("/etc/conduit.toml"));

    let fallback = config_path_with(|_| None).expect("path from home");
    assert!(fallback.ends_with(".conduit/config.toml"));
}

#[test]
fn load_config_reads_file() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("config.toml");
    fs::write(
        &path,
        r#"
[security]
enforcement = "warn"

[security.sessions.lobby.gateway]
allowed_targets = ["main"]
accept_sources = ["p2p.discovery"]
allowed_action_types = ["query"]
"#,
    )
    .expect("write config");

    let config = load_config(&path).expect("config should load");
    assert_eq!(config.security.enforcement, EnforcementMode::Warn);
    let gateway = config.security.sessions["lobby"]
        .gateway
        .as_ref()
        .expect("lobby is a gateway");
    assert_eq!(gateway.accept_sources, vec![SourceType::P2pDiscovery]);
    assert_eq!(gateway.allowed_action_types, vec![ActionType::Query]);
    assert!(!gateway.require_approval);
}

#[test]
fn load_config_reports_parse_errors() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("config.toml");
    fs::write(&path, "[security]\ndefault_min_trust = \"root\"\n").expect("write config");

    let err = load_config(&path).unwrap_err();
    assert!(err.to_string().contains("failed to parse config"));
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let config = load_or_default(&tmp.path().join("absent.toml")).expect("defaults");
    assert_eq!(config.security.default_min_trust, TrustLevel::SemiTrusted);
    assert_eq!(config.gateway.history_limit, 256);
    assert!(config.validate().is_empty());
}

#[test]
fn missing_config_file_is_an_error_for_load_config() {
    let tmp = tempfile::tempdir().expect("temp dir");
    assert!(load_config(&tmp.path().join("absent.toml")).is_err());
}

#[test]
fn validate_collects_every_problem() {
    let config = Config::from_toml(
        r#"
[security.trust_levels.root]
capabilities = ["*"]

[security.sessions.gw.gateway]
allowed_targets = ["gw"]
rate_limit_per_minute = 0

[security.sessions.empty.gateway]

[security.sessions.main]
allowed_tools = ["shell", "search"]
denied_tools = ["shell"]

[queue]
event_capacity = 0
"#,
    )
    .expect("parses");

    let problems = config.validate();
    assert_eq!(problems.len(), 6, "{problems:#?}");
    assert!(problems.iter().any(|p| p.contains("unknown trust level")));
    assert!(problems.iter().any(|p| p.contains("lists itself")));
    assert!(problems.iter().any(|p| p.contains("zero rate limit")));
    assert!(problems.iter().any(|p| p.contains("empty has no allowed_targets")));
    assert!(problems.iter().any(|p| p.contains("both allows and denies")));
    assert!(problems.iter().any(|p| p.contains("event_capacity")));
}
