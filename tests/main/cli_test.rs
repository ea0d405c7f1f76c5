//! CLI contract tests.

use std::fs;
use std::path::Path;

use assert_cmd::Command;

const GATEWAY_CONFIG: &str = r#"
[security.sessions.main]
denied_tools = ["shell"]

[security.sessions.lobby.gateway]
allowed_targets = ["main"]
accept_sources = ["p2p"]
"#;

fn conduit(dir: &Path, config: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_conduit"));
    cmd.current_dir(dir)
        .env_remove("RUST_LOG")
        .env_remove("CONDUIT_LOG_LEVEL")
        .env_remove("CONDUIT_ENFORCEMENT")
        .arg("--config")
        .arg(config);
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).expect("utf-8 stdout")
}

#[test]
fn check_config_accepts_valid_file() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("config.toml");
    fs::write(&path, GATEWAY_CONFIG).expect("write config");

    let stdout = stdout_of(conduit(tmp.path(), &path).arg("check-config"));
    assert_eq!(stdout.trim(), format!("{}: ok", path.display()));
}

#[test]
fn check_config_without_file_uses_defaults() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("missing.toml");
    let stdout = stdout_of(conduit(tmp.path(), &path).arg("check-config"));
    assert!(stdout.contains(": ok"));
}

#[test]
fn check_config_reports_problems() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("config.toml");
    fs::write(
        &path,
        "[security.sessions.gw.gateway]\nallowed_targets = [\"gw\"]\n",
    )
    .expect("write config");

    let assert = conduit(tmp.path(), &path).arg("check-config").assert().failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("gateway session gw lists itself as a target"), "{stderr}");
}

#[test]
fn policy_prints_json_report() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("config.toml");
    fs::write(&path, GATEWAY_CONFIG).expect("write config");

    let stdout = stdout_of(conduit(tmp.path(), &path).args([
        "policy", "--source", "p2p", "--name", "peer", "--session", "main",
    ]));
    let report: serde_json::Value = serde_json::from_str(&stdout).expect("json output");
    assert_eq!(report["session"], "main");
    assert_eq!(report["source"]["type"], "p2p");
    assert_eq!(report["access"]["allowed"], false);
    assert!(report["access"]["reason"]
        .as_str()
        .expect("reason")
        .contains("below required"));
    assert_eq!(report["policy"]["trust_level"], "untrusted");
    assert_eq!(report["policy"]["capabilities"], serde_json::json!(["inject"]));
}

#[test]
fn policy_trust_override_and_gateway_session() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("config.toml");
    fs::write(&path, GATEWAY_CONFIG).expect("write config");

    let stdout = stdout_of(conduit(tmp.path(), &path).args([
        "policy", "--source", "api", "--name", "k1", "--trust", "trusted", "--session", "lobby",
    ]));
    let report: serde_json::Value = serde_json::from_str(&stdout).expect("json output");
    assert_eq!(report["access"]["allowed"], true);
    assert!(report["access"].get("reason").is_none());
    assert_eq!(report["policy"]["is_gateway"], true);
    assert_eq!(report["policy"]["can_forward"], true);
}

#[test]
fn tools_lists_each_decision() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("config.toml");
    fs::write(&path, GATEWAY_CONFIG).expect("write config");

    let stdout = stdout_of(conduit(tmp.path(), &path).args([
        "tools", "--source", "cli", "--session", "main", "search", "shell",
    ]));
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "search\tallowed");
    assert!(lines[1].starts_with("shell\tdenied: "), "{}", lines[1]);
}

#[test]
fn unknown_source_type_is_rejected() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("config.toml");
    conduit(tmp.path(), &path)
        .args(["policy", "--source", "satellite", "--session", "main"])
        .assert()
        .failure();
}
