//! Conduit CLI entry point.
//!
//! Provides `policy`, `tools`, and `check-config` subcommands for inspecting
//! how the configured policy treats a given source and session.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use conduit::config::{self, Config};
use conduit::security::{
    AccessCheck, ConfigPolicyResolver, InjectionSource, PolicyResolver, ResolvedPolicy,
    SecurityContext, SourceType, TrustLevel,
};

/// Conduit: inspect injection policy for multi-session agents.
#[derive(Parser)]
#[command(name = "conduit", version, about)]
struct Cli {
    /// Config file (defaults to `$CONDUIT_CONFIG` or `~/.conduit/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Print the resolved policy of a source injecting into a session.
    Policy {
        /// Source and session to resolve.
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Print which of the given tools a source may use in a session.
    Tools {
        /// Source and session to check.
        #[command(flatten)]
        target: TargetArgs,
        /// Tool names, in the order they should be reported.
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Validate the config file and report problems.
    CheckConfig,
}

/// Which source injects into which session.
#[derive(Args)]
struct TargetArgs {
    /// Source type (cli, daemon, plugin, cron, api, p2p, p2p.discovery, gateway, internal).
    #[arg(long = "source")]
    source_type: SourceType,
    /// Source identity: user, plugin name, job, key id, peer key, or component.
    #[arg(long)]
    name: Option<String>,
    /// Override the source's trust level.
    #[arg(long)]
    trust: Option<TrustLevel>,
    /// Target session.
    #[arg(long)]
    session: String,
}

/// JSON report for `policy`.
#[derive(Serialize)]
struct PolicyReport<'a> {
    source: &'a InjectionSource,
    session: &'a str,
    access: AccessReport,
    policy: &'a ResolvedPolicy,
}

/// JSON view of an [`AccessCheck`].
#[derive(Serialize)]
struct AccessReport {
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl From<AccessCheck> for AccessReport {
    fn from(check: AccessCheck) -> Self {
        Self {
            allowed: check.allowed,
            reason: check.reason,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::config_path_with(|key| std::env::var(key).ok())?,
    };
    let config = config::load_or_default(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    conduit::logging::init_cli(&config.logging.level)?;
    debug!(config = %config_path.display(), "configuration loaded");

    match cli.command {
        Command::Policy { target } => handle_policy(config, &target),
        Command::Tools { target, names } => handle_tools(config, &target, &names),
        Command::CheckConfig => handle_check_config(&config, &config_path),
    }
}

/// Build the source described on the command line.
fn build_source(args: &TargetArgs) -> InjectionSource {
    let name = args.name.clone().unwrap_or_else(|| "anonymous".to_owned());
    let mut source = match args.source_type {
        SourceType::Cli => InjectionSource::cli(args.name.clone()),
        SourceType::Daemon => InjectionSource::daemon(),
        SourceType::Plugin => InjectionSource::plugin(name),
        SourceType::Cron => InjectionSource::cron(name),
        SourceType::Api => InjectionSource::api(name, TrustLevel::SemiTrusted),
        SourceType::P2p => InjectionSource::p2p(name, TrustLevel::Untrusted, None, None),
        SourceType::P2pDiscovery => InjectionSource::p2p_discovery(name, None),
        SourceType::Gateway => InjectionSource::gateway(name, None, BTreeSet::new()),
        SourceType::Internal => InjectionSource::internal(name),
    };
    if let Some(trust) = args.trust {
        source.trust_level = trust;
    }
    source
}

fn context_for(config: Config, args: &TargetArgs) -> SecurityContext {
    let resolver: Arc<dyn PolicyResolver> = Arc::new(ConfigPolicyResolver::new(config.security));
    SecurityContext::new(build_source(args), args.session.clone(), resolver)
}

fn handle_policy(config: Config, args: &TargetArgs) -> anyhow::Result<()> {
    let ctx = context_for(config, args);
    let access = ctx.can_access_session().into();
    let report = PolicyReport {
        source: ctx.source(),
        session: ctx.session(),
        access,
        policy: ctx.policy(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn handle_tools(config: Config, args: &TargetArgs, names: &[String]) -> anyhow::Result<()> {
    let ctx = context_for(config, args);
    for name in names {
        let check = ctx.can_use_tool(name);
        match (check.allowed, check.warning, check.reason) {
            (true, Some(warning), _) => println!("{name}\tallowed (warn: {warning})"),
            (true, None, _) => println!("{name}\tallowed"),
            (false, _, reason) => println!("{name}\tdenied: {}", reason.unwrap_or_default()),
        }
    }
    Ok(())
}

fn handle_check_config(config: &Config, path: &std::path::Path) -> anyhow::Result<()> {
    let problems = config.validate();
    if problems.is_empty() {
        println!("{}: ok", path.display());
        return Ok(());
    }
    for problem in &problems {
        eprintln!("{problem}");
    }
    anyhow::bail!("{} problem(s) in {}", problems.len(), path.display())
}
