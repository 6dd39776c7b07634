#![forbid(unsafe_code)]

//! **wasync-cli** – Command-line entry point for the wasync synchronization
//! daemon.
//!
//! ```bash
//! # Validate a secrets file without starting the scheduler.
//! wasync validate-config --secrets-path ./secrets.yaml
//!
//! # Run the daemon until WASYNC_QUIT_AT (or forever, if unset).
//! wasync run
//! ```
//!
//! `run` wires a [`wasync_store::GitStore`] working tree and the scheduler
//! tick loop together. The upstream `ObjectSource` is a narrow external
//! collaborator out of this repository's scope (see the synchronization
//! engine's own documentation); this binary wires `wasync_source::FixtureSource`
//! as the connected-but-empty placeholder, exactly the boundary the system
//! was specified against. Production deployments link a real
//! `ObjectSource` implementation (an HTTP client against the upstream
//! content-management API) in its place at the call site below.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wasync_config::{load_secrets, ConfigError, RuntimeConfig};
use wasync_engine::Registries;
use wasync_scheduler::{ScheduleConfig, ShutdownFlag};
use wasync_source::FixtureSource;
use wasync_store::{GitStore, StoreError, VersionedStore};

#[derive(Parser)]
#[command(
    name = "wasync",
    version,
    about = "wasync – mirrors WorldAnvil worlds, categories, and articles into a git-backed working tree"
)]
struct Cli {
    /// Log level passed to the tracing env-filter (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a secrets YAML file without starting the scheduler.
    ValidateConfig {
        /// Path to the secrets file. Defaults to `WASYNC_SECRETS_PATH` or
        /// `/run/secrets/secret_config`.
        #[arg(long)]
        secrets_path: Option<PathBuf>,
    },
    /// Run the synchronization daemon until the configured quit deadline.
    Run,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::ValidateConfig { secrets_path } => validate_config(secrets_path),
        Commands::Run => run_daemon().await,
    }
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Exit code policy (spec §6): `0` clean, `1` ConfigError, `2` working tree
/// missing/not a git repository, `3` remote not configured.
fn validate_config(secrets_path: Option<PathBuf>) -> ExitCode {
    let path = secrets_path.unwrap_or_else(default_secrets_path);
    match load_secrets(&path) {
        Ok(secrets) => {
            info!(
                worlds = secrets.worlds.len(),
                remote = %secrets.remote_repository_url,
                path = %path.display(),
                "secrets file is valid"
            );
            println!("OK: {} world(s) configured, remote {}", secrets.worlds.len(), secrets.remote_repository_url);
            ExitCode::from(0)
        }
        Err(e) => {
            error!(error = %e, path = %path.display(), "secrets file failed validation");
            eprintln!("config error: {e}");
            exit_code_for_config_error(&e)
        }
    }
}

async fn run_daemon() -> ExitCode {
    match try_run_daemon().await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            error!(error = %e, "daemon exited with error");
            eprintln!("fatal: {e:#}");
            if let Some(config_err) = e.downcast_ref::<ConfigError>() {
                return exit_code_for_config_error(config_err);
            }
            if let Some(store_err) = e.downcast_ref::<StoreError>() {
                return exit_code_for_store_error(store_err);
            }
            ExitCode::from(1)
        }
    }
}

async fn try_run_daemon() -> Result<()> {
    let runtime = RuntimeConfig::from_env().context("failed to load runtime configuration from the environment")?;
    let secrets = load_secrets(&runtime.secrets_path)
        .with_context(|| format!("failed to load secrets from {}", runtime.secrets_path.display()))?;

    let repo_name = repo_name_from_ssh_url(&secrets.remote_repository_url);
    let working_tree = runtime.working_tree_root.join(&repo_name);

    let mut store = GitStore::open(&working_tree, &runtime.ssh_key_path, "origin")
        .context("failed to open the git working tree")?;
    store.checkout("main").context("failed to check out the working branch")?;
    store.validate().context("working tree failed validation")?;

    let registries = Registries::open(&working_tree);
    registries.ensure_initialized().context("failed to initialize registries")?;

    // See the module doc: a production `ObjectSource` is linked here in
    // place of `FixtureSource` once a real upstream client crate exists.
    let source = FixtureSource::new("unconfigured-principal");

    let config = ScheduleConfig {
        quit_at: runtime.quit_at,
        ping_interval: Duration::from_secs(runtime.ping_interval_s),
    };
    let shutdown = ShutdownFlag::new();
    shutdown.watch_ctrl_c();

    info!(worlds = secrets.worlds.len(), working_tree = %working_tree.display(), "daemon starting");
    wasync_scheduler::run(&source, &mut store, &registries, &secrets.worlds, &config, &shutdown).await;
    info!("daemon exiting cleanly");
    Ok(())
}

fn exit_code_for_config_error(_err: &ConfigError) -> ExitCode {
    ExitCode::from(1)
}

fn exit_code_for_store_error(err: &StoreError) -> ExitCode {
    match err {
        StoreError::Open { .. } => ExitCode::from(2),
        StoreError::Validation(_) => ExitCode::from(3),
        _ => ExitCode::from(1),
    }
}

fn default_secrets_path() -> PathBuf {
    std::env::var("WASYNC_SECRETS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/secrets/secret_config"))
}

/// `git@github.com:owner/repo.git` → `repo`, mirroring the original's
/// `self.repo_ssh_url.rstrip('.git').split('/')[-1]`.
fn repo_name_from_ssh_url(url: &str) -> String {
    url.trim_end_matches(".git")
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_name_strips_git_suffix_and_owner() {
        assert_eq!(repo_name_from_ssh_url("git@github.com:example-org/demo-repo.git"), "demo-repo");
    }

    #[test]
    fn repo_name_tolerates_missing_suffix() {
        assert_eq!(repo_name_from_ssh_url("git@github.com:example-org/demo-repo"), "demo-repo");
    }
}
