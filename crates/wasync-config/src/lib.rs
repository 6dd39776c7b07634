#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **wasync-config** – Secrets and runtime configuration loading.
//!
//! Two independent sources feed the daemon's configuration, mirroring the
//! upstream's own split between a mounted secrets file and hardcoded
//! deploy constants (here promoted to environment variables, see
//! [`RuntimeConfig::from_env`]):
//!
//! - A YAML secrets file ([`load_secrets`]) carrying credentials, the
//!   remote repository URL, and the list of tracked worlds. Validated
//!   field-by-field against the same regex grammar the upstream's
//!   `cerberus` schema enforced.
//! - A handful of environment variables ([`RuntimeConfig::from_env`])
//!   describing this deployment: where the SSH key lives, where the
//!   working tree is checked out, how often to poll, and when to stop.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::Secret;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use wasync_types::{TrackChanges, WorldConfig};

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The secrets file could not be read.
    #[error("failed to read secrets file at {path}: {source}")]
    Io {
        /// The file path involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The secrets file was not valid YAML, or did not match the expected
    /// shape (missing required keys, wrong types).
    #[error("failed to parse secrets file at {path}: {source}")]
    Parse {
        /// The file path involved.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_yaml::Error,
    },
    /// A field's value didn't match its required grammar.
    #[error("secrets field '{field}' is invalid: {reason}")]
    Validation {
        /// The dotted field path (e.g. `"credentials.application_key"`).
        field: String,
        /// A human-readable description of the mismatch.
        reason: String,
    },
    /// A required environment variable was not set.
    #[error("environment variable {0} is required but not set")]
    EnvMissing(&'static str),
    /// An environment variable was set but could not be parsed.
    #[error("environment variable {var} is invalid: {reason}")]
    EnvInvalid {
        /// The variable name.
        var: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Result alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

static APPLICATION_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-f0-9]{128}$").expect("static regex is valid"));
static AUTHENTICATION_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9]{249}$").expect("static regex is valid"));
static WORLD_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^https://[a-zA-Z0-9./-]{1,50}$").expect("static regex is valid"));
static REMOTE_REPOSITORY_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^git@github\.com:[A-Za-z0-9]{1,15}/[A-Za-z0-9-]{1,35}\.git$")
        .expect("static regex is valid")
});

/// The wire shape of the secrets YAML file, deserialized before any
/// validation is applied.
#[derive(Debug, Deserialize)]
struct RawSecrets {
    credentials: RawCredentials,
    remote_repo: RawRemoteRepo,
    track: RawTrack,
}

#[derive(Debug, Deserialize)]
struct RawCredentials {
    application_key: String,
    authentication_token: String,
}

#[derive(Debug, Deserialize)]
struct RawRemoteRepo {
    remote_repository_url: String,
}

#[derive(Debug, Deserialize)]
struct RawTrack {
    worlds: Vec<RawWorldEntry>,
}

#[derive(Debug, Deserialize)]
struct RawWorldEntry {
    url: String,
    track_changes: RawTrackChanges,
}

/// The full granularity grammar the upstream schema accepts. Only
/// `categories` and `articles` have a Synchronizer behavior today;
/// `article_blocks`, `images`, and `maps` are accepted (and validated as
/// booleans) for config-file compatibility but are not acted on — finer
/// content-block tracking is explicitly out of scope.
#[derive(Debug, Deserialize)]
struct RawTrackChanges {
    #[serde(default)]
    categories: bool,
    #[serde(default)]
    articles: bool,
    #[serde(default)]
    #[allow(dead_code)]
    article_blocks: bool,
    #[serde(default)]
    #[allow(dead_code)]
    images: bool,
    #[serde(default)]
    #[allow(dead_code)]
    maps: bool,
}

/// Validated secrets: credentials, the remote repository URL, and the
/// list of tracked worlds.
#[derive(Clone)]
pub struct Secrets {
    /// The upstream API application key (128 lowercase hex characters).
    pub application_key: Secret<String>,
    /// The upstream API authentication token (249 alphanumeric characters).
    pub authentication_token: Secret<String>,
    /// The `git@github.com:owner/repo.git` SSH URL commits are pushed to.
    pub remote_repository_url: String,
    /// The worlds to synchronize, in configuration order.
    pub worlds: Vec<WorldConfig>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("application_key", &"[REDACTED]")
            .field("authentication_token", &"[REDACTED]")
            .field("remote_repository_url", &self.remote_repository_url)
            .field("worlds", &self.worlds)
            .finish()
    }
}

/// Load and validate a secrets YAML file.
///
/// Validation mirrors the upstream's `cerberus` schema field-for-field:
/// malformed credentials, a malformed remote URL, or a malformed world URL
/// all fail with [`ConfigError::Validation`] before any network or git
/// operation is attempted.
pub fn load_secrets(path: impl AsRef<Path>) -> Result<Secrets> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let raw: RawSecrets = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    validate_field(
        "credentials.application_key",
        &raw.credentials.application_key,
        &APPLICATION_KEY_RE,
        "expected 128 lowercase hex characters",
    )?;
    validate_field(
        "credentials.authentication_token",
        &raw.credentials.authentication_token,
        &AUTHENTICATION_TOKEN_RE,
        "expected 249 alphanumeric characters",
    )?;
    validate_field(
        "remote_repo.remote_repository_url",
        &raw.remote_repo.remote_repository_url,
        &REMOTE_REPOSITORY_URL_RE,
        "expected git@github.com:<owner>/<repo>.git",
    )?;

    if raw.track.worlds.is_empty() {
        warn!("secrets file configures zero worlds to track");
    }

    let mut worlds = Vec::with_capacity(raw.track.worlds.len());
    for (i, entry) in raw.track.worlds.into_iter().enumerate() {
        validate_field(
            &format!("track.worlds[{i}].url"),
            &entry.url,
            &WORLD_URL_RE,
            "expected https://<host>/<path>, at most 50 characters",
        )?;
        worlds.push(WorldConfig {
            url: entry.url,
            track_changes: TrackChanges {
                world: true,
                categories: entry.track_changes.categories,
                articles: entry.track_changes.articles,
            },
        });
    }

    info!(worlds = worlds.len(), path = %path.display(), "secrets loaded and validated");

    Ok(Secrets {
        application_key: Secret::new(raw.credentials.application_key),
        authentication_token: Secret::new(raw.credentials.authentication_token),
        remote_repository_url: raw.remote_repo.remote_repository_url,
        worlds,
    })
}

fn validate_field(field: &str, value: &str, re: &Regex, reason: &str) -> Result<()> {
    if re.is_match(value) {
        Ok(())
    } else {
        Err(ConfigError::Validation {
            field: field.to_string(),
            reason: reason.to_string(),
        })
    }
}

//─────────────────────────────
//  Runtime configuration (environment variables)
//─────────────────────────────

const DEFAULT_SECRETS_PATH: &str = "/run/secrets/secret_config";
const DEFAULT_PING_INTERVAL_S: u64 = 60;
const QUIT_AT_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Deployment-specific configuration sourced from the environment rather
/// than the secrets file: paths and scheduling knobs that vary per
/// deployment and should never be baked into a config file.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to the private SSH key used to authenticate pushes.
    pub ssh_key_path: PathBuf,
    /// Root of the checked-out git working tree objects are written into.
    pub working_tree_root: PathBuf,
    /// Path to the YAML secrets file.
    pub secrets_path: PathBuf,
    /// Wall-clock deadline after which the daemon exits cleanly.
    pub quit_at: NaiveDateTime,
    /// Seconds to sleep between synchronization ticks.
    pub ping_interval_s: u64,
}

impl RuntimeConfig {
    /// Load runtime configuration from environment variables.
    ///
    /// `WASYNC_SSH_KEY_PATH` and `WASYNC_WORKING_TREE_ROOT` are required;
    /// `WASYNC_SECRETS_PATH`, `WASYNC_QUIT_AT`, and
    /// `WASYNC_PING_INTERVAL_S` fall back to defaults matching the
    /// upstream's module constants.
    pub fn from_env() -> Result<Self> {
        let ssh_key_path = required_path("WASYNC_SSH_KEY_PATH")?;
        let working_tree_root = required_path("WASYNC_WORKING_TREE_ROOT")?;
        let secrets_path = env::var("WASYNC_SECRETS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_SECRETS_PATH));

        let quit_at = match env::var("WASYNC_QUIT_AT") {
            Ok(raw) => NaiveDateTime::parse_from_str(&raw, QUIT_AT_FORMAT).map_err(|e| ConfigError::EnvInvalid {
                var: "WASYNC_QUIT_AT",
                reason: format!("expected '{QUIT_AT_FORMAT}': {e}"),
            })?,
            Err(_) => far_future_deadline(),
        };

        let ping_interval_s = match env::var("WASYNC_PING_INTERVAL_S") {
            Ok(raw) => raw.parse::<u64>().map_err(|e| ConfigError::EnvInvalid {
                var: "WASYNC_PING_INTERVAL_S",
                reason: e.to_string(),
            })?,
            Err(_) => DEFAULT_PING_INTERVAL_S,
        };

        Ok(Self {
            ssh_key_path,
            working_tree_root,
            secrets_path,
            quit_at,
            ping_interval_s,
        })
    }
}

fn required_path(var: &'static str) -> Result<PathBuf> {
    env::var(var).map(PathBuf::from).map_err(|_| ConfigError::EnvMissing(var))
}

fn far_future_deadline() -> NaiveDateTime {
    chrono::NaiveDate::from_ymd_opt(9999, 12, 31)
        .expect("valid static date")
        .and_hms_opt(23, 59, 0)
        .expect("valid static time")
}
