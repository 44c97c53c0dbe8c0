//! Configuration loading and validation.
//!
//! Loads from `$MATRIX_CHANNEL_CONFIG` or `./config.toml`. Environment
//! variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Env var naming an alternate config file path.
const CONFIG_PATH_ENV: &str = "MATRIX_CHANNEL_CONFIG";

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Matrix adapter settings (`[matrix]`).
    pub matrix: MatrixConfig,
    /// Message bus settings (`[bus]`).
    pub bus: BusConfig,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// If the file does not exist, defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        let mut config = Self::load_from_path(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config file path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env(CONFIG_PATH_ENV).map_or_else(|| PathBuf::from("config.toml"), PathBuf::from)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("MATRIX_HOMESERVER") {
            self.matrix.homeserver = v;
        }
        if let Some(v) = env("MATRIX_USER_ID") {
            self.matrix.user_id = v;
        }
        if let Some(v) = env("MATRIX_ACCESS_TOKEN") {
            self.matrix.access_token = v;
        }
        if let Some(v) = env("MATRIX_DEVICE_ID") {
            self.matrix.device_id = v;
        }
        if let Some(v) = env("MATRIX_DATA_DIR") {
            self.matrix.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("MATRIX_SYNC_STOP_GRACE_SECS") {
            match v.parse() {
                Ok(n) => self.matrix.sync_stop_grace_seconds = n,
                Err(_) => tracing::warn!(
                    var = "MATRIX_SYNC_STOP_GRACE_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Check that an enabled adapter has everything it needs to connect.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first missing or malformed field.
    pub fn validate(&self) -> Result<()> {
        let m = &self.matrix;
        if !m.enabled {
            return Ok(());
        }
        if m.homeserver.trim().is_empty() {
            anyhow::bail!("matrix.homeserver is required");
        }
        let url = url::Url::parse(&m.homeserver)
            .with_context(|| format!("matrix.homeserver is not a valid URL: {}", m.homeserver))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("matrix.homeserver must use http or https");
        }
        if m.user_id.trim().is_empty() {
            anyhow::bail!("matrix.user_id is required");
        }
        if m.access_token.trim().is_empty() {
            anyhow::bail!("matrix.access_token is required");
        }
        if self.bus.channel_capacity == 0 {
            anyhow::bail!("bus.channel_capacity must be greater than zero");
        }
        Ok(())
    }
}

// ── Matrix config ───────────────────────────────────────────────

/// How messages in group rooms are admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Every group message is processed.
    #[default]
    Open,
    /// Only rooms listed in `group_allow_from` are processed.
    Allowlist,
    /// Only messages that mention the bot are processed.
    Mention,
    /// Unrecognised policy string. Rejects everything.
    #[serde(other)]
    Unknown,
}

/// Matrix adapter configuration (`[matrix]`).
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Whether the adapter is enabled.
    pub enabled: bool,
    /// Homeserver base URL, e.g. `https://matrix.org`.
    pub homeserver: String,
    /// The bot's own Matrix user id, e.g. `@bot:matrix.org`.
    pub user_id: String,
    /// Access token for the bot account.
    pub access_token: String,
    /// Device id. Empty disables sync-cursor persistence.
    pub device_id: String,
    /// Sender ids allowed to talk to the bot. Empty means everyone.
    pub allow_from: Vec<String>,
    /// Admission policy for group rooms.
    pub group_policy: GroupPolicy,
    /// Room ids admitted under [`GroupPolicy::Allowlist`].
    pub group_allow_from: Vec<String>,
    /// Whether `@room` mentions count under [`GroupPolicy::Mention`].
    pub allow_room_mentions: bool,
    /// Seconds `stop` waits for the sync loop before cancelling it.
    pub sync_stop_grace_seconds: u64,
    /// Root for persisted state. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
}

impl MatrixConfig {
    /// Grace period granted to the sync loop on `stop`.
    pub fn sync_stop_grace(&self) -> Duration {
        Duration::from_secs(self.sync_stop_grace_seconds)
    }

    /// Directory the session persists its sync cursor in.
    ///
    /// `<data_dir>/matrix-store`, where `data_dir` falls back to the
    /// platform data directory, then to `./.matrix-channel`.
    pub fn store_dir(&self) -> PathBuf {
        let base = self.data_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("", "", "matrix-channel").map_or_else(
                || PathBuf::from(".matrix-channel"),
                |dirs| dirs.data_dir().to_path_buf(),
            )
        });
        base.join("matrix-store")
    }
}

impl std::fmt::Debug for MatrixConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixConfig")
            .field("enabled", &self.enabled)
            .field("homeserver", &self.homeserver)
            .field("user_id", &self.user_id)
            .field("access_token", &"__REDACTED__")
            .field("device_id", &self.device_id)
            .field("allow_from", &self.allow_from)
            .field("group_policy", &self.group_policy)
            .field("group_allow_from", &self.group_allow_from)
            .field("allow_room_mentions", &self.allow_room_mentions)
            .field("sync_stop_grace_seconds", &self.sync_stop_grace_seconds)
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            homeserver: "https://matrix.org".to_owned(),
            user_id: String::new(),
            access_token: String::new(),
            device_id: String::new(),
            allow_from: Vec::new(),
            group_policy: GroupPolicy::Open,
            group_allow_from: Vec::new(),
            allow_room_mentions: false,
            sync_stop_grace_seconds: 2,
            data_dir: None,
        }
    }
}

// ── Bus config ──────────────────────────────────────────────────

/// Message bus configuration (`[bus]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Buffer size for the inbound and outbound queues.
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
