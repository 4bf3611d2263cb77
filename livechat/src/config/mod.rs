//! Configuration for the `livechat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/livechat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::chat::queue::QueueConfig;
use crate::client::ClientSettings;
use crate::connection::ReconnectConfig;
use crate::recovery::RecoveryConfig;
use crate::typing::TypingConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// Could not determine the user's config directory.
    #[error("could not determine config directory (no HOME or XDG_CONFIG_HOME)")]
    NoConfigDir,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    delivery: DeliveryFileConfig,
    typing: TypingFileConfig,
    recovery: RecoveryFileConfig,
}

/// `[network]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    server_url: Option<String>,
    api_url: Option<String>,
    user_id: Option<String>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
    event_capacity: Option<usize>,
}

/// `[reconnect]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

/// `[delivery]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DeliveryFileConfig {
    max_retries: Option<u32>,
    retry_spacing_ms: Option<u64>,
}

/// `[typing]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TypingFileConfig {
    emit_interval_ms: Option<u64>,
    expiry_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
}

/// `[recovery]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RecoveryFileConfig {
    health_interval_secs: Option<u64>,
    probe_timeout_secs: Option<u64>,
    staleness_secs: Option<u64>,
    settle_delay_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Everything needed to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// WebSocket URL of the realtime channel.
    pub server_url: String,
    /// Base URL of the HTTP data service.
    pub api_url: String,
    /// The session user.
    pub user_id: String,
    /// Bearer token for both the channel and the data service.
    pub token: String,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Realtime channel WebSocket URL.
    pub server_url: Option<String>,
    /// Data service base URL. Derived from `server_url` when unset.
    pub api_url: Option<String>,
    /// Session user id.
    pub user_id: Option<String>,
    /// Bearer token (CLI or environment only).
    pub token: Option<String>,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Wait for the server's answer to `auth`.
    pub handshake_timeout: Duration,
    /// Outbound/inbound channel buffer.
    pub channel_capacity: usize,

    // -- Components --
    /// Reconnect, queue, typing, and recovery tuning.
    pub settings: ClientSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_url: None,
            user_id: None,
            token: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            channel_capacity: 256,
            settings: ClientSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an explicit config file cannot be read or
    /// if any config file fails to parse.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let d = defaults.settings;
        let ms = Duration::from_millis;
        let secs = Duration::from_secs;

        let settings = ClientSettings {
            reconnect: ReconnectConfig {
                initial_delay: file
                    .reconnect
                    .initial_delay_ms
                    .map_or(d.reconnect.initial_delay, ms),
                max_delay: file
                    .reconnect
                    .max_delay_ms
                    .map_or(d.reconnect.max_delay, ms),
                max_attempts: file
                    .reconnect
                    .max_attempts
                    .unwrap_or(d.reconnect.max_attempts),
            },
            queue: QueueConfig {
                max_retries: file.delivery.max_retries.unwrap_or(d.queue.max_retries),
                retry_spacing: file
                    .delivery
                    .retry_spacing_ms
                    .map_or(d.queue.retry_spacing, ms),
            },
            typing: TypingConfig {
                emit_interval: file
                    .typing
                    .emit_interval_ms
                    .map_or(d.typing.emit_interval, ms),
                expiry: file.typing.expiry_ms.map_or(d.typing.expiry, ms),
                idle_timeout: file
                    .typing
                    .idle_timeout_ms
                    .map_or(d.typing.idle_timeout, ms),
            },
            recovery: RecoveryConfig {
                health_interval: file
                    .recovery
                    .health_interval_secs
                    .map_or(d.recovery.health_interval, secs),
                probe_timeout: file
                    .recovery
                    .probe_timeout_secs
                    .map_or(d.recovery.probe_timeout, secs),
                staleness: file
                    .recovery
                    .staleness_secs
                    .map_or(d.recovery.staleness, secs),
                settle_delay: file
                    .recovery
                    .settle_delay_ms
                    .map_or(d.recovery.settle_delay, ms),
            },
            event_capacity: file.network.event_capacity.unwrap_or(d.event_capacity),
        };

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| file.network.server_url.clone()),
            api_url: cli.api_url.clone().or_else(|| file.network.api_url.clone()),
            user_id: cli.user_id.clone().or_else(|| file.network.user_id.clone()),
            token: cli.token.clone(),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, secs),
            handshake_timeout: file
                .network
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            settings,
        }
    }

    /// Build a [`SessionConfig`] if the server URL, user id, and token are
    /// all present.
    ///
    /// Without an explicit `api_url` the data service is assumed to live on
    /// the same host as the channel (`ws` → `http`, `wss` → `https`).
    #[must_use]
    pub fn session(&self) -> Option<SessionConfig> {
        let server_url = self.server_url.clone()?;
        let user_id = self.user_id.clone().filter(|u| !u.is_empty())?;
        let token = self.token.clone().filter(|t| !t.is_empty())?;
        let api_url = match &self.api_url {
            Some(url) => url.clone(),
            None => derive_api_url(&server_url)?,
        };
        Some(SessionConfig {
            server_url,
            api_url,
            user_id,
            token,
        })
    }
}

/// `ws://host:port/anything` → `http://host:port`.
fn derive_api_url(server_url: &str) -> Option<String> {
    let mut url = url::Url::parse(server_url).ok()?;
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    url.set_path("");
    url.set_query(None);
    Some(url.as_str().trim_end_matches('/').to_string())
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Realtime chat client core, driven from stdin")]
pub struct CliArgs {
    /// WebSocket URL of the realtime channel.
    #[arg(long, env = "LIVECHAT_SERVER_URL")]
    pub server_url: Option<String>,

    /// Base URL of the HTTP data service.
    #[arg(long, env = "LIVECHAT_API_URL")]
    pub api_url: Option<String>,

    /// Session user id.
    #[arg(long, env = "LIVECHAT_USER_ID")]
    pub user_id: Option<String>,

    /// Bearer token.
    #[arg(long, env = "LIVECHAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Path to config file (default: `~/.config/livechat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "LIVECHAT_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Default config file location.
///
/// # Errors
///
/// [`ConfigError::NoConfigDir`] when the platform has no config directory.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("livechat").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }
    let Ok(path) = default_config_path() else {
        return Ok(ConfigFile::default());
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
