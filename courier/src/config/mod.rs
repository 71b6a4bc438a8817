//! Configuration system for the Courier client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courier/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::connection::ReconnectConfig;
use crate::session::SessionConfig;
use crate::typing::TypingConfig;

/// Default REST API base.
pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000/api/";

/// Default socket base.
pub const DEFAULT_WS_BASE: &str = "ws://127.0.0.1:8000/ws/";

/// Lower bound for the first reconnect delay.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);

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

    /// A base URL setting is not a valid URL.
    #[error("invalid {field} url {value:?}: {source}")]
    InvalidUrl {
        /// Which setting.
        field: &'static str,
        /// The rejected value.
        value: String,
        /// Parser error.
        source: url::ParseError,
    },

    /// A periodic setting was set to zero.
    #[error("{field} must be greater than zero")]
    ZeroInterval {
        /// Which setting.
        field: &'static str,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    auth: AuthFileConfig,
    realtime: RealtimeFileConfig,
    typing: TypingFileConfig,
    presence: PresenceFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    api_base: Option<String>,
    ws_base: Option<String>,
}

/// `[auth]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthFileConfig {
    username: Option<String>,
}

/// `[realtime]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RealtimeFileConfig {
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    stability_threshold_secs: Option<u64>,
    reconnect_jitter: Option<f64>,
    inbox_reconnect: Option<bool>,
    keepalive_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    event_buffer: Option<usize>,
    command_buffer: Option<usize>,
}

/// `[typing]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TypingFileConfig {
    start_interval_ms: Option<u64>,
    stop_delay_ms: Option<u64>,
    peer_expiry_ms: Option<u64>,
}

/// `[presence]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PresenceFileConfig {
    poll_interval_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// REST API base URL.
    pub api_base: Url,
    /// Socket base URL.
    pub ws_base: Url,

    // -- Auth --
    /// Username to sign in with.
    pub username: Option<String>,
    /// Password (CLI or environment only, never read from the file).
    pub password: Option<String>,

    // -- Realtime --
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// Whether the inbox channel reconnects.
    pub inbox_reconnect: bool,
    /// Presence keepalive interval.
    pub keepalive: Duration,
    /// Socket handshake timeout.
    pub connect_timeout: Duration,
    /// Capacity of event channels.
    pub event_buffer: usize,
    /// Capacity of room command channels.
    pub command_buffer: usize,

    // -- Typing --
    /// Typing windows.
    pub typing: TypingConfig,

    // -- Presence --
    /// Presence poll interval.
    pub presence_interval: Duration,
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. If no `--config` is given, the default path
    /// (`~/.config/courier/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or a base URL is invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let session = SessionConfig::new(parse_url("ws_base", DEFAULT_WS_BASE)?);
        let reconnect = ReconnectConfig::default();
        let typing = TypingConfig::default();
        let rt = &file.realtime;

        let api_base = cli
            .api_base
            .as_deref()
            .or(file.server.api_base.as_deref())
            .unwrap_or(DEFAULT_API_BASE);
        let ws_base = cli
            .ws_base
            .as_deref()
            .or(file.server.ws_base.as_deref())
            .unwrap_or(DEFAULT_WS_BASE);

        Ok(Self {
            api_base: parse_url("api_base", api_base)?,
            ws_base: parse_url("ws_base", ws_base)?,
            username: cli
                .username
                .clone()
                .or_else(|| file.auth.username.clone()),
            password: cli.password.clone(),
            reconnect: ReconnectConfig {
                initial_delay: rt
                    .reconnect_initial_ms
                    .map_or(reconnect.initial_delay, Duration::from_millis)
                    .max(MIN_RECONNECT_DELAY),
                max_delay: rt
                    .reconnect_max_ms
                    .map_or(reconnect.max_delay, Duration::from_millis),
                max_attempts: rt.reconnect_max_attempts.or(reconnect.max_attempts),
                stability_threshold: rt
                    .stability_threshold_secs
                    .map_or(reconnect.stability_threshold, Duration::from_secs),
                jitter: rt
                    .reconnect_jitter
                    .map_or(reconnect.jitter, |j| j.clamp(0.0, 1.0)),
            },
            inbox_reconnect: rt.inbox_reconnect.unwrap_or(session.inbox_reconnect),
            keepalive: nonzero_secs("keepalive_secs", rt.keepalive_secs)?
                .unwrap_or(session.keepalive),
            connect_timeout: nonzero_secs("connect_timeout_secs", rt.connect_timeout_secs)?
                .unwrap_or(session.connect_timeout),
            event_buffer: rt.event_buffer.unwrap_or(session.event_buffer).max(1),
            command_buffer: rt.command_buffer.unwrap_or(session.command_buffer).max(1),
            typing: TypingConfig {
                start_interval: file
                    .typing
                    .start_interval_ms
                    .map_or(typing.start_interval, Duration::from_millis),
                stop_delay: file
                    .typing
                    .stop_delay_ms
                    .map_or(typing.stop_delay, Duration::from_millis),
                peer_expiry: file
                    .typing
                    .peer_expiry_ms
                    .map_or(typing.peer_expiry, Duration::from_millis),
            },
            presence_interval: nonzero_secs("poll_interval_secs", file.presence.poll_interval_secs)?
                .unwrap_or(session.presence_interval),
        })
    }

    /// Realtime settings for a [`Session`](crate::session::Session).
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ws_base: self.ws_base.clone(),
            reconnect: self.reconnect.clone(),
            inbox_reconnect: self.inbox_reconnect,
            keepalive: self.keepalive,
            connect_timeout: self.connect_timeout,
            event_buffer: self.event_buffer,
            command_buffer: self.command_buffer,
            typing: self.typing.clone(),
            presence_interval: self.presence_interval,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Args, Debug, Default)]
pub struct CliArgs {
    /// REST API base URL.
    #[arg(long, global = true, env = "COURIER_API_BASE")]
    pub api_base: Option<String>,

    /// WebSocket base URL.
    #[arg(long, global = true, env = "COURIER_WS_BASE")]
    pub ws_base: Option<String>,

    /// Username to sign in with.
    #[arg(long, short, global = true, env = "COURIER_USERNAME")]
    pub username: Option<String>,

    /// Password to sign in with.
    #[arg(long, global = true, env = "COURIER_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Path to config file (default: `~/.config/courier/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info", env = "COURIER_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/courier.log`).
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
        field,
        value: value.to_owned(),
        source,
    })
}

fn nonzero_secs(field: &'static str, value: Option<u64>) -> Result<Option<Duration>, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::ZeroInterval { field }),
        other => Ok(other.map(Duration::from_secs)),
    }
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("courier").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
