//! Configuration model and logging setup shared by the Tether crates.
//!
//! Configuration lives in a single TOML document:
//!
//! ```toml
//! [logging]
//! level = "debug"
//!
//! [service]
//! request_timeout_ms = 30000
//! view_wait_attempts = 5
//! ```
//!
//! Every key is optional; missing keys fall back to the defaults documented on
//! each field.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::prelude::*;

/// Environment variable consulted by binaries when no `--config` flag is given.
pub const CONFIG_ENV_VAR: &str = "TETHER_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Keep just the message; the default `Display` embeds a source snippet.
        ConfigError::Toml(err.message().to_string())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TetherConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

impl TetherConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Logging level for all Tether crates.
    ///
    /// Either a simple level (`info`, `debug`, ...) or a full `EnvFilter`
    /// directive string such as `tether.rpc=trace,info`.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,

    /// Mirror logs to stderr.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file path.
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks
    /// remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            // Anything else is treated as an `EnvFilter` directive string.
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Create the effective `EnvFilter`.
    ///
    /// If `RUST_LOG` is set, it is merged into the resulting filter.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

/// Connection, timeout and polling knobs for the VM service client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Timeout for ordinary requests.
    #[serde(default = "ServiceConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Timeout for fire-and-forget toggles.
    #[serde(default = "ServiceConfig::default_short_timeout_ms")]
    pub short_timeout_ms: u64,

    /// Timeout for expensive requests (view enumeration, timeline capture, dumps).
    #[serde(default = "ServiceConfig::default_long_timeout_ms")]
    pub long_timeout_ms: u64,

    /// How many times opening the channel is attempted before giving up.
    #[serde(default = "ServiceConfig::default_connect_attempts")]
    pub connect_attempts: u32,

    /// Delay before the second connection attempt; doubled after every failure.
    #[serde(default = "ServiceConfig::default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,

    /// Number of extra polls while waiting for the first view to appear.
    #[serde(default = "ServiceConfig::default_view_wait_attempts")]
    pub view_wait_attempts: u32,

    /// Delay between view polls.
    #[serde(default = "ServiceConfig::default_view_wait_delay_ms")]
    pub view_wait_delay_ms: u64,

    /// Capacity of each per-stream event broadcast channel.
    #[serde(default = "ServiceConfig::default_event_channel_size")]
    pub event_channel_size: usize,

    /// Alias announced with the `reloadSources` service registration.
    #[serde(default = "ServiceConfig::default_client_alias")]
    pub client_alias: String,
}

impl ServiceConfig {
    fn default_request_timeout_ms() -> u64 {
        30_000
    }

    fn default_short_timeout_ms() -> u64 {
        5_000
    }

    fn default_long_timeout_ms() -> u64 {
        60_000
    }

    fn default_connect_attempts() -> u32 {
        10
    }

    fn default_connect_retry_delay_ms() -> u64 {
        100
    }

    fn default_view_wait_attempts() -> u32 {
        5
    }

    fn default_view_wait_delay_ms() -> u64 {
        1_000
    }

    fn default_event_channel_size() -> usize {
        256
    }

    fn default_client_alias() -> String {
        "Tether".to_owned()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn short_timeout(&self) -> Duration {
        Duration::from_millis(self.short_timeout_ms)
    }

    pub fn long_timeout(&self) -> Duration {
        Duration::from_millis(self.long_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn view_wait_delay(&self) -> Duration {
        Duration::from_millis(self.view_wait_delay_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: Self::default_request_timeout_ms(),
            short_timeout_ms: Self::default_short_timeout_ms(),
            long_timeout_ms: Self::default_long_timeout_ms(),
            connect_attempts: Self::default_connect_attempts(),
            connect_retry_delay_ms: Self::default_connect_retry_delay_ms(),
            view_wait_attempts: Self::default_view_wait_attempts(),
            view_wait_delay_ms: Self::default_view_wait_delay_ms(),
            event_channel_size: Self::default_event_channel_size(),
            client_alias: Self::default_client_alias(),
        }
    }
}

static TRACING_INIT: Once = Once::new();

/// Initializes structured `tracing` logging.
///
/// Safe to call multiple times; only the first call installs a global
/// subscriber. If another subscriber is already installed the call is a no-op.
pub fn init_tracing(logging: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = logging.env_filter();

        let file = logging
            .file
            .as_ref()
            .and_then(|path| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .ok()
            })
            .map(Arc::new);

        let mut make_writer = if logging.stderr {
            // `cargo test` output capture only works for the stdlib's `eprint!`
            // machinery, which `TestWriter` goes through.
            if cfg!(debug_assertions) {
                BoxMakeWriter::new(tracing_subscriber::fmt::writer::TestWriter::with_stderr)
            } else {
                BoxMakeWriter::new(std::io::stderr)
            }
        } else {
            BoxMakeWriter::new(std::io::sink)
        };
        if let Some(file) = file {
            make_writer = BoxMakeWriter::new(make_writer.and(file));
        }

        let result = if logging.json {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(make_writer)
                        .with_ansi(false),
                )
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(make_writer)
                        .with_ansi(false),
                )
                .try_init()
        };

        if let Err(err) = result {
            tracing::debug!(target: "tether.config", error = %err, "tracing subscriber already installed");
        }
    });
}
