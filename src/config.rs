// Configuration schema for the opcport channel stack.

use std::{
    env, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::chunk::{ChunkLimits, CHUNK_HDR_LEN};

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] Box<toml::de::Error>),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// High-level configuration loaded at startup. All state is in-memory; nothing
/// is persisted across restarts.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Chunk transport bounds.
    pub transport: TransportConfig,
    /// Connection slot pool and token bounds.
    pub channels: ChannelConfig,
    /// Pending request bounds.
    pub requests: RequestConfig,
    /// Session table bounds.
    pub sessions: SessionConfig,
}

impl Config {
    /// Loads configuration from `OPCPORT_CONFIG` if set, otherwise returns defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("OPCPORT_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_missing) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Validates the configuration, returning an error when constraints are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate().map_err(ConfigError::Validation)?;
        self.channels.validate().map_err(ConfigError::Validation)?;
        self.requests.validate().map_err(ConfigError::Validation)?;
        self.sessions.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }

    /// Returns the chunk codec limits derived from the transport section.
    pub fn chunk_limits(&self) -> ChunkLimits {
        ChunkLimits {
            max_chunk_size: self.transport.max_chunk_size as usize,
            max_chunk_count: self.transport.max_chunk_count,
            max_message_size: self.transport.max_message_size as usize,
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s).map_err(Box::new)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Chunk transport bounds shared by both directions of every connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum size of one chunk in bytes, header included.
    pub max_chunk_size: u32,
    /// Maximum number of chunks one logical message may use.
    pub max_chunk_count: u32,
    /// Maximum reassembled message size in bytes.
    pub max_message_size: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 65_535,
            max_chunk_count: 12,
            max_message_size: 262_144,
        }
    }
}

impl TransportConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_chunk_size as usize <= CHUNK_HDR_LEN {
            return Err(format!(
                "transport.max_chunk_size must exceed the {CHUNK_HDR_LEN} byte header"
            ));
        }
        if self.max_chunk_count == 0 {
            return Err("transport.max_chunk_count must be non-zero".into());
        }
        if (self.max_message_size as usize) < self.max_chunk_size as usize - CHUNK_HDR_LEN {
            return Err("transport.max_message_size must hold at least one full chunk body".into());
        }
        Ok(())
    }
}

/// Connection slot pool and security-token bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Maximum concurrent secure connections (primary slots).
    pub max_connections: u32,
    /// Extra slot allocation, as a percentage of `max_connections`, used only
    /// to absorb connections that are being closed.
    pub overalloc_percent: u32,
    /// Deadline for a connection to leave Connecting/Negotiating, in milliseconds.
    pub connection_timeout_ms: u64,
    /// Floor applied to requested token lifetimes, in milliseconds.
    pub min_token_lifetime_ms: u64,
    /// Default token lifetime requested by initiators, in milliseconds.
    pub requested_token_lifetime_ms: u64,
    /// Delay before retrying a failed reverse connection, in milliseconds.
    pub reverse_retry_delay_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            overalloc_percent: 25,
            connection_timeout_ms: 10_000,
            min_token_lifetime_ms: 10_000,
            requested_token_lifetime_ms: 3_600_000,
            reverse_retry_delay_ms: 1_000,
        }
    }
}

impl ChannelConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("channels.max_connections must be non-zero".into());
        }
        if self.overalloc_percent > 100 {
            return Err("channels.overalloc_percent must not exceed 100".into());
        }
        if self.connection_timeout_ms == 0 {
            return Err("channels.connection_timeout_ms must be non-zero".into());
        }
        if self.min_token_lifetime_ms == 0 {
            return Err("channels.min_token_lifetime_ms must be non-zero".into());
        }
        if self.requested_token_lifetime_ms < self.min_token_lifetime_ms {
            return Err(
                "channels.requested_token_lifetime_ms must be >= min_token_lifetime_ms".into(),
            );
        }
        Ok(())
    }

    /// Number of buffered slots beyond the primary allocation, rounded up.
    pub fn buffered_slots(&self) -> u32 {
        (self.max_connections * self.overalloc_percent).div_ceil(100)
    }

    /// Connection establishment deadline.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Minimum security token lifetime.
    pub fn min_token_lifetime(&self) -> Duration {
        Duration::from_millis(self.min_token_lifetime_ms)
    }

    /// Default requested token lifetime.
    pub fn requested_token_lifetime(&self) -> Duration {
        Duration::from_millis(self.requested_token_lifetime_ms)
    }

    /// Delay before a reverse connection is retried.
    pub fn reverse_retry_delay(&self) -> Duration {
        Duration::from_millis(self.reverse_retry_delay_ms)
    }
}

/// Pending request bounds, per channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Deadline for a response to arrive, in milliseconds.
    pub timeout_ms: u64,
    /// Maximum simultaneously outstanding requests per channel.
    pub max_pending: u32,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_pending: 128,
        }
    }
}

impl RequestConfig {
    fn validate(&self) -> Result<(), String> {
        if self.timeout_ms == 0 {
            return Err("requests.timeout_ms must be non-zero".into());
        }
        if self.max_pending == 0 {
            return Err("requests.max_pending must be non-zero".into());
        }
        Ok(())
    }

    /// Per-request response deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Session table bounds and authentication policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum concurrent sessions across all channels.
    pub max_global: u32,
    /// Maximum concurrent sessions per channel.
    pub max_per_channel: u32,
    /// Lower bound applied to requested session timeouts, in milliseconds.
    pub timeout_min_ms: u64,
    /// Upper bound applied to requested session timeouts, in milliseconds.
    pub timeout_max_ms: u64,
    /// Timeout used when the caller does not request one, in milliseconds.
    pub timeout_default_ms: u64,
    /// Consecutive authentication failures tolerated before lockout.
    pub max_auth_failures: u32,
    /// Duration of the per-channel session creation lockout, in milliseconds.
    pub lockout_ms: u64,
    /// Age below which an unactivated session is never reclaimed, in milliseconds.
    pub min_activation_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_global: 150,
            max_per_channel: 5,
            timeout_min_ms: 10_000,
            timeout_max_ms: 600_000,
            timeout_default_ms: 60_000,
            max_auth_failures: 3,
            lockout_ms: 60_000,
            min_activation_delay_ms: 1_000,
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_global == 0 {
            return Err("sessions.max_global must be non-zero".into());
        }
        if self.max_per_channel == 0 {
            return Err("sessions.max_per_channel must be non-zero".into());
        }
        if self.timeout_min_ms > self.timeout_max_ms {
            return Err("sessions.timeout_min_ms must be <= timeout_max_ms".into());
        }
        if self.timeout_default_ms < self.timeout_min_ms
            || self.timeout_default_ms > self.timeout_max_ms
        {
            return Err("sessions.timeout_default_ms must lie within [min, max]".into());
        }
        if self.max_auth_failures == 0 {
            return Err("sessions.max_auth_failures must be non-zero".into());
        }
        if self.lockout_ms == 0 {
            return Err("sessions.lockout_ms must be non-zero".into());
        }
        Ok(())
    }

    /// Lower session timeout bound.
    pub fn timeout_min(&self) -> Duration {
        Duration::from_millis(self.timeout_min_ms)
    }

    /// Upper session timeout bound.
    pub fn timeout_max(&self) -> Duration {
        Duration::from_millis(self.timeout_max_ms)
    }

    /// Default session timeout.
    pub fn timeout_default(&self) -> Duration {
        Duration::from_millis(self.timeout_default_ms)
    }

    /// Lockout duration after repeated authentication failures.
    pub fn lockout(&self) -> Duration {
        Duration::from_millis(self.lockout_ms)
    }

    /// Minimum age before an unactivated session may be reclaimed.
    pub fn min_activation_delay(&self) -> Duration {
        Duration::from_millis(self.min_activation_delay_ms)
    }
}
