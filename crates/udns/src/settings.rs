//! Configuration: an optional file layered under `UDNS_`-prefixed
//! environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Which kind of deployment this is.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunEnv {
    Dev,
    Prod,
}

/// The minimum severity that gets logged.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Response cache capacity, in records.
    pub cache_size: u32,

    pub env: RunEnv,

    pub log_level: LogLevel,

    /// Port to serve DNS on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Interface to listen on.
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,

    /// Upstream nameservers, `host:port`, tried in order.
    #[serde(default = "default_upstreams")]
    pub upstreams: Vec<String>,

    /// Per-attempt upstream timeout, in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_seconds: u64,

    /// Blocklist decision cache capacity; 0 disables it.
    #[serde(default = "default_decision_cache_size")]
    pub decision_cache_size: u32,

    /// Target Bloom filter false-positive rate.
    #[serde(default = "default_bloom_fp_rate")]
    pub bloom_fp_rate: f64,

    /// Path of the blocklist database file.
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Zone files to serve authoritatively.
    #[serde(default)]
    pub zone_files: Vec<String>,

    /// Blocklist files (hosts format or bare domains).
    #[serde(default)]
    pub block_files: Vec<String>,
}

fn default_port() -> u16 {
    53
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_upstreams() -> Vec<String> {
    vec!["1.1.1.1:53".to_string(), "8.8.8.8:53".to_string()]
}

fn default_upstream_timeout() -> u64 {
    5
}

fn default_decision_cache_size() -> u32 {
    4096
}

fn default_bloom_fp_rate() -> f64 {
    0.01
}

fn default_store_path() -> String {
    "blocklist.redb".to_string()
}

impl Settings {
    /// Load from the file named by `UDNS_CONFIG` (when set) plus the
    /// `UDNS_`-prefixed environment, then validate.
    ///
    /// # Errors
    ///
    /// If a source cannot be read, a required field is missing or the
    /// wrong type, or a value fails validation.
    pub fn load() -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Ok(path) = std::env::var("UDNS_CONFIG") {
            builder = builder.add_source(File::with_name(&path));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("UDNS")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("upstreams")
                    .with_list_parse_key("zone_files")
                    .with_list_parse_key("block_files"),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// # Errors
    ///
    /// If a value is out of its allowed range.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.cache_size == 0 {
            return Err(SettingsError::CacheSizeZero);
        }
        if self.port == 0 || self.port == u16::MAX {
            return Err(SettingsError::PortOutOfRange { port: self.port });
        }
        if self.upstreams.is_empty() {
            return Err(SettingsError::NoUpstreams);
        }
        for upstream in &self.upstreams {
            if SocketAddr::from_str(upstream).is_err() {
                return Err(SettingsError::BadUpstream {
                    address: upstream.clone(),
                });
            }
        }
        Ok(())
    }

    /// The upstream list as socket addresses.  Call after `validate`.
    pub fn upstream_addrs(&self) -> Vec<SocketAddr> {
        self.upstreams
            .iter()
            .filter_map(|upstream| SocketAddr::from_str(upstream).ok())
            .collect()
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }
}

/// An error loading or validating the configuration.  All of these
/// are fatal at startup: the process exits nonzero.
#[derive(Debug)]
pub enum SettingsError {
    /// A source could not be read or deserialised.
    Config(ConfigError),

    /// The response cache must hold at least one record.
    CacheSizeZero,

    /// The port must be in 1..65535.
    PortOutOfRange { port: u16 },

    /// At least one upstream server is needed.
    NoUpstreams,

    /// An upstream is not a `host:port` socket address.
    BadUpstream { address: String },
}

impl From<ConfigError> for SettingsError {
    fn from(error: ConfigError) -> Self {
        SettingsError::Config(error)
    }
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SettingsError::Config(error) => write!(f, "could not load configuration: {error}"),
            SettingsError::CacheSizeZero => write!(f, "cache_size must be at least 1"),
            SettingsError::PortOutOfRange { port } => {
                write!(f, "port {port} is outside 1..65535")
            }
            SettingsError::NoUpstreams => write!(f, "at least one upstream server is required"),
            SettingsError::BadUpstream { address } => {
                write!(f, "upstream '{address}' is not a host:port address")
            }
        }
    }
}

impl std::error::Error for SettingsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SettingsError::Config(error) => Some(error),
            _ => None,
        }
    }
}
