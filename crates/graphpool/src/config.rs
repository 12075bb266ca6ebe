//! Endpoint configuration for a managed connection factory.
//!
//! Parsed from TOML (or built in code) once, before the factory starts.
//! Every field has a default, so an empty document is a valid configuration
//! pointing at a local store with a `3..=20` pool.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::error::{PoolError, PoolResult};
use crate::pool::PoolBounds;
use crate::store::Endpoint;

/// Default store address: a local, path-like database location.
pub const DEFAULT_CONNECTION_URL: &str = "local:../databases/temp-orientdb";

/// Behavior of `stop()` when managed connections are still live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopPolicy {
    /// Close the pool anyway, force-closing checked-out connections (default).
    #[default]
    Force,
    /// Fail with `StopRefused` while the live-handle counter is above zero.
    Refuse,
}

/// Verbosity for a log destination.
///
/// Accepts the usual Rust level names as well as the java.util.logging
/// names graph store deployments tend to carry in their descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Convert to a `tracing` level filter.
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(LogLevel::Off),
            "error" | "severe" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" | "config" => Ok(LogLevel::Info),
            "debug" | "fine" => Ok(LogLevel::Debug),
            "trace" | "finer" | "finest" | "all" => Ok(LogLevel::Trace),
            other => Err(PoolError::Config(format!("unknown log level: {other}"))),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = PoolError;

    fn try_from(value: String) -> Result<Self, PoolError> {
        value.parse()
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.to_string()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}

/// Configuration for one managed connection factory.
///
/// Immutable once handed to the factory. Pool bounds are signed here so a
/// negative value in a deployment descriptor surfaces as `InvalidBounds`
/// instead of a parse failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Store address, e.g. `local:/data/graph` or `remote:db.local/graph`.
    pub connection_url: String,
    pub username: String,
    pub password: String,
    /// Advertise XA (distributed) transaction support instead of local.
    pub xa: bool,
    /// Log the effective configuration when the factory starts.
    pub dump_config: bool,
    /// Record acquisition timings in pool statistics.
    pub profiler: bool,
    pub console_level: LogLevel,
    pub file_level: LogLevel,
    pub pool_min_size: i32,
    pub pool_max_size: i32,
    /// Character encoding requested from the store client.
    pub encoding: String,
    /// How long `acquire()` waits for a free slot, e.g. `"5s"` or `"250ms"`.
    pub acquire_timeout: String,
    pub stop_policy: StopPolicy,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            connection_url: DEFAULT_CONNECTION_URL.to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            xa: true,
            dump_config: false,
            profiler: false,
            console_level: LogLevel::Info,
            file_level: LogLevel::Info,
            pool_min_size: 3,
            pool_max_size: 20,
            encoding: "utf8".to_string(),
            acquire_timeout: "5s".to_string(),
            stop_policy: StopPolicy::Force,
        }
    }
}

impl EndpointConfig {
    /// Parse a configuration from a TOML document.
    pub fn from_toml_str(content: &str) -> PoolResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load a configuration from a TOML file.
    pub fn from_file(path: &Path) -> PoolResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check every field that can be wrong independently of the store.
    pub fn validate(&self) -> PoolResult<()> {
        self.bounds()?;
        self.acquire_timeout()?;
        if self.encoding.trim().is_empty() {
            return Err(PoolError::Config("encoding must not be empty".to_string()));
        }
        if self.connection_url.trim().is_empty() {
            return Err(PoolError::Config("connection_url must not be empty".to_string()));
        }
        Ok(())
    }

    /// Checked pool bounds.
    pub fn bounds(&self) -> PoolResult<PoolBounds> {
        PoolBounds::new(i64::from(self.pool_min_size), i64::from(self.pool_max_size))
    }

    /// Parsed acquisition timeout.
    pub fn acquire_timeout(&self) -> PoolResult<Duration> {
        parse_duration(&self.acquire_timeout).ok_or_else(|| {
            PoolError::Config(format!("invalid acquire_timeout: {:?}", self.acquire_timeout))
        })
    }

    /// The part of the configuration the store client sees.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            address: self.connection_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            encoding: self.encoding.clone(),
        }
    }

    /// Render the configuration for a startup dump, with the password masked.
    pub fn dump(&self) -> String {
        let redacted = Self {
            password: "********".to_string(),
            ..self.clone()
        };
        toml::to_string_pretty(&redacted).unwrap_or_else(|err| format!("<unrenderable: {err}>"))
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
