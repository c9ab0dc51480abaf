//! Agent configuration.
//!
//! Loaded from a YAML file (JSON works too). Every field has a default, so an
//! empty or missing default config file yields a usable agent listening on
//! `127.0.0.1:7070`. Relative paths are resolved against the directory of the
//! config file.

mod duration;

pub use duration::{format_duration, parse_duration};

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{AgentError, Result};
use duration::{deserialize_duration, serialize_duration};

/// File name looked up in the agent state directory when no config is given
pub const DEFAULT_CONFIG_FILE: &str = "vigil.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    pub auth: AuthConfig,
    pub security: SecurityConfig,
    pub limits: LimitsConfig,
    pub storage: StorageConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7070,
            auth: AuthConfig::default(),
            security: SecurityConfig::default(),
            limits: LimitsConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// When false, connections start authenticated
    pub required: bool,
    /// JSON file holding `{"tokens": [...]}`
    pub tokens_file: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            required: true,
            tokens_file: PathBuf::from("tokens.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// Remote addresses allowed to connect; empty allows everyone
    pub remote_ip_whitelist: Vec<IpAddr>,
    /// Program names `oscmd` may run
    pub oscmd_whitelist: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            remote_ip_whitelist: Vec::new(),
            oscmd_whitelist: ["uptime", "whoami", "df", "ls"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub sampler: SamplerConfig,
    pub watch: WatchConfig,
    /// Upper bound for commands that spawn an external process
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub command_timeout: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            sampler: SamplerConfig::default(),
            watch: WatchConfig::default(),
            command_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplerConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub interval: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub window: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            window: Duration::from_secs(3600),
        }
    }
}

impl SamplerConfig {
    pub fn window_seconds(&self) -> i64 {
        self.window.as_secs() as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// Used when a watch request has no usable `time`
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub default_duration: Duration,
    /// Requested durations are clamped to this
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_duration: Duration,
    /// Observe subdirectories too
    pub recursive: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            default_duration: Duration::from_secs(60),
            max_duration: Duration::from_secs(3600),
            recursive: false,
        }
    }
}

impl WatchConfig {
    pub fn default_seconds(&self) -> i64 {
        self.default_duration.as_secs().max(1) as i64
    }

    pub fn max_seconds(&self) -> i64 {
        self.max_duration.as_secs().max(1) as i64
    }

    /// Effective watch length for a requested number of seconds.
    ///
    /// Absent, zero or negative requests use the default; the result is
    /// always within `[1, max]`.
    pub fn effective_seconds(&self, requested: Option<i64>) -> i64 {
        let seconds = match requested {
            Some(s) if s > 0 => s,
            _ => self.default_seconds(),
        };
        seconds.clamp(1, self.max_seconds())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding one `<watchId>.json` per watch
    pub db_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("data"),
        }
    }
}

impl AgentConfig {
    /// Maximum config file size (1MB)
    const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

    /// Load and validate a config file, resolving relative paths against its directory
    pub fn load(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::ConfigNotFound(path.to_path_buf())
            } else {
                AgentError::Config(format!("Failed to stat config '{}': {}", path.display(), e))
            }
        })?;
        if metadata.len() > Self::MAX_CONFIG_FILE_SIZE {
            return Err(AgentError::Config(format!(
                "Config file '{}' is too large ({} bytes, max {} bytes)",
                path.display(),
                metadata.len(),
                Self::MAX_CONFIG_FILE_SIZE,
            )));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("Failed to read config '{}': {}", path.display(), e))
        })?;

        let mut config = Self::parse(&contents, path)?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.resolve_paths(&base_dir);
        config.validate()?;
        Ok(config)
    }

    /// Load the given config, or the default one from the state directory.
    ///
    /// Without an explicit path a missing default file is not an error: the
    /// built-in defaults are used, with relative paths under `state_dir`.
    pub fn load_or_default(path: Option<&Path>, state_dir: &Path) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let default_path = state_dir.join(DEFAULT_CONFIG_FILE);
        if default_path.exists() {
            return Self::load(&default_path);
        }

        let mut config = Self::default();
        config.resolve_paths(state_dir);
        config.validate()?;
        Ok(config)
    }

    /// Parse config text without resolving paths
    pub fn parse(contents: &str, path: &Path) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let de = serde_yaml::Deserializer::from_str(contents);
        serde_path_to_error::deserialize(de).map_err(|e| AgentError::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Make `tokens_file` and `db_dir` absolute relative to `base_dir`
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        if self.auth.tokens_file.is_relative() {
            self.auth.tokens_file = base_dir.join(&self.auth.tokens_file);
        }
        if self.storage.db_dir.is_relative() {
            self.storage.db_dir = base_dir.join(&self.storage.db_dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(AgentError::Config("host must not be empty".to_string()));
        }

        let sampler = &self.limits.sampler;
        if sampler.interval < Duration::from_secs(1) {
            return Err(AgentError::Config(format!(
                "limits.sampler.interval must be at least 1s (got {})",
                format_duration(&sampler.interval)
            )));
        }
        if sampler.window < sampler.interval {
            return Err(AgentError::Config(format!(
                "limits.sampler.window ({}) must not be shorter than the interval ({})",
                format_duration(&sampler.window),
                format_duration(&sampler.interval)
            )));
        }

        let watch = &self.limits.watch;
        if watch.default_duration < Duration::from_secs(1) {
            return Err(AgentError::Config(
                "limits.watch.default_duration must be at least 1s".to_string(),
            ));
        }
        if watch.max_duration < watch.default_duration {
            return Err(AgentError::Config(format!(
                "limits.watch.max_duration ({}) must not be shorter than default_duration ({})",
                format_duration(&watch.max_duration),
                format_duration(&watch.default_duration)
            )));
        }

        if self.limits.command_timeout.is_zero() {
            return Err(AgentError::Config(
                "limits.command_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` string suitable for binding, bracketing IPv6 literals
    pub fn listen_addr(&self) -> String {
        match self.host.parse::<Ipv6Addr>() {
            Ok(_) => format!("[{}]:{}", self.host, self.port),
            Err(_) => format!("{}:{}", self.host, self.port),
        }
    }
}
