use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_ADDR: &str = "127.0.0.1:8888";
const DEFAULT_MAX_UPLOAD_SIZE: u64 = 500 * 1024 * 1024; // 500MB
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 60_000;

/// How an uploaded file is named on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FileNamingStrategy {
    /// Random v4 UUID, keeping the original extension
    Uuid,
    /// The client-supplied file name
    #[default]
    Original,
}

/// One configuration source. `None` means "not specified by this layer".
///
/// Layers stack as built-in defaults < JSON config file < command line. An explicit `false`
/// on the command line beats a `true` from the file; an omitted flag leaves the file alone.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub addr: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub max_upload_size: Option<u64>,
    #[serde(rename = "shutdown_time")]
    pub shutdown_timeout_ms: Option<u64>,
    #[serde(rename = "read_timeout")]
    pub read_timeout_ms: Option<u64>,
    #[serde(rename = "write_timeout")]
    pub write_timeout_ms: Option<u64>,
    pub enable_auth: Option<bool>,
    pub enable_cors: Option<bool>,
    pub file_naming_strategy: Option<FileNamingStrategy>,
}

impl ConfigLayer {
    pub fn defaults() -> Self {
        Self {
            addr: Some(DEFAULT_ADDR.to_string()),
            work_dir: Some(PathBuf::from(".")),
            max_upload_size: Some(DEFAULT_MAX_UPLOAD_SIZE),
            shutdown_timeout_ms: Some(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            read_timeout_ms: Some(DEFAULT_READ_TIMEOUT_MS),
            write_timeout_ms: Some(DEFAULT_WRITE_TIMEOUT_MS),
            enable_auth: None,
            enable_cors: None,
            file_naming_strategy: Some(FileNamingStrategy::Original),
        }
    }

    /// Read a layer from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Empty strings and zero numbers count as "not specified".
    fn normalized(self) -> Self {
        Self {
            addr: self.addr.filter(|a| !a.trim().is_empty()),
            work_dir: self.work_dir.filter(|d| !d.as_os_str().is_empty()),
            max_upload_size: self.max_upload_size.filter(|&n| n > 0),
            shutdown_timeout_ms: self.shutdown_timeout_ms.filter(|&n| n > 0),
            read_timeout_ms: self.read_timeout_ms.filter(|&n| n > 0),
            write_timeout_ms: self.write_timeout_ms.filter(|&n| n > 0),
            ..self
        }
    }

    /// Lay `higher` on top of `self`.
    pub fn merge(self, higher: ConfigLayer) -> ConfigLayer {
        let lower = self.normalized();
        let higher = higher.normalized();
        ConfigLayer {
            addr: higher.addr.or(lower.addr),
            work_dir: higher.work_dir.or(lower.work_dir),
            max_upload_size: higher.max_upload_size.or(lower.max_upload_size),
            shutdown_timeout_ms: higher.shutdown_timeout_ms.or(lower.shutdown_timeout_ms),
            read_timeout_ms: higher.read_timeout_ms.or(lower.read_timeout_ms),
            write_timeout_ms: higher.write_timeout_ms.or(lower.write_timeout_ms),
            enable_auth: higher.enable_auth.or(lower.enable_auth),
            enable_cors: higher.enable_cors.or(lower.enable_cors),
            file_naming_strategy: higher.file_naming_strategy.or(lower.file_naming_strategy),
        }
    }
}

/// Effective, validated runtime configuration. Built once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    /// `host:port` to listen on; host names are resolved at bind time
    pub addr: String,
    /// Canonical absolute path of the served root
    pub work_dir: PathBuf,
    pub max_upload_size: u64,
    pub shutdown_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub enable_auth: Option<bool>,
    pub enable_cors: Option<bool>,
    pub file_naming_strategy: FileNamingStrategy,
}

impl Config {
    /// Merge defaults, the optional config file and the command-line overrides.
    pub fn resolve(
        defaults: ConfigLayer,
        config_file: Option<&Path>,
        overrides: ConfigLayer,
    ) -> Result<Config, ConfigError> {
        let mut merged = defaults;
        if let Some(path) = config_file {
            merged = merged.merge(ConfigLayer::from_file(path)?);
            tracing::debug!(path = %path.display(), "loaded config file");
        }
        merged = merged.merge(overrides);
        Config::try_from(merged)
    }

    pub fn cors_enabled(&self) -> bool {
        self.enable_cors.unwrap_or(false)
    }

    pub fn auth_enabled(&self) -> bool {
        self.enable_auth.unwrap_or(false)
    }
}

impl TryFrom<ConfigLayer> for Config {
    type Error = ConfigError;

    fn try_from(layer: ConfigLayer) -> Result<Self, Self::Error> {
        let layer = layer.normalized();

        let addr = listen_addr(&required(layer.addr, "addr")?)?;

        let raw_dir = required(layer.work_dir, "work_dir")?;
        let work_dir = raw_dir.canonicalize().map_err(|e| {
            ConfigError::Merge(format!("work_dir '{}' is not accessible: {}", raw_dir.display(), e))
        })?;
        if !work_dir.is_dir() {
            return Err(ConfigError::Merge(format!(
                "work_dir '{}' is not a directory",
                work_dir.display()
            )));
        }

        Ok(Config {
            addr,
            work_dir,
            max_upload_size: required(layer.max_upload_size, "max_upload_size")?,
            shutdown_timeout: Duration::from_millis(required(layer.shutdown_timeout_ms, "shutdown_time")?),
            read_timeout: Duration::from_millis(required(layer.read_timeout_ms, "read_timeout")?),
            write_timeout: Duration::from_millis(required(layer.write_timeout_ms, "write_timeout")?),
            enable_auth: layer.enable_auth,
            enable_cors: layer.enable_cors,
            file_naming_strategy: required(layer.file_naming_strategy, "file_naming_strategy")?,
        })
    }
}

/// Accepts `host:port`, `[v6]:port` and the bare `:port` form, which listens on all interfaces.
fn listen_addr(raw: &str) -> Result<String, ConfigError> {
    let raw = raw.trim();
    let invalid = |why: &str| ConfigError::Merge(format!("addr '{}' is not host:port: {}", raw, why));

    let (host, port) = raw.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if port.parse::<u16>().is_err() {
        return Err(invalid("port must be a number between 0 and 65535"));
    }
    if host.chars().any(char::is_whitespace) {
        return Err(invalid("host contains whitespace"));
    }

    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(format!("{}:{}", host, port))
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::Merge(format!("no layer provides '{}'", field)))
}
