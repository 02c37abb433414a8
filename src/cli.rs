use std::path::PathBuf;

use clap::Parser;

use crate::config::{ConfigLayer, FileNamingStrategy};

/// Command-line overrides. Anything left out falls through to the config file and then the
/// built-in defaults.
#[derive(Parser, Debug, Default)]
#[command(
    name = "dirhost",
    about = "Dirhost: upload, download, delete and browse a directory tree over HTTP",
    version,
    author
)]
pub struct Cli {
    /// JSON config file
    #[arg(long, env = "DIRHOST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory to serve
    #[arg(long, env = "DIRHOST_DIR")]
    pub dir: Option<PathBuf>,

    /// Address to listen on, host:port
    #[arg(long, env = "DIRHOST_ADDR")]
    pub addr: Option<String>,

    /// Maximum upload size in bytes
    #[arg(long, env = "DIRHOST_MAX_UPLOAD_SIZE")]
    pub max_upload_size: Option<u64>,

    /// Shutdown drain timeout in milliseconds
    #[arg(long, env = "DIRHOST_SHUTDOWN_TIMEOUT")]
    pub shutdown_timeout: Option<u64>,

    /// Per-chunk request body read timeout in milliseconds
    #[arg(long, env = "DIRHOST_READ_TIMEOUT")]
    pub read_timeout: Option<u64>,

    /// Response timeout in milliseconds
    #[arg(long, env = "DIRHOST_WRITE_TIMEOUT")]
    pub write_timeout: Option<u64>,

    /// Enable authentication (`--enable-auth`, `--enable-auth=false`)
    #[arg(long, env = "DIRHOST_ENABLE_AUTH", num_args = 0..=1, default_missing_value = "true")]
    pub enable_auth: Option<bool>,

    /// Enable permissive CORS (`--enable-cors`, `--enable-cors=false`)
    #[arg(long, env = "DIRHOST_ENABLE_CORS", num_args = 0..=1, default_missing_value = "true")]
    pub enable_cors: Option<bool>,

    /// How stored uploads are named
    #[arg(long, env = "DIRHOST_FILE_NAMING_STRATEGY", value_enum)]
    pub file_naming_strategy: Option<FileNamingStrategy>,
}

impl Cli {
    /// The highest-priority configuration layer.
    pub fn overrides(&self) -> ConfigLayer {
        ConfigLayer {
            addr: self.addr.clone(),
            work_dir: self.dir.clone(),
            max_upload_size: self.max_upload_size,
            shutdown_timeout_ms: self.shutdown_timeout,
            read_timeout_ms: self.read_timeout,
            write_timeout_ms: self.write_timeout,
            enable_auth: self.enable_auth,
            enable_cors: self.enable_cors,
            file_naming_strategy: self.file_naming_strategy,
        }
    }
}
