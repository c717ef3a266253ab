//! Agent configuration management.
//!
//! Configuration is stored as TOML, by default in
//! `~/.config/filerelay/relay.toml`. A missing file is created with the
//! defaults on first run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use filerelay_http_source::HttpSourceConfig;
use filerelay_transfer::{NameConflict, RetryPolicy, TransferConfig};
use serde::{Deserialize, Serialize};

/// Agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transfer: TransferSection,

    #[serde(default)]
    pub http: HttpSection,

    #[serde(default)]
    pub storage: StorageSection,
}

/// `[transfer]`: pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSection {
    /// Chunk size in KiB.
    #[serde(default = "default_chunk_size_kib")]
    pub chunk_size_kib: u64,

    /// Chunks buffered between download and upload.
    #[serde(default = "default_buffer_chunks")]
    pub buffer_chunks: usize,

    #[serde(default = "default_timeout_secs")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub upload_timeout_secs: u64,

    /// Attempts per side, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Progress step in MiB when the size is unknown.
    #[serde(default = "default_unknown_size_step_mib")]
    pub unknown_size_step_mib: u64,

    /// Minimum spacing of byte-count progress updates when the size is
    /// unknown (0 = every step). Percentage updates are never held back.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    #[serde(default = "default_progress_queue")]
    pub progress_queue: usize,

    #[serde(default = "default_progress_flush_timeout_ms")]
    pub progress_flush_timeout_ms: u64,
}

fn default_chunk_size_kib() -> u64 {
    1024
}

fn default_buffer_chunks() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    10
}

fn default_unknown_size_step_mib() -> u64 {
    10
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_progress_queue() -> usize {
    32
}

fn default_progress_flush_timeout_ms() -> u64 {
    2000
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size_kib: default_chunk_size_kib(),
            buffer_chunks: default_buffer_chunks(),
            download_timeout_secs: default_timeout_secs(),
            upload_timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            unknown_size_step_mib: default_unknown_size_step_mib(),
            progress_interval_ms: default_progress_interval_ms(),
            progress_queue: default_progress_queue(),
            progress_flush_timeout_ms: default_progress_flush_timeout_ms(),
        }
    }
}

impl TransferSection {
    pub fn to_transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: usize::try_from(self.chunk_size_kib.saturating_mul(1024))
                .unwrap_or(usize::MAX),
            buffer_chunks: self.buffer_chunks,
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            upload_timeout: Duration::from_secs(self.upload_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                delay: Duration::from_secs(self.retry_delay_secs),
            },
            unknown_size_step: self.unknown_size_step_mib.saturating_mul(1024 * 1024),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            progress_queue: self.progress_queue,
            progress_flush_timeout: Duration::from_millis(self.progress_flush_timeout_ms),
        }
    }
}

/// `[http]`: URL source client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSection {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_user_agent() -> String {
    HttpSourceConfig::default().user_agent
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl HttpSection {
    pub fn to_source_config(&self) -> HttpSourceConfig {
        HttpSourceConfig {
            user_agent: self.user_agent.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

/// `[storage]`: where files end up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    /// Directory receiving stored files. `~` expands to the home directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Base URL under which `output_dir` is served, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,

    #[serde(default)]
    pub on_conflict: NameConflict,

    /// Directory that relative attachment handles resolve against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments_dir: Option<String>,
}

fn default_output_dir() -> String {
    "~/filerelay".into()
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            public_base_url: None,
            on_conflict: NameConflict::default(),
            attachments_dir: None,
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or creates a default there if not found.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the default configuration file path.
pub fn default_path() -> PathBuf {
    home_dir().join(".config").join("filerelay").join("relay.toml")
}

/// Expands a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix('~') {
        Some("") => home_dir(),
        Some(rest) if rest.starts_with('/') => home_dir().join(&rest[1..]),
        _ => PathBuf::from(path),
    }
}

fn home_dir() -> PathBuf {
    #[cfg(windows)]
    let var = "USERPROFILE";
    #[cfg(not(windows))]
    let var = "HOME";
    std::env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}
