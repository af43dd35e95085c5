use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the enhancement job manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhanceConfig {
    /// Directory holding uploaded source files
    pub uploads_dir: PathBuf,
    /// Directory where enhanced outputs are written
    pub processed_dir: PathBuf,
    /// Directory for progress records and other scratch files
    pub temp_dir: PathBuf,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Hard time budget for a single encode, in seconds
    pub encode_timeout_secs: u64,
    /// Smallest output size (bytes) accepted as a plausible encode
    pub min_output_bytes: u64,
    /// An output modified this recently is assumed to still be written
    pub recency_window_secs: u64,
    /// A non-terminal progress record older than this is treated as stale
    pub record_stale_secs: u64,
    /// Minimum spacing between two progress record writes, in milliseconds
    pub progress_write_interval_ms: u64,
    /// Files older than this are removed by the retention sweep
    pub retention_max_age_secs: u64,
    /// Interval between retention sweeps
    pub retention_interval_secs: u64,
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl EnhanceConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            uploads_dir: PathBuf::from("uploads"),
            processed_dir: PathBuf::from("processed"),
            temp_dir: PathBuf::from("temp"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            encode_timeout_secs: 10 * 60,
            min_output_bytes: 1024,
            recency_window_secs: 5,
            record_stale_secs: 30,
            progress_write_interval_ms: 2000,
            retention_max_age_secs: 60 * 60,
            retention_interval_secs: 15 * 60,
        }
    }

    /// Default configuration rooted at `base` instead of the working directory
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            uploads_dir: base.join("uploads"),
            processed_dir: base.join("processed"),
            temp_dir: base.join("temp"),
            ..Self::default_config()
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Reject values that would stall or spin the job manager and sweeper
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("encode_timeout_secs", self.encode_timeout_secs),
            ("retention_max_age_secs", self.retention_max_age_secs),
            ("retention_interval_secs", self.retention_interval_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        Ok(())
    }

    /// Create every working directory that does not exist yet
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in self.working_dirs() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Directories covered by the retention sweep
    pub fn working_dirs(&self) -> [&Path; 3] {
        [&self.uploads_dir, &self.processed_dir, &self.temp_dir]
    }

    pub fn encode_timeout(&self) -> Duration {
        Duration::from_secs(self.encode_timeout_secs)
    }

    pub fn recency_window(&self) -> Duration {
        Duration::from_secs(self.recency_window_secs)
    }

    pub fn record_stale_after(&self) -> Duration {
        Duration::from_secs(self.record_stale_secs)
    }

    pub fn progress_write_interval(&self) -> Duration {
        Duration::from_millis(self.progress_write_interval_ms)
    }

    pub fn retention_max_age(&self) -> Duration {
        Duration::from_secs(self.retention_max_age_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }
}
