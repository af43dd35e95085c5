use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use humansize::{format_size, DECIMAL};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;
use crate::config::EnhanceConfig;

/// Shortest pause between two sweeps of the background loop
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Result of one retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    pub bytes_freed: u64,
    pub failures: Vec<(PathBuf, String)>,
}

/// Space taken by the regular files under one directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirUsage {
    pub dir: PathBuf,
    pub file_count: u64,
    pub total_bytes: u64,
    pub total_formatted: String,
}

/// Sum the regular files below `dir`; a missing directory counts as empty
pub fn disk_usage(dir: &Path) -> DirUsage {
    let mut file_count = 0;
    let mut total_bytes = 0;

    if dir.exists() {
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => {
                    file_count += 1;
                    total_bytes += meta.len();
                }
                Err(e) => warn!("Failed to stat {}: {}", entry.path().display(), e),
            }
        }
    }

    DirUsage {
        dir: dir.to_path_buf(),
        file_count,
        total_bytes,
        total_formatted: format_size(total_bytes, DECIMAL),
    }
}

/// Deletes working files older than the configured age, whatever their job state
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    roots: Vec<PathBuf>,
    max_age: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(roots: Vec<PathBuf>, max_age: Duration, interval: Duration) -> Self {
        Self { roots, max_age, interval }
    }

    pub fn from_config(cfg: &EnhanceConfig) -> Self {
        Self::new(
            cfg.working_dirs().iter().map(|p| p.to_path_buf()).collect(),
            cfg.retention_max_age(),
            cfg.retention_interval(),
        )
    }

    /// Current usage of every root
    pub fn usage(&self) -> Vec<DirUsage> {
        self.roots.iter().map(|root| disk_usage(root)).collect()
    }

    /// Walk every root once and delete expired regular files
    pub fn sweep_once(&self) -> SweepReport {
        self.sweep_at(SystemTime::now())
    }

    fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        let mut files_checked = 0;

        for root in &self.roots {
            if !root.exists() {
                debug!("Retention root does not exist: {}", root.display());
                continue;
            }

            for entry in WalkDir::new(root).follow_links(false) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("Error reading directory entry: {}", e);
                        continue;
                    }
                };

                if !entry.file_type().is_file() {
                    continue;
                }
                files_checked += 1;

                let path = entry.path();
                let meta = match entry.metadata() {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Failed to stat {}: {}", path.display(), e);
                        continue;
                    }
                };

                // unknown or future mtimes count as fresh
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|m| now.duration_since(m).ok())
                    .unwrap_or_default();
                if age <= self.max_age {
                    continue;
                }

                match std::fs::remove_file(path) {
                    Ok(()) => {
                        debug!("Expired {} (age {}s)", path.display(), age.as_secs());
                        report.bytes_freed += meta.len();
                        report.deleted.push(path.to_path_buf());
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!("Failed to delete expired file {}: {}", path.display(), e);
                        report.failures.push((path.to_path_buf(), e.to_string()));
                    }
                }
            }
        }

        if report.deleted.is_empty() && report.failures.is_empty() {
            debug!("Retention sweep: {} files checked, nothing expired", files_checked);
        } else {
            info!("🧹 Retention sweep: deleted {} of {} files, freed {} ({} failures)",
                  report.deleted.len(),
                  files_checked,
                  format_size(report.bytes_freed, DECIMAL),
                  report.failures.len());
        }

        report
    }

    /// Sweep every interval until `shutdown` fires
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Retention sweeper started: max age {}s, every {}s",
                  self.max_age.as_secs(), self.interval.as_secs());

            // tokio panics on a zero period
            let mut ticker = tokio::time::interval(self.interval.max(MIN_SWEEP_INTERVAL));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let sweeper = self.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || sweeper.sweep_once()).await {
                            warn!("Retention sweep task failed: {}", e);
                        }
                    }
                }
            }

            info!("Retention sweeper stopped");
        })
    }
}
