use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use crate::progress::remove_if_exists;

/// Role of a file within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Input,
    Output,
}

/// One file tracked for a client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionFileRecord {
    pub session_id: String,
    pub path: PathBuf,
    pub kind: FileKind,
    pub registered_at: DateTime<Utc>,
}

/// What a session cleanup did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted: Vec<PathBuf>,
    /// Registered files that no longer existed
    pub missing: usize,
    pub failures: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    fn merge(&mut self, other: CleanupReport) {
        self.deleted.extend(other.deleted);
        self.missing += other.missing;
        self.failures.extend(other.failures);
    }
}

/// Groups uploaded and produced files by client session for bulk deletion
///
/// Lives for the whole process; nothing is persisted.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Vec<SessionFileRecord>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<SessionFileRecord>>> {
        // the map stays consistent even if a holder panicked
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a file; registering the same path twice keeps one entry
    pub fn register(&self, session_id: &str, path: &Path, kind: FileKind) {
        let mut sessions = self.lock();
        let files = sessions.entry(session_id.to_string()).or_default();
        if files.iter().any(|f| f.path == path) {
            return;
        }
        files.push(SessionFileRecord {
            session_id: session_id.to_string(),
            path: path.to_path_buf(),
            kind,
            registered_at: Utc::now(),
        });
    }

    pub fn files(&self, session_id: &str) -> Vec<SessionFileRecord> {
        self.lock().get(session_id).cloned().unwrap_or_default()
    }

    pub fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Delete every file of a session and forget the session
    pub async fn cleanup_session(&self, session_id: &str) -> CleanupReport {
        // never hold the lock across an await
        let files = self.lock().remove(session_id).unwrap_or_default();
        let mut report = CleanupReport::default();

        for file in files {
            match remove_if_exists(&file.path).await {
                Ok(true) => report.deleted.push(file.path),
                Ok(false) => report.missing += 1,
                Err(e) => {
                    warn!("Session {}: failed to delete {}: {}", session_id, file.path.display(), e);
                    report.failures.push((file.path, e.to_string()));
                }
            }
        }

        info!("🧹 Session {}: deleted {} files ({} already gone, {} failures)",
              session_id, report.deleted.len(), report.missing, report.failures.len());
        report
    }

    /// Clean every session, used at shutdown
    pub async fn cleanup_all(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for session_id in self.sessions() {
            report.merge(self.cleanup_session(&session_id).await);
        }
        report
    }
}
