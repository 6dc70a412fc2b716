use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BackupSettings;
use crate::error::{Error, Result};
use crate::util::{load_json_or_default, save_json};

/// Durable backup bookkeeping.
///
/// The store is process-wide and unlocked from the run's point of view: at most
/// one backup run mutates it at a time, which the scheduler guarantees.
pub trait BookkeepingStore: Send + Sync {
    fn settings(&self) -> BackupSettings;

    fn last_backup_time(&self) -> Option<DateTime<Utc>>;
    fn set_last_backup_time(&self, at: DateTime<Utc>) -> Result<()>;

    fn last_artifact_size(&self) -> u64;
    fn set_last_artifact_size(&self, bytes: u64) -> Result<()>;

    fn used_remote_space(&self) -> u64;
    fn set_used_remote_space(&self, bytes: u64) -> Result<()>;

    fn has_ever_uploaded(&self) -> bool;
    fn set_has_ever_uploaded(&self, v: bool) -> Result<()>;

    fn persistent_failure(&self) -> bool;
    fn set_persistent_failure(&self, v: bool) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookkeepingState {
    pub version: u32,
    pub last_backup_time: Option<DateTime<Utc>>,
    pub last_artifact_size: u64,
    pub used_remote_space: u64,
    pub has_ever_uploaded: bool,
    pub persistent_failure: bool,
}

/// JSON-file backed store. Every mutation is written through atomically.
pub struct JsonStore {
    path: Option<PathBuf>,
    settings: BackupSettings,
    state: Mutex<BookkeepingState>,
}

impl JsonStore {
    pub fn open(path: &Path, settings: BackupSettings) -> Result<Self> {
        let mut state: BookkeepingState = load_json_or_default(path, "bookkeeping state")?;
        state.version = 1;
        Ok(Self {
            path: Some(path.to_path_buf()),
            settings,
            state: Mutex::new(state),
        })
    }

    pub fn in_memory(settings: BackupSettings) -> Self {
        Self {
            path: None,
            settings,
            state: Mutex::new(BookkeepingState {
                version: 1,
                ..BookkeepingState::default()
            }),
        }
    }

    pub fn snapshot(&self) -> BookkeepingState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BookkeepingState> {
        // A poisoned lock still holds the last fully written state.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn update(&self, f: impl FnOnce(&mut BookkeepingState)) -> Result<()> {
        let mut g = self.lock();
        let mut next = g.clone();
        f(&mut next);
        if let Some(p) = self.path.as_deref() {
            save_json(p, &next, "bookkeeping state")
                .map_err(|e| Error::io(format!("bookkeeping update failed: {e}")))?;
        }
        *g = next;
        Ok(())
    }
}

impl BookkeepingStore for JsonStore {
    fn settings(&self) -> BackupSettings {
        self.settings
    }

    fn last_backup_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last_backup_time
    }

    fn set_last_backup_time(&self, at: DateTime<Utc>) -> Result<()> {
        self.update(|s| s.last_backup_time = Some(at))
    }

    fn last_artifact_size(&self) -> u64 {
        self.lock().last_artifact_size
    }

    fn set_last_artifact_size(&self, bytes: u64) -> Result<()> {
        self.update(|s| s.last_artifact_size = bytes)
    }

    fn used_remote_space(&self) -> u64 {
        self.lock().used_remote_space
    }

    fn set_used_remote_space(&self, bytes: u64) -> Result<()> {
        self.update(|s| s.used_remote_space = bytes)
    }

    fn has_ever_uploaded(&self) -> bool {
        self.lock().has_ever_uploaded
    }

    fn set_has_ever_uploaded(&self, v: bool) -> Result<()> {
        self.update(|s| s.has_ever_uploaded = v)
    }

    fn persistent_failure(&self) -> bool {
        self.lock().persistent_failure
    }

    fn set_persistent_failure(&self, v: bool) -> Result<()> {
        self.update(|s| s.persistent_failure = v)
    }
}

pub fn format_status_report(state: &BookkeepingState, settings: &BackupSettings) -> String {
    let mut out = String::new();
    out.push_str("BACKUP STATUS:\n");
    let last = state
        .last_backup_time
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".into());
    out.push_str(&format!("  last_backup: {last}\n"));
    out.push_str(&format!("  last_artifact_size: {}\n", state.last_artifact_size));
    out.push_str(&format!("  used_remote_space: {}\n", state.used_remote_space));
    out.push_str(&format!("  has_ever_uploaded: {}\n", state.has_ever_uploaded));
    out.push_str(&format!(
        "  last_backup_failed: {}\n",
        state.persistent_failure
    ));
    out.push_str(&format!(
        "  tier: {:?} media: {} optimize_storage: {} cellular: {}\n",
        settings.backup_tier,
        settings.backs_up_media,
        settings.optimize_storage,
        settings.cellular_allowed
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_survives_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("state.json");
        let now = Utc::now();
        {
            let s = JsonStore::open(&p, BackupSettings::default()).expect("open");
            s.set_last_backup_time(now).expect("ts");
            s.set_used_remote_space(42).expect("space");
            s.set_persistent_failure(true).expect("flag");
        }
        let s = JsonStore::open(&p, BackupSettings::default()).expect("reopen");
        assert_eq!(s.last_backup_time(), Some(now));
        assert_eq!(s.used_remote_space(), 42);
        assert!(s.persistent_failure());
        assert!(!s.has_ever_uploaded());
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("state.json");
        std::fs::write(&p, "{not json").expect("write");
        let err = JsonStore::open(&p, BackupSettings::default())
            .err()
            .expect("should fail")
            .to_string();
        assert!(err.contains("failed to parse bookkeeping state"), "unexpected err: {err}");
    }

    #[test]
    fn status_report_mentions_failure_flag() {
        let s = JsonStore::in_memory(BackupSettings::default());
        s.set_persistent_failure(true).expect("flag");
        let report = format_status_report(&s.snapshot(), &s.settings());
        assert!(report.contains("last_backup_failed: true"));
        assert!(report.contains("last_backup: never"));
    }
}
