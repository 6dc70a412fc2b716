use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::util::{load_json_or_default, save_json};

/// One archived attachment as seen by the media cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaObject {
    pub media_id: String,
    pub digest: String,
}

/// Staging area for the media ids a backup references.
///
/// Rows are tagged with the run timestamp that staged them; only that run may
/// promote them.
pub trait MediaSnapshotStore: Send + Sync {
    fn stage(&self, snapshot_ts: i64, objects: &[MediaObject]) -> Result<()>;
    /// Promotes rows staged under `snapshot_ts`, dropping pending rows of any other run.
    fn commit(&self, snapshot_ts: i64) -> Result<usize>;
    fn pending_count(&self, snapshot_ts: i64) -> usize;
    fn committed_count(&self) -> usize;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingRow {
    snapshot_ts: i64,
    object: MediaObject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommittedRow {
    digest: String,
    snapshot_ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotDoc {
    version: u32,
    pending: Vec<PendingRow>,
    committed: BTreeMap<String, CommittedRow>,
}

impl Default for SnapshotDoc {
    fn default() -> Self {
        Self {
            version: 1,
            pending: Vec::new(),
            committed: BTreeMap::new(),
        }
    }
}

pub struct JsonMediaSnapshots {
    path: Option<PathBuf>,
    doc: Mutex<SnapshotDoc>,
}

impl JsonMediaSnapshots {
    pub fn open(path: &Path) -> Result<Self> {
        let doc: SnapshotDoc = load_json_or_default(path, "media snapshot")?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            doc: Mutex::new(doc),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(SnapshotDoc::default()),
        }
    }

    pub fn committed_snapshot_ts(&self, media_id: &str) -> Option<i64> {
        self.lock().committed.get(media_id).map(|r| r.snapshot_ts)
    }

    fn lock(&self) -> MutexGuard<'_, SnapshotDoc> {
        self.doc.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn persist(&self, doc: &SnapshotDoc) -> Result<()> {
        match self.path.as_deref() {
            Some(p) => save_json(p, doc, "media snapshot"),
            None => Ok(()),
        }
    }
}

impl MediaSnapshotStore for JsonMediaSnapshots {
    fn stage(&self, snapshot_ts: i64, objects: &[MediaObject]) -> Result<()> {
        if objects.is_empty() {
            return Ok(());
        }
        let mut g = self.lock();
        let mut next = g.clone();
        for o in objects {
            next.pending.push(PendingRow {
                snapshot_ts,
                object: o.clone(),
            });
        }
        self.persist(&next)?;
        *g = next;
        Ok(())
    }

    fn commit(&self, snapshot_ts: i64) -> Result<usize> {
        let mut g = self.lock();
        let mut next = g.clone();
        let mut promoted = 0usize;
        for row in std::mem::take(&mut next.pending) {
            if row.snapshot_ts != snapshot_ts {
                continue;
            }
            next.committed.insert(
                row.object.media_id,
                CommittedRow {
                    digest: row.object.digest,
                    snapshot_ts,
                },
            );
            promoted = promoted.saturating_add(1);
        }
        self.persist(&next)?;
        *g = next;
        Ok(promoted)
    }

    fn pending_count(&self, snapshot_ts: i64) -> usize {
        self.lock()
            .pending
            .iter()
            .filter(|r| r.snapshot_ts == snapshot_ts)
            .count()
    }

    fn committed_count(&self) -> usize {
        self.lock().committed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(id: &str) -> MediaObject {
        MediaObject {
            media_id: id.to_string(),
            digest: format!("d-{id}"),
        }
    }

    #[test]
    fn commit_promotes_only_own_rows() {
        let s = JsonMediaSnapshots::in_memory();
        s.stage(100, &[obj("stale")]).expect("stage stale");
        s.stage(200, &[obj("a"), obj("b")]).expect("stage");
        assert_eq!(s.pending_count(200), 2);

        assert_eq!(s.commit(200).expect("commit"), 2);
        assert_eq!(s.committed_count(), 2);
        assert_eq!(s.pending_count(100), 0);
        assert_eq!(s.committed_snapshot_ts("a"), Some(200));
        assert_eq!(s.committed_snapshot_ts("stale"), None);
    }

    #[test]
    fn staged_rows_persist_until_commit() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("media.json");
        JsonMediaSnapshots::open(&p)
            .expect("open")
            .stage(7, &[obj("x")])
            .expect("stage");

        let s = JsonMediaSnapshots::open(&p).expect("reopen");
        assert_eq!(s.pending_count(7), 1);
        assert_eq!(s.committed_count(), 0);
        s.commit(7).expect("commit");
        assert_eq!(JsonMediaSnapshots::open(&p).expect("reopen").committed_count(), 1);
    }
}
