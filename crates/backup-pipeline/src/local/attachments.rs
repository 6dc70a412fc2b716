use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::collab::AttachmentStore;
use crate::error::{Error, Result};
use crate::media::MediaObject;
use crate::util::{load_json_or_default, save_json};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: String,
    /// Relative to the attachments directory.
    pub file: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub archive_uploaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttachmentIndexDoc {
    version: u32,
    attachments: Vec<AttachmentRecord>,
}

impl Default for AttachmentIndexDoc {
    fn default() -> Self {
        Self {
            version: 1,
            attachments: Vec::new(),
        }
    }
}

/// Attachment metadata kept in `<data_dir>/attachments/index.json`.
pub struct LocalAttachments {
    dir: PathBuf,
    // Serializes read-modify-write of the index file.
    lock: Mutex<()>,
}

impl LocalAttachments {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("attachments"),
            lock: Mutex::new(()),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    fn load(&self) -> Result<AttachmentIndexDoc> {
        load_json_or_default(&self.index_path(), "attachment index")
    }

    pub fn records(&self) -> Result<Vec<AttachmentRecord>> {
        Ok(self.load()?.attachments)
    }
}

fn sha256_file_hex(path: &Path) -> Result<String> {
    let mut f = fs::File::open(path)
        .map_err(|e| Error::io(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| Error::io(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl AttachmentStore for LocalAttachments {
    fn repair_missing_metadata(&self) -> Result<usize> {
        let _g = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut doc = self.load()?;
        let mut repaired = 0usize;
        for rec in doc.attachments.iter_mut() {
            if rec.archive_uploaded || rec.digest.is_some() {
                continue;
            }
            let path = self.dir.join(&rec.file);
            if !path.is_file() {
                tracing::warn!(attachment = %rec.id, path = %path.display(), "cannot repair attachment; file missing");
                continue;
            }
            rec.digest = Some(sha256_file_hex(&path)?);
            repaired = repaired.saturating_add(1);
        }
        if repaired > 0 {
            save_json(&self.index_path(), &doc, "attachment index")?;
        }
        Ok(repaired)
    }

    fn has_pending_archive_uploads(&self) -> Result<bool> {
        Ok(self.load()?.attachments.iter().any(|r| !r.archive_uploaded))
    }

    fn media_objects(&self) -> Result<Vec<MediaObject>> {
        let mut out: Vec<MediaObject> = self
            .load()?
            .attachments
            .into_iter()
            .filter_map(|r| {
                r.digest.map(|digest| MediaObject {
                    media_id: r.id,
                    digest,
                })
            })
            .collect();
        out.sort_by(|a, b| a.media_id.cmp(&b.media_id));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(dir: &Path, records: &[AttachmentRecord]) {
        let adir = dir.join("attachments");
        fs::create_dir_all(&adir).expect("attachments dir");
        let doc = AttachmentIndexDoc {
            version: 1,
            attachments: records.to_vec(),
        };
        save_json(&adir.join("index.json"), &doc, "attachment index").expect("index");
    }

    fn rec(id: &str, uploaded: bool) -> AttachmentRecord {
        AttachmentRecord {
            id: id.into(),
            file: format!("{id}.bin"),
            digest: None,
            archive_uploaded: uploaded,
        }
    }

    #[test]
    fn repair_is_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        seed(tmp.path(), &[rec("a", false), rec("b", false), rec("gone", false)]);
        fs::write(tmp.path().join("attachments/a.bin"), b"aaa").expect("a");
        fs::write(tmp.path().join("attachments/b.bin"), b"bbb").expect("b");

        let store = LocalAttachments::new(tmp.path());
        assert_eq!(store.repair_missing_metadata().expect("repair"), 2);
        assert_eq!(store.repair_missing_metadata().expect("repair again"), 0);
        assert_eq!(store.repair_missing_metadata().expect("repair thrice"), 0);

        let digests: Vec<_> = store
            .records()
            .expect("records")
            .into_iter()
            .map(|r| r.digest.is_some())
            .collect();
        assert_eq!(digests, vec![true, true, false]);
    }

    #[test]
    fn uploaded_records_are_left_alone() {
        let tmp = tempfile::tempdir().expect("tempdir");
        seed(tmp.path(), &[rec("done", true)]);
        fs::write(tmp.path().join("attachments/done.bin"), b"x").expect("file");
        let store = LocalAttachments::new(tmp.path());
        assert_eq!(store.repair_missing_metadata().expect("repair"), 0);
        assert!(!store.has_pending_archive_uploads().expect("pending"));
    }

    #[test]
    fn media_objects_need_a_digest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut with = rec("z", false);
        with.digest = Some("abc".into());
        seed(tmp.path(), &[with, rec("y", false)]);
        let store = LocalAttachments::new(tmp.path());
        let objs = store.media_objects().expect("objects");
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].media_id, "z");
        assert!(store.has_pending_archive_uploads().expect("pending"));
    }

    #[test]
    fn missing_index_means_nothing_pending() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = LocalAttachments::new(tmp.path());
        assert_eq!(store.repair_missing_metadata().expect("repair"), 0);
        assert!(!store.has_pending_archive_uploads().expect("pending"));
        assert!(store.media_objects().expect("objects").is_empty());
    }
}
