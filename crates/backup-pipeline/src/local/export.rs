use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use walkdir::WalkDir;

use crate::collab::{AttachmentStore, ExportRequest, Exporter};
use crate::error::{Error, Result};
use crate::local::format::{self, HashingWriter, Sealer};

/// Exports every file under `<data_dir>/messages` into one artifact.
pub struct DirExporter {
    messages_dir: PathBuf,
    attachments: Arc<dyn AttachmentStore>,
}

impl DirExporter {
    pub fn new(data_dir: &std::path::Path, attachments: Arc<dyn AttachmentStore>) -> Self {
        Self {
            messages_dir: data_dir.join("messages"),
            attachments,
        }
    }
}

fn write_frame<W: Write>(w: &mut W, tag: u8, body: &[u8]) -> Result<()> {
    w.write_all(&format::frame_header(tag, body.len())?)?;
    w.write_all(body)?;
    Ok(())
}

impl Exporter for DirExporter {
    fn export(&self, req: ExportRequest<'_>) -> Result<()> {
        let ExportRequest {
            sink,
            key,
            append,
            plaintext,
            cancel,
            timestamp_ms,
            media,
        } = req;

        let sealer = Sealer::new(key, !plaintext);
        let mut w = HashingWriter::new(BufWriter::new(sink));
        w.write_all(&format::encode_header(!plaintext, timestamp_ms))?;

        let mut files = 0usize;
        let mut skipped = 0usize;
        let mut cancelled = false;
        if self.messages_dir.is_dir() {
            for entry in WalkDir::new(&self.messages_dir).sort_by_file_name() {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let entry = entry.map_err(|e| {
                    Error::io(format!(
                        "failed to walk {}: {e}",
                        self.messages_dir.display()
                    ))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&self.messages_dir)
                    .map_err(|e| Error::msg(format!("unexpected walk path: {e}")))?;
                // Entry paths are stored as UTF-8.
                let Some(rel) = rel.to_str().map(|r| r.replace('\\', "/")) else {
                    tracing::warn!(path = %entry.path().display(), "skipping message file with a non-UTF-8 name");
                    skipped = skipped.saturating_add(1);
                    continue;
                };
                let data = fs::read(entry.path()).map_err(|e| {
                    Error::io(format!("failed to read {}: {e}", entry.path().display()))
                })?;
                let body = sealer.seal(format::encode_entry(&rel, &data)?)?;
                write_frame(&mut w, format::TAG_ENTRY, &body)?;
                files = files.saturating_add(1);
            }
        } else {
            tracing::debug!(dir = %self.messages_dir.display(), "no messages directory; exporting empty backup");
        }

        let mut media_objects = 0usize;
        if let Some(cb) = media {
            if !cancelled {
                let objects = self.attachments.media_objects()?;
                for o in &objects {
                    let body = sealer.seal(serde_json::to_vec(o)?)?;
                    write_frame(&mut w, format::TAG_MEDIA, &body)?;
                }
                media_objects = objects.len();
                cb(&mut objects.into_iter())?;
            }
        }

        let main_bytes = w.written();
        let digest = w.finish()?;
        append(&format::trailer(&digest))?;

        if cancelled {
            tracing::info!(files, skipped, "export cancelled; artifact closed early");
        } else {
            tracing::info!(files, skipped, media_objects, bytes = main_bytes, "export complete");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::config::BackupKey;
    use crate::local::LocalAttachments;

    fn export_plain(data_dir: &std::path::Path) -> Vec<u8> {
        let exporter = DirExporter::new(data_dir, Arc::new(LocalAttachments::new(data_dir)));
        let key = BackupKey::new([3u8; 32]);
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        let mut tail = Vec::new();
        {
            let mut append = |b: &[u8]| -> Result<()> {
                tail.extend_from_slice(b);
                Ok(())
            };
            exporter
                .export(ExportRequest {
                    sink: &mut out,
                    key: &key,
                    append: &mut append,
                    plaintext: true,
                    cancel: &cancel,
                    timestamp_ms: 1,
                    media: None,
                })
                .expect("export");
        }
        out.extend_from_slice(&tail);
        out
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn nested_paths_use_forward_slashes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("messages").join("thread-9");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("0001.json"), b"{}").expect("write");
        assert!(contains(&export_plain(tmp.path()), b"thread-9/0001.json"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn non_utf8_names_are_skipped_not_renamed() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("messages");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("kept.json"), b"kept body").expect("write");
        fs::write(dir.join(OsStr::from_bytes(b"bad\xffname.json")), b"odd body")
            .expect("write");

        let raw = export_plain(tmp.path());
        assert!(contains(&raw, b"kept.json"));
        assert!(contains(&raw, b"kept body"));
        assert!(!contains(&raw, b"odd body"));
        assert!(!contains(&raw, "bad\u{fffd}name".as_bytes()));
    }
}
