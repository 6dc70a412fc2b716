//! Collaborators the backup pipeline drives. Concrete versions live in
//! `crate::local` and `crate::remote`; tests substitute their own.

use std::io::{Read, Write};
use std::path::Path;

use crate::cancel::CancellationToken;
use crate::config::BackupKey;
use crate::error::Result;
use crate::media::MediaObject;
use crate::outcome::{RemoteOutcome, ValidationOutcome};

pub trait AttachmentStore: Send + Sync {
    /// Fills in cryptographic metadata for attachments awaiting archive upload.
    /// Returns how many records were repaired; 0 when there is nothing to do.
    fn repair_missing_metadata(&self) -> Result<usize>;

    fn has_pending_archive_uploads(&self) -> Result<bool>;

    /// Archivable media, in a stable order.
    fn media_objects(&self) -> Result<Vec<MediaObject>>;
}

pub type AppendFn<'a> = dyn FnMut(&[u8]) -> Result<()> + 'a;
pub type MediaCursorFn<'a> = dyn FnMut(&mut dyn Iterator<Item = MediaObject>) -> Result<()> + 'a;

/// Everything an exporter gets for one run.
pub struct ExportRequest<'a> {
    /// Main output. Flush it before calling `append`.
    pub sink: &'a mut dyn Write,
    pub key: &'a BackupKey,
    /// Appends bytes after everything already flushed to `sink`.
    pub append: &'a mut AppendFn<'a>,
    pub plaintext: bool,
    pub cancel: &'a CancellationToken,
    /// Run start, in milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// Present when media backup is enabled.
    pub media: Option<&'a mut MediaCursorFn<'a>>,
}

pub trait Exporter: Send + Sync {
    /// I/O failures are fatal to the run and propagate as errors.
    fn export(&self, req: ExportRequest<'_>) -> Result<()>;
}

pub trait Validator: Send + Sync {
    fn validate(&self, artifact: &Path, key: &BackupKey) -> ValidationOutcome;
}

pub trait RemoteBackup: Send + Sync {
    fn upload(&self, stream: &mut dyn Read, len: u64) -> RemoteOutcome<()>;
    fn query_used_space(&self) -> RemoteOutcome<u64>;
}
