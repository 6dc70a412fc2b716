//! The message backup run: export, validate, upload, then bookkeeping.
//!
//! A run never loops or sleeps. It reports `RunOutcome::Retry` and lets the
//! scheduler decide when to come back. Faults that must not be retried leave
//! through the `Err` side of `run`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backup_pipeline_macros::Job;
use chrono::Utc;

use crate::cancel::CancellationToken;
use crate::collab::{
    AttachmentStore, ExportRequest, Exporter, MediaCursorFn, RemoteBackup, Validator,
};
use crate::config::BackupKey;
use crate::error::{Error, Result};
use crate::jobs::scheduler::RunnableJob;
use crate::jobs::{JobRequest, JobSpec, Scheduler};
use crate::media::{MediaObject, MediaSnapshotStore};
use crate::outcome::{RemoteOutcome, RunOutcome, ValidationOutcome};
use crate::progress::{BackupEvent, ProgressSink};
use crate::store::BookkeepingStore;

pub mod artifact;

pub use artifact::TemporaryArtifact;

const MEDIA_STAGE_BATCH: usize = 500;

/// Everything a run reads from or writes to. Built once per process and shared.
pub struct BackupContext {
    pub store: Arc<dyn BookkeepingStore>,
    pub media: Arc<dyn MediaSnapshotStore>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub exporter: Arc<dyn Exporter>,
    pub validator: Arc<dyn Validator>,
    pub remote: Arc<dyn RemoteBackup>,
    pub progress: Arc<dyn ProgressSink>,
    pub scheduler: Arc<dyn Scheduler>,
    pub key: BackupKey,
    /// Where temporary artifacts go; the system temp dir when unset.
    pub artifact_dir: Option<PathBuf>,
    pub default_backoff: Duration,
    /// Debug only. Normal runs always seal the artifact.
    pub plaintext: bool,
}

#[Job(
    kind = "backup.messages",
    max_attempts = 3,
    single_instance = true,
    network = "wifi",
    queue_after = "backup.digest_backfill"
)]
pub struct MessageBackupJob {
    ctx: Arc<BackupContext>,
    cancel: CancellationToken,
}

impl MessageBackupJob {
    pub fn new(ctx: Arc<BackupContext>) -> Self {
        Self {
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(ctx: Arc<BackupContext>, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run(&self) -> Result<RunOutcome> {
        let ctx = &*self.ctx;

        match ctx.attachments.repair_missing_metadata() {
            Ok(0) => {}
            Ok(repaired) => tracing::info!(repaired, "repaired attachments missing archive metadata"),
            Err(e) => tracing::warn!(error = %e, "attachment repair failed; continuing"),
        }

        ctx.progress.emit(BackupEvent::Begin);
        let snapshot_ts = Utc::now().timestamp_millis();
        let artifact = TemporaryArtifact::create(ctx.artifact_dir.as_deref())?;

        self.export(&artifact, snapshot_ts)?;

        match ctx.validator.validate(artifact.path(), &ctx.key) {
            ValidationOutcome::Success => {}
            ValidationOutcome::ReadError(cause) => {
                tracing::warn!(%cause, "could not read back backup artifact; will retry");
                return Ok(RunOutcome::Retry(ctx.default_backoff));
            }
            ValidationOutcome::ValidationError(cause) => {
                tracing::error!(%cause, "backup artifact failed validation");
                ctx.progress.emit(BackupEvent::ValidationFailed);
                return Ok(RunOutcome::Failure);
            }
        }

        if self.cancel.is_cancelled() {
            tracing::info!("backup cancelled before upload");
            return Ok(RunOutcome::Failure);
        }

        ctx.progress.emit(BackupEvent::ArtifactCreated);

        let len = artifact.len()?;
        let uploaded = {
            let mut reader = artifact.open_read()?;
            ctx.remote.upload(&mut reader, len)
        };
        match uploaded {
            RemoteOutcome::Success(()) => ctx.store.set_has_ever_uploaded(true)?,
            RemoteOutcome::NetworkError(cause) => {
                tracing::warn!(%cause, "backup upload hit a network error; will retry");
                return Ok(RunOutcome::Retry(ctx.default_backoff));
            }
            RemoteOutcome::StatusError(code, cause) => {
                tracing::warn!(code, %cause, "backup upload rejected; will retry");
                return Ok(RunOutcome::Retry(ctx.default_backoff));
            }
            RemoteOutcome::AppError(cause) => {
                return Err(Error::remote_app(format!("backup upload failed: {cause}")));
            }
        }

        ctx.store.set_last_artifact_size(len)?;
        let artifact_path = artifact.path().to_path_buf();
        if let Err(e) = artifact.delete() {
            tracing::warn!(path = %artifact_path.display(), error = %e, "failed to delete backup artifact");
        }
        ctx.store.set_last_backup_time(Utc::now())?;

        match ctx.remote.query_used_space() {
            RemoteOutcome::Success(used) => ctx.store.set_used_remote_space(used)?,
            RemoteOutcome::NetworkError(cause) => {
                tracing::info!(%cause, "could not refresh used remote space; keeping previous value");
            }
            RemoteOutcome::StatusError(code, cause) => {
                tracing::info!(code, %cause, "used remote space query rejected; keeping previous value");
            }
            RemoteOutcome::AppError(cause) => {
                return Err(Error::remote_app(format!(
                    "used remote space query failed: {cause}"
                )));
            }
        }

        if ctx.store.settings().backs_up_media && ctx.attachments.has_pending_archive_uploads()? {
            ctx.scheduler.enqueue(JobRequest::attachment_backfill())?;
        } else {
            ctx.progress.emit(BackupEvent::FinishedWithoutAttachments);
        }

        ctx.store.set_persistent_failure(false)?;
        let promoted = ctx.media.commit(snapshot_ts)?;
        ctx.scheduler
            .enqueue(JobRequest::media_snapshot_sync(snapshot_ts))?;

        tracing::info!(bytes = len, media = promoted, "backup complete");
        Ok(RunOutcome::Success)
    }

    fn export(&self, artifact: &TemporaryArtifact, snapshot_ts: i64) -> Result<()> {
        let ctx = &*self.ctx;
        let mut sink = artifact.writer()?;
        let mut append = |bytes: &[u8]| artifact.append(bytes);

        let staging = ctx.media.clone();
        let mut stage_media = |objects: &mut dyn Iterator<Item = MediaObject>| -> Result<()> {
            let mut batch = Vec::with_capacity(MEDIA_STAGE_BATCH);
            for o in objects {
                batch.push(o);
                if batch.len() >= MEDIA_STAGE_BATCH {
                    staging.stage(snapshot_ts, &batch)?;
                    batch.clear();
                }
            }
            staging.stage(snapshot_ts, &batch)
        };
        let media: Option<&mut MediaCursorFn<'_>> = if ctx.store.settings().backs_up_media {
            Some(&mut stage_media)
        } else {
            None
        };

        ctx.exporter
            .export(ExportRequest {
                sink: &mut sink,
                key: &ctx.key,
                append: &mut append,
                plaintext: ctx.plaintext,
                cancel: &self.cancel,
                timestamp_ms: snapshot_ts,
                media,
            })
            .inspect_err(|e| tracing::error!(error = %e, "backup export failed"))
    }

    /// Called by the scheduler once the run has failed for good.
    /// Cancelled runs are not failures and leave the flag alone.
    pub fn on_failure(&self) {
        if self.cancel.is_cancelled() {
            tracing::info!("backup cancelled; not recording a failure");
            return;
        }
        tracing::warn!("backup failed; marking last backup as failed");
        if let Err(e) = self.ctx.store.set_persistent_failure(true) {
            tracing::error!(error = %e, "failed to record backup failure");
        }
    }
}

impl RunnableJob for MessageBackupJob {
    fn kind_id(&self) -> &'static str {
        Self::KIND
    }

    fn run(&self) -> Result<RunOutcome> {
        MessageBackupJob::run(self)
    }

    fn on_failure(&self) {
        MessageBackupJob::on_failure(self)
    }
}
