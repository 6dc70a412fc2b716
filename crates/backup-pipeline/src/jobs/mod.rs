use serde::{Deserialize, Serialize};

use backup_pipeline_macros::Job;

use crate::config::BackupSettings;
use crate::error::Result;

pub mod scheduler;

/// Kind of the job that backfills attachment digests; backups queue behind it.
pub const DIGEST_BACKFILL_KIND: &str = "backup.digest_backfill";

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkRequirement {
    Wifi,
    Any,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct JobOptions {
    pub max_attempts: u32,
    pub single_instance: bool,
    pub network: NetworkRequirement,
    /// Hold this job while a job of the named kind is still queued.
    pub queue_after: Option<String>,
}

/// Static description of a job type. Implemented through `#[Job(...)]`.
pub trait JobSpec {
    const KIND: &'static str;
    fn default_options() -> JobOptions;
}

#[Job(kind = "backup.attachment_backfill", max_attempts = 3, single_instance = true, network = "wifi")]
pub struct AttachmentBackfillJob;

#[Job(kind = "backup.prune_stale_media", max_attempts = 3, single_instance = true, network = "any")]
pub struct PruneStaleMediaJob;

#[Job(kind = "backup.optimize_storage", max_attempts = 1, single_instance = true, network = "any")]
pub struct OptimizeStorageJob;

#[Job(kind = "backup.media_snapshot_sync", max_attempts = 3, single_instance = true, network = "any")]
pub struct MediaSnapshotSyncJob;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    MessageBackup,
    AttachmentBackfill,
    PruneStaleMedia,
    OptimizeStorage,
    MediaSnapshotSync { snapshot_ts: i64 },
}

impl JobKind {
    pub fn kind_id(&self) -> &'static str {
        use crate::pipeline::MessageBackupJob;
        match self {
            Self::MessageBackup => MessageBackupJob::KIND,
            Self::AttachmentBackfill => AttachmentBackfillJob::KIND,
            Self::PruneStaleMedia => PruneStaleMediaJob::KIND,
            Self::OptimizeStorage => OptimizeStorageJob::KIND,
            Self::MediaSnapshotSync { .. } => MediaSnapshotSyncJob::KIND,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct JobRequest {
    pub kind: JobKind,
    pub options: JobOptions,
}

impl JobRequest {
    pub fn of<J: JobSpec>(kind: JobKind) -> Self {
        Self {
            kind,
            options: J::default_options(),
        }
    }

    pub fn attachment_backfill() -> Self {
        Self::of::<AttachmentBackfillJob>(JobKind::AttachmentBackfill)
    }

    pub fn prune_stale_media() -> Self {
        Self::of::<PruneStaleMediaJob>(JobKind::PruneStaleMedia)
    }

    pub fn optimize_storage() -> Self {
        Self::of::<OptimizeStorageJob>(JobKind::OptimizeStorage)
    }

    pub fn media_snapshot_sync(snapshot_ts: i64) -> Self {
        Self::of::<MediaSnapshotSyncJob>(JobKind::MediaSnapshotSync { snapshot_ts })
    }

    /// The backup job itself. Metered networks are only used when the user allows it.
    pub fn message_backup(settings: &BackupSettings) -> Self {
        use crate::pipeline::MessageBackupJob;
        let mut req = Self::of::<MessageBackupJob>(JobKind::MessageBackup);
        if settings.cellular_allowed {
            req.options.network = NetworkRequirement::Any;
        }
        req
    }
}

pub trait Scheduler: Send + Sync {
    fn enqueue(&self, job: JobRequest) -> Result<()>;
    /// Submits jobs that must run in the given order.
    fn enqueue_chain(&self, jobs: Vec<JobRequest>) -> Result<()>;
}

/// Builds the chain submitted when a backup is requested: the backup first,
/// then optional stale-media pruning, then optional storage optimization.
pub fn backup_chain(settings: &BackupSettings, prune_stale_media: bool) -> Vec<JobRequest> {
    let mut chain = vec![JobRequest::message_backup(settings)];
    if prune_stale_media {
        chain.push(JobRequest::prune_stale_media());
    }
    if settings.optimize_storage && settings.backs_up_media {
        chain.push(JobRequest::optimize_storage());
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(chain: &[JobRequest]) -> Vec<&'static str> {
        chain.iter().map(|j| j.kind.kind_id()).collect()
    }

    #[test]
    fn chain_orders_prune_before_optimize() {
        let settings = BackupSettings {
            backs_up_media: true,
            optimize_storage: true,
            ..BackupSettings::default()
        };
        assert_eq!(
            kinds(&backup_chain(&settings, true)),
            vec![
                "backup.messages",
                "backup.prune_stale_media",
                "backup.optimize_storage"
            ]
        );
    }

    #[test]
    fn optimize_requires_media_backup() {
        let settings = BackupSettings {
            backs_up_media: false,
            optimize_storage: true,
            ..BackupSettings::default()
        };
        assert_eq!(kinds(&backup_chain(&settings, false)), vec!["backup.messages"]);
    }

    #[test]
    fn backup_options_follow_cellular_setting() {
        let wifi_only = JobRequest::message_backup(&BackupSettings::default());
        assert_eq!(wifi_only.options.network, NetworkRequirement::Wifi);
        assert_eq!(wifi_only.options.max_attempts, 3);
        assert!(wifi_only.options.single_instance);
        assert_eq!(
            wifi_only.options.queue_after.as_deref(),
            Some(DIGEST_BACKFILL_KIND)
        );

        let any = JobRequest::message_backup(&BackupSettings {
            cellular_allowed: true,
            ..BackupSettings::default()
        });
        assert_eq!(any.options.network, NetworkRequirement::Any);
    }

    #[test]
    fn job_kind_serializes_with_params() {
        let v = serde_json::to_value(JobKind::MediaSnapshotSync { snapshot_ts: 5 }).expect("json");
        assert_eq!(v["type"], "media_snapshot_sync");
        assert_eq!(v["snapshot_ts"], 5);
    }
}
