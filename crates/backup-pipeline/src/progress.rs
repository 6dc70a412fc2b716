use std::sync::mpsc;

/// Milestones a backup run reports for UI and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupEvent {
    Begin,
    ArtifactCreated,
    ValidationFailed,
    FinishedWithoutAttachments,
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, ev: BackupEvent);
}

/// Reports milestones through `tracing`.
#[derive(Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, ev: BackupEvent) {
        match ev {
            BackupEvent::Begin => tracing::info!("backup started"),
            BackupEvent::ArtifactCreated => tracing::info!("backup artifact created"),
            BackupEvent::ValidationFailed => tracing::warn!("backup artifact failed validation"),
            BackupEvent::FinishedWithoutAttachments => {
                tracing::info!("message backup finished; no attachment work left")
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<BackupEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<BackupEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, ev: BackupEvent) {
        let _ = self.tx.send(ev);
    }
}
