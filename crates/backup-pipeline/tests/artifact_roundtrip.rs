use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};

use backup_pipeline::cancel::CancellationToken;
use backup_pipeline::collab::{
    AttachmentStore, ExportRequest, Exporter, MediaCursorFn, RemoteBackup, Validator,
};
use backup_pipeline::config::{BackupKey, BackupSettings};
use backup_pipeline::jobs::scheduler::LocalScheduler;
use backup_pipeline::local::{ArtifactValidator, DirExporter, LocalAttachments};
use backup_pipeline::media::{JsonMediaSnapshots, MediaObject, MediaSnapshotStore};
use backup_pipeline::outcome::{RemoteOutcome, RunOutcome, ValidationOutcome};
use backup_pipeline::pipeline::{BackupContext, MessageBackupJob, TemporaryArtifact};
use backup_pipeline::progress::LogSink;
use backup_pipeline::store::{BookkeepingStore, JsonStore};

fn key() -> BackupKey {
    BackupKey::new([42u8; 32])
}

fn seed_data(dir: &Path) {
    let msgs = dir.join("messages");
    fs::create_dir_all(msgs.join("thread-1")).expect("messages dir");
    fs::write(msgs.join("thread-1/0001.json"), br#"{"body":"hello"}"#).expect("msg");
    fs::write(msgs.join("thread-1/0002.json"), br#"{"body":"world"}"#).expect("msg");
    fs::write(msgs.join("settings.json"), b"{}").expect("msg");

    let att = dir.join("attachments");
    fs::create_dir_all(&att).expect("attachments dir");
    fs::write(att.join("a1.bin"), b"picture bytes").expect("att");
    fs::write(att.join("a2.bin"), b"voice note").expect("att");
    fs::write(
        att.join("index.json"),
        r#"{"version":1,"attachments":[
            {"id":"a2","file":"a2.bin"},
            {"id":"a1","file":"a1.bin"},
            {"id":"gone","file":"missing.bin"},
            {"id":"old","file":"old.bin","digest":"ab","archive_uploaded":true}
        ]}"#,
    )
    .expect("index");
}

struct Exported {
    artifact: TemporaryArtifact,
    media: Vec<MediaObject>,
}

fn export(
    data_dir: &Path,
    key: &BackupKey,
    plaintext: bool,
    cancel: &CancellationToken,
    with_media: bool,
) -> Exported {
    let attachments = Arc::new(LocalAttachments::new(data_dir));
    attachments.repair_missing_metadata().expect("repair");
    let exporter = DirExporter::new(data_dir, attachments);
    let artifact = TemporaryArtifact::create(None).expect("artifact");

    let mut seen = Vec::new();
    {
        let mut sink = artifact.writer().expect("writer");
        let mut append = |b: &[u8]| artifact.append(b);
        let mut collect =
            |objs: &mut dyn Iterator<Item = MediaObject>| -> backup_pipeline::Result<()> {
                seen.extend(objs);
                Ok(())
            };
        let media: Option<&mut MediaCursorFn<'_>> = if with_media {
            Some(&mut collect)
        } else {
            None
        };
        exporter
            .export(ExportRequest {
                sink: &mut sink,
                key,
                append: &mut append,
                plaintext,
                cancel,
                timestamp_ms: 1_700_000_000_000,
                media,
            })
            .expect("export");
    }
    Exported {
        artifact,
        media: seen,
    }
}

fn validator() -> ArtifactValidator {
    ArtifactValidator::default()
}

#[test]
fn exported_artifact_validates_and_streams_media() {
    let tmp = tempfile::tempdir().expect("tempdir");
    seed_data(tmp.path());
    let out = export(tmp.path(), &key(), false, &CancellationToken::new(), true);

    assert_eq!(
        validator().validate(out.artifact.path(), &key()),
        ValidationOutcome::Success
    );
    let ids: Vec<_> = out.media.iter().map(|m| m.media_id.as_str()).collect();
    assert_eq!(ids, vec!["a1", "a2", "old"]);

    let raw = fs::read(out.artifact.path()).expect("read");
    assert_eq!(&raw[..4], b"BKUP");
    assert!(
        !raw.windows(5).any(|w| w == b"hello"),
        "message content must not appear in the clear"
    );
}

#[test]
fn wrong_key_is_a_validation_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    seed_data(tmp.path());
    let out = export(tmp.path(), &key(), false, &CancellationToken::new(), false);

    let other = BackupKey::new([7u8; 32]);
    assert!(matches!(
        validator().validate(out.artifact.path(), &other),
        ValidationOutcome::ValidationError(_)
    ));
}

#[test]
fn tampered_or_truncated_artifacts_are_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    seed_data(tmp.path());
    let out = export(tmp.path(), &key(), false, &CancellationToken::new(), false);
    let raw = fs::read(out.artifact.path()).expect("read");

    let mut flipped = raw.clone();
    flipped[30] ^= 0x40;
    let p = tmp.path().join("flipped.artifact");
    fs::write(&p, &flipped).expect("write");
    assert!(matches!(
        validator().validate(&p, &key()),
        ValidationOutcome::ValidationError(_)
    ));

    let p = tmp.path().join("short.artifact");
    fs::write(&p, &raw[..raw.len() - 10]).expect("write");
    assert!(matches!(
        validator().validate(&p, &key()),
        ValidationOutcome::ValidationError(_)
    ));

    let mut extra = raw.clone();
    extra.extend_from_slice(b"junk");
    let p = tmp.path().join("extra.artifact");
    fs::write(&p, &extra).expect("write");
    assert!(matches!(
        validator().validate(&p, &key()),
        ValidationOutcome::ValidationError(_)
    ));
}

#[test]
fn missing_artifact_is_a_read_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    assert!(matches!(
        validator().validate(&tmp.path().join("nope.artifact"), &key()),
        ValidationOutcome::ReadError(_)
    ));
}

#[test]
fn plaintext_artifacts_need_explicit_allowance() {
    let tmp = tempfile::tempdir().expect("tempdir");
    seed_data(tmp.path());
    let out = export(tmp.path(), &key(), true, &CancellationToken::new(), false);

    assert!(matches!(
        validator().validate(out.artifact.path(), &key()),
        ValidationOutcome::ValidationError(_)
    ));
    let lenient = ArtifactValidator {
        allow_plaintext: true,
    };
    assert_eq!(
        lenient.validate(out.artifact.path(), &key()),
        ValidationOutcome::Success
    );
}

#[test]
fn cancelled_export_closes_early_without_media() {
    let tmp = tempfile::tempdir().expect("tempdir");
    seed_data(tmp.path());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let full = export(tmp.path(), &key(), false, &CancellationToken::new(), true);
    let cut = export(tmp.path(), &key(), false, &cancel, true);

    assert!(cut.media.is_empty());
    assert!(cut.artifact.len().expect("len") < full.artifact.len().expect("len"));
    assert_eq!(
        validator().validate(cut.artifact.path(), &key()),
        ValidationOutcome::Success
    );
}

struct CapturingRemote {
    bodies: Mutex<Vec<Vec<u8>>>,
}

impl RemoteBackup for CapturingRemote {
    fn upload(&self, stream: &mut dyn Read, len: u64) -> RemoteOutcome<()> {
        let mut body = Vec::new();
        if let Err(e) = stream.read_to_end(&mut body) {
            return RemoteOutcome::NetworkError(e.to_string());
        }
        assert_eq!(body.len() as u64, len);
        self.bodies.lock().unwrap().push(body);
        RemoteOutcome::Success(())
    }

    fn query_used_space(&self) -> RemoteOutcome<u64> {
        let total = self.bodies.lock().unwrap().iter().map(|b| b.len() as u64).sum();
        RemoteOutcome::Success(total)
    }
}

#[test]
fn backup_run_with_local_collaborators() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let data = tmp.path().join("data");
    seed_data(&data);
    let state = tmp.path().join("state");
    fs::create_dir_all(&state).expect("state dir");

    let settings = BackupSettings {
        backs_up_media: true,
        ..BackupSettings::default()
    };
    let store = Arc::new(JsonStore::open(&state.join("state.json"), settings).expect("store"));
    let media = Arc::new(
        JsonMediaSnapshots::open(&state.join("media_snapshot.json")).expect("media store"),
    );
    let attachments = Arc::new(LocalAttachments::new(&data));
    let remote = Arc::new(CapturingRemote {
        bodies: Mutex::new(Vec::new()),
    });
    let validator = Arc::new(ArtifactValidator::default());
    let ctx = BackupContext {
        store: store.clone(),
        media: media.clone(),
        attachments: attachments.clone(),
        exporter: Arc::new(DirExporter::new(&data, attachments.clone())),
        validator: validator.clone(),
        remote: remote.clone(),
        progress: Arc::new(LogSink),
        scheduler: Arc::new(LocalScheduler::open(&state.join("jobs.json")).expect("queue")),
        key: key(),
        artifact_dir: Some(state.join("tmp")),
        default_backoff: std::time::Duration::from_secs(1),
        plaintext: false,
    };

    let out = MessageBackupJob::new(Arc::new(ctx)).run().expect("run");
    assert_eq!(out, RunOutcome::Success);

    // Repair filled in digests for the two present files.
    let repaired = attachments
        .records()
        .expect("records")
        .into_iter()
        .filter(|r| r.id.starts_with('a') && r.digest.is_some())
        .count();
    assert_eq!(repaired, 2);
    assert_eq!(media.committed_count(), 3);

    let bodies = remote.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 1);
    assert_eq!(store.last_artifact_size(), bodies[0].len() as u64);
    assert_eq!(store.used_remote_space(), bodies[0].len() as u64);

    // The uploaded bytes are the validated artifact.
    let copy = tmp.path().join("uploaded.artifact");
    fs::write(&copy, &bodies[0]).expect("write copy");
    assert_eq!(validator.validate(&copy, &key()), ValidationOutcome::Success);

    assert_eq!(fs::read_dir(state.join("tmp")).expect("tmp dir").count(), 0);
    let reopened = JsonStore::open(&state.join("state.json"), settings).expect("reopen");
    assert!(reopened.has_ever_uploaded());
    assert!(!reopened.persistent_failure());
}
