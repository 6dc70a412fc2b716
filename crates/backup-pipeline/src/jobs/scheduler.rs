use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::jobs::{JobKind, JobOptions, JobRequest, Scheduler};
use crate::outcome::RunOutcome;
use crate::util::{load_json_or_default, save_json};

/// A job the local scheduler can drive.
pub trait RunnableJob {
    fn kind_id(&self) -> &'static str;
    fn run(&self) -> Result<RunOutcome>;
    /// Invoked once when the job ends without success and will not be retried.
    fn on_failure(&self);
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: u64,
    pub chain: Option<u64>,
    pub kind: JobKind,
    pub options: JobOptions,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueDoc {
    version: u32,
    next_id: u64,
    entries: Vec<QueuedJob>,
}

impl Default for QueueDoc {
    fn default() -> Self {
        Self {
            version: 1,
            next_id: 1,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    Succeeded,
    Failed,
    RetriesExhausted,
}

#[derive(Debug, Clone)]
pub struct DriveReport {
    pub outcome: DriveOutcome,
    pub attempts: u32,
}

type Sleeper = Box<dyn Fn(Duration) + Send + Sync>;

/// Finished entries kept in the ledger for `backupd status`.
pub const MAX_FINISHED_HISTORY: usize = 50;

/// In-process job queue with a persisted ledger.
///
/// Ordering within a chain is preserved, `queue_after` holds a job while a job
/// of the named kind is pending, and single-instance kinds never run twice at once.
pub struct LocalScheduler {
    path: Option<PathBuf>,
    doc: Mutex<QueueDoc>,
    active: Arc<Mutex<BTreeSet<String>>>,
    sleeper: Sleeper,
}

/// Held while a single-instance job runs.
pub struct InstanceGuard {
    kind: String,
    active: Arc<Mutex<BTreeSet<String>>>,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Ok(mut g) = self.active.lock() {
            g.remove(&self.kind);
        }
    }
}

impl LocalScheduler {
    pub fn open(path: &Path) -> Result<Self> {
        let mut doc: QueueDoc = load_json_or_default(path, "job queue")?;
        // A job marked running belongs to a process that is gone; the run is not resumable.
        for e in doc.entries.iter_mut() {
            if e.state == JobState::Running {
                e.state = JobState::Queued;
                e.updated_at = chrono::Utc::now().to_rfc3339();
            }
        }
        Ok(Self {
            path: Some(path.to_path_buf()),
            doc: Mutex::new(doc),
            active: Arc::new(Mutex::new(BTreeSet::new())),
            sleeper: Box::new(std::thread::sleep),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(QueueDoc::default()),
            active: Arc::new(Mutex::new(BTreeSet::new())),
            sleeper: Box::new(std::thread::sleep),
        }
    }

    pub fn with_sleeper(mut self, f: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Box::new(f);
        self
    }

    pub fn entries(&self) -> Vec<QueuedJob> {
        self.lock().entries.clone()
    }

    fn lock(&self) -> MutexGuard<'_, QueueDoc> {
        self.doc.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut QueueDoc) -> T) -> Result<T> {
        let mut g = self.lock();
        let mut next = g.clone();
        let out = f(&mut next);
        prune_finished(&mut next);
        if let Some(p) = self.path.as_deref() {
            save_json(p, &next, "job queue")?;
        }
        *g = next;
        Ok(out)
    }

    /// Next queued job of `kind_id` whose chain predecessors succeeded and
    /// whose `queue_after` dependency is idle.
    pub fn next_runnable(&self, kind_id: &str) -> Option<QueuedJob> {
        let doc = self.lock();
        doc.entries
            .iter()
            .filter(|e| e.state == JobState::Queued && e.kind.kind_id() == kind_id)
            .find(|e| is_runnable(&doc.entries, e))
            .cloned()
    }

    pub fn try_acquire_instance(&self, kind: &str) -> Result<InstanceGuard> {
        let mut g = self
            .active
            .lock()
            .map_err(|_| Error::msg("scheduler instance set poisoned"))?;
        if !g.insert(kind.to_string()) {
            return Err(Error::msg(format!(
                "a '{kind}' job is already running"
            )));
        }
        Ok(InstanceGuard {
            kind: kind.to_string(),
            active: self.active.clone(),
        })
    }

    /// Runs `job` for queue entry `id` until it succeeds, fails, or runs out of attempts.
    ///
    /// The failure hook fires exactly once on every non-success ending, including
    /// fatal errors, which are then returned to the caller.
    pub fn drive(&self, id: u64, job: &dyn RunnableJob) -> Result<DriveReport> {
        let entry = self
            .entries()
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::msg(format!("no queued job with id {id}")))?;
        if entry.kind.kind_id() != job.kind_id() {
            return Err(Error::msg(format!(
                "job {id} is a '{}' job, not '{}'",
                entry.kind.kind_id(),
                job.kind_id()
            )));
        }
        if !is_pending(&entry) {
            return Err(Error::msg(format!(
                "job {id} already finished as {}",
                state_label(entry.state)
            )));
        }

        let _guard = if entry.options.single_instance {
            Some(self.try_acquire_instance(job.kind_id())?)
        } else {
            None
        };

        let max_attempts = entry.options.max_attempts.max(1);
        let mut attempts = entry.attempts;
        // A requeued entry may have used its last attempt before the restart.
        if attempts >= max_attempts {
            tracing::warn!(job = id, attempts, "job has no attempts left");
            job.on_failure();
            self.fail(id, "retries exhausted", attempts)?;
            return Ok(DriveReport {
                outcome: DriveOutcome::RetriesExhausted,
                attempts,
            });
        }
        self.set_state(id, JobState::Running, None, attempts)?;

        loop {
            attempts = attempts.saturating_add(1);
            self.set_state(id, JobState::Running, None, attempts)?;
            tracing::info!(job = id, kind = job.kind_id(), attempt = attempts, "job attempt started");

            match job.run() {
                Ok(RunOutcome::Success) => {
                    self.set_state(id, JobState::Succeeded, None, attempts)?;
                    tracing::info!(job = id, attempts, "job succeeded");
                    return Ok(DriveReport {
                        outcome: DriveOutcome::Succeeded,
                        attempts,
                    });
                }
                Ok(RunOutcome::Retry(backoff)) if attempts < max_attempts => {
                    tracing::info!(
                        job = id,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "job asked to retry"
                    );
                    (self.sleeper)(backoff);
                }
                Ok(RunOutcome::Retry(_)) => {
                    tracing::warn!(job = id, attempts, "job exhausted its attempts");
                    job.on_failure();
                    self.fail(id, "retries exhausted", attempts)?;
                    return Ok(DriveReport {
                        outcome: DriveOutcome::RetriesExhausted,
                        attempts,
                    });
                }
                Ok(RunOutcome::Failure) => {
                    tracing::warn!(job = id, attempts, "job failed");
                    job.on_failure();
                    self.fail(id, "job failed", attempts)?;
                    return Ok(DriveReport {
                        outcome: DriveOutcome::Failed,
                        attempts,
                    });
                }
                Err(e) => {
                    tracing::error!(job = id, attempts, error = %e, "job raised a fatal error");
                    job.on_failure();
                    self.fail(id, &e.to_string(), attempts)?;
                    return Err(e);
                }
            }
        }
    }

    fn set_state(&self, id: u64, state: JobState, err: Option<String>, attempts: u32) -> Result<()> {
        self.mutate(|doc| {
            if let Some(e) = doc.entries.iter_mut().find(|e| e.id == id) {
                e.state = state;
                e.attempts = attempts;
                if err.is_some() || state == JobState::Succeeded {
                    e.last_error = err;
                }
                e.updated_at = chrono::Utc::now().to_rfc3339();
            }
        })
    }

    // Failing a chain link fails every later link still waiting on it.
    fn fail(&self, id: u64, err: &str, attempts: u32) -> Result<()> {
        self.set_state(id, JobState::Failed, Some(err.to_string()), attempts)?;
        self.mutate(|doc| {
            let Some(chain) = doc.entries.iter().find(|e| e.id == id).and_then(|e| e.chain) else {
                return;
            };
            for e in doc.entries.iter_mut() {
                if e.chain == Some(chain) && e.id > id && e.state == JobState::Queued {
                    e.state = JobState::Failed;
                    e.last_error = Some(format!("chain predecessor {id} failed"));
                    e.updated_at = chrono::Utc::now().to_rfc3339();
                }
            }
        })
    }

    fn push(doc: &mut QueueDoc, chain: Option<u64>, job: JobRequest) -> u64 {
        let id = doc.next_id;
        doc.next_id = doc.next_id.saturating_add(1);
        doc.entries.push(QueuedJob {
            id,
            chain,
            kind: job.kind,
            options: job.options,
            state: JobState::Queued,
            attempts: 0,
            last_error: None,
            updated_at: chrono::Utc::now().to_rfc3339(),
        });
        id
    }
}

fn is_pending(e: &QueuedJob) -> bool {
    matches!(e.state, JobState::Queued | JobState::Running)
}

// Parameters count: a sync for a newer snapshot is a different job.
fn has_pending_instance(entries: &[QueuedJob], job: &JobRequest) -> bool {
    job.options.single_instance
        && entries
            .iter()
            .any(|e| e.state == JobState::Queued && e.kind == job.kind)
}

fn state_label(state: JobState) -> &'static str {
    match state {
        JobState::Queued => "queued",
        JobState::Running => "running",
        JobState::Succeeded => "succeeded",
        JobState::Failed => "failed",
    }
}

/// Drops the oldest finished entries beyond `MAX_FINISHED_HISTORY`.
/// Finished links of a chain with pending links stay, so ordering still holds.
fn prune_finished(doc: &mut QueueDoc) {
    let live_chains: BTreeSet<u64> = doc
        .entries
        .iter()
        .filter(|e| is_pending(e))
        .filter_map(|e| e.chain)
        .collect();
    let prunable = |e: &QueuedJob| {
        !is_pending(e) && !e.chain.is_some_and(|c| live_chains.contains(&c))
    };
    let finished = doc.entries.iter().filter(|e| prunable(*e)).count();
    let mut excess = finished.saturating_sub(MAX_FINISHED_HISTORY);
    if excess == 0 {
        return;
    }
    // Entries are stored in id order, so the first prunable ones are the oldest.
    doc.entries.retain(|e| {
        if excess > 0 && prunable(e) {
            excess -= 1;
            false
        } else {
            true
        }
    });
}

fn is_runnable(entries: &[QueuedJob], e: &QueuedJob) -> bool {
    if let Some(chain) = e.chain {
        let blocked = entries
            .iter()
            .any(|p| p.chain == Some(chain) && p.id < e.id && p.state != JobState::Succeeded);
        if blocked {
            return false;
        }
    }
    if let Some(after) = e.options.queue_after.as_deref() {
        if entries
            .iter()
            .any(|p| p.id != e.id && is_pending(p) && p.kind.kind_id() == after)
        {
            return false;
        }
    }
    true
}

impl Scheduler for LocalScheduler {
    fn enqueue(&self, job: JobRequest) -> Result<()> {
        self.mutate(|doc| {
            if has_pending_instance(&doc.entries, &job) {
                tracing::debug!(kind = job.kind.kind_id(), "single-instance job already queued; skipping");
                return;
            }
            let id = Self::push(doc, None, job);
            tracing::debug!(job = id, "job enqueued");
        })
    }

    fn enqueue_chain(&self, jobs: Vec<JobRequest>) -> Result<()> {
        self.mutate(|doc| {
            let Some(head) = jobs.first() else {
                return;
            };
            if has_pending_instance(&doc.entries, head) {
                tracing::debug!(kind = head.kind.kind_id(), "chain head already queued; skipping chain");
                return;
            }
            let chain = doc.next_id;
            for job in jobs {
                Self::push(doc, Some(chain), job);
            }
            tracing::debug!(chain, "job chain enqueued");
        })
    }
}

pub fn format_queue_report(entries: &[QueuedJob]) -> String {
    let mut out = String::new();
    out.push_str("JOBS:\n");
    if entries.is_empty() {
        out.push_str("  (none)\n");
    }
    for e in entries {
        let chain = e.chain.map(|c| format!("chain={c}")).unwrap_or_default();
        out.push_str(&format!(
            "  {:>4}  {:<28} {:<10} attempts={} {}",
            e.id,
            e.kind.kind_id(),
            state_label(e.state),
            e.attempts,
            chain
        ));
        if let Some(err) = e.last_error.as_deref() {
            out.push_str(&format!("  error: {err}"));
        }
        out.push('\n');
    }
    out
}
