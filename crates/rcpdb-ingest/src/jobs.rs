//! Long-running job tracking.
//!
//! Jobs decouple caller lifetime from work lifetime: `start` returns a job
//! id immediately, `status` returns the latest snapshot without blocking,
//! `cancel` trips a cooperative flag that workers observe at file
//! boundaries. Transitions append to a JSONL log so a restarted process can
//! sweep jobs that were in flight when it died.

use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use rcpdb_core::error::{Error, Result};
use rcpdb_core::types::CancelToken;

use crate::pipeline::ProgressSink;

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are sticky: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedItem {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub current: usize,
    pub total: usize,
    pub current_item: Option<String>,
    pub processed_ok: usize,
    pub processed_failed: usize,
    pub failed_items: Vec<FailedItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub op: String,
    pub collection: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
}

pub struct JobManager {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
    cancels: Mutex<HashMap<JobId, CancelToken>>,
    /// At most one live job per (op, collection).
    active: Mutex<HashMap<(String, String), JobId>>,
    log_path: Option<PathBuf>,
}

impl JobManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            log_path: None,
        })
    }

    /// Restore terminal history from the transition log; anything that was
    /// still in flight when the previous process died becomes
    /// `failed("restart")`.
    pub fn with_persistence(log_path: PathBuf) -> Arc<Self> {
        let mut jobs: HashMap<JobId, JobRecord> = HashMap::new();
        if let Ok(content) = std::fs::read_to_string(&log_path) {
            for line in content.lines() {
                match serde_json::from_str::<JobRecord>(line) {
                    Ok(record) => {
                        jobs.insert(record.job_id.clone(), record);
                    }
                    Err(err) => warn!(error = %err, "skipping malformed job log line"),
                }
            }
        }

        let manager = Arc::new(Self {
            jobs: RwLock::new(jobs),
            cancels: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            log_path: Some(log_path),
        });

        let stale: Vec<JobId> = manager
            .jobs
            .read()
            .expect("jobs lock")
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.job_id.clone())
            .collect();
        for job_id in stale {
            manager.transition(&job_id, |record| {
                record.status = JobStatus::Failed;
                record.finished_at = Some(Utc::now());
                record.error = Some(JobError {
                    kind: "internal".to_string(),
                    message: "restart".to_string(),
                });
            });
            warn!(%job_id, "job was in flight across restart, marked failed");
        }
        manager
    }

    /// Enqueue `work` and return immediately. A second start for the same
    /// `(op, collection)` while a job is live returns the existing id.
    pub fn start<F, Fut>(self: &Arc<Self>, op: &str, collection: &str, work: F) -> JobId
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let dedup_key = (op.to_string(), collection.to_string());
        let job_id = Uuid::new_v4().to_string();
        {
            let mut active = self.active.lock().expect("active lock");
            if let Some(existing) = active.get(&dedup_key) {
                info!(job_id = %existing, op, collection, "joining existing job");
                return existing.clone();
            }
            active.insert(dedup_key.clone(), job_id.clone());
        }

        let cancel = CancelToken::new();
        let record = JobRecord {
            job_id: job_id.clone(),
            op: op.to_string(),
            collection: collection.to_string(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            progress: JobProgress::default(),
            result: None,
            error: None,
        };
        self.jobs
            .write()
            .expect("jobs lock")
            .insert(job_id.clone(), record.clone());
        self.cancels
            .lock()
            .expect("cancel lock")
            .insert(job_id.clone(), cancel.clone());
        self.persist(&record);

        let manager = self.clone();
        let ctx = JobContext {
            job_id: job_id.clone(),
            manager: self.clone(),
            cancel: cancel.clone(),
        };
        let spawned_id = job_id.clone();
        tokio::spawn(async move {
            manager.transition(&spawned_id, |record| {
                record.status = JobStatus::Running;
                record.started_at = Some(Utc::now());
            });

            let outcome = tokio::spawn(work(ctx)).await;
            // Free the dedup slot before the terminal transition becomes
            // visible, so a caller that observes a terminal status can start
            // a fresh job immediately.
            manager.active.lock().expect("active lock").remove(&dedup_key);
            let status = match outcome {
                Ok(Ok(result)) => {
                    if cancel.is_cancelled() {
                        manager.transition(&spawned_id, |record| {
                            record.status = JobStatus::Cancelled;
                            record.finished_at = Some(Utc::now());
                            record.result = Some(result.clone());
                        });
                        JobStatus::Cancelled
                    } else {
                        manager.transition(&spawned_id, |record| {
                            record.status = JobStatus::Completed;
                            record.finished_at = Some(Utc::now());
                            record.result = Some(result.clone());
                        });
                        JobStatus::Completed
                    }
                }
                Ok(Err(Error::Cancelled)) => {
                    manager.transition(&spawned_id, |record| {
                        record.status = JobStatus::Cancelled;
                        record.finished_at = Some(Utc::now());
                    });
                    JobStatus::Cancelled
                }
                Ok(Err(err)) => {
                    error!(job_id = %spawned_id, error = %err, "job failed");
                    manager.transition(&spawned_id, |record| {
                        record.status = JobStatus::Failed;
                        record.finished_at = Some(Utc::now());
                        record.error = Some(JobError {
                            kind: err.kind().to_string(),
                            message: err.to_string(),
                        });
                    });
                    JobStatus::Failed
                }
                Err(join_err) => {
                    error!(job_id = %spawned_id, error = %join_err, "job worker panicked");
                    manager.transition(&spawned_id, |record| {
                        record.status = JobStatus::Failed;
                        record.finished_at = Some(Utc::now());
                        record.error = Some(JobError {
                            kind: "internal".to_string(),
                            message: format!("worker panicked: {}", join_err),
                        });
                    });
                    JobStatus::Failed
                }
            };

            manager
                .cancels
                .lock()
                .expect("cancel lock")
                .remove(&spawned_id);
            info!(job_id = %spawned_id, status = %status, "job finished");
        });

        job_id
    }

    /// Latest snapshot; never blocks on running work.
    pub fn status(&self, job_id: &str) -> Result<JobRecord> {
        self.jobs
            .read()
            .expect("jobs lock")
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job '{}'", job_id)))
    }

    /// Trip the cooperative cancel flag. Returns false for unknown or
    /// already-terminal jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        let terminal = match self.status(job_id) {
            Ok(record) => record.status.is_terminal(),
            Err(_) => return false,
        };
        if terminal {
            return false;
        }
        match self.cancels.lock().expect("cancel lock").get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        self.jobs.read().expect("jobs lock").values().cloned().collect()
    }

    fn transition(&self, job_id: &str, mutate: impl FnOnce(&mut JobRecord)) {
        let snapshot = {
            let mut jobs = self.jobs.write().expect("jobs lock");
            let Some(record) = jobs.get_mut(job_id) else {
                return;
            };
            if record.status.is_terminal() {
                return;
            }
            mutate(record);
            record.clone()
        };
        self.persist(&snapshot);
    }

    fn update_progress(&self, job_id: &str, mutate: impl FnOnce(&mut JobProgress)) {
        let mut jobs = self.jobs.write().expect("jobs lock");
        let Some(record) = jobs.get_mut(job_id) else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }
        mutate(&mut record.progress);
    }

    fn persist(&self, record: &JobRecord) {
        let Some(path) = &self.log_path else {
            return;
        };
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let line = serde_json::to_string(record).unwrap_or_default();
            writeln!(file, "{}", line)
        })();
        if let Err(err) = result {
            warn!(error = %err, "failed to persist job transition");
        }
    }
}

/// Handle given to a job's worker: progress reporting plus the cancel flag.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    manager: Arc<JobManager>,
    cancel: CancelToken,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl ProgressSink for JobContext {
    fn progress(&self, current: usize, total: usize, current_item: &str) {
        self.manager.update_progress(&self.job_id, |progress| {
            // Readers must never observe progress going backwards.
            progress.current = progress.current.max(current);
            progress.total = total;
            progress.current_item = Some(current_item.to_string());
        });
    }

    fn file_ok(&self, _source_id: &str) {
        self.manager.update_progress(&self.job_id, |progress| {
            progress.processed_ok += 1;
        });
    }

    fn file_failed(&self, source_id: &str, reason: &str) {
        self.manager.update_progress(&self.job_id, |progress| {
            progress.processed_failed += 1;
            progress.failed_items.push(FailedItem {
                id: source_id.to_string(),
                reason: reason.to_string(),
            });
        });
    }
}
