//! Background job queue
//!
//! Jobs carry JSON arguments, are picked by priority and then by age, and
//! are retried with exponential backoff until their retry budget runs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use attache::AttacheError;
use attache_core::config::JobsConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, warn};

/// Job errors
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Job failed: {0}")]
    Failed(String),
    #[error("Unknown job type: {0}")]
    UnknownType(String),
    #[error("Queue error: {0}")]
    QueueError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::SerializationError(err.to_string())
    }
}

impl From<AttacheError> for JobError {
    fn from(err: AttacheError) -> Self {
        JobError::Failed(err.to_string())
    }
}

pub type JobResult<T> = Result<T, JobError>;

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Retrying,
    Dead,
}

/// Job priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

/// A background job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Handler key
    pub job_type: String,
    pub queue: String,
    pub args: Value,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Failed attempts so far
    pub retries: u32,
    pub max_retries: u32,
    /// Last failure message
    pub error: Option<String>,
    /// Not picked before this instant
    pub run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Delay before the given retry attempt: 2^attempt seconds, capped at one hour
pub fn backoff(attempt: u32) -> chrono::Duration {
    let seconds = 2_i64.saturating_pow(attempt).min(3600);
    chrono::Duration::seconds(seconds)
}

impl Job {
    pub fn new(job_type: impl Into<String>, args: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            queue: "default".to_string(),
            args,
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            retries: 0,
            max_retries: 3,
            error: None,
            run_at: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Delay the first run by `seconds`
    pub fn run_in(mut self, seconds: i64) -> Self {
        self.run_at = Some(Utc::now() + chrono::Duration::seconds(seconds));
        self
    }

    pub fn is_ready(&self) -> bool {
        self.run_at.map_or(true, |at| Utc::now() >= at)
    }

    fn is_runnable(&self, queue: &str) -> bool {
        self.queue == queue
            && matches!(self.status, JobStatus::Pending | JobStatus::Retrying)
            && self.is_ready()
    }

    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    /// Record a failure, scheduling a retry while attempts remain
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());

        if self.can_retry() {
            self.retries += 1;
            self.status = JobStatus::Retrying;
            self.run_at = Some(Utc::now() + backoff(self.retries));
        } else {
            self.status = JobStatus::Dead;
        }
    }
}

/// Job storage
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> JobResult<String>;

    async fn get(&self, job_id: &str) -> JobResult<Option<Job>>;

    /// Claim the next ready job of a queue, marking it running
    async fn dequeue(&self, queue: &str) -> JobResult<Option<Job>>;

    async fn update(&self, job: &Job) -> JobResult<()>;

    async fn delete(&self, job_id: &str) -> JobResult<()>;

    async fn pending_count(&self, queue: &str) -> JobResult<usize>;

    async fn list(&self, queue: &str, status: Option<JobStatus>) -> JobResult<Vec<Job>>;

    /// Reset dead jobs so they run again
    async fn retry_dead(&self, queue: &str) -> JobResult<usize>;

    async fn clear_completed(&self, queue: &str) -> JobResult<usize>;
}

/// In-memory job queue for development/testing
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: Job) -> JobResult<String> {
        let id = job.id.clone();
        debug!(job_id = %id, job_type = %job.job_type, queue = %job.queue, "Job enqueued");
        self.jobs.write().await.insert(id.clone(), job);
        Ok(id)
    }

    async fn get(&self, job_id: &str) -> JobResult<Option<Job>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn dequeue(&self, queue: &str) -> JobResult<Option<Job>> {
        let mut jobs = self.jobs.write().await;

        // Highest priority first, oldest first within a priority
        let next = jobs
            .values()
            .filter(|j| j.is_runnable(queue))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
            })
            .map(|j| j.id.clone());

        Ok(next.and_then(|id| {
            jobs.get_mut(&id).map(|job| {
                job.mark_running();
                job.clone()
            })
        }))
    }

    async fn update(&self, job: &Job) -> JobResult<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(JobError::NotFound(job.id.clone())),
        }
    }

    async fn delete(&self, job_id: &str) -> JobResult<()> {
        self.jobs.write().await.remove(job_id);
        Ok(())
    }

    async fn pending_count(&self, queue: &str) -> JobResult<usize> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| j.queue == queue && matches!(j.status, JobStatus::Pending | JobStatus::Retrying))
            .count())
    }

    async fn list(&self, queue: &str, status: Option<JobStatus>) -> JobResult<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut listed: Vec<Job> = jobs
            .values()
            .filter(|j| j.queue == queue && status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        listed.sort_by_key(|j| j.created_at);
        Ok(listed)
    }

    async fn retry_dead(&self, queue: &str) -> JobResult<usize> {
        let mut jobs = self.jobs.write().await;
        let mut count = 0;

        for job in jobs.values_mut() {
            if job.queue == queue && job.status == JobStatus::Dead {
                job.status = JobStatus::Pending;
                job.retries = 0;
                job.error = None;
                job.run_at = None;
                count += 1;
            }
        }

        Ok(count)
    }

    async fn clear_completed(&self, queue: &str) -> JobResult<usize> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.queue == queue && j.status == JobStatus::Completed));
        Ok(before - jobs.len())
    }
}

/// Handler for a specific job type
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, args: Value) -> JobResult<()>;
}

/// Polls one queue and dispatches jobs to their handlers
pub struct JobWorker<Q: JobQueue> {
    queue: Arc<Q>,
    queue_name: String,
    poll_interval: Duration,
    handlers: HashMap<String, Box<dyn JobHandler>>,
}

impl<Q: JobQueue> JobWorker<Q> {
    pub fn new(queue: Arc<Q>, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            poll_interval: Duration::from_millis(100),
            handlers: HashMap::new(),
        }
    }

    pub fn from_config(queue: Arc<Q>, config: &JobsConfig) -> Self {
        Self::new(queue, config.queue.clone()).poll_interval(Duration::from_millis(config.poll_interval_ms))
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn register<H: JobHandler + 'static>(&mut self, job_type: impl Into<String>, handler: H) {
        self.handlers.insert(job_type.into(), Box::new(handler));
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Process one job, returning whether a job was picked
    pub async fn process_one(&self) -> JobResult<bool> {
        let mut job = match self.queue.dequeue(&self.queue_name).await? {
            Some(job) => job,
            None => return Ok(false),
        };

        let result = match self.handlers.get(&job.job_type) {
            Some(handler) => handler.handle(job.args.clone()).await,
            None => Err(JobError::UnknownType(job.job_type.clone())),
        };

        match result {
            Ok(()) => {
                job.mark_completed();
                debug!(job_id = %job.id, job_type = %job.job_type, "Job completed");
            }
            Err(e) => {
                job.mark_failed(e.to_string());
                if job.status == JobStatus::Dead {
                    error!(job_id = %job.id, job_type = %job.job_type, error = %e, "Job failed permanently");
                } else {
                    warn!(job_id = %job.id, job_type = %job.job_type, retries = job.retries, error = %e, "Job failed, retrying");
                }
            }
        }

        self.queue.update(&job).await?;
        Ok(true)
    }

    /// Process jobs until no ready job is left
    pub async fn drain(&self) -> JobResult<usize> {
        let mut processed = 0;
        while self.process_one().await? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Run the worker loop until `shutdown` turns true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.process_one().await {
                Ok(true) => continue,
                Ok(false) => self.poll_interval,
                Err(e) => {
                    error!(queue = %self.queue_name, error = %e, "Job worker error");
                    self.poll_interval * 10
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        debug!(queue = %self.queue_name, "Job worker stopped");
    }
}
