//! # attache-jobs
//!
//! Background processing for the `backgrounding` plugin:
//! - a job queue abstraction with an in-memory implementation
//! - a polling worker with retries and exponential backoff
//! - handlers that finish deferred promotions and deletions
//! - hooks that enqueue those jobs from an uploader class

pub mod handlers;
pub mod jobs;

pub use handlers::{enqueue_destroy, enqueue_promote, DestroyJob, PromoteJob, Uploaders, DESTROY_JOB, PROMOTE_JOB};
pub use jobs::{Job, JobError, JobHandler, JobPriority, JobQueue, JobResult, JobStatus, JobWorker, MemoryJobQueue};
