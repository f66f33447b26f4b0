//! Media-ingest job control plane
//!
//! This module owns the whole derivation pipeline:
//! - durable job records with CAS state transitions (`store`)
//! - per-phase bounded worker pools (`pool`)
//! - trigger rules and submission orchestration (`trigger`)
//! - exponential-backoff retry sweeps (`retry`)
//! - the dead-letter queue (`dlq`)
//! - cron-fired sweeps and scans (`cron`)
//!
//! Ownership follows the job lifecycle: the trigger engine creates the
//! record, the claiming worker mutates it while running, and afterwards
//! it either belongs to the retry sweeper (failed with budget left) or
//! is read-only history.

pub mod cron;
pub mod dlq;
pub mod job;
pub mod pool;
pub mod retry;
pub mod store;
pub mod trigger;

pub use cron::{parse_cron, CronScheduler};
pub use dlq::{DeadLetterQueue, Disposition, DlqEntry, DlqStats};
pub use job::{Job, JobId, JobState};
pub use pool::{PhaseCompletion, PoolDeps, QueueStatus, WorkerPool};
pub use retry::RetryScheduler;
pub use store::{JobPatch, JobStore};
pub use trigger::{BulkOutcome, Submission, TriggerEngine};
