//! Job types and state machine helpers

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::{Phase, SceneId};
use crate::{Error, Result};

/// Unique job identifier
pub type JobId = Uuid;

/// Longest stored error text, in bytes
pub const LAST_ERROR_CAP: usize = 500;

/// Lifecycle state of a phase job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    Dlq,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::TimedOut => "timed_out",
            JobState::Dlq => "dlq",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            "timed_out" => Ok(JobState::TimedOut),
            "dlq" => Ok(JobState::Dlq),
            other => Err(Error::internal(format!("unknown job state: {}", other))),
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Dlq)
    }

    /// States the retry sweeper may act on. `timed_out` rides the same
    /// path as `failed`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobState::Failed | JobState::TimedOut)
    }

    /// Queued or running; counted against the one-active-per-pair rule
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt-bearing derivation job for a (scene, phase) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,

    pub scene_id: SceneId,

    pub phase: Phase,

    pub state: JobState,

    /// 1 for the first try; incremented on every re-enqueue
    pub attempt: u32,

    /// Epoch millis
    pub submitted_at: i64,

    pub started_at: Option<i64>,

    pub finished_at: Option<i64>,

    /// Set while a failed/timed_out job is waiting for the sweeper
    pub next_retry_at: Option<i64>,

    pub last_error: Option<String>,
}

impl Job {
    /// Fresh queued job
    pub fn new(scene_id: SceneId, phase: Phase, now_ms: i64) -> Self {
        Self {
            id: JobId::new_v4(),
            scene_id,
            phase,
            state: JobState::Queued,
            attempt: 1,
            submitted_at: now_ms,
            started_at: None,
            finished_at: None,
            next_retry_at: None,
            last_error: None,
        }
    }

    /// Wall-clock duration, if the job finished
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }
}

/// Truncate an error message to the storage cap on a char boundary
pub fn truncate_error(message: &str) -> String {
    if message.len() <= LAST_ERROR_CAP {
        return message.to_string();
    }
    let mut end = LAST_ERROR_CAP;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Dlq.is_terminal());
        assert!(!JobState::Failed.is_terminal());
        assert!(!JobState::TimedOut.is_terminal());

        assert!(JobState::Failed.is_retryable());
        assert!(JobState::TimedOut.is_retryable());
        assert!(!JobState::Completed.is_retryable());

        assert!(JobState::Queued.is_active());
        assert!(JobState::Running.is_active());
        assert!(!JobState::Failed.is_active());
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
            JobState::TimedOut,
            JobState::Dlq,
        ] {
            assert_eq!(JobState::parse(state.as_str()).unwrap(), state);
        }
        assert!(JobState::parse("paused").is_err());
    }

    #[test]
    fn test_new_job() {
        let job = Job::new(42, Phase::Metadata, 1_000);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.submitted_at, 1_000);
        assert!(job.started_at.is_none());
        assert!(job.duration_ms().is_none());
    }

    #[test]
    fn test_truncate_error() {
        let short = "nope";
        assert_eq!(truncate_error(short), "nope");

        let long = "x".repeat(LAST_ERROR_CAP + 100);
        assert_eq!(truncate_error(&long).len(), LAST_ERROR_CAP);

        // Multi-byte chars must not be split.
        let wide = "é".repeat(LAST_ERROR_CAP);
        let truncated = truncate_error(&wide);
        assert!(truncated.len() <= LAST_ERROR_CAP);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
