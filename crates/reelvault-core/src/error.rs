//! Error types for reelvault
//!
//! Every component surfaces one of the closed variants below; the HTTP
//! layer maps them to status codes and the `{"error", "code"}` envelope.

use thiserror::Error;

/// Main error type for reelvault
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid input (bad phase, bad mode, bad config values, trigger cycle)
    #[error("{message}")]
    Validation {
        code: &'static str,
        message: String,
    },

    /// Unknown scene, job, or DLQ entry
    #[error("{0}")]
    NotFound(String),

    /// State conflicts: duplicate active job, stale CAS, full queue,
    /// failed config refresh
    #[error("{message}")]
    Conflict {
        code: &'static str,
        message: String,
    },

    /// Stream admission rejected the request
    #[error("{message}")]
    RateLimited {
        code: &'static str,
        message: String,
    },

    /// Requested byte range cannot be satisfied
    #[error("range not satisfiable")]
    RangeUnsatisfiable,

    /// Database errors (SQLx wrapped)
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Everything else; collaborator failures included
    #[error("{0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a generic validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation {
            code: "VALIDATION",
            message: msg.into(),
        }
    }

    /// Trigger-graph cycle rejection
    pub fn cycle_detected<T: Into<String>>(msg: T) -> Self {
        Error::Validation {
            code: "CYCLE_DETECTED",
            message: msg.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a generic conflict error
    pub fn conflict<T: Into<String>>(msg: T) -> Self {
        Error::Conflict {
            code: "CONFLICT",
            message: msg.into(),
        }
    }

    /// A non-terminal job already exists for the (scene, phase) pair
    pub fn duplicate_job<T: Into<String>>(msg: T) -> Self {
        Error::Conflict {
            code: "DUPLICATE_JOB",
            message: msg.into(),
        }
    }

    /// Conditional state update observed a different state than expected
    pub fn stale_state<T: Into<String>>(msg: T) -> Self {
        Error::Conflict {
            code: "STALE_STATE",
            message: msg.into(),
        }
    }

    /// Worker-pool queue soft cap exceeded
    pub fn queue_full<T: Into<String>>(msg: T) -> Self {
        Error::Conflict {
            code: "QUEUE_FULL",
            message: msg.into(),
        }
    }

    /// A config refresh failed validation; prior snapshot stays active
    pub fn config_invalid<T: Into<String>>(msg: T) -> Self {
        Error::Conflict {
            code: "CONFIG_INVALID",
            message: msg.into(),
        }
    }

    /// Stream concurrency limit hit
    pub fn stream_limit() -> Self {
        Error::RateLimited {
            code: "STREAM_LIMIT_EXCEEDED",
            message: "too many concurrent streams".to_string(),
        }
    }

    /// Create an internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        Error::Internal(msg.into())
    }

    /// HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation { .. } => 400,
            Error::NotFound(_) => 404,
            Error::Conflict { .. } => 409,
            Error::RateLimited { .. } => 503,
            Error::RangeUnsatisfiable => 416,
            Error::Database(_) => 500,
            Error::Io(_) => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Symbolic code for the JSON error envelope
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation { code, .. } => code,
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict { code, .. } => code,
            Error::RateLimited { code, .. } => code,
            Error::RangeUnsatisfiable => "RANGE_NOT_SATISFIABLE",
            Error::Database(_) => "STORAGE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a caller should surface this to the user as their fault
    pub fn is_client_error(&self) -> bool {
        self.status_code() < 500
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::validation("bad phase").status_code(), 400);
        assert_eq!(Error::not_found("scene 9").status_code(), 404);
        assert_eq!(Error::duplicate_job("busy").status_code(), 409);
        assert_eq!(Error::stream_limit().status_code(), 503);
        assert_eq!(Error::RangeUnsatisfiable.status_code(), 416);
        assert_eq!(Error::internal("boom").status_code(), 500);
    }

    #[test]
    fn test_symbolic_codes() {
        assert_eq!(Error::cycle_detected("loop").code(), "CYCLE_DETECTED");
        assert_eq!(Error::stream_limit().code(), "STREAM_LIMIT_EXCEEDED");
        assert_eq!(Error::queue_full("metadata").code(), "QUEUE_FULL");
        assert_eq!(Error::stale_state("job").code(), "STALE_STATE");
    }
}
