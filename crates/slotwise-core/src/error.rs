//! Error taxonomy for the scheduling core.

use thiserror::Error;

use crate::types::{ConflictReport, Timestamp};

pub type Result<T> = std::result::Result<T, SlotwiseError>;

#[derive(Debug, Error)]
pub enum SlotwiseError {
    /// Malformed input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid time range: end {end} is not after start {start}")]
    InvalidRange { start: Timestamp, end: Timestamp },

    /// Facility or instructor double-booking.
    #[error("scheduling conflict: {}", .0.summary())]
    Conflict(Box<ConflictReport>),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Program-scope mismatch.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Operation not valid for the current session status.
    #[error("invalid state: {0}")]
    StateConflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SlotwiseError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        SlotwiseError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        SlotwiseError::Validation(msg.into())
    }

    /// The conflict report, when this is a conflict.
    pub fn conflict_report(&self) -> Option<&ConflictReport> {
        match self {
            SlotwiseError::Conflict(report) => Some(report),
            _ => None,
        }
    }
}
