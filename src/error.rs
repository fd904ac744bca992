//! Centralized error types for convoy
//!
//! Uses thiserror for typed errors that can be matched on,
//! while still being compatible with anyhow for propagation.

use thiserror::Error;

/// Top-level error type for orchestration operations
///
/// Every command and state-machine handler surfaces one of these kinds.
/// `StatusConflict` is never retried here: commands return it to their
/// caller and the scanner simply picks the work up again on the next tick.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("action {action} is not allowed while {entity} {id} is {status}")]
    InvalidTransition {
        entity: &'static str,
        id: i64,
        action: String,
        status: String,
    },

    #[error("concurrent update on {entity} {id}: status changed under us")]
    StatusConflict { entity: &'static str, id: i64 },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("driver {driver} failed: {message}")]
    Driver { driver: String, message: String },

    #[error("dependency check failed: {0}")]
    Dependency(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Shorthand for a missing row with an integer id
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether this error is the optimistic-lock loss that the scanner
    /// swallows and retries on its next tick.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StatusConflict { .. })
    }
}

/// Convenience alias used throughout the services layer
pub type CoreResult<T> = Result<T, CoreError>;
