//! The engine's error taxonomy (spec §7).
//!
//! One `thiserror` enum, grounded on `agents::orchestrator::OrchestratorError`
//! in the teacher: a small set of named variants, each carrying the entity id
//! that failed so a facade never has to re-derive it from context.

use thiserror::Error;

use crate::ids::{LeaseId, ReceiptId, TaskId};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("receipt not found: {0}")]
    ReceiptNotFound(ReceiptId),

    #[error("invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidStateTransition {
        task_id: TaskId,
        from: String,
        to: String,
    },

    #[error("unauthorized: {principal} may not {action} on {task_id}")]
    Unauthorized {
        principal: String,
        action: String,
        task_id: TaskId,
    },

    #[error("lease invalid or expired: {0}")]
    LeaseInvalidOrExpired(LeaseId),

    #[error("renewal limit exceeded for lease {lease_id}: max {max_renewals}")]
    RenewalLimitExceeded { lease_id: LeaseId, max_renewals: i32 },

    #[error("lease lifetime exceeded for lease {lease_id}: max {max_lifetime_secs}s")]
    LifetimeExceeded {
        lease_id: LeaseId,
        max_lifetime_secs: i64,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Stable machine-readable code, independent of the `Display` message —
    /// facades map this (not the message text) onto their wire conventions.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::TaskNotFound(_) => "TASK_NOT_FOUND",
            EngineError::ReceiptNotFound(_) => "RECEIPT_NOT_FOUND",
            EngineError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            EngineError::Unauthorized { .. } => "UNAUTHORIZED",
            EngineError::LeaseInvalidOrExpired(_) => "LEASE_INVALID_OR_EXPIRED",
            EngineError::RenewalLimitExceeded { .. } => "RENEWAL_LIMIT_EXCEEDED",
            EngineError::LifetimeExceeded { .. } => "LIFETIME_EXCEEDED",
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::RateLimited { .. } => "RATE_LIMITED",
            EngineError::Internal(_) => "INTERNAL",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_and_distinct_per_variant() {
        let task_id = TaskId::new();
        let errs = vec![
            EngineError::TaskNotFound(task_id),
            EngineError::Validation("bad body".into()),
            EngineError::RateLimited {
                retry_after_secs: 5,
            },
        ];
        let codes: Vec<_> = errs.iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec!["TASK_NOT_FOUND", "VALIDATION_ERROR", "RATE_LIMITED"]);
    }
}
