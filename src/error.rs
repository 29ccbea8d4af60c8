//! Errors that fail a whole query call.
//!
//! Per-query and per-datasource failures never show up here: they are
//! carried as `DataResponse::Error` entries next to the successful results.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    /// The request body could not be decoded.
    #[error("unable to bind query: {0}")]
    Bind(String),

    /// The request decoded but describes an invalid query set.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// An expression references an unknown query or forms a cycle.
    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    /// Expressions were requested but no evaluator supports them.
    #[error("expressions are not implemented yet ({count} requested)")]
    ExpressionsNotImplemented { count: usize },

    /// The scheduling machinery itself failed.
    #[error("query coordination failed: {0}")]
    Coordination(String),

    #[error("query was cancelled")]
    Cancelled,

    #[error("query deadline exceeded")]
    DeadlineExceeded,
}

impl QueryError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Bind(_) => "bind_error",
            Self::InvalidQuery(_) => "invalid_query",
            Self::InvalidExpression(_) => "invalid_expression",
            Self::ExpressionsNotImplemented { .. } => "expressions_not_implemented",
            Self::Coordination(_) => "coordination_error",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
        }
    }

    /// Whether the caller sent something we could never execute.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Bind(_) | Self::InvalidQuery(_) | Self::InvalidExpression(_)
        )
    }
}

/// Result type for whole-call query operations.
pub type QueryResult<T> = Result<T, QueryError>;
