//! Error types for inbox-pilot.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Classify a libSQL error, keeping constraint violations distinguishable.
    pub fn from_libsql(context: &str, err: libsql::Error) -> Self {
        let text = err.to_string();
        if text.contains("UNIQUE constraint failed") {
            Self::Constraint(format!("{context}: {text}"))
        } else {
            Self::Query(format!("{context}: {text}"))
        }
    }
}

/// Transient failures talking to the message source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source request {operation} failed: {reason}")]
    RequestFailed { operation: String, reason: String },

    #[error("Source request {operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Source authentication failed: {0}")]
    AuthFailed(String),

    #[error("Invalid response from source for {operation}: {reason}")]
    InvalidResponse { operation: String, reason: String },

    #[error("Source call {operation} cancelled")]
    Cancelled { operation: String },
}

/// Completion service failures.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Completion timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Provider {provider} returned an empty reply")]
    EmptyReply { provider: String },

    #[error("Completion cancelled")]
    Cancelled,
}

/// Errors from the pending-reply state machine.
#[derive(Debug, thiserror::Error)]
pub enum OverrideError {
    #[error("Thread {thread_id} already has an outstanding draft {existing}")]
    Conflict { thread_id: String, existing: String },

    #[error("Pending reply {id} is {state}, cannot {action}")]
    InvalidState {
        id: String,
        state: String,
        action: String,
    },

    #[error("Pending reply {0} not found")]
    NotFound(String),

    #[error("Completion failed: {0}")]
    Completion(#[from] CompletionError),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Errors from the dual writer.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("Operational store write failed for message {message_id}: {source}")]
    StoreWrite {
        message_id: String,
        #[source]
        source: DatabaseError,
    },
}

/// Per-thread pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Draft failed: {0}")]
    Draft(#[from] OverrideError),

    #[error("Commit failed: {0}")]
    Commit(#[from] CommitError),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),

    #[error("Pipeline cancelled")]
    Cancelled,
}
