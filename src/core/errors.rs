//! Error types for transactional outbox and inbox message processing
//! Provides structured error handling using thiserror for better error reporting

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Stable error codes surfaced to logs and to the retry strategy
///
/// Every [`MessagingError`] maps to exactly one of these codes. The codes are
/// part of the observable contract: log lines and retry decisions key off
/// them, not off the Rust variant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    DbError,
    MessageStorageFailed,
    MessageHandlingFailed,
    MessageNotFound,
    AlreadyProcessed,
    AbandonedMessage,
    PoisonousMessage,
    MaxAttemptsExceeded,
    ListenerStopped,
    ConcurrencyCancelled,
    ConfigError,
    MessageDecodeFailed,
    ProtocolError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DbError => "DB_ERROR",
            ErrorCode::MessageStorageFailed => "MESSAGE_STORAGE_FAILED",
            ErrorCode::MessageHandlingFailed => "MESSAGE_HANDLING_FAILED",
            ErrorCode::MessageNotFound => "MESSAGE_NOT_FOUND",
            ErrorCode::AlreadyProcessed => "ALREADY_PROCESSED",
            ErrorCode::AbandonedMessage => "ABANDONED_MESSAGE",
            ErrorCode::PoisonousMessage => "POISONOUS_MESSAGE",
            ErrorCode::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
            ErrorCode::ListenerStopped => "LISTENER_STOPPED",
            ErrorCode::ConcurrencyCancelled => "CONCURRENCY_CANCELLED",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::MessageDecodeFailed => "MESSAGE_DECODE_FAILED",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers of the message an error refers to
///
/// Attached to errors so that every surfaced failure names the offending
/// message without dragging the full payload into log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub id: Uuid,
    pub message_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}.{} for {})",
            self.id, self.aggregate_type, self.message_type, self.aggregate_id
        )
    }
}

/// Main error type for the transactional messaging library
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Underlying database driver failure
    #[error("Database error: {message}")]
    Db {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Inserting a message into the outbox/inbox table failed
    #[error("Could not store the message {message_ref}")]
    Storage {
        message_ref: MessageRef,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The user handler threw or timed out
    #[error("Handling the message {message_ref} failed: {message}")]
    Handling {
        message: String,
        message_ref: MessageRef,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The row was absent when the dispatch pipeline re-read it
    #[error("The message {id} could not be found")]
    NotFound { id: Uuid },

    /// The row already has `processed_at` set (idempotence safeguard)
    #[error("The message {message_ref} was already processed")]
    AlreadyProcessed { message_ref: MessageRef },

    /// The row already has `abandoned_at` set
    #[error("The message {message_ref} was abandoned")]
    Abandoned { message_ref: MessageRef },

    /// The started/finished attempts gap exceeds the poison threshold
    #[error(
        "The message {message_ref} is poisonous: {started} started vs {finished} finished attempts"
    )]
    Poisonous {
        message_ref: MessageRef,
        started: i16,
        finished: i16,
    },

    /// `finished_attempts` reached the configured cap
    #[error("The message {message_ref} reached the maximum of {finished} finished attempts")]
    MaxAttemptsExceeded { message_ref: MessageRef, finished: i16 },

    /// Shutdown was observed while an operation was in flight
    #[error("The listener was stopped: {message}")]
    ListenerStopped { message: String },

    /// A concurrency controller dropped this waiter during `cancel()`
    #[error("The concurrency controller was cancelled while waiting for a slot")]
    ConcurrencyCancelled,

    /// A row or replication tuple did not decode into a valid message
    #[error("Message decoding failed: {message}")]
    Decode {
        message: String,
        context: Option<String>,
    },

    /// Replication wire protocol errors, with the server error details when present
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        sqlstate: Option<String>,
        routine: Option<String>,
    },

    /// Network/IO related errors
    #[error("Network IO error")]
    NetworkIo(#[from] std::io::Error),

    /// Driver-level errors from the handler connection pool
    #[error("Postgres driver error")]
    Driver(#[from] tokio_postgres::Error),

    /// Pool checkout errors
    #[error("Connection pool error")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// Generic error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for convenience
pub type MessagingResult<T> = std::result::Result<T, MessagingError>;

impl MessagingError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a database error with context
    pub fn db<S: Into<String>>(message: S) -> Self {
        Self::Db {
            message: message.into(),
            source: None,
        }
    }

    /// Create a database error wrapping a driver failure
    pub fn db_with_source<S: Into<String>>(
        message: S,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Db {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error for the given message
    pub fn storage(
        message_ref: MessageRef,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message_ref,
            source: Some(Box::new(source)),
        }
    }

    /// Create a handling error for the given message
    pub fn handling<S: Into<String>>(message: S, message_ref: MessageRef) -> Self {
        Self::Handling {
            message: message.into(),
            message_ref,
            source: None,
        }
    }

    /// Create a handling error wrapping the handler's own failure
    pub fn handling_with_source<S: Into<String>>(
        message: S,
        message_ref: MessageRef,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Handling {
            message: message.into(),
            message_ref,
            source: Some(Box::new(source)),
        }
    }

    /// Create a message decoding error
    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::Decode {
            message: message.into(),
            context: None,
        }
    }

    /// Create a message decoding error with context
    pub fn decode_with_context<S: Into<String>, C: Into<String>>(message: S, context: C) -> Self {
        Self::Decode {
            message: message.into(),
            context: Some(context.into()),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
            sqlstate: None,
            routine: None,
        }
    }

    /// Create a protocol error carrying the server's SQLSTATE and routine
    pub fn server<S: Into<String>>(
        message: S,
        sqlstate: Option<String>,
        routine: Option<String>,
    ) -> Self {
        Self::Protocol {
            message: message.into(),
            sqlstate,
            routine,
        }
    }

    /// Create a listener-stopped error
    pub fn stopped<S: Into<String>>(message: S) -> Self {
        Self::ListenerStopped {
            message: message.into(),
        }
    }

    /// The stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            MessagingError::Db { .. }
            | MessagingError::NetworkIo(_)
            | MessagingError::Driver(_)
            | MessagingError::Pool(_)
            | MessagingError::Other(_) => ErrorCode::DbError,
            MessagingError::Configuration { .. } => ErrorCode::ConfigError,
            MessagingError::Storage { .. } => ErrorCode::MessageStorageFailed,
            MessagingError::Handling { .. } => ErrorCode::MessageHandlingFailed,
            MessagingError::NotFound { .. } => ErrorCode::MessageNotFound,
            MessagingError::AlreadyProcessed { .. } => ErrorCode::AlreadyProcessed,
            MessagingError::Abandoned { .. } => ErrorCode::AbandonedMessage,
            MessagingError::Poisonous { .. } => ErrorCode::PoisonousMessage,
            MessagingError::MaxAttemptsExceeded { .. } => ErrorCode::MaxAttemptsExceeded,
            MessagingError::ListenerStopped { .. } => ErrorCode::ListenerStopped,
            MessagingError::ConcurrencyCancelled => ErrorCode::ConcurrencyCancelled,
            MessagingError::Decode { .. } => ErrorCode::MessageDecodeFailed,
            MessagingError::Protocol { .. } => ErrorCode::ProtocolError,
        }
    }

    /// Whether this error came out of handler invocation
    ///
    /// The replication restart strategy treats handling failures as already
    /// logged and restarts without another error line.
    pub fn is_handling(&self) -> bool {
        matches!(self, MessagingError::Handling { .. })
    }

    /// The server SQLSTATE, when the error carries one
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            MessagingError::Protocol { sqlstate, .. } => sqlstate.as_deref(),
            MessagingError::Driver(err) => err.code().map(|c| c.code()),
            _ => None,
        }
    }

    /// The server routine, when the error carries one
    pub fn routine(&self) -> Option<&str> {
        match self {
            MessagingError::Protocol { routine, .. } => routine.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_ref() -> MessageRef {
        MessageRef {
            id: Uuid::nil(),
            message_type: "order_created".to_string(),
            aggregate_type: "order".to_string(),
            aggregate_id: "o-1".to_string(),
        }
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(MessagingError::db("x").code().as_str(), "DB_ERROR");
        assert_eq!(
            MessagingError::config("x").code().as_str(),
            "CONFIG_ERROR"
        );
        assert_eq!(
            MessagingError::handling("x", message_ref()).code().as_str(),
            "MESSAGE_HANDLING_FAILED"
        );
        assert_eq!(
            MessagingError::NotFound { id: Uuid::nil() }.code().as_str(),
            "MESSAGE_NOT_FOUND"
        );
        assert_eq!(
            MessagingError::ConcurrencyCancelled.code().as_str(),
            "CONCURRENCY_CANCELLED"
        );
    }

    #[test]
    fn poisonous_error_names_the_attempt_gap() {
        let err = MessagingError::Poisonous {
            message_ref: message_ref(),
            started: 4,
            finished: 1,
        };
        assert_eq!(err.code(), ErrorCode::PoisonousMessage);
        let text = err.to_string();
        assert!(text.contains("4 started"));
        assert!(text.contains("1 finished"));
    }

    #[test]
    fn server_error_exposes_sqlstate_and_routine() {
        let err = MessagingError::server(
            "slot is active",
            Some("55006".to_string()),
            Some("ReplicationSlotAcquire".to_string()),
        );
        assert_eq!(err.sqlstate(), Some("55006"));
        assert_eq!(err.routine(), Some("ReplicationSlotAcquire"));
    }

    #[test]
    fn handling_errors_are_recognizable() {
        assert!(MessagingError::handling("boom", message_ref()).is_handling());
        assert!(!MessagingError::db("boom").is_handling());
    }

    #[test]
    fn message_ref_display_is_compact() {
        let text = message_ref().to_string();
        assert!(text.contains("order.order_created"));
        assert!(text.contains("o-1"));
    }
}
