//! Core module containing fundamental types and configurations
//!
//! This module provides the basic building blocks for the transactional
//! messaging library: configuration management, error handling, and the
//! canonical message model.

pub mod config;
pub mod errors;
pub mod message;

// Re-export for convenience
pub use config::{
    ListenerSettings, MessageKind, PollingListenerSettings, ReplicationListenerSettings,
};
pub use errors::{ErrorCode, MessageRef, MessagingError, MessagingResult};
pub use message::{Concurrency, StoredMessage, TransactionalMessage};
