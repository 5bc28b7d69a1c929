//! Transactional outbox and inbox messaging for PostgreSQL
//!
//! Implements exactly-once effective processing of asynchronous messages on
//! top of at-least-once delivery primitives. Messages are written into an
//! outbox or inbox table inside the application's own business transaction;
//! one of two interchangeable listener engines observes the rows and drives
//! them through a dispatch pipeline with ordering, retry, and poison-message
//! policies:
//!
//! - the **replication listener** streams inserts from the write-ahead log
//!   through a logical replication slot, and
//! - the **polling listener** invokes a database function that selects and
//!   locks the next batch of unprocessed rows.
//!
//! The `txbox-setup` binary generates the SQL and the environment template a
//! deployment needs.
//!
//! ## Producing messages
//!
//! ```no_run
//! use txbox::{ListenerSettings, MessageKind, TransactionalMessage};
//! use txbox::storage::initialize_message_storage;
//!
//! # async fn example(client: tokio_postgres::Client) -> txbox::MessagingResult<()> {
//! let settings = ListenerSettings::from_env(MessageKind::Outbox)?;
//! let storage = initialize_message_storage(&settings)?;
//!
//! let message = TransactionalMessage::new(
//!     "source_entity",
//!     "E1",
//!     "source_entity_created",
//!     serde_json::json!({ "id": "E1" }),
//! );
//!
//! // Inside the caller's transaction:
//! client.batch_execute("BEGIN").await?;
//! storage.store_message(&message, &client).await?;
//! client.batch_execute("COMMIT").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Consuming messages
//!
//! ```no_run
//! use txbox::{MessageKind, ReplicationListenerSettings};
//! use txbox::dispatch::MessageHandlerRegistry;
//! use txbox::replication::listener::initialize_replication_message_listener;
//!
//! # async fn example() -> txbox::MessagingResult<()> {
//! let settings = ReplicationListenerSettings::from_env(MessageKind::Inbox)?;
//! let handlers = MessageHandlerRegistry::from_handlers(vec![/* ... */]);
//! let listener = initialize_replication_message_listener(settings, handlers, None)?;
//! // ...
//! listener.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod concurrency;
pub mod core;
pub mod db;
pub mod dispatch;
pub mod polling;
pub mod protocol;
pub mod replication;
pub mod setup;
pub mod storage;

// Re-export the everyday surface at the crate root
pub use crate::cleanup::{CleanupHandle, run_scheduled_message_cleanup};
pub use crate::core::config::{
    ListenerSettings, MessageKind, PollingListenerSettings, ReplicationListenerSettings,
};
pub use crate::core::errors::{ErrorCode, MessageRef, MessagingError, MessagingResult};
pub use crate::core::message::{Concurrency, StoredMessage, TransactionalMessage};
pub use crate::dispatch::{GeneralMessageHandler, MessageHandler, MessageHandlerRegistry};
pub use crate::polling::listener::{
    PollingListenerStrategies, PollingMessageListener, initialize_polling_message_listener,
};
pub use crate::replication::listener::{
    ListenerHandle, ReplicationListenerStrategies, ReplicationMessageListener,
    initialize_replication_message_listener,
};
pub use crate::setup::{DatabaseSetupExporter, SetupConfig};
pub use crate::storage::{MessageStorage, initialize_message_storage};
