//! Message handler traits and registry
//!
//! Handlers are the seam between the library and the application. A typed
//! handler claims one `(aggregate type, message type)` pair; a general
//! handler receives every message of its listener. Handlers run inside the
//! transaction the pipeline opened for them, so their own database work
//! commits and rolls back together with the message finalization.

use crate::core::errors::MessagingResult;
use crate::core::message::StoredMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Handles messages of one aggregate type and message type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// The aggregate type this handler claims
    fn aggregate_type(&self) -> &str;

    /// The message type this handler claims
    fn message_type(&self) -> &str;

    /// Handle one message
    ///
    /// The client is inside the processing transaction: any rows written
    /// here become durable only when the message is marked as processed.
    /// Returning an error (or timing out) rolls everything back and routes
    /// the message into the retry strategy.
    async fn handle(
        &self,
        message: &StoredMessage,
        client: &tokio_postgres::Client,
    ) -> MessagingResult<()>;
}

/// Handles every message of a listener regardless of its types
#[async_trait]
pub trait GeneralMessageHandler: Send + Sync {
    async fn handle(
        &self,
        message: &StoredMessage,
        client: &tokio_postgres::Client,
    ) -> MessagingResult<()>;
}

/// The handler set a listener dispatches into
///
/// Built either from typed handlers (routed by exact match) or from one
/// general handler. A message no handler claims is treated as successfully
/// processed; such marker messages exist only for their row.
pub enum MessageHandlerRegistry {
    Typed(HashMap<(String, String), Arc<dyn MessageHandler>>),
    General(Arc<dyn GeneralMessageHandler>),
}

impl MessageHandlerRegistry {
    /// Build a registry from typed handlers
    ///
    /// When two handlers claim the same pair the later one wins and the
    /// collision is logged.
    pub fn from_handlers(handlers: Vec<Arc<dyn MessageHandler>>) -> Self {
        let mut map: HashMap<(String, String), Arc<dyn MessageHandler>> = HashMap::new();
        for handler in handlers {
            let key = (
                handler.aggregate_type().to_string(),
                handler.message_type().to_string(),
            );
            if map.insert(key.clone(), handler).is_some() {
                warn!(
                    "Multiple handlers claim {}.{}; the last one registered wins",
                    key.0, key.1
                );
            }
        }
        Self::Typed(map)
    }

    /// Build a registry around one general handler
    pub fn from_general(handler: Arc<dyn GeneralMessageHandler>) -> Self {
        Self::General(handler)
    }

    /// Invoke the handler responsible for this message, if any
    ///
    /// Returns `false` when no handler matched and nothing was invoked.
    pub async fn invoke(
        &self,
        message: &StoredMessage,
        client: &tokio_postgres::Client,
    ) -> MessagingResult<bool> {
        match self {
            Self::General(handler) => {
                handler.handle(message, client).await?;
                Ok(true)
            }
            Self::Typed(map) => {
                let key = (
                    message.aggregate_type.clone(),
                    message.message_type.clone(),
                );
                match map.get(&key) {
                    Some(handler) => {
                        handler.handle(message, client).await?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    /// Whether any handler would claim this message
    pub fn matches(&self, message: &StoredMessage) -> bool {
        match self {
            Self::General(_) => true,
            Self::Typed(map) => map.contains_key(&(
                message.aggregate_type.clone(),
                message.message_type.clone(),
            )),
        }
    }
}
