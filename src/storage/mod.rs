//! Message storage for the outbox and inbox tables
//!
//! Stores messages inside the caller's own transaction so the message row
//! commits and rolls back together with the business change that caused it.

use crate::core::config::ListenerSettings;
use crate::core::errors::{MessagingError, MessagingResult};
use crate::core::message::TransactionalMessage;
use tracing::{debug, warn};

/// Writes messages into the configured outbox or inbox table
pub struct MessageStorage {
    insert_sql: String,
}

impl MessageStorage {
    pub fn new(settings: &ListenerSettings) -> Self {
        let insert_sql = format!(
            "INSERT INTO {} \
             (id, aggregate_type, aggregate_id, message_type, segment, concurrency, payload, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO NOTHING",
            settings.qualified_table()
        );
        Self { insert_sql }
    }

    /// Insert the message using the caller's connection
    ///
    /// The connection is expected to be inside the caller's business
    /// transaction: the row exists exactly when that transaction commits.
    /// Re-storing an id that already exists is a no-op and reported as
    /// success, which makes delivery retries on the consumer side safe.
    pub async fn store_message(
        &self,
        message: &TransactionalMessage,
        client: &tokio_postgres::Client,
    ) -> MessagingResult<()> {
        let inserted = client
            .execute(
                self.insert_sql.as_str(),
                &[
                    &message.id,
                    &message.aggregate_type,
                    &message.aggregate_id,
                    &message.message_type,
                    &message.segment,
                    &message.concurrency.as_str(),
                    &message.payload,
                    &message.metadata,
                    &message.created_at,
                ],
            )
            .await
            .map_err(|err| MessagingError::storage(message.message_ref(), err))?;

        if inserted == 0 {
            warn!(
                message_id = %message.id,
                "The message already existed and was not stored again"
            );
        } else {
            debug!(message_id = %message.id, "Stored message");
        }
        Ok(())
    }
}

/// Create the message storage for the given settings
pub fn initialize_message_storage(settings: &ListenerSettings) -> MessagingResult<MessageStorage> {
    Ok(MessageStorage::new(settings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MessageKind;

    #[test]
    fn insert_statement_targets_the_configured_table() {
        let mut settings = ListenerSettings::new(
            MessageKind::Inbox,
            "postgresql://handler@localhost/msg",
            "postgresql://listener@localhost/msg",
        );
        settings.db_schema = "messaging".to_string();
        settings.db_table = "inbox".to_string();

        let storage = MessageStorage::new(&settings);
        assert!(storage.insert_sql.starts_with("INSERT INTO messaging.inbox "));
        assert!(storage.insert_sql.contains("ON CONFLICT (id) DO NOTHING"));
        assert!(storage.insert_sql.contains("$9"));
    }
}
