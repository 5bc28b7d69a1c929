//! Database access helpers for the handler role
//!
//! Provides the bounded connection pool the listeners and the cleanup
//! scheduler share, plus a transaction scope that guarantees rollback when
//! it is dropped without an explicit commit.

use crate::core::config::ListenerSettings;
use crate::core::errors::{MessagingError, MessagingResult};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::warn;

/// The bounded pool of handler-role connections
pub type HandlerPool = Pool;

/// Build the handler connection pool from the listener settings
///
/// Connections are created lazily on first checkout, so building the pool
/// never touches the network.
pub fn build_handler_pool(settings: &ListenerSettings) -> MessagingResult<HandlerPool> {
    let config: tokio_postgres::Config = settings
        .handler_db_url
        .parse()
        .map_err(|err: tokio_postgres::Error| {
            MessagingError::config(format!("Invalid handler connection URL: {err}"))
        })?;

    let manager = Manager::from_config(
        config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );

    Pool::builder(manager)
        .max_size(settings.max_pool_size)
        .build()
        .map_err(|err| MessagingError::db(format!("Could not build the connection pool: {err}")))
}

/// Check out a pooled connection, bounded by a timeout
///
/// A pool drained by stuck handlers must surface an error instead of
/// blocking a listener loop forever.
pub async fn checkout(pool: &HandlerPool, timeout: Duration) -> MessagingResult<Object> {
    match tokio::time::timeout(timeout, pool.get()).await {
        Ok(client) => Ok(client?),
        Err(_) => Err(MessagingError::db(format!(
            "Timed out after {timeout:?} waiting for a pooled connection"
        ))),
    }
}

/// A transaction scope over a pooled connection
///
/// The scope owns its connection for its whole lifetime. Finish it with
/// [`commit`](DbTransaction::commit) or [`rollback`](DbTransaction::rollback);
/// a scope dropped any other way rolls the transaction back before the
/// connection returns to the pool, so no half-done work can leak into the
/// next checkout.
pub struct DbTransaction {
    client: Option<Object>,
}

impl DbTransaction {
    /// Check out a connection and open a transaction on it
    pub async fn begin(pool: &HandlerPool, checkout_timeout: Duration) -> MessagingResult<Self> {
        let client = checkout(pool, checkout_timeout).await?;
        client.batch_execute("BEGIN").await?;
        Ok(Self {
            client: Some(client),
        })
    }

    /// The connection this transaction runs on
    pub fn client(&self) -> &tokio_postgres::Client {
        self.client
            .as_ref()
            .expect("transaction client taken only on completion")
    }

    /// Commit and return the connection to the pool
    pub async fn commit(mut self) -> MessagingResult<()> {
        let client = self.client.take().expect("commit called once");
        client.batch_execute("COMMIT").await?;
        Ok(())
    }

    /// Roll back and return the connection to the pool
    pub async fn rollback(mut self) -> MessagingResult<()> {
        let client = self.client.take().expect("rollback called once");
        client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

impl Drop for DbTransaction {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            // The scope ended without commit or rollback (an error path or a
            // cancelled future). Roll back asynchronously before the
            // connection goes back to the pool.
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(err) = client.batch_execute("ROLLBACK").await {
                            warn!("Rollback of an abandoned transaction failed: {err}");
                        }
                    });
                }
                Err(_) => warn!("Abandoned transaction dropped outside the runtime"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MessageKind;

    fn settings(url: &str) -> ListenerSettings {
        ListenerSettings::new(MessageKind::Outbox, url, "postgresql://listener@localhost/msg")
    }

    #[test]
    fn pool_building_is_lazy_and_validates_the_url() {
        let pool = build_handler_pool(&settings("postgresql://handler:pw@localhost:5432/msg"));
        assert!(pool.is_ok());

        let err = build_handler_pool(&settings("this is not a url")).unwrap_err();
        assert!(err.to_string().contains("handler connection URL"));
    }

    #[test]
    fn pool_respects_the_configured_bound() {
        let mut s = settings("postgresql://handler@localhost/msg");
        s.max_pool_size = 3;
        let pool = build_handler_pool(&s).unwrap();
        assert_eq!(pool.status().max_size, 3);
    }
}
