//! Scheduled deletion of finished and aged message rows
//!
//! The outbox and inbox tables only ever grow while listeners run; this
//! scheduler trims them on a fixed interval. Each tick runs one transaction
//! with up to three DELETE statements, gated by the configured thresholds.
//! The catch-all threshold removes rows regardless of their state, locked
//! in-flight rows included.

use crate::core::config::ListenerSettings;
use crate::db::{DbTransaction, HandlerPool};
use crate::core::errors::MessagingResult;
use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bound on waiting for a pooled connection for a cleanup tick
const POOL_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the running cleanup schedule
pub struct CleanupHandle {
    token: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl CleanupHandle {
    /// Stop the schedule; a tick in progress finishes its transaction
    pub async fn cancel(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

struct CleanupStatements {
    processed: Option<(String, Duration)>,
    abandoned: Option<(String, Duration)>,
    all: Option<(String, Duration)>,
}

impl CleanupStatements {
    fn new(settings: &ListenerSettings) -> Self {
        let table = settings.qualified_table();
        Self {
            processed: settings.message_cleanup_processed.map(|threshold| {
                (
                    format!("DELETE FROM {table} WHERE processed_at IS NOT NULL AND processed_at < $1"),
                    threshold,
                )
            }),
            abandoned: settings.message_cleanup_abandoned.map(|threshold| {
                (
                    format!("DELETE FROM {table} WHERE abandoned_at IS NOT NULL AND abandoned_at < $1"),
                    threshold,
                )
            }),
            all: settings.message_cleanup_all.map(|threshold| {
                (format!("DELETE FROM {table} WHERE created_at < $1"), threshold)
            }),
        }
    }

    fn is_empty(&self) -> bool {
        self.processed.is_none() && self.abandoned.is_none() && self.all.is_none()
    }
}

/// Start the periodic cleanup for the given settings
///
/// Disabled (and a finished handle returned) unless the settings carry an
/// interval and at least one threshold.
pub fn run_scheduled_message_cleanup(
    pool: HandlerPool,
    settings: &ListenerSettings,
) -> CleanupHandle {
    let token = CancellationToken::new();
    let statements = CleanupStatements::new(settings);

    let Some(interval) = settings.message_cleanup_interval else {
        debug!("Message cleanup is disabled: no interval configured");
        return CleanupHandle {
            token,
            task: tokio::spawn(async {}),
        };
    };
    if statements.is_empty() {
        debug!("Message cleanup is disabled: no thresholds configured");
        return CleanupHandle {
            token,
            task: tokio::spawn(async {}),
        };
    }

    info!(interval = ?interval, "Message cleanup scheduled");
    let task_token = token.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = task_token.cancelled() => break,
            }
            if let Err(err) = cleanup_tick(&pool, &statements).await {
                warn!("Message cleanup tick failed: {err}");
            }
        }
    });

    CleanupHandle { token, task }
}

async fn cleanup_tick(pool: &HandlerPool, statements: &CleanupStatements) -> MessagingResult<()> {
    let tx = DbTransaction::begin(pool, POOL_CHECKOUT_TIMEOUT).await?;
    let now = Utc::now();
    let mut deleted = 0u64;

    for gated in [&statements.processed, &statements.abandoned, &statements.all] {
        if let Some((sql, threshold)) = gated {
            let cutoff = now
                - chrono::Duration::from_std(*threshold)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            deleted += tx.client().execute(sql.as_str(), &[&cutoff]).await?;
        }
    }

    tx.commit().await?;
    if deleted > 0 {
        debug!(deleted, "Deleted finished or aged messages");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MessageKind;

    fn settings() -> ListenerSettings {
        ListenerSettings::new(
            MessageKind::Outbox,
            "postgresql://handler@localhost/msg",
            "postgresql://listener@localhost/msg",
        )
    }

    #[test]
    fn statements_follow_the_thresholds() {
        let mut s = settings();
        s.message_cleanup_processed = Some(Duration::from_secs(3600));
        s.message_cleanup_all = Some(Duration::from_secs(86_400));

        let statements = CleanupStatements::new(&s);
        let (processed_sql, processed_threshold) = statements.processed.unwrap();
        assert!(processed_sql.contains("processed_at < $1"));
        assert_eq!(processed_threshold, Duration::from_secs(3600));

        assert!(statements.abandoned.is_none());

        // The catch-all ignores every state column
        let (all_sql, _) = statements.all.unwrap();
        assert!(all_sql.contains("created_at < $1"));
        assert!(!all_sql.contains("locked_until"));
        assert!(!all_sql.contains("processed_at"));
    }

    #[tokio::test]
    async fn disabled_settings_return_a_finished_handle() {
        let pool = crate::db::build_handler_pool(&settings()).unwrap();
        let handle = run_scheduled_message_cleanup(pool, &settings());
        // Cancelling a disabled schedule returns immediately
        handle.cancel().await;
    }
}
