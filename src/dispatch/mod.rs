//! The dispatch pipeline
//!
//! Both listener engines hand every inbound message to this pipeline. It
//! verifies the row under a lock, routes to the matching handler with a
//! processing timeout, and finalizes the row as processed, retried, or
//! abandoned. The pipeline owns all attempt bookkeeping; listeners only
//! decide what a finalized message means for their stream position.

pub mod handler;
pub mod retry;

pub use handler::{GeneralMessageHandler, MessageHandler, MessageHandlerRegistry};
pub use retry::{
    AttemptCapRetryStrategy, FixedProcessingTimeout, MessageRetryStrategy,
    ProcessingTimeoutStrategy, RetryDecision,
};

use crate::concurrency::ConcurrencyController;
use crate::core::config::ListenerSettings;
use crate::core::errors::{ErrorCode, MessagingError, MessagingResult};
use crate::core::message::StoredMessage;
use crate::db::{DbTransaction, HandlerPool};
use crate::protocol::{XLogRecPtr, format_lsn};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bound on waiting for a pooled connection inside a dispatch
const POOL_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a message came from, for logging and attempt accounting
///
/// The polling batch function already incremented `started_attempts` when it
/// locked the row; the replication listener has no such hook and lets the
/// pipeline do it.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DispatchSource {
    Replication { lsn: XLogRecPtr },
    Polling,
}

/// What finally happened to a dispatched message
///
/// Every variant stands for a finalized row whose stream position may be
/// acknowledged; a transient failure surfaces as an error instead of an
/// outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// The handler ran and the row is marked processed
    Processed,
    /// The row needed no work (missing, already processed, already abandoned)
    Dropped(ErrorCode),
    /// The row was marked abandoned during this dispatch
    Abandoned(ErrorCode),
}

/// The row state the verification query sees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RowState {
    pub processed_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub started_attempts: i16,
    pub finished_attempts: i16,
}

impl RowState {
    fn from_row(row: &tokio_postgres::Row) -> MessagingResult<Self> {
        Ok(Self {
            processed_at: row.try_get("processed_at")?,
            abandoned_at: row.try_get("abandoned_at")?,
            started_attempts: row.try_get("started_attempts")?,
            finished_attempts: row.try_get("finished_attempts")?,
        })
    }
}

/// The verdict of the verification step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerifyOutcome {
    Proceed,
    NotFound,
    AlreadyProcessed,
    Abandoned,
    MaxAttemptsExceeded,
    Poisonous,
}

/// Classify a locked row before any attempt bookkeeping happens
///
/// The poison check compares the gap between started and finished attempts:
/// a handler that keeps crashing the process starts attempts it never
/// finishes, and such a message must not take the listener down with it
/// again.
pub(crate) fn classify_row(
    row: Option<&RowState>,
    max_attempts: i16,
    max_poisonous_attempts: i16,
) -> VerifyOutcome {
    let Some(row) = row else {
        return VerifyOutcome::NotFound;
    };
    if row.processed_at.is_some() {
        return VerifyOutcome::AlreadyProcessed;
    }
    if row.abandoned_at.is_some() {
        return VerifyOutcome::Abandoned;
    }
    if row.finished_attempts >= max_attempts {
        return VerifyOutcome::MaxAttemptsExceeded;
    }
    if row.started_attempts - row.finished_attempts >= max_poisonous_attempts {
        return VerifyOutcome::Poisonous;
    }
    VerifyOutcome::Proceed
}

struct Statements {
    verify: String,
    increment_started: String,
    mark_processed: String,
    mark_transient: String,
    mark_abandoned: String,
    abandon_unstarted: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        Self {
            verify: format!(
                "SELECT processed_at, abandoned_at, started_attempts, finished_attempts \
                 FROM {table} WHERE id = $1 FOR UPDATE NOWAIT"
            ),
            increment_started: format!(
                "UPDATE {table} SET started_attempts = started_attempts + 1 WHERE id = $1"
            ),
            mark_processed: format!(
                "UPDATE {table} SET processed_at = clock_timestamp(), \
                 finished_attempts = finished_attempts + 1 WHERE id = $1"
            ),
            mark_transient: format!(
                "UPDATE {table} SET finished_attempts = finished_attempts + 1 WHERE id = $1"
            ),
            mark_abandoned: format!(
                "UPDATE {table} SET abandoned_at = clock_timestamp(), \
                 finished_attempts = finished_attempts + 1 WHERE id = $1"
            ),
            abandon_unstarted: format!(
                "UPDATE {table} SET abandoned_at = clock_timestamp() WHERE id = $1"
            ),
        }
    }
}

/// The pipeline both listener engines dispatch through
pub(crate) struct DispatchPipeline {
    pool: HandlerPool,
    handlers: MessageHandlerRegistry,
    concurrency: Arc<dyn ConcurrencyController>,
    retry: Arc<dyn MessageRetryStrategy>,
    processing_timeout: Arc<dyn ProcessingTimeoutStrategy>,
    max_attempts: i16,
    max_poisonous_attempts: i16,
    statements: Statements,
}

impl DispatchPipeline {
    pub(crate) fn new(
        pool: HandlerPool,
        settings: &ListenerSettings,
        handlers: MessageHandlerRegistry,
        concurrency: Arc<dyn ConcurrencyController>,
        retry: Arc<dyn MessageRetryStrategy>,
        processing_timeout: Arc<dyn ProcessingTimeoutStrategy>,
    ) -> Self {
        Self {
            pool,
            handlers,
            concurrency,
            retry,
            processing_timeout,
            max_attempts: settings.max_attempts,
            max_poisonous_attempts: settings.max_poisonous_attempts,
            statements: Statements::new(&settings.qualified_table()),
        }
    }

    /// Cancel the concurrency controller, failing all queued dispatches
    pub(crate) fn cancel_concurrency(&self) {
        self.concurrency.cancel();
    }

    /// Run one message through verify, handle and finalize
    ///
    /// A transient handler failure comes back as a
    /// [`MessagingError::Handling`] so the replication listener can restart
    /// its stream from the last acknowledged position and redeliver; the
    /// polling listener just lets the row lock expire. Every `Ok` outcome
    /// means the row is finalized.
    pub(crate) async fn process(
        &self,
        message: &StoredMessage,
        source: DispatchSource,
        shutdown: &CancellationToken,
    ) -> MessagingResult<DispatchOutcome> {
        // Step 1: verify the row state under lock, in its own transaction
        let tx = DbTransaction::begin(&self.pool, POOL_CHECKOUT_TIMEOUT).await?;
        let row = tx
            .client()
            .query_opt(self.statements.verify.as_str(), &[&message.id])
            .await?;
        let state = row.as_ref().map(RowState::from_row).transpose()?;

        match classify_row(state.as_ref(), self.max_attempts, self.max_poisonous_attempts) {
            VerifyOutcome::Proceed => {
                // The polling batch function already counted the started
                // attempt when it locked the row.
                if matches!(source, DispatchSource::Replication { .. }) {
                    tx.client()
                        .execute(self.statements.increment_started.as_str(), &[&message.id])
                        .await?;
                }
                tx.commit().await?;
            }
            VerifyOutcome::NotFound => {
                tx.rollback().await?;
                error!(
                    code = %ErrorCode::MessageNotFound,
                    message_id = %message.id,
                    "The message could not be found"
                );
                return Ok(DispatchOutcome::Dropped(ErrorCode::MessageNotFound));
            }
            VerifyOutcome::AlreadyProcessed => {
                tx.rollback().await?;
                error!(
                    code = %ErrorCode::AlreadyProcessed,
                    message_id = %message.id,
                    "The message was already processed"
                );
                return Ok(DispatchOutcome::Dropped(ErrorCode::AlreadyProcessed));
            }
            VerifyOutcome::Abandoned => {
                tx.rollback().await?;
                error!(
                    code = %ErrorCode::AbandonedMessage,
                    message_id = %message.id,
                    "The message was abandoned earlier and is skipped"
                );
                return Ok(DispatchOutcome::Dropped(ErrorCode::AbandonedMessage));
            }
            VerifyOutcome::MaxAttemptsExceeded => {
                tx.client()
                    .execute(self.statements.abandon_unstarted.as_str(), &[&message.id])
                    .await?;
                tx.commit().await?;
                error!(
                    code = %ErrorCode::MaxAttemptsExceeded,
                    message_id = %message.id,
                    message_type = %message.message_type,
                    "The message reached its maximum attempts and was abandoned"
                );
                return Ok(DispatchOutcome::Abandoned(ErrorCode::MaxAttemptsExceeded));
            }
            VerifyOutcome::Poisonous => {
                tx.client()
                    .execute(self.statements.abandon_unstarted.as_str(), &[&message.id])
                    .await?;
                tx.commit().await?;
                error!(
                    code = %ErrorCode::PoisonousMessage,
                    message_id = %message.id,
                    message_type = %message.message_type,
                    "The message keeps crashing its handler and was abandoned"
                );
                return Ok(DispatchOutcome::Abandoned(ErrorCode::PoisonousMessage));
            }
        }

        // Step 2: wait for the concurrency controller
        let _slot = tokio::select! {
            slot = self.concurrency.acquire(message) => slot?,
            _ = shutdown.cancelled() => {
                return Err(MessagingError::stopped(
                    "shutdown while waiting for a concurrency slot",
                ));
            }
        };

        // Step 3: the handler transaction; the row lock spans the handler
        let tx = DbTransaction::begin(&self.pool, POOL_CHECKOUT_TIMEOUT).await?;
        let row = tx
            .client()
            .query_opt(self.statements.verify.as_str(), &[&message.id])
            .await?;
        match row.as_ref().map(RowState::from_row).transpose()? {
            None => {
                tx.rollback().await?;
                return Ok(DispatchOutcome::Dropped(ErrorCode::MessageNotFound));
            }
            Some(state) if state.processed_at.is_some() => {
                tx.rollback().await?;
                return Ok(DispatchOutcome::Dropped(ErrorCode::AlreadyProcessed));
            }
            Some(state) if state.abandoned_at.is_some() => {
                tx.rollback().await?;
                return Ok(DispatchOutcome::Dropped(ErrorCode::AbandonedMessage));
            }
            Some(_) => {}
        }

        match self.invoke_handler(message, &tx, shutdown).await {
            Ok(()) => {
                tx.client()
                    .execute(self.statements.mark_processed.as_str(), &[&message.id])
                    .await?;
                tx.commit().await?;
                self.log_finished(&source, message);
                Ok(DispatchOutcome::Processed)
            }
            Err(err) if matches!(err, MessagingError::ListenerStopped { .. }) => {
                let _ = tx.rollback().await;
                Err(err)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                self.finalize_failure(message, source, err).await
            }
        }
    }

    /// Invoke the matching handler inside the given transaction
    async fn invoke_handler(
        &self,
        message: &StoredMessage,
        tx: &DbTransaction,
        shutdown: &CancellationToken,
    ) -> MessagingResult<()> {
        if !self.handlers.matches(message) {
            debug!(
                message_id = %message.id,
                message_type = %message.message_type,
                "No handler registered; treating the message as processed"
            );
            return Ok(());
        }

        let timeout = self.processing_timeout.timeout_for(message);
        let cancel_token = tx.client().cancel_token();

        let result = tokio::select! {
            result = tokio::time::timeout(timeout, self.handlers.invoke(message, tx.client())) => result,
            _ = shutdown.cancelled() => {
                // Stop the statement the handler may have in flight before
                // the transaction rolls back.
                let _ = cancel_token.cancel_query(NoTls).await;
                return Err(MessagingError::stopped("shutdown during handler execution"));
            }
        };

        match result {
            Ok(Ok(_invoked)) => Ok(()),
            Ok(Err(err)) => Err(MessagingError::handling_with_source(
                "The handler returned an error",
                message.message_ref(),
                err,
            )),
            Err(_elapsed) => {
                let _ = cancel_token.cancel_query(NoTls).await;
                Err(MessagingError::handling(
                    format!("The handler did not finish within {timeout:?}"),
                    message.message_ref(),
                ))
            }
        }
    }

    /// Record a failed attempt in a fresh transaction
    async fn finalize_failure(
        &self,
        message: &StoredMessage,
        source: DispatchSource,
        err: MessagingError,
    ) -> MessagingResult<DispatchOutcome> {
        let tx = DbTransaction::begin(&self.pool, POOL_CHECKOUT_TIMEOUT).await?;
        let row = tx
            .client()
            .query_opt(self.statements.verify.as_str(), &[&message.id])
            .await?;

        let Some(state) = row.as_ref().map(RowState::from_row).transpose()? else {
            // The row disappeared under a failed handler; nothing to record
            tx.rollback().await?;
            return Err(err);
        };
        if state.processed_at.is_some() || state.abandoned_at.is_some() {
            // Already finalized; processed and abandoned marks are never
            // overwritten
            tx.rollback().await?;
            return Err(err);
        }

        // The strategy sees the current counters, not the snapshot from
        // selection time
        let mut current = message.clone();
        current.started_attempts = state.started_attempts;
        current.finished_attempts = state.finished_attempts;

        match self.retry.decide(&current, &err) {
            RetryDecision::Transient => {
                tx.client()
                    .execute(self.statements.mark_transient.as_str(), &[&message.id])
                    .await?;
                tx.commit().await?;
                warn!(
                    code = %err.code(),
                    message_id = %message.id,
                    finished_attempts = current.finished_attempts + 1,
                    "Message handling failed and will be retried: {err}"
                );
                Err(err)
            }
            RetryDecision::Permanent => {
                tx.client()
                    .execute(self.statements.mark_abandoned.as_str(), &[&message.id])
                    .await?;
                tx.commit().await?;
                error!(
                    code = %err.code(),
                    message_id = %message.id,
                    message_type = %message.message_type,
                    "Message handling failed for good; the message was abandoned: {err}"
                );
                self.log_finished(&source, message);
                Ok(DispatchOutcome::Abandoned(ErrorCode::MessageHandlingFailed))
            }
        }
    }

    fn log_finished(&self, source: &DispatchSource, message: &StoredMessage) {
        match source {
            DispatchSource::Replication { lsn } => info!(
                lsn = %format_lsn(*lsn),
                message_id = %message.id,
                message_type = %message.message_type,
                "Finished processing message"
            ),
            DispatchSource::Polling => info!(
                message_id = %message.id,
                message_type = %message.message_type,
                "Finished processing message"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(
        processed: bool,
        abandoned: bool,
        started: i16,
        finished: i16,
    ) -> RowState {
        RowState {
            processed_at: processed.then(Utc::now),
            abandoned_at: abandoned.then(Utc::now),
            started_attempts: started,
            finished_attempts: finished,
        }
    }

    #[test]
    fn missing_rows_are_not_found() {
        assert_eq!(classify_row(None, 5, 3), VerifyOutcome::NotFound);
    }

    #[test]
    fn processed_wins_over_everything() {
        let row = state(true, false, 9, 9);
        assert_eq!(classify_row(Some(&row), 5, 3), VerifyOutcome::AlreadyProcessed);
    }

    #[test]
    fn abandoned_rows_are_skipped() {
        let row = state(false, true, 2, 2);
        assert_eq!(classify_row(Some(&row), 5, 3), VerifyOutcome::Abandoned);
    }

    #[test]
    fn attempt_cap_is_detected() {
        let row = state(false, false, 5, 5);
        assert_eq!(classify_row(Some(&row), 5, 3), VerifyOutcome::MaxAttemptsExceeded);

        let row = state(false, false, 4, 4);
        assert_eq!(classify_row(Some(&row), 5, 3), VerifyOutcome::Proceed);
    }

    #[test]
    fn poison_gap_is_detected() {
        // Three attempts started, none ever finished
        let row = state(false, false, 3, 0);
        assert_eq!(classify_row(Some(&row), 5, 3), VerifyOutcome::Poisonous);

        // A gap below the threshold proceeds
        let row = state(false, false, 2, 0);
        assert_eq!(classify_row(Some(&row), 5, 3), VerifyOutcome::Proceed);
    }

    #[test]
    fn max_attempts_is_checked_before_poison() {
        let row = state(false, false, 8, 5);
        assert_eq!(classify_row(Some(&row), 5, 3), VerifyOutcome::MaxAttemptsExceeded);
    }

    #[test]
    fn statements_target_the_table() {
        let statements = Statements::new("messaging.outbox");
        assert!(statements.verify.contains("FROM messaging.outbox"));
        assert!(statements.verify.contains("FOR UPDATE NOWAIT"));
        assert!(statements.mark_processed.contains("processed_at = clock_timestamp()"));
        assert!(statements.mark_abandoned.contains("abandoned_at = clock_timestamp()"));
        assert!(
            statements.mark_transient.contains("finished_attempts = finished_attempts + 1")
        );
        assert!(!statements.abandon_unstarted.contains("finished_attempts"));
    }

}
