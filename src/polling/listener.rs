//! The polling listener engine
//!
//! Drives the batch-fetching database function on a schedule. The function
//! returns at most one row per segment and locks everything it returns, so
//! multiple listener instances can poll the same table without stepping on
//! each other's messages, and a segment's next message only becomes
//! fetchable once its predecessor is finalized. Fetched rows are dispatched
//! concurrently subject to the concurrency controller while the loop keeps
//! polling; an empty poll sleeps out the scheduling strategy.

use crate::concurrency::{ConcurrencyController, MultiController};
use crate::core::config::PollingListenerSettings;
use crate::core::errors::{MessagingError, MessagingResult};
use crate::core::message::StoredMessage;
use crate::db::{DbTransaction, HandlerPool, build_handler_pool};
use crate::dispatch::{
    AttemptCapRetryStrategy, DispatchPipeline, DispatchSource, FixedProcessingTimeout,
    MessageHandlerRegistry, MessageRetryStrategy, ProcessingTimeoutStrategy,
};
use crate::polling::batch::{
    BatchSizeStrategy, FixedIntervalSchedule, PollingScheduleStrategy, WarmupBatchSizeStrategy,
};
use crate::replication::listener::ListenerHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Bound on waiting for a pooled connection for the batch fetch
const POOL_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period for draining in-flight dispatches on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// The pluggable pieces of the polling listener
pub struct PollingListenerStrategies {
    pub concurrency: Arc<dyn ConcurrencyController>,
    pub retry: Arc<dyn MessageRetryStrategy>,
    pub processing_timeout: Arc<dyn ProcessingTimeoutStrategy>,
    pub batch_size: Arc<dyn BatchSizeStrategy>,
    pub schedule: Arc<dyn PollingScheduleStrategy>,
}

impl PollingListenerStrategies {
    /// The defaults: per-segment serialization with free parallel messages,
    /// attempt-cap retries, fixed timeout, warmup batch sizing, fixed
    /// polling interval
    pub fn standard(settings: &PollingListenerSettings) -> Self {
        Self {
            concurrency: Arc::new(MultiController::segment_or_parallel()),
            retry: Arc::new(AttemptCapRetryStrategy::new(settings.listener.max_attempts)),
            processing_timeout: Arc::new(FixedProcessingTimeout::new(
                settings.listener.message_processing_timeout,
            )),
            batch_size: Arc::new(WarmupBatchSizeStrategy::new(settings.next_messages_batch_size)),
            schedule: Arc::new(FixedIntervalSchedule::new(
                settings.next_messages_polling_interval,
            )),
        }
    }
}

/// The polling listener
pub struct PollingMessageListener {
    settings: PollingListenerSettings,
    pool: HandlerPool,
    pipeline: Arc<DispatchPipeline>,
    batch_size: Arc<dyn BatchSizeStrategy>,
    schedule: Arc<dyn PollingScheduleStrategy>,
    fetch_sql: String,
}

impl PollingMessageListener {
    /// Build a listener; `strategies` defaults to
    /// [`PollingListenerStrategies::standard`]
    pub fn new(
        settings: PollingListenerSettings,
        handlers: MessageHandlerRegistry,
        strategies: Option<PollingListenerStrategies>,
    ) -> MessagingResult<Self> {
        let strategies =
            strategies.unwrap_or_else(|| PollingListenerStrategies::standard(&settings));
        let pool = build_handler_pool(&settings.listener)?;
        let pipeline = Arc::new(DispatchPipeline::new(
            pool.clone(),
            &settings.listener,
            handlers,
            strategies.concurrency,
            strategies.retry,
            strategies.processing_timeout,
        ));
        let fetch_sql = format!("SELECT * FROM {}($1)", settings.qualified_function());
        Ok(Self {
            settings,
            pool,
            pipeline,
            batch_size: strategies.batch_size,
            schedule: strategies.schedule,
            fetch_sql,
        })
    }

    /// Spawn the polling loop and return its handle
    pub fn start(self) -> ListenerHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            self.run(token).await;
        });
        ListenerHandle::new(shutdown, task)
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(
            function = %self.settings.qualified_function(),
            "Polling listener starting"
        );

        let mut dispatches: JoinSet<()> = JoinSet::new();
        let in_flight_cap = self.settings.listener.max_pool_size;

        while !shutdown.is_cancelled() {
            // Reap finished dispatches and keep the in-flight set below the
            // pool bound; every dispatch needs a connection anyway.
            while dispatches.try_join_next().is_some() {}
            if dispatches.len() >= in_flight_cap {
                tokio::select! {
                    _ = dispatches.join_next() => {}
                    _ = shutdown.cancelled() => break,
                }
                continue;
            }

            match self.poll_once(&mut dispatches, &shutdown).await {
                Ok(0) => {
                    // Nothing new to fetch; sleep until the next scheduled poll
                    tokio::select! {
                        _ = tokio::time::sleep(self.schedule.next_delay()) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Ok(count) => {
                    trace!(count, "Batch dispatching, polling again");
                }
                Err(err) if matches!(err, MessagingError::ListenerStopped { .. }) => {
                    trace!(code = %err.code(), "Polling stopped: {err}");
                    break;
                }
                Err(err) => {
                    error!(code = %err.code(), "Polling failed: {err}");
                    tokio::select! {
                        _ = tokio::time::sleep(self.schedule.next_delay()) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        self.pipeline.cancel_concurrency();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while dispatches.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            dispatches.abort_all();
        }
        info!("Polling listener stopped");
    }

    /// Fetch one batch and spawn a dispatch per row; returns the row count
    ///
    /// The dispatches are not awaited here: the function's row locks keep
    /// other workers and the next poll away from in-flight messages, and a
    /// segment whose oldest message is still running simply yields nothing.
    async fn poll_once(
        &self,
        dispatches: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> MessagingResult<usize> {
        let batch_size = self.batch_size.next_batch_size();

        // The function locks the rows and bumps their started attempts, so
        // the fetch transaction is short and commits before dispatch.
        let tx = tokio::select! {
            tx = DbTransaction::begin(&self.pool, POOL_CHECKOUT_TIMEOUT) => tx?,
            _ = shutdown.cancelled() => {
                return Err(MessagingError::stopped("shutdown before the poll"));
            }
        };
        let rows = tx
            .client()
            .query(self.fetch_sql.as_str(), &[&(batch_size as i32)])
            .await?;
        tx.commit().await?;

        let messages = rows
            .iter()
            .map(StoredMessage::from_row)
            .collect::<MessagingResult<Vec<_>>>()?;
        let count = messages.len();
        if count == 0 {
            return Ok(0);
        }
        debug!(count, batch_size, "Fetched messages to process");

        for message in messages {
            let pipeline = self.pipeline.clone();
            let shutdown = shutdown.clone();
            dispatches.spawn(async move {
                match pipeline
                    .process(&message, DispatchSource::Polling, &shutdown)
                    .await
                {
                    Ok(_) => {}
                    Err(err) if matches!(err, MessagingError::ListenerStopped { .. }) => {
                        trace!(message_id = %message.id, "Dispatch stopped by shutdown");
                    }
                    Err(err) if matches!(err, MessagingError::ConcurrencyCancelled) => {
                        trace!(message_id = %message.id, "Dispatch dropped by controller cancellation");
                    }
                    Err(err) if err.is_handling() => {
                        // Already logged by the pipeline; the row becomes
                        // selectable again once its lock expires.
                    }
                    Err(err) => {
                        error!(
                            code = %err.code(),
                            message_id = %message.id,
                            "Dispatch failed: {err}"
                        );
                    }
                }
            });
        }

        Ok(count)
    }
}

/// Create and start a polling listener in one step
pub fn initialize_polling_message_listener(
    settings: PollingListenerSettings,
    handlers: MessageHandlerRegistry,
    strategies: Option<PollingListenerStrategies>,
) -> MessagingResult<ListenerHandle> {
    Ok(PollingMessageListener::new(settings, handlers, strategies)?.start())
}
