//! The logical replication listener engine
//!
//! Streams inserts of the outbox/inbox table from a replication slot and
//! dispatches every one of them before reading the next frame. The strict
//! serial order makes acknowledgements trivially correct: the position sent
//! to the server always covers a fully finalized prefix of the stream.
//!
//! Per streaming attempt the engine moves through Connecting, Streaming,
//! Stopping and Terminated; any error out of Streaming feeds the restart
//! strategy and the whole cycle begins again. The listener never gives up
//! on its own; only shutdown ends the loop.

use crate::concurrency::{ConcurrencyController, MultiController};
use crate::core::config::{ListenerSettings, ReplicationListenerSettings};
use crate::core::errors::{MessagingError, MessagingResult};
use crate::core::message::StoredMessage;
use crate::db::build_handler_pool;
use crate::dispatch::{
    AttemptCapRetryStrategy, DispatchPipeline, DispatchSource, FixedProcessingTimeout,
    MessageHandlerRegistry, MessageRetryStrategy, ProcessingTimeoutStrategy,
};
use crate::protocol::messages::{
    KeepaliveFrame, PgOutputMessage, ReplicationFrame, StandbyStatusUpdate, XLogDataFrame,
};
use crate::protocol::parser::MessageParser;
use crate::protocol::{XLogRecPtr, format_lsn};
use crate::replication::connection::{
    ReplicationConnection, ReplicationStreamReader, ReplicationStreamWriter,
};
use crate::replication::restart::{ListenerRestartStrategy, StandardRestartStrategy};
use crate::replication::state::{ReplicationState, pg_now};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How long an unanswered reply-requested keepalive may wait for a message
/// acknowledgement before the listener answers with the server position
const KEEPALIVE_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Depth of the bounded queue between the frame reader and the worker
const FRAME_QUEUE_DEPTH: usize = 16;

/// Grace period for closing the stream on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Phases of one streaming attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    Connecting,
    Streaming,
    Stopping,
    Terminated,
}

/// The pluggable pieces of the replication listener
pub struct ReplicationListenerStrategies {
    pub concurrency: Arc<dyn ConcurrencyController>,
    pub retry: Arc<dyn MessageRetryStrategy>,
    pub processing_timeout: Arc<dyn ProcessingTimeoutStrategy>,
    pub restart: Arc<dyn ListenerRestartStrategy>,
}

impl ReplicationListenerStrategies {
    /// The defaults: sequential/parallel routing, attempt-cap retries, fixed
    /// timeout, standard restart classification
    pub fn standard(settings: &ListenerSettings) -> Self {
        Self {
            concurrency: Arc::new(MultiController::sequential_or_parallel()),
            retry: Arc::new(AttemptCapRetryStrategy::new(settings.max_attempts)),
            processing_timeout: Arc::new(FixedProcessingTimeout::new(
                settings.message_processing_timeout,
            )),
            restart: Arc::new(StandardRestartStrategy),
        }
    }
}

/// Handle to a running listener
///
/// Dropping the handle leaves the listener running; call
/// [`shutdown`](ListenerHandle::shutdown) to stop it within the grace
/// period.
pub struct ListenerHandle {
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ListenerHandle {
    pub(crate) fn new(shutdown: CancellationToken, task: tokio::task::JoinHandle<()>) -> Self {
        Self { shutdown, task }
    }

    /// Request shutdown and wait briefly for the listener to wind down
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.task).await.is_err() {
            warn!("The listener did not stop within the grace period");
        }
    }

    /// The token observers may use to watch for shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// The replication listener
pub struct ReplicationMessageListener {
    settings: ReplicationListenerSettings,
    pipeline: Arc<DispatchPipeline>,
    restart: Arc<dyn ListenerRestartStrategy>,
}

impl ReplicationMessageListener {
    /// Build a listener; `strategies` defaults to
    /// [`ReplicationListenerStrategies::standard`]
    pub fn new(
        settings: ReplicationListenerSettings,
        handlers: MessageHandlerRegistry,
        strategies: Option<ReplicationListenerStrategies>,
    ) -> MessagingResult<Self> {
        let strategies =
            strategies.unwrap_or_else(|| ReplicationListenerStrategies::standard(&settings.listener));
        let pool = build_handler_pool(&settings.listener)?;
        let pipeline = Arc::new(DispatchPipeline::new(
            pool,
            &settings.listener,
            handlers,
            strategies.concurrency,
            strategies.retry,
            strategies.processing_timeout,
        ));
        Ok(Self {
            settings,
            pipeline,
            restart: strategies.restart,
        })
    }

    /// Spawn the listener loop and return its handle
    pub fn start(self) -> ListenerHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            self.run(token).await;
        });
        ListenerHandle::new(shutdown, task)
    }

    /// The restart loop around streaming attempts
    async fn run(self, shutdown: CancellationToken) {
        let mut state = ReplicationState::new();
        let mut create_slot = false;

        info!(
            slot = %self.settings.replication_slot,
            publication = %self.settings.publication,
            "Replication listener starting"
        );

        while !shutdown.is_cancelled() {
            match self.stream_once(&mut state, create_slot, &shutdown).await {
                Ok(()) => break,
                Err(err) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    let decision = self.restart.decide(&err, &self.settings);
                    create_slot = decision.create_slot;
                    tokio::select! {
                        _ = tokio::time::sleep(decision.delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        self.pipeline.cancel_concurrency();
        info!("Replication listener stopped");
    }

    /// One full streaming attempt
    async fn stream_once(
        &self,
        state: &mut ReplicationState,
        create_slot: bool,
        shutdown: &CancellationToken,
    ) -> MessagingResult<()> {
        debug!(phase = ?StreamPhase::Connecting, "Opening replication connection");

        let mut connection = tokio::select! {
            connection = ReplicationConnection::connect(&self.settings.listener.listener_db_url) => connection?,
            _ = shutdown.cancelled() => {
                return Ok(());
            }
        };

        self.check_wal_level(&mut connection).await?;
        self.identify_system(&mut connection).await?;
        if create_slot {
            self.create_replication_slot(&mut connection).await?;
        }
        self.check_replication_slot(&mut connection).await?;
        self.check_publication(&mut connection).await?;

        connection
            .start_replication(
                &self.settings.replication_slot,
                &self.settings.publication,
                state.acked_lsn,
            )
            .await?;
        state.reset_session();
        debug!(phase = ?StreamPhase::Streaming, "Started receiving data from database server");

        let (reader, writer) = connection.split();

        // Frames feed a bounded queue; the single worker below drains it so
        // at most one frame is ever in flight.
        let (frame_tx, mut frame_rx) = mpsc::channel::<MessagingResult<Bytes>>(FRAME_QUEUE_DEPTH);
        let reader_task = tokio::spawn(read_frames(reader, frame_tx, shutdown.clone()));

        let (ack_tx, ack_rx) = mpsc::channel::<StandbyStatusUpdate>(FRAME_QUEUE_DEPTH);
        let writer_task = tokio::spawn(write_status_updates(writer, ack_rx));

        let mut worker = StreamWorker {
            settings: &self.settings,
            pipeline: self.pipeline.as_ref(),
            state,
            ack_tx,
            ack_counter: Arc::new(AtomicU64::new(0)),
            keepalive_timer: None,
        };
        let result = worker.drain(&mut frame_rx, shutdown).await;

        debug!(phase = ?StreamPhase::Stopping, "Stopping the replication stream");
        worker.cancel_keepalive_timer();
        drop(worker);
        reader_task.abort();
        if tokio::time::timeout(SHUTDOWN_GRACE, writer_task).await.is_err() {
            warn!("The replication connection did not close within the grace period");
        }
        debug!(phase = ?StreamPhase::Terminated, "Replication stream terminated");

        result
    }

    async fn check_wal_level(&self, connection: &mut ReplicationConnection) -> MessagingResult<()> {
        let rows = connection.simple_query("SHOW wal_level").await?;
        match rows.first().and_then(|row| row.first()).and_then(Clone::clone) {
            Some(level) if level == "logical" => Ok(()),
            Some(level) => Err(MessagingError::protocol(format!(
                "wal_level is '{level}' but must be 'logical'. Please set wal_level to 'logical' in postgresql.conf and restart the PostgreSQL server."
            ))),
            None => Err(MessagingError::protocol("Could not retrieve wal_level")),
        }
    }

    async fn identify_system(&self, connection: &mut ReplicationConnection) -> MessagingResult<()> {
        let rows = connection.simple_query("IDENTIFY_SYSTEM").await?;
        if let Some(row) = rows.first() {
            info!(
                system_id = row.first().and_then(|v| v.as_deref()).unwrap_or("?"),
                timeline = row.get(1).and_then(|v| v.as_deref()).unwrap_or("?"),
                xlogpos = row.get(2).and_then(|v| v.as_deref()).unwrap_or("?"),
                "System identification successful"
            );
        }
        Ok(())
    }

    async fn create_replication_slot(
        &self,
        connection: &mut ReplicationConnection,
    ) -> MessagingResult<()> {
        info!(slot = %self.settings.replication_slot, "Creating the replication slot");
        let sql = format!(
            "CREATE_REPLICATION_SLOT \"{}\" LOGICAL pgoutput NOEXPORT_SNAPSHOT",
            self.settings.replication_slot
        );
        match connection.simple_query(&sql).await {
            Ok(_) => Ok(()),
            // Someone else created it since the last attempt
            Err(err) if err.sqlstate() == Some("42710") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn check_replication_slot(
        &self,
        connection: &mut ReplicationConnection,
    ) -> MessagingResult<()> {
        let sql = format!(
            "SELECT slot_name FROM pg_replication_slots WHERE slot_name = '{}'",
            self.settings.replication_slot
        );
        let rows = connection.simple_query(&sql).await?;
        if rows.is_empty() {
            // Reported with the SQLSTATE and routine the server itself uses
            // for a missing slot, so the restart strategies can classify it.
            return Err(MessagingError::server(
                format!(
                    "Replication slot '{}' does not exist. Create it with:\n\nCREATE_REPLICATION_SLOT \"{}\" LOGICAL pgoutput NOEXPORT_SNAPSHOT;\n",
                    self.settings.replication_slot, self.settings.replication_slot
                ),
                Some("42704".to_string()),
                Some("ReplicationSlotAcquire".to_string()),
            ));
        }
        Ok(())
    }

    async fn check_publication(
        &self,
        connection: &mut ReplicationConnection,
    ) -> MessagingResult<()> {
        let sql = format!(
            "SELECT pubname FROM pg_publication WHERE pubname = '{}'",
            self.settings.publication
        );
        let rows = connection.simple_query(&sql).await?;
        if rows.is_empty() {
            return Err(MessagingError::protocol(format!(
                "Publication '{}' does not exist. Create it with:\n\nCREATE PUBLICATION \"{}\" FOR TABLE {} WITH (publish = 'insert');\n",
                self.settings.publication,
                self.settings.publication,
                self.settings.listener.qualified_table()
            )));
        }
        Ok(())
    }
}

/// Create and start a replication listener in one step
pub fn initialize_replication_message_listener(
    settings: ReplicationListenerSettings,
    handlers: MessageHandlerRegistry,
    strategies: Option<ReplicationListenerStrategies>,
) -> MessagingResult<ListenerHandle> {
    Ok(ReplicationMessageListener::new(settings, handlers, strategies)?.start())
}

/// Reader task: pump copy-data frames into the bounded queue
async fn read_frames(
    mut reader: ReplicationStreamReader,
    frame_tx: mpsc::Sender<MessagingResult<Bytes>>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            frame = reader.next_copy_data() => frame,
            _ = shutdown.cancelled() => break,
        };
        match frame {
            Ok(Some(bytes)) => {
                if frame_tx.send(Ok(bytes)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = frame_tx.send(Err(err)).await;
                break;
            }
        }
    }
}

/// Writer task: apply queued status updates to the socket, then close it
async fn write_status_updates(
    mut writer: ReplicationStreamWriter,
    mut ack_rx: mpsc::Receiver<StandbyStatusUpdate>,
) {
    while let Some(update) = ack_rx.recv().await {
        let encoded = match update.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("Could not encode a status update: {err}");
                continue;
            }
        };
        if let Err(err) = writer.send_copy_data(&encoded).await {
            warn!("Could not send a status update: {err}");
            break;
        }
        trace!(
            flush_lsn = %format_lsn(update.flush_lsn),
            "Sent status update"
        );
    }
    if let Err(err) = writer.close().await {
        debug!("Closing the replication connection failed: {err}");
    }
}

/// The single worker that drains the frame queue
struct StreamWorker<'a> {
    settings: &'a ReplicationListenerSettings,
    pipeline: &'a DispatchPipeline,
    state: &'a mut ReplicationState,
    ack_tx: mpsc::Sender<StandbyStatusUpdate>,
    /// Counts message acknowledgements so keepalive timers can tell whether
    /// one happened while they slept
    ack_counter: Arc<AtomicU64>,
    keepalive_timer: Option<AbortHandle>,
}

impl StreamWorker<'_> {
    /// Process frames strictly one at a time until the stream or the
    /// listener ends
    async fn drain(
        &mut self,
        frame_rx: &mut mpsc::Receiver<MessagingResult<Bytes>>,
        shutdown: &CancellationToken,
    ) -> MessagingResult<()> {
        loop {
            tokio::select! {
                maybe_frame = frame_rx.recv() => match maybe_frame {
                    Some(Ok(bytes)) => self.handle_frame(&bytes, shutdown).await?,
                    Some(Err(err)) => return Err(err),
                    None => {
                        if shutdown.is_cancelled() {
                            return Ok(());
                        }
                        return Err(MessagingError::protocol(
                            "The replication stream ended unexpectedly",
                        ));
                    }
                },
                _ = shutdown.cancelled() => {
                    self.send_final_update().await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        bytes: &[u8],
        shutdown: &CancellationToken,
    ) -> MessagingResult<()> {
        match ReplicationFrame::parse(bytes)? {
            ReplicationFrame::Keepalive(keepalive) => self.handle_keepalive(keepalive),
            ReplicationFrame::XLogData(frame) => self.handle_xlog_data(frame, shutdown).await,
        }
    }

    fn handle_keepalive(&mut self, keepalive: KeepaliveFrame) -> MessagingResult<()> {
        trace!(
            wal_end = %format_lsn(keepalive.wal_end),
            reply_requested = keepalive.reply_requested,
            "Keepalive received"
        );
        if !keepalive.reply_requested {
            return Ok(());
        }

        // Arm the reply timer: if no message acknowledgement happens within
        // the window, answer with the server's own position so the
        // connection stays alive through idle stretches.
        self.cancel_keepalive_timer();
        let acks_when_armed = self.ack_counter.load(Ordering::SeqCst);
        let ack_counter = self.ack_counter.clone();
        let ack_tx = self.ack_tx.clone();
        let server_lsn = keepalive.wal_end;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(KEEPALIVE_REPLY_TIMEOUT).await;
            if ack_counter.load(Ordering::SeqCst) == acks_when_armed {
                let _ = ack_tx
                    .send(StandbyStatusUpdate::standing_by(server_lsn, pg_now()))
                    .await;
            }
        });
        self.keepalive_timer = Some(timer.abort_handle());
        Ok(())
    }

    async fn handle_xlog_data(
        &mut self,
        frame: XLogDataFrame,
        shutdown: &CancellationToken,
    ) -> MessagingResult<()> {
        if frame.wal_start > 0 {
            self.state.update_received(frame.wal_start);
        }

        match MessageParser::parse(&frame.data)? {
            PgOutputMessage::Relation(relation) => {
                debug!(
                    relation = %format!("{}.{}", relation.namespace, relation.name),
                    oid = relation.oid,
                    "Relation information received"
                );
                self.state.add_relation(relation);
                Ok(())
            }
            PgOutputMessage::Begin { xid, .. } => {
                trace!(xid, "Transaction begin");
                Ok(())
            }
            PgOutputMessage::Commit { end_lsn, .. } => {
                trace!(end_lsn = %format_lsn(end_lsn), "Transaction commit");
                Ok(())
            }
            PgOutputMessage::Skipped { tag } => {
                trace!(tag = %tag, "Skipped pgoutput message");
                Ok(())
            }
            PgOutputMessage::Insert {
                relation_id,
                new_tuple,
            } => {
                let Some(relation) = self.state.relation(relation_id) else {
                    return Err(MessagingError::decode(format!(
                        "Insert for unknown relation oid {relation_id}"
                    )));
                };

                // Only inserts into the configured table become messages
                if relation.namespace != self.settings.listener.db_schema
                    || relation.name != self.settings.listener.db_table
                {
                    trace!(
                        relation = %format!("{}.{}", relation.namespace, relation.name),
                        "Ignoring insert into an unrelated table"
                    );
                    return Ok(());
                }

                if relation.columns.len() != new_tuple.columns.len() {
                    return Err(MessagingError::decode(format!(
                        "Tuple has {} columns but the relation describes {}",
                        new_tuple.columns.len(),
                        relation.columns.len()
                    )));
                }
                let message = StoredMessage::from_text_columns(
                    relation
                        .columns
                        .iter()
                        .zip(new_tuple.columns.iter())
                        .map(|(column, value)| (column.name.as_str(), value.as_text())),
                )?;

                // Any Ok outcome means the row is finalized; transient
                // failures surface as errors and restart the stream from
                // the last acknowledged position instead.
                let _outcome = self
                    .pipeline
                    .process(
                        &message,
                        DispatchSource::Replication {
                            lsn: frame.wal_start,
                        },
                        shutdown,
                    )
                    .await?;

                if frame.wal_start > 0 {
                    self.acknowledge(frame.wal_start).await;
                }
                Ok(())
            }
        }
    }

    /// Acknowledge a finalized message's position
    async fn acknowledge(&mut self, lsn: XLogRecPtr) {
        self.cancel_keepalive_timer();
        self.ack_counter.fetch_add(1, Ordering::SeqCst);
        self.state.update_acked(lsn);
        if self
            .ack_tx
            .send(StandbyStatusUpdate::acknowledging(lsn, pg_now()))
            .await
            .is_err()
        {
            warn!("The status update channel closed before the acknowledgement");
        }
    }

    /// Best-effort final position report before shutdown
    async fn send_final_update(&mut self) {
        if self.state.acked_lsn > 0 {
            let _ = self
                .ack_tx
                .send(StandbyStatusUpdate::acknowledging(
                    self.state.acked_lsn,
                    pg_now(),
                ))
                .await;
        }
    }

    fn cancel_keepalive_timer(&mut self) {
        if let Some(timer) = self.keepalive_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ColumnValue, RelationColumn, RelationInfo, TupleData};

    fn relation() -> RelationInfo {
        let names = [
            "id",
            "aggregate_type",
            "aggregate_id",
            "message_type",
            "segment",
            "concurrency",
            "payload",
            "metadata",
            "locked_until",
            "created_at",
            "processed_at",
            "abandoned_at",
            "started_attempts",
            "finished_attempts",
        ];
        RelationInfo {
            oid: 9001,
            namespace: "public".to_string(),
            name: "outbox".to_string(),
            replica_identity: 'd',
            columns: names
                .iter()
                .map(|name| RelationColumn {
                    key_flag: 0,
                    name: name.to_string(),
                    type_oid: 25,
                    type_modifier: -1,
                })
                .collect(),
        }
    }

    #[test]
    fn replicated_tuples_decode_through_the_relation() {
        let relation = relation();
        let tuple = TupleData {
            columns: vec![
                ColumnValue::Text("2f81b1d1-4a91-4c72-9aaa-1d2c19fa5a30".to_string()),
                ColumnValue::Text("source_entity".to_string()),
                ColumnValue::Text("E1".to_string()),
                ColumnValue::Text("source_entity_created".to_string()),
                ColumnValue::Null,
                ColumnValue::Text("sequential".to_string()),
                ColumnValue::Text(r#"{"id": "E1"}"#.to_string()),
                ColumnValue::Null,
                ColumnValue::Text("1970-01-01 00:00:00+00".to_string()),
                ColumnValue::Text("2024-05-02 09:30:01.123456+00".to_string()),
                ColumnValue::Null,
                ColumnValue::Null,
                ColumnValue::Text("0".to_string()),
                ColumnValue::Text("0".to_string()),
            ],
        };

        let message = StoredMessage::from_text_columns(
            relation
                .columns
                .iter()
                .zip(tuple.columns.iter())
                .map(|(column, value)| (column.name.as_str(), value.as_text())),
        )
        .unwrap();

        assert_eq!(message.aggregate_type, "source_entity");
        assert_eq!(message.aggregate_id, "E1");
        assert!(message.segment.is_none());
    }

    #[test]
    fn standard_strategies_follow_the_settings() {
        let settings = ListenerSettings::new(
            crate::core::config::MessageKind::Outbox,
            "postgresql://handler@localhost/msg",
            "postgresql://listener@localhost/msg",
        );
        let strategies = ReplicationListenerStrategies::standard(&settings);
        let message = crate::concurrency::tests::test_message(
            None,
            crate::core::message::Concurrency::Sequential,
        );
        assert_eq!(
            strategies.processing_timeout.timeout_for(&message),
            settings.message_processing_timeout
        );
    }
}
