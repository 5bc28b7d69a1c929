//! Replication state management
//!
//! Provides state tracking for the logical replication listener: schema
//! information learned from Relation messages, LSN positions, and the
//! timestamp conversion the status updates need.

use crate::protocol::messages::RelationInfo;
use crate::protocol::{INVALID_XLOG_REC_PTR, Oid, TimestampTz, XLogRecPtr};
use chrono::Utc;
use std::collections::HashMap;

// Microseconds from the Unix epoch (1970) to the PostgreSQL epoch (2000)
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800 * 1_000_000;

/// The current time in PostgreSQL timestamp format
///
/// Status updates carry client timestamps as microseconds since midnight
/// 2000-01-01 UTC.
pub fn pg_now() -> TimestampTz {
    Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

/// Mutable state of one replication listener
///
/// `received_lsn` tracks the highest WAL position seen on the stream;
/// `acked_lsn` the highest position whose message has been finalized and
/// acknowledged. Relations are cached per session so inserts can be mapped
/// back to column names.
#[derive(Debug, Default)]
pub struct ReplicationState {
    pub received_lsn: XLogRecPtr,
    pub acked_lsn: XLogRecPtr,
    relations: HashMap<Oid, RelationInfo>,
}

impl ReplicationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a WAL position seen on the stream; lower positions are ignored
    pub fn update_received(&mut self, lsn: XLogRecPtr) {
        if lsn > self.received_lsn {
            self.received_lsn = lsn;
        }
    }

    /// Record an acknowledged WAL position; lower positions are ignored
    pub fn update_acked(&mut self, lsn: XLogRecPtr) {
        if lsn > self.acked_lsn {
            self.acked_lsn = lsn;
        }
    }

    /// Whether any WAL data arrived on this stream yet
    pub fn has_received_data(&self) -> bool {
        self.received_lsn != INVALID_XLOG_REC_PTR
    }

    /// Cache the schema information of a relation
    pub fn add_relation(&mut self, relation: RelationInfo) {
        self.relations.insert(relation.oid, relation);
    }

    /// Look up a cached relation by oid
    pub fn relation(&self, oid: Oid) -> Option<&RelationInfo> {
        self.relations.get(&oid)
    }

    /// Forget the per-session state; the acknowledged position survives
    /// restarts so the next stream resumes where finalization left off
    pub fn reset_session(&mut self) {
        self.received_lsn = INVALID_XLOG_REC_PTR;
        self.relations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn relation(oid: Oid) -> RelationInfo {
        RelationInfo {
            oid,
            namespace: "public".to_string(),
            name: "outbox".to_string(),
            replica_identity: 'd',
            columns: vec![],
        }
    }

    #[test]
    fn lsn_updates_are_monotonic() {
        let mut state = ReplicationState::new();
        assert!(!state.has_received_data());

        state.update_received(100);
        assert_eq!(state.received_lsn, 100);
        assert!(state.has_received_data());

        state.update_received(50);
        assert_eq!(state.received_lsn, 100);

        state.update_acked(80);
        state.update_acked(10);
        assert_eq!(state.acked_lsn, 80);
    }

    #[test]
    fn relation_cache_round_trip() {
        let mut state = ReplicationState::new();
        state.add_relation(relation(12345));

        assert_eq!(state.relation(12345).unwrap().name, "outbox");
        assert!(state.relation(99999).is_none());
    }

    #[test]
    fn session_reset_keeps_the_ack_position() {
        let mut state = ReplicationState::new();
        state.update_received(100);
        state.update_acked(90);
        state.add_relation(relation(1));

        state.reset_session();

        assert_eq!(state.received_lsn, 0);
        assert_eq!(state.acked_lsn, 90);
        assert!(state.relation(1).is_none());
    }

    #[test]
    fn pg_epoch_starts_in_2000() {
        let unix_2000 = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let offset_micros = unix_2000.timestamp_micros();
        assert_eq!(offset_micros, PG_EPOCH_OFFSET_MICROS);
        // pg_now counts from that epoch, so it is far smaller than the Unix clock
        assert!(pg_now() < Utc::now().timestamp_micros());
        assert!(pg_now() > 0);
    }
}
