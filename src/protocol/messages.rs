//! PostgreSQL logical replication protocol messages
//!
//! Contains the data structures for the streaming replication frames and the
//! pgoutput plugin messages the listener consumes, plus the standby status
//! update it writes back. Only inserts matter to the outbox/inbox tables;
//! other change messages are recognized and skipped.

use crate::core::errors::{MessagingError, MessagingResult};
use crate::protocol::buffer::{BufferReader, BufferWriter};
use crate::protocol::{Oid, TimestampTz, XLogRecPtr, Xid};

/// Copy-data frame tags of the streaming replication protocol
pub const XLOG_DATA_TAG: u8 = b'w';
pub const KEEPALIVE_TAG: u8 = b'k';
pub const STATUS_UPDATE_TAG: u8 = b'r';

/// A `w` frame carrying a chunk of WAL data
///
/// The payload is one pgoutput message; `wal_start` is the LSN the chunk
/// begins at and drives acknowledgements.
#[derive(Debug, Clone)]
pub struct XLogDataFrame {
    pub wal_start: XLogRecPtr,
    pub wal_end: XLogRecPtr,
    pub send_time: TimestampTz,
    pub data: Vec<u8>,
}

impl TryFrom<&[u8]> for XLogDataFrame {
    type Error = MessagingError;

    fn try_from(buffer: &[u8]) -> Result<Self, Self::Error> {
        let mut reader = BufferReader::new(buffer);
        let tag = reader.read_u8()?;
        if tag != XLOG_DATA_TAG {
            return Err(MessagingError::decode(format!(
                "Expected XLogData frame, got tag {}",
                tag as char
            )));
        }
        let wal_start = reader.read_u64()?;
        let wal_end = reader.read_u64()?;
        let send_time = reader.read_i64()?;
        let data = reader.rest().to_vec();
        if data.is_empty() {
            return Err(MessagingError::decode("XLogData frame has no payload"));
        }
        Ok(Self {
            wal_start,
            wal_end,
            send_time,
            data,
        })
    }
}

/// A `k` frame: the server's heartbeat, optionally requesting a reply
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveFrame {
    pub wal_end: XLogRecPtr,
    pub send_time: TimestampTz,
    pub reply_requested: bool,
}

impl TryFrom<&[u8]> for KeepaliveFrame {
    type Error = MessagingError;

    fn try_from(buffer: &[u8]) -> Result<Self, Self::Error> {
        if buffer.len() < 18 {
            return Err(MessagingError::decode("Keepalive frame too short"));
        }
        let mut reader = BufferReader::new(buffer);
        let tag = reader.read_u8()?;
        if tag != KEEPALIVE_TAG {
            return Err(MessagingError::decode(format!(
                "Expected keepalive frame, got tag {}",
                tag as char
            )));
        }
        let wal_end = reader.read_u64()?;
        let send_time = reader.read_i64()?;
        let reply_requested = reader.read_u8()? != 0;
        Ok(Self {
            wal_end,
            send_time,
            reply_requested,
        })
    }
}

/// One copy-data frame of the replication stream
#[derive(Debug, Clone)]
pub enum ReplicationFrame {
    XLogData(XLogDataFrame),
    Keepalive(KeepaliveFrame),
}

impl ReplicationFrame {
    /// Classify and parse a copy-data payload
    pub fn parse(buffer: &[u8]) -> MessagingResult<Self> {
        match buffer.first() {
            Some(&XLOG_DATA_TAG) => Ok(Self::XLogData(XLogDataFrame::try_from(buffer)?)),
            Some(&KEEPALIVE_TAG) => Ok(Self::Keepalive(KeepaliveFrame::try_from(buffer)?)),
            Some(&tag) => Err(MessagingError::decode(format!(
                "Unknown replication frame tag: {}",
                tag as char
            ))),
            None => Err(MessagingError::decode("Empty replication frame")),
        }
    }
}

/// The `r` status update written back to the server
///
/// Carries the position up to which the client has received, flushed and
/// applied WAL. The listener always reports the same value for all three:
/// the LSN right after the last fully finalized message.
#[derive(Debug, Clone, Copy)]
pub struct StandbyStatusUpdate {
    pub write_lsn: XLogRecPtr,
    pub flush_lsn: XLogRecPtr,
    pub apply_lsn: XLogRecPtr,
    pub client_time: TimestampTz,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// A status update acknowledging everything up to and including `lsn`
    pub fn acknowledging(lsn: XLogRecPtr, client_time: TimestampTz) -> Self {
        // The server expects the position of the first unacknowledged byte,
        // so the acknowledged LSN is reported plus one. u64 arithmetic takes
        // care of the carry from the low to the high 32-bit word.
        let next = lsn.saturating_add(1);
        Self {
            write_lsn: next,
            flush_lsn: next,
            apply_lsn: next,
            client_time,
            reply_requested: false,
        }
    }

    /// A status update repeating the server's own position from a keepalive
    pub fn standing_by(server_lsn: XLogRecPtr, client_time: TimestampTz) -> Self {
        Self {
            write_lsn: server_lsn,
            flush_lsn: server_lsn,
            apply_lsn: server_lsn,
            client_time,
            reply_requested: false,
        }
    }

    /// Encode into the 34-byte wire representation
    pub fn encode(&self) -> MessagingResult<[u8; 34]> {
        let mut buf = [0u8; 34];
        let mut writer = BufferWriter::new(&mut buf);
        writer.write_u8(STATUS_UPDATE_TAG)?;
        writer.write_u64(self.write_lsn)?;
        writer.write_u64(self.flush_lsn)?;
        writer.write_u64(self.apply_lsn)?;
        writer.write_i64(self.client_time)?;
        writer.write_u8(self.reply_requested as u8)?;
        debug_assert_eq!(writer.bytes_written(), 34);
        Ok(buf)
    }
}

/// Information about a table column from a Relation message
#[derive(Debug, Clone)]
pub struct RelationColumn {
    pub key_flag: i8,
    pub name: String,
    pub type_oid: Oid,
    pub type_modifier: i32,
}

/// Information about a relation (table) from a Relation message
///
/// Sent once per table when first referenced in a replication session, and
/// cached so subsequent Insert messages can be mapped back to column names.
#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub oid: Oid,
    pub namespace: String,
    pub name: String,
    pub replica_identity: char,
    pub columns: Vec<RelationColumn>,
}

/// A single column value of a replicated tuple
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    /// SQL NULL
    Null,
    /// An unchanged TOAST value that was not sent
    UnchangedToast,
    /// The text representation of the value
    Text(String),
}

impl ColumnValue {
    /// The text value, treating NULL and unchanged TOAST as absent
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(text) => Some(text),
            ColumnValue::Null | ColumnValue::UnchangedToast => None,
        }
    }
}

/// Data for a complete row/tuple
#[derive(Debug, Clone)]
pub struct TupleData {
    pub columns: Vec<ColumnValue>,
}

/// The pgoutput messages the listener cares about
///
/// A typical transaction arrives as `Begin`, `Relation` (once per table per
/// session), one `Insert` per stored message, and `Commit`. Updates, deletes
/// and truncations cannot occur on a publication configured with
/// `publish = 'insert'`; they are still recognized so an unexpected one is
/// skipped deliberately rather than failing decode.
#[derive(Debug, Clone)]
pub enum PgOutputMessage {
    /// Transaction start
    Begin {
        final_lsn: XLogRecPtr,
        timestamp: TimestampTz,
        xid: Xid,
    },
    /// Transaction end; all changes of the transaction are durable
    Commit {
        flags: u8,
        commit_lsn: XLogRecPtr,
        end_lsn: XLogRecPtr,
        timestamp: TimestampTz,
    },
    /// Table schema information
    Relation(RelationInfo),
    /// A newly inserted row
    Insert {
        relation_id: Oid,
        new_tuple: TupleData,
    },
    /// A message type that carries no insert (origin, type, update, ...)
    Skipped { tag: char },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_frame_round_trip() {
        let mut raw = Vec::new();
        raw.push(KEEPALIVE_TAG);
        raw.extend_from_slice(&42u64.to_be_bytes());
        raw.extend_from_slice(&7i64.to_be_bytes());
        raw.push(1);

        let frame = KeepaliveFrame::try_from(raw.as_slice()).unwrap();
        assert_eq!(frame.wal_end, 42);
        assert_eq!(frame.send_time, 7);
        assert!(frame.reply_requested);
    }

    #[test]
    fn short_keepalive_is_rejected() {
        let raw = [KEEPALIVE_TAG, 0, 0];
        assert!(KeepaliveFrame::try_from(raw.as_slice()).is_err());
    }

    #[test]
    fn xlogdata_frame_carries_payload() {
        let mut raw = Vec::new();
        raw.push(XLOG_DATA_TAG);
        raw.extend_from_slice(&100u64.to_be_bytes());
        raw.extend_from_slice(&200u64.to_be_bytes());
        raw.extend_from_slice(&0i64.to_be_bytes());
        raw.extend_from_slice(b"B rest");

        let frame = XLogDataFrame::try_from(raw.as_slice()).unwrap();
        assert_eq!(frame.wal_start, 100);
        assert_eq!(frame.wal_end, 200);
        assert_eq!(frame.data, b"B rest");
    }

    #[test]
    fn empty_xlogdata_payload_is_rejected() {
        let mut raw = Vec::new();
        raw.push(XLOG_DATA_TAG);
        raw.extend_from_slice(&[0u8; 24]);
        assert!(XLogDataFrame::try_from(raw.as_slice()).is_err());
    }

    #[test]
    fn frame_classification_by_tag() {
        let mut keepalive = vec![KEEPALIVE_TAG];
        keepalive.extend_from_slice(&[0u8; 17]);
        assert!(matches!(
            ReplicationFrame::parse(&keepalive).unwrap(),
            ReplicationFrame::Keepalive(_)
        ));
        assert!(ReplicationFrame::parse(&[b'x', 0, 0]).is_err());
        assert!(ReplicationFrame::parse(&[]).is_err());
    }

    #[test]
    fn acknowledgement_reports_the_next_byte() {
        let update = StandbyStatusUpdate::acknowledging(0x0000_0000_FFFF_FFFF, 1);
        // The low word overflows into the high word
        assert_eq!(update.flush_lsn, 0x0000_0001_0000_0000);

        let encoded = update.encode().unwrap();
        assert_eq!(encoded[0], STATUS_UPDATE_TAG);
        assert_eq!(
            u64::from_be_bytes(encoded[1..9].try_into().unwrap()),
            0x0000_0001_0000_0000
        );
        // write, flush and apply positions match
        assert_eq!(encoded[1..9], encoded[9..17]);
        assert_eq!(encoded[1..9], encoded[17..25]);
        assert_eq!(encoded[33], 0);
    }

    #[test]
    fn standby_update_repeats_server_position() {
        let update = StandbyStatusUpdate::standing_by(500, 9);
        assert_eq!(update.write_lsn, 500);
        assert_eq!(update.apply_lsn, 500);
        let encoded = update.encode().unwrap();
        assert_eq!(
            i64::from_be_bytes(encoded[25..33].try_into().unwrap()),
            9
        );
    }

    #[test]
    fn column_value_text_access() {
        assert_eq!(ColumnValue::Text("x".into()).as_text(), Some("x"));
        assert_eq!(ColumnValue::Null.as_text(), None);
        assert_eq!(ColumnValue::UnchangedToast.as_text(), None);
    }
}
