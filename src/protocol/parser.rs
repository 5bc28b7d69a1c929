//! pgoutput logical replication message parser
//! Handles parsing of the message types found in an insert-only stream

use crate::core::errors::{MessagingError, MessagingResult};
use crate::protocol::buffer::BufferReader;
use crate::protocol::messages::{
    ColumnValue, PgOutputMessage, RelationColumn, RelationInfo, TupleData,
};
use tracing::debug;

/// Parse pgoutput messages from an XLogData payload
pub struct MessageParser;

impl MessageParser {
    pub fn parse(buffer: &[u8]) -> MessagingResult<PgOutputMessage> {
        if buffer.is_empty() {
            return Err(MessagingError::decode("Empty pgoutput message buffer"));
        }

        let message_type = buffer[0] as char;
        debug!("Parsing pgoutput message type: {}", message_type);

        match message_type {
            'B' => Self::parse_begin(buffer),
            'C' => Self::parse_commit(buffer),
            'R' => Self::parse_relation(buffer),
            'I' => Self::parse_insert(buffer),
            // Origin, Type, logical decoding Message, and the mutation kinds
            // an insert-only publication never produces. They carry nothing
            // for the messages table, so they are skipped, not failed.
            'O' | 'Y' | 'M' | 'U' | 'D' | 'T' => Ok(PgOutputMessage::Skipped { tag: message_type }),
            other => Err(MessagingError::decode(format!(
                "Unknown pgoutput message type: {other}"
            ))),
        }
    }

    fn parse_begin(buffer: &[u8]) -> MessagingResult<PgOutputMessage> {
        let mut reader = BufferReader::new(buffer);
        reader.read_tag()?; // 'B'

        let final_lsn = reader.read_u64()?;
        let timestamp = reader.read_i64()?;
        let xid = reader.read_u32()?;

        Ok(PgOutputMessage::Begin {
            final_lsn,
            timestamp,
            xid,
        })
    }

    fn parse_commit(buffer: &[u8]) -> MessagingResult<PgOutputMessage> {
        let mut reader = BufferReader::new(buffer);
        reader.read_tag()?; // 'C'

        let flags = reader.read_u8()?;
        let commit_lsn = reader.read_u64()?;
        let end_lsn = reader.read_u64()?;
        let timestamp = reader.read_i64()?;

        Ok(PgOutputMessage::Commit {
            flags,
            commit_lsn,
            end_lsn,
            timestamp,
        })
    }

    fn parse_relation(buffer: &[u8]) -> MessagingResult<PgOutputMessage> {
        let mut reader = BufferReader::new(buffer);
        reader.read_tag()?; // 'R'

        let oid = reader.read_u32()?;
        let namespace = reader.read_null_terminated_string()?;
        let name = reader.read_null_terminated_string()?;
        let replica_identity = reader.read_u8()? as char;
        let column_count = reader.read_i16()?;

        let mut columns = Vec::with_capacity(column_count.max(0) as usize);
        for _ in 0..column_count {
            let key_flag = reader.read_u8()? as i8;
            let column_name = reader.read_null_terminated_string()?;
            let type_oid = reader.read_u32()?;
            let type_modifier = reader.read_i32()?;
            columns.push(RelationColumn {
                key_flag,
                name: column_name,
                type_oid,
                type_modifier,
            });
        }

        Ok(PgOutputMessage::Relation(RelationInfo {
            oid,
            namespace,
            name,
            replica_identity,
            columns,
        }))
    }

    fn parse_insert(buffer: &[u8]) -> MessagingResult<PgOutputMessage> {
        let mut reader = BufferReader::new(buffer);
        reader.read_tag()?; // 'I'

        let relation_id = reader.read_u32()?;

        let marker = reader.read_u8()?;
        if marker != b'N' {
            return Err(MessagingError::decode(format!(
                "Expected new-tuple marker in insert message, got {}",
                marker as char
            )));
        }

        let new_tuple = Self::parse_tuple_data(&mut reader)?;

        Ok(PgOutputMessage::Insert {
            relation_id,
            new_tuple,
        })
    }

    fn parse_tuple_data(reader: &mut BufferReader<'_>) -> MessagingResult<TupleData> {
        let column_count = reader.read_i16()?;

        let mut columns = Vec::with_capacity(column_count.max(0) as usize);
        for _ in 0..column_count {
            let data_type = reader.read_u8()? as char;
            let value = match data_type {
                'n' => ColumnValue::Null,
                'u' => {
                    debug!("Unchanged TOAST value encountered");
                    ColumnValue::UnchangedToast
                }
                't' => {
                    let length = reader.read_i32()?;
                    if length < 0 {
                        return Err(MessagingError::decode("Negative tuple value length"));
                    }
                    let bytes = reader.read_bytes(length as usize)?;
                    ColumnValue::Text(String::from_utf8_lossy(bytes).into_owned())
                }
                other => {
                    return Err(MessagingError::decode(format!(
                        "Unknown tuple data type: {other}"
                    )));
                }
            };
            columns.push(value);
        }

        Ok(TupleData { columns })
    }
}
