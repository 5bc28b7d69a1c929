//! Canonical message model for the transactional outbox and inbox
//!
//! Contains the message shape shared by both tables, plus the decoders that
//! turn driver rows and replicated tuples back into messages. Decoding is
//! strict: a missing or mistyped column is a tagged decode error, never a
//! silent skip.

use crate::core::errors::{MessageRef, MessagingError, MessagingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a message may be interleaved with other messages of its table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Concurrency {
    /// Processed one at a time relative to the other sequential messages
    #[default]
    Sequential,
    /// May be processed alongside any other message
    Parallel,
}

impl Concurrency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Concurrency::Sequential => "sequential",
            Concurrency::Parallel => "parallel",
        }
    }
}

impl std::str::FromStr for Concurrency {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Concurrency::Sequential),
            "parallel" => Ok(Concurrency::Parallel),
            other => Err(MessagingError::decode(format!(
                "Invalid concurrency value: {other}"
            ))),
        }
    }
}

/// A message as the application hands it to the storage operation
///
/// The same shape serves the outbox (producer side) and the inbox (consumer
/// side). The `segment` groups messages that must be handled in insertion
/// order; messages without a segment only follow the rules of their
/// [`Concurrency`] value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionalMessage {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub message_type: String,
    pub segment: Option<String>,
    pub concurrency: Concurrency,
    pub payload: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl TransactionalMessage {
    /// Create a message with a fresh id, the current timestamp and defaults
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            message_type: message_type.into(),
            segment: None,
            concurrency: Concurrency::Sequential,
            payload,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    /// Assign the ordering segment
    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = Some(segment.into());
        self
    }

    /// Attach transport hints or other opaque metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Override the concurrency mode
    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// The identifiers used when this message shows up in errors and logs
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            id: self.id,
            message_type: self.message_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
        }
    }
}

/// A message as the listeners see it, including the bookkeeping columns
///
/// Only the listener mutates the bookkeeping fields, and only the cleanup
/// scheduler deletes rows.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub message_type: String,
    pub segment: Option<String>,
    pub concurrency: Concurrency,
    pub payload: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub locked_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub started_attempts: i16,
    pub finished_attempts: i16,
}

impl StoredMessage {
    /// The identifiers used when this message shows up in errors and logs
    pub fn message_ref(&self) -> MessageRef {
        MessageRef {
            id: self.id,
            message_type: self.message_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
        }
    }

    /// Decode a driver row returned by `SELECT *` on the messages table
    pub fn from_row(row: &tokio_postgres::Row) -> MessagingResult<Self> {
        fn column<'a, T: tokio_postgres::types::FromSql<'a>>(
            row: &'a tokio_postgres::Row,
            name: &str,
        ) -> MessagingResult<T> {
            row.try_get(name).map_err(|err| {
                MessagingError::decode_with_context(
                    format!("Missing or mistyped column {name}"),
                    err.to_string(),
                )
            })
        }

        let concurrency: String = column(row, "concurrency")?;
        Ok(Self {
            id: column(row, "id")?,
            aggregate_type: column(row, "aggregate_type")?,
            aggregate_id: column(row, "aggregate_id")?,
            message_type: column(row, "message_type")?,
            segment: column(row, "segment")?,
            concurrency: concurrency.parse()?,
            payload: column(row, "payload")?,
            metadata: column(row, "metadata")?,
            locked_until: column(row, "locked_until")?,
            created_at: column(row, "created_at")?,
            processed_at: column(row, "processed_at")?,
            abandoned_at: column(row, "abandoned_at")?,
            started_attempts: column(row, "started_attempts")?,
            finished_attempts: column(row, "finished_attempts")?,
        })
    }

    /// Decode a replicated tuple given as `(column name, text value)` pairs
    ///
    /// The replication stream delivers values in the text representation the
    /// server would print. `None` stands for a SQL NULL.
    pub fn from_text_columns<'a, I>(columns: I) -> MessagingResult<Self>
    where
        I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
    {
        let mut id = None;
        let mut aggregate_type = None;
        let mut aggregate_id = None;
        let mut message_type = None;
        let mut segment = None;
        let mut concurrency = None;
        let mut payload = None;
        let mut metadata = None;
        let mut locked_until = None;
        let mut created_at = None;
        let mut processed_at = None;
        let mut abandoned_at = None;
        let mut started_attempts = None;
        let mut finished_attempts = None;

        for (name, value) in columns {
            match name {
                "id" => id = Some(parse_uuid(name, required(name, value)?)?),
                "aggregate_type" => aggregate_type = Some(required(name, value)?.to_string()),
                "aggregate_id" => aggregate_id = Some(required(name, value)?.to_string()),
                "message_type" => message_type = Some(required(name, value)?.to_string()),
                "segment" => segment = value.map(str::to_string),
                "concurrency" => concurrency = Some(required(name, value)?.parse()?),
                "payload" => payload = Some(parse_json(name, required(name, value)?)?),
                "metadata" => {
                    metadata = value.map(|v| parse_json(name, v)).transpose()?;
                }
                "locked_until" => {
                    locked_until = Some(parse_timestamp(name, required(name, value)?)?)
                }
                "created_at" => created_at = Some(parse_timestamp(name, required(name, value)?)?),
                "processed_at" => {
                    processed_at = value.map(|v| parse_timestamp(name, v)).transpose()?;
                }
                "abandoned_at" => {
                    abandoned_at = value.map(|v| parse_timestamp(name, v)).transpose()?;
                }
                "started_attempts" => {
                    started_attempts = Some(parse_attempts(name, required(name, value)?)?)
                }
                "finished_attempts" => {
                    finished_attempts = Some(parse_attempts(name, required(name, value)?)?)
                }
                // Application-specific extra columns are allowed on the table
                _ => {}
            }
        }

        Ok(Self {
            id: missing(id, "id")?,
            aggregate_type: missing(aggregate_type, "aggregate_type")?,
            aggregate_id: missing(aggregate_id, "aggregate_id")?,
            message_type: missing(message_type, "message_type")?,
            segment,
            concurrency: missing(concurrency, "concurrency")?,
            payload: missing(payload, "payload")?,
            metadata,
            locked_until: missing(locked_until, "locked_until")?,
            created_at: missing(created_at, "created_at")?,
            processed_at,
            abandoned_at,
            started_attempts: missing(started_attempts, "started_attempts")?,
            finished_attempts: missing(finished_attempts, "finished_attempts")?,
        })
    }
}

fn required<'a>(name: &str, value: Option<&'a str>) -> MessagingResult<&'a str> {
    value.ok_or_else(|| MessagingError::decode(format!("Column {name} must not be null")))
}

fn missing<T>(value: Option<T>, name: &str) -> MessagingResult<T> {
    value.ok_or_else(|| MessagingError::decode(format!("Column {name} is missing from the tuple")))
}

fn parse_uuid(name: &str, value: &str) -> MessagingResult<Uuid> {
    Uuid::parse_str(value).map_err(|err| {
        MessagingError::decode_with_context(
            format!("Column {name} is not a valid UUID: {value}"),
            err.to_string(),
        )
    })
}

fn parse_json(name: &str, value: &str) -> MessagingResult<serde_json::Value> {
    serde_json::from_str(value).map_err(|err| {
        MessagingError::decode_with_context(
            format!("Column {name} is not valid JSON"),
            err.to_string(),
        )
    })
}

/// Parse the server's text representation of a `timestamptz` value
fn parse_timestamp(name: &str, value: &str) -> MessagingResult<DateTime<Utc>> {
    DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            MessagingError::decode_with_context(
                format!("Column {name} is not a valid timestamp: {value}"),
                err.to_string(),
            )
        })
}

fn parse_attempts(name: &str, value: &str) -> MessagingResult<i16> {
    value.parse().map_err(|_| {
        MessagingError::decode(format!("Column {name} is not a small integer: {value}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ErrorCode;

    fn tuple<'a>() -> Vec<(&'a str, Option<&'a str>)> {
        vec![
            ("id", Some("2f81b1d1-4a91-4c72-9aaa-1d2c19fa5a30")),
            ("aggregate_type", Some("order")),
            ("aggregate_id", Some("o-17")),
            ("message_type", Some("order_created")),
            ("segment", Some("o-17")),
            ("concurrency", Some("sequential")),
            ("payload", Some(r#"{"total": 12}"#)),
            ("metadata", None),
            ("locked_until", Some("1970-01-01 00:00:00+00")),
            ("created_at", Some("2024-05-02 09:30:01.123456+00")),
            ("processed_at", None),
            ("abandoned_at", None),
            ("started_attempts", Some("0")),
            ("finished_attempts", Some("0")),
        ]
    }

    #[test]
    fn decodes_a_complete_tuple() {
        let message = StoredMessage::from_text_columns(tuple()).unwrap();
        assert_eq!(
            message.id,
            Uuid::parse_str("2f81b1d1-4a91-4c72-9aaa-1d2c19fa5a30").unwrap()
        );
        assert_eq!(message.aggregate_type, "order");
        assert_eq!(message.segment.as_deref(), Some("o-17"));
        assert_eq!(message.concurrency, Concurrency::Sequential);
        assert_eq!(message.payload["total"], 12);
        assert!(message.metadata.is_none());
        assert!(message.processed_at.is_none());
        assert_eq!(message.started_attempts, 0);
    }

    #[test]
    fn missing_column_is_a_decode_error() {
        let columns: Vec<_> = tuple().into_iter().filter(|(n, _)| *n != "payload").collect();
        let err = StoredMessage::from_text_columns(columns).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MessageDecodeFailed);
        assert!(err.to_string().contains("payload"));
    }

    #[test]
    fn null_in_required_column_is_a_decode_error() {
        let columns: Vec<_> = tuple()
            .into_iter()
            .map(|(n, v)| if n == "id" { (n, None) } else { (n, v) })
            .collect();
        let err = StoredMessage::from_text_columns(columns).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MessageDecodeFailed);
    }

    #[test]
    fn invalid_concurrency_is_rejected() {
        let columns: Vec<_> = tuple()
            .into_iter()
            .map(|(n, v)| {
                if n == "concurrency" {
                    (n, Some("eventually"))
                } else {
                    (n, v)
                }
            })
            .collect();
        let err = StoredMessage::from_text_columns(columns).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn unknown_columns_are_tolerated() {
        let mut columns = tuple();
        columns.push(("tenant", Some("acme")));
        assert!(StoredMessage::from_text_columns(columns).is_ok());
    }

    #[test]
    fn timestamps_accept_offsets_without_minutes() {
        let message = StoredMessage::from_text_columns(tuple()).unwrap();
        assert_eq!(
            message.created_at.timestamp_micros(),
            1_714_642_201_123_456
        );
    }

    #[test]
    fn builder_sets_defaults() {
        let message = TransactionalMessage::new(
            "source_entity",
            "E1",
            "source_entity_created",
            serde_json::json!({"id": "E1"}),
        );
        assert_eq!(message.concurrency, Concurrency::Sequential);
        assert!(message.segment.is_none());
        assert!(message.metadata.is_none());

        let message = message
            .with_segment("E1")
            .with_concurrency(Concurrency::Parallel)
            .with_metadata(serde_json::json!({"routingKey": "test.route"}));
        assert_eq!(message.segment.as_deref(), Some("E1"));
        assert_eq!(message.concurrency, Concurrency::Parallel);
    }

    #[test]
    fn message_ref_carries_identifiers() {
        let message = StoredMessage::from_text_columns(tuple()).unwrap();
        let message_ref = message.message_ref();
        assert_eq!(message_ref.aggregate_id, "o-17");
        assert_eq!(message_ref.message_type, "order_created");
    }
}
