//! Configuration management for the transactional outbox and inbox listeners
//!
//! This module handles loading configuration from an environment map.
//! It provides a centralized way to manage all listener settings with
//! proper validation and default values.
//!
//! Keys are resolved with two prefixes: a message-kind specific prefix
//! (`TRX_OUTBOX_` or `TRX_INBOX_`) and the shared fallback prefix `TRX_`.
//! A specific key always overrides the general one. Unknown keys are
//! ignored; missing required keys fail initialization.

use crate::core::errors::{MessagingError, MessagingResult};
use std::collections::HashMap;
use std::time::Duration;

/// Whether a configuration applies to the outbox or the inbox side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Outbox,
    Inbox,
}

impl MessageKind {
    /// The kind-specific environment prefix
    pub fn prefix(&self) -> &'static str {
        match self {
            MessageKind::Outbox => "TRX_OUTBOX_",
            MessageKind::Inbox => "TRX_INBOX_",
        }
    }

    /// The default table name for this kind
    pub fn default_table(&self) -> &'static str {
        match self {
            MessageKind::Outbox => "outbox",
            MessageKind::Inbox => "inbox",
        }
    }

    fn default_publication(&self) -> &'static str {
        match self {
            MessageKind::Outbox => "outbox_pub",
            MessageKind::Inbox => "inbox_pub",
        }
    }

    fn default_slot(&self) -> &'static str {
        match self {
            MessageKind::Outbox => "outbox_slot",
            MessageKind::Inbox => "inbox_slot",
        }
    }

    fn default_function(&self) -> &'static str {
        match self {
            MessageKind::Outbox => "next_outbox_messages",
            MessageKind::Inbox => "next_inbox_messages",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Outbox => write!(f, "outbox"),
            MessageKind::Inbox => write!(f, "inbox"),
        }
    }
}

/// The shared fallback environment prefix
pub const FALLBACK_PREFIX: &str = "TRX_";

/// Settings shared by both listener engines
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub kind: MessageKind,
    /// Connection URL for the handler role (normal SQL on the table)
    pub handler_db_url: String,
    /// Connection URL for the listener role (replication privileges where applicable)
    pub listener_db_url: String,
    pub db_schema: String,
    pub db_table: String,
    /// Per-message processing timeout for handler invocations
    pub message_processing_timeout: Duration,
    /// Abandon a message once `finished_attempts` reaches this cap
    pub max_attempts: i16,
    /// Abandon a message once `started_attempts - finished_attempts` reaches this gap
    pub max_poisonous_attempts: i16,
    /// Upper bound of the handler connection pool
    pub max_pool_size: usize,
    /// Cleanup tick interval; `None` disables the cleanup scheduler
    pub message_cleanup_interval: Option<Duration>,
    /// Delete rows processed longer ago than this
    pub message_cleanup_processed: Option<Duration>,
    /// Delete rows abandoned longer ago than this
    pub message_cleanup_abandoned: Option<Duration>,
    /// Delete any row created longer ago than this
    pub message_cleanup_all: Option<Duration>,
}

impl ListenerSettings {
    /// Create settings with defaults for everything but the connection URLs
    pub fn new(
        kind: MessageKind,
        handler_db_url: impl Into<String>,
        listener_db_url: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            handler_db_url: handler_db_url.into(),
            listener_db_url: listener_db_url.into(),
            db_schema: "public".to_string(),
            db_table: kind.default_table().to_string(),
            message_processing_timeout: Duration::from_secs(15),
            max_attempts: 5,
            max_poisonous_attempts: 3,
            max_pool_size: 10,
            message_cleanup_interval: None,
            message_cleanup_processed: None,
            message_cleanup_abandoned: None,
            message_cleanup_all: None,
        }
    }

    /// Load shared settings from an environment map
    pub fn from_env_map(
        kind: MessageKind,
        env: &HashMap<String, String>,
    ) -> MessagingResult<Self> {
        let lookup = EnvLookup { kind, env };

        let handler_db_url = lookup.required("HANDLER_DB_URL")?;
        let listener_db_url = lookup.required("LISTENER_DB_URL")?;

        let settings = Self {
            kind,
            handler_db_url,
            listener_db_url,
            db_schema: lookup.string("DB_SCHEMA", "public"),
            db_table: lookup.string("DB_TABLE", kind.default_table()),
            message_processing_timeout: lookup
                .millis("MESSAGE_PROCESSING_TIMEOUT_MS", 15_000)?,
            max_attempts: lookup.int16("MAX_ATTEMPTS", 5)?,
            max_poisonous_attempts: lookup.int16("MAX_POISONOUS_ATTEMPTS", 3)?,
            max_pool_size: lookup.size("MAX_POOL_SIZE", 10)?,
            message_cleanup_interval: lookup.optional_millis("MESSAGE_CLEANUP_INTERVAL_MS")?,
            message_cleanup_processed: lookup.optional_secs("MESSAGE_CLEANUP_PROCESSED_IN_SEC")?,
            message_cleanup_abandoned: lookup.optional_secs("MESSAGE_CLEANUP_ABANDONED_IN_SEC")?,
            message_cleanup_all: lookup.optional_secs("MESSAGE_CLEANUP_ALL_IN_SEC")?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Load shared settings from the process environment
    pub fn from_env(kind: MessageKind) -> MessagingResult<Self> {
        Self::from_env_map(kind, &std::env::vars().collect())
    }

    /// The schema-qualified table name used in every statement
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.db_schema, self.db_table)
    }

    fn validate(&self) -> MessagingResult<()> {
        if self.handler_db_url.trim().is_empty() {
            return Err(MessagingError::config("HANDLER_DB_URL cannot be empty"));
        }
        if self.listener_db_url.trim().is_empty() {
            return Err(MessagingError::config("LISTENER_DB_URL cannot be empty"));
        }
        validate_identifier("DB_SCHEMA", &self.db_schema)?;
        validate_identifier("DB_TABLE", &self.db_table)?;
        if self.max_attempts < 1 {
            return Err(MessagingError::config("MAX_ATTEMPTS must be at least one"));
        }
        if self.max_poisonous_attempts < 1 {
            return Err(MessagingError::config(
                "MAX_POISONOUS_ATTEMPTS must be at least one",
            ));
        }
        if self.max_pool_size < 1 {
            return Err(MessagingError::config("MAX_POOL_SIZE must be at least one"));
        }
        if self.message_processing_timeout.is_zero() {
            return Err(MessagingError::config(
                "MESSAGE_PROCESSING_TIMEOUT_MS must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Settings for the logical replication listener
#[derive(Debug, Clone)]
pub struct ReplicationListenerSettings {
    pub listener: ListenerSettings,
    pub publication: String,
    pub replication_slot: String,
    /// Delay before a restart after a generic streaming error
    pub restart_delay: Duration,
    /// Delay before a restart when the slot is held by another process
    pub restart_delay_slot_in_use: Duration,
}

impl ReplicationListenerSettings {
    pub fn new(listener: ListenerSettings) -> Self {
        let kind = listener.kind;
        Self {
            listener,
            publication: kind.default_publication().to_string(),
            replication_slot: kind.default_slot().to_string(),
            restart_delay: Duration::from_millis(250),
            restart_delay_slot_in_use: Duration::from_secs(10),
        }
    }

    /// Load replication listener settings from an environment map
    pub fn from_env_map(
        kind: MessageKind,
        env: &HashMap<String, String>,
    ) -> MessagingResult<Self> {
        let listener = ListenerSettings::from_env_map(kind, env)?;
        let lookup = EnvLookup { kind, env };

        let settings = Self {
            publication: lookup.string("PUBLICATION", kind.default_publication()),
            replication_slot: lookup.string("REPLICATION_SLOT", kind.default_slot()),
            restart_delay: lookup.millis("RESTART_DELAY_MS", 250)?,
            restart_delay_slot_in_use: lookup.millis("RESTART_DELAY_SLOT_IN_USE_MS", 10_000)?,
            listener,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Load replication listener settings from the process environment
    pub fn from_env(kind: MessageKind) -> MessagingResult<Self> {
        Self::from_env_map(kind, &std::env::vars().collect())
    }

    fn validate(&self) -> MessagingResult<()> {
        validate_identifier("PUBLICATION", &self.publication)?;
        validate_identifier("REPLICATION_SLOT", &self.replication_slot)?;
        Ok(())
    }
}

/// Settings for the polling listener
#[derive(Debug, Clone)]
pub struct PollingListenerSettings {
    pub listener: ListenerSettings,
    pub next_messages_function_name: String,
    pub next_messages_function_schema: String,
    /// Upper bound of rows fetched per poll
    pub next_messages_batch_size: usize,
    /// Row lock window set by the batch function
    pub next_messages_lock: Duration,
    /// Sleep between polls once a batch comes back empty
    pub next_messages_polling_interval: Duration,
}

impl PollingListenerSettings {
    pub fn new(listener: ListenerSettings) -> Self {
        let kind = listener.kind;
        let schema = listener.db_schema.clone();
        Self {
            listener,
            next_messages_function_name: kind.default_function().to_string(),
            next_messages_function_schema: schema,
            next_messages_batch_size: 5,
            next_messages_lock: Duration::from_secs(5),
            next_messages_polling_interval: Duration::from_millis(500),
        }
    }

    /// Load polling listener settings from an environment map
    pub fn from_env_map(
        kind: MessageKind,
        env: &HashMap<String, String>,
    ) -> MessagingResult<Self> {
        let listener = ListenerSettings::from_env_map(kind, env)?;
        let lookup = EnvLookup { kind, env };

        let settings = Self {
            next_messages_function_name: lookup
                .string("NEXT_MESSAGES_FUNCTION_NAME", kind.default_function()),
            next_messages_function_schema: lookup
                .string("NEXT_MESSAGES_FUNCTION_SCHEMA", &listener.db_schema),
            next_messages_batch_size: lookup.size("NEXT_MESSAGES_BATCH_SIZE", 5)?,
            next_messages_lock: lookup.millis("NEXT_MESSAGES_LOCK_MS", 5_000)?,
            next_messages_polling_interval: lookup
                .millis("NEXT_MESSAGES_POLLING_INTERVAL_MS", 500)?,
            listener,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Load polling listener settings from the process environment
    pub fn from_env(kind: MessageKind) -> MessagingResult<Self> {
        Self::from_env_map(kind, &std::env::vars().collect())
    }

    /// The schema-qualified batch function name
    pub fn qualified_function(&self) -> String {
        format!(
            "{}.{}",
            self.next_messages_function_schema, self.next_messages_function_name
        )
    }

    fn validate(&self) -> MessagingResult<()> {
        validate_identifier("NEXT_MESSAGES_FUNCTION_NAME", &self.next_messages_function_name)?;
        validate_identifier(
            "NEXT_MESSAGES_FUNCTION_SCHEMA",
            &self.next_messages_function_schema,
        )?;
        if self.next_messages_batch_size < 1 {
            return Err(MessagingError::config(
                "NEXT_MESSAGES_BATCH_SIZE must be at least one",
            ));
        }
        if self.next_messages_lock.is_zero() {
            return Err(MessagingError::config(
                "NEXT_MESSAGES_LOCK_MS must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Every recognized configuration key with its default value
///
/// Used by the setup CLI to emit a complete `.env` template. Keys without a
/// usable default are listed with an empty value.
pub fn recognized_env_keys(kind: MessageKind) -> Vec<(String, String)> {
    let p = kind.prefix();
    let table = kind.default_table();
    vec![
        (format!("{p}HANDLER_DB_URL"), String::new()),
        (format!("{p}LISTENER_DB_URL"), String::new()),
        (format!("{p}DB_SCHEMA"), "public".to_string()),
        (format!("{p}DB_TABLE"), table.to_string()),
        (format!("{p}MESSAGE_PROCESSING_TIMEOUT_MS"), "15000".to_string()),
        (format!("{p}MAX_ATTEMPTS"), "5".to_string()),
        (format!("{p}MAX_POISONOUS_ATTEMPTS"), "3".to_string()),
        (format!("{p}MAX_POOL_SIZE"), "10".to_string()),
        (format!("{p}MESSAGE_CLEANUP_INTERVAL_MS"), String::new()),
        (format!("{p}MESSAGE_CLEANUP_PROCESSED_IN_SEC"), String::new()),
        (format!("{p}MESSAGE_CLEANUP_ABANDONED_IN_SEC"), String::new()),
        (format!("{p}MESSAGE_CLEANUP_ALL_IN_SEC"), String::new()),
        (format!("{p}PUBLICATION"), kind.default_publication().to_string()),
        (format!("{p}REPLICATION_SLOT"), kind.default_slot().to_string()),
        (format!("{p}RESTART_DELAY_MS"), "250".to_string()),
        (format!("{p}RESTART_DELAY_SLOT_IN_USE_MS"), "10000".to_string()),
        (
            format!("{p}NEXT_MESSAGES_FUNCTION_NAME"),
            kind.default_function().to_string(),
        ),
        (format!("{p}NEXT_MESSAGES_FUNCTION_SCHEMA"), "public".to_string()),
        (format!("{p}NEXT_MESSAGES_BATCH_SIZE"), "5".to_string()),
        (format!("{p}NEXT_MESSAGES_LOCK_MS"), "5000".to_string()),
        (format!("{p}NEXT_MESSAGES_POLLING_INTERVAL_MS"), "500".to_string()),
    ]
}

/// Resolver applying the specific-then-fallback prefix rule
struct EnvLookup<'a> {
    kind: MessageKind,
    env: &'a HashMap<String, String>,
}

impl EnvLookup<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.env
            .get(&format!("{}{}", self.kind.prefix(), key))
            .or_else(|| self.env.get(&format!("{FALLBACK_PREFIX}{key}")))
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> MessagingResult<String> {
        self.get(key).map(str::to_string).ok_or_else(|| {
            MessagingError::config(format!(
                "Missing required environment variable {}{} (or {}{})",
                self.kind.prefix(),
                key,
                FALLBACK_PREFIX,
                key
            ))
        })
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    fn millis(&self, key: &str, default: u64) -> MessagingResult<Duration> {
        Ok(Duration::from_millis(self.number(key, default)?))
    }

    fn optional_millis(&self, key: &str) -> MessagingResult<Option<Duration>> {
        Ok(self
            .optional_number(key)?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis))
    }

    fn optional_secs(&self, key: &str) -> MessagingResult<Option<Duration>> {
        Ok(self
            .optional_number(key)?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs))
    }

    fn int16(&self, key: &str, default: i16) -> MessagingResult<i16> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                MessagingError::config(format!("{key} must be a small positive integer: {raw}"))
            }),
        }
    }

    fn size(&self, key: &str, default: usize) -> MessagingResult<usize> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                MessagingError::config(format!("{key} must be a positive integer: {raw}"))
            }),
        }
    }

    fn number(&self, key: &str, default: u64) -> MessagingResult<u64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                MessagingError::config(format!("{key} must be a number: {raw}"))
            }),
        }
    }

    fn optional_number(&self, key: &str) -> MessagingResult<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                MessagingError::config(format!("{key} must be a number: {raw}"))
            }),
        }
    }
}

/// PostgreSQL identifier rules: alphanumeric plus underscore, 63 bytes max
fn validate_identifier(key: &str, value: &str) -> MessagingResult<()> {
    if value.trim().is_empty() {
        return Err(MessagingError::config(format!("{key} cannot be empty")));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(MessagingError::config(format!(
            "{key} can only contain alphanumeric characters and underscores: {value}"
        )));
    }
    if value.len() > 63 {
        return Err(MessagingError::config(format!(
            "{key} cannot be longer than 63 characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> HashMap<String, String> {
        HashMap::from([
            (
                "TRX_HANDLER_DB_URL".to_string(),
                "postgresql://handler@localhost/msg".to_string(),
            ),
            (
                "TRX_LISTENER_DB_URL".to_string(),
                "postgresql://listener@localhost/msg".to_string(),
            ),
        ])
    }

    #[test]
    fn missing_required_keys_fail() {
        let result = ListenerSettings::from_env_map(MessageKind::Outbox, &HashMap::new());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("HANDLER_DB_URL"));
    }

    #[test]
    fn defaults_apply_per_kind() {
        let outbox = ListenerSettings::from_env_map(MessageKind::Outbox, &base_env()).unwrap();
        assert_eq!(outbox.db_table, "outbox");
        assert_eq!(outbox.db_schema, "public");
        assert_eq!(outbox.max_attempts, 5);
        assert_eq!(outbox.max_poisonous_attempts, 3);
        assert_eq!(outbox.max_pool_size, 10);
        assert_eq!(outbox.message_processing_timeout, Duration::from_secs(15));
        assert!(outbox.message_cleanup_interval.is_none());

        let inbox = ListenerSettings::from_env_map(MessageKind::Inbox, &base_env()).unwrap();
        assert_eq!(inbox.db_table, "inbox");
    }

    #[test]
    fn specific_prefix_overrides_fallback() {
        let mut env = base_env();
        env.insert("TRX_DB_TABLE".to_string(), "shared".to_string());
        env.insert("TRX_INBOX_DB_TABLE".to_string(), "incoming".to_string());

        let inbox = ListenerSettings::from_env_map(MessageKind::Inbox, &env).unwrap();
        assert_eq!(inbox.db_table, "incoming");

        let outbox = ListenerSettings::from_env_map(MessageKind::Outbox, &env).unwrap();
        assert_eq!(outbox.db_table, "shared");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut env = base_env();
        env.insert("TRX_SOMETHING_ELSE".to_string(), "whatever".to_string());
        assert!(ListenerSettings::from_env_map(MessageKind::Outbox, &env).is_ok());
    }

    #[test]
    fn replication_defaults_and_overrides() {
        let settings =
            ReplicationListenerSettings::from_env_map(MessageKind::Outbox, &base_env()).unwrap();
        assert_eq!(settings.publication, "outbox_pub");
        assert_eq!(settings.replication_slot, "outbox_slot");
        assert_eq!(settings.restart_delay, Duration::from_millis(250));
        assert_eq!(settings.restart_delay_slot_in_use, Duration::from_secs(10));

        let mut env = base_env();
        env.insert("TRX_OUTBOX_REPLICATION_SLOT".to_string(), "my_slot".to_string());
        env.insert("TRX_RESTART_DELAY_MS".to_string(), "100".to_string());
        let settings = ReplicationListenerSettings::from_env_map(MessageKind::Outbox, &env).unwrap();
        assert_eq!(settings.replication_slot, "my_slot");
        assert_eq!(settings.restart_delay, Duration::from_millis(100));
    }

    #[test]
    fn slot_names_follow_identifier_rules() {
        let mut env = base_env();
        env.insert(
            "TRX_OUTBOX_REPLICATION_SLOT".to_string(),
            "bad-slot-name".to_string(),
        );
        let err =
            ReplicationListenerSettings::from_env_map(MessageKind::Outbox, &env).unwrap_err();
        assert!(err.to_string().contains("REPLICATION_SLOT"));
    }

    #[test]
    fn polling_defaults_track_schema() {
        let mut env = base_env();
        env.insert("TRX_DB_SCHEMA".to_string(), "messaging".to_string());
        let settings = PollingListenerSettings::from_env_map(MessageKind::Inbox, &env).unwrap();
        assert_eq!(settings.next_messages_function_name, "next_inbox_messages");
        assert_eq!(settings.next_messages_function_schema, "messaging");
        assert_eq!(settings.qualified_function(), "messaging.next_inbox_messages");
        assert_eq!(settings.next_messages_batch_size, 5);
        assert_eq!(settings.next_messages_lock, Duration::from_secs(5));
        assert_eq!(
            settings.next_messages_polling_interval,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn zero_cleanup_thresholds_disable_cleanup() {
        let mut env = base_env();
        env.insert("TRX_MESSAGE_CLEANUP_INTERVAL_MS".to_string(), "0".to_string());
        let settings = ListenerSettings::from_env_map(MessageKind::Outbox, &env).unwrap();
        assert!(settings.message_cleanup_interval.is_none());
    }

    #[test]
    fn cleanup_thresholds_parse_as_seconds() {
        let mut env = base_env();
        env.insert(
            "TRX_MESSAGE_CLEANUP_INTERVAL_MS".to_string(),
            "60000".to_string(),
        );
        env.insert(
            "TRX_MESSAGE_CLEANUP_PROCESSED_IN_SEC".to_string(),
            "3600".to_string(),
        );
        let settings = ListenerSettings::from_env_map(MessageKind::Outbox, &env).unwrap();
        assert_eq!(settings.message_cleanup_interval, Some(Duration::from_secs(60)));
        assert_eq!(
            settings.message_cleanup_processed,
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn non_numeric_values_are_rejected() {
        let mut env = base_env();
        env.insert("TRX_MAX_ATTEMPTS".to_string(), "several".to_string());
        let err = ListenerSettings::from_env_map(MessageKind::Outbox, &env).unwrap_err();
        assert!(err.to_string().contains("MAX_ATTEMPTS"));
    }

    #[test]
    fn recognized_keys_cover_both_engines() {
        let keys = recognized_env_keys(MessageKind::Outbox);
        let names: Vec<&str> = keys.iter().map(|(k, _)| k.as_str()).collect();
        assert!(names.contains(&"TRX_OUTBOX_HANDLER_DB_URL"));
        assert!(names.contains(&"TRX_OUTBOX_REPLICATION_SLOT"));
        assert!(names.contains(&"TRX_OUTBOX_NEXT_MESSAGES_BATCH_SIZE"));
    }
}
