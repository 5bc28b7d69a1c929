//! Database setup script generation
//!
//! Emits the SQL a database administrator runs to prepare a database for the
//! outbox or inbox table: schema, table, indexes, role grants, and either
//! the publication and replication slot (replication listener) or the batch
//! function (polling listener). The setup CLI wraps this module; it can also
//! be used programmatically.

use crate::core::config::MessageKind;

/// Everything the generated scripts need to know
#[derive(Debug, Clone)]
pub struct SetupConfig {
    pub kind: MessageKind,
    pub database: String,
    pub schema: String,
    pub table: String,
    /// Role reading and finalizing messages via normal SQL
    pub handler_role: String,
    /// Role the listener connects as
    pub listener_role: String,
    /// Publication name (replication listener)
    pub publication: String,
    /// Replication slot name (replication listener)
    pub replication_slot: String,
    /// Batch function name (polling listener)
    pub function_name: String,
    /// Schema the batch function lives in (polling listener)
    pub function_schema: String,
    /// Row lock window the batch function applies, in milliseconds
    pub lock_millis: u64,
}

impl SetupConfig {
    /// Defaults for the given message kind and database
    pub fn new(kind: MessageKind, database: impl Into<String>) -> Self {
        let table = kind.default_table().to_string();
        Self {
            kind,
            database: database.into(),
            schema: "public".to_string(),
            handler_role: format!("{table}_handler"),
            listener_role: format!("{table}_listener"),
            publication: format!("{table}_pub"),
            replication_slot: format!("{table}_slot"),
            function_name: format!("next_{table}_messages"),
            function_schema: "public".to_string(),
            lock_millis: 5_000,
            table,
        }
    }

    fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    fn qualified_function(&self) -> String {
        format!("{}.{}", self.function_schema, self.function_name)
    }
}

/// Generates the setup SQL scripts
pub struct DatabaseSetupExporter;

impl DatabaseSetupExporter {
    /// The complete script for a replication-listener deployment
    pub fn create_replication_script(config: &SetupConfig) -> String {
        let mut script = String::new();
        script.push_str(&header(config, "logical replication"));
        script.push_str(&create_roles(config, true));
        script.push_str(&create_schema(config));
        script.push_str(&create_table(config));
        script.push_str(&create_indexes(config));
        script.push_str(&grants(config));
        script.push_str(&create_publication(config));
        script.push_str(&create_slot(config));
        script
    }

    /// The complete script for a polling-listener deployment
    pub fn create_polling_script(config: &SetupConfig) -> String {
        let mut script = String::new();
        script.push_str(&header(config, "polling"));
        script.push_str(&create_roles(config, false));
        script.push_str(&create_schema(config));
        script.push_str(&create_table(config));
        script.push_str(&create_indexes(config));
        script.push_str(&grants(config));
        script.push_str(&create_polling_function(config));
        script
    }
}

fn header(config: &SetupConfig, listener_kind: &str) -> String {
    format!(
        "-- Setup for the transactional {} table {} in database {}\n\
         -- Listener engine: {}\n\n",
        config.kind,
        config.qualified_table(),
        config.database,
        listener_kind
    )
}

fn create_roles(config: &SetupConfig, replication: bool) -> String {
    let listener_attributes = if replication {
        " WITH REPLICATION"
    } else {
        ""
    };
    format!(
        "-- Roles (change the passwords!)\n\
         DO $$\n\
         BEGIN\n\
         \x20 IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = '{handler}') THEN\n\
         \x20   CREATE ROLE {handler} WITH LOGIN PASSWORD '{handler}';\n\
         \x20 END IF;\n\
         \x20 IF NOT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = '{listener}') THEN\n\
         \x20   CREATE ROLE {listener} WITH LOGIN PASSWORD '{listener}';\n\
         \x20 END IF;\n\
         END\n\
         $$;\n\
         ALTER ROLE {listener}{listener_attributes};\n\n",
        handler = config.handler_role,
        listener = config.listener_role,
        listener_attributes = listener_attributes,
    )
}

fn create_schema(config: &SetupConfig) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {};\n\n", config.schema)
}

fn create_table(config: &SetupConfig) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n\
         \x20 id                UUID PRIMARY KEY,\n\
         \x20 aggregate_type    TEXT NOT NULL,\n\
         \x20 aggregate_id      TEXT NOT NULL,\n\
         \x20 message_type      TEXT NOT NULL,\n\
         \x20 segment           TEXT,\n\
         \x20 concurrency       TEXT NOT NULL DEFAULT 'sequential'\n\
         \x20                   CHECK (concurrency IN ('sequential', 'parallel')),\n\
         \x20 payload           JSONB NOT NULL,\n\
         \x20 metadata          JSONB,\n\
         \x20 locked_until      TIMESTAMPTZ NOT NULL DEFAULT to_timestamp(0),\n\
         \x20 created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),\n\
         \x20 processed_at      TIMESTAMPTZ,\n\
         \x20 abandoned_at      TIMESTAMPTZ,\n\
         \x20 started_attempts  SMALLINT NOT NULL DEFAULT 0,\n\
         \x20 finished_attempts SMALLINT NOT NULL DEFAULT 0\n\
         );\n\n",
        table = config.qualified_table()
    )
}

fn create_indexes(config: &SetupConfig) -> String {
    let table = config.qualified_table();
    let name = &config.table;
    format!(
        "CREATE INDEX IF NOT EXISTS {name}_segment_idx ON {table} (segment);\n\
         CREATE INDEX IF NOT EXISTS {name}_created_at_idx ON {table} (created_at);\n\
         CREATE INDEX IF NOT EXISTS {name}_processed_at_idx ON {table} (processed_at);\n\
         CREATE INDEX IF NOT EXISTS {name}_abandoned_at_idx ON {table} (abandoned_at);\n\n"
    )
}

fn grants(config: &SetupConfig) -> String {
    let table = config.qualified_table();
    format!(
        "GRANT USAGE ON SCHEMA {schema} TO {handler};\n\
         GRANT USAGE ON SCHEMA {schema} TO {listener};\n\
         GRANT SELECT, INSERT, DELETE ON {table} TO {handler};\n\
         GRANT UPDATE (locked_until, processed_at, abandoned_at, started_attempts, finished_attempts) ON {table} TO {handler};\n\
         GRANT SELECT, INSERT, UPDATE, DELETE ON {table} TO {listener};\n\n",
        schema = config.schema,
        handler = config.handler_role,
        listener = config.listener_role,
    )
}

fn create_publication(config: &SetupConfig) -> String {
    format!(
        "DROP PUBLICATION IF EXISTS {publication};\n\
         CREATE PUBLICATION {publication} FOR TABLE {table} WITH (publish = 'insert');\n\n",
        publication = config.publication,
        table = config.qualified_table(),
    )
}

fn create_slot(config: &SetupConfig) -> String {
    format!(
        "SELECT pg_create_logical_replication_slot('{slot}', 'pgoutput')\n\
         \x20 WHERE NOT EXISTS (SELECT 1 FROM pg_replication_slots WHERE slot_name = '{slot}');\n\n",
        slot = config.replication_slot,
    )
}

/// The batch function of the polling listener
///
/// Per distinct segment only the oldest unfinished row is considered, and
/// only when no other worker holds it (`FOR NO KEY UPDATE NOWAIT` skips
/// without blocking) and its lock window has passed. Remaining batch
/// capacity is filled with the oldest parallel rows regardless of segment.
/// Every returned row is locked for the configured window and its started
/// attempts counter is incremented.
fn create_polling_function(config: &SetupConfig) -> String {
    let table = config.qualified_table();
    let function = config.qualified_function();
    let lock_millis = config.lock_millis;
    format!(
        r#"DROP FUNCTION IF EXISTS {function}(integer);
CREATE FUNCTION {function}(max_size integer)
  RETURNS SETOF {table} AS $$
DECLARE
  loop_row {table}%ROWTYPE;
  message_row {table}%ROWTYPE;
  ids uuid[] := '{{}}';
BEGIN
  IF max_size < 1 THEN
    RAISE EXCEPTION 'The max_size for the next messages batch must be at least one.' USING ERRCODE = 'MAXNR';
  END IF;

  -- get (only) the oldest message of every segment but only return it if it is not locked
  FOR loop_row IN
    SELECT * FROM {table} m WHERE m.id IN (
      SELECT DISTINCT ON (segment) id
        FROM {table}
        WHERE processed_at IS NULL AND abandoned_at IS NULL
        ORDER BY segment, created_at
    ) ORDER BY created_at
  LOOP
    BEGIN
      EXIT WHEN cardinality(ids) >= max_size;
      SELECT * INTO message_row
        FROM {table}
        WHERE id = loop_row.id
        FOR NO KEY UPDATE NOWAIT;
      IF message_row.locked_until > NOW() THEN
        CONTINUE;
      END IF;
      ids := array_append(ids, message_row.id);
    EXCEPTION WHEN lock_not_available THEN
      CONTINUE;
    END;
  END LOOP;

  -- if the batch is not full, fill it with the oldest parallelizable messages
  IF cardinality(ids) < max_size THEN
    FOR loop_row IN
      SELECT * FROM {table}
        WHERE concurrency = 'parallel'
          AND processed_at IS NULL AND abandoned_at IS NULL
          AND locked_until < NOW()
          AND id <> ALL (ids)
        ORDER BY created_at
    LOOP
      BEGIN
        EXIT WHEN cardinality(ids) >= max_size;
        SELECT * INTO message_row
          FROM {table}
          WHERE id = loop_row.id
          FOR NO KEY UPDATE NOWAIT;
        ids := array_append(ids, message_row.id);
      EXCEPTION WHEN lock_not_available THEN
        CONTINUE;
      END;
    END LOOP;
  END IF;

  -- lock the selected rows and count the started attempt
  RETURN QUERY
    UPDATE {table}
      SET locked_until = clock_timestamp() + interval '{lock_millis} milliseconds',
          started_attempts = started_attempts + 1
      WHERE id = ANY(ids)
      RETURNING *;
END;
$$ LANGUAGE plpgsql;

GRANT EXECUTE ON FUNCTION {function}(integer) TO {handler};

"#,
        handler = config.handler_role,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SetupConfig {
        SetupConfig::new(MessageKind::Outbox, "messaging_db")
    }

    #[test]
    fn defaults_derive_from_the_kind() {
        let config = config();
        assert_eq!(config.table, "outbox");
        assert_eq!(config.publication, "outbox_pub");
        assert_eq!(config.replication_slot, "outbox_slot");
        assert_eq!(config.function_name, "next_outbox_messages");

        let inbox = SetupConfig::new(MessageKind::Inbox, "messaging_db");
        assert_eq!(inbox.table, "inbox");
        assert_eq!(inbox.function_name, "next_inbox_messages");
    }

    #[test]
    fn replication_script_contains_the_full_table() {
        let script = DatabaseSetupExporter::create_replication_script(&config());
        assert!(script.contains("CREATE TABLE IF NOT EXISTS public.outbox"));
        assert!(script.contains("id                UUID PRIMARY KEY"));
        assert!(script.contains("CHECK (concurrency IN ('sequential', 'parallel'))"));
        assert!(script.contains("locked_until      TIMESTAMPTZ NOT NULL DEFAULT to_timestamp(0)"));
        assert!(script.contains("started_attempts  SMALLINT NOT NULL DEFAULT 0"));
        assert!(script.contains("outbox_segment_idx"));
        assert!(script.contains("outbox_created_at_idx"));
        assert!(script.contains("outbox_processed_at_idx"));
        assert!(script.contains("outbox_abandoned_at_idx"));
    }

    #[test]
    fn replication_script_sets_up_publication_and_slot() {
        let script = DatabaseSetupExporter::create_replication_script(&config());
        assert!(script
            .contains("CREATE PUBLICATION outbox_pub FOR TABLE public.outbox WITH (publish = 'insert')"));
        assert!(script.contains("pg_create_logical_replication_slot('outbox_slot', 'pgoutput')"));
        assert!(script.contains("ALTER ROLE outbox_listener WITH REPLICATION;"));
        assert!(!script.contains("CREATE FUNCTION"));
    }

    #[test]
    fn handler_role_update_is_restricted_to_bookkeeping_columns() {
        let script = DatabaseSetupExporter::create_replication_script(&config());
        assert!(script.contains(
            "GRANT UPDATE (locked_until, processed_at, abandoned_at, started_attempts, finished_attempts) ON public.outbox TO outbox_handler;"
        ));
        assert!(script.contains("GRANT SELECT, INSERT, DELETE ON public.outbox TO outbox_handler;"));
    }

    #[test]
    fn polling_script_contains_the_batch_function() {
        let script = DatabaseSetupExporter::create_polling_script(&config());
        assert!(script.contains("CREATE FUNCTION public.next_outbox_messages(max_size integer)"));
        assert!(script.contains("RETURNS SETOF public.outbox"));
        assert!(script.contains("USING ERRCODE = 'MAXNR'"));
        assert!(script.contains("FOR NO KEY UPDATE NOWAIT"));
        assert!(script.contains("SELECT DISTINCT ON (segment) id"));
        assert!(script.contains("concurrency = 'parallel'"));
        assert!(script.contains("interval '5000 milliseconds'"));
        assert!(script.contains("started_attempts = started_attempts + 1"));
        assert!(!script.contains("CREATE PUBLICATION"));
        assert!(!script.contains("WITH REPLICATION"));
    }

    #[test]
    fn polling_function_lock_window_follows_the_config() {
        let mut config = config();
        config.lock_millis = 12_345;
        let script = DatabaseSetupExporter::create_polling_script(&config);
        assert!(script.contains("interval '12345 milliseconds'"));
    }
}
