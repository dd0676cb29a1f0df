use std::path::Path;

use anyhow::{anyhow, Context, Result};
use freightlog_core::{KeyValueStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS kv_entries (
  key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// SQLite-backed key/value store for audit chains.
///
/// Values are opaque JSON documents keyed by chain key; ordering and
/// tamper-evidence live in the chain layer, not here.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Fetch the JSON value stored under `key`, if any.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_value(&self, key: &str) -> Result<Option<Value>> {
        let mut stmt =
            self.conn.prepare("SELECT value_json FROM kv_entries WHERE key = ?1")?;
        let raw = stmt.query_row(params![key], |row| row.get::<_, String>(0)).optional()?;

        match raw {
            Some(json) => {
                let value = serde_json::from_str(&json)
                    .with_context(|| format!("failed to decode stored value for key `{key}`"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn set_value(&mut self, key: &str, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value)
            .with_context(|| format!("failed to encode value for key `{key}`"))?;
        self.conn
            .execute(
                "INSERT INTO kv_entries(key, value_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value_json = ?2, updated_at = ?3",
                params![key, json, now_rfc3339()?],
            )
            .with_context(|| format!("failed to write value for key `{key}`"))?;
        Ok(())
    }

    /// List every entry whose key starts with `prefix`, sorted by key.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let pattern = format!("{}%", escape_like(prefix));
        let mut stmt = self.conn.prepare(
            "SELECT key, value_json FROM kv_entries
             WHERE key LIKE ?1 ESCAPE '\\'
             ORDER BY key ASC",
        )?;
        let rows = stmt
            .query_map(params![pattern], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, json) = row?;
            let value = serde_json::from_str(&json)
                .with_context(|| format!("failed to decode stored value for key `{key}`"))?;
            entries.push((key, value));
        }

        Ok(entries)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.get_value(key).map_err(into_store_error)
    }

    fn set(&mut self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.set_value(key, value).map_err(into_store_error)
    }

    fn query_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.entries_with_prefix(prefix).map_err(into_store_error)
    }
}

fn into_store_error(err: anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{err:#}"))
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use freightlog_core::{append_decision, fetch_chain, verify_chain, AppendRequest};
    use serde_json::json;
    use ulid::Ulid;

    fn open_migrated() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn unique_temp_db() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("freightlog-store-test-{}", Ulid::new()));
        match fs::create_dir_all(&dir) {
            Ok(()) => dir.join("audit.db"),
            Err(err) => panic!("failed to create temp dir: {err}"),
        }
    }

    #[test]
    fn schema_status_reports_pending_then_current() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;

        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.target_version, LATEST_SCHEMA_VERSION);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;

        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> Result<()> {
        let mut store = open_migrated()?;
        store.migrate()?;
        assert_eq!(store.schema_status()?.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn set_get_roundtrip_and_overwrite() -> Result<()> {
        let mut store = open_migrated()?;

        assert_eq!(store.get_value("missing")?, None);

        store.set_value("k", &json!({"a": 1}))?;
        assert_eq!(store.get_value("k")?, Some(json!({"a": 1})));

        store.set_value("k", &json!({"a": 2}))?;
        assert_eq!(store.get_value("k")?, Some(json!({"a": 2})));
        Ok(())
    }

    #[test]
    fn prefix_query_is_sorted_and_scoped() -> Result<()> {
        let mut store = open_migrated()?;
        store.set_value("subject-b-chain", &json!([2]))?;
        store.set_value("subject-a-chain", &json!([1]))?;
        store.set_value("unrelated", &json!([0]))?;

        let entries = store.entries_with_prefix("subject-")?;
        let keys: Vec<&str> = entries.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["subject-a-chain", "subject-b-chain"]);
        Ok(())
    }

    #[test]
    fn prefix_query_treats_like_metacharacters_literally() -> Result<()> {
        let mut store = open_migrated()?;
        store.set_value("subject-a%b-chain", &json!([1]))?;
        store.set_value("subject-axb-chain", &json!([2]))?;

        let entries = store.entries_with_prefix("subject-a%b")?;
        let keys: Vec<&str> = entries.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["subject-a%b-chain"]);
        Ok(())
    }

    #[test]
    fn chains_append_and_verify_through_the_trait() -> Result<()> {
        let mut store = open_migrated()?;

        for action in ["created", "compliance_check", "shipped"] {
            append_decision(
                &mut store,
                AppendRequest {
                    subject_id: "SHIP-1".to_string(),
                    action: action.to_string(),
                    actor_id: Some("ops".to_string()),
                    payload: json!({"action": action}),
                    timestamp_ms: None,
                },
            )?;
        }

        let chain = fetch_chain(&store, "SHIP-1")?;
        assert_eq!(chain.len(), 3);
        assert!(verify_chain(&chain));
        Ok(())
    }

    #[test]
    fn chains_survive_reopen() -> Result<()> {
        let db_path = unique_temp_db();

        {
            let mut store = SqliteStore::open(&db_path)?;
            store.migrate()?;
            append_decision(
                &mut store,
                AppendRequest {
                    subject_id: "SHIP-2".to_string(),
                    action: "created".to_string(),
                    actor_id: None,
                    payload: json!({"note": "first"}),
                    timestamp_ms: Some(1_700_000_000_000),
                },
            )?;
        }

        let mut store = SqliteStore::open(&db_path)?;
        store.migrate()?;
        let chain = fetch_chain(&store, "SHIP-2")?;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].actor_id, "system");
        assert!(verify_chain(&chain));
        Ok(())
    }
}
