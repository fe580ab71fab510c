use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

use crate::host::{KeyValueStore, SecretStore};

const STATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS secrets (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS preferences (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS page_revisions (
    site TEXT NOT NULL,
    page TEXT NOT NULL,
    revision INTEGER,
    content_hash TEXT NOT NULL,
    synced_at_unix INTEGER NOT NULL,
    PRIMARY KEY (site, page)
);
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub site: String,
    pub page: String,
    pub revision: Option<u64>,
    pub content_hash: String,
    pub synced_at_unix: i64,
}

/// Local SQLite state: secrets, preferences and the page-revision ledger.
pub struct StateStore {
    connection: Connection,
}

impl StateStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let parent = db_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create database parent directory {}", parent.display())
        })?;
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        Self::with_connection(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Self::with_connection(connection)
    }

    fn with_connection(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(STATE_SCHEMA_SQL)
            .context("failed to initialize state schema")?;
        Ok(Self { connection })
    }

    fn get(&self, table: &str, key: &str) -> Result<Option<String>> {
        self.connection
            .query_row(
                &format!("SELECT value FROM {table} WHERE key = ?1 LIMIT 1"),
                [key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {table} key {key}"))
    }

    fn set(&self, table: &str, key: &str, value: Option<&str>) -> Result<()> {
        let written = match value {
            Some(value) => self.connection.execute(
                &format!(
                    "INSERT INTO {table} (key, value) VALUES (?1, ?2)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value"
                ),
                params![key, value],
            ),
            None => self
                .connection
                .execute(&format!("DELETE FROM {table} WHERE key = ?1"), [key]),
        };
        written.with_context(|| format!("failed to write {table} key {key}"))?;
        Ok(())
    }

    /// Record a successful sync. The stored revision never decreases.
    pub fn record_revision(
        &self,
        site: &str,
        page: &str,
        revision: Option<u64>,
        content: &str,
    ) -> Result<()> {
        let revision = revision
            .map(i64::try_from)
            .transpose()
            .context("revision does not fit into i64")?;
        self.connection
            .execute(
                "INSERT INTO page_revisions (site, page, revision, content_hash, synced_at_unix)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(site, page) DO UPDATE SET
                    revision = CASE
                        WHEN excluded.revision IS NULL THEN page_revisions.revision
                        WHEN page_revisions.revision IS NULL THEN excluded.revision
                        ELSE MAX(page_revisions.revision, excluded.revision)
                    END,
                    content_hash = excluded.content_hash,
                    synced_at_unix = excluded.synced_at_unix",
                params![
                    site,
                    page,
                    revision,
                    compute_hash(content),
                    Utc::now().timestamp()
                ],
            )
            .with_context(|| format!("failed to record revision for {site}/{page}"))?;
        Ok(())
    }

    pub fn ledger_entry(&self, site: &str, page: &str) -> Result<Option<LedgerEntry>> {
        self.connection
            .query_row(
                "SELECT site, page, revision, content_hash, synced_at_unix
                FROM page_revisions WHERE site = ?1 AND page = ?2",
                params![site, page],
                decode_ledger_row,
            )
            .optional()
            .with_context(|| format!("failed to read revision ledger for {site}/{page}"))
    }

    pub fn ledger_entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT site, page, revision, content_hash, synced_at_unix
                FROM page_revisions ORDER BY site, page",
            )
            .context("failed to prepare revision ledger query")?;
        let rows = statement
            .query_map([], decode_ledger_row)
            .context("failed to run revision ledger query")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode revision ledger row")?);
        }
        Ok(out)
    }
}

fn decode_ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let revision: Option<i64> = row.get(2)?;
    Ok(LedgerEntry {
        site: row.get(0)?,
        page: row.get(1)?,
        revision: revision.and_then(|value| u64::try_from(value).ok()),
        content_hash: row.get(3)?,
        synced_at_unix: row.get(4)?,
    })
}

pub fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

impl SecretStore for StateStore {
    fn get_secret(&self, key: &str) -> crate::Result<Option<String>> {
        Ok(self.get("secrets", key)?)
    }

    fn set_secret(&self, key: &str, value: &str) -> crate::Result<()> {
        Ok(self.set("secrets", key, Some(value))?)
    }
}

impl KeyValueStore for StateStore {
    fn get_value(&self, key: &str) -> crate::Result<Option<String>> {
        Ok(self.get("preferences", key)?)
    }

    fn set_value(&self, key: &str, value: Option<&str>) -> crate::Result<()> {
        Ok(self.set("preferences", key, value)?)
    }
}
