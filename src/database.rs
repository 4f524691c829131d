use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::fetcher::LogObject;
use crate::record::LogRecord;

const SCHEMA: &str = include_str!("schema.sql");

/// Cache of access log records, plus the ledger of log objects already cached.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (creating if needed) the database at `db`.
    pub fn open(db: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(db)
            .with_context(|| format!("could not open DB {}", db.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("could not open in-memory DB")?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)
            .context("could not enable foreign keys")?;
        {
            let tx = conn.transaction().context("could not initialize DB")?;
            tx.execute_batch(SCHEMA)
                .context("could not initialize DB schema")?;
            tx.commit()?;
        }
        Ok(Self { conn })
    }

    /// Move an existing database file out of the way, to `<db>.bak`.
    ///
    /// Returns the backup path if there was anything to back up.
    pub fn backup(db: &Path) -> anyhow::Result<Option<PathBuf>> {
        if !db.exists() {
            return Ok(None);
        }
        let mut backup = db.as_os_str().to_owned();
        backup.push(".bak");
        let backup = PathBuf::from(backup);
        std::fs::rename(db, &backup).with_context(|| {
            format!(
                "could not back up {} to {}",
                db.display(),
                backup.display()
            )
        })?;
        Ok(Some(backup))
    }

    /// Whether the log object `key` has already been cached.
    pub fn is_processed(&self, key: &str) -> Result<bool, rusqlite::Error> {
        self.conn
            .prepare_cached("SELECT 1 FROM processed_logs WHERE key = ?")?
            .query_row([key], |_| Ok(()))
            .optional()
            .map(|found| found.is_some())
    }

    /// Store the records of `object` and mark it processed.
    ///
    /// Either all of the records and the marker are committed, or none are.
    pub fn ingest(&mut self, object: &LogObject, records: &[LogRecord]) -> Result<(), rusqlite::Error> {
        let tx = self.conn.transaction()?;
        for record in records {
            record.store(&tx, &object.key)?;
        }
        tx.prepare_cached(
            "INSERT INTO processed_logs (key, size, last_modified, record_count, processed_at) VALUES (?, ?, ?, ?, ?)",
        )?
        .execute(params![
            &object.key,
            object.size,
            object.last_modified.map(|t| t.to_rfc3339()),
            records.len(),
            Utc::now().to_rfc3339(),
        ])?;
        tx.commit()
    }

    /// Number of access log records cached.
    pub fn record_count(&self) -> Result<u64, rusqlite::Error> {
        self.conn
            .query_row("SELECT COUNT(*) FROM access_log", [], |row| row.get(0))
    }

    /// Number of log objects marked as processed.
    pub fn marker_count(&self) -> Result<u64, rusqlite::Error> {
        self.conn
            .query_row("SELECT COUNT(*) FROM processed_logs", [], |row| row.get(0))
    }

    #[cfg(test)]
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}
