//! SQLite store behind the text cache. Survives restarts; no expiry.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::text::TextEntry;
use super::CacheError;
use crate::translate::normalize::Fingerprint;

pub struct SqliteTextStore {
    conn: Mutex<Connection>,
}

impl SqliteTextStore {
    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::init(&conn)?;
        info!(path = %db_path.display(), "SQLite text cache opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Volatile store, used by tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<(), CacheError> {
        // journal_mode returns a row, so it goes through query_row
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            "PRAGMA synchronous=NORMAL;
             CREATE TABLE IF NOT EXISTS translation_cache (
                cache_key BLOB PRIMARY KEY,
                translated_text TEXT NOT NULL,
                original_text TEXT NOT NULL,
                is_sensitive INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    pub fn get(&self, key: &Fingerprint) -> Result<Option<TextEntry>, CacheError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT translated_text, original_text, is_sensitive
                 FROM translation_cache WHERE cache_key = ?1",
                params![key.as_slice()],
                |row| {
                    Ok(TextEntry {
                        translated_text: row.get(0)?,
                        original_text: row.get(1)?,
                        is_sensitive: row.get::<_, i64>(2)? != 0,
                    })
                },
            )
            .optional()?;
        if entry.is_some() {
            debug!("L2 text cache hit");
        }
        Ok(entry)
    }

    /// Insert or overwrite.
    pub fn upsert(&self, key: &Fingerprint, entry: &TextEntry) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO translation_cache
             (cache_key, translated_text, original_text, is_sensitive, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.as_slice(),
                entry.translated_text,
                entry.original_text,
                entry.is_sensitive as i64,
                now_unix()
            ],
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize, CacheError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM translation_cache", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn clear(&self) -> Result<usize, CacheError> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM translation_cache", [])?)
    }

    /// Fold the WAL back into the main database file.
    pub fn checkpoint(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
