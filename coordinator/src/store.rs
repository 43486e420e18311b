//! Durable key/value stores backing the task queues and the client registry
//!
//! Controllers and the client registry only need a small mapping capability:
//! membership test, get, durable put, delete, and key iteration. Two
//! implementations are provided - a directory-per-key store that keeps every
//! entry in its own flat file, and a single-file SQLite database. The backend
//! is chosen in the coordinator configuration; both satisfy the same trait,
//! and nothing above this module cares which one is in use.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The mapping capability controllers depend on. `put` must be durable by the
/// time it returns.
pub trait JobStore: Send {
    fn contains(&self, key: &str) -> Result<bool>;
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&mut self, key: &str, value: &str) -> Result<()>;
    fn delete(&mut self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;

    fn len(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }
}

/// Which concrete [`JobStore`] implementation to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// One flat file per key inside a directory.
    Dir,
    /// A single-file SQLite database.
    Sqlite,
}

impl StoreBackend {
    /// Open (creating if absent) a store rooted at `path`.
    pub fn open(&self, path: &Path) -> Result<Box<dyn JobStore>> {
        match self {
            StoreBackend::Dir => Ok(Box::new(DirStore::open(path)?)),
            StoreBackend::Sqlite => Ok(Box::new(SqliteStore::open(path)?)),
        }
    }
}

/// Directory-per-key store.
///
/// Keys may contain characters that are not filesystem safe (job params often
/// contain `/`), so each key is hex-encoded into its filename. Writes go to a
/// `.new` sibling which is fsynced and renamed over the final name, so a
/// crash mid-write never leaves a truncated value under a valid key.
pub struct DirStore {
    dir: PathBuf,
}

impl DirStore {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create store directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(encode_key(key))
    }
}

fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len() * 2);
    for byte in key.bytes() {
        encoded.push_str(&format!("{:02x}", byte));
    }
    encoded
}

fn decode_key(filename: &str) -> Option<String> {
    if filename.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(filename.len() / 2);
    for chunk in filename.as_bytes().chunks(2) {
        let hex = std::str::from_utf8(chunk).ok()?;
        bytes.push(u8::from_str_radix(hex, 16).ok()?);
    }
    String::from_utf8(bytes).ok()
}

impl JobStore for DirStore {
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.key_path(key).is_file())
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let value = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read store entry {}", path.display()))?;
        Ok(Some(value))
    }

    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key);
        let tmp = path.with_extension("new");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            use std::io::Write;
            file.write_all(value.as_bytes())?;
            file.sync_all()
                .with_context(|| format!("Failed to sync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to commit store entry {}", path.display()))?;
        debug!(key = %key, path = %path.display(), "Store entry written");
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let path = self.key_path(key);
        if path.is_file() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to delete store entry {}", path.display()))?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list store directory {}", self.dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Skip uncommitted temporaries left over from a crash
            if name.ends_with(".new") {
                continue;
            }
            if let Some(key) = decode_key(&name) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Single-file SQLite store.
///
/// `synchronous=FULL` keeps puts durable; each store owns its own database
/// file so queues never share a writer.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store parent directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create kv table")?;
        Ok(Self { conn })
    }
}

impl JobStore for SqliteStore {
    fn contains(&self, key: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM kv WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT key FROM kv")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let keys = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM kv", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
