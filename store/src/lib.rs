//! SQLite-backed key/value store for Converge.
//!
//! Flags, triggers, and dispatch bookkeeping all persist through this one
//! store. Values are JSON. Writes are buffered in memory and only reach
//! SQLite on [`Store::flush`], which commits the whole buffer in a single
//! transaction - the engine flushes before spawning an external handler so
//! the child process observes a consistent committed snapshot, and the child
//! process's own committed writes become visible to the parent on its next
//! read of an unbuffered key.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

/// Buffered key/value store over a single SQLite table.
pub struct Store {
    db: Connection,
    /// Unflushed writes; `None` marks a deletion.
    pending: BTreeMap<String, Option<Value>>,
}

impl Store {
    const SCHEMA: &'static str = "
        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
    ";

    /// Open or create the store database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store dir {}", parent.display()))?;
        }
        let db = Connection::open(path)
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        Self::initialize(db)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory store")?;
        Self::initialize(db)
    }

    fn initialize(db: Connection) -> Result<Self> {
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .context("Failed to set store pragmas")?;
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create store schema")?;
        Ok(Self {
            db,
            pending: BTreeMap::new(),
        })
    }

    /// Look up a key, consulting the write buffer before the table.
    ///
    /// Returns `None` only when the key is absent; a stored JSON `null` is
    /// `Some(Value::Null)`.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(buffered) = self.pending.get(key) {
            return Ok(buffered.clone());
        }
        let row: Option<String> = self
            .db
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("Failed to read key {key}"))?;
        row.map(|raw| {
            serde_json::from_str(&raw).with_context(|| format!("Corrupt value for key {key}"))
        })
        .transpose()
    }

    /// Buffer a write for the given key.
    pub fn set(&mut self, key: &str, value: Value) {
        self.pending.insert(key.to_string(), Some(value));
    }

    /// Buffer a deletion for the given key.
    pub fn unset(&mut self, key: &str) {
        self.pending.insert(key.to_string(), None);
    }

    /// Buffer writes for every `(suffix, value)` pair under `prefix`.
    pub fn update<I>(&mut self, mapping: I, prefix: &str)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        for (suffix, value) in mapping {
            self.set(&format!("{prefix}{suffix}"), value);
        }
    }

    /// All keys under `prefix`, merged with the write buffer. When `strip`
    /// is true the prefix is removed from the returned keys.
    pub fn getrange(&self, prefix: &str, strip: bool) -> Result<BTreeMap<String, Value>> {
        let pattern = format!("{}%", escape_like(prefix));
        let mut stmt = self
            .db
            .prepare("SELECT key, value FROM kv WHERE key LIKE ?1 ESCAPE '\\'")
            .context("Failed to prepare range query")?;
        let rows = stmt
            .query_map([&pattern], |row| {
                let key: String = row.get(0)?;
                let value: String = row.get(1)?;
                Ok((key, value))
            })
            .context("Failed to run range query")?;

        let mut out = BTreeMap::new();
        for row in rows {
            let (key, raw) = row.context("Failed to read range row")?;
            let value: Value =
                serde_json::from_str(&raw).with_context(|| format!("Corrupt value for key {key}"))?;
            out.insert(key, value);
        }
        for (key, value) in self.pending.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(v) => {
                    out.insert(key.clone(), v.clone());
                }
                None => {
                    out.remove(key);
                }
            }
        }
        if strip {
            out = out
                .into_iter()
                .map(|(key, value)| (key[prefix.len()..].to_string(), value))
                .collect();
        }
        Ok(out)
    }

    /// Commit all buffered writes in one transaction.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let tx = self
            .db
            .transaction()
            .context("Failed to start store transaction")?;
        for (key, value) in &self.pending {
            match value {
                Some(v) => {
                    let raw = serde_json::to_string(v)
                        .with_context(|| format!("Failed to encode value for key {key}"))?;
                    tx.execute(
                        "INSERT INTO kv (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = ?2",
                        params![key, raw],
                    )
                    .with_context(|| format!("Failed to write key {key}"))?;
                }
                None => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", [key])
                        .with_context(|| format!("Failed to delete key {key}"))?;
                }
            }
        }
        tx.commit().context("Failed to commit store transaction")?;
        tracing::debug!(writes = self.pending.len(), "store flushed");
        self.pending.clear();
        Ok(())
    }
}

/// Escape `%`, `_`, and the escape character itself for a LIKE pattern.
fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
