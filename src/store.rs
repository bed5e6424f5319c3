//! Per-thread transcript persistence.
//!
//! Callers must run at most one turn per thread at a time: `load` then `replace` is a
//! read-modify-write and the store does not order concurrent turns on the same thread.

use crate::message::Message;
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;

pub const DEFAULT_STORE_TTL: Duration = Duration::from_secs(604_800);

pub trait TranscriptStore: Send + Sync {
    /// Stored transcript for a thread; empty when the thread is unknown or expired.
    fn load(&self, thread_id: &str) -> Result<Vec<Message>>;

    /// Replaces the whole stored transcript of a thread.
    fn replace(&self, thread_id: &str, messages: &[Message]) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    threads: Mutex<HashMap<String, Vec<Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TranscriptStore for MemoryStore {
    fn load(&self, thread_id: &str) -> Result<Vec<Message>> {
        let threads = self
            .threads
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(threads.get(thread_id).cloned().unwrap_or_default())
    }

    fn replace(&self, thread_id: &str, messages: &[Message]) -> Result<()> {
        let mut threads = self
            .threads
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        threads.insert(thread_id.to_string(), messages.to_vec());
        Ok(())
    }
}

/// SQLite-backed store. Threads untouched for longer than the TTL read back empty and are
/// purged on the next write.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    ttl: Option<Duration>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P, ttl: Option<Duration>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open transcript store {}", path.display()))?;
        let store = Self {
            conn: Mutex::new(conn),
            ttl,
        };
        store.ensure_schema()?;
        store.health_check()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"CREATE TABLE IF NOT EXISTS threads (
                thread_id TEXT PRIMARY KEY,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                thread_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (thread_id, seq)
            );"#,
        )
        .context("failed to create transcript schema")?;
        Ok(())
    }

    /// Round-trips a trivial query so a broken database fails at startup, not mid-turn.
    fn health_check(&self) -> Result<()> {
        let conn = self.lock()?;
        let one: i64 = conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .context("transcript store health check failed")?;
        if one != 1 {
            return Err(anyhow!("transcript store health check returned {one}"));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("transcript store lock poisoned"))
    }

    fn is_expired(&self, updated_at: i64, now: i64) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_sub(updated_at) > ttl.as_secs() as i64,
            None => false,
        }
    }

    pub(crate) fn load_at(&self, thread_id: &str, now: i64) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let updated_at: Option<i64> = conn
            .query_row(
                "SELECT updated_at FROM threads WHERE thread_id = ?1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()?;
        match updated_at {
            None => return Ok(Vec::new()),
            Some(updated_at) if self.is_expired(updated_at, now) => return Ok(Vec::new()),
            Some(_) => {}
        }

        let mut stmt =
            conn.prepare("SELECT body FROM messages WHERE thread_id = ?1 ORDER BY seq ASC")?;
        let bodies = stmt
            .query_map(params![thread_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        bodies
            .iter()
            .enumerate()
            .map(|(seq, body)| {
                serde_json::from_str(body).with_context(|| {
                    format!("corrupt message {} in thread {}", seq, thread_id)
                })
            })
            .collect()
    }

    pub(crate) fn replace_at(&self, thread_id: &str, messages: &[Message], now: i64) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM messages WHERE thread_id = ?1",
            params![thread_id],
        )?;
        {
            let mut insert =
                tx.prepare("INSERT INTO messages (thread_id, seq, body) VALUES (?1, ?2, ?3)")?;
            for (seq, message) in messages.iter().enumerate() {
                let body = serde_json::to_string(message)?;
                insert.execute(params![thread_id, seq as i64, body])?;
            }
        }
        tx.execute(
            "INSERT INTO threads (thread_id, updated_at) VALUES (?1, ?2)
             ON CONFLICT(thread_id) DO UPDATE SET updated_at = excluded.updated_at",
            params![thread_id, now],
        )?;
        if let Some(ttl) = self.ttl {
            let cutoff = now.saturating_sub(ttl.as_secs() as i64);
            tx.execute(
                "DELETE FROM messages WHERE thread_id IN
                 (SELECT thread_id FROM threads WHERE updated_at < ?1)",
                params![cutoff],
            )?;
            tx.execute("DELETE FROM threads WHERE updated_at < ?1", params![cutoff])?;
        }
        tx.commit()
            .with_context(|| format!("failed to save thread {}", thread_id))?;
        Ok(())
    }
}

impl TranscriptStore for SqliteStore {
    fn load(&self, thread_id: &str) -> Result<Vec<Message>> {
        self.load_at(thread_id, now_unix())
    }

    fn replace(&self, thread_id: &str, messages: &[Message]) -> Result<()> {
        self.replace_at(thread_id, messages, now_unix())
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Sqlite,
    Memory,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Sqlite => write!(f, "sqlite"),
            StoreKind::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// Database file; `None` selects the in-memory store.
    pub path: Option<PathBuf>,
    pub ttl: Option<Duration>,
}

pub struct OpenedStore {
    pub kind: StoreKind,
    pub store: Arc<dyn TranscriptStore>,
}

/// Opens the durable store, falling back to the in-memory store when it cannot be opened.
pub fn open_store(config: &StoreConfig) -> OpenedStore {
    let Some(path) = config.path.as_deref() else {
        return OpenedStore {
            kind: StoreKind::Memory,
            store: Arc::new(MemoryStore::new()),
        };
    };
    match SqliteStore::open(path, config.ttl) {
        Ok(store) => {
            tracing::debug!("using transcript store {}", path.display());
            OpenedStore {
                kind: StoreKind::Sqlite,
                store: Arc::new(store),
            }
        }
        Err(err) => {
            tracing::error!("failed to open transcript store: {err:#}");
            tracing::info!("falling back to in-memory transcript store");
            OpenedStore {
                kind: StoreKind::Memory,
                store: Arc::new(MemoryStore::new()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;
    use tempfile::TempDir;

    fn transcript() -> Vec<Message> {
        vec![
            Message::human("what is 6*7?"),
            Message::assistant_with_calls(
                "",
                vec![ToolCall::new("t1", "calculator", r#"{"expression":"6*7"}"#)],
            ),
            Message::tool_result("t1", "42"),
            Message::assistant("42"),
        ]
    }

    #[test]
    fn memory_store_replaces_whole_transcript() {
        let store = MemoryStore::new();
        assert!(store.load("a").unwrap().is_empty());

        store.replace("a", &transcript()).unwrap();
        assert_eq!(store.load("a").unwrap(), transcript());

        store.replace("a", &transcript()[2..]).unwrap();
        assert_eq!(store.load("a").unwrap(), transcript()[2..].to_vec());
        assert!(store.load("b").unwrap().is_empty());
    }

    #[test]
    fn sqlite_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("threads.db");

        let store = SqliteStore::open(&path, None).unwrap();
        store.replace("thread-1", &transcript()).unwrap();
        store.replace("thread-1", &transcript()[..1]).unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path, None).unwrap();
        assert_eq!(reopened.load("thread-1").unwrap(), transcript()[..1].to_vec());
        assert!(reopened.load("thread-2").unwrap().is_empty());
    }

    #[test]
    fn sqlite_store_expires_idle_threads() {
        let dir = TempDir::new().unwrap();
        let store =
            SqliteStore::open(dir.path().join("threads.db"), Some(Duration::from_secs(60))).unwrap();

        store.replace_at("old", &transcript(), 1_000).unwrap();
        assert_eq!(store.load_at("old", 1_060).unwrap(), transcript());
        assert!(store.load_at("old", 1_061).unwrap().is_empty());

        // A later write elsewhere purges the expired thread for good.
        store.replace_at("new", &transcript(), 2_000).unwrap();
        let conn = store.lock().unwrap();
        let remaining: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE thread_id = 'old'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn open_store_falls_back_to_memory() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened as a database file.
        let opened = open_store(&StoreConfig {
            path: Some(dir.path().to_path_buf()),
            ttl: None,
        });
        assert_eq!(opened.kind, StoreKind::Memory);
        opened.store.replace("t", &transcript()).unwrap();
        assert_eq!(opened.store.load("t").unwrap(), transcript());

        let opened = open_store(&StoreConfig {
            path: Some(dir.path().join("threads.db")),
            ttl: Some(DEFAULT_STORE_TTL),
        });
        assert_eq!(opened.kind, StoreKind::Sqlite);

        let opened = open_store(&StoreConfig {
            path: None,
            ttl: None,
        });
        assert_eq!(opened.kind, StoreKind::Memory);
    }
}
