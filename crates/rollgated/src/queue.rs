//! Durable FIFO outbox on local SQLite.
//!
//! One queue per file, one writer per queue. Calls are short synchronous
//! statements behind a mutex; the file survives restarts, so anything
//! pushed before a crash is drained after it.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue database: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("queue payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("queue directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone)]
pub struct QueuedItem<T> {
    pub id: i64,
    pub item: T,
    pub attempts: u32,
}

pub struct DurableQueue<T> {
    conn: Mutex<Connection>,
    _item: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> DurableQueue<T> {
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, QueueError> {
        conn.busy_timeout(Duration::from_secs(1))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS outbox (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               payload TEXT NOT NULL,
               enqueued_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
               attempts INTEGER NOT NULL DEFAULT 0
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            _item: PhantomData,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn.lock().map_err(|_| QueueError::Poisoned)
    }

    /// Append to the tail. Returns the item id.
    pub fn push(&self, item: &T) -> Result<i64, QueueError> {
        let payload = serde_json::to_string(item)?;
        let conn = self.conn()?;
        conn.execute("INSERT INTO outbox (payload) VALUES (?1)", params![payload])?;
        Ok(conn.last_insert_rowid())
    }

    /// Oldest item, left in place.
    pub fn peek(&self) -> Result<Option<QueuedItem<T>>, QueueError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT id, payload, attempts FROM outbox ORDER BY id LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, payload, attempts)) => Ok(Some(QueuedItem {
                id,
                item: serde_json::from_str(&payload)?,
                attempts,
            })),
            None => Ok(None),
        }
    }

    pub fn items(&self) -> Result<Vec<QueuedItem<T>>, QueueError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, payload, attempts FROM outbox ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
            ))
        })?;
        let mut items = Vec::new();
        for row in rows {
            let (id, payload, attempts) = row?;
            items.push(QueuedItem {
                id,
                item: serde_json::from_str(&payload)?,
                attempts,
            });
        }
        Ok(items)
    }

    pub fn remove(&self, id: i64) -> Result<(), QueueError> {
        self.conn()?
            .execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Count a failed delivery attempt. Returns the new total.
    pub fn record_attempt(&self, id: i64) -> Result<u32, QueueError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE outbox SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        let attempts = conn
            .query_row("SELECT attempts FROM outbox WHERE id = ?1", params![id], |row| {
                row.get::<_, u32>(0)
            })
            .optional()?;
        Ok(attempts.unwrap_or(0))
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        let n: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        name: String,
    }

    fn job(name: &str) -> Job {
        Job { name: name.into() }
    }

    #[test]
    fn test_fifo_order() {
        let q = DurableQueue::<Job>::open_in_memory().unwrap();
        q.push(&job("a")).unwrap();
        q.push(&job("b")).unwrap();
        assert_eq!(q.len().unwrap(), 2);

        let head = q.peek().unwrap().unwrap();
        assert_eq!(head.item, job("a"));
        q.remove(head.id).unwrap();
        assert_eq!(q.peek().unwrap().unwrap().item, job("b"));
        assert_eq!(q.len().unwrap(), 1);
    }

    #[test]
    fn test_empty_queue() {
        let q = DurableQueue::<Job>::open_in_memory().unwrap();
        assert!(q.peek().unwrap().is_none());
        assert_eq!(q.len().unwrap(), 0);
        assert!(q.items().unwrap().is_empty());
    }

    #[test]
    fn test_attempts_are_counted() {
        let q = DurableQueue::<Job>::open_in_memory().unwrap();
        let id = q.push(&job("a")).unwrap();
        assert_eq!(q.record_attempt(id).unwrap(), 1);
        assert_eq!(q.record_attempt(id).unwrap(), 2);
        assert_eq!(q.peek().unwrap().unwrap().attempts, 2);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spool/ledger.db");
        {
            let q = DurableQueue::<Job>::open(&path).unwrap();
            q.push(&job("kept")).unwrap();
        }
        let q = DurableQueue::<Job>::open(&path).unwrap();
        assert_eq!(q.len().unwrap(), 1);
        assert_eq!(q.items().unwrap()[0].item, job("kept"));
    }
}
