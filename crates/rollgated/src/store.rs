//! Persistence collaborator: the shared attendance database.
//!
//! The traits are what the pipeline needs from the backing store. The
//! uniqueness of `(student_id, date)` is the store's job and must be
//! decided by one conditional write, never by a read followed by a write.
//! `SqliteStore` is the reference implementation; any deployment whose
//! stations share one database file gets the same guarantee from SQLite's
//! primary-key constraint.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rollgate_core::{
    AttendanceRecord, CardCredential, Embedding, EvidenceEntry, ReferenceEmbedding, StudentIdentity,
};
use rusqlite::{params, ErrorCode, OptionalExtension};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Network/cloud outage or lock contention. Retry later.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Written,
    AlreadyPresent,
}

#[async_trait]
pub trait AttendanceStore: Send + Sync {
    /// Insert `record` unless one already exists for its `(student_id, date)`.
    async fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError>;

    async fn has_record(&self, student_id: &str, date: NaiveDate) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Store an evidence image under `key`. Overwrites are allowed.
    async fn put_image(&self, key: &str, jpeg: &[u8]) -> Result<(), StoreError>;

    /// Insert an evidence entry. Re-inserting the same `evidence_id` is a no-op.
    async fn insert_evidence(&self, entry: &EvidenceEntry) -> Result<(), StoreError>;
}

#[async_trait]
pub trait IdentitySource: Send + Sync {
    async fn fetch(&self, card_id: &str) -> Result<Option<StudentIdentity>, StoreError>;

    async fn fetch_all(&self) -> Result<Vec<StudentIdentity>, StoreError>;
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS students (
      student_id TEXT PRIMARY KEY,
      name TEXT
    );

    CREATE TABLE IF NOT EXISTS cards (
      card_id TEXT PRIMARY KEY,
      student_id TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS reference_embeddings (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      student_id TEXT NOT NULL,
      embedding TEXT NOT NULL,
      captured_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS attendance (
      student_id TEXT NOT NULL,
      date TEXT NOT NULL,
      timestamp TEXT NOT NULL,
      station_id TEXT NOT NULL,
      snapshot_reference TEXT,
      PRIMARY KEY (student_id, date)
    );

    CREATE TABLE IF NOT EXISTS evidence (
      evidence_id TEXT PRIMARY KEY,
      captured_at TEXT NOT NULL,
      station_id TEXT NOT NULL,
      claimed_card_id TEXT,
      image_reference TEXT,
      reason TEXT NOT NULL
    );
"#;

/// SQLite-backed store. Evidence images are files under `image_dir`.
pub struct SqliteStore {
    conn: tokio_rusqlite::Connection,
    image_dir: PathBuf,
}

impl SqliteStore {
    pub async fn open(db_path: &Path, image_dir: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("{}: {e}", parent.display())))?;
        }
        let conn = tokio_rusqlite::Connection::open(db_path)
            .await
            .map_err(map_err)?;
        Self::init(conn, image_dir).await
    }

    pub async fn open_in_memory(image_dir: &Path) -> Result<Self, StoreError> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(map_err)?;
        Self::init(conn, image_dir).await
    }

    async fn init(conn: tokio_rusqlite::Connection, image_dir: &Path) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.busy_timeout(Duration::from_secs(2))?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(map_err)?;

        Ok(Self {
            conn,
            image_dir: image_dir.to_path_buf(),
        })
    }

    fn image_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::Backend(format!("invalid image key {key:?}")));
        }
        Ok(self.image_dir.join(relative))
    }
}

fn map_err(e: tokio_rusqlite::Error) -> StoreError {
    match e {
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(err, msg)) => {
            let detail = msg.unwrap_or_else(|| err.to_string());
            match err.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure => StoreError::Unavailable(detail),
                _ => StoreError::Backend(detail),
            }
        }
        tokio_rusqlite::Error::ConnectionClosed => {
            StoreError::Unavailable("connection closed".to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

fn decode_err(e: impl std::error::Error + Send + Sync + 'static) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(Box::new(e))
}

fn load_identity(
    conn: &rusqlite::Connection,
    card_id: &str,
    student_id: String,
    name: Option<String>,
) -> Result<StudentIdentity, tokio_rusqlite::Error> {
    let mut stmt = conn.prepare_cached(
        "SELECT embedding, captured_at FROM reference_embeddings
         WHERE student_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![student_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut references = Vec::new();
    for row in rows {
        let (embedding, captured_at) = row?;
        let values: Vec<f32> = serde_json::from_str(&embedding).map_err(decode_err)?;
        let captured_at = DateTime::parse_from_rfc3339(&captured_at)
            .map_err(decode_err)?
            .with_timezone(&Utc);
        references.push(ReferenceEmbedding {
            student_id: student_id.clone(),
            embedding: Embedding::new(values),
            captured_at,
        });
    }

    let credential = CardCredential {
        card_id: card_id.to_string(),
        student_id,
    };
    Ok(StudentIdentity::from_credential(credential, name, references))
}

#[async_trait]
impl AttendanceStore for SqliteStore {
    async fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        let record = record.clone();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "INSERT INTO attendance (student_id, date, timestamp, station_id, snapshot_reference)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (student_id, date) DO NOTHING",
                    params![
                        record.student_id,
                        record.date.to_string(),
                        record.timestamp.to_rfc3339(),
                        record.station_id,
                        record.snapshot_reference
                    ],
                )?;
                Ok(if changed == 1 {
                    InsertOutcome::Written
                } else {
                    InsertOutcome::AlreadyPresent
                })
            })
            .await
            .map_err(map_err)
    }

    async fn has_record(&self, student_id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        let student_id = student_id.to_string();
        self.conn
            .call(move |conn| {
                let found = conn
                    .query_row(
                        "SELECT 1 FROM attendance WHERE student_id = ?1 AND date = ?2",
                        params![student_id, date.to_string()],
                        |_| Ok(()),
                    )
                    .optional()?;
                Ok(found.is_some())
            })
            .await
            .map_err(map_err)
    }
}

#[async_trait]
impl EvidenceStore for SqliteStore {
    async fn put_image(&self, key: &str, jpeg: &[u8]) -> Result<(), StoreError> {
        let path = self.image_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, jpeg)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))
    }

    async fn insert_evidence(&self, entry: &EvidenceEntry) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO evidence
                       (evidence_id, captured_at, station_id, claimed_card_id, image_reference, reason)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT (evidence_id) DO NOTHING",
                    params![
                        entry.evidence_id.to_string(),
                        entry.captured_at.to_rfc3339(),
                        entry.station_id,
                        entry.claimed_card_id,
                        entry.image_reference,
                        entry.reason.as_str()
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }
}

#[async_trait]
impl IdentitySource for SqliteStore {
    async fn fetch(&self, card_id: &str) -> Result<Option<StudentIdentity>, StoreError> {
        let card_id = card_id.to_string();
        self.conn
            .call(move |conn| {
                let holder = conn
                    .query_row(
                        "SELECT c.student_id, s.name FROM cards c
                         LEFT JOIN students s ON s.student_id = c.student_id
                         WHERE c.card_id = ?1",
                        params![card_id],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
                    )
                    .optional()?;
                match holder {
                    Some((student_id, name)) => {
                        load_identity(conn, &card_id, student_id, name).map(Some)
                    }
                    None => Ok(None),
                }
            })
            .await
            .map_err(map_err)
    }

    async fn fetch_all(&self) -> Result<Vec<StudentIdentity>, StoreError> {
        self.conn
            .call(|conn| {
                let holders = {
                    let mut stmt = conn.prepare(
                        "SELECT c.card_id, c.student_id, s.name FROM cards c
                         LEFT JOIN students s ON s.student_id = c.student_id
                         ORDER BY c.card_id",
                    )?;
                    let rows = stmt.query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    })?;
                    rows.collect::<Result<Vec<_>, _>>()?
                };
                holders
                    .into_iter()
                    .map(|(card_id, student_id, name)| load_identity(conn, &card_id, student_id, name))
                    .collect()
            })
            .await
            .map_err(map_err)
    }
}

#[cfg(test)]
impl SqliteStore {
    /// Enrollment is out of the daemon's hands; tests seed identities directly.
    pub async fn enroll(
        &self,
        card_id: &str,
        student_id: &str,
        name: Option<&str>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<(), StoreError> {
        let (card_id, student_id) = (card_id.to_string(), student_id.to_string());
        let name = name.map(str::to_string);
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR REPLACE INTO students (student_id, name) VALUES (?1, ?2)",
                    params![student_id, name],
                )?;
                tx.execute(
                    "INSERT OR REPLACE INTO cards (card_id, student_id) VALUES (?1, ?2)",
                    params![card_id, student_id],
                )?;
                for values in embeddings {
                    let json = serde_json::to_string(&values).map_err(decode_err)?;
                    tx.execute(
                        "INSERT INTO reference_embeddings (student_id, embedding, captured_at)
                         VALUES (?1, ?2, ?3)",
                        params![student_id, json, Utc::now().to_rfc3339()],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(map_err)
    }

    pub async fn evidence_count(&self) -> Result<usize, StoreError> {
        self.conn
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM evidence", [], |row| row.get(0))?;
                Ok(n as usize)
            })
            .await
            .map_err(map_err)
    }

    pub async fn attendance_count(&self) -> Result<usize, StoreError> {
        self.conn
            .call(|conn| {
                let n: i64 =
                    conn.query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?;
                Ok(n as usize)
            })
            .await
            .map_err(map_err)
    }
}
