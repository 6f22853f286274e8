use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Face embedding vector (fixed length for a given model, e.g. 512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance `1 - similarity`, in [0, 2].
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// An enrolled RFID card bound to a student. Immutable once enrolled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardCredential {
    pub card_id: String,
    pub student_id: String,
}

/// A reference face captured at enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceEmbedding {
    pub student_id: String,
    pub embedding: Embedding,
    pub captured_at: DateTime<Utc>,
}

/// Everything the pipeline needs to know about the holder of a card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentIdentity {
    pub card_id: String,
    pub student_id: String,
    /// Display name, used only in logs and operator output.
    pub name: Option<String>,
    pub references: Vec<ReferenceEmbedding>,
}

impl StudentIdentity {
    /// Bind an enrolled card to its holder's reference faces.
    pub fn from_credential(
        credential: CardCredential,
        name: Option<String>,
        references: Vec<ReferenceEmbedding>,
    ) -> Self {
        let CardCredential { card_id, student_id } = credential;
        Self {
            card_id,
            student_id,
            name,
            references,
        }
    }

    /// Label for log lines: the name when known, the student id otherwise.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.student_id)
    }
}

/// A raw scan delivered by the reader driver. `card_id` is untrusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEvent {
    pub card_id: String,
    pub scanned_at: DateTime<Utc>,
}

impl ScanEvent {
    pub fn now(card_id: impl Into<String>) -> Self {
        Self {
            card_id: card_id.into(),
            scanned_at: Utc::now(),
        }
    }
}

/// One accepted attendance. At most one exists per `(student_id, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub student_id: String,
    /// Calendar day in the station's local timezone.
    pub date: NaiveDate,
    pub timestamp: DateTime<FixedOffset>,
    pub station_id: String,
    /// Image key of the face captured at acceptance.
    #[serde(default)]
    pub snapshot_reference: Option<String>,
}

impl AttendanceRecord {
    pub fn new(student_id: &str, station_id: &str, timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            student_id: student_id.to_string(),
            date: timestamp.date_naive(),
            timestamp,
            station_id: station_id.to_string(),
            snapshot_reference: None,
        }
    }

    pub fn with_snapshot(mut self, key: impl Into<String>) -> Self {
        self.snapshot_reference = Some(key.into());
        self
    }
}

/// Why an evidence entry was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceReason {
    NoMatch,
    UnknownCard,
    Duplicate,
    Timeout,
}

impl EvidenceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceReason::NoMatch => "NO_MATCH",
            EvidenceReason::UnknownCard => "UNKNOWN_CARD",
            EvidenceReason::Duplicate => "DUPLICATE",
            EvidenceReason::Timeout => "TIMEOUT",
        }
    }

    /// Folder/file prefix for stored evidence images.
    pub fn image_prefix(&self) -> &'static str {
        match self {
            EvidenceReason::NoMatch => "mismatch",
            EvidenceReason::UnknownCard => "unknown",
            EvidenceReason::Duplicate => "duplicate",
            EvidenceReason::Timeout => "timeout",
        }
    }
}

/// Forensic record of a non-accepted attempt. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceEntry {
    /// Idempotency key for retried inserts.
    pub evidence_id: Uuid,
    pub captured_at: DateTime<FixedOffset>,
    pub station_id: String,
    pub claimed_card_id: Option<String>,
    pub image_reference: Option<String>,
    pub reason: EvidenceReason,
}

/// How far an accepted record got towards the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Conditional insert succeeded.
    Written,
    /// Store unavailable; record sits in the local retry queue.
    Queued,
    /// Neither the store nor the local queue accepted the record.
    Unrecorded,
}

/// Terminal outcome of a verification session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accepted { durability: Durability },
    Rejected,
    Duplicate,
    TimedOut,
    UnknownCard,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted { .. } => "ACCEPTED",
            Verdict::Rejected => "REJECTED",
            Verdict::Duplicate => "DUPLICATE",
            Verdict::TimedOut => "TIMED_OUT",
            Verdict::UnknownCard => "UNKNOWN_CARD",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted { .. })
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-facing summary of one resolved session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictReport {
    pub session_id: Uuid,
    pub station_id: String,
    pub card_id: String,
    pub student_id: Option<String>,
    #[serde(flatten)]
    pub verdict: Verdict,
    pub opened_at: DateTime<FixedOffset>,
    pub resolved_at: DateTime<FixedOffset>,
    pub frames_examined: u32,
    pub best_distance: Option<f32>,
    pub evidence_id: Option<Uuid>,
}
