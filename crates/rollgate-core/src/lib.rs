//! rollgate-core: attendance data model and face matching.
//!
//! Everything here is free of I/O: the station daemon owns cameras,
//! storage and timing, and calls into these types and traits.

pub mod card;
pub mod embedder;
pub mod matcher;
pub mod types;

pub use card::{normalize_card_id, CardIdError};
pub use embedder::{EmbedError, FaceEmbedder};
pub use matcher::{DistanceMatcher, DistanceMetric, FaceMatcher, MatchScore};
pub use types::{
    AttendanceRecord, CardCredential, Durability, Embedding, EvidenceEntry, EvidenceReason,
    ReferenceEmbedding, ScanEvent, StudentIdentity, Verdict, VerdictReport,
};
