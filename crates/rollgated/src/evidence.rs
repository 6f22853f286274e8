//! Evidence capture for non-accepted attempts, and face snapshots for
//! accepted ones.
//!
//! `capture` returns the entry at once and never blocks the session: the
//! JPEG encode and spool write happen on a single writer task, and delivery
//! to the shared store rides the same durable-queue relay as attendance.

use crate::clock::Clock;
use crate::config::{BackoffConfig, Config};
use crate::queue::{DurableQueue, QueueError};
use crate::retry::{Deliver, Delivery, RetryWorker};
use crate::store::EvidenceStore;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use rollgate_core::{DistanceMetric, Embedding, EvidenceEntry, EvidenceReason};
use rollgate_hw::Frame;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

/// Unknown faces remembered for image reuse.
const UNKNOWN_FACE_MEMORY: usize = 256;

const SNAPSHOT_PREFIX: &str = "attendance";

/// What a session hands over when it resolves without acceptance.
pub struct EvidenceCapture {
    pub reason: EvidenceReason,
    pub claimed_card_id: Option<String>,
    pub frame: Option<Frame>,
    /// Embedding of the face in `frame`, when one was found.
    pub embedding: Option<Embedding>,
}

/// Upload waiting for the shared store, with its image spooled locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingEvidence {
    Entry {
        entry: EvidenceEntry,
        spool_path: Option<PathBuf>,
    },
    /// Face image of an accepted attendance. No entry row.
    Snapshot { key: String, spool_path: PathBuf },
}

/// Image key reserved for an accepted attendance before the ledger write.
#[derive(Debug, Clone)]
pub struct SnapshotSlot {
    id: Uuid,
    pub key: String,
}

enum WriterMsg {
    Spool { entry: EvidenceEntry, frame: Frame },
    Queue(EvidenceEntry),
    Snapshot { slot: SnapshotSlot, frame: Frame },
    Flush(oneshot::Sender<()>),
}

/// Remembers recently stored strangers so a face that keeps trying gets one image.
struct UnknownFaces {
    metric: DistanceMetric,
    threshold: f32,
    seen: VecDeque<(Embedding, String)>,
}

impl UnknownFaces {
    fn find(&self, embedding: &Embedding) -> Option<&str> {
        self.seen
            .iter()
            .find(|(known, _)| self.metric.distance(known, embedding) <= self.threshold)
            .map(|(_, key)| key.as_str())
    }

    fn remember(&mut self, embedding: Embedding, key: String) {
        if self.seen.len() >= UNKNOWN_FACE_MEMORY {
            self.seen.pop_front();
        }
        self.seen.push_back((embedding, key));
    }
}

pub struct EvidenceRecorder {
    station_id: String,
    clock: Arc<dyn Clock>,
    writer: mpsc::UnboundedSender<WriterMsg>,
    queue: Arc<DurableQueue<PendingEvidence>>,
    store: Arc<dyn EvidenceStore>,
    wake: Arc<Notify>,
    store_timeout: Duration,
    unknown: Mutex<UnknownFaces>,
}

impl EvidenceRecorder {
    /// Create the recorder and start its writer task.
    pub fn spawn(
        config: &Config,
        clock: Arc<dyn Clock>,
        store: Arc<dyn EvidenceStore>,
        queue: Arc<DurableQueue<PendingEvidence>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());
        tokio::spawn(run_writer(rx, queue.clone(), config.spool_image_dir(), wake.clone()));
        Self {
            station_id: config.station_id.clone(),
            clock,
            writer: tx,
            queue,
            store,
            wake,
            store_timeout: config.store_timeout(),
            unknown: Mutex::new(UnknownFaces {
                metric: config.distance_metric,
                threshold: config.unknown_face_threshold,
                seen: VecDeque::new(),
            }),
        }
    }

    /// Record one non-accepted attempt. Returns the entry as it will be stored.
    pub fn capture(&self, capture: EvidenceCapture) -> EvidenceEntry {
        let evidence_id = Uuid::new_v4();
        let captured_at = self.clock.now();

        let mut frame = capture.frame;
        let mut image_reference = frame
            .as_ref()
            .map(|_| image_key(capture.reason.image_prefix(), captured_at, evidence_id));

        if capture.reason != EvidenceReason::Duplicate {
            if let (Some(embedding), Some(key)) = (capture.embedding, image_reference.clone()) {
                if let Ok(mut unknown) = self.unknown.lock() {
                    match unknown.find(&embedding) {
                        Some(existing) => {
                            tracing::debug!(image = existing, "reusing image of a recent stranger");
                            image_reference = Some(existing.to_string());
                            frame = None;
                        }
                        None => unknown.remember(embedding, key),
                    }
                }
            }
        }

        let entry = EvidenceEntry {
            evidence_id,
            captured_at,
            station_id: self.station_id.clone(),
            claimed_card_id: capture.claimed_card_id,
            image_reference,
            reason: capture.reason,
        };

        let msg = match frame {
            Some(frame) => WriterMsg::Spool {
                entry: entry.clone(),
                frame,
            },
            None => WriterMsg::Queue(entry.clone()),
        };
        if self.writer.send(msg).is_err() {
            tracing::error!(evidence = %evidence_id, "evidence writer stopped, entry dropped");
        }

        tracing::info!(
            evidence = %evidence_id,
            reason = entry.reason.as_str(),
            card = entry.claimed_card_id.as_deref().unwrap_or("-"),
            image = entry.image_reference.as_deref().unwrap_or("-"),
            "evidence captured"
        );
        entry
    }

    /// Reserve the image key for the face of an accepted attendance.
    pub fn reserve_snapshot(&self, at: DateTime<FixedOffset>) -> SnapshotSlot {
        let id = Uuid::new_v4();
        SnapshotSlot {
            id,
            key: image_key(SNAPSHOT_PREFIX, at, id),
        }
    }

    /// Store the matched frame under a reserved key.
    pub fn save_snapshot(&self, slot: SnapshotSlot, frame: Frame) {
        tracing::debug!(image = %slot.key, "attendance snapshot captured");
        if self.writer.send(WriterMsg::Snapshot { slot, frame }).is_err() {
            tracing::error!("evidence writer stopped, snapshot dropped");
        }
    }

    /// Wait until every capture so far is in the local queue.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.writer.send(WriterMsg::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn pending_count(&self) -> Result<usize, QueueError> {
        self.queue.len()
    }

    pub fn relay(&self, backoff: &BackoffConfig) -> RetryWorker<PendingEvidence, EvidenceRelay> {
        RetryWorker::new(
            "evidence",
            self.queue.clone(),
            EvidenceRelay {
                store: self.store.clone(),
                timeout: self.store_timeout,
            },
            backoff,
            self.wake.clone(),
        )
    }
}

/// `{prefix}/{prefix}_{YYYYmmdd_HHMMSS}_{id8}.jpg`
fn image_key(prefix: &str, at: DateTime<FixedOffset>, id: Uuid) -> String {
    let simple = id.simple().to_string();
    format!(
        "{prefix}/{prefix}_{}_{}.jpg",
        at.format("%Y%m%d_%H%M%S"),
        &simple[..8]
    )
}

async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
    queue: Arc<DurableQueue<PendingEvidence>>,
    spool_dir: PathBuf,
    wake: Arc<Notify>,
) {
    while let Some(msg) = rx.recv().await {
        let pending = match msg {
            WriterMsg::Spool { mut entry, frame } => {
                let spool_path = match spool_image(&spool_dir, entry.evidence_id, &frame).await {
                    Ok(path) => Some(path),
                    Err(e) => {
                        tracing::warn!(evidence = %entry.evidence_id, error = %e, "failed to spool evidence image");
                        entry.image_reference = None;
                        None
                    }
                };
                PendingEvidence::Entry { entry, spool_path }
            }
            WriterMsg::Queue(entry) => PendingEvidence::Entry {
                entry,
                spool_path: None,
            },
            WriterMsg::Snapshot { slot, frame } => match spool_image(&spool_dir, slot.id, &frame).await {
                Ok(spool_path) => PendingEvidence::Snapshot {
                    key: slot.key,
                    spool_path,
                },
                Err(e) => {
                    tracing::warn!(image = %slot.key, error = %e, "failed to spool attendance snapshot");
                    continue;
                }
            },
            WriterMsg::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        match queue.push(&pending) {
            Ok(_) => wake.notify_one(),
            Err(e) => tracing::error!(error = %e, "failed to queue evidence upload"),
        }
    }
}

async fn spool_image(spool_dir: &Path, id: Uuid, frame: &Frame) -> anyhow::Result<PathBuf> {
    let jpeg = frame.to_jpeg()?;
    tokio::fs::create_dir_all(spool_dir).await?;
    let path = spool_dir.join(format!("{id}.jpg"));
    tokio::fs::write(&path, jpeg).await?;
    Ok(path)
}

pub struct EvidenceRelay {
    store: Arc<dyn EvidenceStore>,
    timeout: Duration,
}

impl EvidenceRelay {
    async fn upload(&self, key: &str, path: &Path) -> Result<bool, String> {
        let jpeg = match tokio::fs::read(path).await {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!(image = key, error = %e, "spooled image missing");
                return Ok(false);
            }
        };
        match tokio::time::timeout(self.timeout, self.store.put_image(key, &jpeg)).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("image upload timed out".into()),
        }
    }

    async fn deliver_entry(&self, entry: &EvidenceEntry, spool_path: Option<&Path>) -> Delivery {
        let mut entry = entry.clone();
        if let (Some(path), Some(key)) = (spool_path, entry.image_reference.clone()) {
            match self.upload(&key, path).await {
                Ok(true) => {}
                Ok(false) => entry.image_reference = None,
                Err(reason) => return Delivery::Retry(reason),
            }
        }

        match tokio::time::timeout(self.timeout, self.store.insert_evidence(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Delivery::Retry(e.to_string()),
            Err(_) => return Delivery::Retry("evidence insert timed out".into()),
        }
        if let Some(path) = spool_path {
            remove_spooled(path).await;
        }
        Delivery::Delivered
    }
}

async fn remove_spooled(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::debug!(path = %path.display(), error = %e, "spool cleanup failed");
    }
}

#[async_trait]
impl Deliver<PendingEvidence> for EvidenceRelay {
    async fn deliver(&self, pending: &PendingEvidence) -> Delivery {
        match pending {
            PendingEvidence::Entry { entry, spool_path } => self.deliver_entry(entry, spool_path.as_deref()).await,
            PendingEvidence::Snapshot { key, spool_path } => match self.upload(key, spool_path).await {
                Ok(_) => {
                    remove_spooled(spool_path).await;
                    Delivery::Delivered
                }
                Err(reason) => Delivery::Retry(reason),
            },
        }
    }
}
