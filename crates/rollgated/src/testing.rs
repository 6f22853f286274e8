//! In-memory fakes for daemon tests.

use crate::clock::{Clock, SystemClock};
use crate::config::{BackoffConfig, Config};
use crate::directory::IdentityDirectory;
use crate::evidence::EvidenceRecorder;
use crate::ledger::AttendanceLedger;
use crate::queue::DurableQueue;
use crate::session::{SessionController, SessionSettings};
use crate::station::{self, StationHandle};
use crate::store::{AttendanceStore, EvidenceStore, IdentitySource, InsertOutcome, StoreError};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use rollgate_core::{
    AttendanceRecord, CardCredential, DistanceMatcher, EmbedError, Embedding, EvidenceEntry, FaceEmbedder,
    ReferenceEmbedding, StudentIdentity,
};
use rollgate_hw::{CameraError, Frame, FrameSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const FRAME_SIDE: u32 = 8;
const FACE_MARKER: u8 = 200;

/// A frame the `ByteEmbedder` reads as a face with embedding `[x/10, y/10]`.
pub fn face_frame(x: u8, y: u8) -> Frame {
    let mut data = vec![128u8; (FRAME_SIDE * FRAME_SIDE) as usize];
    data[0] = FACE_MARKER;
    data[1] = x;
    data[2] = y;
    Frame::new(data, FRAME_SIDE, FRAME_SIDE, 0)
}

/// Lit frame with nobody in it.
pub fn empty_frame() -> Frame {
    Frame::new(vec![128u8; (FRAME_SIDE * FRAME_SIDE) as usize], FRAME_SIDE, FRAME_SIDE, 0)
}

pub fn dark_frame() -> Frame {
    Frame::new(vec![0u8; (FRAME_SIDE * FRAME_SIDE) as usize], FRAME_SIDE, FRAME_SIDE, 0)
}

/// Matches the reference `[1.0, 0.0]` used by `MemoryStore::enroll` callers.
pub fn matching_frame() -> Frame {
    face_frame(10, 0)
}

pub fn stranger_frame() -> Frame {
    face_frame(0, 10)
}

pub struct ByteEmbedder;

impl FaceEmbedder for ByteEmbedder {
    fn embed(&self, frame: &[u8], _width: u32, _height: u32) -> Result<Option<Embedding>, EmbedError> {
        match frame {
            [FACE_MARKER, x, y, ..] => Ok(Some(Embedding::new(vec![
                *x as f32 / 10.0,
                *y as f32 / 10.0,
            ]))),
            _ => Ok(None),
        }
    }
}

/// Embedder that misbehaves on its first `n` calls, then acts like
/// `ByteEmbedder`. A failing call errors out; a stalling call blocks its
/// thread for `stall` before answering.
pub struct FlakyEmbedder {
    calls: AtomicUsize,
    bad_calls: usize,
    stall: Option<Duration>,
}

impl FlakyEmbedder {
    pub fn failing(n: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            bad_calls: n,
            stall: None,
        }
    }

    pub fn stalling(n: usize, stall: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            bad_calls: n,
            stall: Some(stall),
        }
    }
}

impl FaceEmbedder for FlakyEmbedder {
    fn embed(&self, frame: &[u8], width: u32, height: u32) -> Result<Option<Embedding>, EmbedError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.bad_calls {
            match self.stall {
                Some(stall) => std::thread::sleep(stall),
                None => return Err(EmbedError::InferenceFailed("simulated fault".into())),
            }
        }
        ByteEmbedder.embed(frame, width, height)
    }
}

type Script = Box<dyn FnMut(usize) -> Result<Frame, CameraError> + Send>;

/// Frame source driven by a closure over the capture index.
pub struct ScriptedSource {
    script: Script,
    captures: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(script: impl FnMut(usize) -> Result<Frame, CameraError> + Send + 'static) -> Self {
        Self {
            script: Box::new(script),
            captures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Same frame forever.
    pub fn constant(frame: Frame) -> Self {
        Self::new(move |_| Ok(frame.clone()))
    }

    pub fn captures(&self) -> Arc<AtomicUsize> {
        self.captures.clone()
    }
}

impl FrameSource for ScriptedSource {
    fn capture(&mut self) -> Result<Frame, CameraError> {
        let index = self.captures.fetch_add(1, Ordering::SeqCst);
        let mut frame = (self.script)(index)?;
        frame.sequence = index as u32;
        Ok(frame)
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Store double for all three collaborator traits. `set_available(false)`
/// simulates an outage: every call fails with `Unavailable`.
#[derive(Default)]
pub struct MemoryStore {
    attendance: Mutex<HashMap<(String, NaiveDate), AttendanceRecord>>,
    evidence: Mutex<HashMap<uuid::Uuid, EvidenceEntry>>,
    images: Mutex<HashMap<String, Vec<u8>>>,
    identities: Mutex<HashMap<String, StudentIdentity>>,
    unavailable: AtomicBool,
    fetches: AtomicUsize,
    read_delay: Mutex<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enroll(&self, card_id: &str, student_id: &str, embeddings: Vec<Vec<f32>>) {
        let references = embeddings
            .into_iter()
            .map(|values| ReferenceEmbedding {
                student_id: student_id.to_string(),
                embedding: Embedding::new(values),
                captured_at: Utc::now(),
            })
            .collect();
        self.identities.lock().unwrap().insert(
            card_id.to_string(),
            StudentIdentity::from_credential(
                CardCredential {
                    card_id: card_id.to_string(),
                    student_id: student_id.to_string(),
                },
                None,
                references,
            ),
        );
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Slow down identity fetches and duplicate checks.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = delay;
    }

    async fn slow_read(&self) {
        let delay = *self.read_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.attendance.lock().unwrap().values().cloned().collect()
    }

    pub fn evidence(&self) -> Vec<EvidenceEntry> {
        self.evidence.lock().unwrap().values().cloned().collect()
    }

    pub fn image_keys(&self) -> Vec<String> {
        self.images.lock().unwrap().keys().cloned().collect()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AttendanceStore for MemoryStore {
    async fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        self.check()?;
        let mut attendance = self.attendance.lock().unwrap();
        let key = (record.student_id.clone(), record.date);
        if attendance.contains_key(&key) {
            return Ok(InsertOutcome::AlreadyPresent);
        }
        attendance.insert(key, record.clone());
        Ok(InsertOutcome::Written)
    }

    async fn has_record(&self, student_id: &str, date: NaiveDate) -> Result<bool, StoreError> {
        self.slow_read().await;
        self.check()?;
        Ok(self
            .attendance
            .lock()
            .unwrap()
            .contains_key(&(student_id.to_string(), date)))
    }
}

#[async_trait]
impl EvidenceStore for MemoryStore {
    async fn put_image(&self, key: &str, jpeg: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.images.lock().unwrap().insert(key.to_string(), jpeg.to_vec());
        Ok(())
    }

    async fn insert_evidence(&self, entry: &EvidenceEntry) -> Result<(), StoreError> {
        self.check()?;
        self.evidence
            .lock()
            .unwrap()
            .entry(entry.evidence_id)
            .or_insert_with(|| entry.clone());
        Ok(())
    }
}

#[async_trait]
impl IdentitySource for MemoryStore {
    async fn fetch(&self, card_id: &str) -> Result<Option<StudentIdentity>, StoreError> {
        self.slow_read().await;
        self.check()?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.identities.lock().unwrap().get(card_id).cloned())
    }

    async fn fetch_all(&self) -> Result<Vec<StudentIdentity>, StoreError> {
        self.check()?;
        Ok(self.identities.lock().unwrap().values().cloned().collect())
    }
}

/// Config for station tests: 5 s window, one frame per second, no
/// unknown-card capture, fast retries.
pub fn test_config() -> Config {
    Config {
        station_id: "gate-a".into(),
        match_threshold: 0.5,
        session_timeout_ms: 5_000,
        frame_interval_ms: 1_000,
        matcher_timeout_ms: 500,
        store_timeout_ms: 1_000,
        unknown_card_capture_ms: 0,
        retry_backoff: BackoffConfig {
            base_ms: 100,
            max_ms: 400,
            multiplier: 2.0,
        },
        ..Config::default()
    }
}

/// A complete station over a `MemoryStore`, with both relays running.
pub struct Rig {
    pub station: StationHandle,
    pub directory: Arc<IdentityDirectory>,
    pub captures: Arc<AtomicUsize>,
    ledger: Arc<AttendanceLedger>,
    evidence: Arc<EvidenceRecorder>,
    task: Option<JoinHandle<()>>,
    stop: watch::Sender<bool>,
    _spool: TempDir,
}

impl Rig {
    pub async fn start(config: Config, store: Arc<MemoryStore>, source: ScriptedSource) -> Self {
        Self::start_with(config, store, source, Arc::new(ByteEmbedder)).await
    }

    pub async fn start_with(
        config: Config,
        store: Arc<MemoryStore>,
        source: ScriptedSource,
        embedder: Arc<dyn FaceEmbedder>,
    ) -> Self {
        let spool = TempDir::new().unwrap();
        let config = Config {
            spool_dir: spool.path().to_path_buf(),
            ..config
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let ledger = Arc::new(AttendanceLedger::new(
            store.clone(),
            Arc::new(DurableQueue::open_in_memory().unwrap()),
            config.store_timeout(),
        ));
        let evidence = Arc::new(EvidenceRecorder::spawn(
            &config,
            clock.clone(),
            store.clone(),
            Arc::new(DurableQueue::open_in_memory().unwrap()),
        ));
        let directory = Arc::new(IdentityDirectory::new(
            store.clone(),
            config.directory_ttl(),
            config.store_timeout(),
        ));

        let (stop, stop_rx) = watch::channel(false);
        ledger.relay(&config.retry_backoff).spawn(stop_rx.clone());
        evidence.relay(&config.retry_backoff).spawn(stop_rx);

        let captures = source.captures();
        let camera: Box<dyn FrameSource> = Box::new(source);
        let controller = SessionController {
            settings: SessionSettings::from(&config),
            clock,
            directory: directory.clone(),
            ledger: ledger.clone(),
            evidence: evidence.clone(),
            embedder,
            matcher: Arc::new(DistanceMatcher::new(config.distance_metric, config.match_threshold)),
            camera: Arc::new(Mutex::new(camera)),
        };
        let (station, task) = station::spawn(
            controller,
            config.conflict_policy,
            config.scan_queue_depth,
            config.verdict_history,
        );

        Self {
            station,
            directory,
            captures,
            ledger,
            evidence,
            task: Some(task),
            stop,
            _spool: spool,
        }
    }

    /// Wait until evidence is spooled and both local queues are empty.
    pub async fn settle(&self) {
        self.evidence.flush().await;
        for _ in 0..100 {
            let ledger = self.ledger.pending_count().unwrap();
            let evidence = self.evidence.pending_count().unwrap();
            if ledger == 0 && evidence == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        panic!("local queues did not drain");
    }

    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            task.await.unwrap();
        }
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}
