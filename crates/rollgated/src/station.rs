//! Station actor: serializes card scans into one session at a time.
//!
//! Callers talk to the actor through a cloneable [`StationHandle`]
//! (mpsc requests, oneshot replies). While a session runs, the actor keeps
//! reading its mailbox so that conflicting scans, cancellation and shutdown
//! are answered promptly.

use crate::config::ConflictPolicy;
use crate::evidence::EvidenceRecorder;
use crate::ledger::AttendanceLedger;
use crate::session::{CancelSignal, SessionController, SessionError, SessionState};
use rollgate_core::{ScanEvent, VerdictReport};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StationError {
    #[error("a verification session is already in progress")]
    SessionConflict,
    #[error("session cancelled")]
    Cancelled,
    #[error("station halted: {0}")]
    Halted(String),
    #[error("identity directory unavailable: {0}")]
    DirectoryUnavailable(String),
    #[error("station is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "health", content = "reason", rename_all = "snake_case")]
pub enum Health {
    Ready,
    /// Camera or reader failure. No new sessions until resumed.
    Faulted(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StationStatus {
    pub station_id: String,
    pub state: SessionState,
    #[serde(flatten)]
    pub health: Health,
    /// `None` when the local queue could not be read.
    pub pending_ledger: Option<usize>,
    pub pending_evidence: Option<usize>,
}

type Reply = oneshot::Sender<Result<VerdictReport, StationError>>;

enum Request {
    Scan { event: ScanEvent, reply: Reply },
    Cancel { reply: oneshot::Sender<bool> },
    Shutdown,
}

struct Shared {
    station_id: String,
    health: RwLock<Health>,
    history: Mutex<VecDeque<VerdictReport>>,
    history_len: usize,
}

impl Shared {
    fn health(&self) -> Health {
        self.health
            .read()
            .map(|h| h.clone())
            .unwrap_or_else(|_| Health::Faulted("health lock poisoned".into()))
    }

    fn fault(&self, reason: &str) {
        if let Ok(mut health) = self.health.write() {
            *health = Health::Faulted(reason.to_string());
        }
        tracing::error!(
            station = %self.station_id,
            reason,
            "station halted, operator attention required"
        );
    }

    fn record(&self, report: &VerdictReport) {
        if let Ok(mut history) = self.history.lock() {
            if history.len() >= self.history_len {
                history.pop_front();
            }
            history.push_back(report.clone());
        }
    }
}

#[derive(Clone)]
pub struct StationHandle {
    tx: mpsc::Sender<Request>,
    state: watch::Receiver<SessionState>,
    shared: Arc<Shared>,
    ledger: Arc<AttendanceLedger>,
    evidence: Arc<EvidenceRecorder>,
}

impl StationHandle {
    /// Submit a card scan and wait for its verdict.
    pub async fn scan(&self, card_id: impl Into<String>) -> Result<VerdictReport, StationError> {
        let (reply, rx) = oneshot::channel();
        let event = ScanEvent::now(card_id);
        self.tx
            .send(Request::Scan { event, reply })
            .await
            .map_err(|_| StationError::ShuttingDown)?;
        rx.await.map_err(|_| StationError::ShuttingDown)?
    }

    /// Cancel the open session. Returns false when the station was idle.
    pub async fn cancel(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Request::Cancel { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Request::Shutdown).await;
    }

    pub fn station_id(&self) -> &str {
        &self.shared.station_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn health(&self) -> Health {
        self.shared.health()
    }

    /// Halt new sessions after a hardware failure outside a session.
    pub fn fault(&self, reason: &str) {
        self.shared.fault(reason);
    }

    /// Clear a fault. Returns false when the station was not faulted.
    pub fn resume(&self) -> bool {
        let Ok(mut health) = self.shared.health.write() else {
            return false;
        };
        if let Health::Faulted(reason) = &*health {
            tracing::info!(station = %self.shared.station_id, previous = %reason, "station resumed");
            *health = Health::Ready;
            true
        } else {
            false
        }
    }

    /// Most recent verdicts, newest first.
    pub fn last_verdicts(&self, n: usize) -> Vec<VerdictReport> {
        match self.shared.history.lock() {
            Ok(history) => history.iter().rev().take(n).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn pending_ledger_count(&self) -> Option<usize> {
        self.ledger
            .pending_count()
            .map_err(|e| tracing::warn!(error = %e, "ledger queue unreadable"))
            .ok()
    }

    pub fn pending_evidence_count(&self) -> Option<usize> {
        self.evidence
            .pending_count()
            .map_err(|e| tracing::warn!(error = %e, "evidence queue unreadable"))
            .ok()
    }

    pub fn status(&self) -> StationStatus {
        StationStatus {
            station_id: self.shared.station_id.clone(),
            state: self.state(),
            health: self.health(),
            pending_ledger: self.pending_ledger_count(),
            pending_evidence: self.pending_evidence_count(),
        }
    }
}

struct Station {
    controller: SessionController,
    rx: mpsc::Receiver<Request>,
    state: watch::Sender<SessionState>,
    shared: Arc<Shared>,
    policy: ConflictPolicy,
    queue_depth: usize,
}

/// Start the station actor.
pub fn spawn(
    controller: SessionController,
    policy: ConflictPolicy,
    queue_depth: usize,
    history_len: usize,
) -> (StationHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);
    let shared = Arc::new(Shared {
        station_id: controller.settings.station_id.clone(),
        health: RwLock::new(Health::Ready),
        history: Mutex::new(VecDeque::with_capacity(history_len)),
        history_len: history_len.max(1),
    });
    let handle = StationHandle {
        tx,
        state: state_rx,
        shared: shared.clone(),
        ledger: controller.ledger.clone(),
        evidence: controller.evidence.clone(),
    };
    let station = Station {
        controller,
        rx,
        state: state_tx,
        shared,
        policy,
        queue_depth,
    };
    (handle, tokio::spawn(station.run()))
}

impl Station {
    async fn run(mut self) {
        tracing::info!(station = %self.shared.station_id, policy = ?self.policy, "station ready");
        let mut backlog: VecDeque<(ScanEvent, Reply)> = VecDeque::new();

        loop {
            let (event, reply) = match backlog.pop_front() {
                Some(next) => next,
                None => match self.rx.recv().await {
                    Some(Request::Scan { event, reply }) => (event, reply),
                    Some(Request::Cancel { reply }) => {
                        let _ = reply.send(false);
                        continue;
                    }
                    Some(Request::Shutdown) | None => break,
                },
            };

            if let Health::Faulted(reason) = self.shared.health() {
                tracing::warn!(station = %self.shared.station_id, card = %event.card_id, "scan refused, station halted");
                let _ = reply.send(Err(StationError::Halted(reason)));
                continue;
            }

            let cancel = CancelSignal::new();
            let mut stopping = false;
            let result = {
                let session = self.controller.run(event, &cancel, &self.state);
                tokio::pin!(session);
                loop {
                    tokio::select! {
                        result = &mut session => break result,
                        request = self.rx.recv(), if !stopping => match request {
                            Some(Request::Scan { event, reply }) => {
                                admit(self.policy, self.queue_depth, &mut backlog, event, reply);
                            }
                            Some(Request::Cancel { reply }) => {
                                tracing::info!(station = %self.shared.station_id, "session cancel requested");
                                cancel.cancel();
                                let _ = reply.send(true);
                            }
                            Some(Request::Shutdown) | None => {
                                cancel.cancel();
                                stopping = true;
                            }
                        },
                    }
                }
            };

            let result = match result {
                Ok(report) => {
                    self.shared.record(&report);
                    Ok(report)
                }
                Err(SessionError::Cancelled) => {
                    tracing::info!(station = %self.shared.station_id, "session cancelled");
                    Err(StationError::Cancelled)
                }
                Err(SessionError::Camera(e)) => {
                    let reason = format!("camera: {e}");
                    self.shared.fault(&reason);
                    Err(StationError::Halted(reason))
                }
                Err(SessionError::Directory(e)) => {
                    tracing::warn!(station = %self.shared.station_id, error = %e, "identity lookup failed");
                    Err(StationError::DirectoryUnavailable(e.to_string()))
                }
            };
            let _ = reply.send(result);

            if stopping {
                break;
            }
        }

        for (_, reply) in backlog.drain(..) {
            let _ = reply.send(Err(StationError::ShuttingDown));
        }
        tracing::info!(station = %self.shared.station_id, "station stopped");
    }
}

/// Apply the conflict policy to a scan that arrived mid-session.
fn admit(
    policy: ConflictPolicy,
    queue_depth: usize,
    backlog: &mut VecDeque<(ScanEvent, Reply)>,
    event: ScanEvent,
    reply: Reply,
) {
    match policy {
        ConflictPolicy::Queue if backlog.len() < queue_depth => {
            tracing::info!(card = %event.card_id, queued = backlog.len() + 1, "scan queued behind open session");
            backlog.push_back((event, reply));
        }
        _ => {
            tracing::info!(card = %event.card_id, "scan refused, session in progress");
            let _ = reply.send(Err(StationError::SessionConflict));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        dark_frame, empty_frame, matching_frame, stranger_frame, test_config, FlakyEmbedder,
        MemoryStore, Rig, ScriptedSource,
    };
    use rollgate_core::{Durability, EvidenceReason, Verdict};
    use rollgate_hw::CameraError;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn enrolled_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.enroll("A1", "S1", vec![vec![1.0, 0.0]]);
        store
    }

    /// Nothing until capture `at`, a matching face from then on.
    fn match_from(at: usize) -> ScriptedSource {
        ScriptedSource::new(move |i| Ok(if i >= at { matching_frame() } else { empty_frame() }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_at_two_seconds_is_accepted() {
        let store = enrolled_store();
        let rig = Rig::start(test_config(), store.clone(), match_from(2)).await;
        let started = tokio::time::Instant::now();

        let report = rig.station.scan("A1").await.unwrap();

        assert_eq!(
            report.verdict,
            Verdict::Accepted {
                durability: Durability::Written
            }
        );
        assert_eq!(report.student_id.as_deref(), Some("S1"));
        assert_eq!(report.frames_examined, 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
        let records = store.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].student_id, "S1");
        assert_eq!(records[0].station_id, "gate-a");

        rig.settle().await;
        assert!(store.evidence().is_empty());
        let snapshot = records[0].snapshot_reference.clone().unwrap();
        assert!(snapshot.starts_with("attendance/attendance_"));
        assert_eq!(store.image_keys(), vec![snapshot]);
        assert_eq!(rig.station.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_lookup_does_not_eat_the_face_window() {
        let store = enrolled_store();
        store.set_read_delay(Duration::from_secs(4));
        let config = crate::config::Config {
            store_timeout_ms: 4_500,
            ..test_config()
        };
        let rig = Rig::start(config, store.clone(), match_from(1)).await;
        let started = tokio::time::Instant::now();

        // 4 s for the fetch and 4 s for the duplicate check, then a full window.
        let report = rig.station.scan("A1").await.unwrap();

        assert!(report.verdict.is_accepted());
        assert_eq!(report.frames_examined, 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(9) && elapsed < Duration::from_secs(10));
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedder_errors_skip_frames() {
        let store = enrolled_store();
        let rig = Rig::start_with(
            test_config(),
            store.clone(),
            ScriptedSource::constant(matching_frame()),
            Arc::new(FlakyEmbedder::failing(2)),
        )
        .await;
        let started = tokio::time::Instant::now();

        let report = rig.station.scan("A1").await.unwrap();

        assert!(report.verdict.is_accepted());
        assert_eq!(report.frames_examined, 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
        assert_eq!(rig.station.health(), Health::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedder_that_never_recovers_times_out() {
        let store = enrolled_store();
        let rig = Rig::start_with(
            test_config(),
            store.clone(),
            ScriptedSource::constant(matching_frame()),
            Arc::new(FlakyEmbedder::failing(usize::MAX)),
        )
        .await;
        let started = tokio::time::Instant::now();

        let report = rig.station.scan("A1").await.unwrap();

        assert_eq!(report.verdict, Verdict::TimedOut);
        assert!(report.best_distance.is_none());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
        assert!(store.records().is_empty());
        assert_eq!(rig.station.health(), Health::Ready);

        rig.settle().await;
        let evidence = store.evidence();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].reason, EvidenceReason::Timeout);
    }

    // Real time: a stalled embedder holds a blocking thread, which keeps a
    // paused clock from advancing.
    #[tokio::test]
    async fn test_stalled_embedder_is_abandoned_after_matcher_timeout() {
        let store = enrolled_store();
        let config = crate::config::Config {
            session_timeout_ms: 2_000,
            frame_interval_ms: 100,
            matcher_timeout_ms: 50,
            ..test_config()
        };
        let rig = Rig::start_with(
            config,
            store.clone(),
            ScriptedSource::constant(matching_frame()),
            Arc::new(FlakyEmbedder::stalling(1, Duration::from_millis(400))),
        )
        .await;
        let started = std::time::Instant::now();

        let report = rig.station.scan("A1").await.unwrap();

        assert!(report.verdict.is_accepted());
        assert_eq!(report.frames_examined, 2);
        assert!(started.elapsed() < Duration::from_millis(390));
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_match_in_window_times_out_once() {
        let store = enrolled_store();
        let rig = Rig::start(test_config(), store.clone(), ScriptedSource::constant(stranger_frame())).await;
        let started = tokio::time::Instant::now();

        let report = rig.station.scan("A1").await.unwrap();

        assert_eq!(report.verdict, Verdict::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
        assert!(report.best_distance.unwrap() > 0.5);
        assert!(store.records().is_empty());

        rig.settle().await;
        let evidence = store.evidence();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].reason, EvidenceReason::Timeout);
        assert_eq!(evidence[0].claimed_card_id.as_deref(), Some("A1"));
        assert!(evidence[0].image_reference.is_some());
        assert_eq!(Some(evidence[0].evidence_id), report.evidence_id);
        assert_eq!(rig.station.last_verdicts(10).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_scan_same_day_is_duplicate_without_camera() {
        let store = enrolled_store();
        let rig = Rig::start(test_config(), store.clone(), match_from(0)).await;

        let first = rig.station.scan("A1").await.unwrap();
        assert!(first.verdict.is_accepted());
        let captures = rig.captures.load(Ordering::SeqCst);

        let second = rig.station.scan("A1").await.unwrap();
        assert_eq!(second.verdict, Verdict::Duplicate);
        assert_eq!(second.frames_examined, 0);
        assert_eq!(rig.captures.load(Ordering::SeqCst), captures);
        assert_eq!(store.records().len(), 1);

        rig.settle().await;
        let evidence = store.evidence();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].reason, EvidenceReason::Duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_card_never_writes_attendance() {
        let store = enrolled_store();
        let rig = Rig::start(test_config(), store.clone(), match_from(0)).await;

        for card in ["ZZ9", "not a card!", ""] {
            let report = rig.station.scan(card).await.unwrap();
            assert_eq!(report.verdict, Verdict::UnknownCard);
            assert!(report.student_id.is_none());
        }
        assert!(store.records().is_empty());
        assert_eq!(rig.captures.load(Ordering::SeqCst), 0);

        rig.settle().await;
        let evidence = store.evidence();
        assert_eq!(evidence.len(), 3);
        assert!(evidence.iter().all(|e| e.reason == EvidenceReason::UnknownCard));
        assert!(evidence.iter().all(|e| e.image_reference.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_card_capture_keeps_a_face() {
        let store = enrolled_store();
        let config = crate::config::Config {
            unknown_card_capture_ms: 1_500,
            ..test_config()
        };
        let rig = Rig::start(config, store.clone(), ScriptedSource::constant(stranger_frame())).await;

        let report = rig.station.scan("ZZ9").await.unwrap();
        assert_eq!(report.verdict, Verdict::UnknownCard);
        assert!(report.frames_examined >= 1);

        rig.settle().await;
        let evidence = store.evidence();
        assert_eq!(evidence.len(), 1);
        let image = evidence[0].image_reference.clone().unwrap();
        assert!(image.starts_with("unknown/unknown_"));
        assert_eq!(store.image_keys(), vec![image]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_accepts_and_drains() {
        let store = enrolled_store();
        let rig = Rig::start(test_config(), store.clone(), match_from(0)).await;
        // Directory entry cached before the outage.
        rig.directory.warm().await.unwrap();
        store.set_available(false);

        let report = rig.station.scan("A1").await.unwrap();
        assert_eq!(
            report.verdict,
            Verdict::Accepted {
                durability: Durability::Queued
            }
        );
        assert_eq!(rig.station.pending_ledger_count(), Some(1));
        assert!(store.records().is_empty());

        store.set_available(true);
        rig.settle().await;
        assert_eq!(rig.station.pending_ledger_count(), Some(0));
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lookup_still_leaves_evidence() {
        let store = enrolled_store();
        let rig = Rig::start(test_config(), store.clone(), match_from(0)).await;
        store.set_available(false);

        let err = rig.station.scan("A1").await.unwrap_err();
        assert!(matches!(err, StationError::DirectoryUnavailable(_)));
        assert_eq!(rig.captures.load(Ordering::SeqCst), 0);
        assert_eq!(rig.station.state(), SessionState::Idle);

        store.set_available(true);
        rig.settle().await;
        assert!(store.records().is_empty());
        let evidence = store.evidence();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].reason, EvidenceReason::UnknownCard);
        assert_eq!(evidence[0].claimed_card_id.as_deref(), Some("A1"));
        assert!(evidence[0].image_reference.is_none());
        assert!(rig.station.last_verdicts(5).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_stations_race_one_record() {
        let store = enrolled_store();
        let a = Rig::start(test_config(), store.clone(), match_from(1)).await;
        let b = Rig::start(
            crate::config::Config {
                station_id: "gate-b".into(),
                ..test_config()
            },
            store.clone(),
            match_from(1),
        )
        .await;

        let (ra, rb) = tokio::join!(a.station.scan("A1"), b.station.scan("A1"));
        let mut verdicts = vec![ra.unwrap().verdict, rb.unwrap().verdict];
        verdicts.sort_by_key(|v| v.is_accepted());
        assert_eq!(
            verdicts,
            vec![
                Verdict::Duplicate,
                Verdict::Accepted {
                    durability: Durability::Written
                }
            ]
        );
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streak_resets_on_non_match() {
        let store = enrolled_store();
        let config = crate::config::Config {
            required_consecutive_matches: 2,
            ..test_config()
        };
        // match, miss, match, match
        let source = ScriptedSource::new(|i| {
            Ok(match i {
                0 | 2 | 3 => matching_frame(),
                _ => stranger_frame(),
            })
        });
        let rig = Rig::start(config, store.clone(), source).await;
        let started = tokio::time::Instant::now();

        let report = rig.station.scan("A1").await.unwrap();
        assert!(report.verdict.is_accepted());
        assert_eq!(report.frames_examined, 4);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dark_frames_never_match() {
        let store = enrolled_store();
        let rig = Rig::start(test_config(), store.clone(), ScriptedSource::constant(dark_frame())).await;

        let report = rig.station.scan("A1").await.unwrap();
        assert_eq!(report.verdict, Verdict::TimedOut);
        assert!(report.best_distance.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_after_mismatches() {
        let store = enrolled_store();
        let config = crate::config::Config {
            reject_after_mismatches: 2,
            ..test_config()
        };
        let rig = Rig::start(config, store.clone(), ScriptedSource::constant(stranger_frame())).await;

        let report = rig.station.scan("A1").await.unwrap();
        assert_eq!(report.verdict, Verdict::Rejected);
        assert_eq!(report.frames_examined, 2);

        rig.settle().await;
        let evidence = store.evidence();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].reason, EvidenceReason::NoMatch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_scan_is_refused() {
        let store = enrolled_store();
        store.enroll("B2", "S2", vec![vec![1.0, 0.0]]);
        let rig = Rig::start(test_config(), store.clone(), match_from(2)).await;

        let first = {
            let station = rig.station.clone();
            tokio::spawn(async move { station.scan("A1").await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(rig.station.state(), SessionState::AwaitingFace);

        assert_eq!(rig.station.scan("B2").await.unwrap_err(), StationError::SessionConflict);
        assert!(first.await.unwrap().unwrap().verdict.is_accepted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_policy_runs_scans_in_order() {
        let store = enrolled_store();
        store.enroll("B2", "S2", vec![vec![1.0, 0.0]]);
        let config = crate::config::Config {
            conflict_policy: ConflictPolicy::Queue,
            ..test_config()
        };
        let rig = Rig::start(config, store.clone(), match_from(1)).await;

        let first = {
            let station = rig.station.clone();
            tokio::spawn(async move { station.scan("A1").await })
        };
        tokio::task::yield_now().await;
        let second = rig.station.scan("B2").await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(first.student_id.as_deref(), Some("S1"));
        assert_eq!(second.student_id.as_deref(), Some("S2"));
        assert!(first.verdict.is_accepted() && second.verdict.is_accepted());
        assert_eq!(store.records().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_leaves_no_trace() {
        let store = enrolled_store();
        let rig = Rig::start(test_config(), store.clone(), ScriptedSource::constant(stranger_frame())).await;

        let pending = {
            let station = rig.station.clone();
            tokio::spawn(async move { station.scan("A1").await })
        };
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(rig.station.cancel().await);

        assert_eq!(pending.await.unwrap().unwrap_err(), StationError::Cancelled);
        assert!(!rig.station.cancel().await);
        rig.settle().await;
        assert!(store.records().is_empty());
        assert!(store.evidence().is_empty());
        assert!(rig.station.last_verdicts(5).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_failure_halts_station_until_resumed() {
        let store = enrolled_store();
        let source = ScriptedSource::new(|i| {
            if i == 1 {
                Err(CameraError::CaptureFailed("unplugged".into()))
            } else {
                Ok(matching_frame())
            }
        });
        let config = crate::config::Config {
            required_consecutive_matches: 3,
            ..test_config()
        };
        let rig = Rig::start(config, store.clone(), source).await;

        let err = rig.station.scan("A1").await.unwrap_err();
        assert!(matches!(err, StationError::Halted(_)));
        assert!(matches!(rig.station.health(), Health::Faulted(_)));
        assert!(matches!(rig.station.scan("A1").await, Err(StationError::Halted(_))));
        assert!(store.records().is_empty());

        assert!(rig.station.resume());
        assert!(!rig.station.resume());
        let report = rig.station.scan("A1").await.unwrap();
        assert!(report.verdict.is_accepted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_scans() {
        let store = enrolled_store();
        let mut rig = Rig::start(test_config(), store, match_from(0)).await;
        rig.station.shutdown().await;
        rig.join().await;
        assert_eq!(rig.station.scan("A1").await.unwrap_err(), StationError::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_queues_and_health() {
        let store = enrolled_store();
        let rig = Rig::start(test_config(), store, match_from(0)).await;
        let status = rig.station.status();
        assert_eq!(status.station_id, "gate-a");
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.health, Health::Ready);
        assert_eq!(status.pending_ledger, Some(0));

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["health"], "ready");
        assert_eq!(json["state"], "IDLE");
    }
}
