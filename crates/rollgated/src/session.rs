//! Verification session: one card scan, one bounded face window, one verdict.
//!
//! The controller runs a single session at a time on the station task.
//! Frame capture and embedding run on the blocking pool; the deadline timer,
//! the frame feed and cancellation meet in one `select!`, and whichever fires
//! first decides the session.

use crate::clock::Clock;
use crate::config::Config;
use crate::directory::{DirectoryError, IdentityDirectory, Lookup};
use crate::evidence::{EvidenceCapture, EvidenceRecorder};
use crate::ledger::{AppendOutcome, AttendanceLedger};
use chrono::{DateTime, FixedOffset};
use rollgate_core::{
    normalize_card_id, AttendanceRecord, Durability, Embedding, EvidenceReason, FaceEmbedder,
    FaceMatcher, MatchScore, ScanEvent, StudentIdentity, Verdict, VerdictReport,
};
use rollgate_hw::{CameraError, Frame, FrameSource};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// Card ids echoed into reports are cut to this length when malformed.
const MAX_ECHOED_CARD_LEN: usize = 64;

/// The station's camera, shared between sessions and the blocking pool.
pub type SharedCamera = Arc<Mutex<Box<dyn FrameSource>>>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session cancelled")]
    Cancelled,
    #[error("camera failure: {0}")]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    AwaitingFace,
    Resolving,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub station_id: String,
    pub session_timeout: Duration,
    pub required_consecutive_matches: u32,
    /// 0 disables early rejection.
    pub reject_after_mismatches: u32,
    pub frame_interval: Duration,
    pub matcher_timeout: Duration,
    /// 0 disables the camera on unknown cards.
    pub unknown_card_capture: Duration,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            station_id: config.station_id.clone(),
            session_timeout: config.session_timeout(),
            required_consecutive_matches: config.required_consecutive_matches.max(1),
            reject_after_mismatches: config.reject_after_mismatches,
            frame_interval: Duration::from_millis(config.frame_interval_ms),
            matcher_timeout: Duration::from_millis(config.matcher_timeout_ms),
            unknown_card_capture: Duration::from_millis(config.unknown_card_capture_ms),
        }
    }
}

/// One-shot cancellation flag that can be awaited any number of times.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<CancelInner>);

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Bookkeeping for the open session.
#[derive(Debug)]
pub struct VerificationSession {
    pub session_id: Uuid,
    pub card_id: String,
    pub student_id: Option<String>,
    pub opened_at: DateTime<FixedOffset>,
    /// End of the face window; set when the session starts awaiting a face.
    pub deadline: Instant,
    pub frames_examined: u32,
    pub best_distance: Option<f32>,
    consecutive_matches: u32,
    consecutive_mismatches: u32,
}

impl VerificationSession {
    fn open(card_id: String, opened_at: DateTime<FixedOffset>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            card_id,
            student_id: None,
            opened_at,
            deadline: Instant::now(),
            frames_examined: 0,
            best_distance: None,
            consecutive_matches: 0,
            consecutive_mismatches: 0,
        }
    }

    fn note_distance(&mut self, distance: f32) {
        if self.best_distance.map_or(true, |best| distance < best) {
            self.best_distance = Some(distance);
        }
    }

    fn into_report(
        self,
        station_id: &str,
        verdict: Verdict,
        resolved_at: DateTime<FixedOffset>,
        evidence_id: Option<Uuid>,
    ) -> VerdictReport {
        VerdictReport {
            session_id: self.session_id,
            station_id: station_id.to_string(),
            card_id: self.card_id,
            student_id: self.student_id,
            verdict,
            opened_at: self.opened_at,
            resolved_at,
            frames_examined: self.frames_examined,
            best_distance: self.best_distance,
            evidence_id,
        }
    }
}

/// A frame kept for evidence, with the face embedding found in it.
struct Sighting {
    frame: Frame,
    embedding: Option<Embedding>,
}

enum Observation {
    NoFace,
    Face {
        embedding: Embedding,
        score: Option<MatchScore>,
    },
    /// Embedder error or timeout. Skipped like NO_FACE.
    Failed(String),
}

enum FaceOutcome {
    Matched(Frame),
    Mismatched(Sighting),
    TimedOut(Option<Sighting>),
}

/// Paces captures from the shared camera into a channel.
///
/// Dropping the feed stops the producer, which releases the camera.
struct FrameFeed {
    rx: mpsc::Receiver<Result<Frame, CameraError>>,
    producer: JoinHandle<()>,
}

impl FrameFeed {
    fn start(camera: SharedCamera, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let producer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let camera = camera.clone();
                let captured = tokio::task::spawn_blocking(move || {
                    let mut source = camera
                        .lock()
                        .map_err(|_| CameraError::CaptureFailed("camera lock poisoned".into()))?;
                    source.capture()
                })
                .await
                .unwrap_or_else(|e| Err(CameraError::CaptureFailed(format!("capture task: {e}"))));

                let failed = captured.is_err();
                if tx.send(captured).await.is_err() || failed {
                    break;
                }
            }
        });
        Self { rx, producer }
    }

    async fn next(&mut self) -> Result<Frame, CameraError> {
        match self.rx.recv().await {
            Some(frame) => frame,
            None => Err(CameraError::CaptureFailed("frame producer stopped".into())),
        }
    }
}

impl Drop for FrameFeed {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

pub struct SessionController {
    pub settings: SessionSettings,
    pub clock: Arc<dyn Clock>,
    pub directory: Arc<IdentityDirectory>,
    pub ledger: Arc<AttendanceLedger>,
    pub evidence: Arc<EvidenceRecorder>,
    pub embedder: Arc<dyn FaceEmbedder>,
    pub matcher: Arc<dyn FaceMatcher>,
    pub camera: SharedCamera,
}

impl SessionController {
    /// Run one session to its verdict.
    ///
    /// `Err(Cancelled)` means no verdict and no side effect. Once the
    /// session is RESOLVING, cancellation is ignored and the ledger write
    /// completes.
    pub async fn run(
        &self,
        scan: ScanEvent,
        cancel: &CancelSignal,
        state: &watch::Sender<SessionState>,
    ) -> Result<VerdictReport, SessionError> {
        let result = self.verify_scan(scan, cancel, state).await;
        state.send_replace(SessionState::Idle);
        result
    }

    async fn verify_scan(
        &self,
        scan: ScanEvent,
        cancel: &CancelSignal,
        state: &watch::Sender<SessionState>,
    ) -> Result<VerdictReport, SessionError> {
        let opened_at = self.clock.now();
        let card_id = match normalize_card_id(&scan.card_id) {
            Ok(card_id) => card_id,
            Err(e) => {
                let echoed: String = scan.card_id.trim().chars().take(MAX_ECHOED_CARD_LEN).collect();
                tracing::info!(station = %self.settings.station_id, error = %e, "malformed card id");
                let session = VerificationSession::open(echoed, opened_at);
                return self.unknown_card(session, cancel, state).await;
            }
        };

        let mut session = VerificationSession::open(card_id, opened_at);
        tracing::info!(
            station = %self.settings.station_id,
            session = %session.session_id,
            card = %session.card_id,
            "session opened"
        );

        let identity = match self.directory.lookup(&session.card_id).await {
            Ok(Lookup::Found(identity)) => identity,
            Ok(Lookup::NotFound) => return self.unknown_card(session, cancel, state).await,
            Err(e) => {
                // No verdict, but the attempt still leaves an imageless entry.
                state.send_replace(SessionState::Resolving);
                let evidence_id = self.record(&session, EvidenceReason::UnknownCard, None);
                tracing::warn!(
                    session = %session.session_id,
                    card = %session.card_id,
                    evidence = %evidence_id,
                    error = %e,
                    "identity lookup failed"
                );
                return Err(e.into());
            }
        };
        session.student_id = Some(identity.student_id.clone());

        let today = opened_at.date_naive();
        if self.ledger.has_accepted(&identity.student_id, today).await {
            state.send_replace(SessionState::Resolving);
            tracing::info!(
                session = %session.session_id,
                student = identity.display_name(),
                "already marked present today"
            );
            let entry = self.evidence.capture(EvidenceCapture {
                reason: EvidenceReason::Duplicate,
                claimed_card_id: Some(session.card_id.clone()),
                frame: None,
                embedding: None,
            });
            return Ok(self.finish(session, Verdict::Duplicate, Some(entry.evidence_id)));
        }

        state.send_replace(SessionState::AwaitingFace);
        let outcome = self.await_face(&mut session, &identity, cancel).await?;
        state.send_replace(SessionState::Resolving);

        let (verdict, evidence_id) = match outcome {
            FaceOutcome::Matched(frame) => self.resolve_match(&session, &identity, frame).await,
            FaceOutcome::Mismatched(sighting) => {
                let id = self.record(&session, EvidenceReason::NoMatch, Some(sighting));
                (Verdict::Rejected, Some(id))
            }
            FaceOutcome::TimedOut(sighting) => {
                let id = self.record(&session, EvidenceReason::Timeout, sighting);
                (Verdict::TimedOut, Some(id))
            }
        };
        Ok(self.finish(session, verdict, evidence_id))
    }

    async fn resolve_match(
        &self,
        session: &VerificationSession,
        identity: &StudentIdentity,
        frame: Frame,
    ) -> (Verdict, Option<Uuid>) {
        let now = self.clock.now();
        let snapshot = self.evidence.reserve_snapshot(now);
        let record = AttendanceRecord::new(&identity.student_id, &self.settings.station_id, now)
            .with_snapshot(snapshot.key.clone());
        match self.ledger.append_if_absent(&record).await {
            Ok(AppendOutcome::Written) => {
                self.evidence.save_snapshot(snapshot, frame);
                (
                    Verdict::Accepted {
                        durability: Durability::Written,
                    },
                    None,
                )
            }
            Ok(AppendOutcome::Unavailable) => {
                self.evidence.save_snapshot(snapshot, frame);
                (
                    Verdict::Accepted {
                        durability: Durability::Queued,
                    },
                    None,
                )
            }
            Ok(AppendOutcome::AlreadyPresent) => {
                tracing::info!(
                    session = %session.session_id,
                    student = identity.display_name(),
                    "attendance written by another session first"
                );
                let entry = self.evidence.capture(EvidenceCapture {
                    reason: EvidenceReason::Duplicate,
                    claimed_card_id: Some(session.card_id.clone()),
                    frame: Some(frame),
                    embedding: None,
                });
                (Verdict::Duplicate, Some(entry.evidence_id))
            }
            Err(e) => {
                tracing::error!(
                    session = %session.session_id,
                    student = %identity.student_id,
                    snapshot = %snapshot.key,
                    error = %e,
                    "attendance accepted but NOT recorded, operator reconciliation required"
                );
                self.evidence.save_snapshot(snapshot, frame);
                (
                    Verdict::Accepted {
                        durability: Durability::Unrecorded,
                    },
                    None,
                )
            }
        }
    }

    async fn await_face(
        &self,
        session: &mut VerificationSession,
        identity: &Arc<StudentIdentity>,
        cancel: &CancelSignal,
    ) -> Result<FaceOutcome, SessionError> {
        // The window runs from AWAITING_FACE, not from the scan.
        session.deadline = Instant::now() + self.settings.session_timeout;
        let mut feed = FrameFeed::start(self.camera.clone(), self.settings.frame_interval);
        let deadline = tokio::time::sleep_until(session.deadline);
        tokio::pin!(deadline);

        let mut latest: Option<Sighting> = None;
        let mut best_shot: Option<Sighting> = None;

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = &mut deadline => break,
                next = feed.next() => next?,
            };
            session.frames_examined += 1;

            let observation = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = &mut deadline => {
                    latest = Some(Sighting { frame, embedding: None });
                    break;
                }
                observation = self.observe(&frame, Some(identity)) => observation,
            };

            let embedding = match observation {
                Observation::Face {
                    embedding,
                    score: Some(score),
                } => {
                    session.note_distance(score.best_distance);
                    if score.matched {
                        session.consecutive_matches += 1;
                        session.consecutive_mismatches = 0;
                        tracing::debug!(
                            session = %session.session_id,
                            distance = score.best_distance,
                            reference = score.matched_reference_index,
                            streak = session.consecutive_matches,
                            "face matched"
                        );
                        if session.consecutive_matches >= self.settings.required_consecutive_matches {
                            return Ok(FaceOutcome::Matched(frame));
                        }
                    } else {
                        session.consecutive_matches = 0;
                        session.consecutive_mismatches += 1;
                        tracing::debug!(
                            session = %session.session_id,
                            distance = score.best_distance,
                            "face did not match"
                        );
                        let limit = self.settings.reject_after_mismatches;
                        if limit > 0 && session.consecutive_mismatches >= limit {
                            return Ok(FaceOutcome::Mismatched(Sighting {
                                frame,
                                embedding: Some(embedding),
                            }));
                        }
                    }
                    Some(embedding)
                }
                Observation::Face { score: None, .. } | Observation::NoFace => {
                    session.consecutive_matches = 0;
                    None
                }
                Observation::Failed(reason) => {
                    session.consecutive_matches = 0;
                    tracing::warn!(session = %session.session_id, reason = %reason, "frame skipped");
                    None
                }
            };

            let sighting = Sighting { frame, embedding };
            if sighting.frame.is_good_shot() {
                best_shot = Some(Sighting {
                    frame: sighting.frame.clone(),
                    embedding: sighting.embedding.clone(),
                });
            }
            latest = Some(sighting);
        }

        tracing::info!(
            session = %session.session_id,
            frames = session.frames_examined,
            "verification window elapsed"
        );
        Ok(FaceOutcome::TimedOut(best_shot.or(latest)))
    }

    async fn unknown_card(
        &self,
        mut session: VerificationSession,
        cancel: &CancelSignal,
        state: &watch::Sender<SessionState>,
    ) -> Result<VerdictReport, SessionError> {
        tracing::info!(session = %session.session_id, card = %session.card_id, "card not enrolled");
        let sighting = if self.settings.unknown_card_capture.is_zero() {
            None
        } else {
            state.send_replace(SessionState::AwaitingFace);
            self.glimpse(&mut session, cancel).await?
        };
        state.send_replace(SessionState::Resolving);
        let id = self.record(&session, EvidenceReason::UnknownCard, sighting);
        Ok(self.finish(session, Verdict::UnknownCard, Some(id)))
    }

    /// Grab a face for review within the unknown-card window.
    async fn glimpse(
        &self,
        session: &mut VerificationSession,
        cancel: &CancelSignal,
    ) -> Result<Option<Sighting>, SessionError> {
        let mut feed = FrameFeed::start(self.camera.clone(), self.settings.frame_interval);
        let window = tokio::time::sleep(self.settings.unknown_card_capture);
        tokio::pin!(window);
        let mut fallback: Option<Sighting> = None;

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = &mut window => break,
                next = feed.next() => next?,
            };
            session.frames_examined += 1;

            let observation = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = &mut window => {
                    fallback.get_or_insert(Sighting { frame, embedding: None });
                    break;
                }
                observation = self.observe(&frame, None) => observation,
            };

            match observation {
                Observation::Face { embedding, .. } if frame.is_good_shot() => {
                    return Ok(Some(Sighting {
                        frame,
                        embedding: Some(embedding),
                    }));
                }
                Observation::Face { embedding, .. } => {
                    fallback = Some(Sighting {
                        frame,
                        embedding: Some(embedding),
                    });
                }
                _ => {
                    if fallback.as_ref().map_or(true, |s| s.embedding.is_none()) {
                        fallback = Some(Sighting {
                            frame,
                            embedding: None,
                        });
                    }
                }
            }
        }
        Ok(fallback)
    }

    /// Embed `frame` and score it against `identity`, time-boxed.
    async fn observe(&self, frame: &Frame, identity: Option<&Arc<StudentIdentity>>) -> Observation {
        if frame.is_dark {
            return Observation::NoFace;
        }

        let embedder = self.embedder.clone();
        let matcher = self.matcher.clone();
        let identity = identity.cloned();
        let (data, width, height) = (frame.data.clone(), frame.width, frame.height);
        let work = tokio::task::spawn_blocking(move || {
            let embedding = embedder.embed(&data, width, height)?;
            Ok::<_, rollgate_core::EmbedError>(embedding.map(|embedding| {
                let score = identity
                    .as_ref()
                    .and_then(|identity| matcher.score(&embedding, &identity.references));
                (embedding, score)
            }))
        });

        match tokio::time::timeout(self.settings.matcher_timeout, work).await {
            Ok(Ok(Ok(Some((embedding, score))))) => Observation::Face { embedding, score },
            Ok(Ok(Ok(None))) => Observation::NoFace,
            Ok(Ok(Err(e))) => Observation::Failed(e.to_string()),
            Ok(Err(e)) => Observation::Failed(format!("embed task: {e}")),
            Err(_) => Observation::Failed("matcher timed out".to_string()),
        }
    }

    fn record(&self, session: &VerificationSession, reason: EvidenceReason, sighting: Option<Sighting>) -> Uuid {
        let (frame, embedding) = match sighting {
            Some(s) => (Some(s.frame), s.embedding),
            None => (None, None),
        };
        self.evidence
            .capture(EvidenceCapture {
                reason,
                claimed_card_id: Some(session.card_id.clone()),
                frame,
                embedding,
            })
            .evidence_id
    }

    fn finish(&self, session: VerificationSession, verdict: Verdict, evidence_id: Option<Uuid>) -> VerdictReport {
        let report = session.into_report(&self.settings.station_id, verdict, self.clock.now(), evidence_id);
        tracing::info!(
            station = %report.station_id,
            session = %report.session_id,
            card = %report.card_id,
            student = report.student_id.as_deref().unwrap_or("-"),
            verdict = %report.verdict,
            frames = report.frames_examined,
            best_distance = ?report.best_distance,
            "session resolved"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_signal_wakes_waiters() {
        let signal = CancelSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        tokio::task::yield_now().await;
        signal.cancel();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
        // Already cancelled: resolves immediately, any number of times.
        signal.cancelled().await;
        signal.cancelled().await;
    }

    #[test]
    fn test_best_distance_keeps_lowest() {
        let opened = DateTime::parse_from_rfc3339("2026-10-17T08:00:00+02:00").unwrap();
        let mut session = VerificationSession::open("A1".into(), opened);
        session.note_distance(0.9);
        session.note_distance(0.4);
        session.note_distance(0.7);
        assert_eq!(session.best_distance, Some(0.4));
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config {
            session_timeout_ms: 5_000,
            frame_interval_ms: 250,
            unknown_card_capture_ms: 0,
            ..Config::default()
        };
        let settings = SessionSettings::from(&config);
        assert_eq!(settings.session_timeout, Duration::from_secs(5));
        assert_eq!(settings.frame_interval, Duration::from_millis(250));
        assert!(settings.unknown_card_capture.is_zero());
    }
}
