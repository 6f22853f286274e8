//! Idempotent, durable append of attendance records.
//!
//! The shared store decides uniqueness. When it cannot be reached within
//! `store_timeout` the record goes to a local durable queue and the retry
//! worker delivers it later; the caller learns which of the two happened.

use crate::config::BackoffConfig;
use crate::queue::{DurableQueue, QueueError};
use crate::retry::{Deliver, Delivery, RetryWorker};
use crate::store::{AttendanceStore, InsertOutcome};
use async_trait::async_trait;
use chrono::NaiveDate;
use rollgate_core::AttendanceRecord;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("local ledger queue: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Written,
    AlreadyPresent,
    /// Store unreachable; the record is in the local queue.
    Unavailable,
}

pub struct AttendanceLedger {
    store: Arc<dyn AttendanceStore>,
    queue: Arc<DurableQueue<AttendanceRecord>>,
    wake: Arc<Notify>,
    timeout: Duration,
}

impl AttendanceLedger {
    pub fn new(
        store: Arc<dyn AttendanceStore>,
        queue: Arc<DurableQueue<AttendanceRecord>>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            wake: Arc::new(Notify::new()),
            timeout,
        }
    }

    /// Write `record` unless one exists for its `(student_id, date)`.
    ///
    /// `Err` only when the store is unreachable and the local queue failed
    /// as well; the record is then lost.
    pub async fn append_if_absent(&self, record: &AttendanceRecord) -> Result<AppendOutcome, LedgerError> {
        match tokio::time::timeout(self.timeout, self.store.insert_if_absent(record)).await {
            Ok(Ok(InsertOutcome::Written)) => Ok(AppendOutcome::Written),
            Ok(Ok(InsertOutcome::AlreadyPresent)) => Ok(AppendOutcome::AlreadyPresent),
            Ok(Err(e)) if e.is_unavailable() => {
                tracing::warn!(student = %record.student_id, error = %e, "attendance store unavailable, queueing");
                self.enqueue(record)
            }
            Ok(Err(e)) => {
                tracing::error!(student = %record.student_id, error = %e, "attendance store write failed, queueing");
                self.enqueue(record)
            }
            Err(_) => {
                tracing::warn!(
                    student = %record.student_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "attendance store write timed out, queueing"
                );
                self.enqueue(record)
            }
        }
    }

    fn enqueue(&self, record: &AttendanceRecord) -> Result<AppendOutcome, LedgerError> {
        if self.is_pending(&record.student_id, record.date)? {
            return Ok(AppendOutcome::AlreadyPresent);
        }
        self.queue.push(record)?;
        self.wake.notify_one();
        Ok(AppendOutcome::Unavailable)
    }

    fn is_pending(&self, student_id: &str, date: NaiveDate) -> Result<bool, LedgerError> {
        Ok(self
            .queue
            .items()?
            .iter()
            .any(|q| q.item.student_id == student_id && q.item.date == date))
    }

    /// Whether an accepted record exists for this student and day, in the
    /// store or still waiting in the local queue.
    ///
    /// A store that cannot answer is not an error here: the conditional
    /// append is the authority and the caller proceeds as if no record exists.
    pub async fn has_accepted(&self, student_id: &str, date: NaiveDate) -> bool {
        match self.is_pending(student_id, date) {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "ledger queue check failed"),
        }
        match tokio::time::timeout(self.timeout, self.store.has_record(student_id, date)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                tracing::debug!(student = student_id, error = %e, "duplicate pre-check skipped");
                false
            }
            Err(_) => {
                tracing::debug!(student = student_id, "duplicate pre-check timed out");
                false
            }
        }
    }

    pub fn pending_count(&self) -> Result<usize, LedgerError> {
        Ok(self.queue.len()?)
    }

    /// Worker that drains the local queue into the store.
    pub fn relay(&self, backoff: &BackoffConfig) -> RetryWorker<AttendanceRecord, LedgerRelay> {
        RetryWorker::new(
            "attendance",
            self.queue.clone(),
            LedgerRelay {
                store: self.store.clone(),
                timeout: self.timeout,
            },
            backoff,
            self.wake.clone(),
        )
    }
}

pub struct LedgerRelay {
    store: Arc<dyn AttendanceStore>,
    timeout: Duration,
}

#[async_trait]
impl Deliver<AttendanceRecord> for LedgerRelay {
    async fn deliver(&self, record: &AttendanceRecord) -> Delivery {
        match tokio::time::timeout(self.timeout, self.store.insert_if_absent(record)).await {
            Ok(Ok(InsertOutcome::Written)) => {
                tracing::info!(student = %record.student_id, date = %record.date, "queued attendance delivered");
                Delivery::Delivered
            }
            Ok(Ok(InsertOutcome::AlreadyPresent)) => {
                tracing::info!(
                    student = %record.student_id,
                    date = %record.date,
                    "queued attendance already present, dropping"
                );
                Delivery::Delivered
            }
            Ok(Err(e)) => Delivery::Retry(e.to_string()),
            Err(_) => Delivery::Retry("store timed out".to_string()),
        }
    }
}
