//! Background drain of a durable queue toward the shared store.

use crate::config::BackoffConfig;
use crate::queue::DurableQueue;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Exponential backoff: `base`, `base * m`, `base * m^2`, ... capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let base = Duration::from_millis(config.base_ms);
        Self {
            base,
            max: Duration::from_millis(config.max_ms),
            multiplier: config.multiplier,
            current: base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        // Overflow or a non-finite product saturates at `max`.
        let next = self.current.as_secs_f64() * self.multiplier;
        self.current = match Duration::try_from_secs_f64(next) {
            Ok(next) if next < self.max => next,
            _ => self.max,
        };
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

pub enum Delivery {
    Delivered,
    Retry(String),
}

/// Hands one queued item to its destination.
#[async_trait]
pub trait Deliver<T>: Send + Sync + 'static {
    async fn deliver(&self, item: &T) -> Delivery;
}

/// Drains `queue` through `sink`, oldest first, until shutdown.
///
/// A failed delivery keeps the item at the head and waits out the backoff.
/// An empty queue parks on `wake`.
pub struct RetryWorker<T, D> {
    name: &'static str,
    queue: Arc<DurableQueue<T>>,
    sink: D,
    backoff: Backoff,
    wake: Arc<Notify>,
}

impl<T, D> RetryWorker<T, D>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    D: Deliver<T>,
{
    pub fn new(
        name: &'static str,
        queue: Arc<DurableQueue<T>>,
        sink: D,
        backoff: &BackoffConfig,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            name,
            queue,
            sink,
            backoff: Backoff::new(backoff),
            wake,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(queue = self.name, "retry worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.queue.peek() {
                Ok(None) => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        res = shutdown.changed() => {
                            if res.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
                Ok(Some(head)) => match self.sink.deliver(&head.item).await {
                    Delivery::Delivered => {
                        if let Err(e) = self.queue.remove(head.id) {
                            tracing::error!(queue = self.name, error = %e, "failed to remove delivered item");
                        }
                        self.backoff.reset();
                        continue;
                    }
                    Delivery::Retry(reason) => {
                        let attempts = self.queue.record_attempt(head.id).unwrap_or(head.attempts);
                        let delay = self.backoff.next_delay();
                        tracing::warn!(
                            queue = self.name,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            reason = %reason,
                            "delivery failed"
                        );
                        delay
                    }
                },
                Err(e) => {
                    tracing::error!(queue = self.name, error = %e, "queue read failed");
                    self.backoff.next_delay()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(queue = self.name, "retry worker stopped");
    }
}
