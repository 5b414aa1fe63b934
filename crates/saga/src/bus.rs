//! In-process message bus with keyed partitions.
//!
//! ```text
//! publish(channel, key, msg)
//!        │  hash(key) % partitions
//!        ▼
//!  ┌──────────┬──────────┬─────┐
//!  │ part. 0  │ part. 1  │ ... │   one worker per partition and subscriber
//!  └────┬─────┴────┬─────┴─────┘
//!       ▼          ▼
//!   handler    handler  ── Err ──► redeliver (capped backoff) ──► dead letters
//! ```
//!
//! Messages with the same key are handled one at a time, in publish order.
//! Delivery is at-least-once: a handler that returns an error sees the same
//! envelope again, so handlers must be idempotent.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Result, SagaError};
use crate::messages::SCHEMA_VERSION;

/// Bus tuning.
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Partitions per subscriber of a channel.
    pub partitions: usize,
    /// Deliveries of one envelope before it is dead-lettered.
    pub max_deliveries: u32,
    pub redelivery_initial_delay: Duration,
    pub redelivery_max_delay: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            partitions: 8,
            max_deliveries: 5,
            redelivery_initial_delay: Duration::from_millis(50),
            redelivery_max_delay: Duration::from_secs(1),
        }
    }
}

impl BusSettings {
    fn redelivery_delay(&self, delivery: u32) -> Duration {
        let factor = 2u32.saturating_pow(delivery.saturating_sub(1));
        self.redelivery_initial_delay
            .saturating_mul(factor)
            .min(self.redelivery_max_delay)
    }
}

/// A published message.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub id: u64,
    pub channel: String,
    pub key: String,
    pub schema_version: u16,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// An envelope that exhausted its deliveries.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub subscriber: String,
    pub envelope: Envelope,
    pub error: String,
    pub deliveries: u32,
}

/// Consumes envelopes from one channel.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Returning an error schedules a redelivery.
    async fn handle(&self, envelope: &Envelope) -> Result<()>;
}

struct Subscriber {
    name: String,
    partitions: Vec<mpsc::UnboundedSender<Envelope>>,
}

#[derive(Default)]
struct Inner {
    settings: BusSettings,
    channels: RwLock<HashMap<String, Vec<Subscriber>>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: AtomicUsize,
    idle: Notify,
    next_id: AtomicU64,
}

/// Keyed pub/sub within one process.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

fn partition_of(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

impl InMemoryBus {
    pub fn new(settings: BusSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                ..Default::default()
            }),
        }
    }

    /// Registers a subscriber and spawns one worker per partition.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(
        &self,
        channel: &str,
        subscriber: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let count = self.inner.settings.partitions.max(1);
        let mut partitions = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        for partition in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            partitions.push(tx);
            workers.push(tokio::spawn(run_partition(
                Arc::clone(&self.inner),
                subscriber.to_string(),
                partition,
                Arc::clone(&handler),
                rx,
            )));
        }

        self.inner
            .channels
            .write()
            .map_err(|_| SagaError::Unavailable("message bus".into()))?
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber {
                name: subscriber.to_string(),
                partitions,
            });
        self.inner
            .workers
            .lock()
            .map_err(|_| SagaError::Unavailable("message bus".into()))?
            .extend(workers);
        tracing::debug!(channel, subscriber, partitions = count, "subscribed");
        Ok(())
    }

    /// Publishes a message to every subscriber of `channel`.
    ///
    /// A channel nobody subscribed to drops the message.
    pub fn publish<T: Serialize>(&self, channel: &str, key: &str, message: &T) -> Result<u64> {
        let envelope = Envelope {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            channel: channel.to_string(),
            key: key.to_string(),
            schema_version: SCHEMA_VERSION,
            payload: serde_json::to_value(message)?,
            published_at: Utc::now(),
        };

        let channels = self
            .inner
            .channels
            .read()
            .map_err(|_| SagaError::Unavailable("message bus".into()))?;
        let Some(subscribers) = channels.get(channel) else {
            tracing::debug!(channel, key, "no subscribers, message dropped");
            return Ok(envelope.id);
        };

        for subscriber in subscribers {
            let partition = partition_of(key, subscriber.partitions.len());
            self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
            if subscriber.partitions[partition].send(envelope.clone()).is_err() {
                self.finish_one();
                return Err(SagaError::Unavailable(format!(
                    "subscriber {} of {channel}",
                    subscriber.name
                )));
            }
        }
        metrics::counter!("bus_messages_published_total", "channel" => channel.to_string())
            .increment(1);
        Ok(envelope.id)
    }

    /// Envelopes published but not yet handled or dead-lettered.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until every published envelope was handled or dead-lettered,
    /// including the ones handlers published along the way.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Like [`wait_until_idle`](Self::wait_until_idle) with an upper bound.
    /// Returns false on timeout.
    pub async fn wait_until_idle_for(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_until_idle())
            .await
            .is_ok()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner
            .dead_letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }

    /// Closes every channel and waits for the workers to drain.
    pub async fn shutdown(&self) {
        if let Ok(mut channels) = self.inner.channels.write() {
            channels.clear();
        }
        let workers = match self.inner.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "bus worker ended abnormally");
            }
        }
    }

    fn finish_one(&self) {
        finish_one(&self.inner);
    }
}

fn finish_one(inner: &Inner) {
    if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
        inner.idle.notify_waiters();
    }
}

async fn run_partition(
    inner: Arc<Inner>,
    subscriber: String,
    partition: usize,
    handler: Arc<dyn MessageHandler>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        deliver(&inner, &subscriber, handler.as_ref(), &envelope).await;
        finish_one(&inner);
    }
    tracing::debug!(subscriber, partition, "partition worker stopped");
}

async fn deliver(inner: &Inner, subscriber: &str, handler: &dyn MessageHandler, envelope: &Envelope) {
    let settings = &inner.settings;
    let mut delivery = 1;
    loop {
        match handler.handle(envelope).await {
            Ok(()) => return,
            Err(e) if delivery < settings.max_deliveries => {
                let delay = settings.redelivery_delay(delivery);
                tracing::warn!(
                    channel = %envelope.channel,
                    key = %envelope.key,
                    delivery,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "handler failed, redelivering"
                );
                metrics::counter!("bus_redeliveries_total", "channel" => envelope.channel.clone())
                    .increment(1);
                tokio::time::sleep(delay).await;
                delivery += 1;
            }
            Err(e) => {
                tracing::error!(
                    channel = %envelope.channel,
                    key = %envelope.key,
                    subscriber,
                    deliveries = delivery,
                    error = %e,
                    "redeliveries exhausted, dead-lettering"
                );
                metrics::counter!("bus_dead_letters_total", "channel" => envelope.channel.clone())
                    .increment(1);
                if let Ok(mut letters) = inner.dead_letters.lock() {
                    letters.push(DeadLetter {
                        subscriber: subscriber.to_string(),
                        envelope: envelope.clone(),
                        error: e.to_string(),
                        deliveries: delivery,
                    });
                }
                return;
            }
        }
    }
}
