use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::broker::{CommandPublisher, MessageHandler, PublishError};
use crate::cache::{LiveCache, LiveState};
use crate::codec::{self, Command, DecodeError, Reading};
use crate::config::Config;
use crate::history::{HistoryRecord, HistoryStore, RangeError, RelativeRange, StoreError};

/// Store writes allowed in flight at once. Readings arriving while all are
/// busy are served live but not persisted.
const MAX_PENDING_WRITES: usize = 32;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("invalid range: {0}")]
    Range(#[from] RangeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A command did not reach the device. Callers only learn that it failed;
/// the cause is kept for logs.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("command not delivered: {0}")]
    NotDelivered(#[source] PublishError),
}

/// Connectivity check result.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    pub connected: bool,
    pub last_received: Option<OffsetDateTime>,
    pub uptime: Duration,
}

/// Ties the broker, cache and history store together.
///
/// Inbound telemetry goes decode, cache, store in that order; the store write
/// runs on its own task so the next message never waits for it. Commands go
/// encode, publish. The store and publisher are injected so tests can swap
/// in doubles.
pub struct TelemetryService<S, P> {
    cache: LiveCache,
    store: Arc<S>,
    writes: Arc<Semaphore>,
    publisher: P,
    data_topic: String,
    command_topic: String,
    history_limit: NonZeroUsize,
    started_at: Instant,
}

impl<S: HistoryStore, P: CommandPublisher> TelemetryService<S, P> {
    pub fn new(store: S, publisher: P, cfg: &Config) -> Self {
        Self {
            cache: LiveCache::new(),
            store: Arc::new(store),
            writes: Arc::new(Semaphore::new(MAX_PENDING_WRITES)),
            publisher,
            data_topic: cfg.mqtt.data_topic.clone(),
            command_topic: cfg.mqtt.command_topic.clone(),
            history_limit: NonZeroUsize::new(cfg.store.history_limit)
                .unwrap_or(NonZeroUsize::MIN),
            started_at: Instant::now(),
        }
    }

    /// Decode one inbound message, refresh the live cache, then hand the
    /// reading to a background store write.
    ///
    /// A decode failure leaves the cache untouched. Store failures are logged
    /// by the write task and never reach the caller.
    pub async fn on_message(&self, topic: &str, payload: &[u8]) -> Result<(), DecodeError> {
        let topic_device = codec::device_id_from_topic(&self.data_topic, topic);
        let reading = codec::decode(payload, topic_device)?;

        let received_at = OffsetDateTime::now_utc();
        self.cache.replace(reading.clone(), received_at).await;
        debug!(device_id = %reading.device_id, pv_power = ?reading.pv_power, "live reading updated");

        self.persist(reading);
        Ok(())
    }

    fn persist(&self, reading: Reading) {
        let Ok(permit) = Arc::clone(&self.writes).try_acquire_owned() else {
            warn!(device_id = %reading.device_id, "store backlog full, reading not persisted");
            return;
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.append(&reading).await {
                warn!(
                    device_id = %reading.device_id,
                    status = ?e.status(),
                    error = %e,
                    "reading not persisted"
                );
            }
            drop(permit);
        });
    }

    /// Resolves once every store write started so far has finished.
    pub async fn flush_writes(&self) {
        // The semaphore is never closed, so this only waits.
        let _ = self.writes.acquire_many(MAX_PENDING_WRITES as u32).await;
    }

    pub async fn live(&self) -> Option<Arc<LiveState>> {
        self.cache.read().await
    }

    /// Records inside the relative `range` (e.g. "-24h"), oldest first.
    /// `limit` falls back to the configured row cap.
    pub async fn history(
        &self,
        range: &str,
        limit: Option<NonZeroUsize>,
    ) -> Result<Vec<HistoryRecord>, HistoryError> {
        let range: RelativeRange = range.parse()?;
        let since = range.lower_bound(OffsetDateTime::now_utc())?;
        let limit = limit.unwrap_or(self.history_limit);
        Ok(self.store.query(since, limit).await?)
    }

    pub async fn send_command(&self, command: &Command) -> Result<(), RelayError> {
        let payload = codec::encode(command);
        match self.publisher.publish(&self.command_topic, payload).await {
            Ok(()) => {
                info!(command = command.name(), topic = %self.command_topic, "command delivered");
                Ok(())
            }
            Err(e) => {
                warn!(command = command.name(), error = %e, "command not delivered");
                Err(RelayError::NotDelivered(e))
            }
        }
    }

    pub async fn status(&self) -> HealthSnapshot {
        HealthSnapshot {
            connected: self.publisher.is_connected(),
            last_received: self.cache.last_received().await,
            uptime: self.started_at.elapsed(),
        }
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }
}

impl<S: HistoryStore, P: CommandPublisher> MessageHandler for TelemetryService<S, P> {
    async fn handle(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
        if let Err(e) = self.on_message(topic, payload).await {
            warn!(topic, bytes = payload.len(), error = %e, "telemetry dropped");
        }
        Ok(())
    }
}
