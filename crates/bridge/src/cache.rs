use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::codec::Reading;

/// The latest decoded reading and when it arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveState {
    pub reading: Reading,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

/// In-memory holder of the single most recent reading.
///
/// The slot holds an `Arc<LiveState>`, so a write is a pointer swap and a
/// read is a refcount bump; neither side holds the lock any longer than that.
/// Clones share the same slot.
#[derive(Clone, Default)]
pub struct LiveCache {
    inner: Arc<RwLock<Option<Arc<LiveState>>>>,
}

impl LiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the cached state with `reading` received at `received_at`.
    pub async fn replace(&self, reading: Reading, received_at: OffsetDateTime) {
        let next = Arc::new(LiveState {
            reading,
            received_at,
        });
        *self.inner.write().await = Some(next);
    }

    /// Snapshot of the current state, `None` until the first reading arrives.
    pub async fn read(&self) -> Option<Arc<LiveState>> {
        self.inner.read().await.clone()
    }

    pub async fn last_received(&self) -> Option<OffsetDateTime> {
        self.inner.read().await.as_ref().map(|s| s.received_at)
    }
}
