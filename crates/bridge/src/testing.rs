//! In-memory doubles for the store and publisher seams.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

use crate::broker::{CommandPublisher, PublishError};
use crate::codec::Reading;
use crate::history::{HistoryRecord, HistoryStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<(OffsetDateTime, Reading)>>,
    queries: Mutex<Vec<(OffsetDateTime, NonZeroUsize)>>,
    failing: AtomicBool,
    delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every append sleeps this long before landing.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn appended(&self) -> Vec<Reading> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn queries(&self) -> Vec<(OffsetDateTime, NonZeroUsize)> {
        self.queries.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Status {
                status: 503,
                body: "store offline".into(),
            });
        }
        Ok(())
    }
}

impl HistoryStore for MemoryStore {
    async fn append(&self, reading: &Reading) -> Result<(), StoreError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check()?;
        self.rows
            .lock()
            .unwrap()
            .push((OffsetDateTime::now_utc(), reading.clone()));
        Ok(())
    }

    async fn query(
        &self,
        since: OffsetDateTime,
        limit: NonZeroUsize,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        self.queries.lock().unwrap().push((since, limit));
        self.check()?;
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|(at, _)| *at >= since)
            .take(limit.get())
            .map(|(at, r)| HistoryRecord {
                time: *at,
                pv_voltage: r.pv_voltage,
                pv_current: r.pv_current,
                pv_power: r.pv_power,
                batt_voltage: r.batt_voltage,
                batt_charge_current: r.batt_charge_current,
                batt_soc: r.batt_soc,
                load_power: r.load_power,
                energy_today: r.energy_today,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum PublishMode {
    Ack,
    NoAck,
    Offline,
}

pub struct StubPublisher {
    mode: PublishMode,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
}

impl StubPublisher {
    pub fn with_mode(mode: PublishMode) -> Self {
        Self {
            mode,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn connected() -> Self {
        Self::with_mode(PublishMode::Ack)
    }

    pub fn disconnected() -> Self {
        Self::with_mode(PublishMode::Offline)
    }

    pub fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }
}

impl CommandPublisher for StubPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        match self.mode {
            PublishMode::Offline => Err(PublishError::NotConnected),
            PublishMode::NoAck => Err(PublishError::Timeout(Duration::from_secs(5))),
            PublishMode::Ack => {
                self.sent.lock().unwrap().push((topic.to_owned(), payload));
                Ok(())
            }
        }
    }

    fn is_connected(&self) -> bool {
        !matches!(self.mode, PublishMode::Offline)
    }
}
