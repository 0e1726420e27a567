//! Write-through persistence and range queries against the `power_logs`
//! table of a PostgREST endpoint (Supabase).

use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::codec::Reading;
use crate::config::StoreConfig;

// ---------------------------------------------------------------------------
// Relative time ranges ("-1h", "-7d", ...)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeUnit {
    Hours,
    Days,
    Weeks,
    /// Thirty days, not a calendar month.
    Months,
}

impl RangeUnit {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'h' => Some(Self::Hours),
            'd' => Some(Self::Days),
            'w' => Some(Self::Weeks),
            'm' => Some(Self::Months),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            Self::Hours => 'h',
            Self::Days => 'd',
            Self::Weeks => 'w',
            Self::Months => 'm',
        }
    }

    fn span(self, amount: u32) -> Duration {
        let amount = i64::from(amount);
        match self {
            Self::Hours => Duration::hours(amount),
            Self::Days => Duration::days(amount),
            Self::Weeks => Duration::weeks(amount),
            Self::Months => Duration::days(amount * 30),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("range is empty")]
    Empty,
    #[error("unknown range unit {0:?} (use h, d, w or m)")]
    UnknownUnit(char),
    #[error("range amount {0:?} is not a positive integer")]
    InvalidAmount(String),
    #[error("range reaches beyond the representable calendar")]
    OutOfBounds,
}

/// A look-back window ending now, written `-<amount><unit>`; the leading
/// minus is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeRange {
    amount: u32,
    unit: RangeUnit,
}

impl RelativeRange {
    pub fn new(amount: u32, unit: RangeUnit) -> Result<Self, RangeError> {
        if amount == 0 {
            return Err(RangeError::InvalidAmount(amount.to_string()));
        }
        Ok(Self { amount, unit })
    }

    pub fn span(&self) -> Duration {
        self.unit.span(self.amount)
    }

    /// Oldest creation time still inside the window. The bound is inclusive.
    pub fn lower_bound(&self, now: OffsetDateTime) -> Result<OffsetDateTime, RangeError> {
        now.checked_sub(self.span()).ok_or(RangeError::OutOfBounds)
    }
}

impl FromStr for RelativeRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let body = s.strip_prefix('-').unwrap_or(s);
        let unit_char = body.chars().last().ok_or(RangeError::Empty)?;
        let digits = &body[..body.len() - unit_char.len_utf8()];

        let unit = RangeUnit::from_char(unit_char).ok_or(RangeError::UnknownUnit(unit_char))?;

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RangeError::InvalidAmount(digits.to_owned()));
        }
        let amount: u32 = digits
            .parse()
            .map_err(|_| RangeError::InvalidAmount(digits.to_owned()))?;

        Self::new(amount, unit)
    }
}

impl fmt::Display for RelativeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-{}{}", self.amount, self.unit.as_char())
    }
}

// ---------------------------------------------------------------------------
// Records and errors
// ---------------------------------------------------------------------------

/// The dashboard's view of one stored row. Read from the store's
/// `created_at` column, written out as `time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(
        rename(serialize = "time", deserialize = "created_at"),
        with = "time::serde::rfc3339"
    )]
    pub time: OffsetDateTime,
    pub pv_voltage: Option<f64>,
    pub pv_current: Option<f64>,
    pub pv_power: Option<f64>,
    pub batt_voltage: Option<f64>,
    pub batt_charge_current: Option<f64>,
    pub batt_soc: Option<f64>,
    pub load_power: Option<f64>,
    pub energy_today: Option<f64>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("history store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("history store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("could not format time bound: {0}")]
    Bound(#[from] time::error::Format),
}

impl StoreError {
    /// HTTP status behind the failure, when the store answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            Self::Bound(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Store seam
// ---------------------------------------------------------------------------

pub trait HistoryStore: Send + Sync + 'static {
    /// Persist one reading. Called once per reading; never retried.
    fn append(&self, reading: &Reading) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Records created at or after `since`, oldest first, at most `limit`.
    fn query(
        &self,
        since: OffsetDateTime,
        limit: NonZeroUsize,
    ) -> impl Future<Output = Result<Vec<HistoryRecord>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// PostgREST client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PostgrestStore {
    endpoint: Option<Arc<Endpoint>>,
}

#[derive(Debug)]
struct Endpoint {
    http: Client,
    rows_url: String,
    key: String,
}

impl PostgrestStore {
    /// Build a client for `cfg`. Without a url and key the store runs
    /// disabled: appends succeed without I/O and queries return nothing.
    pub fn new(cfg: &StoreConfig) -> anyhow::Result<Self> {
        if !cfg.is_configured() {
            return Ok(Self::disabled());
        }

        let http = Client::builder()
            .timeout(StdDuration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("failed to build history store HTTP client")?;

        Ok(Self {
            endpoint: Some(Arc::new(Endpoint {
                http,
                rows_url: format!("{}/rest/v1/{}", cfg.url.trim_end_matches('/'), cfg.table),
                key: cfg.key.clone(),
            })),
        })
    }

    pub fn disabled() -> Self {
        Self { endpoint: None }
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }
}

impl HistoryStore for PostgrestStore {
    async fn append(&self, reading: &Reading) -> Result<(), StoreError> {
        let Some(ep) = &self.endpoint else {
            debug!(device_id = %reading.device_id, "history store disabled, reading kept in memory only");
            return Ok(());
        };

        let resp = ep
            .http
            .post(&ep.rows_url)
            .header("apikey", &ep.key)
            .bearer_auth(&ep.key)
            .header("Prefer", "return=minimal")
            .json(reading)
            .send()
            .await?;
        ensure_success(resp).await?;

        debug!(device_id = %reading.device_id, "reading persisted");
        Ok(())
    }

    async fn query(
        &self,
        since: OffsetDateTime,
        limit: NonZeroUsize,
    ) -> Result<Vec<HistoryRecord>, StoreError> {
        let Some(ep) = &self.endpoint else {
            return Ok(Vec::new());
        };

        let since = since.format(&Rfc3339)?;
        let resp = ep
            .http
            .get(&ep.rows_url)
            .header("apikey", &ep.key)
            .bearer_auth(&ep.key)
            .query(&[
                ("select", "*".to_owned()),
                ("created_at", format!("gte.{since}")),
                ("order", "created_at.asc".to_owned()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;

        let records: Vec<HistoryRecord> = ensure_success(resp).await?.json().await?;
        debug!(since = %since, rows = records.len(), "history queried");
        Ok(records)
    }
}

async fn ensure_success(resp: Response) -> Result<Response, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
