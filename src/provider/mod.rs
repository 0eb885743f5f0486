// =============================================================================
// Market data provider contract + async offload bridge
// =============================================================================
//
// Providers are deliberately blocking: the upstream feeds are plain HTTP
// pulls with chunky JSON/CSV payloads. `AsyncProvider` is the only way the
// async core ever calls one, hopping every invocation onto the blocking
// thread pool so the cooperative tasks stay responsive. The poller issues at
// most one snapshot batch at a time; history requests fan out per HTTP
// request and may run concurrently.
// =============================================================================

pub mod eastmoney;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tokio::task;

use crate::types::{Bar, Period, Snapshot, SymbolInfo};

/// Sentinel error for providers without a minute-resolution feed; the
/// history endpoint maps it to 501.
#[derive(Debug, Clone, Copy)]
pub struct MinuteHistoryUnsupported;

impl fmt::Display for MinuteHistoryUnsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "minute history not supported by this provider")
    }
}

impl std::error::Error for MinuteHistoryUnsupported {}

/// Blocking upstream market-data source.
pub trait MarketDataProvider: Send + Sync {
    fn search_symbols(&self, q: &str, limit: usize) -> Result<Vec<SymbolInfo>>;

    fn get_daily_history(&self, symbol: &str, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<Bar>>;

    fn get_minute_history(
        &self,
        symbol: &str,
        period: Period,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>>;

    fn get_realtime_snapshot_batch(&self, symbols: &[String])
        -> Result<BTreeMap<String, Snapshot>>;

    /// Authoritative set of trading days, past and announced future.
    fn get_trading_calendar(&self) -> Result<BTreeSet<NaiveDate>>;
}

// =============================================================================
// AsyncProvider
// =============================================================================

/// Async facade over any [`MarketDataProvider`]: each call runs on the
/// blocking pool and the caller awaits the result. Dropping the future
/// abandons the in-flight result; the worker thread finishes on its own.
#[derive(Clone)]
pub struct AsyncProvider {
    inner: Arc<dyn MarketDataProvider>,
}

impl AsyncProvider {
    pub fn new(inner: Arc<dyn MarketDataProvider>) -> Self {
        Self { inner }
    }

    pub async fn search_symbols(&self, q: String, limit: usize) -> Result<Vec<SymbolInfo>> {
        let inner = Arc::clone(&self.inner);
        task::spawn_blocking(move || inner.search_symbols(&q, limit))
            .await
            .context("symbol search worker failed")?
    }

    pub async fn get_daily_history(
        &self,
        symbol: String,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>> {
        let inner = Arc::clone(&self.inner);
        task::spawn_blocking(move || inner.get_daily_history(&symbol, start, end))
            .await
            .context("daily history worker failed")?
    }

    pub async fn get_minute_history(
        &self,
        symbol: String,
        period: Period,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let inner = Arc::clone(&self.inner);
        task::spawn_blocking(move || inner.get_minute_history(&symbol, period, start, end))
            .await
            .context("minute history worker failed")?
    }

    pub async fn get_realtime_snapshot_batch(
        &self,
        symbols: Vec<String>,
    ) -> Result<BTreeMap<String, Snapshot>> {
        let inner = Arc::clone(&self.inner);
        task::spawn_blocking(move || inner.get_realtime_snapshot_batch(&symbols))
            .await
            .context("snapshot worker failed")?
    }

    pub async fn get_trading_calendar(&self) -> Result<BTreeSet<NaiveDate>> {
        let inner = Arc::clone(&self.inner);
        task::spawn_blocking(move || inner.get_trading_calendar())
            .await
            .context("calendar worker failed")?
    }
}
