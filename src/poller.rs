// =============================================================================
// Poller: the single driver of the realtime pipeline
// =============================================================================
//
// One task loops: check the trading clock, pull a snapshot batch for the
// hub's active symbols through the async bridge, fold it through the bar
// builder, and fan the resulting events out to subscribers. The builder is
// mutated nowhere else, which keeps every per-bar accumulator single-writer.
//
// Broadcast pushes serialized frames into per-connection channels; a closed
// channel means the socket task is gone, and that connection is removed
// from the hub. Errors never escape the loop: upstream failures become a
// status event plus a backoff sleep.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::builder::{BarBuilder, BarEvent};
use crate::clock::TradingClock;
use crate::config::Settings;
use crate::hub::SubscriptionHub;
use crate::provider::AsyncProvider;
use crate::types::{ServerMessage, StatusLevel};

// =============================================================================
// Backoff
// =============================================================================

/// Additive backoff for upstream failures: seeded at `base`, +2 s per
/// consecutive failure up to `max`, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_seconds: u64,
    max_seconds: u64,
    current: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_seconds: 3,
            max_seconds: 10,
            current: 0,
        }
    }
}

impl Backoff {
    pub fn next(&mut self) -> u64 {
        self.current = if self.current == 0 {
            self.base_seconds
        } else {
            self.max_seconds.min(self.current + 2)
        };
        self.current
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }
}

// =============================================================================
// Poller
// =============================================================================

pub struct Poller {
    provider: AsyncProvider,
    builder: Mutex<BarBuilder>,
    clock: Arc<TradingClock>,
    hub: Arc<SubscriptionHub>,
    poll_interval: Duration,
    idle_backoff: Duration,
    /// Deadline on one snapshot batch, so a stuck upstream cannot pile
    /// batches up in the worker pool.
    snapshot_deadline: Duration,
    stop: AtomicBool,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    pub fn new(
        provider: AsyncProvider,
        builder: BarBuilder,
        clock: Arc<TradingClock>,
        hub: Arc<SubscriptionHub>,
        settings: &Settings,
    ) -> Self {
        Self {
            provider,
            builder: Mutex::new(builder),
            clock,
            hub,
            poll_interval: Duration::from_secs(settings.snapshot_poll_interval_seconds),
            idle_backoff: Duration::from_secs(settings.idle_backoff_seconds),
            snapshot_deadline: Duration::from_secs(
                (settings.snapshot_poll_interval_seconds * 3).max(1),
            ),
            stop: AtomicBool::new(false),
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Spawn the poll loop. Idempotent: a second call while running is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return;
        }
        let poller = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { poller.run().await }));
    }

    /// Graceful stop: raise the flag, cancel the task, await it. A blocking
    /// provider call that is still in flight finishes on the worker pool
    /// with its result discarded.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.running.store(false, Ordering::Relaxed);
        info!("poller stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::Relaxed);
        info!("poller starting");
        let mut backoff = Backoff::default();

        self.refresh_calendar().await;

        while !self.stop.load(Ordering::Relaxed) {
            let now = self.clock.now();

            if !self.clock.is_trading_time(&now) {
                sleep(self.idle_backoff).await;
                continue;
            }

            let symbols = self.hub.get_active_symbols();
            if symbols.is_empty() {
                sleep(self.poll_interval).await;
                continue;
            }

            let batch = timeout(
                self.snapshot_deadline,
                self.provider.get_realtime_snapshot_batch(symbols),
            )
            .await;
            let snapshots = match batch {
                Ok(Ok(snapshots)) => snapshots,
                Ok(Err(e)) => {
                    error!(error = %e, "snapshot batch failed");
                    self.broadcast_status("snapshot failed", StatusLevel::Error, "snapshot_failed");
                    sleep(Duration::from_secs(backoff.next())).await;
                    continue;
                }
                Err(_) => {
                    error!(deadline = ?self.snapshot_deadline, "snapshot batch timed out");
                    self.broadcast_status("snapshot failed", StatusLevel::Error, "snapshot_failed");
                    sleep(Duration::from_secs(backoff.next())).await;
                    continue;
                }
            };

            backoff.reset();
            let events = self.builder.lock().apply_snapshots(&snapshots);
            self.broadcast_bars(&events);

            sleep(self.poll_interval).await;

            // Refresh the calendar shortly after midnight, when the
            // upstream has published the next day.
            if now.hour() == 0 && now.minute() < 5 {
                self.refresh_calendar().await;
            }
        }

        self.running.store(false, Ordering::Relaxed);
    }

    async fn refresh_calendar(&self) {
        match self.provider.get_trading_calendar().await {
            Ok(calendar) if !calendar.is_empty() => {
                info!(days = calendar.len(), "trading calendar loaded");
                self.clock.update_calendar(calendar.into_iter().collect());
            }
            Ok(_) => warn!("trading calendar came back empty, keeping previous"),
            Err(e) => {
                error!(error = %e, "trading calendar load failed");
                self.broadcast_status(
                    "trading calendar load failed",
                    StatusLevel::Warning,
                    "calendar_failed",
                );
            }
        }
    }

    fn broadcast_bars(&self, events: &[BarEvent]) {
        for (symbol, period, bar) in events {
            let message = ServerMessage::Bar {
                symbol: symbol.clone(),
                period: *period,
                bar: bar.clone(),
            };
            let frame = match serde_json::to_string(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "failed to serialize bar event");
                    continue;
                }
            };
            for (conn, tx) in self.hub.iter_subscribers(symbol, *period) {
                if tx.send(frame.clone()).is_err() {
                    debug!(conn = %conn, "subscriber channel closed, removing");
                    self.hub.remove(conn);
                }
            }
        }
    }

    fn broadcast_status(&self, message: &str, level: StatusLevel, code: &str) {
        let event = ServerMessage::status(message, level, Some(code));
        let frame = match serde_json::to_string(&event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to serialize status event");
                return;
            }
        };
        for (conn, tx) in self.hub.iter_all() {
            if tx.send(frame.clone()).is_err() {
                debug!(conn = %conn, "subscriber channel closed, removing");
                self.hub.remove(conn);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
    use std::sync::atomic::AtomicUsize;

    use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
    use chrono_tz::Asia::Shanghai;
    use uuid::Uuid;

    use crate::provider::MarketDataProvider;
    use crate::types::{Bar, Period, Snapshot, SymbolInfo};

    #[test]
    fn backoff_sequence_and_reset() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next(), 3);
        assert_eq!(backoff.next(), 5);
        assert_eq!(backoff.next(), 7);
        assert_eq!(backoff.next(), 9);
        assert_eq!(backoff.next(), 10);
        assert_eq!(backoff.next(), 10);
        backoff.reset();
        assert_eq!(backoff.next(), 3);
    }

    /// Provider that always trades today and serves a fixed quote.
    struct ScriptedProvider {
        snapshot_calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self {
                snapshot_calls: AtomicUsize::new(0),
            }
        }
    }

    impl MarketDataProvider for ScriptedProvider {
        fn search_symbols(&self, _q: &str, _limit: usize) -> anyhow::Result<Vec<SymbolInfo>> {
            Ok(Vec::new())
        }

        fn get_daily_history(
            &self,
            _symbol: &str,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> anyhow::Result<Vec<Bar>> {
            Ok(Vec::new())
        }

        fn get_minute_history(
            &self,
            _symbol: &str,
            _period: Period,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Bar>> {
            Ok(Vec::new())
        }

        fn get_realtime_snapshot_batch(
            &self,
            symbols: &[String],
        ) -> anyhow::Result<BTreeMap<String, Snapshot>> {
            let n = self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
            Ok(symbols
                .iter()
                .map(|symbol| {
                    (
                        symbol.clone(),
                        Snapshot {
                            ts: Utc::now(),
                            last: 10.0 + n as f64 * 0.1,
                            open: None,
                            high: None,
                            low: None,
                            prev_close: None,
                            volume_total: Some(1000.0 + n as f64 * 100.0),
                            amount_total: None,
                        },
                    )
                })
                .collect())
        }

        fn get_trading_calendar(&self) -> anyhow::Result<BTreeSet<NaiveDate>> {
            let today = Utc::now().with_timezone(&Shanghai).date_naive();
            Ok(BTreeSet::from([today]))
        }
    }

    fn always_open_clock() -> Arc<TradingClock> {
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(23, 59, 59).unwrap();
        Arc::new(TradingClock::new(
            Shanghai,
            vec![(midnight, end)],
            HashMap::new(),
            HashSet::new(),
        ))
    }

    fn test_settings() -> Settings {
        Settings {
            timezone: Shanghai,
            trading_sessions: Vec::new(),
            snapshot_poll_interval_seconds: 0,
            idle_backoff_seconds: 1,
            max_active_symbols: 10,
            cache_backend: crate::config::CacheBackend::Memory,
            redis_url: String::new(),
            history_max_limit: 2000,
            cors_allow_origins: String::new(),
            minute_history_max_days: 7,
            special_trading_sessions: HashMap::new(),
            closed_dates: HashSet::new(),
            bind_addr: String::new(),
        }
    }

    #[tokio::test]
    async fn poller_delivers_bars_to_subscribers_and_stops() {
        let provider = AsyncProvider::new(Arc::new(ScriptedProvider::new()));
        let clock = always_open_clock();
        let hub = Arc::new(SubscriptionHub::new(10));
        let builder = BarBuilder::with_periods(Shanghai, vec![Period::M1]);
        let settings = test_settings();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        hub.subscribe(Uuid::new_v4(), &tx, "600000.SH", Period::M1)
            .unwrap();

        let poller = Arc::new(Poller::new(provider, builder, clock, hub, &settings));
        poller.start();

        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a bar event")
            .expect("channel closed before any bar event");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["op"], "bar");
        assert_eq!(value["symbol"], "600000.SH");
        assert_eq!(value["period"], "1m");
        assert!(value["bar"]["volume"].as_f64().unwrap() >= 1000.0);

        assert!(poller.is_running());
        poller.stop().await;
        assert!(!poller.is_running());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let provider = AsyncProvider::new(Arc::new(ScriptedProvider::new()));
        let clock = always_open_clock();
        let hub = Arc::new(SubscriptionHub::new(10));
        let builder = BarBuilder::with_periods(Shanghai, vec![Period::M1]);
        let settings = test_settings();

        let poller = Arc::new(Poller::new(provider, builder, clock, hub, &settings));
        poller.start();
        poller.start();
        poller.stop().await;
    }
}
