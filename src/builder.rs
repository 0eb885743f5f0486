// =============================================================================
// Bar builder: fold quote snapshots into multi-period candles
// =============================================================================
//
// The builder owns all per-(symbol, period) accumulator state and is driven
// by a single writer (the poller loop). Each snapshot batch produces an
// ordered event list; for any (symbol, period) a close event always precedes
// the first live event of the successor bucket.
//
// Upstream volume/amount figures are session-cumulative. The builder turns
// them into per-bucket increments, handling three cases per observation:
// first sighting (seed with the raw total), monotone increase (add the
// delta), and decrease, i.e. the upstream counter reset. On a reset the
// intraday buckets restart from the new total while weekly and monthly
// buckets keep adding on top, since those buckets span session resets.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::types::{Bar, Period, Snapshot};

/// A bar emission: live update or close for one (symbol, period).
pub type BarEvent = (String, Period, Bar);

// =============================================================================
// Internal accumulator state
// =============================================================================

/// The candle currently being built for one (symbol, period).
#[derive(Debug, Clone)]
struct BarState {
    bucket_start: DateTime<Tz>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    amount: f64,
    is_closed: bool,
}

impl BarState {
    fn open_at(bucket_start: DateTime<Tz>, last: f64) -> Self {
        Self {
            bucket_start,
            open: last,
            high: last,
            low: last,
            close: last,
            volume: 0.0,
            amount: 0.0,
            is_closed: false,
        }
    }

    fn to_bar(&self) -> Bar {
        Bar {
            ts: self.bucket_start.with_timezone(&Utc).timestamp_millis(),
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            amount: Some(self.amount),
            is_closed: Some(self.is_closed),
        }
    }
}

/// Per-(symbol, period) accumulator: current open bar plus the cumulative
/// baselines used to turn session totals into bucket increments.
#[derive(Debug, Default)]
struct SymbolState {
    cur_bar: Option<BarState>,
    prev_volume_total: Option<f64>,
    prev_amount_total: Option<f64>,
    last_trade_date: Option<NaiveDate>,
}

// =============================================================================
// BarBuilder
// =============================================================================

pub struct BarBuilder {
    states: HashMap<(String, Period), SymbolState>,
    tz: Tz,
    periods: Vec<Period>,
}

impl BarBuilder {
    /// Builder over all supported periods.
    pub fn new(tz: Tz) -> Self {
        Self::with_periods(tz, Period::ALL.to_vec())
    }

    pub fn with_periods(tz: Tz, periods: Vec<Period>) -> Self {
        Self {
            states: HashMap::new(),
            tz,
            periods,
        }
    }

    /// Fold one snapshot batch into the accumulators and return the bar
    /// events it produced, in snapshot-map x period iteration order.
    pub fn apply_snapshots(&mut self, snapshots: &BTreeMap<String, Snapshot>) -> Vec<BarEvent> {
        let periods = self.periods.clone();
        let tz = self.tz;
        let mut events = Vec::new();
        for (symbol, snap) in snapshots {
            for &period in &periods {
                let state = self
                    .states
                    .entry((symbol.clone(), period))
                    .or_default();
                apply_one(tz, state, symbol, period, snap, &mut events);
            }
        }
        events
    }
}

fn apply_one(
    tz: Tz,
    state: &mut SymbolState,
    symbol: &str,
    period: Period,
    snap: &Snapshot,
    events: &mut Vec<BarEvent>,
) {
    let local_ts = snap.ts.with_timezone(&tz);
    let trade_date = local_ts.date_naive();
    let Some(bucket) = bucket_start(local_ts, period) else {
        return;
    };

    // Day roll: a new trade date closes whatever is open and clears the
    // cumulative baselines so the new session seeds fresh.
    match state.last_trade_date {
        None => state.last_trade_date = Some(trade_date),
        Some(prev) if prev != trade_date => {
            if let Some(mut bar) = state.cur_bar.take() {
                bar.is_closed = true;
                events.push((symbol.to_string(), period, bar.to_bar()));
            }
            state.prev_volume_total = None;
            state.prev_amount_total = None;
            state.last_trade_date = Some(trade_date);
        }
        Some(_) => {}
    }

    // Bucket roll: close the old bar, open a new one seeded from `last`.
    let needs_new = match &state.cur_bar {
        None => true,
        Some(cur) => cur.bucket_start != bucket,
    };
    if needs_new {
        if let Some(mut bar) = state.cur_bar.take() {
            bar.is_closed = true;
            events.push((symbol.to_string(), period, bar.to_bar()));
        }
        state.cur_bar = Some(BarState::open_at(bucket, snap.last));
    }

    let SymbolState {
        cur_bar,
        prev_volume_total,
        prev_amount_total,
        ..
    } = state;
    if let Some(cur) = cur_bar.as_mut() {
        cur.high = cur.high.max(snap.last);
        cur.low = cur.low.min(snap.last);
        cur.close = snap.last;
        fold_totals(
            cur,
            prev_volume_total,
            prev_amount_total,
            snap,
            period.spans_session_resets(),
        );
        events.push((symbol.to_string(), period, cur.to_bar()));
    }
}

/// Fold the snapshot's cumulative totals into the current bar.
fn fold_totals(
    cur: &mut BarState,
    prev_volume_total: &mut Option<f64>,
    prev_amount_total: &mut Option<f64>,
    snap: &Snapshot,
    reset_add: bool,
) {
    if let Some(volume_total) = snap.volume_total {
        match *prev_volume_total {
            None => cur.volume += volume_total,
            Some(prev) if volume_total < prev => {
                let carried = if reset_add { cur.volume } else { 0.0 };
                cur.volume = carried + volume_total;
            }
            Some(prev) => cur.volume += (volume_total - prev).max(0.0),
        }
        *prev_volume_total = Some(volume_total);
    }

    if let Some(amount_total) = snap.amount_total {
        match *prev_amount_total {
            None => cur.amount += amount_total,
            Some(prev) if amount_total < prev => {
                let carried = if reset_add { cur.amount } else { 0.0 };
                cur.amount = carried + amount_total;
            }
            Some(prev) => cur.amount += (amount_total - prev).max(0.0),
        }
        *prev_amount_total = Some(amount_total);
    }
}

/// Start of the bucket containing `ts` for the given period, in the market
/// timezone. `None` only when the local wall-clock midnight/minute does not
/// exist in the timezone (DST gap), in which case the snapshot is dropped.
fn bucket_start(ts: DateTime<Tz>, period: Period) -> Option<DateTime<Tz>> {
    let tz = ts.timezone();
    let date = ts.date_naive();
    let naive = match period {
        Period::M1 | Period::M5 | Period::M15 | Period::M30 | Period::M60 => {
            let width = period.minutes().unwrap_or(1);
            let total = ts.hour() * 60 + ts.minute();
            let floored = total - total % width;
            date.and_hms_opt(floored / 60, floored % 60, 0)?
        }
        Period::D1 => date.and_hms_opt(0, 0, 0)?,
        Period::W1 => {
            let monday = date - Duration::days(ts.weekday().num_days_from_monday() as i64);
            monday.and_hms_opt(0, 0, 0)?
        }
        Period::Mo1 => date.with_day(1)?.and_hms_opt(0, 0, 0)?,
    };
    tz.from_local_datetime(&naive).earliest()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Shanghai;

    const SYM: &str = "600000.SH";

    fn shanghai_utc_ms(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> i64 {
        Shanghai
            .with_ymd_and_hms(y, m, d, hh, mm, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_millis()
    }

    fn snap_at(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32, last: f64, vol: f64) -> Snapshot {
        let ts = Shanghai
            .with_ymd_and_hms(y, m, d, hh, mm, ss)
            .single()
            .unwrap()
            .with_timezone(&Utc);
        Snapshot {
            ts,
            last,
            open: None,
            high: None,
            low: None,
            prev_close: None,
            volume_total: Some(vol),
            amount_total: None,
        }
    }

    fn batch(snap: Snapshot) -> BTreeMap<String, Snapshot> {
        let mut map = BTreeMap::new();
        map.insert(SYM.to_string(), snap);
        map
    }

    fn builder(periods: &[Period]) -> BarBuilder {
        BarBuilder::with_periods(Shanghai, periods.to_vec())
    }

    fn ohlc_sane(bar: &Bar) {
        assert!(bar.low <= bar.open && bar.open <= bar.high, "open out of range: {bar:?}");
        assert!(bar.low <= bar.close && bar.close <= bar.high, "close out of range: {bar:?}");
        assert!(bar.high >= bar.low);
        assert!(bar.volume >= 0.0);
    }

    #[test]
    fn minute_roll_closes_then_opens() {
        let mut builder = builder(&[Period::M1]);
        let bucket_0930 = shanghai_utc_ms(2024, 7, 1, 9, 30);
        let bucket_0931 = shanghai_utc_ms(2024, 7, 1, 9, 31);

        let events = builder.apply_snapshots(&batch(snap_at(2024, 7, 1, 9, 30, 20, 10.0, 1000.0)));
        assert_eq!(events.len(), 1);
        let (_, _, bar) = &events[0];
        assert_eq!(bar.ts, bucket_0930);
        assert_eq!(bar.is_closed, Some(false));
        assert_eq!(bar.volume, 1000.0); // first observation seeds the bucket

        let events = builder.apply_snapshots(&batch(snap_at(2024, 7, 1, 9, 30, 55, 10.5, 1200.0)));
        assert_eq!(events.len(), 1);
        let (_, _, bar) = &events[0];
        assert_eq!(bar.ts, bucket_0930);
        assert_eq!(bar.high, 10.5);
        assert_eq!(bar.volume, 1200.0);

        // Next minute: close for 09:30 precedes the 09:31 live bar.
        let events = builder.apply_snapshots(&batch(snap_at(2024, 7, 1, 9, 31, 1, 10.4, 1300.0)));
        assert_eq!(events.len(), 2);
        let (_, _, closed) = &events[0];
        assert_eq!(closed.ts, bucket_0930);
        assert_eq!(closed.is_closed, Some(true));
        assert_eq!(closed.open, 10.0);
        assert_eq!(closed.high, 10.5);
        assert_eq!(closed.low, 10.0);
        assert_eq!(closed.close, 10.5);
        assert_eq!(closed.volume, 1200.0);
        let (_, _, live) = &events[1];
        assert_eq!(live.ts, bucket_0931);
        assert_eq!(live.is_closed, Some(false));
        assert_eq!(live.open, 10.4);
        assert_eq!(live.volume, 100.0);
        for (_, _, bar) in &events {
            ohlc_sane(bar);
        }
    }

    #[test]
    fn day_boundary_closes_stale_bar_and_reseeds() {
        let mut builder = builder(&[Period::M1]);
        builder.apply_snapshots(&batch(snap_at(2024, 7, 1, 14, 59, 30, 11.0, 50_000.0)));

        let events = builder.apply_snapshots(&batch(snap_at(2024, 7, 2, 9, 30, 10, 11.2, 800.0)));
        assert_eq!(events.len(), 2);
        let (_, _, closed) = &events[0];
        assert_eq!(closed.ts, shanghai_utc_ms(2024, 7, 1, 14, 59));
        assert_eq!(closed.is_closed, Some(true));
        let (_, _, live) = &events[1];
        assert_eq!(live.ts, shanghai_utc_ms(2024, 7, 2, 9, 30));
        assert_eq!(live.open, 11.2);
        // Baselines were cleared, so the new day's first total seeds the bucket.
        assert_eq!(live.volume, 800.0);
    }

    #[test]
    fn cumulative_reset_replaces_for_intraday() {
        let mut builder = builder(&[Period::M5]);
        builder.apply_snapshots(&batch(snap_at(2024, 7, 1, 9, 31, 0, 10.0, 5000.0)));
        // Reset within the same bucket and day: intraday restarts from the
        // new total.
        let events = builder.apply_snapshots(&batch(snap_at(2024, 7, 1, 9, 32, 0, 10.1, 200.0)));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].2.volume, 200.0);
    }

    #[test]
    fn cumulative_reset_accumulates_for_weekly_and_monthly() {
        for period in [Period::W1, Period::Mo1] {
            let mut builder = builder(&[period]);
            builder.apply_snapshots(&batch(snap_at(2024, 7, 1, 9, 31, 0, 10.0, 5000.0)));
            let events =
                builder.apply_snapshots(&batch(snap_at(2024, 7, 1, 9, 32, 0, 10.1, 200.0)));
            assert_eq!(events.len(), 1, "period {period}");
            // The bucket spans the reset: pre-decrease figure plus new total.
            assert_eq!(events[0].2.volume, 5200.0, "period {period}");
        }
    }

    #[test]
    fn monotone_increase_adds_exact_delta() {
        let mut builder = builder(&[Period::D1]);
        builder.apply_snapshots(&batch(snap_at(2024, 7, 1, 9, 31, 0, 10.0, 1000.0)));
        let before = builder
            .apply_snapshots(&batch(snap_at(2024, 7, 1, 9, 32, 0, 10.0, 1450.0)))
            .remove(0)
            .2
            .volume;
        let after = builder
            .apply_snapshots(&batch(snap_at(2024, 7, 1, 9, 33, 0, 10.0, 1700.0)))
            .remove(0)
            .2
            .volume;
        assert_eq!(after - before, 250.0);
    }

    #[test]
    fn bucket_alignment_per_period() {
        // 2024-07-03 is a Wednesday; its ISO week starts Monday 2024-07-01.
        let mut builder = builder(&[Period::M15, Period::D1, Period::W1, Period::Mo1]);
        let events = builder.apply_snapshots(&batch(snap_at(2024, 7, 3, 10, 47, 12, 10.0, 10.0)));
        let ts_by_period: BTreeMap<Period, i64> =
            events.iter().map(|(_, p, b)| (*p, b.ts)).collect();
        assert_eq!(ts_by_period[&Period::M15], shanghai_utc_ms(2024, 7, 3, 10, 45));
        assert_eq!(ts_by_period[&Period::D1], shanghai_utc_ms(2024, 7, 3, 0, 0));
        assert_eq!(ts_by_period[&Period::W1], shanghai_utc_ms(2024, 7, 1, 0, 0));
        assert_eq!(ts_by_period[&Period::Mo1], shanghai_utc_ms(2024, 7, 1, 0, 0));
    }

    #[test]
    fn amount_folds_like_volume() {
        let mut builder = builder(&[Period::M1]);
        let mut snap = snap_at(2024, 7, 1, 9, 30, 5, 10.0, 100.0);
        snap.amount_total = Some(1000.0);
        builder.apply_snapshots(&batch(snap));

        let mut snap = snap_at(2024, 7, 1, 9, 30, 40, 10.2, 150.0);
        snap.amount_total = Some(1600.0);
        let events = builder.apply_snapshots(&batch(snap));
        assert_eq!(events[0].2.amount, Some(1600.0));
        assert_eq!(events[0].2.volume, 150.0);
    }

    #[test]
    fn closure_is_monotone_per_key() {
        let mut builder = builder(&[Period::M1]);
        let mut closes: Vec<i64> = Vec::new();
        let mut lives: Vec<i64> = Vec::new();
        for (mm, ss) in [(30, 10), (30, 40), (31, 10), (32, 5), (32, 50), (33, 2)] {
            let events =
                builder.apply_snapshots(&batch(snap_at(2024, 7, 1, 9, mm, ss, 10.0, 100.0)));
            for (_, _, bar) in events {
                ohlc_sane(&bar);
                if bar.is_closed == Some(true) {
                    // No close may revisit an already-closed bucket.
                    assert!(closes.last().map_or(true, |prev| bar.ts > *prev));
                    closes.push(bar.ts);
                } else {
                    assert!(lives.last().map_or(true, |prev| bar.ts >= *prev));
                    lives.push(bar.ts);
                }
            }
        }
        assert_eq!(closes.len(), 3);
    }

    #[test]
    fn multiple_symbols_emit_in_map_order() {
        let mut builder = builder(&[Period::M1]);
        let mut map = BTreeMap::new();
        map.insert("600000.SH".to_string(), snap_at(2024, 7, 1, 9, 30, 10, 10.0, 1.0));
        map.insert("000001.SZ".to_string(), snap_at(2024, 7, 1, 9, 30, 10, 20.0, 2.0));
        let events = builder.apply_snapshots(&map);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "000001.SZ");
        assert_eq!(events[1].0, "600000.SH");
    }

    #[test]
    fn snapshot_without_totals_keeps_volume_zero() {
        let mut builder = builder(&[Period::M1]);
        let mut snap = snap_at(2024, 7, 1, 9, 30, 10, 10.0, 0.0);
        snap.volume_total = None;
        snap.amount_total = None;
        let events = builder.apply_snapshots(&batch(snap));
        assert_eq!(events[0].2.volume, 0.0);
        assert_eq!(events[0].2.amount, Some(0.0));
    }
}
