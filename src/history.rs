// =============================================================================
// History aggregation: weekly/monthly rollups and the sparse-minute fallback
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::debug;

use crate::provider::AsyncProvider;
use crate::types::{Bar, Period};

/// Roll daily bars up into weekly (ISO Monday anchor) or monthly
/// (first-of-month anchor) bars; `1d` passes through untouched.
///
/// Group rule: open from the earliest bar, close from the latest, high/low
/// as extremes, volume and amount as sums; `ts` is the bucket's local
/// midnight in UTC milliseconds. Output is sorted by bucket ascending.
pub fn aggregate_bars(items: &[Bar], period: Period, tz: Tz) -> Vec<Bar> {
    if !matches!(period, Period::W1 | Period::Mo1) {
        return items.to_vec();
    }

    let mut buckets: BTreeMap<NaiveDate, Vec<&Bar>> = BTreeMap::new();
    for bar in items {
        let Some(local) = Utc
            .timestamp_millis_opt(bar.ts)
            .single()
            .map(|dt| dt.with_timezone(&tz))
        else {
            continue;
        };
        let date = local.date_naive();
        let anchor = match period {
            Period::W1 => date - Duration::days(local.weekday().num_days_from_monday() as i64),
            _ => match date.with_day(1) {
                Some(first) => first,
                None => continue,
            },
        };
        buckets.entry(anchor).or_default().push(bar);
    }

    let mut aggregated = Vec::with_capacity(buckets.len());
    for (anchor, mut group) in buckets {
        group.sort_by_key(|bar| bar.ts);
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let Some(bucket_start) = anchor
            .and_hms_opt(0, 0, 0)
            .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        else {
            continue;
        };
        aggregated.push(Bar {
            ts: bucket_start.with_timezone(&Utc).timestamp_millis(),
            open: first.open,
            close: last.close,
            high: group.iter().map(|b| b.high).fold(f64::MIN, f64::max),
            low: group.iter().map(|b| b.low).fold(f64::MAX, f64::min),
            volume: group.iter().map(|b| b.volume).sum(),
            amount: Some(group.iter().map(|b| b.amount.unwrap_or(0.0)).sum()),
            is_closed: Some(true),
        });
    }
    aggregated
}

/// When a minute-history request comes back empty (the window fell on a
/// holiday stretch, or the upstream trimmed it), retry with the most recent
/// trading day at or before the requested end: 09:30-15:00 market time.
/// Without a calendar there is nothing to anchor on, so return empty.
pub async fn fallback_recent_minute_history(
    provider: &AsyncProvider,
    symbol: &str,
    period: Period,
    end: DateTime<Utc>,
    tz: Tz,
) -> Vec<Bar> {
    let calendar = match provider.get_trading_calendar().await {
        Ok(calendar) => calendar,
        Err(e) => {
            debug!(error = %e, "calendar unavailable for minute fallback");
            return Vec::new();
        }
    };
    let target = end.with_timezone(&tz).date_naive();
    let Some(last_day) = calendar.range(..=target).next_back().copied() else {
        return Vec::new();
    };

    let window = |h: u32, m: u32| {
        last_day
            .and_hms_opt(h, m, 0)
            .and_then(|naive| tz.from_local_datetime(&naive).earliest())
            .map(|local| local.with_timezone(&Utc))
    };
    let (Some(day_start), Some(day_end)) = (window(9, 30), window(15, 0)) else {
        return Vec::new();
    };

    debug!(symbol, %period, day = %last_day, "minute history fallback to last trading day");
    provider
        .get_minute_history(symbol.to_string(), period, day_start, day_end)
        .await
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Shanghai;

    fn daily_bar(y: i32, m: u32, d: u32, open: f64, close: f64, volume: f64) -> Bar {
        let ts = Shanghai
            .with_ymd_and_hms(y, m, d, 0, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_millis();
        Bar {
            ts,
            open,
            high: open.max(close) + 0.5,
            low: open.min(close) - 0.5,
            close,
            volume,
            amount: Some(volume * close),
            is_closed: Some(true),
        }
    }

    #[test]
    fn weekly_rollup_of_one_week() {
        // Mon 2024-07-01 .. Fri 2024-07-05, closes 10,11,9,12,13.
        let days = [
            daily_bar(2024, 7, 1, 10.0, 10.0, 1.0),
            daily_bar(2024, 7, 2, 10.0, 11.0, 1.0),
            daily_bar(2024, 7, 3, 11.0, 9.0, 1.0),
            daily_bar(2024, 7, 4, 9.0, 12.0, 1.0),
            daily_bar(2024, 7, 5, 12.0, 13.0, 1.0),
        ];
        let weekly = aggregate_bars(&days, Period::W1, Shanghai);
        assert_eq!(weekly.len(), 1);
        let bar = &weekly[0];
        assert_eq!(bar.open, 10.0);
        assert_eq!(bar.close, 13.0);
        assert_eq!(bar.high, 13.5);
        assert_eq!(bar.low, 8.5);
        assert_eq!(bar.volume, 5.0);
        assert_eq!(bar.is_closed, Some(true));
        let monday = Shanghai
            .with_ymd_and_hms(2024, 7, 1, 0, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_millis();
        assert_eq!(bar.ts, monday);
    }

    #[test]
    fn weekly_rollup_splits_across_weeks() {
        // Fri 2024-06-28 belongs to the prior ISO week.
        let days = [
            daily_bar(2024, 6, 28, 9.0, 9.5, 2.0),
            daily_bar(2024, 7, 1, 10.0, 10.5, 1.0),
            daily_bar(2024, 7, 2, 10.5, 11.0, 1.0),
        ];
        let weekly = aggregate_bars(&days, Period::W1, Shanghai);
        assert_eq!(weekly.len(), 2);
        assert!(weekly[0].ts < weekly[1].ts);
        assert_eq!(weekly[0].volume, 2.0);
        assert_eq!(weekly[1].volume, 2.0);
    }

    #[test]
    fn monthly_rollup_anchors_first_of_month() {
        let days = [
            daily_bar(2024, 6, 27, 9.0, 9.5, 1.0),
            daily_bar(2024, 6, 28, 9.5, 9.8, 1.0),
            daily_bar(2024, 7, 1, 10.0, 10.5, 1.0),
        ];
        let monthly = aggregate_bars(&days, Period::Mo1, Shanghai);
        assert_eq!(monthly.len(), 2);
        let june_start = Shanghai
            .with_ymd_and_hms(2024, 6, 1, 0, 0, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_millis();
        assert_eq!(monthly[0].ts, june_start);
        assert_eq!(monthly[0].open, 9.0);
        assert_eq!(monthly[0].close, 9.8);
    }

    #[test]
    fn aggregation_sums_missing_amount_as_zero() {
        let mut a = daily_bar(2024, 7, 1, 10.0, 10.0, 1.0);
        a.amount = None;
        let b = daily_bar(2024, 7, 2, 10.0, 11.0, 1.0);
        let expected = b.amount.unwrap();
        let weekly = aggregate_bars(&[a, b], Period::W1, Shanghai);
        assert_eq!(weekly[0].amount, Some(expected));
    }

    #[test]
    fn daily_passes_through() {
        let days = [daily_bar(2024, 7, 1, 10.0, 10.5, 1.0)];
        let out = aggregate_bars(&days, Period::D1, Shanghai);
        assert_eq!(out, days.to_vec());
    }

    #[test]
    fn empty_input_aggregates_to_empty() {
        assert!(aggregate_bars(&[], Period::W1, Shanghai).is_empty());
    }
}
