// =============================================================================
// Eastmoney provider: A-share quotes over the push2 HTTP JSON APIs
// =============================================================================
//
// Endpoints:
//   - push2  /api/qt/clist/get           spot snapshot table + symbol directory
//   - push2his /api/qt/stock/kline/get   daily and minute klines
//
// Kline rows come back as CSV strings `date,open,close,high,low,volume,amount`
// inside a JSON envelope. The trading calendar is derived from the SSE
// composite index daily series: a date with a daily bar is a trading day.
// The symbol directory and the calendar change at most daily, so both sit
// behind a 24 h in-process cache.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cache::MemoryCache;
use crate::provider::MarketDataProvider;
use crate::types::{Bar, Period, Snapshot, SymbolInfo};

const PUSH2_BASE: &str = "https://push2.eastmoney.com";
const PUSH2HIS_BASE: &str = "https://push2his.eastmoney.com";

/// clist market filter covering SSE, SZSE and BSE equities.
const A_SHARE_FILTER: &str = "m:0+t:6,m:0+t:80,m:1+t:2,m:1+t:23,m:0+t:81+s:2048";

/// secid of the SSE composite index, the calendar anchor series.
const CALENDAR_ANCHOR: &str = "1.000001";
/// First session of the anchor series.
const CALENDAR_EPOCH: &str = "19901219";

const SYMBOLS_CACHE_KEY: &str = "symbols";
const CALENDAR_CACHE_KEY: &str = "trading_calendar";

#[derive(Debug, Clone)]
pub struct EastmoneyConfig {
    pub symbols_ttl: Duration,
    pub calendar_ttl: Duration,
    pub http_timeout: Duration,
}

impl Default for EastmoneyConfig {
    fn default() -> Self {
        Self {
            symbols_ttl: Duration::from_secs(24 * 60 * 60),
            calendar_ttl: Duration::from_secs(24 * 60 * 60),
            http_timeout: Duration::from_secs(10),
        }
    }
}

pub struct EastmoneyProvider {
    http: reqwest::blocking::Client,
    tz: Tz,
    config: EastmoneyConfig,
    symbols_cache: MemoryCache<Vec<SymbolInfo>>,
    calendar_cache: MemoryCache<BTreeSet<NaiveDate>>,
}

impl EastmoneyProvider {
    pub fn new(tz: Tz, config: EastmoneyConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            tz,
            config,
            symbols_cache: MemoryCache::new(),
            calendar_cache: MemoryCache::new(),
        })
    }

    fn fetch_klines(&self, secid: &str, klt: u32, beg: &str, end: &str) -> Result<Vec<String>> {
        let url = format!("{PUSH2HIS_BASE}/api/qt/stock/kline/get");
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("secid", secid),
                ("klt", &klt.to_string()),
                ("fqt", "0"),
                ("beg", beg),
                ("end", end),
                ("fields1", "f1,f2,f3,f4,f5,f6"),
                ("fields2", "f51,f52,f53,f54,f55,f56,f57"),
            ])
            .send()
            .with_context(|| format!("kline request failed for {secid}"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("kline request for {secid} returned {status}");
        }
        let envelope: KlineEnvelope = resp
            .json()
            .with_context(|| format!("failed to parse kline response for {secid}"))?;
        Ok(envelope.data.map(|d| d.klines).unwrap_or_default())
    }

    fn fetch_spot_table(&self, fields: &str) -> Result<Vec<serde_json::Value>> {
        let url = format!("{PUSH2_BASE}/api/qt/clist/get");
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("pn", "1"),
                ("pz", "10000"),
                ("po", "0"),
                ("np", "1"),
                ("fltt", "2"),
                ("invt", "2"),
                ("fid", "f12"),
                ("fs", A_SHARE_FILTER),
                ("fields", fields),
            ])
            .send()
            .context("spot table request failed")?;

        let status = resp.status();
        if !status.is_success() {
            bail!("spot table request returned {status}");
        }
        let body: serde_json::Value = resp.json().context("failed to parse spot table")?;
        let diff = &body["data"]["diff"];
        // The API serves the row set as an array or, on some mirrors, as an
        // object keyed by row index.
        let rows = match diff {
            serde_json::Value::Array(rows) => rows.clone(),
            serde_json::Value::Object(map) => map.values().cloned().collect(),
            _ => Vec::new(),
        };
        Ok(rows)
    }

    fn load_symbols(&self) -> Result<Vec<SymbolInfo>> {
        if let Some(cached) = self.symbols_cache.get(SYMBOLS_CACHE_KEY) {
            return Ok(cached);
        }
        let rows = self.fetch_spot_table("f12,f14")?;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(code) = row["f12"].as_str() else {
                continue;
            };
            let name = row["f14"].as_str().unwrap_or_default();
            let symbol = internal_symbol(code);
            items.push(SymbolInfo {
                exchange: exchange_for_symbol(&symbol).to_string(),
                symbol,
                name: name.to_string(),
                kind: "stock".to_string(),
                currency: "CNY".to_string(),
                timezone: self.tz.name().to_string(),
            });
        }
        debug!(count = items.len(), "symbol directory loaded");
        self.symbols_cache
            .set(SYMBOLS_CACHE_KEY, items.clone(), self.config.symbols_ttl);
        Ok(items)
    }
}

impl MarketDataProvider for EastmoneyProvider {
    fn search_symbols(&self, q: &str, limit: usize) -> Result<Vec<SymbolInfo>> {
        if q.is_empty() {
            return Ok(Vec::new());
        }
        let symbols = self.load_symbols()?;
        let q_lower = q.to_lowercase();
        Ok(symbols
            .into_iter()
            .filter(|item| item.symbol.to_lowercase().contains(&q_lower) || item.name.contains(q))
            .take(limit)
            .collect())
    }

    fn get_daily_history(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>> {
        let rows = self.fetch_klines(
            &secid(symbol)?,
            101,
            &start.format("%Y%m%d").to_string(),
            &end.format("%Y%m%d").to_string(),
        )?;
        rows.iter()
            .map(|row| parse_kline_row(row, self.tz))
            .collect()
    }

    fn get_minute_history(
        &self,
        symbol: &str,
        period: Period,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let Some(klt) = period.minutes() else {
            bail!("minute period expected, got {period}");
        };
        let beg = start.with_timezone(&self.tz).format("%Y%m%d").to_string();
        let fin = end.with_timezone(&self.tz).format("%Y%m%d").to_string();
        let rows = self.fetch_klines(&secid(symbol)?, klt, &beg, &fin)?;

        // The endpoint filters by date only; trim to the requested window.
        let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
        let mut bars = Vec::with_capacity(rows.len());
        for row in &rows {
            let bar = parse_kline_row(row, self.tz)?;
            if bar.ts >= start_ms && bar.ts <= end_ms {
                bars.push(bar);
            }
        }
        Ok(bars)
    }

    fn get_realtime_snapshot_batch(
        &self,
        symbols: &[String],
    ) -> Result<BTreeMap<String, Snapshot>> {
        if symbols.is_empty() {
            return Ok(BTreeMap::new());
        }
        let rows = self.fetch_spot_table("f2,f5,f6,f12,f15,f16,f17,f18")?;
        let now = Utc::now();
        let wanted: BTreeSet<&str> = symbols.iter().map(String::as_str).collect();
        let mut out = BTreeMap::new();
        for row in &rows {
            let Some(code) = row["f12"].as_str() else {
                continue;
            };
            let symbol = internal_symbol(code);
            if !wanted.contains(symbol.as_str()) {
                continue;
            }
            // Suspended instruments report "-" for every quote field.
            let Some(last) = field_f64(row, "f2") else {
                continue;
            };
            out.insert(
                symbol,
                Snapshot {
                    ts: now,
                    last,
                    open: field_f64(row, "f17"),
                    high: field_f64(row, "f15"),
                    low: field_f64(row, "f16"),
                    prev_close: field_f64(row, "f18"),
                    volume_total: field_f64(row, "f5"),
                    amount_total: field_f64(row, "f6"),
                },
            );
        }
        if out.len() < wanted.len() {
            debug!(
                requested = wanted.len(),
                returned = out.len(),
                "spot table missing some requested symbols"
            );
        }
        Ok(out)
    }

    fn get_trading_calendar(&self) -> Result<BTreeSet<NaiveDate>> {
        if let Some(cached) = self.calendar_cache.get(CALENDAR_CACHE_KEY) {
            return Ok(cached);
        }
        let rows = self.fetch_klines(CALENDAR_ANCHOR, 101, CALENDAR_EPOCH, "20500101")?;
        let mut dates = BTreeSet::new();
        for row in &rows {
            let Some(date_s) = row.split(',').next() else {
                continue;
            };
            match NaiveDate::parse_from_str(date_s, "%Y-%m-%d") {
                Ok(date) => {
                    dates.insert(date);
                }
                Err(e) => warn!(row = %row, error = %e, "skipping unparseable calendar row"),
            }
        }
        self.calendar_cache
            .set(CALENDAR_CACHE_KEY, dates.clone(), self.config.calendar_ttl);
        Ok(dates)
    }
}

// =============================================================================
// Row and symbol helpers
// =============================================================================

#[derive(Deserialize)]
struct KlineEnvelope {
    data: Option<KlineData>,
}

#[derive(Deserialize)]
struct KlineData {
    #[serde(default)]
    klines: Vec<String>,
}

/// Map a bare 6-digit code to the canonical suffixed symbol.
fn internal_symbol(code: &str) -> String {
    match code.as_bytes().first() {
        Some(b'6') | Some(b'9') => format!("{code}.SH"),
        Some(b'4') | Some(b'8') => format!("{code}.BJ"),
        _ => format!("{code}.SZ"),
    }
}

fn exchange_for_symbol(symbol: &str) -> &'static str {
    if symbol.ends_with(".SH") {
        "SSE"
    } else if symbol.ends_with(".SZ") {
        "SZSE"
    } else if symbol.ends_with(".BJ") {
        "BSE"
    } else {
        ""
    }
}

/// Eastmoney security id: `{market}.{code}` with market 1 for SSE, 0 for
/// SZSE and BSE.
fn secid(symbol: &str) -> Result<String> {
    let (code, suffix) = symbol
        .split_once('.')
        .with_context(|| format!("symbol '{symbol}' missing market suffix"))?;
    let market = match suffix {
        "SH" => 1,
        "SZ" | "BJ" => 0,
        other => bail!("unknown market suffix '{other}' in symbol '{symbol}'"),
    };
    Ok(format!("{market}.{code}"))
}

/// Parse one kline CSV row: `date,open,close,high,low,volume,amount`. The
/// leading field is a date for daily rows and a minute timestamp for minute
/// rows; both map to UTC milliseconds in the market timezone.
fn parse_kline_row(row: &str, tz: Tz) -> Result<Bar> {
    let fields: Vec<&str> = row.split(',').collect();
    if fields.len() < 7 {
        bail!("kline row has {} fields, expected 7: '{row}'", fields.len());
    }
    let naive = parse_row_timestamp(fields[0])
        .with_context(|| format!("bad timestamp in kline row '{row}'"))?;
    let local = tz
        .from_local_datetime(&naive)
        .earliest()
        .with_context(|| format!("timestamp '{}' does not exist in {}", fields[0], tz.name()))?;

    let num = |idx: usize| -> Result<f64> {
        fields[idx]
            .parse::<f64>()
            .with_context(|| format!("bad numeric field {idx} in kline row '{row}'"))
    };

    Ok(Bar {
        ts: local.with_timezone(&Utc).timestamp_millis(),
        open: num(1)?,
        close: num(2)?,
        high: num(3)?,
        low: num(4)?,
        volume: num(5)?,
        amount: Some(num(6)?),
        is_closed: Some(true),
    })
}

fn parse_row_timestamp(value: &str) -> Result<NaiveDateTime> {
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(dt);
        }
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("unrecognized kline timestamp '{value}'"))?;
    date.and_hms_opt(0, 0, 0)
        .context("midnight out of range")
}

/// Quote fields arrive as numbers, or as "-" strings when suspended.
fn field_f64(row: &serde_json::Value, key: &str) -> Option<f64> {
    match &row[key] {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
