// =============================================================================
// Shared wire types: bars, snapshots, periods, WebSocket envelopes
// =============================================================================

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// Period
// =============================================================================

/// Canonical candle period tokens: `1m 5m 15m 30m 60m 1d 1w 1M`.
///
/// Parsing is strict; anything else is rejected at the edge (WebSocket
/// subscribe, history query) so the rest of the pipeline only ever sees
/// valid periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Period {
    M1,
    M5,
    M15,
    M30,
    M60,
    D1,
    W1,
    Mo1,
}

impl Period {
    /// Every supported period, in builder iteration order.
    pub const ALL: [Period; 8] = [
        Period::M1,
        Period::M5,
        Period::M15,
        Period::M30,
        Period::M60,
        Period::D1,
        Period::W1,
        Period::Mo1,
    ];

    pub fn parse(token: &str) -> Option<Period> {
        match token {
            "1m" => Some(Period::M1),
            "5m" => Some(Period::M5),
            "15m" => Some(Period::M15),
            "30m" => Some(Period::M30),
            "60m" => Some(Period::M60),
            "1d" => Some(Period::D1),
            "1w" => Some(Period::W1),
            "1M" => Some(Period::Mo1),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::M1 => "1m",
            Period::M5 => "5m",
            Period::M15 => "15m",
            Period::M30 => "30m",
            Period::M60 => "60m",
            Period::D1 => "1d",
            Period::W1 => "1w",
            Period::Mo1 => "1M",
        }
    }

    /// Bucket width in minutes for intraday periods.
    pub fn minutes(&self) -> Option<u32> {
        match self {
            Period::M1 => Some(1),
            Period::M5 => Some(5),
            Period::M15 => Some(15),
            Period::M30 => Some(30),
            Period::M60 => Some(60),
            _ => None,
        }
    }

    pub fn is_minute(&self) -> bool {
        self.minutes().is_some()
    }

    /// Periods served from the daily history feed (`1d` plus its rollups).
    pub fn is_daily(&self) -> bool {
        matches!(self, Period::D1 | Period::W1 | Period::Mo1)
    }

    /// Weekly and monthly buckets keep accumulating across upstream
    /// session-counter resets instead of restarting from the new total.
    pub fn spans_session_resets(&self) -> bool {
        matches!(self, Period::W1 | Period::Mo1)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Period::parse(&token)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown period '{token}'")))
    }
}

// =============================================================================
// Market data model
// =============================================================================

/// Identity of a tradable instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    /// Canonical symbol: 6-digit code plus market suffix, e.g. `600000.SH`.
    pub symbol: String,
    pub name: String,
    pub exchange: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub currency: String,
    pub timezone: String,
}

/// Instantaneous quote observation with session-cumulative totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub ts: DateTime<Utc>,
    pub last: f64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub prev_close: Option<f64>,
    /// Cumulative traded volume since session open.
    pub volume_total: Option<f64>,
    /// Cumulative turnover since session open.
    pub amount_total: Option<f64>,
}

/// An OHLCV candle. `ts` is UTC milliseconds at bucket start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub amount: Option<f64>,
    pub is_closed: Option<bool>,
}

// =============================================================================
// HTTP responses
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub symbol: String,
    pub period: Period,
    pub items: Vec<Bar>,
    pub next_from: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolSearchResponse {
    pub items: Vec<SymbolInfo>,
}

// =============================================================================
// WebSocket protocol
// =============================================================================

/// Inbound client message. Anything that fails to deserialize into this
/// shape gets an `error` event back and the connection stays open.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe { symbol: String, period: Period },
    Unsubscribe { symbol: String, period: Period },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// Outbound server message, tagged by `op`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        symbol: String,
        period: Period,
    },
    Bar {
        symbol: String,
        period: Period,
        bar: Bar,
    },
    Status {
        message: String,
        level: StatusLevel,
        code: Option<String>,
    },
    Error {
        reason: String,
    },
}

impl ServerMessage {
    pub fn status(message: impl Into<String>, level: StatusLevel, code: Option<&str>) -> Self {
        ServerMessage::Status {
            message: message.into(),
            level,
            code: code.map(str::to_string),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
