// =============================================================================
// Gateway configuration loaded from the environment
// =============================================================================
//
// Every knob has a default, so a bare environment starts a working gateway.
// Structural problems (unknown timezone, malformed TRADING_SESSIONS, bad
// CACHE_BACKEND) are fatal at startup; per-entry problems in the optional
// maps (SPECIAL_TRADING_SESSIONS, CLOSED_DATES) are logged and skipped so a
// single typo cannot keep the gateway down.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use tracing::warn;

/// A contiguous local time-of-day window during which the market trades.
/// Both endpoints are inclusive.
pub type Session = (NaiveTime, NaiveTime);

// =============================================================================
// Cache backend selection
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis,
}

impl fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheBackend::Memory => write!(f, "memory"),
            CacheBackend::Redis => write!(f, "redis"),
        }
    }
}

impl FromStr for CacheBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "memory" => Ok(CacheBackend::Memory),
            "redis" => Ok(CacheBackend::Redis),
            other => bail!("unknown cache backend '{other}' (expected 'memory' or 'redis')"),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone)]
pub struct Settings {
    /// Market timezone all bucket math happens in.
    pub timezone: Tz,
    /// Default daily trading sessions.
    pub trading_sessions: Vec<Session>,
    pub snapshot_poll_interval_seconds: u64,
    pub idle_backoff_seconds: u64,
    /// Cap on distinct symbols the hub will accept subscriptions for.
    pub max_active_symbols: usize,
    pub cache_backend: CacheBackend,
    pub redis_url: String,
    pub history_max_limit: usize,
    pub cors_allow_origins: String,
    /// Widest minute-history window served in one request.
    pub minute_history_max_days: i64,
    /// Per-date session overrides (half-day holidays and the like).
    pub special_trading_sessions: HashMap<NaiveDate, Vec<Session>>,
    /// Dates the market is closed regardless of calendar or weekday.
    pub closed_dates: HashSet<NaiveDate>,
    pub bind_addr: String,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Settings> {
        let tz_name = env_or("TIMEZONE", "Asia/Shanghai");
        let timezone: Tz = tz_name
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid TIMEZONE '{tz_name}': {e}"))?;

        let trading_sessions = parse_sessions(&env_or("TRADING_SESSIONS", "09:30-11:30,13:00-15:00"))
            .context("invalid TRADING_SESSIONS")?;

        Ok(Settings {
            timezone,
            trading_sessions,
            snapshot_poll_interval_seconds: env_parsed("SNAPSHOT_POLL_INTERVAL_SECONDS", 3)?,
            idle_backoff_seconds: env_parsed("IDLE_BACKOFF_SECONDS", 30)?,
            max_active_symbols: env_parsed("MAX_ACTIVE_SYMBOLS", 200)?,
            cache_backend: env_or("CACHE_BACKEND", "memory")
                .parse()
                .context("invalid CACHE_BACKEND")?,
            redis_url: env_or("REDIS_URL", "redis://localhost:6379/0"),
            history_max_limit: env_parsed("HISTORY_MAX_LIMIT", 2000)?,
            cors_allow_origins: env_or("CORS_ALLOW_ORIGINS", "http://127.0.0.1:5173"),
            minute_history_max_days: env_parsed("MINUTE_HISTORY_MAX_DAYS", 7)?,
            special_trading_sessions: parse_special_sessions(&env_or(
                "SPECIAL_TRADING_SESSIONS",
                "",
            )),
            closed_dates: parse_closed_dates(&env_or("CLOSED_DATES", "")),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8000"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid {key} value '{raw}'")),
        Err(_) => Ok(default),
    }
}

// =============================================================================
// Parsers
// =============================================================================

/// Parse `"HH:MM-HH:MM,HH:MM-HH:MM"` into session windows.
pub fn parse_sessions(value: &str) -> Result<Vec<Session>> {
    let mut sessions = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (start_s, end_s) = part
            .split_once('-')
            .with_context(|| format!("session '{part}' is not of the form HH:MM-HH:MM"))?;
        let start = parse_hhmm(start_s.trim())?;
        let end = parse_hhmm(end_s.trim())?;
        sessions.push((start, end));
    }
    Ok(sessions)
}

fn parse_hhmm(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").with_context(|| format!("invalid time '{value}'"))
}

/// Parse the `SPECIAL_TRADING_SESSIONS` JSON map (`date -> session string`).
/// Invalid JSON or invalid entries degrade to an empty/partial map with a
/// warning; the default sessions keep applying for those dates.
pub fn parse_special_sessions(value: &str) -> HashMap<NaiveDate, Vec<Session>> {
    let value = value.trim();
    if value.is_empty() {
        return HashMap::new();
    }
    let raw: HashMap<String, String> = match serde_json::from_str(value) {
        Ok(map) => map,
        Err(e) => {
            warn!(error = %e, "invalid SPECIAL_TRADING_SESSIONS, ignoring");
            return HashMap::new();
        }
    };
    let mut out = HashMap::new();
    for (date_s, session_s) in raw {
        let date = match NaiveDate::parse_from_str(&date_s, "%Y-%m-%d") {
            Ok(date) => date,
            Err(e) => {
                warn!(date = %date_s, error = %e, "skipping special session with bad date");
                continue;
            }
        };
        match parse_sessions(&session_s) {
            Ok(sessions) => {
                out.insert(date, sessions);
            }
            Err(e) => {
                warn!(date = %date_s, error = %e, "skipping special session with bad windows");
            }
        }
    }
    out
}

/// Parse the `CLOSED_DATES` CSV of ISO dates. Bad entries are skipped.
pub fn parse_closed_dates(value: &str) -> HashSet<NaiveDate> {
    let mut out = HashSet::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match NaiveDate::parse_from_str(part, "%Y-%m-%d") {
            Ok(date) => {
                out.insert(date);
            }
            Err(e) => warn!(date = %part, error = %e, "skipping invalid closed date"),
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn parse_default_sessions() {
        let sessions = parse_sessions("09:30-11:30,13:00-15:00").unwrap();
        assert_eq!(sessions, vec![(t(9, 30), t(11, 30)), (t(13, 0), t(15, 0))]);
    }

    #[test]
    fn parse_sessions_tolerates_whitespace_and_empties() {
        let sessions = parse_sessions(" 09:30-11:30 , ,13:00-15:00,").unwrap();
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn parse_sessions_rejects_garbage() {
        assert!(parse_sessions("09:30").is_err());
        assert!(parse_sessions("9am-3pm").is_err());
        assert!(parse_sessions("09:30-25:00").is_err());
    }

    #[test]
    fn special_sessions_parse_and_degrade() {
        let map = parse_special_sessions(r#"{"2024-12-24":"09:30-12:00","bogus":"09:30-12:00"}"#);
        let date = NaiveDate::from_ymd_opt(2024, 12, 24).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&date], vec![(t(9, 30), t(12, 0))]);
        assert!(parse_special_sessions("not json").is_empty());
        assert!(parse_special_sessions("").is_empty());
    }

    #[test]
    fn closed_dates_parse() {
        let dates = parse_closed_dates("2024-10-01, 2024-10-02,,nonsense");
        assert_eq!(dates.len(), 2);
        assert!(dates.contains(&NaiveDate::from_ymd_opt(2024, 10, 1).unwrap()));
    }

    #[test]
    fn cache_backend_parse() {
        assert_eq!("memory".parse::<CacheBackend>().unwrap(), CacheBackend::Memory);
        assert_eq!("redis".parse::<CacheBackend>().unwrap(), CacheBackend::Redis);
        assert!("memcached".parse::<CacheBackend>().is_err());
    }
}
