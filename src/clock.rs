// =============================================================================
// Trading clock: sessions + calendar + closed dates
// =============================================================================
//
// Answers "is the market trading right now?". The authoritative trading-day
// calendar arrives later (from the provider) and is installed atomically;
// until then the weekday rule applies. Closed dates always win.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;

use crate::config::Session;

pub struct TradingClock {
    tz: Tz,
    sessions: Vec<Session>,
    special_sessions: HashMap<NaiveDate, Vec<Session>>,
    closed_dates: HashSet<NaiveDate>,
    calendar: RwLock<Option<HashSet<NaiveDate>>>,
}

impl TradingClock {
    pub fn new(
        tz: Tz,
        sessions: Vec<Session>,
        special_sessions: HashMap<NaiveDate, Vec<Session>>,
        closed_dates: HashSet<NaiveDate>,
    ) -> Self {
        Self {
            tz,
            sessions,
            special_sessions,
            closed_dates,
            calendar: RwLock::new(None),
        }
    }

    /// Current wall-clock time in the market timezone.
    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.tz)
    }

    /// A date trades when it is not explicitly closed and either the
    /// authoritative calendar contains it or, with no calendar loaded yet,
    /// it falls on a weekday.
    pub fn is_trading_day(&self, dt: &DateTime<Tz>) -> bool {
        let date = dt.date_naive();
        if self.closed_dates.contains(&date) {
            return false;
        }
        match self.calendar.read().as_ref() {
            Some(calendar) => calendar.contains(&date),
            None => dt.weekday().num_days_from_monday() < 5,
        }
    }

    /// Trading day plus local time-of-day inside a session window
    /// (endpoints inclusive). A per-date override replaces the default
    /// sessions entirely for that date.
    pub fn is_trading_time(&self, dt: &DateTime<Tz>) -> bool {
        if !self.is_trading_day(dt) {
            return false;
        }
        let time = dt.time();
        let sessions = self
            .special_sessions
            .get(&dt.date_naive())
            .unwrap_or(&self.sessions);
        sessions.iter().any(|(start, end)| *start <= time && time <= *end)
    }

    /// Install the authoritative trading-day calendar.
    pub fn update_calendar(&self, calendar: HashSet<NaiveDate>) {
        *self.calendar.write() = Some(calendar);
    }

    /// Number of days in the loaded calendar (0 while none is loaded).
    /// Exposed for the health endpoint.
    pub fn calendar_size(&self) -> usize {
        self.calendar.read().as_ref().map_or(0, HashSet::len)
    }
}

// =============================================================================
// Tests
// =============================================================================
