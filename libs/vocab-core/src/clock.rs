//! Current-date providers.
//!
//! Study-history keys and streaks depend on "today". Everything that needs the
//! time takes a [`Clock`] so tests can pin it.

use chrono::{DateTime, Duration, Local, NaiveDate, Timelike, Utc};
use std::sync::Mutex;

/// Source of the current instant and study day.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// The current study day, used as the study-history key.
    fn today(&self) -> NaiveDate;
}

/// Wall clock. A study day starts at `daily_reset_hour` local time, so a
/// session at 01:00 with a reset hour of 4 still counts towards the previous day.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    pub daily_reset_hour: u32,
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        let now = Local::now();
        if now.hour() < self.daily_reset_hour {
            (now - Duration::days(1)).date_naive()
        } else {
            now.date_naive()
        }
    }
}

/// Manually driven clock.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Format a day as a `YYYY-MM-DD` study-history key.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Parse a strict `YYYY-MM-DD` key. Rejects unpadded parts and impossible dates.
pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
    let bytes = key.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let digits_ok = bytes
        .iter()
        .enumerate()
        .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !digits_ok {
        return None;
    }
    NaiveDate::parse_from_str(key, "%Y-%m-%d").ok()
}
