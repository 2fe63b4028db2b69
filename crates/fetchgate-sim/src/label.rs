//! Work-item labels for historical bar requests.

use std::fmt;

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};

/// One historical-data request: an instrument over a time range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarRequest {
    pub ticker: String,
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
}

impl BarRequest {
    /// Whole days `from..=to`; only the dates matter to the feed.
    pub fn daily(ticker: impl Into<String>, from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            ticker: ticker.into(),
            from: from.and_time(NaiveTime::MIN),
            to: to.and_hms_opt(23, 59, 59).unwrap_or(to.and_time(NaiveTime::MIN)),
        }
    }

    /// Consecutive `step`-long windows covering `[start, end)` on `date`.
    pub fn windows(
        ticker: &str,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        step: TimeDelta,
    ) -> Vec<Self> {
        let mut windows = Vec::new();
        if step <= TimeDelta::zero() {
            return windows;
        }
        let end = date.and_time(end);
        let mut from = date.and_time(start);
        while from < end {
            let to = (from + step).min(end);
            windows.push(Self {
                ticker: ticker.to_string(),
                from,
                to,
            });
            from = to;
        }
        windows
    }

    /// Weekdays covered by the request.
    pub fn trading_days(&self) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut day = self.from.date();
        while day <= self.to.date() {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                days.push(day);
            }
            match day.checked_add_days(Days::new(1)) {
                Some(next) => day = next,
                None => break,
            }
        }
        days
    }
}

impl fmt::Display for BarRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from: {} to: {}", self.ticker, self.from, self.to)
    }
}

/// Synthetic ticker universe: `SYM000`, `SYM001`, ...
pub fn sample_tickers(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("SYM{i:03}")).collect()
}
