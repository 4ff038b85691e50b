//! Daily schedule with catchup disabled.
//!
//! The interval for calendar day `D` closes at `D+1 00:00 UTC`; the run for
//! `D` is due from then on. Only the most recent due interval is ever
//! executed automatically. Intervals missed while the pipeline was offline
//! are reported and left for a manual trigger.

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    start_date: NaiveDate,
}

impl DailySchedule {
    pub fn new(start_date: NaiveDate) -> Self {
        Self { start_date }
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start_date
    }

    /// The most recent fully elapsed day, if it is on or after the start date.
    pub fn latest_due(&self, now: DateTime<Utc>) -> Option<NaiveDate> {
        now.date_naive()
            .checked_sub_days(Days::new(1))
            .filter(|due| *due >= self.start_date)
    }

    /// Due intervals strictly between the last executed date (or the day
    /// before the start date) and `due`.
    pub fn missed(&self, last_run: Option<NaiveDate>, due: NaiveDate) -> Vec<NaiveDate> {
        let first = match last_run {
            Some(last) => last.checked_add_days(Days::new(1)),
            None => Some(self.start_date),
        };
        let Some(first) = first.map(|d| d.max(self.start_date)) else {
            return Vec::new();
        };
        first.iter_days().take_while(|d| *d < due).collect()
    }

    /// Next UTC midnight strictly after `now`.
    pub fn next_tick(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let tomorrow = now
            .date_naive()
            .checked_add_days(Days::new(1))
            .unwrap_or(NaiveDate::MAX);
        tomorrow.and_time(NaiveTime::MIN).and_utc()
    }
}
