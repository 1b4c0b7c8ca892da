use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A span of days. Both ends are inclusive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl Interval {
    /// # Panics
    ///
    /// Panics if `end_date` is before `start_date`.
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        if end_date < start_date {
            panic!("intervals must not end before they start")
        }
        Self {
            start_date,
            end_date,
        }
    }

    /// `count` consecutive one-year intervals, the first starting on `start`.
    ///
    /// Each interval ends the day before the next one starts. The sequence stops early if it
    /// would run past the end of the supported calendar.
    pub fn years(count: u32, start: NaiveDate) -> Vec<Interval> {
        (0..count)
            .map_while(|idx| {
                let start_date = start.checked_add_months(Months::new(12 * idx))?;
                let next = start.checked_add_months(Months::new(12 * (idx + 1)))?;
                Some(Interval::new(start_date, next.pred_opt()?))
            })
            .collect()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}", self.start_date, self.end_date)
    }
}
