//! Maintenance time windows
//!
//! A [`TimeWindow`] answers whether an instant falls on an allowed weekday,
//! strictly between a start and an end time-of-day, in a given IANA timezone.
//! All parsing happens at construction so a bad window stops the daemon
//! before it ever ticks.

mod weekdays;

use std::fmt;

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};

pub use weekdays::{parse_weekday, Weekdays};

/// Accepted time-of-day layouts, tried in order
const TIME_FORMATS: &[&str] = &["%H:%M", "%H:%M:%S", "%I:%M %p", "%I:%M:%S %p", "%I:%M%p"];

#[derive(Clone, Debug, PartialEq)]
pub struct TimeWindow {
    days: Weekdays,
    start: NaiveTime,
    end: NaiveTime,
    timezone: Tz,
}

impl TimeWindow {
    pub fn new<S: AsRef<str>>(days: &[S], start: &str, end: &str, timezone: &str) -> Result<Self> {
        let days = Weekdays::parse(days)?;
        let start = parse_time(start)?;
        let end = parse_time(end)?;
        let timezone: Tz = timezone
            .trim()
            .parse()
            .map_err(|e| Error::ConfigError(format!("invalid time zone {timezone:?}: {e}")))?;

        Ok(Self {
            days,
            start,
            end,
            timezone,
        })
    }

    /// Whether `instant` is inside the window.
    ///
    /// Boundaries are exclusive: an instant exactly at `start` or `end` is
    /// outside. When `end` precedes `start` the window spans midnight and the
    /// weekday is that of the local instant.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.timezone);
        if !self.days.contains(local.weekday()) {
            return false;
        }

        let time = local.time();
        if self.start <= self.end {
            time > self.start && time < self.end
        } else {
            time > self.start || time < self.end
        }
    }

    pub fn days(&self) -> Weekdays {
        self.days
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} between {} and {} {}",
            self.days,
            self.start.format("%H:%M:%S"),
            self.end.format("%H:%M:%S"),
            self.timezone
        )
    }
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    let value = value.trim();
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(value, format).ok())
        .ok_or_else(|| Error::ConfigError(format!("invalid time of day: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn la(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        chrono_tz::America::Los_Angeles
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn window() -> TimeWindow {
        TimeWindow::new(
            &["mon", "wed", "fri"],
            "10:01",
            "11:30",
            "America/Los_Angeles",
        )
        .unwrap()
    }

    #[test]
    fn test_contains_inside_window_on_allowed_day() {
        // 2019-04-05 is a Friday
        assert!(window().contains(la(2019, 4, 5, 10, 30)));
    }

    #[test]
    fn test_excludes_disallowed_day() {
        // 2019-04-06 is a Saturday
        assert!(!window().contains(la(2019, 4, 6, 10, 30)));
    }

    #[test]
    fn test_excludes_time_outside_window() {
        assert!(!window().contains(la(2019, 4, 5, 9, 0)));
        assert!(!window().contains(la(2019, 4, 5, 11, 31)));
    }

    #[test]
    fn test_boundaries_are_exclusive() {
        assert!(!window().contains(la(2019, 4, 5, 10, 1)));
        assert!(!window().contains(la(2019, 4, 5, 11, 30)));
        assert!(window().contains(la(2019, 4, 5, 10, 2)));
    }

    #[test]
    fn test_projects_into_configured_timezone() {
        // 17:30 UTC on Friday 2019-04-05 is 10:30 PDT
        let instant = Utc.with_ymd_and_hms(2019, 4, 5, 17, 30, 0).unwrap();
        assert!(window().contains(instant));

        // 10:30 UTC is 03:30 PDT
        let instant = Utc.with_ymd_and_hms(2019, 4, 5, 10, 30, 0).unwrap();
        assert!(!window().contains(instant));
    }

    #[test]
    fn test_window_spanning_midnight() {
        let tw = TimeWindow::new::<&str>(&[], "22:00", "04:00", "UTC").unwrap();
        assert!(tw.contains(Utc.with_ymd_and_hms(2021, 1, 4, 23, 0, 0).unwrap()));
        assert!(tw.contains(Utc.with_ymd_and_hms(2021, 1, 4, 3, 0, 0).unwrap()));
        assert!(!tw.contains(Utc.with_ymd_and_hms(2021, 1, 4, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_accepts_twelve_hour_times() {
        let tw = TimeWindow::new::<&str>(&[], "9:00 AM", "5:30 PM", "UTC").unwrap();
        assert!(tw.contains(Utc.with_ymd_and_hms(2021, 1, 4, 12, 0, 0).unwrap()));
        assert!(!tw.contains(Utc.with_ymd_and_hms(2021, 1, 4, 18, 0, 0).unwrap()));
    }

    #[test]
    fn test_configuration_errors_at_construction() {
        assert!(TimeWindow::new(&["fridayyyy"], "10:00", "11:00", "UTC").is_err());
        assert!(TimeWindow::new::<&str>(&[], "25:00", "11:00", "UTC").is_err());
        assert!(TimeWindow::new::<&str>(&[], "10:00", "eleven", "UTC").is_err());
        assert!(TimeWindow::new::<&str>(&[], "10:00", "11:00", "Mars/Olympus").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            window().to_string(),
            "mon,wed,fri between 10:01:00 and 11:30:00 America/Los_Angeles"
        );
    }
}
