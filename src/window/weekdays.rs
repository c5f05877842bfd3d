//! Weekday sets for maintenance windows

use std::fmt;

use chrono::Weekday;

use crate::error::{Error, Result};

/// Set of weekdays, stored as a bitmask indexed by days from Sunday
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Weekdays(u8);

const ALL_DAYS: [Weekday; 7] = [
    Weekday::Sun,
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
];

impl Weekdays {
    pub fn all() -> Self {
        Weekdays(0b111_1111)
    }

    /// Parse day tokens; an empty list means every day
    pub fn parse<S: AsRef<str>>(days: &[S]) -> Result<Self> {
        if days.is_empty() {
            return Ok(Self::all());
        }

        let mut set = Weekdays::default();
        for day in days {
            set.insert(parse_weekday(day.as_ref())?);
        }
        Ok(set)
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_sunday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_sunday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Weekdays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = ALL_DAYS
            .iter()
            .filter(|d| self.contains(**d))
            .map(|d| d.to_string().to_lowercase())
            .collect();
        write!(f, "{}", names.join(","))
    }
}

/// Parse a single weekday token.
///
/// Accepts `0`-`6` (Sunday first), two- or three-letter abbreviations and
/// full English names, case-insensitively.
pub fn parse_weekday(token: &str) -> Result<Weekday> {
    let token = token.trim().to_lowercase();

    if let Ok(n) = token.parse::<usize>() {
        return ALL_DAYS
            .get(n)
            .copied()
            .ok_or_else(|| Error::ConfigError(format!("invalid weekday number: {token}")));
    }

    let day = match token.as_str() {
        "su" | "sun" | "sunday" => Weekday::Sun,
        "mo" | "mon" | "monday" => Weekday::Mon,
        "tu" | "tue" | "tuesday" => Weekday::Tue,
        "we" | "wed" | "wednesday" => Weekday::Wed,
        "th" | "thu" | "thursday" => Weekday::Thu,
        "fr" | "fri" | "friday" => Weekday::Fri,
        "sa" | "sat" | "saturday" => Weekday::Sat,
        _ => return Err(Error::ConfigError(format!("invalid weekday: {token}"))),
    };
    Ok(day)
}
