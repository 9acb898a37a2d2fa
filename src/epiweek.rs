//! ISO 8601 epidemiological week arithmetic.
//!
//! An epiweek is encoded as `YYYYWW`. Week 1 is the week containing
//! January 4th and every week starts on a Monday.

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A validated `(year, week)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub struct Epiweek {
    year: i32,
    week: u32,
}

impl Epiweek {
    pub fn new(year: i32, week: u32) -> Result<Self> {
        if !(1..=9999).contains(&year) {
            return Err(Error::InvalidEpiweek(format!("year {year} out of range")));
        }
        let max = weeks_in_year(year);
        if week == 0 || week > max {
            return Err(Error::InvalidEpiweek(format!(
                "{year}{week:02}: week must be between 1 and {max}"
            )));
        }
        Ok(Self { year, week })
    }

    /// Decodes a `YYYYWW` integer.
    pub fn from_code(code: u32) -> Result<Self> {
        Self::new((code / 100) as i32, code % 100)
    }

    /// The epiweek containing `date`.
    ///
    /// Fails for dates whose ISO year falls outside `1..=9999`, which have
    /// no `YYYYWW` code.
    pub fn containing(date: NaiveDate) -> Result<Self> {
        let iso = date.iso_week();
        Self::new(iso.year(), iso.week())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn week(&self) -> u32 {
        self.week
    }

    pub fn code(&self) -> u32 {
        self.year.unsigned_abs() * 100 + self.week
    }

    /// Monday of this week.
    ///
    /// Locates January 4th, steps back to its Monday, then forward
    /// `week - 1` whole weeks.
    pub fn monday(&self) -> NaiveDate {
        let jan4 = NaiveDate::from_ymd_opt(self.year, 1, 4).unwrap_or(NaiveDate::MIN);
        let back = u64::from(jan4.weekday().number_from_monday() - 1);
        let forward = u64::from(self.week - 1) * 7;
        jan4.checked_sub_days(Days::new(back))
            .and_then(|d| d.checked_add_days(Days::new(forward)))
            .unwrap_or(NaiveDate::MAX)
    }

    /// Following epiweek, rolling into week 1 of the next year.
    pub fn succ(&self) -> Self {
        if self.week < weeks_in_year(self.year) {
            Self {
                year: self.year,
                week: self.week + 1,
            }
        } else {
            Self {
                year: self.year + 1,
                week: 1,
            }
        }
    }
}

impl fmt::Display for Epiweek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.week)
    }
}

impl FromStr for Epiweek {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidEpiweek(format!("{s:?} is not YYYYWW")));
        }
        let code: u32 = s
            .parse()
            .map_err(|_| Error::InvalidEpiweek(format!("{s:?} is not YYYYWW")))?;
        Self::from_code(code)
    }
}

impl From<Epiweek> for u32 {
    fn from(e: Epiweek) -> u32 {
        e.code()
    }
}

impl TryFrom<u32> for Epiweek {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        Self::from_code(code)
    }
}

/// Number of ISO weeks in `year`: 53 when December 28th falls in week 53.
pub fn weeks_in_year(year: i32) -> u32 {
    NaiveDate::from_ymd_opt(year, 12, 28)
        .map(|d| d.iso_week().week())
        .unwrap_or(52)
}

pub fn epiweek_to_monday(code: u32) -> Result<NaiveDate> {
    Ok(Epiweek::from_code(code)?.monday())
}

pub fn monday_to_epiweek(date: NaiveDate) -> Result<u32> {
    Ok(Epiweek::containing(date)?.code())
}

/// Every epiweek touched by the inclusive range `start..=end`.
///
/// Empty when `start > end`.
pub fn epiweeks_between(start: NaiveDate, end: NaiveDate) -> Result<Vec<Epiweek>> {
    let mut weeks = Vec::new();
    if start > end {
        return Ok(weeks);
    }
    let last = Epiweek::containing(end)?;
    let mut current = Epiweek::containing(start)?;
    while current <= last {
        weeks.push(current);
        current = current.succ();
    }
    Ok(weeks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_known_mondays() {
        assert_eq!(epiweek_to_monday(202401).unwrap(), ymd(2024, 1, 1));
        assert_eq!(epiweek_to_monday(202501).unwrap(), ymd(2024, 12, 30));
        assert_eq!(epiweek_to_monday(202301).unwrap(), ymd(2023, 1, 2));
        assert_eq!(epiweek_to_monday(202053).unwrap(), ymd(2020, 12, 28));
    }

    #[test]
    fn test_week_53_only_in_long_years() {
        assert_eq!(weeks_in_year(2020), 53);
        assert_eq!(weeks_in_year(2026), 53);
        assert_eq!(weeks_in_year(2024), 52);
        assert!(Epiweek::from_code(202053).is_ok());
        assert!(matches!(
            Epiweek::from_code(202453),
            Err(Error::InvalidEpiweek(_))
        ));
    }

    #[test]
    fn test_rejects_week_zero_and_above_53() {
        assert!(matches!(epiweek_to_monday(202400), Err(Error::InvalidEpiweek(_))));
        assert!(matches!(epiweek_to_monday(202054), Err(Error::InvalidEpiweek(_))));
        assert!(matches!(epiweek_to_monday(202499), Err(Error::InvalidEpiweek(_))));
    }

    #[test]
    fn test_round_trip_all_weeks() {
        for year in 1990..=2040 {
            for week in 1..=weeks_in_year(year) {
                let code = year as u32 * 100 + week;
                let monday = epiweek_to_monday(code).unwrap();
                assert_eq!(monday.weekday(), chrono::Weekday::Mon, "{code}");
                assert_eq!(monday_to_epiweek(monday).unwrap(), code);
            }
        }
    }

    #[test]
    fn test_mid_week_date_maps_to_its_week() {
        assert_eq!(monday_to_epiweek(ymd(2025, 1, 1)).unwrap(), 202501);
        assert_eq!(monday_to_epiweek(ymd(2025, 1, 14)).unwrap(), 202503);
        assert_eq!(monday_to_epiweek(ymd(2021, 1, 3)).unwrap(), 202053);
    }

    #[test]
    fn test_parse_and_display() {
        let e: Epiweek = "202401".parse().unwrap();
        assert_eq!(e.year(), 2024);
        assert_eq!(e.week(), 1);
        assert_eq!(e.to_string(), "202401");
        assert!("2024-01".parse::<Epiweek>().is_err());
        assert!("20241".parse::<Epiweek>().is_err());
    }

    #[test]
    fn test_succ_rolls_over_year() {
        assert_eq!(Epiweek::from_code(202452).unwrap().succ().code(), 202501);
        assert_eq!(Epiweek::from_code(202052).unwrap().succ().code(), 202053);
        assert_eq!(Epiweek::from_code(202053).unwrap().succ().code(), 202101);
    }

    #[test]
    fn test_epiweeks_between() {
        let weeks: Vec<u32> = epiweeks_between(ymd(2025, 1, 1), ymd(2025, 1, 14))
            .unwrap()
            .iter()
            .map(Epiweek::code)
            .collect();
        assert_eq!(weeks, vec![202501, 202502, 202503]);

        let single = epiweeks_between(ymd(2024, 1, 3), ymd(2024, 1, 3)).unwrap();
        assert_eq!(single.len(), 1);

        assert!(epiweeks_between(ymd(2025, 2, 1), ymd(2025, 1, 1)).unwrap().is_empty());
    }

    #[test]
    fn test_dates_outside_four_digit_years_have_no_epiweek() {
        for raw in ["-0001-06-01", "0000-06-01", "+10000-06-01"] {
            let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap();
            assert!(
                matches!(Epiweek::containing(date), Err(Error::InvalidEpiweek(_))),
                "{raw}"
            );
            assert!(monday_to_epiweek(date).is_err(), "{raw}");
        }
        // 0001-01-01 is a Monday, so ISO year 1 starts there.
        assert_eq!(monday_to_epiweek(ymd(1, 1, 1)).unwrap(), 101);
        assert_eq!(Epiweek::containing(ymd(9999, 6, 1)).unwrap().year(), 9999);
    }

    #[test]
    fn test_serde_as_integer() {
        let e = Epiweek::from_code(202401).unwrap();
        assert_eq!(serde_json::to_string(&e).unwrap(), "202401");
        let back: Epiweek = serde_json::from_str("202401").unwrap();
        assert_eq!(back, e);
        assert!(serde_json::from_str::<Epiweek>("202460").is_err());
    }
}
