use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Calendar month bucket, rendered as `YYYY-MM`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthOfYear {
    year: i32,
    month: u32,
}

impl MonthOfYear {
    pub fn new(year: i32, month: u32) -> Result<Self, DomainError> {
        if !(1..=12).contains(&month) || !(1970..=9999).contains(&year) {
            return Err(DomainError::InvalidMonth(format!("{year:04}-{month:02}")));
        }
        Ok(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self { year: date.year(), month: date.month() }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let invalid = || DomainError::InvalidMonth(value.to_owned());
        let (year, month) = value.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn days_in_month(&self) -> u32 {
        (28..=31)
            .rev()
            .find(|day| NaiveDate::from_ymd_opt(self.year, self.month, *day).is_some())
            .unwrap_or(28)
    }

    pub fn date(&self, day: u32) -> Result<NaiveDate, DomainError> {
        NaiveDate::from_ymd_opt(self.year, self.month, day)
            .ok_or(DomainError::InvalidDay { day, month: *self })
    }
}

impl fmt::Display for MonthOfYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for MonthOfYear {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for MonthOfYear {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MonthOfYear> for String {
    fn from(value: MonthOfYear) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::MonthOfYear;
    use crate::errors::DomainError;

    #[test]
    fn parses_and_renders_year_month() {
        let month = MonthOfYear::parse("2023-11").expect("valid month");
        assert_eq!(month.year(), 2023);
        assert_eq!(month.month(), 11);
        assert_eq!(month.to_string(), "2023-11");
    }

    #[test]
    fn rejects_malformed_months() {
        for raw in ["2023-13", "2023-1", "23-11", "2023/11", "", "2023-00"] {
            assert!(
                matches!(MonthOfYear::parse(raw), Err(DomainError::InvalidMonth(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn knows_month_lengths_including_leap_years() {
        assert_eq!(MonthOfYear::new(2023, 11).expect("month").days_in_month(), 30);
        assert_eq!(MonthOfYear::new(2024, 2).expect("month").days_in_month(), 29);
        assert_eq!(MonthOfYear::new(2023, 2).expect("month").days_in_month(), 28);
        assert_eq!(MonthOfYear::new(2023, 12).expect("month").days_in_month(), 31);
    }

    #[test]
    fn months_order_chronologically() {
        let today = NaiveDate::from_ymd_opt(2023, 11, 9).expect("date");
        let current = MonthOfYear::of(today);
        assert!(MonthOfYear::new(2023, 10).expect("month") < current);
        assert!(MonthOfYear::new(2024, 1).expect("month") > current);
    }

    #[test]
    fn serializes_as_plain_string() {
        let month = MonthOfYear::new(2024, 3).expect("month");
        let json = serde_json::to_string(&month).expect("serialize");
        assert_eq!(json, "\"2024-03\"");
        let back: MonthOfYear = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, month);
    }
}
