//! Daily forecast distribution
//!
//! Days up to and including today are frozen. The rest of a monthly total is
//! spread evenly over the open days, truncated at the configured scale, with the
//! rounding remainder on the last day of the month.

use chrono::{Datelike, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::domain::daily::{DailyForecast, DailyPlan, DayForecast};
use crate::domain::demand::AggregateRef;
use crate::domain::month::MonthOfYear;
use crate::errors::{DemandError, DomainError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DayCorrection {
    pub plan: DailyPlan,
    pub previous: Decimal,
    pub new_total: Decimal,
}

#[derive(Clone, Debug)]
pub struct DistributionEngine {
    scale: u32,
}

impl Default for DistributionEngine {
    fn default() -> Self {
        Self::new(2)
    }
}

impl DistributionEngine {
    pub fn new(scale: u32) -> Self {
        Self { scale }
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Last frozen day of `month`: `0` for future months, today's day for the
    /// current month. Months already over cannot be redistributed at all.
    pub fn locked_through(&self, month: MonthOfYear, today: NaiveDate) -> Result<u32, DemandError> {
        let current = MonthOfYear::of(today);
        if month < current {
            Err(DemandError::UpdateInPast { month, day: month.days_in_month(), today })
        } else if month > current {
            Ok(0)
        } else {
            Ok(today.day())
        }
    }

    pub fn redistribute(
        &self,
        parent: AggregateRef,
        seller_id: i64,
        month: MonthOfYear,
        existing: &[DailyForecast],
        new_total: Decimal,
        today: NaiveDate,
    ) -> Result<DailyPlan, DemandError> {
        let last_day = month.days_in_month();
        let locked = self.locked_through(month, today)?;
        let locked_sum: Decimal =
            existing.iter().filter(|row| row.day <= locked).map(|row| row.forecast).sum();
        let delta = new_total - locked_sum;

        if locked >= last_day {
            let current_last = existing
                .iter()
                .find(|row| row.day == last_day)
                .map_or(Decimal::ZERO, |row| row.forecast);
            return Ok(DailyPlan {
                parent,
                seller_id,
                month,
                clear_from_day: Some(last_day),
                days: vec![DayForecast { day: last_day, forecast: current_last + delta }],
            });
        }

        let first_open = locked + 1;
        let open_days = last_day - locked;
        let per_day = (delta / Decimal::from(open_days))
            .round_dp_with_strategy(self.scale, RoundingStrategy::ToZero);
        let remainder = delta - per_day * Decimal::from(open_days - 1);

        let days = (first_open..=last_day)
            .map(|day| DayForecast {
                day,
                forecast: if day == last_day { remainder } else { per_day },
            })
            .collect();

        Ok(DailyPlan { parent, seller_id, month, clear_from_day: Some(first_open), days })
    }

    /// Rejects writes to days that no longer exist or are already frozen.
    pub fn validate_day_write(
        &self,
        month: MonthOfYear,
        day: u32,
        today: NaiveDate,
    ) -> Result<(), DemandError> {
        if day == 0 || day > month.days_in_month() {
            return Err(DomainError::InvalidDay { day, month }.into());
        }
        let locked = self.locked_through(month, today)?;
        if day <= locked {
            return Err(DemandError::UpdateInPast { month, day, today });
        }
        Ok(())
    }

    /// Overwrites one open day and shifts the parent total by the same amount.
    #[allow(clippy::too_many_arguments)]
    pub fn correct_day(
        &self,
        parent: AggregateRef,
        seller_id: i64,
        month: MonthOfYear,
        existing: &[DailyForecast],
        day: u32,
        value: Decimal,
        parent_total: Decimal,
        today: NaiveDate,
    ) -> Result<DayCorrection, DemandError> {
        self.validate_day_write(month, day, today)?;
        let previous =
            existing.iter().find(|row| row.day == day).map_or(Decimal::ZERO, |row| row.forecast);
        Ok(DayCorrection {
            plan: DailyPlan {
                parent,
                seller_id,
                month,
                clear_from_day: None,
                days: vec![DayForecast { day, forecast: value }],
            },
            previous,
            new_total: parent_total + (value - previous),
        })
    }
}
