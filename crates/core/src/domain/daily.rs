use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::demand::AggregateRef;
use crate::domain::month::MonthOfYear;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DailyForecastId(pub String);

impl DailyForecastId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Forecast for a single day of the parent aggregate's month.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyForecast {
    pub id: DailyForecastId,
    pub parent: AggregateRef,
    pub seller_id: i64,
    pub month: MonthOfYear,
    pub day: u32,
    pub forecast: Decimal,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayForecast {
    pub day: u32,
    pub forecast: Decimal,
}

/// Write set for one parent's daily rows.
///
/// Rows with `day >= clear_from_day` are dropped before `days` are upserted, so a
/// redistribution can never leave an orphaned open day behind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyPlan {
    pub parent: AggregateRef,
    pub seller_id: i64,
    pub month: MonthOfYear,
    pub clear_from_day: Option<u32>,
    pub days: Vec<DayForecast>,
}

impl DailyPlan {
    pub fn total(&self) -> Decimal {
        self.days.iter().map(|day| day.forecast).sum()
    }

    /// Applies the plan to the parent's current rows and returns the resulting days.
    pub fn merge(&self, existing: &[DailyForecast]) -> Vec<DayForecast> {
        let mut merged: Vec<DayForecast> = existing
            .iter()
            .filter(|row| self.clear_from_day.map_or(true, |from| row.day < from))
            .filter(|row| self.days.iter().all(|day| day.day != row.day))
            .map(|row| DayForecast { day: row.day, forecast: row.forecast })
            .collect();
        merged.extend(self.days.iter().copied());
        merged.sort_by_key(|day| day.day);
        merged
    }
}
