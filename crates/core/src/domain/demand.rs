use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::classification::{GroupBy, GroupPath};
use crate::domain::month::MonthOfYear;
use crate::errors::DomainError;

/// Site id of the seller-wide row that aggregates every physical site.
pub const ALL_SITES: i64 = 0;

/// Scale used for derived average prices.
pub const PRICE_SCALE: u32 = 4;

/// Largest magnitude a submitted metric may carry. Keeps forecast-weighted
/// price sums well inside `Decimal` range.
pub const MAX_METRIC_MAGNITUDE: Decimal = Decimal::from_parts(0xD4A5_1000, 0xE8, 0, false, 0); // 1_000_000_000_000

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SkuDemandId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupDemandId(pub String);

impl SkuDemandId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl GroupDemandId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// The (seller, month) partition every rollup runs inside.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DemandScope {
    pub seller_id: i64,
    pub month: MonthOfYear,
}

impl fmt::Display for DemandScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seller {} / {}", self.seller_id, self.month)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SkuKey {
    pub sku: String,
    pub site_id: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub group_by: GroupBy,
    pub group_key: GroupPath,
    pub site_id: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemandLevel {
    Sku,
    Group,
}

impl DemandLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sku => "sku",
            Self::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sku" => Some(Self::Sku),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Reference to the monthly aggregate that owns a set of daily rows.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "level", content = "id", rename_all = "snake_case")]
pub enum AggregateRef {
    Sku(SkuDemandId),
    Group(GroupDemandId),
}

impl AggregateRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Sku(id) => &id.0,
            Self::Group(id) => &id.0,
        }
    }

    pub fn level(&self) -> DemandLevel {
        match self {
            Self::Sku(_) => DemandLevel::Sku,
            Self::Group(_) => DemandLevel::Group,
        }
    }
}

impl fmt::Display for AggregateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level().as_str(), self.id())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStamp {
    pub actor: String,
    pub at: DateTime<Utc>,
}

impl AuditStamp {
    pub fn now(actor: impl Into<String>) -> Self {
        Self { actor: actor.into(), at: Utc::now() }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandMetrics {
    pub budget: Decimal,
    pub forecast: Decimal,
    pub actual_sale: Decimal,
    pub previous_month_sale: Decimal,
    pub current_inventory_value: Decimal,
    pub forecast_inventory_value: Decimal,
    pub avg_sell_price: Option<Decimal>,
    pub avg_purchase_price: Option<Decimal>,
    pub handover_qty: Decimal,
    pub pickup_qty: Decimal,
}

impl DemandMetrics {
    /// Re-sums a set of contributing rows. Quantities add up; average prices are
    /// weighted by each row's forecast.
    pub fn sum<'a>(
        rows: impl IntoIterator<Item = &'a DemandMetrics>,
    ) -> Result<DemandMetrics, DomainError> {
        let mut total = DemandMetrics::default();
        let mut sell = PriceAverage::default();
        let mut purchase = PriceAverage::default();

        for row in rows {
            add_into(&mut total.budget, row.budget, "budget")?;
            add_into(&mut total.forecast, row.forecast, "forecast")?;
            add_into(&mut total.actual_sale, row.actual_sale, "actual_sale")?;
            add_into(&mut total.previous_month_sale, row.previous_month_sale, "previous_month_sale")?;
            add_into(
                &mut total.current_inventory_value,
                row.current_inventory_value,
                "current_inventory_value",
            )?;
            add_into(
                &mut total.forecast_inventory_value,
                row.forecast_inventory_value,
                "forecast_inventory_value",
            )?;
            add_into(&mut total.handover_qty, row.handover_qty, "handover_qty")?;
            add_into(&mut total.pickup_qty, row.pickup_qty, "pickup_qty")?;
            sell.add(row.avg_sell_price, row.forecast, "avg_sell_price")?;
            purchase.add(row.avg_purchase_price, row.forecast, "avg_purchase_price")?;
        }

        total.avg_sell_price = sell.finish("avg_sell_price")?;
        total.avg_purchase_price = purchase.finish("avg_purchase_price")?;
        Ok(total)
    }
}

fn add_into(slot: &mut Decimal, value: Decimal, metric: &str) -> Result<(), DomainError> {
    *slot = slot.checked_add(value).ok_or_else(|| overflow(metric))?;
    Ok(())
}

fn overflow(metric: &str) -> DomainError {
    DomainError::MetricOverflow(metric.to_owned())
}

#[derive(Default)]
struct PriceAverage {
    weighted: Decimal,
    weight: Decimal,
    plain: Decimal,
    count: u32,
}

impl PriceAverage {
    fn add(&mut self, price: Option<Decimal>, weight: Decimal, metric: &str) -> Result<(), DomainError> {
        if let Some(price) = price {
            let product = price.checked_mul(weight).ok_or_else(|| overflow(metric))?;
            add_into(&mut self.weighted, product, metric)?;
            add_into(&mut self.weight, weight, metric)?;
            add_into(&mut self.plain, price, metric)?;
            self.count += 1;
        }
        Ok(())
    }

    fn finish(self, metric: &str) -> Result<Option<Decimal>, DomainError> {
        if self.count == 0 {
            return Ok(None);
        }
        let average = if !self.weight.is_zero() {
            self.weighted.checked_div(self.weight)
        } else {
            self.plain.checked_div(Decimal::from(self.count))
        };
        average.map(|value| Some(value.round_dp(PRICE_SCALE))).ok_or_else(|| overflow(metric))
    }
}

/// Partial metric update; absent fields keep their stored value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsPatch {
    pub budget: Option<Decimal>,
    pub forecast: Option<Decimal>,
    pub actual_sale: Option<Decimal>,
    pub previous_month_sale: Option<Decimal>,
    pub current_inventory_value: Option<Decimal>,
    pub forecast_inventory_value: Option<Decimal>,
    pub avg_sell_price: Option<Decimal>,
    pub avg_purchase_price: Option<Decimal>,
    pub handover_qty: Option<Decimal>,
    pub pickup_qty: Option<Decimal>,
}

impl MetricsPatch {
    pub fn forecast(forecast: Decimal) -> Self {
        Self { forecast: Some(forecast), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Name of the first present field whose magnitude exceeds
    /// [`MAX_METRIC_MAGNITUDE`].
    pub fn out_of_range_field(&self) -> Option<&'static str> {
        [
            ("budget", self.budget),
            ("forecast", self.forecast),
            ("actual_sale", self.actual_sale),
            ("previous_month_sale", self.previous_month_sale),
            ("current_inventory_value", self.current_inventory_value),
            ("forecast_inventory_value", self.forecast_inventory_value),
            ("avg_sell_price", self.avg_sell_price),
            ("avg_purchase_price", self.avg_purchase_price),
            ("handover_qty", self.handover_qty),
            ("pickup_qty", self.pickup_qty),
        ]
        .into_iter()
        .find_map(|(name, value)| value.filter(|value| value.abs() > MAX_METRIC_MAGNITUDE).map(|_| name))
    }

    pub fn apply(&self, metrics: &DemandMetrics) -> DemandMetrics {
        let mut next = metrics.clone();
        let assign = |slot: &mut Decimal, value: Option<Decimal>| {
            if let Some(value) = value {
                *slot = value;
            }
        };
        assign(&mut next.budget, self.budget);
        assign(&mut next.forecast, self.forecast);
        assign(&mut next.actual_sale, self.actual_sale);
        assign(&mut next.previous_month_sale, self.previous_month_sale);
        assign(&mut next.current_inventory_value, self.current_inventory_value);
        assign(&mut next.forecast_inventory_value, self.forecast_inventory_value);
        assign(&mut next.handover_qty, self.handover_qty);
        assign(&mut next.pickup_qty, self.pickup_qty);
        if self.avg_sell_price.is_some() {
            next.avg_sell_price = self.avg_sell_price;
        }
        if self.avg_purchase_price.is_some() {
            next.avg_purchase_price = self.avg_purchase_price;
        }
        next
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkuDemand {
    pub id: SkuDemandId,
    pub seller_id: i64,
    pub sku: String,
    pub site_id: i64,
    pub month: MonthOfYear,
    pub metrics: DemandMetrics,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SkuDemand {
    pub fn new(scope: DemandScope, sku: impl Into<String>, site_id: i64, stamp: &AuditStamp) -> Self {
        Self {
            id: SkuDemandId::generate(),
            seller_id: scope.seller_id,
            sku: sku.into(),
            site_id,
            month: scope.month,
            metrics: DemandMetrics::default(),
            created_by: stamp.actor.clone(),
            updated_by: stamp.actor.clone(),
            created_at: stamp.at,
            updated_at: stamp.at,
        }
    }

    pub fn key(&self) -> SkuKey {
        SkuKey { sku: self.sku.clone(), site_id: self.site_id }
    }

    pub fn aggregate_ref(&self) -> AggregateRef {
        AggregateRef::Sku(self.id.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDemand {
    pub id: GroupDemandId,
    pub seller_id: i64,
    pub group_by: GroupBy,
    pub group_key: GroupPath,
    pub site_id: i64,
    pub month: MonthOfYear,
    pub metrics: DemandMetrics,
    pub number_of_skus: u32,
    pub is_latest_group: bool,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GroupDemand {
    pub fn new(scope: DemandScope, key: &GroupKey, stamp: &AuditStamp) -> Self {
        Self {
            id: GroupDemandId::generate(),
            seller_id: scope.seller_id,
            group_by: key.group_by,
            group_key: key.group_key.clone(),
            site_id: key.site_id,
            month: scope.month,
            metrics: DemandMetrics::default(),
            number_of_skus: 0,
            is_latest_group: true,
            created_by: stamp.actor.clone(),
            updated_by: stamp.actor.clone(),
            created_at: stamp.at,
            updated_at: stamp.at,
        }
    }

    pub fn key(&self) -> GroupKey {
        GroupKey { group_by: self.group_by, group_key: self.group_key.clone(), site_id: self.site_id }
    }

    pub fn aggregate_ref(&self) -> AggregateRef {
        AggregateRef::Group(self.id.clone())
    }
}
