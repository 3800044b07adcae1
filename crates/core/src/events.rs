//! Outbound demand events and the collaborator that delivers them.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::DemandError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandForecastItem {
    pub site_id: i64,
    pub sku: String,
    pub demand_forecast: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandForecastEvent {
    pub event_key: String,
    pub seller_id: i64,
    pub month_of_year: String,
    pub source: String,
    pub items: Vec<DemandForecastItem>,
}

impl DemandForecastEvent {
    /// Builds an event whose key is a digest of its content, so a redelivered
    /// event carries the same key and consumers can drop it.
    pub fn new(
        seller_id: i64,
        month_of_year: impl Into<String>,
        source: impl Into<String>,
        mut items: Vec<DemandForecastItem>,
    ) -> Self {
        items.sort_by(|left, right| {
            left.sku.cmp(&right.sku).then(left.site_id.cmp(&right.site_id))
        });
        let month_of_year = month_of_year.into();
        let event_key = Self::digest(seller_id, &month_of_year, &items);
        Self { event_key, seller_id, month_of_year, source: source.into(), items }
    }

    fn digest(seller_id: i64, month_of_year: &str, items: &[DemandForecastItem]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(seller_id.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(month_of_year.as_bytes());
        for item in items {
            hasher.update(b"|");
            hasher.update(item.sku.as_bytes());
            hasher.update(b":");
            hasher.update(item.site_id.to_string().as_bytes());
            hasher.update(b"=");
            hasher.update(item.demand_forecast.normalize().to_string().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

#[async_trait]
pub trait DemandEventPublisher: Send + Sync {
    async fn publish(&self, event: &DemandForecastEvent) -> Result<(), DemandError>;
}
