//! Delivery of demand forecast events to the messaging collaborator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};

use demandplan_core::config::{PublisherConfig, PublisherMode};
use demandplan_core::errors::DemandError;
use demandplan_core::events::{DemandEventPublisher, DemandForecastEvent};

/// Posts events as JSON. The event key doubles as an idempotency header so the
/// receiver can drop redeliveries.
pub struct WebhookPublisher {
    client: Client,
    endpoint: String,
    auth_token: Option<SecretString>,
}

impl WebhookPublisher {
    pub fn new(
        endpoint: impl Into<String>,
        auth_token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, DemandError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| DemandError::Publish(format!("failed to build http client: {error}")))?;
        Ok(Self { client, endpoint: endpoint.into(), auth_token })
    }
}

#[async_trait]
impl DemandEventPublisher for WebhookPublisher {
    async fn publish(&self, event: &DemandForecastEvent) -> Result<(), DemandError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", &event.event_key)
            .json(event);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|error| {
            warn!(
                event_name = "demand.publish.transport_error",
                event_key = %event.event_key,
                error = %error,
                "demand event request failed"
            );
            DemandError::Publish(format!("request to event endpoint failed: {error}"))
        })?;

        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            // 409 means the receiver already holds this event key.
            info!(
                event_name = "demand.publish.delivered",
                event_key = %event.event_key,
                seller_id = event.seller_id,
                items = event.items.len(),
                http_status = status.as_u16(),
                "demand event delivered"
            );
            return Ok(());
        }

        Err(DemandError::Publish(format!("event endpoint returned {status}")))
    }
}

/// Writes events to the log instead of sending them anywhere.
#[derive(Default)]
pub struct LoggingPublisher;

#[async_trait]
impl DemandEventPublisher for LoggingPublisher {
    async fn publish(&self, event: &DemandForecastEvent) -> Result<(), DemandError> {
        let payload = serde_json::to_string(event)
            .map_err(|error| DemandError::Publish(format!("failed to encode event: {error}")))?;
        info!(
            event_name = "demand.publish.logged",
            event_key = %event.event_key,
            seller_id = event.seller_id,
            month_of_year = %event.month_of_year,
            items = event.items.len(),
            payload = %payload,
            "demand event published to log"
        );
        Ok(())
    }
}

pub fn build_publisher(config: &PublisherConfig) -> Result<Arc<dyn DemandEventPublisher>, DemandError> {
    match config.mode {
        PublisherMode::Log => Ok(Arc::new(LoggingPublisher)),
        PublisherMode::Webhook => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                DemandError::Publish("publisher.endpoint is required in webhook mode".to_string())
            })?;
            Ok(Arc::new(WebhookPublisher::new(
                endpoint,
                config.auth_token.clone(),
                Duration::from_secs(config.timeout_secs.max(1)),
            )?))
        }
    }
}
