use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::shipping::{CARRIER_ATTEMPTS, CARRIER_BACKOFF_MS};

#[derive(Debug, Clone, Serialize)]
pub struct CarrierOrderRequest {
    pub origin: String,
    pub destination: String,
    pub contact_name: String,
    pub contact_phone: String,
    /// e.g. "test-kit" or "sample-return"
    pub parcel_kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CarrierOrder {
    pub tracking_ref: String,
    pub label_url: Option<String>,
    pub eta: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ShipmentCarrier: Send + Sync {
    async fn create_order(&self, req: &CarrierOrderRequest) -> anyhow::Result<CarrierOrder>;
}

/// Place a carrier order for a leg that does not have one yet. A leg with a
/// tracking ref is left alone; otherwise the call is retried with a fixed
/// backoff and the last error is returned when every attempt fails.
pub async fn ensure_order(
    carrier: &dyn ShipmentCarrier,
    existing_tracking: Option<&str>,
    req: &CarrierOrderRequest,
) -> anyhow::Result<Option<CarrierOrder>> {
    if existing_tracking.is_some() {
        return Ok(None);
    }
    let mut last_err = None;
    for attempt in 1..=CARRIER_ATTEMPTS {
        match carrier.create_order(req).await {
            Ok(order) => return Ok(Some(order)),
            Err(e) => {
                tracing::warn!(
                    "carrier order attempt {attempt}/{CARRIER_ATTEMPTS} failed: {e}"
                );
                last_err = Some(e);
                if attempt < CARRIER_ATTEMPTS {
                    tokio::time::sleep(std::time::Duration::from_millis(CARRIER_BACKOFF_MS)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("carrier unavailable")))
}

pub struct HttpShipmentCarrier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpShipmentCarrier {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl ShipmentCarrier for HttpShipmentCarrier {
    async fn create_order(&self, req: &CarrierOrderRequest) -> anyhow::Result<CarrierOrder> {
        let url = format!("{}/v1/orders", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        let order: CarrierOrder = resp.json().await?;
        Ok(order)
    }
}
