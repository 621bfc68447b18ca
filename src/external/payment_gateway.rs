use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What the core needs from the gateway to issue a payment link.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentLinkRequest {
    pub order_code: i64,
    pub amount_cents: i64,
    pub description: String,
    pub buyer_name: String,
    pub buyer_email: String,
    pub return_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Deserialize)]
struct PaymentLinkResponse {
    checkout_url: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_link(&self, req: &PaymentLinkRequest) -> anyhow::Result<String>;
}

pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_link(&self, req: &PaymentLinkRequest) -> anyhow::Result<String> {
        let url = format!("{}/v1/payment-links", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        let body: PaymentLinkResponse = resp.json().await?;
        Ok(body.checkout_url)
    }
}
