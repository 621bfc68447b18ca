use async_trait::async_trait;
use serde_json::json;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNotifier {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let url = format!("{}/v1/messages", self.base_url);
        self.client
            .post(&url)
            .json(&json!({ "to": to, "subject": subject, "body": body }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Fire-and-forget from the core's perspective: a delivery failure is logged,
/// never surfaced to the caller, never blocks a transition.
pub async fn notify_best_effort(notifier: &dyn Notifier, to: &str, subject: &str, body: &str) {
    if let Err(e) = notifier.send(to, subject, body).await {
        tracing::warn!("notification to {to} failed: {e}");
    }
}
