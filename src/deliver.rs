use async_trait::async_trait;
use tracing::info;

use crate::error::{DaybriefError, Result};
use crate::models::Artifact;

/// Distribution boundary. A failure here never touches store or cache
/// state, and the core does not retry; the next scheduled push is the retry.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, artifact: &Artifact) -> Result<()>;
}

/// Posts the artifact as JSON to a configured webhook.
pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
}

impl WebhookDelivery {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Deliver for WebhookDelivery {
    async fn deliver(&self, artifact: &Artifact) -> Result<()> {
        self.client
            .post(&self.url)
            .json(artifact)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DaybriefError::Delivery(e.to_string()))?;
        info!("Delivered summary for {}", artifact.day_key);
        Ok(())
    }
}
