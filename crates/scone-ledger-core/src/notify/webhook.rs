use super::{render_alert, Alert, AlertChannel, AlertFormat};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

/// Posts alerts to a chat webhook (Discord/Slack-compatible `content` field).
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    http: Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        if url.trim().is_empty() {
            bail!("webhook URL must not be empty");
        }
        let http = Client::builder()
            .user_agent("scone-ledger/0.3")
            .timeout(timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    async fn dispatch(&self, alert: &Alert) -> Result<()> {
        let payload = WebhookPayload {
            content: render_alert(alert, AlertFormat::Human)?,
            alert,
        };
        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("failed to call alert webhook")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("alert webhook error ({}): {}", status, body);
        }
        info!(contract = %alert.contract, "alert delivered to webhook");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    content: String,
    alert: &'a Alert,
}
