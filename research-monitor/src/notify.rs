use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

/// Delivers a rendered digest message somewhere outside the run.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send_digest(&self, message: &str, date: NaiveDate) -> Result<()>;
}

#[derive(Serialize)]
struct SlackPayload<'a> {
    text: &'a str,
    mrkdwn: bool,
}

/// Posts digest messages to a Slack incoming webhook.
pub struct SlackWebhookNotifier {
    webhook_url: String,
    client: Client,
}

impl SlackWebhookNotifier {
    pub fn new(client: Client, webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl Notifier for SlackWebhookNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send_digest(&self, message: &str, date: NaiveDate) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&SlackPayload {
                text: message,
                mrkdwn: true,
            })
            .send()
            .await
            .context("network error posting to Slack webhook")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Slack webhook returned {}: {}", status, body);
        }
        info!(date = %date, "notify: digest sent to Slack");
        Ok(())
    }
}
