//! Outbound "Interested lead" notifications.
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::errors::{SyncError, SyncResult};
use crate::types::EmailDocument;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_interested(&self, doc: &EmailDocument) -> SyncResult<()>;
}

/// Posts to a Slack incoming webhook and a generic JSON webhook. Each target
/// is attempted independently; an unset target is skipped.
pub struct WebhookNotifier {
    client: Client,
    slack_url: Option<String>,
    webhook_url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(slack_url: Option<String>, webhook_url: Option<String>) -> Self {
        if slack_url.is_none() || webhook_url.is_none() {
            warn!(
                slack = slack_url.is_some(),
                webhook = webhook_url.is_some(),
                "Not every notification target is configured; missing ones are skipped"
            );
        }
        Self {
            client: Client::new(),
            slack_url,
            webhook_url,
        }
    }

    async fn post(&self, target: &str, url: &str, payload: serde_json::Value) -> Result<(), String> {
        let res = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("{target}: {e}"))?;
        if !res.status().is_success() {
            return Err(format!("{target}: status {}", res.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_interested(&self, doc: &EmailDocument) -> SyncResult<()> {
        let mut failures = Vec::new();

        if let Some(url) = &self.slack_url {
            let payload = json!({
                "text": format!(
                    "*New Interested Lead!*\n*From:* {}\n*Subject:* {}",
                    doc.from, doc.subject
                )
            });
            match self.post("slack", url, payload).await {
                Ok(()) => info!(message_id = %doc.id, "Slack notification sent"),
                Err(e) => failures.push(e),
            }
        }

        if let Some(url) = &self.webhook_url {
            let payload = json!({ "event": "InterestedLead", "emailData": doc });
            match self.post("webhook", url, payload).await {
                Ok(()) => info!(message_id = %doc.id, "Webhook notification sent"),
                Err(e) => failures.push(e),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SyncError::Notification(failures.join("; ")))
        }
    }
}
