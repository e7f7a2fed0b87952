//! Webhook senders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::activity::{Activity, ActivityLevel, ActivityType, WebhookKind};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

/// What a webhook receives for one activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMessage {
    pub title: String,
    pub description: String,
    pub level: ActivityLevel,
    pub activity_type: String,
    pub issue_name: Option<String>,
    pub creator_name: String,
    pub created_at: DateTime<Utc>,
}

impl WebhookMessage {
    pub fn new(activity: &Activity, issue_name: Option<&str>, creator_name: &str) -> Self {
        let subject = issue_name.unwrap_or("Pipeline");
        let title = match activity.activity_type {
            ActivityType::IssueCreate => format!("Issue created: {subject}"),
            ActivityType::IssueStatusUpdate => format!("Issue status changed: {subject}"),
            ActivityType::IssueCommentCreate => format!("New comment on {subject}"),
            ActivityType::IssueFieldUpdate => format!("Issue updated: {subject}"),
            ActivityType::TaskStatusUpdate => format!("Task status changed in {subject}"),
            ActivityType::TaskCheckRunStatusUpdate => format!("Check finished in {subject}"),
        };
        Self {
            title,
            description: activity.comment.clone(),
            level: activity.level,
            activity_type: activity.activity_type.as_str().to_string(),
            issue_name: issue_name.map(str::to_string),
            creator_name: creator_name.to_string(),
            created_at: activity.created_at,
        }
    }
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, url: &str, message: &WebhookMessage) -> Result<(), NotifyError>;
}

async fn post(
    client: &reqwest::Client,
    service: &str,
    url: &str,
    body: &serde_json::Value,
) -> Result<(), NotifyError> {
    debug!(service, url, "Sending webhook");
    let response = client.post(url).json(body).send().await?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(NotifyError::DeliveryFailed(format!(
            "{service} returned {status}: {text}"
        )));
    }
    Ok(())
}

pub struct SlackSender {
    client: reqwest::Client,
}

impl SlackSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build_message(message: &WebhookMessage) -> serde_json::Value {
        let color = match message.level {
            ActivityLevel::Info => "#36a64f",
            ActivityLevel::Warn => "#f2c744",
            ActivityLevel::Error => "#dc3545",
        };
        let mut fields = vec![serde_json::json!({
            "title": "By", "value": message.creator_name, "short": true
        })];
        if let Some(issue) = &message.issue_name {
            fields.push(serde_json::json!({"title": "Issue", "value": issue, "short": true}));
        }

        serde_json::json!({
            "attachments": [{
                "color": color,
                "title": message.title,
                "text": message.description,
                "fields": fields,
                "ts": message.created_at.timestamp()
            }]
        })
    }
}

#[async_trait]
impl NotificationSender for SlackSender {
    async fn send(&self, url: &str, message: &WebhookMessage) -> Result<(), NotifyError> {
        post(&self.client, "Slack", url, &Self::build_message(message)).await
    }
}

pub struct DiscordSender {
    client: reqwest::Client,
}

impl DiscordSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build_embed(message: &WebhookMessage) -> serde_json::Value {
        let color = match message.level {
            ActivityLevel::Info => 0x36a64f,
            ActivityLevel::Warn => 0xf2c744,
            ActivityLevel::Error => 0xdc3545,
        };
        serde_json::json!({
            "embeds": [{
                "title": message.title,
                "description": message.description,
                "color": color,
                "footer": {"text": message.creator_name},
                "timestamp": message.created_at.to_rfc3339()
            }]
        })
    }
}

#[async_trait]
impl NotificationSender for DiscordSender {
    async fn send(&self, url: &str, message: &WebhookMessage) -> Result<(), NotifyError> {
        post(&self.client, "Discord", url, &Self::build_embed(message)).await
    }
}

/// Posts the message as-is.
pub struct GenericSender {
    client: reqwest::Client,
}

impl GenericSender {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NotificationSender for GenericSender {
    async fn send(&self, url: &str, message: &WebhookMessage) -> Result<(), NotifyError> {
        post(&self.client, "Webhook", url, &serde_json::to_value(message)?).await
    }
}

pub fn create_sender(kind: WebhookKind, client: reqwest::Client) -> Box<dyn NotificationSender> {
    match kind {
        WebhookKind::Slack => Box::new(SlackSender::new(client)),
        WebhookKind::Discord => Box::new(DiscordSender::new(client)),
        WebhookKind::Generic => Box::new(GenericSender::new(client)),
    }
}
