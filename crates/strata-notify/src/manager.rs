//! The activity sink: persist, notify inboxes, deliver webhooks.

use crate::sender::{WebhookMessage, create_sender};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use strata_core::Result;
use strata_core::activity::{Activity, ActivityCreate, ActivityMeta};
use strata_core::ids::PrincipalId;
use strata_core::issue::Issue;
use strata_core::ports::{ActivitySink, Store};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Persists activities and fans them out.
///
/// Inbox entries go to the issue's creator, assignee and subscribers, minus
/// the system bot and the activity's own creator. Webhook deliveries run on
/// spawned tasks; a failed delivery is logged and never fails the activity.
pub struct ActivityManager {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    deliveries: TaskTracker,
}

impl ActivityManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self::with_client(store, client)
    }

    pub fn with_client(store: Arc<dyn Store>, client: reqwest::Client) -> Self {
        Self {
            store,
            client,
            deliveries: TaskTracker::new(),
        }
    }

    /// Waits for the webhook deliveries started so far.
    pub async fn flush(&self) {
        self.deliveries.close();
        self.deliveries.wait().await;
        self.deliveries.reopen();
    }

    fn receivers(issue: &Issue, creator_id: PrincipalId) -> BTreeSet<PrincipalId> {
        [issue.creator_id, issue.assignee_id]
            .into_iter()
            .chain(issue.subscribers.iter().copied())
            .filter(|id| *id != PrincipalId::SYSTEM_BOT && *id != creator_id)
            .collect()
    }

    async fn post_inbox(&self, activity: &Activity, issue: &Issue) {
        for receiver in Self::receivers(issue, activity.creator_id) {
            if let Err(e) = self.store.insert_inbox(receiver, activity.id).await {
                warn!(activity_id = %activity.id, receiver = %receiver, error = %e, "Failed to post inbox entry");
            }
        }
    }

    async fn post_webhooks(&self, activity: &Activity, issue: &Issue) -> Result<()> {
        let webhooks: Vec<_> = self
            .store
            .list_webhooks(issue.project_id)
            .await?
            .into_iter()
            .filter(|w| w.subscribes_to(activity.activity_type))
            .collect();
        if webhooks.is_empty() {
            return Ok(());
        }

        let creator_name = match self.store.get_principal(activity.creator_id).await? {
            Some(principal) => principal.name,
            None => "Strata".to_string(),
        };
        let message = Arc::new(WebhookMessage::new(activity, Some(&issue.name), &creator_name));

        for webhook in webhooks {
            let sender = create_sender(webhook.kind, self.client.clone());
            let message = Arc::clone(&message);
            self.deliveries.spawn(async move {
                match sender.send(&webhook.url, &message).await {
                    Ok(()) => debug!(webhook = %webhook.name, "Webhook delivered"),
                    Err(e) => warn!(webhook = %webhook.name, error = %e, "Webhook delivery failed"),
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ActivitySink for ActivityManager {
    async fn create_activity(&self, create: ActivityCreate, meta: ActivityMeta) -> Result<Activity> {
        let activity = self.store.insert_activity(&create).await?;
        info!(
            activity_id = %activity.id,
            activity_type = activity.activity_type.as_str(),
            "Activity created"
        );

        if let Some(issue) = &meta.issue {
            self.post_inbox(&activity, issue).await;
            if let Err(e) = self.post_webhooks(&activity, issue).await {
                warn!(activity_id = %activity.id, error = %e, "Failed to dispatch webhooks");
            }
        }
        Ok(activity)
    }
}
