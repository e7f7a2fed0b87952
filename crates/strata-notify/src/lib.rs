//! Notifications for strata.
//!
//! [`ActivityManager`] is the activity sink the schedulers write through.
//! [`HttpApprovalProvider`] talks to an external approval service.

pub mod approval;
pub mod manager;
pub mod sender;

pub use approval::HttpApprovalProvider;
pub use manager::ActivityManager;
pub use sender::{
    DiscordSender, GenericSender, NotificationSender, NotifyError, SlackSender, WebhookMessage,
    create_sender,
};
