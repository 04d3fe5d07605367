//! Channel dispatchers and the registry that multiplexes across them.
//!
//! A dispatcher owns the outbound I/O for one notification kind. The set of
//! available dispatchers is fixed at build time: the built-ins plus any
//! optional ones enabled by name through `notification_types.plugins`; there
//! is no runtime code loading. Each dispatcher is configured once at startup
//! from its own configuration section, and a configuration failure removes
//! only that dispatcher from the active set.
mod email;
mod pagerduty;
mod registry;
mod slack;
mod template;
mod webhook;

pub use email::EmailDispatcher;
pub use pagerduty::PagerdutyDispatcher;
pub use registry::{DispatchRegistry, SendOutcome};
pub use slack::SlackDispatcher;
pub use webhook::WebhookDispatcher;

use alarm_relay_types::Notification;
use async_trait::async_trait;
use thiserror::Error;

/// Default I/O timeout, seconds, merged under every channel section.
pub(crate) fn default_timeout() -> u64 {
    5
}

#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error("invalid channel configuration: {0}")]
    Section(#[from] serde_yaml::Error),
    #[error("failed to load template file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid channel template: {0}")]
    Template(#[from] minijinja::Error),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("failed to build mail message: {0}")]
    Mail(#[from] lettre::error::Error),
    #[error("invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("no SMTP connection available")]
    SmtpUnavailable,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),
    #[error("channel rejected the message: {0}")]
    Rejected(String),
    #[error("template rendering failed: {0}")]
    Template(#[from] minijinja::Error),
    #[error("invalid address URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("payload serialisation failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// The capability set every channel dispatcher provides.
#[async_trait]
pub trait Dispatcher: Send {
    /// Stable lower-case identifier, matched against [Notification::kind].
    fn kind(&self) -> &'static str;

    /// Applies the channel's configuration section. An error removes the
    /// dispatcher from the active set.
    async fn configure(&mut self, section: &serde_yaml::Value) -> Result<(), ConfigureError>;

    /// Delivers one notification. `Ok` means delivered; any error classifies
    /// the notification as failed.
    async fn send_notification(&mut self, notification: &Notification)
    -> Result<(), DispatchError>;
}
