//! The registry owning the active dispatchers.
use crate::{
    DispatchError, Dispatcher, EmailDispatcher, PagerdutyDispatcher, SlackDispatcher,
    WebhookDispatcher,
};
use alarm_relay_common::{
    config::NotificationTypesConfig,
    metrics::{
        INVALID_KIND,
        names::{NOTIFICATION_SEND_ERRORS, NOTIFICATIONS_SENT},
        notification_type_label,
    },
    unix_time,
};
use alarm_relay_config_store::{ConfigRepo, DatabaseError};
use alarm_relay_types::Notification;
use metrics::counter;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, warn};

/// Classification of one batch offered to the dispatchers.
///
/// `invalid` holds notifications whose kind has no active dispatcher; they
/// are counted here and dropped by the engines.
#[derive(Debug, Default)]
pub struct SendOutcome {
    pub sent: Vec<Notification>,
    pub failed: Vec<Notification>,
    pub invalid: Vec<Notification>,
}

impl SendOutcome {
    /// The notification of a one-element send, whatever it classified as.
    pub fn into_single(self) -> Option<Notification> {
        let Self {
            mut sent,
            mut failed,
            mut invalid,
        } = self;
        sent.pop().or_else(|| failed.pop()).or_else(|| invalid.pop())
    }
}

fn builtin_dispatchers() -> Vec<Box<dyn Dispatcher>> {
    vec![
        Box::new(EmailDispatcher::default()),
        Box::new(WebhookDispatcher::default()),
        Box::new(PagerdutyDispatcher::default()),
    ]
}

/// Optional dispatchers enabled by name through `notification_types.plugins`.
fn plugin_dispatcher(name: &str) -> Option<Box<dyn Dispatcher>> {
    match name {
        "slack" => Some(Box::new(SlackDispatcher::default())),
        _ => None,
    }
}

/// Owns the configured dispatchers of one engine process and multiplexes
/// outgoing notifications across them.
pub struct DispatchRegistry {
    active: BTreeMap<&'static str, Box<dyn Dispatcher>>,
}

impl DispatchRegistry {
    /// Configures the built-in dispatchers plus any named plugins.
    ///
    /// Failures are isolated per dispatcher: a kind whose section fails to
    /// apply is left out of the active set, a kind without a section is
    /// skipped with a warning.
    pub async fn configure(config: &NotificationTypesConfig) -> Self {
        let mut candidates = builtin_dispatchers();
        for name in &config.plugins {
            match plugin_dispatcher(name) {
                Some(dispatcher) => candidates.push(dispatcher),
                None => error!("Unknown notification plugin {name}, ignoring it"),
            }
        }

        let mut active = BTreeMap::new();
        for mut dispatcher in candidates {
            let kind = dispatcher.kind();
            let Some(section) = config.channels.get(kind) else {
                warn!("No config data for notification type {kind}");
                continue;
            };
            match dispatcher.configure(section).await {
                Ok(()) => {
                    info!("{kind} notification ready");
                    active.insert(kind, dispatcher);
                }
                Err(e) => error!("Config exception for {kind}: {e}"),
            }
        }

        let unconfigured: Vec<&str> = config
            .channels
            .keys()
            .map(String::as_str)
            .filter(|kind| !active.contains_key(kind))
            .collect();
        if !unconfigured.is_empty() {
            warn!("No notifiers found for {}", unconfigured.join(", "));
        }

        Self { active }
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_kinds(&self) -> BTreeSet<String> {
        self.active.keys().map(|kind| (*kind).to_owned()).collect()
    }

    /// Persists any active kinds the configuration store does not know yet.
    pub async fn register_method_types<R: ConfigRepo + ?Sized>(
        &self,
        repo: &R,
    ) -> Result<(), DatabaseError> {
        let persisted = repo.fetch_notification_method_types().await?;
        let missing: BTreeSet<String> = self
            .active_kinds()
            .difference(&persisted)
            .cloned()
            .collect();
        if !missing.is_empty() {
            info!(
                "New notification types detected, adding {} to the store",
                missing.iter().cloned().collect::<Vec<_>>().join(", ")
            );
            repo.insert_notification_method_types(&missing).await?;
        }
        Ok(())
    }

    /// Offers each notification to the dispatcher for its kind and classifies
    /// the results. Every notification gets its `notification_timestamp`
    /// stamped before the attempt; a dispatcher error affects only its own
    /// notification.
    pub async fn send(&mut self, notifications: Vec<Notification>) -> SendOutcome {
        let mut outcome = SendOutcome::default();

        for mut notification in notifications {
            let Some(dispatcher) = self.active.get_mut(notification.kind.as_str()) else {
                warn!(
                    "Attempting to send notification of unconfigured kind {}",
                    notification.kind
                );
                outcome.invalid.push(notification);
                continue;
            };

            notification.notification_timestamp = Some(unix_time());

            match dispatcher.send_notification(&notification).await {
                Ok(()) => {
                    counter!(
                        NOTIFICATIONS_SENT,
                        &[notification_type_label(&notification.kind)]
                    )
                    .increment(1);
                    outcome.sent.push(notification);
                }
                Err(e) => {
                    warn!(
                        "Failed sending {} notification {} to {}: {e}",
                        notification.kind, notification.name, notification.address
                    );
                    counter!(
                        NOTIFICATION_SEND_ERRORS,
                        &[notification_type_label(&notification.kind)]
                    )
                    .increment(1);
                    outcome.failed.push(notification);
                }
            }
        }

        if !outcome.invalid.is_empty() {
            counter!(
                NOTIFICATION_SEND_ERRORS,
                &[notification_type_label(INVALID_KIND)]
            )
            .increment(outcome.invalid.len() as u64);
        }

        outcome
    }
}
