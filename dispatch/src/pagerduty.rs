//! Paging dispatcher: triggers an incident with the paging provider.
use crate::{ConfigureError, DispatchError, Dispatcher, default_timeout};
use alarm_relay_types::Notification;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

const DEFAULT_EVENTS_URL: &str =
    "https://events.pagerduty.com/generic/2010-04-15/create_event.json";

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct PagerdutyConfig {
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Provider event endpoint; overridable for regional/test endpoints.
    #[serde(default = "default_events_url")]
    pub url: String,
}

fn default_events_url() -> String {
    DEFAULT_EVENTS_URL.to_owned()
}

#[derive(Default)]
pub struct PagerdutyDispatcher {
    config: Option<PagerdutyConfig>,
    client: Option<reqwest::Client>,
}

#[async_trait]
impl Dispatcher for PagerdutyDispatcher {
    fn kind(&self) -> &'static str {
        "pagerduty"
    }

    async fn configure(&mut self, section: &serde_yaml::Value) -> Result<(), ConfigureError> {
        let config: PagerdutyConfig = serde_yaml::from_value(section.clone())?;
        self.client = Some(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout))
                .build()?,
        );
        self.config = Some(config);
        Ok(())
    }

    async fn send_notification(
        &mut self,
        notification: &Notification,
    ) -> Result<(), DispatchError> {
        let url = self
            .config
            .as_ref()
            .map(|config| config.url.clone())
            .unwrap_or_else(default_events_url);
        let client = self.client.get_or_insert_with(reqwest::Client::new);

        // The notification address carries the integration service key.
        let body = json!({
            "service_key": notification.address,
            "event_type": "trigger",
            "description": notification.message,
            "client": "alarm-relay",
            "client_url": "",
            "details": {
                "alarm_id": notification.alarm_id,
                "alarm_name": notification.alarm_name,
                "current": notification.state,
                "message": notification.message,
            },
        });

        let response = client.post(&url).json(&body).send().await?;

        if response.status().is_success() {
            debug!("Paging event triggered for alarm {}", notification.alarm_id);
            Ok(())
        } else {
            Err(DispatchError::Status(response.status()))
        }
    }
}
