//! Webhook dispatcher: POSTs the alarm as JSON to the notification address.
use crate::{ConfigureError, DispatchError, Dispatcher, default_timeout};
use alarm_relay_types::{AlarmMetric, Notification};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct WebhookConfig {
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

/// The posted body. The description is the raw one from the alarm definition,
/// not the rendered one, so receivers can apply their own formatting.
#[derive(Serialize)]
struct WebhookPayload<'a> {
    alarm_id: &'a str,
    alarm_definition_id: &'a str,
    alarm_name: &'a str,
    alarm_description: &'a str,
    alarm_timestamp: f64,
    state: &'a str,
    old_state: &'a str,
    message: &'a str,
    tenant_id: &'a str,
    metrics: &'a [AlarmMetric],
}

#[derive(Default)]
pub struct WebhookDispatcher {
    client: Option<reqwest::Client>,
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn configure(&mut self, section: &serde_yaml::Value) -> Result<(), ConfigureError> {
        let config: WebhookConfig = serde_yaml::from_value(section.clone())?;
        self.client = Some(
            reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout))
                .build()?,
        );
        Ok(())
    }

    async fn send_notification(
        &mut self,
        notification: &Notification,
    ) -> Result<(), DispatchError> {
        let client = self.client.get_or_insert_with(reqwest::Client::new);

        let payload = WebhookPayload {
            alarm_id: &notification.alarm_id,
            alarm_definition_id: &notification.raw_alarm.alarm_definition_id,
            alarm_name: &notification.alarm_name,
            alarm_description: &notification.raw_alarm.alarm_description,
            alarm_timestamp: notification.alarm_timestamp,
            state: &notification.state,
            old_state: &notification.raw_alarm.old_state,
            message: &notification.message,
            tenant_id: &notification.tenant_id,
            metrics: notification.metrics(),
        };

        let response = client
            .post(&notification.address)
            .json(&payload)
            .send()
            .await?;

        if response.status().is_success() {
            debug!("Notification posted to {}", notification.address);
            Ok(())
        } else {
            Err(DispatchError::Status(response.status()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alarm_relay_types::{NotificationAction, RawAlarm};
    use std::collections::BTreeMap;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path},
    };

    fn notification(address: &str) -> Notification {
        let alarm = RawAlarm {
            alarm_id: "a".to_owned(),
            alarm_definition_id: "d".to_owned(),
            alarm_name: "cpu".to_owned(),
            alarm_description: "{{ hostname }} raw".to_owned(),
            new_state: "ALARM".to_owned(),
            old_state: "OK".to_owned(),
            state_change_reason: "r".to_owned(),
            severity: "LOW".to_owned(),
            link: String::new(),
            lifecycle_state: "OPEN".to_owned(),
            tenant_id: "t".to_owned(),
            timestamp: 1_700_000_000_000,
            actions_enabled: true,
            metrics: vec![AlarmMetric {
                name: None,
                dimensions: BTreeMap::from([("hostname".to_owned(), "h1".to_owned())]),
            }],
            sub_alarms: vec![],
        };
        let action = NotificationAction {
            id: "n1".to_owned(),
            kind: "webhook".to_owned(),
            name: "wh".to_owned(),
            address: address.to_owned(),
            period: 0,
        };
        Notification::new(&action, 0, alarm)
    }

    async fn configured_dispatcher() -> WebhookDispatcher {
        let mut dispatcher = WebhookDispatcher::default();
        let section: serde_yaml::Value = serde_yaml::from_str("timeout: 2").unwrap();
        dispatcher.configure(&section).await.unwrap();
        dispatcher
    }

    #[tokio::test]
    async fn posts_alarm_body_with_raw_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .and(body_partial_json(serde_json::json!({
                "alarm_id": "a",
                "alarm_definition_id": "d",
                "alarm_description": "{{ hostname }} raw",
                "state": "ALARM",
                "old_state": "OK",
                "tenant_id": "t",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut dispatcher = configured_dispatcher().await;
        let n = notification(&format!("{}/hook", server.uri()));
        dispatcher.send_notification(&n).await.unwrap();
    }

    #[tokio::test]
    async fn non_2xx_status_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut dispatcher = configured_dispatcher().await;
        let n = notification(&server.uri());
        assert!(matches!(
            dispatcher.send_notification(&n).await,
            Err(DispatchError::Status(status)) if status.as_u16() == 503
        ));
    }

    #[tokio::test]
    async fn unreachable_address_is_a_failure() {
        let mut dispatcher = configured_dispatcher().await;
        let n = notification("http://127.0.0.1:1/hook");
        assert!(matches!(
            dispatcher.send_notification(&n).await,
            Err(DispatchError::Http(_))
        ));
    }
}
