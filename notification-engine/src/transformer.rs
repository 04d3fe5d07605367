//! Turns one alarm-transition record into its notifications.
use alarm_relay_common::metrics::names::{
    ALARMS_FAILED_PARSE, ALARMS_NO_NOTIFICATION, NOTIFICATIONS_CREATED,
};
use alarm_relay_config_store::{ConfigRepo, DatabaseError};
use alarm_relay_types::{AlarmTransition, Notification, RawAlarm};
use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, warn};

pub(crate) struct AlarmTransformer<R> {
    repo: R,
    /// Alarms older than this many seconds are dropped; `None` disables the check.
    ttl: Option<u64>,
}

impl<R: ConfigRepo> AlarmTransformer<R> {
    pub(crate) fn new(repo: R, ttl: Option<u64>) -> Self {
        Self { repo, ttl }
    }

    /// Parses and validates one alarm record and fans it out into one
    /// notification per subscribed action, in store order.
    ///
    /// Malformed and filtered-out records yield an empty batch so the caller
    /// still commits them; only a store failure that survives one retry
    /// propagates, aborting the engine without a commit.
    pub(crate) async fn to_notifications(
        &self,
        partition: i32,
        offset: i64,
        payload: &[u8],
    ) -> Result<Vec<Notification>, DatabaseError> {
        let alarm = match serde_json::from_slice::<AlarmTransition>(payload) {
            Ok(transition) => transition.alarm,
            Err(e) => {
                warn!("Invalid alarm format, skipping partition {partition}, offset {offset}: {e}");
                counter!(ALARMS_FAILED_PARSE).increment(1);
                return Ok(vec![]);
            }
        };
        debug!(
            "Read alarm {} from partition {partition}, offset {offset}",
            alarm.alarm_id
        );

        if !self.alarm_is_valid(&alarm) {
            counter!(ALARMS_NO_NOTIFICATION).increment(1);
            return Ok(vec![]);
        }

        let actions = match self.repo.fetch_notification(&alarm).await {
            Ok(actions) => actions,
            Err(e) => {
                debug!("Database error, attempting reconnect: {e}");
                self.repo.fetch_notification(&alarm).await?
            }
        };

        let notifications: Vec<Notification> = actions
            .iter()
            .map(|action| Notification::new(action, 0, alarm.clone()))
            .collect();

        if notifications.is_empty() {
            debug!(
                "No notifications found for alarm {}, partition {partition}, offset {offset}",
                alarm.alarm_id
            );
            counter!(ALARMS_NO_NOTIFICATION).increment(1);
        } else {
            debug!(
                "Found {} notifications for alarm {}",
                notifications.len(),
                alarm.alarm_id
            );
            counter!(NOTIFICATIONS_CREATED).increment(notifications.len() as u64);
        }
        Ok(notifications)
    }

    /// An alarm produces notifications only when its actions are enabled and
    /// it is younger than the configured TTL.
    fn alarm_is_valid(&self, alarm: &RawAlarm) -> bool {
        if !alarm.actions_enabled {
            debug!("Actions are disabled for alarm {}", alarm.alarm_id);
            return false;
        }

        if let Some(ttl) = self.ttl {
            let age_seconds = Utc::now().timestamp_millis().saturating_sub(alarm.timestamp) / 1000;
            if age_seconds > ttl as i64 {
                let fired_at = DateTime::<Utc>::from_timestamp_millis(alarm.timestamp)
                    .map(|t| t.to_rfc2822())
                    .unwrap_or_default();
                warn!("Received alarm older than the ttl, skipping. Alarm from {fired_at}");
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alarm_relay_types::NotificationAction;
    use async_trait::async_trait;
    use std::{
        collections::BTreeSet,
        sync::atomic::{AtomicU32, Ordering},
    };

    /// Store fake returning fixed actions, optionally failing the first
    /// `failures` calls.
    struct FakeRepo {
        actions: Vec<NotificationAction>,
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl FakeRepo {
        fn with_actions(actions: Vec<NotificationAction>) -> Self {
            Self {
                actions,
                failures: AtomicU32::new(0),
                calls: AtomicU32::new(0),
            }
        }

        fn failing_first(actions: Vec<NotificationAction>, failures: u32) -> Self {
            Self {
                actions,
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ConfigRepo for FakeRepo {
        async fn fetch_notification(
            &self,
            _alarm: &RawAlarm,
        ) -> Result<Vec<NotificationAction>, DatabaseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(DatabaseError::message("connection lost"));
            }
            Ok(self.actions.clone())
        }

        async fn get_notification(
            &self,
            _notification_id: &str,
        ) -> Result<Option<NotificationAction>, DatabaseError> {
            Ok(None)
        }

        async fn get_alarm_current_state(
            &self,
            _alarm_id: &str,
        ) -> Result<Option<String>, DatabaseError> {
            Ok(None)
        }

        async fn fetch_notification_method_types(&self) -> Result<BTreeSet<String>, DatabaseError> {
            Ok(BTreeSet::new())
        }

        async fn insert_notification_method_types(
            &self,
            _kinds: &BTreeSet<String>,
        ) -> Result<(), DatabaseError> {
            Ok(())
        }
    }

    fn webhook_action() -> NotificationAction {
        NotificationAction {
            id: "n1".to_owned(),
            kind: "webhook".to_owned(),
            name: "wh".to_owned(),
            address: "http://x".to_owned(),
            period: 0,
        }
    }

    fn alarm_payload(actions_enabled: bool, timestamp_ms: i64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "alarm-transitioned": {
                "alarmId": "a",
                "alarmDefinitionId": "d",
                "alarmName": "cpu",
                "newState": "ALARM",
                "oldState": "OK",
                "stateChangeReason": "r",
                "severity": "LOW",
                "link": "",
                "lifecycleState": "OPEN",
                "tenantId": "t",
                "timestamp": timestamp_ms,
                "actionsEnabled": actions_enabled,
                "metrics": [{"dimensions": {"hostname": "h1"}}],
                "subAlarms": [],
                "alarmDescription": "",
            }
        }))
        .expect("payload serialises")
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[tokio::test]
    async fn one_action_yields_one_notification() {
        let transformer =
            AlarmTransformer::new(FakeRepo::with_actions(vec![webhook_action()]), Some(14400));

        let notifications = transformer
            .to_notifications(0, 0, &alarm_payload(true, now_ms()))
            .await
            .unwrap();

        assert_eq!(notifications.len(), 1);
        let n = &notifications[0];
        assert_eq!(n.alarm_id, "a");
        assert_eq!(n.kind, "webhook");
        assert_eq!(n.state, "ALARM");
        assert_eq!(n.retry_count, 0);
        assert!(n.notification_timestamp.is_none());
    }

    #[tokio::test]
    async fn disabled_actions_produce_nothing() {
        let transformer =
            AlarmTransformer::new(FakeRepo::with_actions(vec![webhook_action()]), Some(14400));
        let notifications = transformer
            .to_notifications(0, 0, &alarm_payload(false, now_ms()))
            .await
            .unwrap();
        assert!(notifications.is_empty());
    }

    #[tokio::test]
    async fn stale_alarm_is_dropped() {
        let ttl = 14400u64;
        let transformer =
            AlarmTransformer::new(FakeRepo::with_actions(vec![webhook_action()]), Some(ttl));
        let stale = now_ms() - ((ttl + 60) * 1000) as i64;
        let notifications = transformer
            .to_notifications(0, 0, &alarm_payload(true, stale))
            .await
            .unwrap();
        assert!(notifications.is_empty());
    }

    #[tokio::test]
    async fn without_ttl_old_alarms_still_pass() {
        let transformer =
            AlarmTransformer::new(FakeRepo::with_actions(vec![webhook_action()]), None);
        let notifications = transformer
            .to_notifications(0, 0, &alarm_payload(true, 1_700_000_000_000))
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
    }

    #[tokio::test]
    async fn malformed_record_yields_empty_batch() {
        let transformer =
            AlarmTransformer::new(FakeRepo::with_actions(vec![webhook_action()]), None);
        let notifications = transformer
            .to_notifications(0, 0, b"not json at all")
            .await
            .unwrap();
        assert!(notifications.is_empty());
    }

    #[tokio::test]
    async fn store_failure_is_retried_once() {
        let repo = FakeRepo::failing_first(vec![webhook_action()], 1);
        let transformer = AlarmTransformer::new(repo, None);
        let notifications = transformer
            .to_notifications(0, 0, &alarm_payload(true, now_ms()))
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(transformer.repo.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_store_failure_propagates() {
        let repo = FakeRepo::failing_first(vec![webhook_action()], 2);
        let transformer = AlarmTransformer::new(repo, None);
        assert!(
            transformer
                .to_notifications(0, 0, &alarm_payload(true, now_ms()))
                .await
                .is_err()
        );
        assert_eq!(transformer.repo.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn action_order_and_duplicates_are_preserved() {
        let mut email = webhook_action();
        email.id = "n2".to_owned();
        email.kind = "email".to_owned();
        let actions = vec![webhook_action(), email, webhook_action()];
        let transformer = AlarmTransformer::new(FakeRepo::with_actions(actions), None);

        let notifications = transformer
            .to_notifications(0, 0, &alarm_payload(true, now_ms()))
            .await
            .unwrap();

        let kinds: Vec<&str> = notifications.iter().map(|n| n.kind.as_str()).collect();
        assert_eq!(kinds, vec!["webhook", "email", "webhook"]);
    }
}
