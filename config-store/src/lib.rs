//! Read adapter over the relational configuration store.
//!
//! The pipeline uses the store for two lookups (the notification actions
//! subscribed to an alarm, and an alarm's current state), for reconstructing
//! in-flight notifications by action id, and for registering the channel
//! kinds it has active dispatchers for. All methods surface a single typed
//! [DatabaseError]; recovery policy (retry once, or abort without commit)
//! belongs to the callers.
use alarm_relay_common::metrics::names::CONFIGDB_ERRORS;
use alarm_relay_types::{Notification, NotificationAction, RawAlarm};
use async_trait::async_trait;
use metrics::counter;
use sqlx::{
    MySqlPool, Row,
    mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow, MySqlSslMode},
};
use std::collections::BTreeSet;
use thiserror::Error;

pub use alarm_relay_common::config::MysqlConfig;

#[derive(Debug, Error)]
#[error("database error: {0}")]
pub struct DatabaseError(sqlx::Error);

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        counter!(CONFIGDB_ERRORS).increment(1);
        Self(e)
    }
}

impl DatabaseError {
    /// An error with no underlying driver cause, for alternative backends
    /// and tests.
    pub fn message(message: impl Into<String>) -> Self {
        Self(sqlx::Error::Protocol(message.into()))
    }
}

/// The store surface used by the engines.
#[async_trait]
pub trait ConfigRepo: Send + Sync {
    /// Returns the actions subscribed to `(alarm_definition_id, new_state)`,
    /// in store order, duplicates included.
    async fn fetch_notification(
        &self,
        alarm: &RawAlarm,
    ) -> Result<Vec<NotificationAction>, DatabaseError>;

    /// Looks an action up by id; `None` when it has been deleted.
    async fn get_notification(
        &self,
        notification_id: &str,
    ) -> Result<Option<NotificationAction>, DatabaseError>;

    /// Current state of an alarm; `None` when the alarm has been deleted.
    async fn get_alarm_current_state(
        &self,
        alarm_id: &str,
    ) -> Result<Option<String>, DatabaseError>;

    async fn fetch_notification_method_types(&self) -> Result<BTreeSet<String>, DatabaseError>;

    /// Idempotent registration of channel kinds.
    async fn insert_notification_method_types(
        &self,
        kinds: &BTreeSet<String>,
    ) -> Result<(), DatabaseError>;
}

/// MySQL implementation backed by a lazily-connecting pool; connections are
/// re-established by the pool after any error.
pub struct MySqlRepo {
    pool: MySqlPool,
}

impl MySqlRepo {
    pub fn connect(config: &MysqlConfig) -> Self {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.passwd)
            .database(&config.db);
        if let Some(ssl) = &config.ssl {
            options = options.ssl_mode(MySqlSslMode::VerifyCa);
            if let Some(ca) = &ssl.ca {
                options = options.ssl_ca(ca);
            }
        }
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(options);
        Self { pool }
    }
}

#[async_trait]
impl ConfigRepo for MySqlRepo {
    async fn fetch_notification(
        &self,
        alarm: &RawAlarm,
    ) -> Result<Vec<NotificationAction>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT nm.id, nm.type, nm.name, nm.address, nm.period \
             FROM alarm_action aa \
             JOIN notification_method nm ON aa.action_id = nm.id \
             WHERE aa.alarm_definition_id = ? AND aa.alarm_state = ?",
        )
        .bind(&alarm.alarm_definition_id)
        .bind(&alarm.new_state)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_action).collect()
    }

    async fn get_notification(
        &self,
        notification_id: &str,
    ) -> Result<Option<NotificationAction>, DatabaseError> {
        let row = sqlx::query(
            "SELECT id, type, name, address, period FROM notification_method WHERE id = ?",
        )
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_action).transpose()
    }

    async fn get_alarm_current_state(
        &self,
        alarm_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let row = sqlx::query("SELECT state FROM alarm WHERE id = ?")
            .bind(alarm_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.try_get("state")).transpose()?)
    }

    async fn fetch_notification_method_types(&self) -> Result<BTreeSet<String>, DatabaseError> {
        let rows = sqlx::query("SELECT name FROM notification_method_type")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| row.try_get("name"))
            .collect::<Result<_, _>>()?)
    }

    async fn insert_notification_method_types(
        &self,
        kinds: &BTreeSet<String>,
    ) -> Result<(), DatabaseError> {
        for kind in kinds {
            sqlx::query("INSERT IGNORE INTO notification_method_type (name) VALUES (?)")
                .bind(kind)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

fn row_to_action(row: MySqlRow) -> Result<NotificationAction, DatabaseError> {
    Ok(NotificationAction {
        id: row.try_get("id")?,
        kind: row.try_get::<String, _>("type")?.to_lowercase(),
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        period: row.try_get::<i32, _>("period")?.max(0) as u32,
    })
}

/// Rebuilds a notification consumed from the retry or periodic topic against
/// the current content of the store, so address/name/period changes made
/// since the original firing take effect. Returns `None` when the backing
/// action has been deleted.
pub async fn construct_notification<R: ConfigRepo + ?Sized>(
    repo: &R,
    data: &Notification,
) -> Result<Option<Notification>, DatabaseError> {
    let Some(action) = repo.get_notification(&data.id).await? else {
        return Ok(None);
    };
    let mut notification = Notification::new(&action, data.retry_count, data.raw_alarm.clone());
    notification.notification_timestamp = data.notification_timestamp;
    Ok(Some(notification))
}

#[cfg(test)]
mod test {
    use super::*;
    use alarm_relay_types::AlarmMetric;

    struct SingleActionRepo {
        action: Option<NotificationAction>,
    }

    #[async_trait]
    impl ConfigRepo for SingleActionRepo {
        async fn fetch_notification(
            &self,
            _alarm: &RawAlarm,
        ) -> Result<Vec<NotificationAction>, DatabaseError> {
            Ok(self.action.clone().into_iter().collect())
        }

        async fn get_notification(
            &self,
            notification_id: &str,
        ) -> Result<Option<NotificationAction>, DatabaseError> {
            Ok(self
                .action
                .clone()
                .filter(|action| action.id == notification_id))
        }

        async fn get_alarm_current_state(
            &self,
            _alarm_id: &str,
        ) -> Result<Option<String>, DatabaseError> {
            Ok(None)
        }

        async fn fetch_notification_method_types(
            &self,
        ) -> Result<BTreeSet<String>, DatabaseError> {
            Ok(BTreeSet::new())
        }

        async fn insert_notification_method_types(
            &self,
            _kinds: &BTreeSet<String>,
        ) -> Result<(), DatabaseError> {
            Ok(())
        }
    }

    fn raw_alarm() -> RawAlarm {
        RawAlarm {
            alarm_id: "a".to_owned(),
            alarm_definition_id: "d".to_owned(),
            alarm_name: "cpu".to_owned(),
            alarm_description: String::new(),
            new_state: "ALARM".to_owned(),
            old_state: "OK".to_owned(),
            state_change_reason: "r".to_owned(),
            severity: "LOW".to_owned(),
            link: String::new(),
            lifecycle_state: "OPEN".to_owned(),
            tenant_id: "t".to_owned(),
            timestamp: 1_700_000_000_000,
            actions_enabled: true,
            metrics: vec![AlarmMetric::default()],
            sub_alarms: vec![],
        }
    }

    fn action() -> NotificationAction {
        NotificationAction {
            id: "n1".to_owned(),
            kind: "webhook".to_owned(),
            name: "wh".to_owned(),
            address: "http://x".to_owned(),
            period: 0,
        }
    }

    #[tokio::test]
    async fn reconstruction_uses_current_store_content() {
        let mut updated = action();
        updated.address = "http://moved".to_owned();
        let repo = SingleActionRepo {
            action: Some(updated),
        };

        let mut carried = Notification::new(&action(), 2, raw_alarm());
        carried.notification_timestamp = Some(1_700_000_100.0);

        let rebuilt = construct_notification(&repo, &carried)
            .await
            .unwrap()
            .expect("action exists");
        assert_eq!(rebuilt.address, "http://moved");
        assert_eq!(rebuilt.retry_count, 2);
        assert_eq!(rebuilt.notification_timestamp, Some(1_700_000_100.0));
    }

    #[tokio::test]
    async fn reconstruction_of_deleted_action_returns_none() {
        let repo = SingleActionRepo { action: None };
        let carried = Notification::new(&action(), 0, raw_alarm());
        assert!(
            construct_notification(&repo, &carried)
                .await
                .unwrap()
                .is_none()
        );
    }
}
