//! # Periodic Engine
//!
//! One periodic engine process runs per configured period name. It keeps
//! re-firing notifications for alarms that stay in an offending state:
//! * Consumes its periodic topic; every record is one live re-fire cycle.
//! * Checks the alarm against the configuration store and terminates the
//!   cycle (commit without re-publish) once the alarm is deleted, has changed
//!   state, or is back to `OK`.
//! * Re-dispatches once the period has elapsed since the last attempt,
//!   otherwise sleeps one second; in both cases the record is re-published to
//!   the same topic to keep the cycle alive.
//!
//! The cycle therefore lives entirely in the message log, not in in-process
//! timers, which makes it restart-safe and horizontally scalable per
//! topic-partition.
mod error;

use crate::error::PeriodicEngineError;
use alarm_relay_common::{
    config,
    engine::{Engine, Handler},
    metrics::{
        component_info_metric,
        names::{
            CONFIGDB_ERRORS, KAFKA_CONSUMER_ERRORS, KAFKA_PRODUCER_ERRORS,
            NOTIFICATION_SEND_ERRORS, NOTIFICATIONS_FAILED_PARSE, NOTIFICATIONS_SENT,
        },
    },
    unix_time,
};
use alarm_relay_config_store::{ConfigRepo, DatabaseError, MySqlRepo, construct_notification};
use alarm_relay_dispatch::DispatchRegistry;
use alarm_relay_types::Notification;
use clap::Parser;
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use miette::{IntoDiagnostic, miette};
use rdkafka::{Message, message::BorrowedMessage};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tokio::time::sleep;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// [clap] derived struct to handle command line parameters.
#[derive(Debug, Parser)]
#[clap(author, version = alarm_relay_common::version!(), about)]
struct Cli {
    /// Path to the pipeline configuration file
    #[clap(long)]
    config: PathBuf,

    /// Period name to serve; must name an entry under `kafka.periodic`
    period: String,

    /// Endpoint on which Prometheus text format metrics are available
    #[clap(long, env, default_value = "127.0.0.1:9092")]
    observability_address: SocketAddr,
}

/// Entry point.
#[tokio::main]
async fn main() -> miette::Result<()> {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::load(&args.config).into_diagnostic()?;

    let Some(topic) = config.kafka.periodic.get(&args.period).cloned() else {
        return Err(miette!(
            "no periodic topic configured for period {:?}; configured periods: {}",
            args.period,
            config
                .kafka
                .periodic
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        ));
    };

    // Install exporter and register metrics
    let builder = PrometheusBuilder::new();
    builder
        .with_http_listener(args.observability_address)
        .install()
        .into_diagnostic()?;

    describe_counter!(
        NOTIFICATIONS_FAILED_PARSE,
        metrics::Unit::Count,
        "Number of periodic records that failed to parse"
    );
    describe_counter!(
        NOTIFICATIONS_SENT,
        metrics::Unit::Count,
        "Number of notifications successfully dispatched"
    );
    describe_counter!(
        NOTIFICATION_SEND_ERRORS,
        metrics::Unit::Count,
        "Number of notification dispatch failures"
    );
    describe_counter!(
        KAFKA_CONSUMER_ERRORS,
        metrics::Unit::Count,
        "Errors reading from the message log"
    );
    describe_counter!(
        KAFKA_PRODUCER_ERRORS,
        metrics::Unit::Count,
        "Errors publishing to the message log"
    );
    describe_counter!(
        CONFIGDB_ERRORS,
        metrics::Unit::Count,
        "Errors accessing the configuration store"
    );

    let repo = MySqlRepo::connect(&config.mysql);

    let registry = DispatchRegistry::configure(&config.notification_types).await;
    if registry.is_empty() {
        return Err(miette!("no notification dispatcher could be configured"));
    }
    registry.register_method_types(&repo).await.into_diagnostic()?;

    let engine = Engine::new(&config.kafka, &topic).into_diagnostic()?;

    component_info_metric("periodic-engine");

    let mut handler = PeriodicHandler {
        repo,
        registry,
        topic,
    };

    engine.run(&mut handler).await.into_diagnostic()
}

struct PeriodicHandler<R> {
    repo: R,
    registry: DispatchRegistry,
    topic: String,
}

impl<R: ConfigRepo> PeriodicHandler<R> {
    /// Queries the alarm's current state, retrying once on a store failure.
    async fn keep_sending(&self, notification: &Notification) -> Result<bool, DatabaseError> {
        let current_state = match self
            .repo
            .get_alarm_current_state(&notification.alarm_id)
            .await
        {
            Ok(state) => state,
            Err(e) => {
                debug!("Database error, attempting reconnect: {e}");
                self.repo
                    .get_alarm_current_state(&notification.alarm_id)
                    .await?
            }
        };
        Ok(still_firing(current_state.as_deref(), &notification.state))
    }
}

impl<R: ConfigRepo> Handler for PeriodicHandler<R> {
    type Error = PeriodicEngineError;

    async fn handle(
        &mut self,
        engine: &Engine,
        msg: &BorrowedMessage<'_>,
    ) -> Result<(), Self::Error> {
        let payload = msg.payload().unwrap_or_default();
        let data: Notification = match serde_json::from_slice(payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "Invalid notification on periodic topic, skipping partition {}, offset {}: {e}",
                    msg.partition(),
                    msg.offset()
                );
                counter!(NOTIFICATIONS_FAILED_PARSE).increment(1);
                engine.commit(msg)?;
                return Ok(());
            }
        };

        let Some(mut notification) = construct_notification(&self.repo, &data).await? else {
            debug!("Notification method {} no longer exists, dropping", data.id);
            engine.commit(msg)?;
            return Ok(());
        };

        // Records without a dispatch timestamp never went through the
        // notification engine's seeding; nothing to re-fire from.
        let Some(last_sent) = data.notification_timestamp else {
            debug!(
                "Notification timestamp empty for {} with name {} at {}",
                notification.kind, notification.name, notification.address
            );
            engine.commit(msg)?;
            return Ok(());
        };

        if !self.keep_sending(&notification).await? {
            engine.commit(msg)?;
            return Ok(());
        }

        let wait = remaining_wait(notification.period, last_sent, unix_time());
        debug!("Wait duration {wait}");
        let notification = if wait < 0.0 {
            debug!(
                "Periodic firing for {} with name {} at {} with period {}",
                notification.kind, notification.name, notification.address, notification.period
            );
            notification.notification_timestamp = Some(unix_time());
            let outcome = self.registry.send(vec![notification]).await;
            match outcome.into_single() {
                Some(notification) => notification,
                None => {
                    engine.commit(msg)?;
                    return Ok(());
                }
            }
        } else {
            notification.notification_timestamp = Some(last_sent);
            sleep(Duration::from_secs(1)).await;
            notification
        };

        engine.publish(&self.topic, &[notification]).await?;
        engine.commit(msg)?;
        Ok(())
    }
}

/// An alarm keeps its periodic cycle alive only while it still exists,
/// remains in the state that fired the notification, and that state is not
/// `OK`.
fn still_firing(current_state: Option<&str>, original_state: &str) -> bool {
    match current_state {
        None => false,
        Some("OK") => false,
        Some(state) => state == original_state,
    }
}

/// Seconds until the next re-fire of a notification last attempted at
/// `last_sent`; negative once the period has elapsed.
fn remaining_wait(period: u32, last_sent: f64, now: f64) -> f64 {
    period as f64 - (now - last_sent)
}
