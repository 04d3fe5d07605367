//! # Notification Engine
//!
//! The notification engine performs the following functions:
//! * Consumes alarm state-transition records from the alarm topic.
//! * Matches each alarm against the notification actions subscribed to it in
//!   the configuration store and fans it out into notifications.
//! * Dispatches the notifications over their channels and routes the results:
//!   delivered ones to the notification topic, failed ones to the retry topic.
//! * Seeds the periodic topic with a copy of each periodic webhook
//!   notification, starting its re-fire cycle.
//! * Commits the record's offset exactly once, after routing.
//!
//! ## Error Conditions
//! * Malformed alarm records are counted and committed so they cannot block
//!   the partition.
//! * A configuration-store failure that survives one retry aborts the engine
//!   without committing; the record is replayed after a restart.
//! * Because offsets commit after publishing, a crash can duplicate an
//!   alarm's notifications; downstream consumers must tolerate replays.
mod error;
mod transformer;

use crate::{error::NotificationEngineError, transformer::AlarmTransformer};
use alarm_relay_common::{
    config,
    engine::{Engine, Handler},
    metrics::{
        component_info_metric,
        names::{
            ALARMS_FAILED_PARSE, ALARMS_NO_NOTIFICATION, ALARMS_PROCESSED, CONFIGDB_ERRORS,
            KAFKA_CONSUMER_ERRORS, KAFKA_PRODUCER_ERRORS, NOTIFICATION_SEND_ERRORS,
            NOTIFICATIONS_CREATED, NOTIFICATIONS_SENT,
        },
    },
};
use alarm_relay_config_store::{ConfigRepo, MySqlRepo};
use alarm_relay_dispatch::DispatchRegistry;
use alarm_relay_types::Notification;
use clap::Parser;
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use miette::{IntoDiagnostic, miette};
use rdkafka::{Message, message::BorrowedMessage};
use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf};
use tracing_subscriber::EnvFilter;

/// [clap] derived struct to handle command line parameters.
#[derive(Debug, Parser)]
#[clap(author, version = alarm_relay_common::version!(), about)]
struct Cli {
    /// Path to the pipeline configuration file
    #[clap(long)]
    config: PathBuf,

    /// Endpoint on which Prometheus text format metrics are available
    #[clap(long, env, default_value = "127.0.0.1:9090")]
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

    // Install exporter and register metrics
    let builder = PrometheusBuilder::new();
    builder
        .with_http_listener(args.observability_address)
        .install()
        .into_diagnostic()?;

    describe_counter!(
        ALARMS_PROCESSED,
        metrics::Unit::Count,
        "Number of alarm records handled and committed"
    );
    describe_counter!(
        ALARMS_FAILED_PARSE,
        metrics::Unit::Count,
        "Number of alarm records that failed to parse"
    );
    describe_counter!(
        ALARMS_NO_NOTIFICATION,
        metrics::Unit::Count,
        "Number of alarm records that produced no notifications"
    );
    describe_counter!(
        NOTIFICATIONS_CREATED,
        metrics::Unit::Count,
        "Number of notifications created from matched actions"
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

    let engine = Engine::new(&config.kafka, &config.kafka.alarm_topic).into_diagnostic()?;

    component_info_metric("notification-engine");

    let mut handler = NotificationHandler {
        transformer: AlarmTransformer::new(repo, config.processors.alarm.ttl),
        registry,
        notification_topic: config.kafka.notification_topic.clone(),
        retry_topic: config.kafka.notification_retry_topic.clone(),
        periodic_topics: config.kafka.periodic.clone(),
    };

    engine.run(&mut handler).await.into_diagnostic()
}

struct NotificationHandler<R> {
    transformer: AlarmTransformer<R>,
    registry: DispatchRegistry,
    notification_topic: String,
    retry_topic: String,
    periodic_topics: BTreeMap<String, String>,
}

impl<R: ConfigRepo> Handler for NotificationHandler<R> {
    type Error = NotificationEngineError;

    async fn handle(
        &mut self,
        engine: &Engine,
        msg: &BorrowedMessage<'_>,
    ) -> Result<(), Self::Error> {
        let payload = msg.payload().unwrap_or_default();
        let notifications = self
            .transformer
            .to_notifications(msg.partition(), msg.offset(), payload)
            .await?;

        if !notifications.is_empty() {
            // The first firing of a periodic webhook seeds its re-fire cycle.
            for notification in &notifications {
                if let Some(topic) = periodic_seed_topic(&self.periodic_topics, notification) {
                    engine
                        .publish(topic, std::slice::from_ref(notification))
                        .await?;
                }
            }

            let outcome = self.registry.send(notifications).await;
            engine
                .publish(&self.notification_topic, &outcome.sent)
                .await?;
            engine.publish(&self.retry_topic, &outcome.failed).await?;
            // outcome.invalid is already counted by the registry and dropped.
        }

        engine.commit(msg)?;
        counter!(ALARMS_PROCESSED).increment(1);
        Ok(())
    }
}

/// The periodic topic a fresh notification seeds, if any: only webhook
/// notifications whose period names a configured periodic topic re-fire.
fn periodic_seed_topic<'a>(
    periodic_topics: &'a BTreeMap<String, String>,
    notification: &Notification,
) -> Option<&'a str> {
    if notification.kind != "webhook" || notification.period == 0 {
        return None;
    }
    periodic_topics
        .get(&notification.periodic_topic)
        .map(String::as_str)
}
