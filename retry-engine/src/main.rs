//! # Retry Engine
//!
//! The retry engine performs the following functions:
//! * Consumes failed notifications from the retry topic.
//! * Rebuilds each notification against the current content of the
//!   configuration store, dropping those whose action has been deleted.
//! * Sleeps out the remainder of the retry interval, measured from the
//!   notification's last dispatch attempt; the sleep is the scheduler, there
//!   is no in-process timer wheel.
//! * Re-dispatches: delivered notifications go to the notification topic,
//!   failed ones back to the retry topic with an incremented `retry_count`
//!   until the attempt bound is reached.
//!
//! The retry bound is enforced purely by the count carried in the log record;
//! the engine keeps no per-notification memory.
mod error;

use crate::error::RetryEngineError;
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
use alarm_relay_config_store::{ConfigRepo, MySqlRepo, construct_notification};
use alarm_relay_dispatch::DispatchRegistry;
use alarm_relay_types::Notification;
use clap::Parser;
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use miette::{IntoDiagnostic, miette};
use rdkafka::{Message, message::BorrowedMessage};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

/// [clap] derived struct to handle command line parameters.
#[derive(Debug, Parser)]
#[clap(author, version = alarm_relay_common::version!(), about)]
struct Cli {
    /// Path to the pipeline configuration file
    #[clap(long)]
    config: PathBuf,

    /// Endpoint on which Prometheus text format metrics are available
    #[clap(long, env, default_value = "127.0.0.1:9091")]
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
        NOTIFICATIONS_FAILED_PARSE,
        metrics::Unit::Count,
        "Number of retry records that failed to parse"
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

    let engine = Engine::new(&config.kafka, &config.kafka.notification_retry_topic)
        .into_diagnostic()?;

    component_info_metric("retry-engine");

    let mut handler = RetryHandler {
        repo,
        registry,
        retry_interval: config.retry.interval,
        retry_max: config.retry.max_attempts,
        notification_topic: config.kafka.notification_topic.clone(),
        retry_topic: config.kafka.notification_retry_topic.clone(),
    };

    engine.run(&mut handler).await.into_diagnostic()
}

struct RetryHandler<R> {
    repo: R,
    registry: DispatchRegistry,
    retry_interval: u64,
    retry_max: u32,
    notification_topic: String,
    retry_topic: String,
}

impl<R: ConfigRepo> Handler for RetryHandler<R> {
    type Error = RetryEngineError;

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
                    "Invalid notification on retry topic, skipping partition {}, offset {}: {e}",
                    msg.partition(),
                    msg.offset()
                );
                counter!(NOTIFICATIONS_FAILED_PARSE).increment(1);
                engine.commit(msg)?;
                return Ok(());
            }
        };

        let Some(notification) = construct_notification(&self.repo, &data).await? else {
            debug!("Notification method {} no longer exists, dropping", data.id);
            engine.commit(msg)?;
            return Ok(());
        };

        let wait = remaining_wait(
            self.retry_interval,
            data.notification_timestamp,
            unix_time(),
        );
        if wait > 0.0 {
            sleep(Duration::from_secs_f64(wait)).await;
        }

        let mut outcome = self.registry.send(vec![notification]).await;
        if let Some(notification) = outcome.sent.pop() {
            engine
                .publish(&self.notification_topic, &[notification])
                .await?;
        }
        if let Some(mut notification) = outcome.failed.pop() {
            notification.retry_count += 1;
            notification.notification_timestamp = Some(unix_time());
            if should_retry(notification.retry_count, self.retry_max) {
                error!(
                    "Retry failed for {} with name {} at {}. Saving for later retry.",
                    notification.kind, notification.name, notification.address
                );
                engine.publish(&self.retry_topic, &[notification]).await?;
            } else {
                error!(
                    "Retry failed for {} with name {} at {} after {} retries. \
                     Giving up on retry.",
                    notification.kind, notification.name, notification.address, self.retry_max
                );
            }
        }

        engine.commit(msg)?;
        Ok(())
    }
}

/// Seconds still to sleep before the next attempt of a notification whose
/// last attempt was at `notification_timestamp`.
fn remaining_wait(interval: u64, notification_timestamp: Option<f64>, now: f64) -> f64 {
    interval as f64 - (now - notification_timestamp.unwrap_or_default())
}

/// Whether a notification that just failed again gets another attempt.
fn should_retry(retry_count: u32, max_attempts: u32) -> bool {
    retry_count < max_attempts
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wait_is_the_interval_remainder() {
        let now = 1_700_000_000.0;
        assert_eq!(remaining_wait(30, Some(now - 10.0), now), 20.0);
    }

    #[test]
    fn overdue_notifications_do_not_wait() {
        let now = 1_700_000_000.0;
        assert!(remaining_wait(30, Some(now - 45.0), now) < 0.0);
    }

    #[test]
    fn record_on_its_final_attempt_gives_up() {
        // A record carrying max_attempts - 1 reaches the bound once its
        // failed dispatch is counted, and must not be re-published.
        let retry_max = 5;
        assert!(!should_retry((retry_max - 1) + 1, retry_max));
    }

    #[test]
    fn earlier_attempts_are_re_published() {
        assert!(should_retry(1, 5));
        assert!(should_retry(4, 5));
    }
}
