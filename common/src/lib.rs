//! Shared plumbing for the alarm-relay engine family: Kafka client
//! construction, the consume-handle-commit skeleton, metric names and the
//! typed configuration record.
pub mod config;
pub mod engine;
pub mod metrics;

pub use git_version;

use rdkafka::{
    ClientConfig,
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
};

/// Expands to the version string reported by each engine binary.
#[macro_export]
macro_rules! version {
    () => {
        $crate::git_version::git_version!(
            args = ["--tags"],
            fallback = env!("CARGO_PKG_VERSION")
        )
    };
}

/// Returns a Kafka client config pointed at the given broker,
/// common to consumers and producers.
pub fn generate_kafka_client_config(broker_url: &str) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", broker_url);
    client_config
}

/// Creates a consumer subscribed to the given topics.
///
/// Offsets are committed manually by the engines, once per handled record.
pub fn create_default_consumer(
    broker_url: &str,
    group: &str,
    topics: &[&str],
) -> Result<StreamConsumer, KafkaError> {
    let consumer: StreamConsumer = generate_kafka_client_config(broker_url)
        .set("group.id", group)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()?;

    consumer.subscribe(topics)?;

    Ok(consumer)
}

/// Returns the Unix time in float seconds, the resolution notification
/// timestamps are carried at on the wire.
pub fn unix_time() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}
