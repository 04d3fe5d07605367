//! Metric names and label helpers shared by the engines.
//!
//! Each engine binary installs a Prometheus exporter and describes the
//! counters it emits; the names here keep the pipeline's metrics consistent
//! across components.

/// Name constants for every metric emitted by the pipeline.
pub mod names {
    use const_format::concatcp;

    /// Prefix prepended to all metric names.
    pub const METRIC_NAME_PREFIX: &str = "alarm_relay_";

    /// Number of alarm records fully handled (committed) by the notification engine.
    pub const ALARMS_PROCESSED: &str = concatcp!(METRIC_NAME_PREFIX, "alarms_processed");
    /// Number of alarm records that failed to parse.
    pub const ALARMS_FAILED_PARSE: &str = concatcp!(METRIC_NAME_PREFIX, "alarms_failed_parse");
    /// Number of alarm records that produced no notifications.
    pub const ALARMS_NO_NOTIFICATION: &str =
        concatcp!(METRIC_NAME_PREFIX, "alarms_no_notification");
    /// Number of notifications created from matched actions.
    pub const NOTIFICATIONS_CREATED: &str = concatcp!(METRIC_NAME_PREFIX, "notifications_created");
    /// Number of retry/periodic records that failed to parse.
    pub const NOTIFICATIONS_FAILED_PARSE: &str =
        concatcp!(METRIC_NAME_PREFIX, "notifications_failed_parse");
    /// Number of notifications successfully dispatched, labelled by kind.
    pub const NOTIFICATIONS_SENT: &str = concatcp!(METRIC_NAME_PREFIX, "notifications_sent");
    /// Number of dispatch failures, labelled by kind (`INVALID` for unknown kinds).
    pub const NOTIFICATION_SEND_ERRORS: &str =
        concatcp!(METRIC_NAME_PREFIX, "notification_send_errors");
    /// Errors reading from the message log, labelled by topic.
    pub const KAFKA_CONSUMER_ERRORS: &str = concatcp!(METRIC_NAME_PREFIX, "kafka_consumer_errors");
    /// Errors publishing to the message log, labelled by topic.
    pub const KAFKA_PRODUCER_ERRORS: &str = concatcp!(METRIC_NAME_PREFIX, "kafka_producer_errors");
    /// Errors accessing the configuration store.
    pub const CONFIGDB_ERRORS: &str = concatcp!(METRIC_NAME_PREFIX, "configdb_errors");
    /// Info gauge carrying the component name and version as labels.
    pub const COMPONENT_INFO: &str = concatcp!(METRIC_NAME_PREFIX, "component_info");
}

/// Label used by classification counters for notifications whose kind has no
/// active dispatcher.
pub const INVALID_KIND: &str = "INVALID";

/// Returns the label pair identifying a notification kind.
pub fn notification_type_label(kind: &str) -> (&'static str, String) {
    ("notification_type", kind.to_owned())
}

/// Returns the label pair identifying a log topic.
pub fn topic_label(topic: &str) -> (&'static str, String) {
    ("topic", topic.to_owned())
}

/// Emits the component info gauge. Should be called once at startup of each engine.
pub fn component_info_metric(component: &'static str) {
    metrics::gauge!(
        names::COMPONENT_INFO,
        &[
            ("component", component.to_owned()),
            ("version", env!("CARGO_PKG_VERSION").to_owned()),
        ]
    )
    .set(1.0);
}
