//! The in-flight notification value object.
use crate::{AlarmMetric, RawAlarm};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// One notification method subscribed to an alarm definition and target
/// state, as stored in the configuration store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationAction {
    pub id: String,
    /// Channel type, lower-case.
    pub kind: String,
    pub name: String,
    pub address: String,
    /// Re-fire period in seconds; zero means non-periodic.
    pub period: u32,
}

/// One pending delivery: the result of matching one alarm transition to one
/// configured action.
///
/// Created by the alarm transformer, mutated only by the engines
/// (`retry_count`, `notification_timestamp`), and carried between engines as
/// JSON on the log. Equality is field-wise over every carried field.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub address: String,
    /// Dispatch attempts so far; monotone non-decreasing on the retry topic.
    pub retry_count: u32,
    pub raw_alarm: RawAlarm,
    pub alarm_id: String,
    pub alarm_name: String,
    /// Description after template rendering.
    pub alarm_description: String,
    /// Seconds since epoch.
    pub alarm_timestamp: f64,
    pub message: String,
    /// Set at each dispatch attempt; seconds since epoch.
    pub notification_timestamp: Option<f64>,
    pub state: String,
    pub old_state: String,
    pub severity: String,
    pub link: String,
    pub lifecycle_state: String,
    pub tenant_id: String,
    /// Re-fire period in seconds; zero means non-periodic.
    pub period: u32,
    /// Name of the periodic channel class this notification re-fires on.
    pub periodic_topic: String,
}

impl Notification {
    /// Builds a notification from a configured action and the alarm that
    /// triggered it, rendering the description template.
    pub fn new(action: &NotificationAction, retry_count: u32, alarm: RawAlarm) -> Self {
        let alarm_description = render_description(&alarm);
        Self {
            id: action.id.clone(),
            kind: action.kind.clone(),
            name: action.name.clone(),
            address: action.address.clone(),
            retry_count,
            alarm_id: alarm.alarm_id.clone(),
            alarm_name: alarm.alarm_name.clone(),
            alarm_description,
            alarm_timestamp: alarm.timestamp as f64 / 1000.0,
            message: alarm.state_change_reason.clone(),
            notification_timestamp: None,
            state: alarm.new_state.clone(),
            old_state: alarm.old_state.clone(),
            severity: alarm.severity.clone(),
            link: alarm.link.clone(),
            lifecycle_state: alarm.lifecycle_state.clone(),
            tenant_id: alarm.tenant_id.clone(),
            period: action.period,
            periodic_topic: action.period.to_string(),
            raw_alarm: alarm,
        }
    }

    pub fn metrics(&self) -> &[AlarmMetric] {
        &self.raw_alarm.metrics
    }

    /// ISO-8601 UTC rendering of the alarm timestamp.
    pub fn alarm_timestamp_utc(&self) -> String {
        iso8601(self.alarm_timestamp)
    }
}

/// Merges metric dimensions across all of an alarm's metrics. A key seen with
/// several distinct values keeps them all, joined with `", "` in sorted order.
pub fn merged_dimensions(alarm: &RawAlarm) -> BTreeMap<String, String> {
    let mut collected: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for metric in &alarm.metrics {
        for (key, value) in &metric.dimensions {
            collected.entry(key.as_str()).or_default().insert(value.as_str());
        }
    }
    collected
        .into_iter()
        .map(|(key, values)| {
            let joined = values.into_iter().collect::<Vec<_>>().join(", ");
            (key.to_owned(), joined)
        })
        .collect()
}

/// Current measurement per metric name, taken from the sub-alarms: a single
/// value renders as a scalar, several as a sequence, a metric with no
/// sub-alarm data as null.
pub fn metric_values(alarm: &RawAlarm) -> BTreeMap<String, serde_json::Value> {
    let mut values: BTreeMap<String, serde_json::Value> = BTreeMap::new();
    for metric in &alarm.metrics {
        if let Some(name) = &metric.name {
            values.entry(name.clone()).or_insert(serde_json::Value::Null);
        }
    }
    for sub in &alarm.sub_alarms {
        let name = &sub.sub_alarm_expression.metric_definition.name;
        let value = match sub.current_values.as_slice() {
            [] => serde_json::Value::Null,
            [single] => serde_json::Value::from(*single),
            many => serde_json::Value::from(many.to_vec()),
        };
        values.insert(name.clone(), value);
    }
    values
}

fn iso8601(unix_seconds: f64) -> String {
    DateTime::<Utc>::from_timestamp_millis((unix_seconds * 1000.0) as i64)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Renders the alarm description as a template over the alarm's dimensions
/// and measurements.
///
/// Rendering is total: a template syntax error keeps the raw description
/// silently, any other rendering error keeps it with a log line.
fn render_description(alarm: &RawAlarm) -> String {
    let description = &alarm.alarm_description;
    if description.is_empty() {
        return description.clone();
    }

    let alarm_timestamp = alarm.timestamp as f64 / 1000.0;
    let age = Utc::now().timestamp_millis() as f64 / 1000.0 - alarm_timestamp;

    let mut vars = serde_json::Map::new();
    for (key, value) in merged_dimensions(alarm) {
        vars.insert(key, value.into());
    }
    for (key, value) in metric_values(alarm) {
        vars.insert(key, value);
    }
    vars.insert("_age".to_owned(), age.into());
    vars.insert("_timestamp".to_owned(), iso8601(alarm_timestamp).into());
    vars.insert("_state".to_owned(), alarm.new_state.clone().into());
    vars.insert("_old_state".to_owned(), alarm.old_state.clone().into());

    let env = minijinja::Environment::new();
    let template = match env.template_from_str(description) {
        Ok(template) => template,
        Err(_) => return description.clone(),
    };
    match template.render(&vars) {
        Ok(rendered) => rendered,
        Err(e) => {
            warn!("Failed rendering alarm description {description:?}: {e}");
            description.clone()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{MetricDefinition, SubAlarm, SubAlarmExpression};

    fn raw_alarm(description: &str) -> RawAlarm {
        RawAlarm {
            alarm_id: "a".to_owned(),
            alarm_definition_id: "d".to_owned(),
            alarm_name: "cpu".to_owned(),
            alarm_description: description.to_owned(),
            new_state: "ALARM".to_owned(),
            old_state: "OK".to_owned(),
            state_change_reason: "threshold crossed".to_owned(),
            severity: "LOW".to_owned(),
            link: "http://example.org".to_owned(),
            lifecycle_state: "OPEN".to_owned(),
            tenant_id: "t".to_owned(),
            timestamp: 1_700_000_000_000,
            actions_enabled: true,
            metrics: vec![
                AlarmMetric {
                    name: Some("cpu.idle_perc".to_owned()),
                    dimensions: BTreeMap::from([
                        ("hostname".to_owned(), "h1".to_owned()),
                        ("service".to_owned(), "monitoring".to_owned()),
                    ]),
                },
                AlarmMetric {
                    name: None,
                    dimensions: BTreeMap::from([("hostname".to_owned(), "h2".to_owned())]),
                },
            ],
            sub_alarms: vec![],
        }
    }

    fn action(kind: &str, period: u32) -> NotificationAction {
        NotificationAction {
            id: "n1".to_owned(),
            kind: kind.to_owned(),
            name: "wh".to_owned(),
            address: "http://x".to_owned(),
            period,
        }
    }

    #[test]
    fn builds_from_action_and_alarm() {
        let n = Notification::new(&action("webhook", 0), 0, raw_alarm(""));
        assert_eq!(n.kind, "webhook");
        assert_eq!(n.alarm_id, "a");
        assert_eq!(n.state, "ALARM");
        assert_eq!(n.old_state, "OK");
        assert_eq!(n.message, "threshold crossed");
        assert_eq!(n.alarm_timestamp, 1_700_000_000.0);
        assert_eq!(n.retry_count, 0);
        assert!(n.notification_timestamp.is_none());
        assert_eq!(n.periodic_topic, "0");
    }

    #[test]
    fn wire_round_trip_preserves_every_field() {
        let mut n = Notification::new(&action("email", 60), 2, raw_alarm("desc"));
        n.notification_timestamp = Some(1_700_000_123.5);
        let json = serde_json::to_string(&n).unwrap();
        let decoded: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, n);
    }

    #[test]
    fn kind_is_serialised_as_type() {
        let n = Notification::new(&action("webhook", 0), 0, raw_alarm(""));
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["type"], "webhook");
        assert!(value.get("kind").is_none());
        assert_eq!(value["period"], 0);
    }

    #[test]
    fn dimensions_merge_with_stable_order() {
        let dimensions = merged_dimensions(&raw_alarm(""));
        assert_eq!(
            dimensions.get("hostname").map(String::as_str),
            Some("h1, h2")
        );
        assert_eq!(
            dimensions.get("service").map(String::as_str),
            Some("monitoring")
        );
    }

    #[test]
    fn metric_values_scalar_sequence_and_null() {
        let mut alarm = raw_alarm("");
        alarm.metrics.push(AlarmMetric {
            name: Some("load.avg".to_owned()),
            dimensions: BTreeMap::new(),
        });
        alarm.sub_alarms = vec![
            SubAlarm {
                sub_alarm_expression: SubAlarmExpression {
                    metric_definition: MetricDefinition {
                        name: "cpu.idle_perc".to_owned(),
                    },
                },
                current_values: vec![1.5],
            },
            SubAlarm {
                sub_alarm_expression: SubAlarmExpression {
                    metric_definition: MetricDefinition {
                        name: "mem.used".to_owned(),
                    },
                },
                current_values: vec![0.1, 0.2],
            },
        ];
        let values = metric_values(&alarm);
        assert_eq!(values["cpu.idle_perc"], serde_json::json!(1.5));
        assert_eq!(values["mem.used"], serde_json::json!([0.1, 0.2]));
        assert_eq!(values["load.avg"], serde_json::Value::Null);
    }

    #[test]
    fn description_template_renders_dimensions_and_state() {
        let n = Notification::new(
            &action("email", 0),
            0,
            raw_alarm("{{ hostname }} went {{ _state }}"),
        );
        assert_eq!(n.alarm_description, "h1, h2 went ALARM");
    }

    #[test]
    fn description_template_syntax_error_keeps_raw_text() {
        let n = Notification::new(&action("email", 0), 0, raw_alarm("{% broken"));
        assert_eq!(n.alarm_description, "{% broken");
    }

    #[test]
    fn equality_is_field_wise() {
        let a = Notification::new(&action("webhook", 0), 0, raw_alarm(""));
        let mut b = a.clone();
        assert_eq!(a, b);
        b.retry_count += 1;
        assert_ne!(a, b);
    }
}
