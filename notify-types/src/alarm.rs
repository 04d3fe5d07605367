//! The inbound alarm state-transition record.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Envelope of a record on the alarm-transitions topic.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AlarmTransition {
    #[serde(rename = "alarm-transitioned")]
    pub alarm: RawAlarm,
}

/// An alarm state transition as emitted by the evaluation upstream.
///
/// All keys except `subAlarms` are required; a record missing one fails to
/// decode and is treated as a format error by the consumer.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAlarm {
    pub alarm_id: String,
    pub alarm_definition_id: String,
    pub alarm_name: String,
    pub alarm_description: String,
    pub new_state: String,
    pub old_state: String,
    pub state_change_reason: String,
    pub severity: String,
    pub link: String,
    pub lifecycle_state: String,
    pub tenant_id: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub actions_enabled: bool,
    pub metrics: Vec<AlarmMetric>,
    #[serde(default)]
    pub sub_alarms: Vec<SubAlarm>,
}

/// One metric the alarm expression is evaluated over.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct AlarmMetric {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

/// One clause of the alarm expression together with the measurements that
/// triggered the transition.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAlarm {
    pub sub_alarm_expression: SubAlarmExpression,
    #[serde(default)]
    pub current_values: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAlarmExpression {
    pub metric_definition: MetricDefinition,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MetricDefinition {
    pub name: String,
}
