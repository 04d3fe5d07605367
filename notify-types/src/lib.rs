//! Wire types of the alarm-notification pipeline: the inbound alarm
//! transition record and the [Notification] carried between engines.
//!
//! Every topic in the pipeline carries UTF-8 JSON of these shapes, so the
//! serde derives here are the authoritative schema.
mod alarm;
mod notification;

pub use alarm::{
    AlarmMetric, AlarmTransition, MetricDefinition, RawAlarm, SubAlarm, SubAlarmExpression,
};
pub use notification::{Notification, NotificationAction, merged_dimensions, metric_values};
