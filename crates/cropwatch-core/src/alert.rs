//! Alert events as broadcast on the `sensor_alert` topic.
//!
//! The engine does not own notification logic; it decodes these events and
//! hands them to whatever sink the host application wires in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reading::SensorKind;
use crate::timefmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    High,
    Low,
    Normal,
    System,
}

/// A threshold violation (or recovery) raised by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorAlert {
    pub id: i64,
    pub sensor_id: String,
    #[serde(rename = "sensor_type")]
    pub sensor_kind: SensorKind,
    #[serde(rename = "alert_type")]
    pub kind: AlertKind,
    pub value: f64,
    pub threshold_value: f64,
    pub unit: String,
    pub location_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub message: String,
    #[serde(with = "timefmt::lenient")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(
        default,
        with = "timefmt::lenient_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

fn default_active() -> bool {
    true
}
