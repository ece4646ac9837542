//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::value::{DataType, PlcValue, Severity};

/// Default ADS port of the first TwinCAT 3 PLC runtime.
pub const DEFAULT_AMS_PORT: u16 = 851;

/// Derived health of a monitored site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Online,
    Offline,
    Warning,
    Unknown,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Online => "online",
            SiteStatus::Offline => "offline",
            SiteStatus::Warning => "warning",
            SiteStatus::Unknown => "unknown",
        }
    }
}

impl FromStr for SiteStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(SiteStatus::Online),
            "offline" => Ok(SiteStatus::Offline),
            "warning" => Ok(SiteStatus::Warning),
            "unknown" => Ok(SiteStatus::Unknown),
            other => Err(format!("unknown site status: {}", other)),
        }
    }
}

/// A monitored physical location and the PLC endpoint installed there.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub ams_net_id: Option<String>,
    pub ams_port: u16,
    pub ipc_id: Option<i64>,
    pub status: SiteStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_online: Option<DateTime<Utc>>,
    pub uptime_percent: f64,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            ams_net_id: None,
            ams_port: DEFAULT_AMS_PORT,
            ipc_id: None,
            status: SiteStatus::Unknown,
            last_check: None,
            last_online: None,
            uptime_percent: 0.0,
        }
    }
}

/// Result of one site check, written back to the `sites` row.
#[derive(Debug, Clone)]
pub struct SiteCheck {
    pub site_id: i64,
    pub status: SiteStatus,
    pub checked_at: DateTime<Utc>,
    pub last_online: Option<DateTime<Utc>>,
    pub uptime_percent: f64,
}

/// An industrial PC from the device inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ipc {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub address: String,
    pub ams_net_id: String,
    #[serde(default = "default_ams_port")]
    pub ams_port: u16,
    pub site_name: String,
}

fn default_ams_port() -> u16 {
    DEFAULT_AMS_PORT
}

/// A monitored PLC symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlcTag {
    pub id: i64,
    pub site_id: i64,
    pub tag_name: String,
    pub plc_address: String,
    pub description: String,
    pub data_type: DataType,
    pub is_active: bool,
    pub poll_interval_ms: u64,
    pub alarm_on_true: bool,
    pub alarm_on_false: bool,
    pub severity_level: Severity,
    pub last_value: Option<String>,
    pub last_read_time: Option<DateTime<Utc>>,
}

impl PlcTag {
    /// Whether `value` satisfies the tag's alarm policy.
    pub fn alarm_satisfied(&self, value: &PlcValue) -> bool {
        let truthy = value.is_truthy();
        (self.alarm_on_true && truthy) || (self.alarm_on_false && !truthy)
    }

    /// Key identifying this tag's alarm condition, e.g. `T1:true`.
    pub fn condition_key(&self) -> String {
        // alarm_on_true wins when both flags are set.
        format!("{}:{}", self.tag_name, self.alarm_on_true)
    }

    /// Persisted last value parsed as the declared type.
    pub fn last_typed_value(&self) -> Option<PlcValue> {
        self.last_value
            .as_deref()
            .and_then(|v| PlcValue::parse(v, self.data_type))
    }

    /// Compare everything a poll task depends on, ignoring live values.
    pub fn same_definition(&self, other: &PlcTag) -> bool {
        self.id == other.id
            && self.site_id == other.site_id
            && self.tag_name == other.tag_name
            && self.plc_address == other.plc_address
            && self.data_type == other.data_type
            && self.is_active == other.is_active
            && self.poll_interval_ms == other.poll_interval_ms
            && self.alarm_on_true == other.alarm_on_true
            && self.alarm_on_false == other.alarm_on_false
            && self.severity_level == other.severity_level
    }
}

/// A tag definition ready to be inserted.
#[derive(Debug, Clone)]
pub struct NewTag {
    pub tag_name: String,
    pub plc_address: String,
    pub description: String,
    pub data_type: DataType,
    pub is_active: bool,
    pub poll_interval_ms: u64,
    pub alarm_on_true: bool,
    pub alarm_on_false: bool,
    pub severity_level: Severity,
}

/// One detected value change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRow {
    pub id: i64,
    pub tag_id: i64,
    pub old_value: Option<String>,
    pub new_value: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    PlcTagAlarm,
    PlcTagTrip,
    CommunicationError,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::PlcTagAlarm => "plc_tag_alarm",
            AlertType::PlcTagTrip => "plc_tag_trip",
            AlertType::CommunicationError => "communication_error",
        }
    }
}

impl FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plc_tag_alarm" => Ok(AlertType::PlcTagAlarm),
            "plc_tag_trip" => Ok(AlertType::PlcTagTrip),
            "communication_error" => Ok(AlertType::CommunicationError),
            other => Err(format!("unknown alert type: {}", other)),
        }
    }
}

/// A notification instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: i64,
    pub site_id: Option<i64>,
    pub tag_id: Option<i64>,
    pub condition_key: Option<String>,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub is_read: bool,
    pub is_resolved: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// An alert ready to be inserted.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub site_id: Option<i64>,
    pub tag_id: Option<i64>,
    pub condition_key: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
