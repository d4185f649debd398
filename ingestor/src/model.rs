use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observation from a people counter. Counters are cumulative since the
/// sensor's last power-cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TelemetrySample {
    /// Store-assigned insertion order, 0 until persisted.
    #[serde(default)]
    pub id: i64,
    pub device_id: String,
    pub location: String,
    pub sub_location: String,
    pub in_count: i64,
    pub out_count: i64,
    pub capacity: i64,
    pub event_time: DateTime<Utc>,
}

/// Snapshot of a device's raw counters at the moment an operator zeroed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResetRecord {
    pub device_id: String,
    pub reset_time: DateTime<Utc>,
    pub reset_in_count: i64,
    pub reset_out_count: i64,
}

/// Reset-adjusted view of a device's latest sample. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogicalOccupancy {
    pub device_id: String,
    pub location: String,
    pub sub_location: String,
    pub capacity: i64,
    pub event_time: DateTime<Utc>,
    pub logical_in: i64,
    pub logical_out: i64,
    pub occupancy: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildingSummary {
    pub building: String,
    pub total_in: i64,
    pub total_out: i64,
    pub total_capacity: i64,
}

/// Flow observed during one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrendPoint {
    pub bucket_start: DateTime<Utc>,
    pub delta_in: i64,
    pub delta_out: i64,
}

/// One bucket of a raw-counter segment, for charts that must not show a
/// reset as a counter collapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChartPoint {
    pub segment_id: u32,
    pub bucket_start: DateTime<Utc>,
    pub total_in: i64,
    pub total_out: i64,
    pub delta_in: i64,
    pub delta_out: i64,
}

/// A device's latest sample together with the reset that applies to it,
/// read from one consistent snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub sample: TelemetrySample,
    pub reset: Option<ResetRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrendScope {
    Device(String),
    Location(String),
}

/// At most `limit` samples of a range, plus the size of the whole range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SamplePage {
    pub samples: Vec<TelemetrySample>,
    pub total: u64,
}

/// Samples of a scope inside a time range plus every reset of the devices
/// involved that took effect before the range end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrendWindow {
    pub samples: Vec<TelemetrySample>,
    pub resets: Vec<ResetRecord>,
}

/// Device entry of a people-counter MQTT payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePayload {
    #[serde(rename = "Device")]
    pub device: String,
    #[serde(rename = "Data", default)]
    pub data: Vec<CounterReading>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterReading {
    #[serde(rename = "Location", default)]
    pub location: String,
    #[serde(rename = "SubLocation", default)]
    pub sub_location: Option<String>,
    #[serde(rename = "Total_IN")]
    pub total_in: i64,
    #[serde(rename = "Total_Out")]
    pub total_out: i64,
    #[serde(rename = "Capacity", default)]
    pub capacity: i64,
    #[serde(rename = "ipaddr", default)]
    pub ip_address: Option<String>,
    #[serde(rename = "TimeStamp")]
    pub timestamp: String,
}
