//! Records returned by the gateway's local API endpoints.
//!
//! The gateway omits fields liberally; where a missing value is meaningfully
//! zero (meter readings, signal strength), the record defaults it instead of
//! failing the whole response.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Deserializer, de};

/// `GET /api/status`.
#[derive(Clone, Deserialize)]
pub struct Status {
    pub version: String,

    pub git_hash: String,

    /// Reported as a duration string, for example `"249h28m26.127295255s"`.
    #[serde(rename = "up_time_seconds", deserialize_with = "deserialize_uptime")]
    pub uptime: Duration,

    pub commission_count: u64,
}

/// `GET /api/system_status/soe`.
#[derive(Copy, Clone, Deserialize)]
pub struct StateOfEnergy {
    pub percentage: f64,
}

/// `GET /api/operation`.
#[derive(Clone, Deserialize)]
pub struct Operation {
    pub real_mode: String,

    pub backup_reserve_percent: f64,
}

/// `GET /api/sitemaster`.
#[derive(Clone, Deserialize)]
pub struct Sitemaster {
    pub running: bool,

    pub connected_to_tesla: bool,

    pub power_supply_mode: bool,

    /// `"Yes"` when nothing is in flight, anything else is a busy reason.
    pub can_reboot: String,
}

/// `GET /api/troubleshooting/problems`.
///
/// Only the number of entries is exposed, so the entries stay opaque.
#[derive(Clone, Deserialize)]
pub struct Problems {
    #[serde(default)]
    pub problems: Vec<serde_json::Value>,
}

/// `GET /api/system_status`.
#[derive(Clone, Deserialize)]
pub struct SystemStatus {
    pub nominal_full_pack_energy: f64,

    pub nominal_energy_remaining: f64,

    pub system_island_state: String,

    #[serde(default)]
    pub battery_blocks: Vec<BatteryBlock>,
}

/// One battery block within [`SystemStatus`].
#[derive(Clone, Deserialize)]
pub struct BatteryBlock {
    #[serde(rename = "PackageSerialNumber")]
    pub serial_number: String,

    #[serde(rename = "PackagePartNumber")]
    pub part_number: String,

    pub version: String,

    pub nominal_full_pack_energy: f64,

    pub nominal_energy_remaining: f64,

    pub v_out: f64,

    pub i_out: f64,

    pub f_out: f64,

    pub energy_charged: f64,

    pub energy_discharged: f64,

    pub off_grid: bool,

    pub vf_mode: bool,

    pub wobble_detected: bool,

    pub charge_power_clamped: bool,

    pub backup_ready: bool,

    pub pinv_state: String,

    pub pinv_grid_state: String,

    #[serde(rename = "OpSeqState")]
    pub op_seq_state: String,
}

/// `GET /api/meters/aggregates`: category name to its aggregate reading.
pub type MeterAggregates = HashMap<String, MeterReading>;

/// One meter reading, either a category aggregate or a device's cached one.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct MeterReading {
    pub instant_power: f64,

    pub instant_reactive_power: f64,

    pub instant_apparent_power: f64,

    /// Zero means «not reported», never a real reading.
    pub frequency: f64,

    pub energy_exported: f64,

    pub energy_imported: f64,

    pub instant_average_voltage: f64,

    pub instant_average_current: f64,

    pub instant_total_current: f64,
}

/// One entry of `GET /api/meters/<category>`.
#[derive(Clone, Deserialize)]
pub struct MeterDevice {
    #[serde(rename = "type")]
    pub device_type: String,

    pub connection: MeterConnection,

    #[serde(default, rename = "Cached_readings")]
    pub cached_readings: MeterReading,
}

#[derive(Clone, Deserialize)]
pub struct MeterConnection {
    pub device_serial: String,
}

/// One entry of `GET /api/networks`.
#[derive(Clone, Deserialize)]
pub struct Network {
    pub network_name: String,

    pub interface: String,

    pub enabled: bool,

    pub active: bool,

    pub primary: bool,

    #[serde(default)]
    pub iface_network_info: InterfaceInfo,
}

/// Nested per-interface details; entirely absent for inactive interfaces.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct InterfaceInfo {
    pub network_name: String,

    pub state: String,

    pub state_reason: String,

    pub signal_strength: i32,
}

fn deserialize_uptime<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let value = String::deserialize(deserializer)?;
    parse_gateway_duration(&value).map_err(de::Error::custom)
}

/// Parse the gateway's duration syntax: a sequence of `<decimal><unit>`
/// components, such as `"2h2m0.571981s"`.
fn parse_gateway_duration(value: &str) -> Result<Duration, String> {
    if value.is_empty() {
        return Err("empty duration".to_string());
    }
    let mut total_seconds = 0.0;
    let mut rest = value;
    while !rest.is_empty() {
        let number_length = rest
            .find(|character: char| !character.is_ascii_digit() && character != '.')
            .ok_or_else(|| format!("missing unit in duration `{value}`"))?;
        let (number, with_unit) = rest.split_at(number_length);
        let number: f64 = number
            .parse()
            .map_err(|_| format!("unparseable component `{number}` in duration `{value}`"))?;
        let unit_length = with_unit
            .find(|character: char| character.is_ascii_digit())
            .unwrap_or(with_unit.len());
        let (unit, remainder) = with_unit.split_at(unit_length);
        let multiplier = match unit {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            _ => return Err(format!("unknown unit `{unit}` in duration `{value}`")),
        };
        total_seconds += number * multiplier;
        rest = remainder;
    }
    Ok(Duration::from_secs_f64(total_seconds))
}
