//! Wire format shared with the charge-controller monitor: nested telemetry
//! JSON in, command JSON out.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Number};
use thiserror::Error;

/// Device id used when neither the payload nor the topic names one.
pub const UNKNOWN_DEVICE: &str = "unknown";

// ---------------------------------------------------------------------------
// Decoded reading
// ---------------------------------------------------------------------------

/// One flattened telemetry sample. Field names double as the column names of
/// the `power_logs` table, so the struct serializes straight into a row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub device_id: String,
    pub pv_voltage: Option<f64>,
    pub pv_current: Option<f64>,
    pub pv_power: Option<f64>,
    pub batt_voltage: Option<f64>,
    pub batt_charge_current: Option<f64>,
    pub batt_charge_power: Option<f64>,
    pub batt_temperature: Option<f64>,
    pub batt_soc: Option<f64>,
    pub load_voltage: Option<f64>,
    pub load_current: Option<f64>,
    pub load_power: Option<f64>,
    pub load_enabled: Option<bool>,
    pub energy_today: Option<f64>,
    pub energy_total: Option<f64>,
    pub rssi: Option<i64>,
    pub uptime: Option<u64>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("telemetry payload is not a JSON object")]
    NotAnObject,
    #[error("malformed telemetry json: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Inbound wire layout
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct WireTelemetry {
    device_id: Option<String>,
    pv: Option<WirePv>,
    battery: Option<WireBattery>,
    load: Option<WireLoad>,
    energy: Option<WireEnergy>,
    #[serde(default, deserialize_with = "whole_i64")]
    rssi: Option<i64>,
    #[serde(default, deserialize_with = "whole_u64")]
    uptime: Option<u64>,
}

// Firmware serializers emit integers as `3600.0` now and then. Any finite
// number is accepted and rounded; only out-of-range values are rejected.

fn whole_i64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i64>, D::Error> {
    let Some(n) = Option::<Number>::deserialize(de)? else {
        return Ok(None);
    };
    if let Some(v) = n.as_i64() {
        return Ok(Some(v));
    }
    match n.as_f64().map(f64::round) {
        Some(f) if f >= i64::MIN as f64 && f < i64::MAX as f64 => Ok(Some(f as i64)),
        _ => Err(D::Error::custom(format!("{n} does not fit a signed integer"))),
    }
}

fn whole_u64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u64>, D::Error> {
    let Some(n) = Option::<Number>::deserialize(de)? else {
        return Ok(None);
    };
    if let Some(v) = n.as_u64() {
        return Ok(Some(v));
    }
    match n.as_f64().map(f64::round) {
        Some(f) if (0.0..u64::MAX as f64).contains(&f) => Ok(Some(f as u64)),
        _ => Err(D::Error::custom(format!("{n} does not fit an unsigned integer"))),
    }
}

#[derive(Debug, Default, Deserialize)]
struct WirePv {
    voltage: Option<f64>,
    current: Option<f64>,
    power: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct WireBattery {
    voltage: Option<f64>,
    charge_current: Option<f64>,
    charge_power: Option<f64>,
    temperature: Option<f64>,
    soc: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct WireLoad {
    voltage: Option<f64>,
    current: Option<f64>,
    power: Option<f64>,
    enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct WireEnergy {
    today_kwh: Option<f64>,
    total_kwh: Option<f64>,
}

/// Decode a telemetry payload.
///
/// `topic_device` is the id derived from the topic path (see
/// [`device_id_from_topic`]); it is only used when the payload carries no
/// `device_id` of its own.
pub fn decode(payload: &[u8], topic_device: Option<&str>) -> Result<Reading, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let wire: WireTelemetry = serde_json::from_value(value)?;

    let pv = wire.pv.unwrap_or_default();
    let batt = wire.battery.unwrap_or_default();
    let load = wire.load.unwrap_or_default();
    let energy = wire.energy.unwrap_or_default();

    let device_id = wire
        .device_id
        .or_else(|| topic_device.map(str::to_owned))
        .unwrap_or_else(|| UNKNOWN_DEVICE.to_owned());

    Ok(Reading {
        device_id,
        pv_voltage: pv.voltage,
        pv_current: pv.current,
        pv_power: pv.power,
        batt_voltage: batt.voltage,
        batt_charge_current: batt.charge_current,
        batt_charge_power: batt.charge_power,
        batt_temperature: batt.temperature,
        batt_soc: batt.soc,
        load_voltage: load.voltage,
        load_current: load.current,
        load_power: load.power,
        load_enabled: load.enabled,
        energy_today: energy.today_kwh,
        energy_total: energy.total_kwh,
        rssi: wire.rssi,
        uptime: wire.uptime,
    })
}

// ---------------------------------------------------------------------------
// Outbound commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Switch the controller's load output on (`true`) or off (`false`).
    ToggleLoad { state: bool },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ToggleLoad { .. } => "toggle_load",
        }
    }
}

/// Serialize a command into the payload the device firmware expects.
pub fn encode(command: &Command) -> Vec<u8> {
    match command {
        Command::ToggleLoad { state } => json!({
            "command": command.name(),
            "state": state,
        })
        .to_string()
        .into_bytes(),
    }
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

/// Return the topic segment matched by the first `+` in `filter`, e.g.
/// filter "balkon/+/data" and topic "balkon/esp32-1/data" give "esp32-1".
///
/// Literal segments must match exactly; filters containing `#` never yield
/// an id.
pub fn device_id_from_topic<'a>(filter: &str, topic: &'a str) -> Option<&'a str> {
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();
    if filter_parts.len() != topic_parts.len() || filter_parts.contains(&"#") {
        return None;
    }

    let mut matched = None;
    for (f, t) in filter_parts.iter().zip(&topic_parts) {
        if *f == "+" {
            if matched.is_none() && !t.is_empty() {
                matched = Some(*t);
            }
        } else if f != t {
            return None;
        }
    }
    matched
}

// ===========================================================================
// Tests
// ===========================================================================
