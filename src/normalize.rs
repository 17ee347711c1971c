//! Raw bridge attributes to a typed [`NormalizedReading`].
//!
//! The bridge publishes one flat JSON object whose keys are display labels with units and
//! sensor ids baked in. [`FIELD_MAP`] is the single place that ties those labels to fields.

use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type RawSample = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    FanOnly,
    Heating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IuOperationMode {
    Dhw,
    Heating,
    HeatingDhw,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedReading {
    pub operation_mode: Option<OperationMode>,
    pub iu_operation_mode: Option<IuOperationMode>,

    pub thermostat_on: bool,
    pub space_heating_on: bool,
    pub powerful_dhw_on: bool,
    pub defrost_operation: bool,
    pub three_way_valve_dhw: bool,
    pub buh_step1_on: bool,
    pub buh_step2_on: bool,

    pub outdoor_air_temp: Option<f64>,
    #[serde(rename = "leavingWaterTempBeforeBUH")]
    pub leaving_water_temp_before_buh: Option<f64>,
    pub leaving_water_temp: Option<f64>,
    pub inlet_water_temp: Option<f64>,
    pub dhw_tank_temp: Option<f64>,
    pub inv_primary_current: Option<f64>,
    pub inv_frequency_rps: Option<f64>,
    pub dhw_setpoint: Option<f64>,
    pub lw_setpoint_main: Option<f64>,
    pub rt_setpoint: Option<f64>,
    pub main_rt_heating: Option<f64>,
    pub flow_lpm: Option<f64>,
    pub measure_power: Option<f64>,
    pub pulse_delta: Option<f64>,
    #[serde(rename = "pulsePerKWh")]
    pub pulse_per_kwh: Option<f64>,
    pub cop: Option<f64>,

    pub error_type: Option<String>,
    pub error_code: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub wifi_rssi: Option<f64>,
    pub free_mem: Option<f64>,

    pub voltage_l1: Option<f64>,
    pub voltage_l2: Option<f64>,
    pub voltage_l3: Option<f64>,
    pub received_at: Option<DateTime<Utc>>,
}

type NumberSlot = fn(&mut NormalizedReading) -> &mut Option<f64>;
type FlagSlot = fn(&mut NormalizedReading) -> &mut bool;
type TextSlot = fn(&mut NormalizedReading) -> &mut Option<String>;

/// How a raw value is parsed and where the result lands.
#[derive(Clone, Copy)]
pub enum Target {
    /// Plain number; numeric strings are accepted.
    Number(NumberSlot),
    /// Number, with the sentinel `"OFF"` meaning "no reading".
    Temperature(NumberSlot),
    /// True only for the exact string `"ON"`.
    Flag(FlagSlot),
    Text(TextSlot),
    OperationMode,
    IuOperationMode,
}

pub struct FieldSpec {
    pub raw_key: &'static str,
    pub target: Target,
}

pub static FIELD_MAP: &[FieldSpec] = &[
    // operation / status
    FieldSpec { raw_key: "Operation Mode", target: Target::OperationMode },
    FieldSpec { raw_key: "I/U operation mode", target: Target::IuOperationMode },
    FieldSpec { raw_key: "Thermostat ON/OFF", target: Target::Flag(|r| &mut r.thermostat_on) },
    FieldSpec {
        raw_key: "Space heating Operation ON/OFF",
        target: Target::Flag(|r| &mut r.space_heating_on),
    },
    FieldSpec {
        raw_key: "Powerful DHW Operation. ON/OFF",
        target: Target::Flag(|r| &mut r.powerful_dhw_on),
    },
    FieldSpec { raw_key: "Defrost Operation", target: Target::Flag(|r| &mut r.defrost_operation) },
    FieldSpec {
        raw_key: "3way valve(On:DHW_Off:Space)",
        target: Target::Flag(|r| &mut r.three_way_valve_dhw),
    },
    FieldSpec { raw_key: "BUH Step1", target: Target::Flag(|r| &mut r.buh_step1_on) },
    FieldSpec { raw_key: "BUH Step2", target: Target::Flag(|r| &mut r.buh_step2_on) },
    // errors
    FieldSpec { raw_key: "Error type", target: Target::Text(|r| &mut r.error_type) },
    FieldSpec { raw_key: "Error Code", target: Target::Number(|r| &mut r.error_code) },
    // temperatures (°C)
    FieldSpec {
        raw_key: "R1T-Outdoor air temp.",
        target: Target::Temperature(|r| &mut r.outdoor_air_temp),
    },
    FieldSpec {
        raw_key: "Leaving water temp. before BUH (R1T)",
        target: Target::Temperature(|r| &mut r.leaving_water_temp_before_buh),
    },
    FieldSpec {
        raw_key: "Leaving water temp. after BUH (R2T)",
        target: Target::Temperature(|r| &mut r.leaving_water_temp),
    },
    FieldSpec {
        raw_key: "Inlet water temp.(R4T)",
        target: Target::Temperature(|r| &mut r.inlet_water_temp),
    },
    FieldSpec {
        raw_key: "DHW tank temp. (R5T)",
        target: Target::Temperature(|r| &mut r.dhw_tank_temp),
    },
    FieldSpec { raw_key: "Main RT Heating", target: Target::Temperature(|r| &mut r.main_rt_heating) },
    // setpoints (°C)
    FieldSpec { raw_key: "DHW setpoint", target: Target::Temperature(|r| &mut r.dhw_setpoint) },
    FieldSpec {
        raw_key: "LW setpoint (main)",
        target: Target::Temperature(|r| &mut r.lw_setpoint_main),
    },
    FieldSpec { raw_key: "RT setpoint", target: Target::Temperature(|r| &mut r.rt_setpoint) },
    // compressor
    FieldSpec {
        raw_key: "INV primary current (A)",
        target: Target::Number(|r| &mut r.inv_primary_current),
    },
    FieldSpec {
        raw_key: "INV frequency (rps)",
        target: Target::Number(|r| &mut r.inv_frequency_rps),
    },
    // flow and electrical
    FieldSpec { raw_key: "Flow sensor (l/min)", target: Target::Number(|r| &mut r.flow_lpm) },
    FieldSpec { raw_key: "Power Usage", target: Target::Number(|r| &mut r.measure_power) },
    FieldSpec { raw_key: "Pulse Delta", target: Target::Number(|r| &mut r.pulse_delta) },
    FieldSpec { raw_key: "Pulses per kWh", target: Target::Number(|r| &mut r.pulse_per_kwh) },
    FieldSpec { raw_key: "BE_COP", target: Target::Number(|r| &mut r.cop) },
    // bridge diagnostics
    FieldSpec { raw_key: "M5BatV", target: Target::Number(|r| &mut r.battery_voltage) },
    FieldSpec { raw_key: "WifiRSSI", target: Target::Number(|r| &mut r.wifi_rssi) },
    FieldSpec { raw_key: "FreeMem", target: Target::Number(|r| &mut r.free_mem) },
];

/// Parse a message body into a raw attribute map. Only JSON objects are accepted.
pub fn parse_raw(payload: &[u8]) -> Result<RawSample> {
    match serde_json::from_slice::<Value>(payload)? {
        Value::Object(map) => Ok(map),
        other => Err(AppError::Payload(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

/// Map raw attributes onto a fresh reading. Never fails: anything unusable becomes
/// `None` or `false`.
pub fn normalize(raw: &RawSample) -> NormalizedReading {
    let mut reading = NormalizedReading::default();
    for field in FIELD_MAP {
        let value = raw.get(field.raw_key);
        match field.target {
            Target::Number(slot) => *slot(&mut reading) = value.and_then(parse_number),
            Target::Temperature(slot) => *slot(&mut reading) = value.and_then(parse_temperature),
            Target::Flag(slot) => *slot(&mut reading) = parse_flag(value),
            Target::Text(slot) => *slot(&mut reading) = value.and_then(parse_text),
            Target::OperationMode => {
                reading.operation_mode = value.and_then(parse_operation_mode)
            }
            Target::IuOperationMode => {
                reading.iu_operation_mode = value.and_then(parse_iu_operation_mode)
            }
        }
    }
    reading
}

fn parse_number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn parse_temperature(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) if s.trim() == "OFF" => None,
        other => parse_number(other),
    }
}

fn parse_flag(v: Option<&Value>) -> bool {
    matches!(v, Some(Value::String(s)) if s == "ON")
}

fn parse_text(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn enum_token(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_uppercase()),
        _ => None,
    }
}

fn parse_operation_mode(v: &Value) -> Option<OperationMode> {
    match enum_token(v)?.as_str() {
        "FAN ONLY" => Some(OperationMode::FanOnly),
        "HEATING" => Some(OperationMode::Heating),
        _ => None,
    }
}

fn parse_iu_operation_mode(v: &Value) -> Option<IuOperationMode> {
    let compact: String = enum_token(v)?
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    match compact.as_str() {
        "DHW" => Some(IuOperationMode::Dhw),
        "HEATING" => Some(IuOperationMode::Heating),
        "HEATING+DHW" | "HEATING/DHW" | "HEATINGDHW" => Some(IuOperationMode::HeatingDhw),
        _ => None,
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn raw(v: Value) -> RawSample {
        match v {
            Value::Object(m) => m,
            _ => panic!("test payload must be an object"),
        }
    }

    fn sample() -> RawSample {
        raw(json!({
            "Operation Mode": " heating ",
            "I/U operation mode": "Heating + DHW",
            "Thermostat ON/OFF": "ON",
            "Space heating Operation ON/OFF": "ON",
            "Powerful DHW Operation. ON/OFF": "OFF",
            "3way valve(On:DHW_Off:Space)": "OFF",
            "BUH Step1": "ON",
            "BUH Step2": "on",
            "Error type": " 00 ",
            "Error Code": " 0 ",
            "R1T-Outdoor air temp.": 4.5,
            "Leaving water temp. before BUH (R1T)": 33.1,
            "Leaving water temp. after BUH (R2T)": "33.4",
            "Inlet water temp.(R4T)": 29.9,
            "DHW tank temp. (R5T)": 47,
            "Main RT Heating": "OFF",
            "RT setpoint": "20.5",
            "INV primary current (A)": 4.2,
            "Flow sensor (l/min)": 14.6,
            "M5BatV": 4.1,
            "WifiRSSI": -61
        }))
    }

    #[test]
    fn test_normalize_sample() {
        let r = normalize(&sample());
        assert_eq!(r.operation_mode, Some(OperationMode::Heating));
        assert_eq!(r.iu_operation_mode, Some(IuOperationMode::HeatingDhw));
        assert!(r.thermostat_on);
        assert!(r.space_heating_on);
        assert!(!r.powerful_dhw_on);
        assert!(!r.three_way_valve_dhw);
        assert!(r.buh_step1_on);
        assert!(!r.buh_step2_on, "flag match is case-sensitive");
        assert_eq!(r.error_type.as_deref(), Some("00"));
        assert_eq!(r.error_code, Some(0.0));
        assert_eq!(r.outdoor_air_temp, Some(4.5));
        assert_eq!(r.leaving_water_temp, Some(33.4));
        assert_eq!(r.dhw_tank_temp, Some(47.0));
        assert_eq!(r.main_rt_heating, None);
        assert_eq!(r.rt_setpoint, Some(20.5));
        assert_eq!(r.inv_primary_current, Some(4.2));
        assert_eq!(r.wifi_rssi, Some(-61.0));
        assert_eq!(r.received_at, None);
    }

    #[test]
    fn test_missing_keys_are_none_not_zero() {
        let r = normalize(&RawSample::new());
        assert_eq!(r, NormalizedReading::default());
        assert_eq!(r.flow_lpm, None);
        assert!(!r.buh_step1_on);
    }

    #[test]
    fn test_sentinels() {
        let r = normalize(&raw(json!({"Main RT Heating": "OFF", "BUH Step1": "ON"})));
        assert_eq!(r.main_rt_heating, None);
        assert!(r.buh_step1_on);
    }

    #[test]
    fn test_garbage_numbers_become_none() {
        let r = normalize(&raw(json!({
            "INV primary current (A)": "n/a",
            "Flow sensor (l/min)": "NaN",
            "R1T-Outdoor air temp.": "inf",
            "Power Usage": true,
            "Pulse Delta": "",
            "FreeMem": null
        })));
        assert_eq!(r.inv_primary_current, None);
        assert_eq!(r.flow_lpm, None);
        assert_eq!(r.outdoor_air_temp, None);
        assert_eq!(r.measure_power, None);
        assert_eq!(r.pulse_delta, None);
        assert_eq!(r.free_mem, None);
    }

    #[test]
    fn test_unknown_enum_values_are_none() {
        let r = normalize(&raw(json!({
            "Operation Mode": "Cooling",
            "I/U operation mode": 3
        })));
        assert_eq!(r.operation_mode, None);
        assert_eq!(r.iu_operation_mode, None);

        let r = normalize(&raw(json!({"Operation Mode": "FAN ONLY", "I/U operation mode": "dhw"})));
        assert_eq!(r.operation_mode, Some(OperationMode::FanOnly));
        assert_eq!(r.iu_operation_mode, Some(IuOperationMode::Dhw));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let s = sample();
        assert_eq!(normalize(&s), normalize(&s));
    }

    #[test]
    fn test_parse_raw_rejects_non_objects() {
        assert!(parse_raw(br#"{"M5BatV": 4.9}"#).is_ok());
        assert!(matches!(parse_raw(b"[1,2]"), Err(AppError::Payload(_))));
        assert!(matches!(parse_raw(b"not json"), Err(AppError::Json(_))));
    }

    #[test]
    fn test_field_map_keys_are_unique() {
        let mut keys: Vec<&str> = FIELD_MAP.iter().map(|f| f.raw_key).collect();
        keys.sort_unstable();
        let before = keys.len();
        keys.dedup();
        assert_eq!(before, keys.len());
    }

    #[test]
    fn test_serializes_camel_case() {
        let r = normalize(&raw(json!({"Operation Mode": "Fan Only", "BUH Step1": "ON"})));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["operationMode"], json!("fanonly"));
        assert_eq!(v["buhStep1On"], json!(true));
        assert_eq!(v["leavingWaterTempBeforeBUH"], Value::Null);
    }
}
