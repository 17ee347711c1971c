use crate::session::UnitKind;
use anyhow::Context;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub external_voltage: ExternalVoltageConfig,
    #[serde(default)]
    pub thermal: ThermalConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    /// IANA timezone used for the day/month/year counters.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_units")]
    pub units: Vec<UnitKind>,
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub clean_session: Option<bool>,
    pub tls: Option<TlsConfig>,
}

impl MqttConfig {
    /// Set when the broker will be reached without credentials.
    pub fn anonymous_warning(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(_), Some(_)) => None,
            (Some(_), None) | (None, Some(_)) => Some(
                "mqtt.username and mqtt.password must be set together; connecting anonymously"
                    .into(),
            ),
            (None, None) => Some("no MQTT credentials configured; connecting anonymously".into()),
        }
    }
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "altherma-bridge".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to a PEM CA bundle (optional)
    pub ca_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Subscription root; everything below it is received.
    pub prefix: String,
    /// Topic carrying the JSON attribute object.
    pub attributes: String,
    /// Last-will topic; anything but "Online" is logged.
    pub lwt: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            prefix: "espaltherma".into(),
            attributes: "espaltherma/ATTR".into(),
            lwt: "espaltherma/LWT".into(),
        }
    }
}

impl TopicConfig {
    pub fn subscription(&self) -> String {
        format!("{}/#", self.prefix.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub voltage_default: f64,
    pub efficiency: f64,
    pub min_current_a: f64,
    pub buh_step1_w: f64,
    pub buh_step2_w: f64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            voltage_default: 230.0,
            efficiency: 0.90,
            min_current_a: 0.1,
            buh_step1_w: 3000.0,
            buh_step2_w: 6000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalVoltageConfig {
    pub enabled: bool,
    pub voltage1: String,
    pub voltage2: String,
    pub voltage3: String,
}

impl Default for ExternalVoltageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            voltage1: "espaltherma/grid/voltage1".into(),
            voltage2: "espaltherma/grid/voltage2".into(),
            voltage3: "espaltherma/grid/voltage3".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalConfig {
    pub on_threshold_c: f64,
    pub off_threshold_c: f64,
    /// Below this electrical power the unit is not treated as running.
    pub min_electrical_power_w: f64,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            on_threshold_c: 0.40,
            off_threshold_c: 0.20,
            min_electrical_power_w: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub battery_low_v: f64,
    /// Feed silence longer than this raises a warning.
    pub stale_after_secs: u64,
    pub watchdog_interval_secs: u64,
    pub reset_check_interval_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            battery_low_v: 5.0,
            stale_after_secs: 180,
            watchdog_interval_secs: 120,
            reset_check_interval_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Log,
    Mqtt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    /// Derived values are published below `<topic_prefix>/<unit>/`.
    pub topic_prefix: String,
    pub retain: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Log,
            topic_prefix: "altherma".into(),
            retain: true,
        }
    }
}

fn default_timezone() -> String {
    "UTC".into()
}

fn default_units() -> Vec<UnitKind> {
    vec![UnitKind::Boiler, UnitKind::Heatpump, UnitKind::WaterHeater]
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards, if ALTHERMA_MQTT_HOST env is set, override `mqtt.host`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, anyhow::Error> {
        let expanded = expand_env_placeholders(raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(host) = std::env::var("ALTHERMA_MQTT_HOST") {
            cfg.mqtt.host = host;
        }
        // an empty placeholder expansion means "not configured"
        for cred in [&mut cfg.mqtt.username, &mut cfg.mqtt.password] {
            if cred.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *cred = None;
            }
        }

        anyhow::ensure!(
            !cfg.mqtt.host.trim().is_empty(),
            "MQTT host is not configured; set mqtt.host or ALTHERMA_MQTT_HOST"
        );
        Ok(cfg)
    }

    /// Replace values that would make the estimates meaningless with their defaults.
    /// Returns one message per substitution so the caller can surface them once.
    pub fn sanitize(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        let defaults = PowerConfig::default();

        let p = &mut self.power;
        if !(p.efficiency.is_finite() && p.efficiency > 0.0 && p.efficiency <= 1.0) {
            warnings.push(format!(
                "power.efficiency {} is outside (0, 1]; using {}",
                p.efficiency, defaults.efficiency
            ));
            p.efficiency = defaults.efficiency;
        }
        if !crate::power::voltage_in_range(p.voltage_default) {
            warnings.push(format!(
                "power.voltage_default {} V is outside 207-253 V; using {} V",
                p.voltage_default, defaults.voltage_default
            ));
            p.voltage_default = defaults.voltage_default;
        }
        if !(p.min_current_a.is_finite() && p.min_current_a >= 0.0) {
            warnings.push(format!(
                "power.min_current_a {} is invalid; using {}",
                p.min_current_a, defaults.min_current_a
            ));
            p.min_current_a = defaults.min_current_a;
        }
        for (name, value, fallback) in [
            ("buh_step1_w", &mut p.buh_step1_w, defaults.buh_step1_w),
            ("buh_step2_w", &mut p.buh_step2_w, defaults.buh_step2_w),
        ] {
            if !(value.is_finite() && *value >= 0.0) {
                warnings.push(format!("power.{name} {value} is invalid; using {fallback}"));
                *value = fallback;
            }
        }

        let t = &mut self.thermal;
        let td = ThermalConfig::default();
        if !(t.on_threshold_c.is_finite()
            && t.off_threshold_c.is_finite()
            && t.off_threshold_c < t.on_threshold_c)
        {
            warnings.push(format!(
                "thermal thresholds on={} off={} need off < on; using {}/{}",
                t.on_threshold_c, t.off_threshold_c, td.on_threshold_c, td.off_threshold_c
            ));
            t.on_threshold_c = td.on_threshold_c;
            t.off_threshold_c = td.off_threshold_c;
        }
        if !(t.min_electrical_power_w.is_finite() && t.min_electrical_power_w > 0.0) {
            warnings.push(format!(
                "thermal.min_electrical_power_w {} is invalid; using {}",
                t.min_electrical_power_w, td.min_electrical_power_w
            ));
            t.min_electrical_power_w = td.min_electrical_power_w;
        }

        let a = &mut self.alerts;
        let ad = AlertConfig::default();
        if a.watchdog_interval_secs == 0 {
            warnings.push("alerts.watchdog_interval_secs must be > 0; using default".into());
            a.watchdog_interval_secs = ad.watchdog_interval_secs;
        }
        if a.reset_check_interval_secs == 0 {
            warnings.push("alerts.reset_check_interval_secs must be > 0; using default".into());
            a.reset_check_interval_secs = ad.reset_check_interval_secs;
        }

        if self.timezone.parse::<Tz>().is_err() {
            warnings.push(format!("unknown timezone '{}'; using UTC", self.timezone));
            self.timezone = default_timezone();
        }

        if self.units.is_empty() {
            warnings.push("no units configured; enabling all".into());
            self.units = default_units();
        } else {
            let mut seen = Vec::new();
            self.units.retain(|u| {
                if seen.contains(u) {
                    false
                } else {
                    seen.push(*u);
                    true
                }
            });
        }

        warnings
    }

    /// Parsed timezone; falls back to UTC for names `sanitize` would reject.
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String, anyhow::Error> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let close = match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                continue;
            }
        };
        it.next();
        let var = read_until(&mut it, close)
            .with_context(|| format!("unterminated env placeholder: missing '{close}'"))?;
        let val = std::env::var(&var)
            .with_context(|| format!("missing environment variable: {}", var))?;
        out.push_str(&val);
    }

    Ok(out)
}

/// Read characters until `end`, consuming the delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        serde_yaml::from_str("mqtt:\n  host: broker.local\n").unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = minimal();
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.power.voltage_default, 230.0);
        assert_eq!(cfg.power.buh_step2_w, 6000.0);
        assert_eq!(cfg.thermal.on_threshold_c, 0.40);
        assert_eq!(cfg.alerts.stale_after_secs, 180);
        assert_eq!(cfg.topics.subscription(), "espaltherma/#");
        assert_eq!(cfg.units.len(), 3);
        assert!(!cfg.external_voltage.enabled);
        assert_eq!(cfg.sink.kind, SinkKind::Log);
    }

    #[test]
    fn test_sanitize_replaces_unsafe_values() {
        let mut cfg = minimal();
        cfg.power.efficiency = 1.5;
        cfg.power.voltage_default = 110.0;
        cfg.power.buh_step1_w = -5.0;
        cfg.thermal.on_threshold_c = 0.1;
        cfg.thermal.off_threshold_c = 0.3;
        cfg.timezone = "Mars/Olympus".into();
        cfg.units = vec![UnitKind::Heatpump, UnitKind::Heatpump];

        let warnings = cfg.sanitize();
        assert_eq!(warnings.len(), 5);
        assert_eq!(cfg.power.efficiency, 0.90);
        assert_eq!(cfg.power.voltage_default, 230.0);
        assert_eq!(cfg.power.buh_step1_w, 3000.0);
        assert_eq!(cfg.thermal.off_threshold_c, 0.20);
        assert_eq!(cfg.tz(), chrono_tz::UTC);
        assert_eq!(cfg.units, vec![UnitKind::Heatpump]);
    }

    #[test]
    fn test_sanitize_accepts_defaults() {
        let mut cfg = minimal();
        assert!(cfg.sanitize().is_empty());
    }

    #[test]
    fn test_expand_placeholders() {
        std::env::set_var("ALTHERMA_CFG_TEST_PASS", "s3cret");
        let out = expand_env_placeholders("a: $(ALTHERMA_CFG_TEST_PASS) b: ${ALTHERMA_CFG_TEST_PASS} c: $$ d: $x")
            .unwrap();
        assert_eq!(out, "a: s3cret b: s3cret c: $ d: $x");
        assert!(expand_env_placeholders("${NEVER_CLOSED").is_err());
        assert!(expand_env_placeholders("$(ALTHERMA_CFG_TEST_UNSET_VAR)").is_err());
    }
}
