//! Where derived values and warnings go once a unit has computed them.

use crate::error::{AppError, Result};
use crate::mqtt::{AsyncClient, QoS};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

/// A named display value. `Null` means "unknown" and clears the value downstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Number(f64),
    Bool(bool),
    Text(String),
    Null,
}

impl CapabilityValue {
    pub fn number(v: Option<f64>) -> Self {
        match v {
            Some(v) if v.is_finite() => CapabilityValue::Number(v),
            _ => CapabilityValue::Null,
        }
    }

    pub fn text(v: Option<impl Into<String>>) -> Self {
        v.map_or(CapabilityValue::Null, |s| CapabilityValue::Text(s.into()))
    }
}

impl fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityValue::Number(v) => write!(f, "{v}"),
            CapabilityValue::Bool(b) => write!(f, "{b}"),
            CapabilityValue::Text(s) => f.write_str(s),
            CapabilityValue::Null => f.write_str("null"),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait CapabilitySink: Send + Sync {
    fn set(&self, unit: &str, capability: &str, value: &CapabilityValue) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait AlertSink: Send + Sync {
    fn raise(&self, unit: &str, channel: &str, message: &str) -> Result<()>;
    fn clear(&self, unit: &str, channel: &str) -> Result<()>;
}

/// Writes everything to the tracing log.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl CapabilitySink for LogSink {
    fn set(&self, unit: &str, capability: &str, value: &CapabilityValue) -> Result<()> {
        tracing::debug!(unit, capability, %value, "capability updated");
        Ok(())
    }
}

impl AlertSink for LogSink {
    fn raise(&self, unit: &str, channel: &str, message: &str) -> Result<()> {
        warn!(unit, channel, "{message}");
        Ok(())
    }

    fn clear(&self, unit: &str, channel: &str) -> Result<()> {
        info!(unit, channel, "warning cleared");
        Ok(())
    }
}

/// Publishes derived values back to the broker below `<prefix>/<unit>/`.
#[derive(Clone)]
pub struct MqttSink {
    client: AsyncClient,
    prefix: String,
    retain: bool,
}

impl MqttSink {
    pub fn new(client: AsyncClient, prefix: impl Into<String>, retain: bool) -> Self {
        Self {
            client,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            retain,
        }
    }

    pub fn topic(&self, unit: &str, leaf: &str) -> String {
        format!("{}/{}/{}", self.prefix, unit, leaf.replace('.', "/"))
    }

    fn publish(&self, topic: String, payload: String) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, self.retain, payload)
            .map_err(|e| AppError::Sink(e.to_string()))
    }
}

impl CapabilitySink for MqttSink {
    fn set(&self, unit: &str, capability: &str, value: &CapabilityValue) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.publish(self.topic(unit, capability), payload)
    }
}

impl AlertSink for MqttSink {
    fn raise(&self, unit: &str, channel: &str, message: &str) -> Result<()> {
        warn!(unit, channel, "{message}");
        self.publish(self.topic(unit, &format!("warning.{channel}")), message.to_string())
    }

    fn clear(&self, unit: &str, channel: &str) -> Result<()> {
        info!(unit, channel, "warning cleared");
        self.publish(self.topic(unit, &format!("warning.{channel}")), String::new())
    }
}
