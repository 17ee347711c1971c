//! Inbound `(topic, payload)` handling and fan-out of normalized readings.

use crate::config::{ExternalVoltageConfig, TopicConfig};
use crate::error::{AppError, Result};
use crate::normalize::{normalize, parse_raw, NormalizedReading};
use crate::power::voltage_in_range;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const BUS_CAPACITY: usize = 64;

pub type SharedReading = Arc<NormalizedReading>;

/// One producer, any number of unit subscribers.
#[derive(Debug, Clone)]
pub struct ReadingBus {
    tx: broadcast::Sender<SharedReading>,
}

impl ReadingBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self, name: impl Into<String>) -> Subscription {
        Subscription {
            name: name.into(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Deliver to every current subscriber. Returns how many received it.
    pub fn publish(&self, reading: NormalizedReading) -> usize {
        // send only fails when nobody listens
        self.tx.send(Arc::new(reading)).unwrap_or(0)
    }
}

impl Default for ReadingBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit's handle on the bus. Dropping it, or calling `unsubscribe`, detaches the unit.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    rx: broadcast::Receiver<SharedReading>,
}

impl Subscription {
    /// Next reading, or `None` once the bus is gone. Readings lost to a slow consumer are
    /// logged and skipped.
    pub async fn recv(&mut self) -> Option<SharedReading> {
        loop {
            match self.rx.recv().await {
                Ok(r) => return Some(r),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(unit = %self.name, skipped = n, "unit fell behind; readings dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {
        debug!(unit = %self.name, "unsubscribed from reading bus");
    }
}

/// What the router did with one message; mostly useful for logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Voltage { phase: u8, accepted: bool },
    Liveness { online: bool },
    Reading { delivered: usize },
    Ignored,
}

/// Turns raw transport messages into enriched readings on the bus.
///
/// Owns the latest external phase voltages; they start at the configured default.
pub struct FeedRouter {
    topics: TopicConfig,
    external: ExternalVoltageConfig,
    voltages: [f64; 3],
    bus: ReadingBus,
}

impl FeedRouter {
    pub fn new(
        topics: TopicConfig,
        external: ExternalVoltageConfig,
        voltage_default: f64,
        bus: ReadingBus,
    ) -> Self {
        Self {
            topics,
            external,
            voltages: [voltage_default; 3],
            bus,
        }
    }

    pub fn voltages(&self) -> [f64; 3] {
        self.voltages
    }

    pub fn bus(&self) -> &ReadingBus {
        &self.bus
    }

    fn voltage_phase(&self, topic: &str) -> Option<usize> {
        [
            &self.external.voltage1,
            &self.external.voltage2,
            &self.external.voltage3,
        ]
        .iter()
        .position(|t| t.as_str() == topic)
    }

    pub fn handle(&mut self, topic: &str, payload: &[u8], received_at: DateTime<Utc>) -> Result<Routed> {
        if self.external.enabled {
            if let Some(idx) = self.voltage_phase(topic) {
                let parsed = std::str::from_utf8(payload)
                    .ok()
                    .and_then(|s| s.trim().parse::<f64>().ok());
                let accepted = match parsed {
                    Some(v) if voltage_in_range(v) => {
                        self.voltages[idx] = v;
                        true
                    }
                    _ => {
                        debug!(topic, ?parsed, "ignoring out-of-range voltage");
                        false
                    }
                };
                return Ok(Routed::Voltage {
                    phase: idx as u8 + 1,
                    accepted,
                });
            }
        }

        if topic == self.topics.lwt {
            let status = String::from_utf8_lossy(payload);
            let online = status.trim() == "Online";
            if !online {
                warn!(topic, status = %status.trim(), "bridge reported offline");
            }
            return Ok(Routed::Liveness { online });
        }

        if topic != self.topics.attributes {
            return Ok(Routed::Ignored);
        }

        let raw = parse_raw(payload)?;
        let mut reading = normalize(&raw);
        if reading.operation_mode.is_none() {
            if let Some(mode) = raw.get("Operation Mode") {
                info!(%mode, "unrecognised operation mode");
            }
        }
        reading.voltage_l1 = Some(self.voltages[0]);
        reading.voltage_l2 = Some(self.voltages[1]);
        reading.voltage_l3 = Some(self.voltages[2]);
        reading.received_at = Some(received_at);

        let delivered = self.bus.publish(reading);
        if delivered == 0 {
            debug!("reading normalized but no unit is subscribed");
        }
        Ok(Routed::Reading { delivered })
    }

    /// Like `handle`, but for a topic that arrived as raw bytes.
    pub fn handle_raw_topic(
        &mut self,
        topic: &[u8],
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Routed> {
        let topic = std::str::from_utf8(topic)
            .map_err(|_| AppError::Payload(format!("non-utf8 topic {topic:?}")))?;
        self.handle(topic, payload, received_at)
    }
}
