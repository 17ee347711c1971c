use crate::config::AlertConfig;
use crate::feed::Subscription;
use crate::session::{ReadingListener, UnitSession};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub watchdog: Duration,
    pub reset_check: Duration,
}

impl Intervals {
    pub fn from_config(cfg: &AlertConfig) -> Self {
        Self {
            watchdog: Duration::from_secs(cfg.watchdog_interval_secs.max(1)),
            reset_check: Duration::from_secs(cfg.reset_check_interval_secs.max(1)),
        }
    }
}

/// Drive one unit until shutdown or until the bus goes away.
///
/// The session is owned by this task, so readings and timer checks never race.
/// It is handed back after teardown.
pub async fn run_unit(
    session: UnitSession,
    readings: Subscription,
    intervals: Intervals,
    shutdown: broadcast::Receiver<()>,
) -> UnitSession {
    drive(session, readings, intervals, shutdown, Utc::now()).await
}

/// Wall-clock time for the timers, advanced by the runtime clock from `epoch`.
struct TimerClock {
    epoch: DateTime<Utc>,
    started: Instant,
}

impl TimerClock {
    fn new(epoch: DateTime<Utc>) -> Self {
        Self {
            epoch,
            started: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.epoch + elapsed
    }
}

async fn drive(
    mut session: UnitSession,
    mut readings: Subscription,
    intervals: Intervals,
    mut shutdown: broadcast::Receiver<()>,
    epoch: DateTime<Utc>,
) -> UnitSession {
    let unit = session.kind().name();
    let clock = TimerClock::new(epoch);
    let mut watchdog = tokio::time::interval(intervals.watchdog);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut resets = tokio::time::interval(intervals.reset_check);
    resets.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(unit, "unit started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                info!(unit, "shutdown requested");
                break;
            }
            next = readings.recv() => {
                match next {
                    // failures are logged by the session; the next reading starts clean
                    Some(reading) => {
                        let _ = session.on_reading(&reading);
                    }
                    None => {
                        info!(unit, "reading bus closed");
                        break;
                    }
                }
            }
            _ = watchdog.tick() => {
                if let Err(e) = session.check_feed(clock.now()) {
                    warn!(unit, error = %e, "feed watchdog failed");
                }
            }
            _ = resets.tick() => {
                if let Err(e) = session.check_resets(clock.now()) {
                    warn!(unit, error = %e, "energy reset check failed");
                }
            }
        }
    }

    readings.unsubscribe();
    session.on_teardown();
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Result;
    use crate::feed::ReadingBus;
    use crate::meter::EnergyAccumulators;
    use crate::normalize::NormalizedReading;
    use crate::session::{SessionSettings, SessionState, UnitKind};
    use crate::sink::{AlertSink, CapabilitySink, CapabilityValue, LogSink, MockAlertSink};
    use chrono::TimeZone;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MeterLog(Mutex<Vec<(String, CapabilityValue)>>);

    impl CapabilitySink for MeterLog {
        fn set(&self, _unit: &str, capability: &str, value: &CapabilityValue) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .push((capability.to_string(), value.clone()));
            Ok(())
        }
    }

    fn unit(kind: UnitKind) -> UnitSession {
        let cfg: Config = serde_yaml::from_str("mqtt:\n  host: localhost\n").unwrap();
        let sink = Arc::new(LogSink);
        UnitSession::new(
            kind,
            SessionSettings::from_config(&cfg),
            sink.clone(),
            sink,
            Utc::now(),
        )
    }

    fn intervals() -> Intervals {
        Intervals {
            watchdog: Duration::from_secs(120),
            reset_check: Duration::from_secs(1800),
        }
    }

    fn reading(secs: i64, current: f64) -> NormalizedReading {
        NormalizedReading {
            inv_primary_current: Some(current),
            received_at: Some(Utc::now() + chrono::Duration::seconds(secs)),
            ..NormalizedReading::default()
        }
    }

    #[tokio::test]
    async fn test_unit_drains_bus_then_stops_when_closed() {
        let bus = ReadingBus::new();
        let sub = bus.subscribe("boiler");
        let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        bus.publish(reading(0, 5.0));
        bus.publish(reading(60, 5.0));
        drop(bus);

        let session = run_unit(unit(UnitKind::Boiler), sub, intervals(), shutdown_rx).await;
        assert_eq!(session.state(), SessionState::Running);
        assert!(session.energy().day.kwh > 0.0);
    }

    #[tokio::test]
    async fn test_unit_stops_on_shutdown() {
        let bus = ReadingBus::new();
        let sub = bus.subscribe("heatpump");
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        let handle = tokio::spawn(run_unit(
            unit(UnitKind::Heatpump),
            sub,
            intervals(),
            shutdown_rx,
        ));
        shutdown_tx.send(()).unwrap();
        let session = handle.await.unwrap();
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_raises_feed_warning_once_after_silence() {
        let cfg: Config = serde_yaml::from_str("mqtt:\n  host: localhost\n").unwrap();
        let epoch = Utc.with_ymd_and_hms(2025, 1, 20, 10, 0, 0).unwrap();
        let mut alerts = MockAlertSink::new();
        alerts
            .expect_raise()
            .withf(|unit, channel, _| unit == "heatpump" && channel == "feed")
            .times(1)
            .returning(|_, _, _| Ok(()));
        let session = UnitSession::new(
            UnitKind::Heatpump,
            SessionSettings::from_config(&cfg),
            Arc::new(LogSink),
            Arc::new(alerts),
            epoch,
        );

        let bus = ReadingBus::new();
        let sub = bus.subscribe("heatpump");
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let handle = tokio::spawn(drive(session, sub, intervals(), shutdown_rx, epoch));

        // ticks at 0, 120, 240, 360 and 480 s; only the ones past 180 s are stale
        tokio::time::sleep(Duration::from_secs(500)).await;
        shutdown_tx.send(()).unwrap();
        let session = handle.await.unwrap();
        assert_eq!(session.active_warnings().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_timer_zeroes_day_counter_at_midnight() {
        let cfg: Config = serde_yaml::from_str("mqtt:\n  host: localhost\n").unwrap();
        let epoch = Utc.with_ymd_and_hms(2025, 1, 20, 23, 58, 0).unwrap();
        let mut acc = EnergyAccumulators::new();
        acc.check_resets(epoch, chrono_tz::UTC);
        acc.add(3.0);

        let meters = Arc::new(MeterLog::default());
        let session = UnitSession::new(
            UnitKind::Boiler,
            SessionSettings::from_config(&cfg),
            meters.clone(),
            Arc::new(LogSink) as Arc<dyn AlertSink>,
            epoch,
        )
        .with_accumulators(acc);

        let bus = ReadingBus::new();
        let sub = bus.subscribe("boiler");
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let timers = Intervals {
            watchdog: Duration::from_secs(3600),
            reset_check: Duration::from_secs(60),
        };
        let handle = tokio::spawn(drive(session, sub, timers, shutdown_rx, epoch));

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown_tx.send(()).unwrap();
        let session = handle.await.unwrap();

        assert_eq!(session.energy().day.kwh, 0.0);
        assert_eq!(session.energy().month.kwh, 3.0);
        let log = meters.0.lock().unwrap();
        assert!(log.contains(&("meter_power.day".to_string(), CapabilityValue::Number(0.0))));
        assert!(log.contains(&("meter_power.month".to_string(), CapabilityValue::Number(3.0))));
    }
}
