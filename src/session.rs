//! Per-unit aggregation of normalized readings into derived capabilities.
//!
//! Every monitored unit runs the same estimation chain (power, energy, thermal/COP); the only
//! per-unit difference is the predicate deciding whether the unit is producing output, plus
//! which display values it exposes.

use crate::config::Config;
use crate::energy::EnergyIntegrator;
use crate::error::Result;
use crate::meter::{EnergyAccumulators, ResetOutcome};
use crate::normalize::NormalizedReading;
use crate::power::{PowerEstimate, PowerModel};
use crate::sink::{AlertSink, CapabilitySink, CapabilityValue};
use crate::thermal::{DeltaTSmoother, ThermalGate, ThermalOutput};
use crate::warning::WarningChannel;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod caps {
    pub const MEASURE_POWER: &str = "measure_power";
    pub const MEASURE_POWER_NAIVE: &str = "measure_power.naive";
    pub const MEASURE_POWER_REPORTED: &str = "measure_power.reported";
    pub const MEASURE_COP: &str = "measure_cop";
    pub const MEASURE_THERMAL_POWER: &str = "measure_thermal_power";
    pub const METER_DAY: &str = "meter_power.day";
    pub const METER_MONTH: &str = "meter_power.month";
    pub const METER_YEAR: &str = "meter_power.year";
    pub const METER_MEASURED_DAY: &str = "meter_power.measured.day";
    pub const METER_MEASURED_MONTH: &str = "meter_power.measured.month";
    pub const METER_MEASURED_YEAR: &str = "meter_power.measured.year";

    pub const OPERATION_MODE: &str = "operation_mode";
    pub const THERMOSTAT_ON: &str = "thermostat_on_off";
    pub const SPACE_HEATING: &str = "space_heating";
    pub const DEFROST: &str = "defrost";
    pub const ERROR_CODE: &str = "error_code";
    pub const TEMP_OUTDOOR: &str = "measure_temperature.outdoor";
    pub const TEMP_LEAVING: &str = "measure_temperature.leavingWater";
    pub const TEMP_RETURNING: &str = "measure_temperature.returningWater";
    pub const TEMP_DELTA: &str = "measure_temperature.deltaT";
    pub const TEMP_LW_SETPOINT: &str = "measure_temperature.lwSetPoint";
    pub const TEMP_TARGET: &str = "measure_temperature.target";
    pub const TEMP_DHW_TANK: &str = "measure_temperature.dhwtank";
    pub const TEMP_DHW_TARGET: &str = "measure_temperature.target_dhwtank";
    pub const POWERFUL_DHW: &str = "powerful_dhwtank";
    pub const MEASURE_WATER: &str = "measure_water";
}

const BATTERY_CHANNEL: &str = "battery";
const FEED_CHANNEL: &str = "feed";
/// Constant so that a noisy voltage does not re-raise the warning on every message.
const LOW_BATTERY_MESSAGE: &str = "Low battery voltage on the monitoring bridge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Whole installation: every compressor run counts.
    Boiler,
    /// Space heating.
    Heatpump,
    /// Domestic hot water.
    #[serde(alias = "water_heater")]
    WaterHeater,
}

impl UnitKind {
    pub fn name(&self) -> &'static str {
        match self {
            UnitKind::Boiler => "boiler",
            UnitKind::Heatpump => "heatpump",
            UnitKind::WaterHeater => "waterheater",
        }
    }

    /// Whether this unit is producing output for the given reading.
    pub fn is_active(&self, r: &NormalizedReading) -> bool {
        let compressor_running = r.inv_primary_current.is_some_and(|a| a > 0.0);
        match self {
            UnitKind::Boiler => compressor_running,
            UnitKind::Heatpump => compressor_running && !r.three_way_valve_dhw,
            UnitKind::WaterHeater => compressor_running && r.three_way_valve_dhw,
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The configuration a session needs, extracted once from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub power: PowerModel,
    pub buh_step1_w: f64,
    pub buh_step2_w: f64,
    pub thermal_on_c: f64,
    pub thermal_off_c: f64,
    pub min_electrical_power_w: f64,
    pub battery_low_v: f64,
    pub stale_after: Duration,
    pub tz: Tz,
}

impl SessionSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            power: PowerModel::from_config(&cfg.power),
            buh_step1_w: cfg.power.buh_step1_w,
            buh_step2_w: cfg.power.buh_step2_w,
            thermal_on_c: cfg.thermal.on_threshold_c,
            thermal_off_c: cfg.thermal.off_threshold_c,
            min_electrical_power_w: cfg.thermal.min_electrical_power_w,
            battery_low_v: cfg.alerts.battery_low_v,
            stale_after: Duration::seconds(cfg.alerts.stale_after_secs as i64),
            tz: cfg.tz(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Running,
}

/// What one reading did to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingReport {
    pub active: bool,
    /// Only established the integration baseline.
    pub first: bool,
    pub estimate: PowerEstimate,
    pub total_power_w: f64,
    pub delta_kwh: f64,
    pub thermal: Option<ThermalOutput>,
    pub resets: ResetOutcome,
}

/// The small surface the runner drives a unit through.
pub trait ReadingListener {
    fn on_reading(&mut self, reading: &NormalizedReading) -> Result<ReadingReport>;
    fn on_teardown(&mut self);
}

pub struct UnitSession {
    kind: UnitKind,
    settings: SessionSettings,
    state: SessionState,
    integrator: EnergyIntegrator,
    gate: ThermalGate,
    smoother: DeltaTSmoother,
    energy: EnergyAccumulators,
    /// Pulse-meter energy reported by the bridge, heat pump only.
    measured: Option<EnergyAccumulators>,
    battery_warning: WarningChannel,
    feed_warning: WarningChannel,
    last_message_at: DateTime<Utc>,
    sink: Arc<dyn CapabilitySink>,
    alerts: Arc<dyn AlertSink>,
}

impl UnitSession {
    pub fn new(
        kind: UnitKind,
        settings: SessionSettings,
        sink: Arc<dyn CapabilitySink>,
        alerts: Arc<dyn AlertSink>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let gate = ThermalGate::new(
            settings.thermal_on_c,
            settings.thermal_off_c,
            settings.min_electrical_power_w,
        );
        Self {
            kind,
            state: SessionState::Uninitialized,
            integrator: EnergyIntegrator::new(),
            gate,
            smoother: DeltaTSmoother::default(),
            energy: EnergyAccumulators::new(),
            measured: (kind == UnitKind::Heatpump).then(EnergyAccumulators::new),
            battery_warning: WarningChannel::new(),
            feed_warning: WarningChannel::new(),
            last_message_at: started_at,
            settings,
            sink,
            alerts,
        }
    }

    /// Continue from totals persisted elsewhere.
    pub fn with_accumulators(mut self, energy: EnergyAccumulators) -> Self {
        self.energy = energy;
        self
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn energy(&self) -> &EnergyAccumulators {
        &self.energy
    }

    pub fn measured_energy(&self) -> Option<&EnergyAccumulators> {
        self.measured.as_ref()
    }

    pub fn integrator(&self) -> &EnergyIntegrator {
        &self.integrator
    }

    pub fn thermal_valid(&self) -> bool {
        self.gate.is_valid()
    }

    pub fn last_message_at(&self) -> DateTime<Utc> {
        self.last_message_at
    }

    pub fn active_warnings(&self) -> Vec<&str> {
        [self.battery_warning.active(), self.feed_warning.active()]
            .into_iter()
            .flatten()
            .collect()
    }

    fn set(&self, capability: &str, value: CapabilityValue) -> Result<()> {
        self.sink.set(self.kind.name(), capability, &value)
    }

    fn buh_power_w(&self, r: &NormalizedReading) -> f64 {
        let mut w = 0.0;
        if r.buh_step1_on {
            w += self.settings.buh_step1_w;
        }
        if r.buh_step2_on {
            w += self.settings.buh_step2_w;
        }
        w
    }

    fn process(&mut self, r: &NormalizedReading) -> Result<ReadingReport> {
        let name = self.kind.name();
        let now = r.received_at.unwrap_or_else(Utc::now);
        if now > self.last_message_at {
            self.last_message_at = now;
        }

        let active = self.kind.is_active(r);
        let estimate = self.settings.power.estimate_with_fallback(
            r.inv_primary_current,
            r.voltage_l1,
            r.voltage_l2,
            r.voltage_l3,
        );
        let total_power_w = if active {
            estimate.corrected_w + self.buh_power_w(r)
        } else {
            0.0
        };

        // counters move before any publish; a rejected write must not lose the interval
        let step = self.integrator.step(now, total_power_w);
        self.state = SessionState::Running;
        let resets = self.roll_periods(now);
        self.energy.add(step.delta_kwh);
        if let (Some(measured), Some(delta)) = (self.measured.as_mut(), pulse_kwh(r)) {
            measured.add(delta);
        }

        let thermal = if active {
            // The leaving temperature is taken before the backup heater, so only the
            // compressor's share of the input power belongs in the COP.
            Some(self.gate.compute(
                r.flow_lpm,
                r.leaving_water_temp_before_buh,
                r.inlet_water_temp,
                estimate.corrected_w,
            ))
        } else {
            self.gate.reset();
            None
        };

        let published =
            self.publish_reading(r, step.first, total_power_w, &estimate, thermal.as_ref());
        let alerted = self.update_alerts(r.battery_voltage);
        published?;
        alerted?;

        debug!(
            unit = name,
            active,
            power_w = total_power_w,
            delta_kwh = step.delta_kwh,
            day_kwh = self.energy.day.kwh,
            "reading processed"
        );

        Ok(ReadingReport {
            active,
            first: step.first,
            estimate,
            total_power_w,
            delta_kwh: step.delta_kwh,
            thermal,
            resets,
        })
    }

    fn publish_reading(
        &mut self,
        r: &NormalizedReading,
        first: bool,
        total_power_w: f64,
        estimate: &PowerEstimate,
        thermal: Option<&ThermalOutput>,
    ) -> Result<()> {
        let name = self.kind.name();
        self.publish_display(r).map_err(|e| e.in_unit(name, "display"))?;
        if let Some(out) = thermal {
            self.publish_power(first, total_power_w, estimate, out)
                .map_err(|e| e.in_unit(name, "power"))?;
        }
        self.publish_meters().map_err(|e| e.in_unit(name, "energy"))
    }

    fn update_alerts(&mut self, battery_voltage: Option<f64>) -> Result<()> {
        let name = self.kind.name();
        if self.feed_warning.clear() {
            self.alerts
                .clear(name, FEED_CHANNEL)
                .map_err(|e| e.in_unit(name, "alerts"))?;
        }
        self.check_battery(battery_voltage)
            .map_err(|e| e.in_unit(name, "alerts"))
    }

    fn publish_display(&mut self, r: &NormalizedReading) -> Result<()> {
        use caps::*;
        match self.kind {
            UnitKind::Boiler | UnitKind::WaterHeater => {
                self.set(TEMP_DHW_TANK, CapabilityValue::number(r.dhw_tank_temp))?;
                self.set(TEMP_DHW_TARGET, CapabilityValue::number(r.dhw_setpoint))?;
                self.set(POWERFUL_DHW, CapabilityValue::Bool(r.powerful_dhw_on))?;
            }
            UnitKind::Heatpump => {
                let mode = r.operation_mode.map(|m| match m {
                    crate::normalize::OperationMode::FanOnly => "fanonly",
                    crate::normalize::OperationMode::Heating => "heating",
                });
                self.set(OPERATION_MODE, CapabilityValue::text(mode))?;
                self.set(THERMOSTAT_ON, CapabilityValue::Bool(r.thermostat_on))?;
                self.set(SPACE_HEATING, CapabilityValue::Bool(r.space_heating_on))?;
                self.set(DEFROST, CapabilityValue::Bool(r.defrost_operation))?;
                self.set(ERROR_CODE, CapabilityValue::text(r.error_type.clone()))?;
                self.set(TEMP_OUTDOOR, CapabilityValue::number(r.outdoor_air_temp))?;
                self.set(TEMP_LEAVING, CapabilityValue::number(r.leaving_water_temp))?;
                self.set(TEMP_RETURNING, CapabilityValue::number(r.inlet_water_temp))?;
                if let (Some(leaving), Some(inlet)) = (r.leaving_water_temp, r.inlet_water_temp) {
                    if let Some(smoothed) = self.smoother.push(leaving - inlet) {
                        self.set(TEMP_DELTA, CapabilityValue::Number(smoothed))?;
                    }
                }
                self.set(TEMP_LW_SETPOINT, CapabilityValue::number(r.lw_setpoint_main))?;
                self.set(TEMP_TARGET, CapabilityValue::number(r.rt_setpoint))?;
                self.set(MEASURE_WATER, CapabilityValue::number(r.flow_lpm))?;
                self.set(MEASURE_POWER_REPORTED, CapabilityValue::number(r.measure_power))?;
            }
        }
        Ok(())
    }

    fn publish_power(
        &self,
        first: bool,
        total_power_w: f64,
        estimate: &PowerEstimate,
        thermal: &ThermalOutput,
    ) -> Result<()> {
        // No instantaneous value until a baseline exists, so a restart does not flash a spike.
        if !first {
            self.set(caps::MEASURE_POWER, CapabilityValue::Number(total_power_w.round()))?;
            self.set(
                caps::MEASURE_POWER_NAIVE,
                CapabilityValue::Number(estimate.naive_w.round()),
            )?;
        }
        self.set(caps::MEASURE_COP, CapabilityValue::Number(round2(thermal.cop)))?;
        self.set(
            caps::MEASURE_THERMAL_POWER,
            CapabilityValue::Number(round2(thermal.thermal_power_kw)),
        )
    }

    fn publish_meters(&self) -> Result<()> {
        let (day, month, year) = self.energy.totals();
        self.set(caps::METER_DAY, CapabilityValue::Number(day))?;
        self.set(caps::METER_MONTH, CapabilityValue::Number(month))?;
        self.set(caps::METER_YEAR, CapabilityValue::Number(year))?;
        if let Some(measured) = &self.measured {
            let (day, month, year) = measured.totals();
            self.set(caps::METER_MEASURED_DAY, CapabilityValue::Number(day))?;
            self.set(caps::METER_MEASURED_MONTH, CapabilityValue::Number(month))?;
            self.set(caps::METER_MEASURED_YEAR, CapabilityValue::Number(year))?;
        }
        Ok(())
    }

    /// Zero every counter whose calendar period ended and push the zeros downstream.
    pub fn check_resets(&mut self, now: DateTime<Utc>) -> Result<ResetOutcome> {
        let name = self.kind.name();
        let outcome = self.roll_periods(now);
        if outcome.any() {
            self.publish_meters().map_err(|e| e.in_unit(name, "reset"))?;
        }
        Ok(outcome)
    }

    fn roll_periods(&mut self, now: DateTime<Utc>) -> ResetOutcome {
        let tz = self.settings.tz;
        let outcome = self.energy.check_resets(now, tz);
        if let Some(measured) = self.measured.as_mut() {
            measured.check_resets(now, tz);
        }
        if outcome.any() {
            info!(
                unit = self.kind.name(),
                day = outcome.day,
                month = outcome.month,
                year = outcome.year,
                "energy counters reset"
            );
        }
        outcome
    }

    fn check_battery(&mut self, voltage: Option<f64>) -> Result<()> {
        let name = self.kind.name();
        match voltage {
            Some(v) if v < self.settings.battery_low_v => {
                if self.battery_warning.raise(LOW_BATTERY_MESSAGE) {
                    warn!(unit = name, voltage = v, "monitoring bridge battery low");
                    self.alerts.raise(name, BATTERY_CHANNEL, LOW_BATTERY_MESSAGE)?;
                }
            }
            Some(_) => {
                if self.battery_warning.clear() {
                    self.alerts.clear(name, BATTERY_CHANNEL)?;
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Watchdog: warn when the feed has been silent for longer than the configured gap.
    pub fn check_feed(&mut self, now: DateTime<Utc>) -> Result<bool> {
        let name = self.kind.name();
        let silent_for = now - self.last_message_at;
        if silent_for > self.settings.stale_after {
            let msg = format!(
                "No data from the monitoring bridge for more than {} minutes",
                self.settings.stale_after.num_minutes()
            );
            if self.feed_warning.raise(msg.as_str()) {
                self.alerts
                    .raise(name, FEED_CHANNEL, &msg)
                    .map_err(|e| e.in_unit(name, "watchdog"))?;
            }
            return Ok(true);
        }
        if self.feed_warning.clear() {
            self.alerts
                .clear(name, FEED_CHANNEL)
                .map_err(|e| e.in_unit(name, "watchdog"))?;
        }
        Ok(false)
    }
}

impl ReadingListener for UnitSession {
    fn on_reading(&mut self, reading: &NormalizedReading) -> Result<ReadingReport> {
        self.process(reading).map_err(|e| {
            warn!(unit = self.kind.name(), error = %e, "processing reading failed");
            e
        })
    }

    fn on_teardown(&mut self) {
        let (day, month, year) = self.energy.totals();
        info!(
            unit = self.kind.name(),
            day_kwh = day,
            month_kwh = month,
            year_kwh = year,
            "unit torn down"
        );
    }
}

/// Energy reported by the bridge's pulse meter for this message.
fn pulse_kwh(r: &NormalizedReading) -> Option<f64> {
    let (delta, per_kwh) = (r.pulse_delta?, r.pulse_per_kwh?);
    if delta < 0.0 || per_kwh <= 0.0 {
        return None;
    }
    Some(delta / per_kwh)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
