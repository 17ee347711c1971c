//! Thermal output and COP, gated by a two-threshold hysteresis on the water ΔT.

use crate::config::ThermalConfig;
use serde::Serialize;
use std::collections::VecDeque;

/// l/min to m³/h.
const LPM_TO_M3H: f64 = 0.06;
/// Heat carried by water in kWh per m³ per kelvin.
const WATER_KWH_PER_M3K: f64 = 1.16;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ThermalOutput {
    pub thermal_power_kw: f64,
    pub cop: f64,
    /// Raw ΔT when both temperatures were usable.
    pub delta_t: Option<f64>,
    pub valid: bool,
}

/// Thermal power in kW for a flow in l/min and a ΔT in kelvin.
pub fn thermal_power_kw(flow_lpm: f64, delta_t: f64) -> f64 {
    WATER_KWH_PER_M3K * flow_lpm * LPM_TO_M3H * delta_t
}

#[derive(Debug, Clone)]
pub struct ThermalGate {
    on_threshold_c: f64,
    off_threshold_c: f64,
    min_electrical_power_w: f64,
    is_valid: bool,
}

impl ThermalGate {
    pub fn new(on_threshold_c: f64, off_threshold_c: f64, min_electrical_power_w: f64) -> Self {
        Self {
            on_threshold_c,
            off_threshold_c,
            min_electrical_power_w,
            is_valid: false,
        }
    }

    pub fn from_config(cfg: &ThermalConfig) -> Self {
        Self::new(
            cfg.on_threshold_c,
            cfg.off_threshold_c,
            cfg.min_electrical_power_w,
        )
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn reset(&mut self) {
        self.is_valid = false;
    }

    /// Advance the hysteresis with a new ΔT and return the resulting validity.
    fn observe(&mut self, delta_t: f64) -> bool {
        if self.is_valid {
            if delta_t <= self.off_threshold_c {
                self.is_valid = false;
            }
        } else if delta_t >= self.on_threshold_c {
            self.is_valid = true;
        }
        self.is_valid
    }

    pub fn compute(
        &mut self,
        flow_lpm: Option<f64>,
        leaving_before_aux: Option<f64>,
        inlet: Option<f64>,
        electrical_power_w: f64,
    ) -> ThermalOutput {
        let (Some(flow), Some(leaving), Some(inlet)) = (flow_lpm, leaving_before_aux, inlet) else {
            self.reset();
            return ThermalOutput::default();
        };
        if ![flow, leaving, inlet, electrical_power_w]
            .iter()
            .all(|v| v.is_finite())
        {
            self.reset();
            return ThermalOutput::default();
        }

        let delta_t = leaving - inlet;
        if flow <= 0.0 || electrical_power_w < self.min_electrical_power_w {
            self.reset();
            return ThermalOutput {
                delta_t: Some(delta_t),
                ..ThermalOutput::default()
            };
        }

        if !self.observe(delta_t) || delta_t <= 0.0 {
            return ThermalOutput {
                delta_t: Some(delta_t),
                valid: self.is_valid,
                ..ThermalOutput::default()
            };
        }

        let kw = thermal_power_kw(flow, delta_t);
        ThermalOutput {
            thermal_power_kw: kw,
            cop: kw * 1000.0 / electrical_power_w,
            delta_t: Some(delta_t),
            valid: true,
        }
    }
}

impl Default for ThermalGate {
    fn default() -> Self {
        Self::from_config(&ThermalConfig::default())
    }
}

/// Moving average of the last few ΔT values, clamped at zero and rounded to 0.1 K.
#[derive(Debug, Clone)]
pub struct DeltaTSmoother {
    window: VecDeque<f64>,
    capacity: usize,
}

impl DeltaTSmoother {
    /// Five samples is roughly two and a half minutes at the bridge's usual cadence.
    pub const DEFAULT_SAMPLES: usize = 5;

    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, delta_t: f64) -> Option<f64> {
        if !delta_t.is_finite() {
            return None;
        }
        self.window.push_back(delta_t.max(0.0));
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
        let avg = self.window.iter().sum::<f64>() / self.window.len() as f64;
        Some((avg * 10.0).round() / 10.0)
    }
}

impl Default for DeltaTSmoother {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SAMPLES)
    }
}
