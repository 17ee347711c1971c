//! Electrical power estimate from the inverter primary current.
//!
//! The compressor is driven by an inverter fed from a three-phase diode rectifier, so:
//! - `Vll ≈ √3 · Vln`
//! - `Vdc ≈ 1.35 · Vll`
//! - `Pdc = Vdc · I`, and the AC input power is `Pdc / η`
//!
//! This is an estimate from an indirect proxy, not a meter.

use crate::config::PowerConfig;
use serde::Serialize;

const SQRT3: f64 = 1.732_050_807_568_877_2;
const RECTIFIER_FACTOR: f64 = 1.35;

/// Lowest and highest line-to-neutral voltage accepted from an external source.
pub const VOLTAGE_MIN_V: f64 = 207.0;
pub const VOLTAGE_MAX_V: f64 = 253.0;

/// Line-to-line voltage from line-to-neutral voltage. Returns 0 for unusable input.
pub fn vll_from_vln(vln: f64) -> f64 {
    if !vln.is_finite() || vln <= 0.0 {
        return 0.0;
    }
    vln * SQRT3
}

/// DC bus voltage behind a three-phase diode rectifier.
pub fn vdc_from_vll(vll: f64) -> f64 {
    if !vll.is_finite() || vll <= 0.0 {
        return 0.0;
    }
    RECTIFIER_FACTOR * vll
}

/// Whether an externally reported phase voltage is plausible for a 230 V grid.
pub fn voltage_in_range(v: f64) -> bool {
    v.is_finite() && (VOLTAGE_MIN_V..=VOLTAGE_MAX_V).contains(&v)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerEstimate {
    /// Estimate using the supplied phase voltages.
    pub corrected_w: f64,
    /// Same current and efficiency, but the default voltage on every phase.
    pub naive_w: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PowerModel {
    efficiency: f64,
    min_current_a: f64,
    voltage_default: f64,
}

impl PowerModel {
    pub fn new(efficiency: f64, min_current_a: f64, voltage_default: f64) -> Self {
        Self {
            efficiency,
            min_current_a,
            voltage_default,
        }
    }

    pub fn from_config(cfg: &PowerConfig) -> Self {
        Self::new(cfg.efficiency, cfg.min_current_a, cfg.voltage_default)
    }

    pub fn voltage_default(&self) -> f64 {
        self.voltage_default
    }

    /// Estimated electrical input power in watts.
    ///
    /// The phase voltage is the mean of `l1`, `l2` and (when given) `l3`. Any non-finite or
    /// non-positive voltage, a current below the minimum, or an efficiency outside `(0, 1]`
    /// yields 0.
    pub fn estimate_power_w(&self, current_a: Option<f64>, l1: f64, l2: f64, l3: Option<f64>) -> f64 {
        let Some(current) = current_a else {
            return 0.0;
        };
        if !current.is_finite() || current < self.min_current_a {
            return 0.0;
        }
        if !self.efficiency.is_finite() || self.efficiency <= 0.0 || self.efficiency > 1.0 {
            return 0.0;
        }

        let phases = [Some(l1), Some(l2), l3];
        let mut sum = 0.0;
        let mut count = 0.0;
        for v in phases.into_iter().flatten() {
            if !v.is_finite() || v <= 0.0 {
                return 0.0;
            }
            sum += v;
            count += 1.0;
        }
        let vln = sum / count;

        let vdc = vdc_from_vll(vll_from_vln(vln));
        let pdc = vdc * current;
        let pel = pdc / self.efficiency;
        if pel.is_finite() {
            pel.max(0.0)
        } else {
            0.0
        }
    }

    /// Estimate with every phase at the configured default voltage.
    pub fn naive_power_w(&self, current_a: Option<f64>) -> f64 {
        let v = self.voltage_default;
        self.estimate_power_w(current_a, v, v, Some(v))
    }

    /// Corrected and naive estimates side by side. Phase voltages that are missing or outside
    /// the accepted range fall back to the default.
    pub fn estimate_with_fallback(
        &self,
        current_a: Option<f64>,
        l1: Option<f64>,
        l2: Option<f64>,
        l3: Option<f64>,
    ) -> PowerEstimate {
        let pick = |v: Option<f64>| match v {
            Some(v) if voltage_in_range(v) => v,
            _ => self.voltage_default,
        };
        PowerEstimate {
            corrected_w: self.estimate_power_w(current_a, pick(l1), pick(l2), Some(pick(l3))),
            naive_w: self.naive_power_w(current_a),
        }
    }
}

impl Default for PowerModel {
    fn default() -> Self {
        Self::from_config(&PowerConfig::default())
    }
}
