use chrono::{DateTime, Utc};

/// Trapezoidal energy increment in kWh between two power samples `dt_seconds` apart.
///
/// Returns 0 for non-finite or negative power and for `dt_seconds <= 0`, so clock skew or
/// out-of-order delivery never produces negative energy.
pub fn integrate_kwh(prev_power_w: f64, curr_power_w: f64, dt_seconds: f64) -> f64 {
    if !prev_power_w.is_finite() || prev_power_w < 0.0 {
        return 0.0;
    }
    if !curr_power_w.is_finite() || curr_power_w < 0.0 {
        return 0.0;
    }
    if !dt_seconds.is_finite() || dt_seconds <= 0.0 {
        return 0.0;
    }
    let dt_hours = dt_seconds / 3600.0;
    (prev_power_w + curr_power_w) / 2.0 * dt_hours / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegrationStep {
    pub delta_kwh: f64,
    /// True when this sample only established the baseline.
    pub first: bool,
}

/// Running trapezoidal integrator over irregularly spaced power samples.
#[derive(Debug, Clone, Default)]
pub struct EnergyIntegrator {
    previous: Option<(DateTime<Utc>, f64)>,
}

impl EnergyIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous_timestamp(&self) -> Option<DateTime<Utc>> {
        self.previous.map(|(ts, _)| ts)
    }

    pub fn previous_power_w(&self) -> Option<f64> {
        self.previous.map(|(_, p)| p)
    }

    /// Feed one sample. The stored sample always advances, even when time went backwards.
    pub fn step(&mut self, ts: DateTime<Utc>, power_w: f64) -> IntegrationStep {
        let power_w = if power_w.is_finite() { power_w } else { 0.0 };

        let Some((prev_ts, prev_power)) = self.previous.replace((ts, power_w)) else {
            return IntegrationStep {
                delta_kwh: 0.0,
                first: true,
            };
        };

        let dt_seconds = (ts - prev_ts).num_milliseconds() as f64 / 1000.0;
        IntegrationStep {
            delta_kwh: integrate_kwh(prev_power, power_w, dt_seconds),
            first: false,
        }
    }
}
