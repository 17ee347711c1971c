use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Calendar keys of an instant in the given timezone: `YYYY-MM-DD`, `YYYY-MM`, `YYYY`.
pub fn calendar_keys(now: DateTime<Utc>, tz: Tz) -> (String, String, String) {
    let local = now.with_timezone(&tz);
    (
        local.format("%Y-%m-%d").to_string(),
        local.format("%Y-%m").to_string(),
        local.format("%Y").to_string(),
    )
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodCounter {
    pub kwh: f64,
    pub last_reset_key: Option<String>,
}

impl PeriodCounter {
    /// Zero the counter if `key` differs from the stored one. Returns true on reset.
    fn roll(&mut self, key: &str) -> bool {
        if self.last_reset_key.as_deref() == Some(key) {
            return false;
        }
        self.kwh = 0.0;
        self.last_reset_key = Some(key.to_string());
        true
    }

    fn add(&mut self, delta_kwh: f64) {
        if delta_kwh.is_finite() && delta_kwh > 0.0 {
            self.kwh += delta_kwh;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetOutcome {
    pub day: bool,
    pub month: bool,
    pub year: bool,
}

impl ResetOutcome {
    pub fn any(&self) -> bool {
        self.day || self.month || self.year
    }
}

/// Day, month and year energy totals for one unit.
///
/// The struct is serializable so whoever owns persistence can snapshot and restore it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnergyAccumulators {
    pub day: PeriodCounter,
    pub month: PeriodCounter,
    pub year: PeriodCounter,
}

impl EnergyAccumulators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset every counter whose calendar key changed since the last check.
    pub fn check_resets(&mut self, now: DateTime<Utc>, tz: Tz) -> ResetOutcome {
        let (day, month, year) = calendar_keys(now, tz);
        ResetOutcome {
            day: self.day.roll(&day),
            month: self.month.roll(&month),
            year: self.year.roll(&year),
        }
    }

    pub fn add(&mut self, delta_kwh: f64) {
        self.day.add(delta_kwh);
        self.month.add(delta_kwh);
        self.year.add(delta_kwh);
    }

    pub fn totals(&self) -> (f64, f64, f64) {
        (self.day.kwh, self.month.kwh, self.year.kwh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    const TZ: Tz = chrono_tz::Europe::Amsterdam;

    #[test]
    fn test_calendar_keys_use_local_time() {
        // 23:30 UTC on Dec 31 is already Jan 1 in Amsterdam
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 23, 30, 0).unwrap();
        let (d, m, y) = calendar_keys(now, TZ);
        assert_eq!(d, "2025-01-01");
        assert_eq!(m, "2025-01");
        assert_eq!(y, "2025");

        let (d, _, _) = calendar_keys(now, chrono_tz::UTC);
        assert_eq!(d, "2024-12-31");
    }

    #[test]
    fn test_first_check_initializes_keys() {
        let mut acc = EnergyAccumulators::new();
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap();
        let outcome = acc.check_resets(now, TZ);
        assert!(outcome.day && outcome.month && outcome.year);
        assert_eq!(acc.day.last_reset_key.as_deref(), Some("2025-03-10"));
        assert!(!acc.check_resets(now, TZ).any());
    }

    #[test]
    fn test_day_boundary_resets_once() {
        let mut acc = EnergyAccumulators::new();
        let start = Utc.with_ymd_and_hms(2025, 3, 10, 22, 0, 0).unwrap();
        acc.check_resets(start, TZ);
        acc.add(4.0);

        let mut resets = 0;
        let mut t = start;
        // every 10 seconds across local midnight (23:00 UTC in March, CET)
        while t < start + Duration::hours(2) {
            if acc.check_resets(t, TZ).day {
                resets += 1;
            }
            acc.add(0.001);
            t += Duration::seconds(10);
        }
        assert_eq!(resets, 1);
        assert!(acc.day.kwh < acc.month.kwh);
        assert_eq!(acc.day.last_reset_key.as_deref(), Some("2025-03-11"));
    }

    #[test]
    fn test_month_and_year_boundaries() {
        let mut acc = EnergyAccumulators::new();
        acc.check_resets(Utc.with_ymd_and_hms(2025, 12, 31, 12, 0, 0).unwrap(), TZ);
        acc.add(10.0);
        let outcome = acc.check_resets(Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(), TZ);
        assert_eq!(
            outcome,
            ResetOutcome {
                day: true,
                month: true,
                year: true
            }
        );
        assert_eq!(acc.totals(), (0.0, 0.0, 0.0));
    }

    #[test]
    fn test_add_ignores_negative_and_nan() {
        let mut acc = EnergyAccumulators::new();
        acc.add(1.5);
        acc.add(-2.0);
        acc.add(f64::NAN);
        assert_eq!(acc.totals(), (1.5, 1.5, 1.5));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut acc = EnergyAccumulators::new();
        acc.check_resets(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(), TZ);
        acc.add(2.25);
        let json = serde_json::to_string(&acc).unwrap();
        let restored: EnergyAccumulators = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, acc);
    }
}
