//! Dynamic Recreation Switch
//!
//! Periodically compares the benchmark yield to a threshold. While the switch is
//! enabled, recreation triggers exit the instance instead of rebuilding.

use chrono::{DateTime, Duration, Utc};

use crate::domain::MarketSnapshot;
use crate::strategy::DynamicSwitchConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwitchUpdate {
    pub enabled: bool,
    pub benchmark: Option<f64>,
    pub updated_at: DateTime<Utc>,
    pub changed: bool,
}

/// Recompute the switch if its update interval elapsed. Returns `None` when
/// no update is due.
pub fn evaluate_switch(
    config: &DynamicSwitchConfig,
    currently_enabled: bool,
    last_update: Option<DateTime<Utc>>,
    snapshot: &MarketSnapshot,
) -> Option<SwitchUpdate> {
    let now = snapshot.timestamp;

    if !config.enabled {
        return currently_enabled.then_some(SwitchUpdate {
            enabled: false,
            benchmark: None,
            updated_at: now,
            changed: true,
        });
    }

    if let Some(last) = last_update {
        if now - last < Duration::seconds(config.switch_update_interval_secs as i64) {
            return None;
        }
    }

    let benchmark = snapshot.benchmark_yield_rates?.avg_15min;
    let enabled = benchmark < config.benchmark_yield_threshold_5min;
    Some(SwitchUpdate {
        enabled,
        benchmark: Some(benchmark),
        updated_at: now,
        changed: enabled != currently_enabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BenchmarkYieldRates;

    fn snapshot(avg_15min: f64, t: DateTime<Utc>) -> MarketSnapshot {
        MarketSnapshot {
            timestamp: t,
            benchmark_yield_rates: Some(BenchmarkYieldRates {
                avg_15min,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn enabled_config() -> DynamicSwitchConfig {
        DynamicSwitchConfig {
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_low_benchmark_enables_switch() {
        let t = Utc::now();
        let update = evaluate_switch(&enabled_config(), false, None, &snapshot(0.4, t)).unwrap();
        assert!(update.enabled);
        assert!(update.changed);
        assert_eq!(update.benchmark, Some(0.4));
    }

    #[test]
    fn test_update_interval_respected() {
        let t = Utc::now();
        let config = enabled_config();
        assert!(evaluate_switch(&config, true, Some(t), &snapshot(2.0, t + Duration::seconds(299))).is_none());

        let update = evaluate_switch(&config, true, Some(t), &snapshot(2.0, t + Duration::seconds(300))).unwrap();
        assert!(!update.enabled);
        assert!(update.changed);
    }

    #[test]
    fn test_disabled_config_turns_switch_off() {
        let t = Utc::now();
        let config = DynamicSwitchConfig::default();
        assert!(evaluate_switch(&config, false, None, &snapshot(0.1, t)).is_none());
        let update = evaluate_switch(&config, true, None, &snapshot(0.1, t)).unwrap();
        assert!(!update.enabled);
    }

    #[test]
    fn test_no_benchmark_no_update() {
        let snap = MarketSnapshot::default();
        assert!(evaluate_switch(&enabled_config(), false, None, &snap).is_none());
    }
}
