//! Smart Stop-Loss
//!
//! Risk decision module with a per-instance observation window. A risk
//! condition (unsafe active bin, or unrealized loss) must hold continuously for
//! the full window before a full exit; transient breaches only raise alerts.
//! Decisions depend only on the snapshot sequence, never on the wall clock.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::domain::{MarketSnapshot, StopLossAction, StopLossDecision, Urgency};
use crate::strategy::SmartStopLossConfig;

/// Maximum contribution of each component to the risk score
const COMPONENT_MAX: f64 = 50.0;

/// Cap on the 1h price drop bonus
const DROP_BONUS_MAX: f64 = 10.0;

/// Observation window for one instance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservationState {
    /// Start of the continuous period with at least one active condition
    pub observing_since: DateTime<Utc>,
    pub bin_safety_active: bool,
    pub loss_active: bool,
}

#[derive(Debug, Default)]
pub struct RiskDecisionModule {
    observations: Mutex<HashMap<String, ObservationState>>,
}

impl RiskDecisionModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(
        &self,
        snapshot: &MarketSnapshot,
        instance_id: &str,
        config: &SmartStopLossConfig,
    ) -> StopLossDecision {
        let now = snapshot.timestamp;
        let position_pct = snapshot.active_bin_position_pct();
        let pnl_pct = snapshot.net_pnl_percentage;

        let bin_unsafe = position_pct < config.active_bin_safety_threshold;
        let losing = pnl_pct <= -config.loss_threshold_percentage;

        let mut observations = self.observations.lock().unwrap_or_else(|e| e.into_inner());

        if !bin_unsafe && !losing {
            if observations.remove(instance_id).is_some() {
                info!(instance_id, "Risk conditions cleared, observation window reset");
            }
            return StopLossDecision::hold();
        }

        let state = observations
            .entry(instance_id.to_string())
            .or_insert(ObservationState {
                observing_since: now,
                bin_safety_active: bin_unsafe,
                loss_active: losing,
            });
        state.bin_safety_active = bin_unsafe;
        state.loss_active = losing;
        let observing_since = state.observing_since;
        drop(observations);

        let window = Duration::minutes(config.observation_period_minutes as i64);
        let elapsed = (now - observing_since).max(Duration::zero());
        let confidence = (elapsed.num_milliseconds() as f64 / window.num_milliseconds() as f64)
            .clamp(0.0, 1.0);
        let risk_score = risk_score(snapshot, position_pct, pnl_pct, config);

        let mut reasoning = Vec::new();
        if bin_unsafe {
            reasoning.push(format!(
                "Active bin at {:.1}% of range, below safety threshold {:.1}%",
                position_pct, config.active_bin_safety_threshold
            ));
        }
        if losing {
            reasoning.push(format!(
                "Unrealized loss {:.2}% breaches -{:.2}%",
                pnl_pct, config.loss_threshold_percentage
            ));
        }
        reasoning.push(format!(
            "Observed for {}s of {}s window",
            elapsed.num_seconds(),
            window.num_seconds()
        ));

        let action = if elapsed >= window {
            StopLossAction::FullExit
        } else if bin_unsafe && losing && elapsed * 2 >= window {
            StopLossAction::PartialExit
        } else {
            StopLossAction::Alert
        };

        let urgency = match action {
            StopLossAction::FullExit => Urgency::Critical,
            StopLossAction::PartialExit => Urgency::High,
            StopLossAction::Alert => Urgency::Medium,
            StopLossAction::Hold => Urgency::Low,
        };

        match action {
            StopLossAction::FullExit => warn!(
                instance_id,
                risk_score = format!("{:.1}", risk_score),
                "Risk condition held for full observation window"
            ),
            _ => debug!(
                instance_id,
                action = ?action,
                risk_score = format!("{:.1}", risk_score),
                "Risk condition under observation"
            ),
        }

        StopLossDecision {
            action,
            confidence,
            risk_score,
            urgency,
            reasoning,
        }
    }

    /// Forget the observation window for an instance (stop, recreation).
    pub fn reset(&self, instance_id: &str) {
        self.observations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_id);
    }

    pub fn observation(&self, instance_id: &str) -> Option<ObservationState> {
        self.observations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(instance_id)
            .copied()
    }
}

fn risk_score(
    snapshot: &MarketSnapshot,
    position_pct: f64,
    pnl_pct: f64,
    config: &SmartStopLossConfig,
) -> f64 {
    let bin_component = if config.active_bin_safety_threshold > 0.0 {
        let depth = (config.active_bin_safety_threshold - position_pct)
            / config.active_bin_safety_threshold;
        (depth * COMPONENT_MAX).clamp(0.0, COMPONENT_MAX)
    } else {
        0.0
    };

    let loss_component = if pnl_pct < 0.0 {
        (-pnl_pct / (2.0 * config.loss_threshold_percentage) * COMPONENT_MAX)
            .clamp(0.0, COMPONENT_MAX)
    } else {
        0.0
    };

    let drop_1h = snapshot.historical_price_changes.last_1h;
    let drop_bonus = if drop_1h < 0.0 {
        (-drop_1h * 2.0).min(DROP_BONUS_MAX)
    } else {
        0.0
    };

    (bin_component + loss_component + drop_bonus).min(100.0)
}
