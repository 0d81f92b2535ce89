//! Decisions
//!
//! Ephemeral outputs of the recreation and risk modules. Produced fresh every
//! cycle; the executor acts on them and drops them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{LossRecoveryMark, RangeDirection};

/// How soon the executor should act
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecreationType {
    PriceCheckFailed,
    OutOfRange,
    MarketOpportunity,
    LossRecovery,
    DynamicProfit,
}

impl RecreationType {
    /// Every type except OUT_OF_RANGE leaves a non-base balance to liquidate
    pub fn requires_swap(&self) -> bool {
        !matches!(self, RecreationType::OutOfRange)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutOfRangeDetails {
    pub direction: Option<RangeDirection>,
    pub out_of_range_since: DateTime<Utc>,
    pub elapsed_secs: i64,
    pub time_remaining_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceCheckDetails {
    pub current_price: f64,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

/// State change a recreation decision asks the executor to apply
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LossRecoveryUpdate {
    Mark(LossRecoveryMark),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecreationDecision {
    pub should_recreate: bool,
    pub recreation_type: Option<RecreationType>,
    pub confidence: f64,
    pub urgency: Urgency,
    pub reason: String,
    pub should_keep_position: bool,
    pub should_stop: bool,
    pub out_of_range_details: Option<OutOfRangeDetails>,
    pub price_check_details: Option<PriceCheckDetails>,
    pub loss_recovery_update: Option<LossRecoveryUpdate>,
}

impl RecreationDecision {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            should_recreate: false,
            recreation_type: None,
            confidence: 0.0,
            urgency: Urgency::Low,
            reason: reason.into(),
            should_keep_position: false,
            should_stop: false,
            out_of_range_details: None,
            price_check_details: None,
            loss_recovery_update: None,
        }
    }

    pub fn recreate(
        recreation_type: RecreationType,
        confidence: f64,
        urgency: Urgency,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            should_recreate: true,
            recreation_type: Some(recreation_type),
            confidence,
            urgency,
            ..Self::hold(reason)
        }
    }

    pub fn with_loss_recovery_update(mut self, update: Option<LossRecoveryUpdate>) -> Self {
        self.loss_recovery_update = update;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopLossAction {
    Hold,
    Alert,
    PartialExit,
    FullExit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLossDecision {
    pub action: StopLossAction,
    pub confidence: f64,
    pub risk_score: f64,
    pub urgency: Urgency,
    pub reasoning: Vec<String>,
}

impl StopLossDecision {
    pub fn hold() -> Self {
        Self {
            action: StopLossAction::Hold,
            confidence: 0.0,
            risk_score: 0.0,
            urgency: Urgency::Low,
            reasoning: vec!["No risk condition active".to_string()],
        }
    }
}
