//! Instance State
//!
//! Mutable per-instance execution state owned by an executor. Exactly one
//! `InstanceState` exists per instance id; it lives in the `InstanceRegistry`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::strategy::ChainPositionConfig;

/// Execution phase of a running instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Created,
    Creating,
    Monitoring,
    Analyzing,
    Stopping,
    Stopped,
    Error,
    Cleaning,
}

impl Phase {
    /// Phases from which `execute` may start position creation
    pub fn can_create(&self) -> bool {
        matches!(self, Phase::Created | Phase::Stopped)
    }

    /// Phases where chain operations are in flight and a new action must wait
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Phase::Creating | Phase::Analyzing | Phase::Stopping | Phase::Cleaning
        )
    }
}

/// Why an instance entered STOPPING
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoppingReason {
    StopLoss,
    PositionRecreation,
    ManualStop,
    UserStop,
}

/// Side of the range the active bin left through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeDirection {
    Above,
    Below,
}

/// Inclusive bin range covered by a chain position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRange {
    pub lower_bin: i32,
    pub upper_bin: i32,
}

impl PositionRange {
    pub fn new(lower_bin: i32, upper_bin: i32) -> Self {
        Self {
            lower_bin: lower_bin.min(upper_bin),
            upper_bin: lower_bin.max(upper_bin),
        }
    }

    pub fn contains(&self, bin: i32) -> bool {
        bin >= self.lower_bin && bin <= self.upper_bin
    }

    /// floor((lower + upper) / 2), correct for negative bins
    pub fn midpoint(&self) -> i32 {
        (self.lower_bin + self.upper_bin).div_euclid(2)
    }

    pub fn width(&self) -> i32 {
        self.upper_bin - self.lower_bin + 1
    }

    /// Location of `bin` inside the range: 0 at the lower bin, 100 at the upper bin.
    /// Values outside 0..=100 mean the bin is out of range.
    pub fn position_pct(&self, bin: i32) -> f64 {
        let span = (self.upper_bin - self.lower_bin) as f64;
        if span <= 0.0 {
            return if bin >= self.upper_bin { 100.0 } else { 0.0 };
        }
        (bin - self.lower_bin) as f64 / span * 100.0
    }

    pub fn direction_of(&self, bin: i32) -> Option<RangeDirection> {
        if bin > self.upper_bin {
            Some(RangeDirection::Above)
        } else if bin < self.lower_bin {
            Some(RangeDirection::Below)
        } else {
            None
        }
    }
}

/// First phase of the loss-recovery trigger
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossRecoveryMark {
    pub marked_at: DateTime<Utc>,
    pub position_pct: f64,
    pub pnl_pct: f64,
}

/// Result of refreshing the active bin against the position range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeUpdate {
    pub is_in_range: bool,
    pub out_of_range_since: Option<DateTime<Utc>>,
    pub direction: Option<RangeDirection>,
    /// True when this refresh moved the bin back inside the range
    pub reentered: bool,
}

/// Per-instance execution state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance_id: String,
    pub config: ChainPositionConfig,
    pub phase: Phase,
    pub has_been_created: bool,
    pub pool_address: String,
    pub position_addresses: Vec<String>,
    pub position_range: Option<PositionRange>,
    pub current_active_bin: Option<i32>,
    pub is_in_range: bool,
    pub stopping_reason: Option<StoppingReason>,
    pub cleanup_retry_count: u32,
    pub cleanup_targets: Vec<String>,
    pub dynamic_recreation_switch_enabled: bool,
    pub last_benchmark_yield: Option<f64>,
    pub last_switch_update_time: Option<DateTime<Utc>>,
    pub initial_investment: Decimal,
    pub created_at: DateTime<Utc>,
    pub out_of_range_since: Option<DateTime<Utc>>,
    pub out_of_range_direction: Option<RangeDirection>,
    pub last_recreation_time: Option<DateTime<Utc>>,
    pub recreation_count: u32,
    pub loss_recovery_mark: Option<LossRecoveryMark>,
    pub cycle_id: u64,
    pub creation_attempts: u32,
    /// Exits in a row that closed nothing
    pub exit_attempts: u32,
    pub error: Option<String>,
}

impl InstanceState {
    pub fn new(instance_id: &str, config: ChainPositionConfig, now: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            pool_address: config.pool_address.clone(),
            initial_investment: config.position_amount,
            config,
            phase: Phase::Created,
            has_been_created: false,
            position_addresses: Vec::new(),
            position_range: None,
            current_active_bin: None,
            is_in_range: false,
            stopping_reason: None,
            cleanup_retry_count: 0,
            cleanup_targets: Vec::new(),
            dynamic_recreation_switch_enabled: false,
            last_benchmark_yield: None,
            last_switch_update_time: None,
            created_at: now,
            out_of_range_since: None,
            out_of_range_direction: None,
            last_recreation_time: None,
            recreation_count: 0,
            loss_recovery_mark: None,
            cycle_id: 0,
            creation_attempts: 0,
            exit_attempts: 0,
            error: None,
        }
    }

    /// Record a freshly created chain position.
    pub fn record_positions(&mut self, addresses: Vec<String>, range: PositionRange) {
        self.position_addresses = addresses;
        self.position_range = Some(range);
        self.has_been_created = true;
        self.is_in_range = true;
        self.out_of_range_since = None;
        self.out_of_range_direction = None;
        self.cleanup_targets.clear();
        self.cleanup_retry_count = 0;
    }

    /// Clear position fields before a recreation.
    pub fn reset_positions(&mut self) {
        self.position_addresses.clear();
        self.position_range = None;
        self.current_active_bin = None;
        self.is_in_range = false;
        self.out_of_range_since = None;
        self.out_of_range_direction = None;
        self.loss_recovery_mark = None;
    }

    /// Refresh the active bin and the out-of-range tracker.
    ///
    /// Re-entering the range clears the timer, so a later exit counts from zero.
    pub fn update_active_bin(&mut self, bin: i32, now: DateTime<Utc>) -> RangeUpdate {
        self.current_active_bin = Some(bin);
        let was_out = self.out_of_range_since.is_some();

        let direction = self.position_range.and_then(|r| r.direction_of(bin));
        match direction {
            None => {
                self.is_in_range = self.position_range.is_some();
                self.out_of_range_since = None;
                self.out_of_range_direction = None;
            }
            Some(dir) => {
                self.is_in_range = false;
                if self.out_of_range_since.is_none() {
                    self.out_of_range_since = Some(now);
                }
                self.out_of_range_direction = Some(dir);
            }
        }

        RangeUpdate {
            is_in_range: self.is_in_range,
            out_of_range_since: self.out_of_range_since,
            direction: self.out_of_range_direction,
            reentered: was_out && self.is_in_range,
        }
    }

    /// Enter ERROR with a stored message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.phase = Phase::Error;
        self.error = Some(message.into());
    }

    pub fn next_cycle(&mut self) -> u64 {
        self.cycle_id += 1;
        self.cycle_id
    }
}
