//! Market Snapshot
//!
//! Immutable per-cycle view of the market and the position. Created once per
//! monitoring cycle by the analyzer and shared behind an `Arc` until the next
//! cycle supersedes it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::state::PositionRange;

/// A single observed price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

/// Price change in percent over trailing windows
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceChanges {
    pub last_5m: f64,
    pub last_15m: f64,
    pub last_1h: f64,
}

/// Yield growth as a percentage of position value over trailing windows
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeeYieldEfficiency {
    pub last_5m: f64,
    pub last_15m: f64,
    pub last_1h: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct YieldRates {
    /// (pending + extracted) / initial investment, in percent
    pub total_return_rate: f64,
    pub fee_yield_efficiency: FeeYieldEfficiency,
}

/// Reference yield used by the dynamic-profit tiers and the recreation switch
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkYieldRates {
    pub current_5min: f64,
    pub avg_5min: f64,
    pub avg_15min: f64,
    pub avg_30min: f64,
    pub bin_offset: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub cycle_id: u64,
    /// The "now" every decision made from this snapshot uses
    pub timestamp: DateTime<Utc>,
    pub current_price: f64,
    pub price_history: Vec<PricePoint>,
    pub position_value: Decimal,
    pub pending_yield: Decimal,
    pub extracted_yield: Decimal,
    pub initial_investment: Decimal,
    pub active_bin: i32,
    pub position_lower_bin: i32,
    pub position_upper_bin: i32,
    pub net_pnl: Decimal,
    pub net_pnl_percentage: f64,
    pub holding_duration_secs: i64,
    pub historical_price_changes: PriceChanges,
    pub historical_yield_rates: YieldRates,
    pub benchmark_yield_rates: Option<BenchmarkYieldRates>,
}

impl MarketSnapshot {
    pub fn position_range(&self) -> PositionRange {
        PositionRange::new(self.position_lower_bin, self.position_upper_bin)
    }

    /// 0 at the lower bin, 100 at the upper bin
    pub fn active_bin_position_pct(&self) -> f64 {
        self.position_range().position_pct(self.active_bin)
    }

    pub fn is_in_range(&self) -> bool {
        self.position_range().contains(self.active_bin)
    }

    /// True when the active bin sits strictly above the range midpoint
    pub fn in_upper_half(&self) -> bool {
        self.active_bin > self.position_range().midpoint()
    }
}
