//! Strategy Parameters
//!
//! Instance configuration for the chain-position strategy. Every optional field
//! resolves to a concrete default at deserialisation; `validate()` runs once
//! before an instance is accepted.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::domain::StrategyType;

/// Tagged instance configuration, one variant per strategy type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceConfig {
    ChainPosition(ChainPositionConfig),
}

impl InstanceConfig {
    pub fn strategy_type(&self) -> StrategyType {
        match self {
            InstanceConfig::ChainPosition(_) => StrategyType::ChainPosition,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            InstanceConfig::ChainPosition(c) => c.validate(),
        }
    }

    pub fn as_chain_position(&self) -> Option<&ChainPositionConfig> {
        match self {
            InstanceConfig::ChainPosition(c) => Some(c),
        }
    }
}

/// Chain position: two adjacent bin-range positions managed as one
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainPositionConfig {
    /// DLMM pool address
    pub pool_address: String,
    /// Total amount of the base (Y) asset deployed, split evenly over both halves
    pub position_amount: Decimal,
    /// Width in bins of each half
    pub bin_range: u32,
    /// Seconds between monitoring ticks
    pub monitoring_interval_secs: u64,
    /// Swap slippage for residual liquidation and harvested yield
    pub slippage_bps: u16,
    /// Seconds the active bin may stay out of range before recreating
    pub out_of_range_timeout_secs: u64,
    /// Minimum pending yield (base asset) before harvesting
    pub yield_extraction_threshold: Decimal,
    /// Minimum seconds between extraction attempts
    pub yield_extraction_cooldown_secs: u64,
    /// Above this price recreation is vetoed and the position kept
    pub max_price_for_recreation: Option<f64>,
    /// Below this price the instance exits instead of recreating
    pub min_price_for_recreation: Option<f64>,
    pub enable_smart_stop_loss: bool,
    pub smart_stop_loss: SmartStopLossConfig,
    pub recreation: RecreationConfig,
}

impl Default for ChainPositionConfig {
    fn default() -> Self {
        Self {
            pool_address: String::new(),
            position_amount: dec!(1),
            bin_range: 69,
            monitoring_interval_secs: 30,
            slippage_bps: 100,
            out_of_range_timeout_secs: 300,
            yield_extraction_threshold: dec!(0.1),
            yield_extraction_cooldown_secs: 60,
            max_price_for_recreation: None,
            min_price_for_recreation: None,
            enable_smart_stop_loss: true,
            smart_stop_loss: SmartStopLossConfig::default(),
            recreation: RecreationConfig::default(),
        }
    }
}

impl ChainPositionConfig {
    /// Defaults for the given pool
    pub fn for_pool(pool_address: &str) -> Self {
        Self {
            pool_address: pool_address.to_string(),
            ..Self::default()
        }
    }

    pub fn with_position_amount(mut self, amount: Decimal) -> Self {
        self.position_amount = amount;
        self
    }

    pub fn with_bin_range(mut self, bins: u32) -> Self {
        self.bin_range = bins;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_address.trim().is_empty() {
            return Err(ConfigError::MissingPoolAddress);
        }
        if self.position_amount <= Decimal::ZERO {
            return Err(ConfigError::InvalidPositionAmount(self.position_amount));
        }
        if self.bin_range == 0 || self.bin_range > 70 {
            return Err(ConfigError::InvalidBinRange(self.bin_range));
        }
        if self.monitoring_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval("monitoring_interval_secs"));
        }
        if self.slippage_bps > 5000 {
            return Err(ConfigError::InvalidSlippage(self.slippage_bps));
        }
        if self.yield_extraction_threshold < Decimal::ZERO {
            return Err(ConfigError::InvalidThreshold("yield_extraction_threshold"));
        }
        if let (Some(min), Some(max)) = (self.min_price_for_recreation, self.max_price_for_recreation) {
            if min >= max {
                return Err(ConfigError::InvalidPriceBounds { min, max });
            }
        }
        self.smart_stop_loss.validate()?;
        self.recreation.validate()?;
        Ok(())
    }
}

/// Smart stop-loss settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartStopLossConfig {
    /// Active-bin position (% of range) below which the bin is unsafe
    pub active_bin_safety_threshold: f64,
    /// Minutes a condition must hold before a full exit
    pub observation_period_minutes: u64,
    /// Unrealized loss (%) that counts as a risk condition
    pub loss_threshold_percentage: f64,
}

impl Default for SmartStopLossConfig {
    fn default() -> Self {
        Self {
            active_bin_safety_threshold: 10.0,
            observation_period_minutes: 15,
            loss_threshold_percentage: 5.0,
        }
    }
}

impl SmartStopLossConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.active_bin_safety_threshold) {
            return Err(ConfigError::InvalidPercentage(
                "active_bin_safety_threshold",
                self.active_bin_safety_threshold,
            ));
        }
        if self.observation_period_minutes == 0 {
            return Err(ConfigError::InvalidInterval("observation_period_minutes"));
        }
        if self.loss_threshold_percentage <= 0.0 || self.loss_threshold_percentage > 100.0 {
            return Err(ConfigError::InvalidPercentage(
                "loss_threshold_percentage",
                self.loss_threshold_percentage,
            ));
        }
        Ok(())
    }
}

/// Recreation triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecreationConfig {
    /// Cooldown between recreations for the tiered triggers
    pub min_recreation_interval_secs: u64,
    pub market_opportunity: MarketOpportunityConfig,
    pub loss_recovery: LossRecoveryConfig,
    pub dynamic_profit: DynamicProfitConfig,
    pub dynamic_switch: DynamicSwitchConfig,
}

impl Default for RecreationConfig {
    fn default() -> Self {
        Self {
            min_recreation_interval_secs: 600,
            market_opportunity: MarketOpportunityConfig::default(),
            loss_recovery: LossRecoveryConfig::default(),
            dynamic_profit: DynamicProfitConfig::default(),
            dynamic_switch: DynamicSwitchConfig::default(),
        }
    }
}

impl RecreationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_pct("market_opportunity.position_threshold", self.market_opportunity.position_threshold)?;
        check_pct("loss_recovery.mark_position_threshold", self.loss_recovery.mark_position_threshold)?;
        check_pct(
            "loss_recovery.trigger_position_threshold",
            self.loss_recovery.trigger_position_threshold,
        )?;
        check_pct("dynamic_profit.position_threshold", self.dynamic_profit.position_threshold)?;
        if self.loss_recovery.mark_loss_threshold <= 0.0 {
            return Err(ConfigError::InvalidThreshold("loss_recovery.mark_loss_threshold"));
        }
        if self.loss_recovery.trigger_profit_threshold < 0.0 {
            return Err(ConfigError::InvalidThreshold("loss_recovery.trigger_profit_threshold"));
        }
        self.dynamic_profit.validate()?;
        if self.dynamic_switch.switch_update_interval_secs == 0 {
            return Err(ConfigError::InvalidInterval("dynamic_switch.switch_update_interval_secs"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketOpportunityConfig {
    pub enabled: bool,
    pub position_threshold: f64,
    pub profit_threshold: f64,
}

impl Default for MarketOpportunityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            position_threshold: 70.0,
            profit_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossRecoveryConfig {
    pub enabled: bool,
    pub mark_position_threshold: f64,
    /// Marks when -mark_loss_threshold <= pnl% < 0
    pub mark_loss_threshold: f64,
    pub trigger_position_threshold: f64,
    /// Triggers when 0 <= pnl% <= trigger_profit_threshold
    pub trigger_profit_threshold: f64,
}

impl Default for LossRecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mark_position_threshold: 50.0,
            mark_loss_threshold: 1.5,
            trigger_position_threshold: 70.0,
            trigger_profit_threshold: 0.5,
        }
    }
}

/// One profit tier. Applies while the benchmark is below `benchmark_below`;
/// the last tier has no bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitTier {
    pub benchmark_below: Option<f64>,
    pub required_profit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicProfitConfig {
    pub enabled: bool,
    pub position_threshold: f64,
    pub tiers: Vec<ProfitTier>,
}

impl Default for DynamicProfitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            position_threshold: 70.0,
            tiers: vec![
                ProfitTier { benchmark_below: Some(0.5), required_profit: 0.5 },
                ProfitTier { benchmark_below: Some(1.5), required_profit: 1.0 },
                ProfitTier { benchmark_below: Some(3.0), required_profit: 1.5 },
                ProfitTier { benchmark_below: None, required_profit: 2.0 },
            ],
        }
    }
}

impl DynamicProfitConfig {
    /// Required profit for the given benchmark yield
    pub fn required_profit(&self, benchmark: f64) -> Option<f64> {
        self.tiers
            .iter()
            .find(|t| t.benchmark_below.map_or(true, |bound| benchmark < bound))
            .map(|t| t.required_profit)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.is_empty() {
            return Err(ConfigError::InvalidProfitTiers("at least one tier required"));
        }
        let bounds: Vec<f64> = self.tiers.iter().filter_map(|t| t.benchmark_below).collect();
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::InvalidProfitTiers("tier bounds must increase"));
        }
        if self.tiers.last().and_then(|t| t.benchmark_below).is_some() {
            return Err(ConfigError::InvalidProfitTiers("last tier must be unbounded"));
        }
        Ok(())
    }
}

/// Dynamic recreation switch: when enabled, recreation triggers exit instead
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicSwitchConfig {
    pub enabled: bool,
    /// Compared against the 15-minute benchmark average
    pub benchmark_yield_threshold_5min: f64,
    pub switch_update_interval_secs: u64,
}

impl Default for DynamicSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            benchmark_yield_threshold_5min: 1.0,
            switch_update_interval_secs: 300,
        }
    }
}

fn check_pct(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=100.0).contains(&value) {
        return Err(ConfigError::InvalidPercentage(field, value));
    }
    Ok(())
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("pool_address is required")]
    MissingPoolAddress,
    #[error("Invalid position amount: {0} (must be > 0)")]
    InvalidPositionAmount(Decimal),
    #[error("Invalid bin range: {0} (must be 1-70)")]
    InvalidBinRange(u32),
    #[error("Invalid interval for {0} (must be > 0)")]
    InvalidInterval(&'static str),
    #[error("Invalid slippage: {0} bps (max 5000)")]
    InvalidSlippage(u16),
    #[error("Invalid threshold for {0}")]
    InvalidThreshold(&'static str),
    #[error("Invalid percentage for {0}: {1} (must be 0-100)")]
    InvalidPercentage(&'static str, f64),
    #[error("Invalid price bounds: min {min} must be below max {max}")]
    InvalidPriceBounds { min: f64, max: f64 },
    #[error("Invalid profit tiers: {0}")]
    InvalidProfitTiers(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_needs_pool() {
        let config = ChainPositionConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingPoolAddress)));
        assert!(ChainPositionConfig::for_pool("pool").validate().is_ok());
    }

    #[test]
    fn test_invalid_bin_range() {
        let config = ChainPositionConfig::for_pool("pool").with_bin_range(0);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBinRange(0))));

        let config = ChainPositionConfig::for_pool("pool").with_bin_range(71);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_price_bounds() {
        let mut config = ChainPositionConfig::for_pool("pool");
        config.min_price_for_recreation = Some(200.0);
        config.max_price_for_recreation = Some(100.0);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPriceBounds { .. })));
    }

    #[test]
    fn test_default_profit_tiers() {
        let tiers = DynamicProfitConfig::default();
        assert_eq!(tiers.required_profit(0.2), Some(0.5));
        assert_eq!(tiers.required_profit(0.5), Some(1.0));
        assert_eq!(tiers.required_profit(1.49), Some(1.0));
        assert_eq!(tiers.required_profit(2.0), Some(1.5));
        assert_eq!(tiers.required_profit(3.0), Some(2.0));
        assert_eq!(tiers.required_profit(50.0), Some(2.0));
    }

    #[test]
    fn test_profit_tier_validation() {
        let mut tiers = DynamicProfitConfig::default();
        tiers.tiers.swap(0, 1);
        assert!(tiers.validate().is_err());

        let mut tiers = DynamicProfitConfig::default();
        tiers.tiers.pop();
        assert!(matches!(tiers.validate(), Err(ConfigError::InvalidProfitTiers(_))));
    }

    #[test]
    fn test_tagged_toml_with_defaults() {
        let toml_str = r#"
            type = "chain_position"
            pool_address = "5rCf1DM8LjKTw4YqhnoLcngyZYeNnQqztScTogYHAS6"
            position_amount = "2.5"

            [recreation.market_opportunity]
            profit_threshold = 1.5
        "#;
        let config: InstanceConfig = toml::from_str(toml_str).unwrap();
        let InstanceConfig::ChainPosition(c) = config;
        assert_eq!(c.position_amount, dec!(2.5));
        assert_eq!(c.bin_range, 69);
        assert_eq!(c.recreation.market_opportunity.profit_threshold, 1.5);
        assert_eq!(c.recreation.market_opportunity.position_threshold, 70.0);
        assert_eq!(c.smart_stop_loss.observation_period_minutes, 15);
        assert!(c.validate().is_ok());
    }
}
