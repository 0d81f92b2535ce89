//! Strategy Layer - Chain Position Decisions
//!
//! Instance configuration and the pure decision logic the executor consults
//! every monitoring cycle:
//! - `RecreationDecisionModule`: price veto, out-of-range timeout and tiered
//!   profit triggers
//! - `RiskDecisionModule`: smart stop-loss with a per-instance observation window
//! - `evaluate_switch`: benchmark-driven dynamic recreation switch

pub mod dynamic_switch;
pub mod params;
pub mod recreation;
pub mod risk;

pub use dynamic_switch::{evaluate_switch, SwitchUpdate};
pub use params::{
    ChainPositionConfig, ConfigError, DynamicProfitConfig, DynamicSwitchConfig, InstanceConfig,
    LossRecoveryConfig, MarketOpportunityConfig, ProfitTier, RecreationConfig, SmartStopLossConfig,
};
pub use recreation::{RecreationDecisionModule, RecreationInput};
pub use risk::{ObservationState, RiskDecisionModule};
