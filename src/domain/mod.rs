//! Domain Layer
//!
//! Value types and per-instance state for the liquidity keeper.
//! No I/O happens here.

pub mod decision;
pub mod error;
pub mod instance;
pub mod snapshot;
pub mod state;
pub mod swap_lock;
pub mod yield_ledger;

pub use decision::{
    LossRecoveryUpdate, OutOfRangeDetails, PriceCheckDetails, RecreationDecision, RecreationType,
    StopLossAction, StopLossDecision, Urgency,
};
pub use error::EngineError;
pub use instance::{InstanceStatus, PositionRecord, StrategyInstance, StrategyType};
pub use snapshot::{
    BenchmarkYieldRates, FeeYieldEfficiency, MarketSnapshot, PriceChanges, PricePoint, YieldRates,
};
pub use state::{
    InstanceState, LossRecoveryMark, Phase, PositionRange, RangeDirection, RangeUpdate,
    StoppingReason,
};
pub use swap_lock::{SwapGuard, SwapLockRegistry};
pub use yield_ledger::{AccumulatedYieldManager, LedgerError, YieldExtraction};
