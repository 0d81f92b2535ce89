//! Application Layer
//!
//! Orchestrates the domain and strategy modules over the ports: retries, the
//! per-instance service graph, the tick scheduler, the executor state machine
//! and the manager that persists instance lifecycles.

pub mod executor;
pub mod manager;
pub mod market_cache;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod services;
pub mod yield_extraction;

pub use executor::{ChainPositionExecutor, ExecutorSettings, LifecycleNotice, StrategyExecutor};
pub use manager::StrategyManager;
pub use market_cache::{MarketDataAnalyzer, MarketSnapshotCache, SnapshotContext};
pub use registry::InstanceRegistry;
pub use retry::{RetryError, RetryExecutor, RetryPolicy};
pub use scheduler::{TickHandler, TickScheduler};
pub use services::{
    AnalyticsSummary, FactoryHealth, FactorySettings, InstanceAnalytics, InstanceServiceFactory,
    ServiceContainer,
};
pub use yield_extraction::{
    ExtractionReport, ExtractionSettings, PositionRef, WorkflowPorts, YieldExtractionWorkflow,
};
