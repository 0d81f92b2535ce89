//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use dlmm_keeper::application::{
    ChainPositionExecutor, ExecutorSettings, InstanceServiceFactory, LifecycleNotice, RetryExecutor,
    TickScheduler, WorkflowPorts,
};
use dlmm_keeper::domain::SwapLockRegistry;
use dlmm_keeper::ports::mocks::{
    FakeChain, FakeHarvester, FakeSwap, FakeTransactions, FakeWallet, ManualClock,
    RecordingEventBus,
};
use dlmm_keeper::ports::WalletService;
use dlmm_keeper::strategy::{ChainPositionConfig, InstanceConfig};

pub const ACTIVE_BIN: i32 = 1000;

/// Fakes behind every port, kept so tests can script and inspect them
pub struct Fakes {
    pub chain: Arc<FakeChain>,
    pub harvester: Arc<FakeHarvester>,
    pub swap: Arc<FakeSwap>,
    pub wallet: Arc<FakeWallet>,
    pub events: Arc<RecordingEventBus>,
}

impl Fakes {
    pub fn new(wallet: FakeWallet) -> Self {
        Self {
            chain: Arc::new(FakeChain::new(ACTIVE_BIN)),
            harvester: Arc::new(FakeHarvester::new()),
            swap: Arc::new(FakeSwap::new()),
            wallet: Arc::new(wallet),
            events: Arc::new(RecordingEventBus::new()),
        }
    }

    pub fn owner(&self) -> String {
        self.wallet.public_key().expect("wallet should be unlocked")
    }

    pub fn ports(&self) -> WorkflowPorts {
        WorkflowPorts {
            chain: self.chain.clone(),
            harvester: self.harvester.clone(),
            transactions: Arc::new(FakeTransactions::confirming()),
            swap: self.swap.clone(),
            wallet: self.wallet.clone(),
            events: self.events.clone(),
            swap_locks: Arc::new(SwapLockRegistry::new()),
            retry: Arc::new(RetryExecutor::without_delays()),
        }
    }
}

pub struct ExecutorHarness {
    pub executor: Arc<ChainPositionExecutor>,
    pub factory: Arc<InstanceServiceFactory>,
    pub fakes: Fakes,
    /// Drives snapshot timestamps; only moves when a test advances it
    pub clock: Arc<ManualClock>,
    pub notices: mpsc::UnboundedReceiver<LifecycleNotice>,
}

impl ExecutorHarness {
    pub fn new() -> Self {
        Self::with_wallet(FakeWallet::unlocked())
    }

    pub fn with_wallet(wallet: FakeWallet) -> Self {
        let fakes = Fakes::new(wallet);
        let factory = Arc::new(InstanceServiceFactory::new(fakes.ports()));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let settings = ExecutorSettings {
            clock: clock.clone(),
            ..Default::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = ChainPositionExecutor::with_settings(
            factory.clone(),
            Arc::new(TickScheduler::new()),
            tx,
            settings,
        );
        Self { executor, factory, fakes, clock, notices: rx }
    }

    /// Drain every notice sent so far
    pub fn drain_notices(&mut self) -> Vec<LifecycleNotice> {
        let mut out = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            out.push(notice);
        }
        out
    }
}

/// Ten bins per half, ten units of the base asset in total
pub fn chain_config() -> ChainPositionConfig {
    ChainPositionConfig::for_pool("pool")
        .with_position_amount(dec!(10))
        .with_bin_range(10)
}

pub fn instance_config(config: ChainPositionConfig) -> InstanceConfig {
    InstanceConfig::ChainPosition(config)
}
