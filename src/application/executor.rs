//! Chain Position Executor
//!
//! Drives one state machine per instance:
//!
//! ```text
//! CREATED/STOPPED --execute--> CREATING --ok--> MONITORING <--tick--> ANALYZING
//! CREATING --partial--> CLEANING --closed--> CREATING
//! CLEANING --3 failures--> ERROR
//! MONITORING --exit/recreate--> STOPPING --> STOPPED | CREATING | ERROR
//! STOPPING --nothing closed--> MONITORING (exit retried next tick)
//! ```
//!
//! Every mutation after an await re-checks the phase, so a result arriving
//! after a stop or pause is dropped instead of applied.

use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::application::market_cache::SnapshotContext;
use crate::application::registry::InstanceRegistry;
use crate::application::retry::{RetryError, CHAIN_READ, CLEANUP, SWAP, TRANSACTION_SUBMIT};
use crate::application::scheduler::{TickHandler, TickScheduler};
use crate::application::services::{InstanceServiceFactory, ServiceContainer};
use crate::application::yield_extraction::{ExtractionSettings, PositionRef, WorkflowPorts};
use crate::domain::{
    EngineError, InstanceState, LossRecoveryUpdate, Phase, PositionRange, PositionRecord,
    RecreationDecision, RecreationType, StopLossAction, StoppingReason, StrategyType,
};
use crate::ports::{topics, ChainError, Clock, CreatePositionRequest, SwapParams, SystemClock};
use crate::strategy::{
    evaluate_switch, ChainPositionConfig, InstanceConfig, RecreationDecisionModule,
    RecreationInput, RiskDecisionModule,
};

/// State changes the manager must persist
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleNotice {
    Stopped {
        instance_id: String,
        reason: StoppingReason,
    },
    Errored {
        instance_id: String,
        message: String,
    },
    Recreated {
        instance_id: String,
        recreation_type: RecreationType,
    },
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Create rounds per `execute` or recreation
    pub max_creation_attempts: u32,
    /// Close rounds before a partial creation is declared unrecoverable
    pub max_cleanup_attempts: u32,
    /// Exits in a row that close nothing before the instance enters ERROR
    pub max_exit_attempts: u32,
    pub clock: Arc<dyn Clock>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_creation_attempts: 3,
            max_cleanup_attempts: 3,
            max_exit_attempts: 3,
            clock: Arc::new(SystemClock),
        }
    }
}

#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    fn strategy_type(&self) -> StrategyType;

    /// Register execution state for an instance. Existing state is kept.
    async fn initialize(&self, instance_id: &str, config: &InstanceConfig) -> Result<(), EngineError>;

    /// Create positions and start monitoring. Once positions exist this only
    /// (re)starts monitoring.
    async fn execute(&self, instance_id: &str) -> Result<(), EngineError>;

    /// Stop monitoring and keep positions open.
    async fn pause(&self, instance_id: &str) -> Result<(), EngineError>;

    /// Close positions and stop.
    async fn stop(&self, instance_id: &str, reason: StoppingReason) -> Result<(), EngineError>;

    /// Drop all state and per-instance services.
    async fn remove(&self, instance_id: &str) -> Result<(), EngineError>;

    /// Take over a chain position opened before a restart. Addresses no
    /// longer on chain are dropped; with none left this does nothing and the
    /// next `execute` creates a fresh position.
    async fn adopt_positions(&self, instance_id: &str, record: &PositionRecord) -> Result<(), EngineError>;

    /// True while the instance owns positions on chain
    fn holds_positions(&self, instance_id: &str) -> bool;

    fn state_snapshot(&self, instance_id: &str) -> Option<InstanceState>;

    fn running_instances(&self) -> Vec<String>;
}

/// Outcome of closing a set of positions
#[derive(Debug, Default)]
struct CloseOutcome {
    closed: Vec<String>,
    unclosed: Vec<String>,
}

pub struct ChainPositionExecutor {
    this: Weak<ChainPositionExecutor>,
    registry: InstanceRegistry,
    scheduler: Arc<TickScheduler>,
    factory: Arc<InstanceServiceFactory>,
    recreation: RecreationDecisionModule,
    risk: RiskDecisionModule,
    notices: mpsc::UnboundedSender<LifecycleNotice>,
    settings: ExecutorSettings,
}

impl ChainPositionExecutor {
    pub fn new(
        factory: Arc<InstanceServiceFactory>,
        scheduler: Arc<TickScheduler>,
        notices: mpsc::UnboundedSender<LifecycleNotice>,
    ) -> Arc<Self> {
        Self::with_settings(factory, scheduler, notices, ExecutorSettings::default())
    }

    pub fn with_settings(
        factory: Arc<InstanceServiceFactory>,
        scheduler: Arc<TickScheduler>,
        notices: mpsc::UnboundedSender<LifecycleNotice>,
        settings: ExecutorSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry: InstanceRegistry::new(),
            scheduler,
            factory,
            recreation: RecreationDecisionModule::new(),
            risk: RiskDecisionModule::new(),
            notices,
            settings,
        })
    }

    fn ports(&self) -> &WorkflowPorts {
        self.factory.ports()
    }

    pub fn scheduler(&self) -> &Arc<TickScheduler> {
        &self.scheduler
    }

    /// Apply `f` only if the instance is still in `expected`.
    fn expect_phase<R>(
        &self,
        instance_id: &str,
        expected: Phase,
        f: impl FnOnce(&mut InstanceState) -> R,
    ) -> Result<R, EngineError> {
        self.registry
            .with(instance_id, |s| {
                if s.phase != expected {
                    return Err(EngineError::PhaseChanged {
                        instance_id: instance_id.to_string(),
                        expected,
                        actual: s.phase,
                    });
                }
                Ok(f(s))
            })
            .unwrap_or_else(|| Err(EngineError::InstanceNotFound(instance_id.to_string())))
    }

    fn config_of(&self, instance_id: &str) -> Result<ChainPositionConfig, EngineError> {
        self.registry
            .with(instance_id, |s| s.config.clone())
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))
    }

    fn notify(&self, notice: LifecycleNotice) {
        if self.notices.send(notice).is_err() {
            debug!("Lifecycle notice dropped, no listener");
        }
    }

    /// Terminal failure: ERROR with a stored message, monitoring stopped.
    fn fail_instance(&self, instance_id: &str, message: String) {
        self.scheduler.cancel(instance_id);
        self.registry.with(instance_id, |s| s.fail(message.clone()));
        error!(instance_id, error = %message, "Instance entered ERROR");
        self.ports().events.publish(
            topics::INSTANCE_ERROR,
            json!({ "instance_id": instance_id, "error": message }),
        );
        self.notify(LifecycleNotice::Errored {
            instance_id: instance_id.to_string(),
            message,
        });
    }

    /// Point the instance's yield workflow at its current positions.
    fn configure_extraction(&self, instance_id: &str, container: &ServiceContainer) {
        let Some((config, addresses)) = self
            .registry
            .with(instance_id, |s| (s.config.clone(), s.position_addresses.clone()))
        else {
            return;
        };
        let targets = addresses
            .into_iter()
            .map(|address| PositionRef {
                address,
                pool_address: config.pool_address.clone(),
            })
            .collect();
        container.yield_operator.configure(
            ExtractionSettings {
                cooldown: Duration::seconds(config.yield_extraction_cooldown_secs as i64),
                slippage_bps: config.slippage_bps,
            },
            targets,
        );
    }

    fn start_monitoring(&self, instance_id: &str, interval_secs: u64) {
        let Some(this) = self.this.upgrade() else {
            warn!(instance_id, "Executor dropped, cannot start monitoring");
            return;
        };
        self.scheduler
            .start(instance_id, StdDuration::from_secs(interval_secs), this);
    }

    // ---- creation ----------------------------------------------------------

    /// Create both halves of the chain position. Expects phase CREATING.
    async fn create_chain_position(&self, instance_id: &str) -> Result<(), EngineError> {
        let config = self.config_of(instance_id)?;
        let w = config.bin_range as i32;
        let half = config.position_amount / Decimal::TWO;

        loop {
            let attempt = self.expect_phase(instance_id, Phase::Creating, |s| {
                s.creation_attempts += 1;
                s.creation_attempts
            })?;
            if attempt > self.settings.max_creation_attempts {
                let message = format!(
                    "Position creation failed after {} attempts",
                    self.settings.max_creation_attempts
                );
                self.fail_instance(instance_id, message.clone());
                return Err(EngineError::CreationFailed(message));
            }

            let Some(owner) = self.ports().wallet.public_key() else {
                self.fail_instance(instance_id, "Wallet is locked".to_string());
                return Err(EngineError::WalletLocked);
            };

            let pool = config.pool_address.as_str();
            let active_bin = match self
                .ports()
                .retry
                .run(CHAIN_READ, || self.ports().chain.get_active_bin(pool))
                .await
            {
                Ok(bin) => bin,
                Err(e) => {
                    let message = format!("Active bin unavailable during creation: {}", e);
                    self.fail_instance(instance_id, message.clone());
                    return Err(EngineError::CreationFailed(message));
                }
            };

            let upper = PositionRange::new(active_bin - w + 1, active_bin);
            let lower = PositionRange::new(active_bin - 2 * w + 1, active_bin - w);
            info!(
                instance_id,
                attempt,
                active_bin,
                lower_bin = lower.lower_bin,
                upper_bin = upper.upper_bin,
                "Creating chain position"
            );

            let first = self.create_one(pool, &owner, upper, half).await;
            let second = self.create_one(pool, &owner, lower, half).await;

            let created: Vec<String> = [first.as_ref().ok(), second.as_ref().ok()]
                .into_iter()
                .flatten()
                .cloned()
                .collect();

            let phase_now = self.registry.with(instance_id, |s| s.phase);
            if phase_now != Some(Phase::Creating) {
                if !created.is_empty() {
                    warn!(instance_id, positions = ?created, "Instance left CREATING, closing late positions");
                    self.close_positions(instance_id, &created).await;
                }
                return Err(EngineError::PhaseChanged {
                    instance_id: instance_id.to_string(),
                    expected: Phase::Creating,
                    actual: phase_now.unwrap_or(Phase::Stopped),
                });
            }

            match (first, second) {
                (Ok(a), Ok(b)) => {
                    let range = PositionRange::new(lower.lower_bin, upper.upper_bin);
                    self.expect_phase(instance_id, Phase::Creating, |s| {
                        s.record_positions(vec![a.clone(), b.clone()], range);
                        s.current_active_bin = Some(active_bin);
                        s.creation_attempts = 0;
                        s.stopping_reason = None;
                        s.error = None;
                        s.phase = Phase::Monitoring;
                    })?;

                    let container = self.factory.get_or_create(instance_id);
                    self.configure_extraction(instance_id, &container);
                    container.cache.invalidate().await;

                    info!(
                        instance_id,
                        positions = ?[&a, &b],
                        lower_bin = range.lower_bin,
                        upper_bin = range.upper_bin,
                        "Chain position created"
                    );
                    self.ports().events.publish(
                        topics::POSITION_CREATED,
                        json!({
                            "instance_id": instance_id,
                            "positions": [a, b],
                            "lower_bin": range.lower_bin,
                            "upper_bin": range.upper_bin,
                        }),
                    );
                    return Ok(());
                }
                (Ok(survivor), Err(e)) | (Err(e), Ok(survivor)) => {
                    warn!(
                        instance_id,
                        survivor = %survivor,
                        error = %e,
                        "Partial chain position creation, cleaning up"
                    );
                    self.expect_phase(instance_id, Phase::Creating, |s| {
                        s.phase = Phase::Cleaning;
                        s.cleanup_targets = vec![survivor.clone()];
                        s.cleanup_retry_count = 0;
                    })?;
                    self.run_cleanup(instance_id).await?;
                }
                (Err(e1), Err(e2)) => {
                    let message = format!("Both position creations failed: {}; {}", e1, e2);
                    self.fail_instance(instance_id, message.clone());
                    return Err(EngineError::CreationFailed(message));
                }
            }
        }
    }

    async fn create_one(
        &self,
        pool: &str,
        owner: &str,
        range: PositionRange,
        amount_y: Decimal,
    ) -> Result<String, String> {
        let request = CreatePositionRequest {
            pool_address: pool.to_string(),
            owner: owner.to_string(),
            lower_bin: range.lower_bin,
            upper_bin: range.upper_bin,
            amount_y,
        };
        let chain = &self.ports().chain;
        match self
            .ports()
            .retry
            .run(TRANSACTION_SUBMIT, || chain.create_position(request.clone()))
            .await
        {
            Ok(result) if result.success => result
                .address
                .ok_or_else(|| "create succeeded without an address".to_string()),
            Ok(result) => Err(result.error.unwrap_or_else(|| "create failed".to_string())),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Close `cleanup_targets` up to the attempt limit. Success moves the
    /// instance to CREATING; exhaustion is terminal.
    async fn run_cleanup(&self, instance_id: &str) -> Result<(), EngineError> {
        let policy = self.ports().retry.policy(CLEANUP);
        let max = self.settings.max_cleanup_attempts;

        for attempt in 1..=max {
            let targets = self.expect_phase(instance_id, Phase::Cleaning, |s| {
                s.cleanup_retry_count = attempt;
                s.cleanup_targets.clone()
            })?;

            let outcome = self.close_positions(instance_id, &targets).await;
            let remaining = outcome.unclosed;
            let done = remaining.is_empty();
            self.expect_phase(instance_id, Phase::Cleaning, |s| {
                s.cleanup_targets = remaining.clone();
                if done {
                    s.cleanup_retry_count = 0;
                    s.phase = Phase::Creating;
                }
            })?;

            if done {
                info!(instance_id, attempt, "Cleanup complete, retrying creation");
                return Ok(());
            }

            warn!(
                instance_id,
                attempt,
                max_attempts = max,
                remaining = ?remaining,
                "Cleanup attempt failed"
            );
            if attempt < max {
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }

        let remaining = self
            .registry
            .with(instance_id, |s| s.cleanup_targets.clone())
            .unwrap_or_default();
        self.fail_instance(
            instance_id,
            format!(
                "Cleanup failed after {} attempts; manual intervention required for {:?}",
                max, remaining
            ),
        );
        Err(EngineError::CleanupExhausted {
            instance_id: instance_id.to_string(),
            attempts: max,
        })
    }

    /// Close positions in parallel. Individual failures are collected, not raised.
    async fn close_positions(&self, instance_id: &str, addresses: &[String]) -> CloseOutcome {
        let chain = &self.ports().chain;
        let retry = &self.ports().retry;
        let results = join_all(addresses.iter().map(|address| async move {
            let result = retry
                .run(TRANSACTION_SUBMIT, || chain.close_position(address))
                .await;
            (address.clone(), result)
        }))
        .await;

        let mut outcome = CloseOutcome::default();
        for (address, result) in results {
            match result {
                Ok(r) if r.success => {
                    debug!(instance_id, position = %address, signature = ?r.signature, "Position closed");
                    outcome.closed.push(address);
                }
                Ok(r) => {
                    warn!(instance_id, position = %address, error = ?r.error, "Close rejected");
                    outcome.unclosed.push(address);
                }
                Err(e) => {
                    warn!(instance_id, position = %address, error = %e, "Close failed");
                    outcome.unclosed.push(address);
                }
            }
        }
        outcome
    }

    /// Swap the owner's token X balance back to the base asset under the
    /// instance's swap lock.
    async fn liquidate_residual(&self, instance_id: &str, config: &ChainPositionConfig) -> Result<bool, EngineError> {
        let p = self.ports();
        let owner = p.wallet.public_key().ok_or(EngineError::WalletLocked)?;
        let pool_address = config.pool_address.as_str();
        let pool = p
            .retry
            .run(CHAIN_READ, || p.chain.get_pool_info(pool_address))
            .await?;
        if pool.token_x == pool.token_y {
            return Ok(false);
        }
        let balance = p
            .retry
            .run(CHAIN_READ, || p.chain.get_token_balance(&owner, &pool.token_x))
            .await?;
        if balance == 0 {
            debug!(instance_id, "No residual balance to liquidate");
            return Ok(false);
        }

        let _guard = p.swap_locks.try_acquire(instance_id)?;
        let params = SwapParams {
            input_mint: pool.token_x.clone(),
            output_mint: pool.token_y.clone(),
            amount: balance,
            slippage_bps: config.slippage_bps,
            user_public_key: owner.clone(),
        };
        let outcome = p
            .retry
            .run(SWAP, || p.swap.execute_swap(params.clone()))
            .await?;
        info!(
            instance_id,
            input = balance,
            output = outcome.output_amount,
            signature = %outcome.signature,
            "Residual balance liquidated"
        );
        Ok(true)
    }

    // ---- exits -------------------------------------------------------------

    /// Close everything, liquidate, and stop. Used by stop-loss, the price
    /// floor and the dynamic switch.
    async fn full_exit(
        &self,
        instance_id: &str,
        from: Phase,
        reason: StoppingReason,
        why: &str,
    ) -> Result<(), EngineError> {
        let (addresses, config) = self.expect_phase(instance_id, from, |s| {
            s.phase = Phase::Stopping;
            s.stopping_reason = Some(reason);
            (s.position_addresses.clone(), s.config.clone())
        })?;
        self.scheduler.cancel(instance_id);
        warn!(instance_id, reason = ?reason, why, positions = addresses.len(), "Exiting chain position");

        let outcome = self.close_positions(instance_id, &addresses).await;
        if !addresses.is_empty() && outcome.closed.is_empty() {
            let max = self.settings.max_exit_attempts;
            let attempts = self.expect_phase(instance_id, Phase::Stopping, |s| {
                s.exit_attempts += 1;
                s.exit_attempts
            })?;
            if attempts >= max {
                let message = format!(
                    "Exit ({:?}) failed: no position could be closed in {} attempts",
                    reason, attempts
                );
                self.fail_instance(instance_id, message.clone());
                return Err(EngineError::ExitFailed {
                    instance_id: instance_id.to_string(),
                    reason: message,
                });
            }

            warn!(instance_id, attempts, max_attempts = max, "No position closed, exit retried next tick");
            self.expect_phase(instance_id, Phase::Stopping, |s| {
                s.phase = Phase::Monitoring;
                s.stopping_reason = None;
            })?;
            self.start_monitoring(instance_id, config.monitoring_interval_secs);
            return Ok(());
        }
        if !outcome.unclosed.is_empty() {
            warn!(instance_id, unclosed = ?outcome.unclosed, "Partial exit, continuing");
        }

        if let Err(e) = self.liquidate_residual(instance_id, &config).await {
            warn!(instance_id, error = %e, "Residual liquidation failed");
        }

        self.expect_phase(instance_id, Phase::Stopping, |s| {
            s.reset_positions();
            s.has_been_created = false;
            s.exit_attempts = 0;
            s.cleanup_targets = outcome.unclosed.clone();
            s.phase = Phase::Stopped;
        })?;
        self.release_instance_services(instance_id).await;

        info!(instance_id, reason = ?reason, "Instance stopped");
        self.ports().events.publish(
            topics::INSTANCE_STOPPED,
            json!({ "instance_id": instance_id, "reason": reason, "detail": why }),
        );
        self.notify(LifecycleNotice::Stopped {
            instance_id: instance_id.to_string(),
            reason,
        });
        Ok(())
    }

    async fn release_instance_services(&self, instance_id: &str) {
        self.risk.reset(instance_id);
        if let Some(container) = self.factory.get(instance_id) {
            container.yield_operator.clear_targets();
            container.cache.invalidate().await;
        }
    }

    /// Close, optionally liquidate, and rebuild around the current price.
    async fn recreate(
        &self,
        instance_id: &str,
        decision: &RecreationDecision,
        now: DateTime<Utc>,
        container: &ServiceContainer,
    ) -> Result<(), EngineError> {
        let recreation_type = decision.recreation_type.unwrap_or(RecreationType::OutOfRange);
        let (addresses, config) = self.expect_phase(instance_id, Phase::Analyzing, |s| {
            s.phase = Phase::Stopping;
            s.stopping_reason = Some(StoppingReason::PositionRecreation);
            (s.position_addresses.clone(), s.config.clone())
        })?;
        info!(
            instance_id,
            recreation_type = ?recreation_type,
            reason = %decision.reason,
            "Recreating chain position"
        );

        let outcome = self.close_positions(instance_id, &addresses).await;
        if !addresses.is_empty() && outcome.closed.is_empty() {
            warn!(instance_id, "No position closed, recreation retried next tick");
            self.expect_phase(instance_id, Phase::Stopping, |s| {
                s.phase = Phase::Monitoring;
                s.stopping_reason = None;
            })?;
            return Ok(());
        }

        if !outcome.unclosed.is_empty() {
            self.expect_phase(instance_id, Phase::Stopping, |s| {
                s.phase = Phase::Cleaning;
                s.cleanup_targets = outcome.unclosed.clone();
                s.cleanup_retry_count = 0;
            })?;
            self.run_cleanup(instance_id).await?;
        }

        if recreation_type.requires_swap() {
            if let Err(e) = self.liquidate_residual(instance_id, &config).await {
                warn!(instance_id, error = %e, "Residual liquidation failed, recreating anyway");
            }
        }

        let from = self
            .registry
            .with(instance_id, |s| s.phase)
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        if from != Phase::Stopping && from != Phase::Creating {
            return Err(EngineError::PhaseChanged {
                instance_id: instance_id.to_string(),
                expected: Phase::Stopping,
                actual: from,
            });
        }
        self.expect_phase(instance_id, from, |s| {
            s.reset_positions();
            s.last_recreation_time = Some(now);
            s.recreation_count += 1;
            s.creation_attempts = 0;
            s.phase = Phase::Creating;
        })?;
        self.risk.reset(instance_id);
        container.yield_operator.clear_targets();
        container.yield_analyzer.reset_history();
        container.cache.invalidate().await;

        self.create_chain_position(instance_id).await?;

        let count = self
            .registry
            .with(instance_id, |s| s.recreation_count)
            .unwrap_or_default();
        container.analytics_service.record_recreation();
        self.ports().events.publish(
            topics::POSITION_RECREATED,
            json!({
                "instance_id": instance_id,
                "recreation_type": recreation_type,
                "reason": decision.reason,
                "recreation_count": count,
            }),
        );
        self.notify(LifecycleNotice::Recreated {
            instance_id: instance_id.to_string(),
            recreation_type,
        });
        Ok(())
    }

    // ---- monitoring --------------------------------------------------------

    pub async fn run_tick(&self, instance_id: &str) {
        let container = self.factory.get_or_create(instance_id);
        container.analytics_service.record_tick();

        match self.analyze(instance_id, &container).await {
            Ok(()) => {}
            Err(e @ EngineError::PhaseChanged { .. }) => {
                debug!(instance_id, error = %e, "Tick result discarded");
            }
            Err(e) => {
                container.analytics_service.record_error();
                let phase = self.registry.with(instance_id, |s| s.phase);
                if phase == Some(Phase::Error) {
                    error!(instance_id, error = %e, "Tick ended in ERROR");
                } else if e.is_transient() {
                    warn!(instance_id, error = %e, "Tick failed, retrying next cycle");
                } else {
                    error!(instance_id, error = %e, "Tick failed");
                }
            }
        }

        self.registry.with(instance_id, |s| {
            if s.phase == Phase::Analyzing {
                s.phase = Phase::Monitoring;
            }
        });
    }

    async fn analyze(&self, instance_id: &str, container: &ServiceContainer) -> Result<(), EngineError> {
        let begun = self.registry.with(instance_id, |s| {
            if s.phase != Phase::Monitoring {
                return None;
            }
            let range = s.position_range?;
            s.phase = Phase::Analyzing;
            let cycle_id = s.next_cycle();
            Some((cycle_id, range, s.pool_address.clone()))
        });
        let Some(Some((cycle_id, range, pool))) = begun else {
            debug!(instance_id, "Instance not monitoring, tick skipped");
            return Ok(());
        };

        container.cache.begin_cycle(cycle_id).await;
        let now = self.settings.clock.now();

        let p = self.ports();
        let active_bin = p
            .retry
            .run(CHAIN_READ, || p.chain.get_active_bin(&pool))
            .await?;
        let ctx = self.expect_phase(instance_id, Phase::Analyzing, |s| {
            let update = s.update_active_bin(active_bin, now);
            if update.reentered {
                info!(instance_id, active_bin, "Active bin re-entered range");
            }
            SnapshotContext {
                instance_id: instance_id.to_string(),
                pool_address: s.pool_address.clone(),
                position_addresses: s.position_addresses.clone(),
                position_range: range,
                initial_investment: s.initial_investment,
                created_at: s.created_at,
                active_bin: Some(active_bin),
                now,
            }
        })?;

        let snapshot = container.cache.collect_market_data(cycle_id, &ctx).await?;

        let state = self.expect_phase(instance_id, Phase::Analyzing, |s| {
            if let Some(update) = evaluate_switch(
                &s.config.recreation.dynamic_switch,
                s.dynamic_recreation_switch_enabled,
                s.last_switch_update_time,
                &snapshot,
            ) {
                if update.changed {
                    info!(
                        instance_id,
                        enabled = update.enabled,
                        benchmark = ?update.benchmark,
                        "Dynamic recreation switch changed"
                    );
                }
                s.dynamic_recreation_switch_enabled = update.enabled;
                s.last_benchmark_yield = update.benchmark;
                s.last_switch_update_time = Some(update.updated_at);
            }
            s.clone()
        })?;

        let decision = self.recreation.should_recreate_position(&RecreationInput {
            snapshot: &snapshot,
            position_range: range,
            is_in_range: state.is_in_range,
            out_of_range_since: state.out_of_range_since,
            out_of_range_direction: state.out_of_range_direction,
            last_recreation_time: state.last_recreation_time,
            loss_recovery_mark: state.loss_recovery_mark,
            dynamic_switch_enabled: state.dynamic_recreation_switch_enabled,
            config: &state.config,
        });

        if let Some(update) = &decision.loss_recovery_update {
            self.expect_phase(instance_id, Phase::Analyzing, |s| match update {
                LossRecoveryUpdate::Mark(mark) => s.loss_recovery_mark = Some(*mark),
                LossRecoveryUpdate::Clear => s.loss_recovery_mark = None,
            })?;
        }

        if decision.should_stop {
            container.analytics_service.record_stop_loss();
            return self
                .full_exit(instance_id, Phase::Analyzing, StoppingReason::StopLoss, &decision.reason)
                .await;
        }

        if decision.should_recreate {
            return self.recreate(instance_id, &decision, snapshot.timestamp, container).await;
        }

        if let Some(details) = &decision.out_of_range_details {
            debug!(
                instance_id,
                direction = ?details.direction,
                remaining_secs = details.time_remaining_secs,
                "Out of range, waiting for timeout"
            );
        }

        if state.config.enable_smart_stop_loss {
            let risk = self
                .risk
                .evaluate(&snapshot, instance_id, &state.config.smart_stop_loss);
            match risk.action {
                StopLossAction::FullExit => {
                    container.analytics_service.record_stop_loss();
                    let why = risk.reasoning.join("; ");
                    return self
                        .full_exit(instance_id, Phase::Analyzing, StoppingReason::StopLoss, &why)
                        .await;
                }
                StopLossAction::Alert | StopLossAction::PartialExit => {
                    p.events.publish(
                        topics::RISK_ALERT,
                        json!({
                            "instance_id": instance_id,
                            "action": risk.action,
                            "risk_score": risk.risk_score,
                            "urgency": risk.urgency,
                            "reasoning": risk.reasoning,
                        }),
                    );
                }
                StopLossAction::Hold => {}
            }
        }

        if container
            .yield_operator
            .check_and_extract_if_needed(&snapshot, state.config.yield_extraction_threshold, instance_id)
            .await
            .is_some()
        {
            container.analytics_service.record_extraction();
        }

        p.events.publish(
            topics::INSTANCE_TICK,
            json!({
                "instance_id": instance_id,
                "cycle_id": cycle_id,
                "active_bin": snapshot.active_bin,
                "in_range": state.is_in_range,
                "position_value": snapshot.position_value.to_string(),
                "pending_yield": snapshot.pending_yield.to_string(),
                "net_pnl_pct": snapshot.net_pnl_percentage,
            }),
        );
        debug!(
            instance_id,
            cycle_id,
            active_bin = snapshot.active_bin,
            in_range = state.is_in_range,
            decision = %decision.reason,
            "Tick complete"
        );
        Ok(())
    }
}

#[async_trait]
impl TickHandler for ChainPositionExecutor {
    async fn on_tick(&self, instance_id: &str) {
        self.run_tick(instance_id).await;
    }
}

#[async_trait]
impl StrategyExecutor for ChainPositionExecutor {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::ChainPosition
    }

    async fn initialize(&self, instance_id: &str, config: &InstanceConfig) -> Result<(), EngineError> {
        let cfg = config
            .as_chain_position()
            .ok_or_else(|| EngineError::UnsupportedStrategy(config.strategy_type().to_string()))?;
        cfg.validate().map_err(|e| EngineError::Config(e.to_string()))?;

        if self.registry.contains(instance_id) {
            self.registry.with(instance_id, |s| {
                if s.phase.can_create() && !s.has_been_created {
                    s.config = cfg.clone();
                    s.pool_address = cfg.pool_address.clone();
                    s.initial_investment = cfg.position_amount;
                }
            });
            return Ok(());
        }
        self.registry
            .insert_if_absent(InstanceState::new(instance_id, cfg.clone(), self.settings.clock.now()));
        self.factory.get_or_create(instance_id);
        debug!(instance_id, pool = %cfg.pool_address, "Executor state initialized");
        Ok(())
    }

    async fn execute(&self, instance_id: &str) -> Result<(), EngineError> {
        let (created, phase, interval) = self
            .registry
            .with(instance_id, |s| (s.has_been_created, s.phase, s.config.monitoring_interval_secs))
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;

        if created {
            match phase {
                Phase::Error => {
                    return Err(EngineError::InvalidTransition {
                        instance_id: instance_id.to_string(),
                        phase,
                        action: "execute",
                    })
                }
                Phase::Stopped | Phase::Created => {
                    self.registry.with(instance_id, |s| {
                        s.phase = Phase::Monitoring;
                        s.stopping_reason = None;
                    });
                }
                _ => {}
            }
            let container = self.factory.get_or_create(instance_id);
            self.configure_extraction(instance_id, &container);
            if !self.scheduler.is_active(instance_id) {
                self.start_monitoring(instance_id, interval);
            }
            debug!(instance_id, "Positions already exist, monitoring ensured");
            return Ok(());
        }

        if !phase.can_create() {
            return Err(EngineError::InvalidTransition {
                instance_id: instance_id.to_string(),
                phase,
                action: "execute",
            });
        }

        if !self.ports().wallet.is_unlocked() {
            self.fail_instance(instance_id, "Wallet is locked".to_string());
            return Err(EngineError::WalletLocked);
        }

        self.registry.with(instance_id, |s| {
            s.phase = Phase::Creating;
            s.creation_attempts = 0;
            s.stopping_reason = None;
            s.error = None;
        });
        self.create_chain_position(instance_id).await?;
        self.start_monitoring(instance_id, interval);
        Ok(())
    }

    async fn pause(&self, instance_id: &str) -> Result<(), EngineError> {
        self.scheduler.cancel(instance_id);
        let phase = self
            .registry
            .with(instance_id, |s| {
                if matches!(s.phase, Phase::Monitoring | Phase::Analyzing | Phase::Created) {
                    s.phase = Phase::Stopped;
                    s.stopping_reason = Some(StoppingReason::ManualStop);
                }
                s.phase
            })
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        info!(instance_id, phase = ?phase, "Instance paused, positions kept");
        Ok(())
    }

    async fn stop(&self, instance_id: &str, reason: StoppingReason) -> Result<(), EngineError> {
        self.scheduler.cancel(instance_id);
        let Some((addresses, config)) = self.registry.with(instance_id, |s| {
            s.phase = Phase::Stopping;
            s.stopping_reason = Some(reason);
            (s.position_addresses.clone(), s.config.clone())
        }) else {
            return Ok(());
        };

        let outcome = self.close_positions(instance_id, &addresses).await;
        if !outcome.unclosed.is_empty() {
            warn!(instance_id, unclosed = ?outcome.unclosed, "Positions left open after stop");
        }
        if !addresses.is_empty() {
            if let Err(e) = self.liquidate_residual(instance_id, &config).await {
                warn!(instance_id, error = %e, "Residual liquidation failed");
            }
        }

        self.registry.with(instance_id, |s| {
            s.reset_positions();
            s.has_been_created = false;
            s.exit_attempts = 0;
            s.cleanup_targets = outcome.unclosed.clone();
            s.phase = Phase::Stopped;
        });
        self.release_instance_services(instance_id).await;
        info!(instance_id, reason = ?reason, closed = outcome.closed.len(), "Instance stopped");
        Ok(())
    }

    async fn remove(&self, instance_id: &str) -> Result<(), EngineError> {
        self.scheduler.cancel(instance_id);
        self.registry.remove(instance_id);
        self.risk.reset(instance_id);
        self.ports().swap_locks.remove(instance_id);
        self.factory.remove(instance_id).await;
        debug!(instance_id, "Executor state removed");
        Ok(())
    }

    async fn adopt_positions(&self, instance_id: &str, record: &PositionRecord) -> Result<(), EngineError> {
        let adoptable = self
            .registry
            .with(instance_id, |s| !s.has_been_created && s.phase.can_create())
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        if !adoptable {
            return Ok(());
        }

        let p = self.ports();
        let mut live = Vec::with_capacity(record.addresses.len());
        for address in &record.addresses {
            match p
                .retry
                .run(CHAIN_READ, || p.chain.get_position_on_chain_info(address))
                .await
            {
                Ok(_) => live.push(address.clone()),
                Err(RetryError::Fatal(ChainError::AccountNotFound(_))) => {
                    warn!(instance_id, position = %address, "Recorded position no longer on chain");
                }
                Err(e) => {
                    // Unreadable is not gone; keep managing it
                    warn!(instance_id, position = %address, error = %e, "Recorded position unreadable, adopting anyway");
                    live.push(address.clone());
                }
            }
        }
        if live.is_empty() {
            info!(instance_id, "No recorded position left on chain");
            return Ok(());
        }

        self.registry.with(instance_id, |s| {
            if !s.has_been_created && s.phase.can_create() {
                s.record_positions(live.clone(), record.range);
                s.phase = Phase::Stopped;
            }
        });
        info!(
            instance_id,
            positions = ?live,
            lower_bin = record.range.lower_bin,
            upper_bin = record.range.upper_bin,
            "Adopted recorded chain position"
        );
        Ok(())
    }

    fn holds_positions(&self, instance_id: &str) -> bool {
        self.registry
            .with(instance_id, |s| {
                s.has_been_created || !s.position_addresses.is_empty() || !s.cleanup_targets.is_empty()
            })
            .unwrap_or(false)
    }

    fn state_snapshot(&self, instance_id: &str) -> Option<InstanceState> {
        self.registry.snapshot(instance_id)
    }

    fn running_instances(&self) -> Vec<String> {
        self.registry
            .ids()
            .into_iter()
            .filter(|id| self.scheduler.is_active(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::retry::RetryExecutor;
    use crate::domain::SwapLockRegistry;
    use crate::ports::mocks::{
        FakeChain, FakeHarvester, FakeSwap, FakeTransactions, FakeWallet, RecordingEventBus,
    };
    use rust_decimal_macros::dec;

    struct Harness {
        executor: Arc<ChainPositionExecutor>,
        chain: Arc<FakeChain>,
        events: Arc<RecordingEventBus>,
        notices: mpsc::UnboundedReceiver<LifecycleNotice>,
    }

    fn harness_with_wallet(wallet: FakeWallet) -> Harness {
        let chain = Arc::new(FakeChain::new(1000));
        let events = Arc::new(RecordingEventBus::new());
        let factory = Arc::new(InstanceServiceFactory::new(WorkflowPorts {
            chain: chain.clone(),
            harvester: Arc::new(FakeHarvester::new()),
            transactions: Arc::new(FakeTransactions::confirming()),
            swap: Arc::new(FakeSwap::new()),
            wallet: Arc::new(wallet),
            events: events.clone(),
            swap_locks: Arc::new(SwapLockRegistry::new()),
            retry: Arc::new(RetryExecutor::without_delays()),
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = ChainPositionExecutor::new(factory, Arc::new(TickScheduler::new()), tx);
        Harness { executor, chain, events, notices: rx }
    }

    fn harness() -> Harness {
        harness_with_wallet(FakeWallet::unlocked())
    }

    fn config() -> InstanceConfig {
        InstanceConfig::ChainPosition(
            ChainPositionConfig::for_pool("pool")
                .with_position_amount(dec!(10))
                .with_bin_range(10),
        )
    }

    #[tokio::test]
    async fn test_creation_layout() {
        let h = harness();
        h.executor.initialize("a", &config()).await.unwrap();
        h.executor.execute("a").await.unwrap();

        let calls = h.chain.create_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!((calls[0].lower_bin, calls[0].upper_bin), (991, 1000));
        assert_eq!((calls[1].lower_bin, calls[1].upper_bin), (981, 990));
        assert_eq!(calls[0].amount_y, dec!(5));

        let state = h.executor.state_snapshot("a").unwrap();
        assert_eq!(state.phase, Phase::Monitoring);
        assert!(state.has_been_created);
        assert_eq!(state.position_range, Some(PositionRange::new(981, 1000)));
        assert_eq!(h.events.count(topics::POSITION_CREATED), 1);
        h.executor.scheduler().shutdown().await;
    }

    #[tokio::test]
    async fn test_locked_wallet_enters_error() {
        let mut h = harness_with_wallet(FakeWallet::locked("pw"));
        h.executor.initialize("a", &config()).await.unwrap();
        let result = h.executor.execute("a").await;
        assert!(matches!(result, Err(EngineError::WalletLocked)));

        let state = h.executor.state_snapshot("a").unwrap();
        assert_eq!(state.phase, Phase::Error);
        assert!(state.error.is_some());
        assert!(h.chain.create_calls().is_empty());
        assert!(matches!(h.notices.try_recv(), Ok(LifecycleNotice::Errored { .. })));
    }

    #[tokio::test]
    async fn test_both_creates_fail_is_terminal() {
        let h = harness();
        h.chain.script_creates(&[false, false]);
        h.executor.initialize("a", &config()).await.unwrap();
        assert!(h.executor.execute("a").await.is_err());

        let state = h.executor.state_snapshot("a").unwrap();
        assert_eq!(state.phase, Phase::Error);
        assert!(state.error.unwrap().contains("Both position creations failed"));
        assert_eq!(h.chain.create_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_creation_attempts_are_bounded() {
        let h = harness();
        // Every round creates one half and the cleanup succeeds
        h.chain.script_creates(&[true, false, true, false, true, false]);
        h.executor.initialize("a", &config()).await.unwrap();
        assert!(h.executor.execute("a").await.is_err());

        let state = h.executor.state_snapshot("a").unwrap();
        assert_eq!(state.phase, Phase::Error);
        assert_eq!(h.chain.create_calls().len(), 6);
        assert!(h.chain.open_positions().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_config_rejected() {
        let h = harness();
        let bad = InstanceConfig::ChainPosition(ChainPositionConfig::for_pool(""));
        assert!(matches!(
            h.executor.initialize("a", &bad).await,
            Err(EngineError::Config(_))
        ));
        assert!(h.executor.state_snapshot("a").is_none());
    }

    #[tokio::test]
    async fn test_pause_keeps_positions_and_resume_does_not_recreate() {
        let h = harness();
        h.executor.initialize("a", &config()).await.unwrap();
        h.executor.execute("a").await.unwrap();
        h.executor.pause("a").await.unwrap();

        let paused = h.executor.state_snapshot("a").unwrap();
        assert_eq!(paused.phase, Phase::Stopped);
        assert_eq!(paused.stopping_reason, Some(StoppingReason::ManualStop));
        assert_eq!(h.chain.open_positions().len(), 2);
        assert!(h.executor.running_instances().is_empty());

        h.executor.execute("a").await.unwrap();
        assert_eq!(h.executor.state_snapshot("a").unwrap().phase, Phase::Monitoring);
        assert_eq!(h.chain.create_calls().len(), 2);
        assert_eq!(h.executor.running_instances(), vec!["a".to_string()]);
        h.executor.scheduler().shutdown().await;
    }

    #[tokio::test]
    async fn test_user_stop_closes_positions() {
        let h = harness();
        h.executor.initialize("a", &config()).await.unwrap();
        h.executor.execute("a").await.unwrap();
        h.executor.stop("a", StoppingReason::UserStop).await.unwrap();

        let state = h.executor.state_snapshot("a").unwrap();
        assert_eq!(state.phase, Phase::Stopped);
        assert!(!state.has_been_created);
        assert!(h.chain.open_positions().is_empty());
        assert!(!h.executor.scheduler().is_active("a"));
    }

    #[tokio::test]
    async fn test_tick_skipped_when_not_monitoring() {
        let h = harness();
        h.executor.initialize("a", &config()).await.unwrap();
        h.executor.run_tick("a").await;
        let state = h.executor.state_snapshot("a").unwrap();
        assert_eq!(state.phase, Phase::Created);
        assert_eq!(state.cycle_id, 0);
    }

    #[tokio::test]
    async fn test_transient_read_failure_reverts_to_monitoring() {
        let h = harness();
        h.executor.initialize("a", &config()).await.unwrap();
        h.executor.execute("a").await.unwrap();
        h.executor.scheduler().cancel("a");

        // chain_read allows 3 attempts
        h.chain.fail_next_reads(3);
        h.executor.run_tick("a").await;
        let state = h.executor.state_snapshot("a").unwrap();
        assert_eq!(state.phase, Phase::Monitoring);
        assert_eq!(state.cycle_id, 1);

        h.executor.run_tick("a").await;
        assert_eq!(h.events.count(topics::INSTANCE_TICK), 1);
    }

    #[tokio::test]
    async fn test_holds_positions_follows_lifecycle() {
        let h = harness();
        h.executor.initialize("a", &config()).await.unwrap();
        assert!(!h.executor.holds_positions("a"));

        h.executor.execute("a").await.unwrap();
        h.executor.pause("a").await.unwrap();
        assert!(h.executor.holds_positions("a"));

        h.executor.stop("a", StoppingReason::UserStop).await.unwrap();
        assert!(!h.executor.holds_positions("a"));
        assert!(!h.executor.holds_positions("missing"));
    }

    #[tokio::test]
    async fn test_adopt_keeps_only_positions_still_on_chain() {
        let h = harness();
        h.executor.initialize("a", &config()).await.unwrap();
        h.executor.execute("a").await.unwrap();
        h.executor.remove("a").await.unwrap();

        h.executor.initialize("a", &config()).await.unwrap();
        let record = PositionRecord {
            addresses: vec!["position-1".to_string(), "gone".to_string()],
            range: PositionRange::new(981, 1000),
        };
        h.executor.adopt_positions("a", &record).await.unwrap();

        let state = h.executor.state_snapshot("a").unwrap();
        assert_eq!(state.phase, Phase::Stopped);
        assert_eq!(state.position_addresses, vec!["position-1".to_string()]);
        assert_eq!(state.position_range, Some(PositionRange::new(981, 1000)));

        h.executor.execute("a").await.unwrap();
        assert_eq!(h.executor.state_snapshot("a").unwrap().phase, Phase::Monitoring);
        assert_eq!(h.chain.create_calls().len(), 2);
        h.executor.scheduler().shutdown().await;
    }

    #[tokio::test]
    async fn test_adopt_without_live_positions_leaves_instance_fresh() {
        let h = harness();
        h.executor.initialize("a", &config()).await.unwrap();
        let record = PositionRecord {
            addresses: vec!["gone".to_string()],
            range: PositionRange::new(981, 1000),
        };
        h.executor.adopt_positions("a", &record).await.unwrap();

        let state = h.executor.state_snapshot("a").unwrap();
        assert_eq!(state.phase, Phase::Created);
        assert!(!state.has_been_created);

        h.executor.execute("a").await.unwrap();
        assert_eq!(h.chain.create_calls().len(), 2);
        h.executor.scheduler().shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_exit_returns_to_monitoring_until_bounded() {
        let mut h = harness();
        h.executor.initialize("a", &config()).await.unwrap();
        h.executor.execute("a").await.unwrap();
        h.executor.scheduler().cancel("a");
        h.chain.script_closes(&[false; 6]);

        for attempt in 1..3 {
            h.executor
                .full_exit("a", Phase::Monitoring, StoppingReason::StopLoss, "test")
                .await
                .unwrap();
            let state = h.executor.state_snapshot("a").unwrap();
            assert_eq!(state.phase, Phase::Monitoring);
            assert_eq!(state.exit_attempts, attempt);
            assert_eq!(state.stopping_reason, None);
            assert!(h.executor.scheduler().is_active("a"));
        }

        let result = h
            .executor
            .full_exit("a", Phase::Monitoring, StoppingReason::StopLoss, "test")
            .await;
        assert!(matches!(result, Err(EngineError::ExitFailed { .. })));
        assert_eq!(h.executor.state_snapshot("a").unwrap().phase, Phase::Error);
        assert!(!h.executor.scheduler().is_active("a"));
        assert!(matches!(h.notices.try_recv(), Ok(LifecycleNotice::Errored { .. })));
        assert_eq!(h.chain.open_positions().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_drops_state() {
        let h = harness();
        h.executor.initialize("a", &config()).await.unwrap();
        h.executor.remove("a").await.unwrap();
        assert!(h.executor.state_snapshot("a").is_none());
        assert!(matches!(
            h.executor.execute("a").await,
            Err(EngineError::InstanceNotFound(_))
        ));
    }
}
