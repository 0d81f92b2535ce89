//! Yield Extraction Workflow
//!
//! Gates, executes and verifies fee harvesting for one instance.
//!
//! Gates, first failure short-circuits with no side effects:
//! 1. Time-lock: one attempt per cooldown, success or failure
//! 2. Active bin strictly above the range midpoint
//! 3. Pending yield at or above the threshold
//!
//! A ledger entry is written only after the harvest signature verifies. The
//! follow-up swap of harvested token X is best-effort and never rolls back the
//! recorded yield.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::application::market_cache::MarketSnapshotCache;
use crate::application::retry::{RetryExecutor, CHAIN_READ, SWAP, TRANSACTION_SUBMIT};
use crate::domain::{AccumulatedYieldManager, MarketSnapshot, SwapLockRegistry, YieldExtraction};
use crate::ports::{
    to_ui_amount, topics, ChainPositionProvider, EventBus, PoolInfo, SwapParams, SwapService,
    TransactionService, WalletService, YieldHarvester,
};

/// A position the workflow harvests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionRef {
    pub address: String,
    pub pool_address: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionSettings {
    pub cooldown: Duration,
    pub slippage_bps: u16,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::seconds(60),
            slippage_bps: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionReport {
    pub entries: Vec<YieldExtraction>,
    pub total_extracted: Decimal,
    pub swaps_executed: usize,
}

/// Collaborators the workflow calls
#[derive(Clone)]
pub struct WorkflowPorts {
    pub chain: Arc<dyn ChainPositionProvider>,
    pub harvester: Arc<dyn YieldHarvester>,
    pub transactions: Arc<dyn TransactionService>,
    pub swap: Arc<dyn SwapService>,
    pub wallet: Arc<dyn WalletService>,
    pub events: Arc<dyn EventBus>,
    pub swap_locks: Arc<SwapLockRegistry>,
    pub retry: Arc<RetryExecutor>,
}

pub struct YieldExtractionWorkflow {
    ports: WorkflowPorts,
    ledger: Arc<AccumulatedYieldManager>,
    cache: Arc<MarketSnapshotCache>,
    settings: RwLock<ExtractionSettings>,
    targets: RwLock<Vec<PositionRef>>,
    last_attempt: Mutex<Option<DateTime<Utc>>>,
}

impl YieldExtractionWorkflow {
    pub fn new(
        ports: WorkflowPorts,
        ledger: Arc<AccumulatedYieldManager>,
        cache: Arc<MarketSnapshotCache>,
    ) -> Self {
        Self {
            ports,
            ledger,
            cache,
            settings: RwLock::new(ExtractionSettings::default()),
            targets: RwLock::new(Vec::new()),
            last_attempt: Mutex::new(None),
        }
    }

    /// Point the workflow at the instance's current positions.
    pub fn configure(&self, settings: ExtractionSettings, targets: Vec<PositionRef>) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        *self.targets.write().unwrap_or_else(|e| e.into_inner()) = targets;
    }

    pub fn clear_targets(&self) {
        self.targets.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn last_attempt(&self) -> Option<DateTime<Utc>> {
        *self.last_attempt.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn check_and_extract_if_needed(
        &self,
        snapshot: &MarketSnapshot,
        threshold: Decimal,
        instance_id: &str,
    ) -> Option<ExtractionReport> {
        let now = snapshot.timestamp;
        let settings = *self.settings.read().unwrap_or_else(|e| e.into_inner());

        {
            let mut last = self.last_attempt.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = *last {
                let since = now - previous;
                if since < settings.cooldown {
                    debug!(
                        instance_id,
                        remaining_secs = (settings.cooldown - since).num_seconds(),
                        "Extraction time-locked"
                    );
                    return None;
                }
            }

            if !snapshot.in_upper_half() {
                debug!(
                    instance_id,
                    active_bin = snapshot.active_bin,
                    midpoint = snapshot.position_range().midpoint(),
                    "Active bin not in upper half, skipping extraction"
                );
                return None;
            }

            if snapshot.pending_yield < threshold {
                debug!(
                    instance_id,
                    pending = %snapshot.pending_yield,
                    threshold = %threshold,
                    "Pending yield below threshold"
                );
                return None;
            }

            *last = Some(now);
        }

        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner()).clone();
        if targets.is_empty() {
            warn!(instance_id, "No positions registered for extraction");
            return None;
        }

        info!(
            instance_id,
            pending = %snapshot.pending_yield,
            positions = targets.len(),
            "Extracting yield"
        );
        self.execute(snapshot, instance_id, targets, settings).await
    }

    async fn execute(
        &self,
        snapshot: &MarketSnapshot,
        instance_id: &str,
        targets: Vec<PositionRef>,
        settings: ExtractionSettings,
    ) -> Option<ExtractionReport> {
        let _in_flight = self.cache.begin_extraction();
        let p = &self.ports;

        let Some(owner) = p.wallet.public_key() else {
            warn!(instance_id, "Wallet locked, cannot extract yield");
            self.publish_failure(instance_id, "wallet locked");
            return None;
        };

        let mut by_pool: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for target in targets {
            by_pool.entry(target.pool_address).or_default().push(target.address);
        }

        let mut entries = Vec::new();
        let mut swaps_executed = 0;

        for (pool, addresses) in by_pool {
            let pool_ref = pool.as_str();
            let info = match p.retry.run(CHAIN_READ, || p.chain.get_pool_info(pool_ref)).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(instance_id, pool = pool_ref, error = %e, "Pool info unavailable, skipping harvest");
                    continue;
                }
            };

            let harvest = match p
                .retry
                .run(TRANSACTION_SUBMIT, || p.harvester.harvest(pool_ref, &addresses))
                .await
            {
                Ok(h) => h,
                Err(e) => {
                    warn!(instance_id, pool = pool_ref, error = %e, "Harvest submission failed");
                    continue;
                }
            };

            let Some(signature) = harvest.signature.clone() else {
                warn!(instance_id, pool = pool_ref, "Harvest returned no signature, not recorded");
                continue;
            };

            let verification = p
                .retry
                .verify_transaction(p.transactions.as_ref(), &signature)
                .await;
            if !verification.success {
                warn!(
                    instance_id,
                    signature = %signature,
                    status = ?verification.status,
                    error = ?verification.error,
                    "Harvest not verified, yield not recorded"
                );
                continue;
            }

            let price = Decimal::try_from(info.active_price).unwrap_or(Decimal::ZERO);
            let amount = to_ui_amount(harvest.harvested_x, info.token_x_decimals) * price
                + to_ui_amount(harvest.harvested_y, info.token_y_decimals);
            let entry = YieldExtraction {
                timestamp: snapshot.timestamp,
                extracted_amount: amount,
                transaction_signature: signature.clone(),
                gas_used: harvest.fee_lamports,
                price_at_extraction: info.active_price,
            };

            if let Err(e) = self.ledger.record(entry.clone()) {
                warn!(instance_id, error = %e, "Ledger rejected extraction");
                continue;
            }
            info!(
                instance_id,
                signature = %signature,
                amount = %amount,
                slot = ?verification.slot,
                "Yield extraction recorded"
            );
            entries.push(entry);

            if self
                .swap_harvested(instance_id, &info, harvest.harvested_x, &owner, settings.slippage_bps)
                .await
            {
                swaps_executed += 1;
            }
        }

        if entries.is_empty() {
            self.publish_failure(instance_id, "no harvest verified");
            return None;
        }

        self.cache.invalidate().await;
        let report = ExtractionReport {
            total_extracted: entries.iter().map(|e| e.extracted_amount).sum(),
            entries,
            swaps_executed,
        };
        p.events.publish(
            topics::YIELD_EXTRACTED,
            json!({
                "instance_id": instance_id,
                "total_extracted": report.total_extracted.to_string(),
                "signatures": report.entries.iter().map(|e| e.transaction_signature.clone()).collect::<Vec<_>>(),
                "ledger_total": self.ledger.total_extracted().to_string(),
            }),
        );
        Some(report)
    }

    /// Convert harvested token X to the base asset. Failures only warn.
    async fn swap_harvested(
        &self,
        instance_id: &str,
        pool: &PoolInfo,
        amount_x: u64,
        owner: &str,
        slippage_bps: u16,
    ) -> bool {
        if amount_x == 0 || pool.token_x == pool.token_y {
            return false;
        }
        let _guard = match self.ports.swap_locks.try_acquire(instance_id) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(instance_id, error = %e, "Skipping harvested-token swap");
                return false;
            }
        };

        let params = SwapParams {
            input_mint: pool.token_x.clone(),
            output_mint: pool.token_y.clone(),
            amount: amount_x,
            slippage_bps,
            user_public_key: owner.to_string(),
        };
        match self
            .ports
            .retry
            .run(SWAP, || self.ports.swap.execute_swap(params.clone()))
            .await
        {
            Ok(outcome) => {
                info!(
                    instance_id,
                    signature = %outcome.signature,
                    input = amount_x,
                    output = outcome.output_amount,
                    "Swapped harvested token X to base asset"
                );
                true
            }
            Err(e) => {
                warn!(instance_id, error = %e, "Harvested-token swap failed; recorded yield kept");
                false
            }
        }
    }

    fn publish_failure(&self, instance_id: &str, reason: &str) {
        self.ports.events.publish(
            topics::YIELD_EXTRACTION_FAILED,
            json!({ "instance_id": instance_id, "reason": reason }),
        );
    }

    pub async fn shutdown(&self) {
        self.clear_targets();
        debug!("Yield extraction workflow stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::market_cache::MarketDataAnalyzer;
    use crate::application::retry::VERIFICATION_ATTEMPTS;
    use crate::ports::mocks::{
        FakeChain, FakeHarvester, FakeSwap, FakeTransactions, FakeWallet, RecordingEventBus,
    };
    use crate::ports::{HarvestResult, TransactionStatus};
    use rust_decimal_macros::dec;

    struct Harness {
        workflow: YieldExtractionWorkflow,
        harvester: Arc<FakeHarvester>,
        transactions: Arc<FakeTransactions>,
        swap: Arc<FakeSwap>,
        events: Arc<RecordingEventBus>,
        ledger: Arc<AccumulatedYieldManager>,
        locks: Arc<SwapLockRegistry>,
    }

    fn harness(harvest: HarvestResult) -> Harness {
        let chain = Arc::new(FakeChain::new(100));
        let harvester = Arc::new(FakeHarvester::returning(harvest));
        let transactions = Arc::new(FakeTransactions::confirming());
        let swap = Arc::new(FakeSwap::new());
        let events = Arc::new(RecordingEventBus::new());
        let locks = Arc::new(SwapLockRegistry::new());
        let retry = Arc::new(RetryExecutor::without_delays());
        let ledger = Arc::new(AccumulatedYieldManager::new());
        let analyzer = Arc::new(MarketDataAnalyzer::new(chain.clone(), retry.clone(), ledger.clone()));
        let cache = Arc::new(MarketSnapshotCache::new(analyzer));

        let workflow = YieldExtractionWorkflow::new(
            WorkflowPorts {
                chain,
                harvester: harvester.clone(),
                transactions: transactions.clone(),
                swap: swap.clone(),
                wallet: Arc::new(FakeWallet::unlocked()),
                events: events.clone(),
                swap_locks: locks.clone(),
                retry,
            },
            ledger.clone(),
            cache,
        );
        workflow.configure(
            ExtractionSettings::default(),
            vec![
                PositionRef { address: "p1".into(), pool_address: "pool".into() },
                PositionRef { address: "p2".into(), pool_address: "pool".into() },
            ],
        );

        Harness { workflow, harvester, transactions, swap, events, ledger, locks }
    }

    fn harvest(sig: &str) -> HarvestResult {
        HarvestResult {
            signature: Some(sig.to_string()),
            harvested_x: 50_000_000, // 0.05 X
            harvested_y: 7_000_000,  // 7 Y
            fee_lamports: 5000,
        }
    }

    fn snapshot(active_bin: i32, pending: Decimal, t: DateTime<Utc>) -> MarketSnapshot {
        MarketSnapshot {
            timestamp: t,
            active_bin,
            position_lower_bin: 0,
            position_upper_bin: 100,
            pending_yield: pending,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_extracts_then_time_locks() {
        let h = harness(harvest("sig-1"));
        let t0 = Utc::now();

        let report = h
            .workflow
            .check_and_extract_if_needed(&snapshot(100, dec!(12), t0), dec!(10), "inst")
            .await
            .expect("extraction should proceed");
        // 0.05 X at 100 + 7 Y
        assert_eq!(report.total_extracted, dec!(12));
        assert_eq!(h.ledger.count(), 1);
        assert_eq!(h.harvester.calls()[0].1, vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(h.swap.calls().len(), 1);
        assert_eq!(h.events.count(topics::YIELD_EXTRACTED), 1);

        let again = h
            .workflow
            .check_and_extract_if_needed(&snapshot(100, dec!(50), t0 + Duration::seconds(30)), dec!(10), "inst")
            .await;
        assert!(again.is_none());
        assert_eq!(h.harvester.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_lower_half_never_extracts() {
        let h = harness(harvest("sig-1"));
        for bin in [0, 25, 50] {
            let result = h
                .workflow
                .check_and_extract_if_needed(&snapshot(bin, dec!(100), Utc::now()), dec!(1), "inst")
                .await;
            assert!(result.is_none());
        }
        assert!(h.harvester.calls().is_empty());
        assert!(h.workflow.last_attempt().is_none());
    }

    #[tokio::test]
    async fn test_below_threshold_has_no_side_effects() {
        let h = harness(harvest("sig-1"));
        let result = h
            .workflow
            .check_and_extract_if_needed(&snapshot(90, dec!(9.99), Utc::now()), dec!(10), "inst")
            .await;
        assert!(result.is_none());
        assert!(h.workflow.last_attempt().is_none());
    }

    #[tokio::test]
    async fn test_failed_verification_not_recorded_but_time_locked() {
        let h = harness(harvest("sig-bad"));
        h.transactions.set_status("sig-bad", TransactionStatus::Failed);
        let t0 = Utc::now();

        let result = h
            .workflow
            .check_and_extract_if_needed(&snapshot(90, dec!(20), t0), dec!(10), "inst")
            .await;
        assert!(result.is_none());
        assert_eq!(h.ledger.count(), 0);
        assert!(h.swap.calls().is_empty());
        assert_eq!(h.transactions.lookups(), 1);
        assert_eq!(h.events.count(topics::YIELD_EXTRACTION_FAILED), 1);
        assert_eq!(h.workflow.last_attempt(), Some(t0));
    }

    #[tokio::test]
    async fn test_unknown_status_polls_four_times() {
        let h = harness(harvest("sig-slow"));
        h.transactions.set_status("sig-slow", TransactionStatus::Unknown);
        let result = h
            .workflow
            .check_and_extract_if_needed(&snapshot(90, dec!(20), Utc::now()), dec!(10), "inst")
            .await;
        assert!(result.is_none());
        assert_eq!(h.transactions.lookups(), VERIFICATION_ATTEMPTS as usize);
        assert_eq!(h.ledger.count(), 0);
    }

    #[tokio::test]
    async fn test_missing_signature_not_recorded() {
        let h = harness(HarvestResult { signature: None, ..harvest("unused") });
        let result = h
            .workflow
            .check_and_extract_if_needed(&snapshot(90, dec!(20), Utc::now()), dec!(10), "inst")
            .await;
        assert!(result.is_none());
        assert_eq!(h.ledger.count(), 0);
        assert_eq!(h.transactions.lookups(), 0);
    }

    #[tokio::test]
    async fn test_swap_failure_keeps_recorded_yield() {
        let h = harness(harvest("sig-1"));
        h.swap.set_failing(true);
        let report = h
            .workflow
            .check_and_extract_if_needed(&snapshot(90, dec!(20), Utc::now()), dec!(10), "inst")
            .await
            .unwrap();
        assert_eq!(report.swaps_executed, 0);
        assert_eq!(h.ledger.count(), 1);
    }

    #[tokio::test]
    async fn test_busy_swap_lock_skips_swap() {
        let h = harness(harvest("sig-1"));
        let _held = h.locks.try_acquire("inst").unwrap();
        let report = h
            .workflow
            .check_and_extract_if_needed(&snapshot(90, dec!(20), Utc::now()), dec!(10), "inst")
            .await
            .unwrap();
        assert_eq!(report.swaps_executed, 0);
        assert!(h.swap.calls().is_empty());
        assert_eq!(h.ledger.count(), 1);
    }

    #[tokio::test]
    async fn test_same_signature_never_double_counted() {
        let h = harness(harvest("sig-same"));
        let t0 = Utc::now();
        h.workflow
            .check_and_extract_if_needed(&snapshot(90, dec!(20), t0), dec!(10), "inst")
            .await
            .unwrap();
        let second = h
            .workflow
            .check_and_extract_if_needed(&snapshot(90, dec!(20), t0 + Duration::minutes(2)), dec!(10), "inst")
            .await;
        assert!(second.is_none());
        assert_eq!(h.ledger.count(), 1);
    }
}
