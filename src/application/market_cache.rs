//! Market Snapshot Cache
//!
//! `MarketDataAnalyzer` turns chain reads into a `MarketSnapshot` and keeps
//! the rolling price/yield history the windows need. `MarketSnapshotCache`
//! guarantees at most one upstream fetch per monitoring cycle and pins the
//! last snapshot while a yield extraction is in flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures::future::try_join_all;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;
use tracing::{debug, info};

use crate::application::retry::{RetryExecutor, CHAIN_READ};
use crate::domain::{
    AccumulatedYieldManager, BenchmarkYieldRates, EngineError, FeeYieldEfficiency,
    MarketSnapshot, PositionRange, PriceChanges, PricePoint, YieldRates,
};
use crate::ports::ChainPositionProvider;

/// Price history retained for the trailing-change windows
const PRICE_HISTORY_HOURS: i64 = 2;

/// Yield history retained for the efficiency windows
const YIELD_HISTORY_MINUTES: i64 = 65;

/// Benchmark samples retained for the averages
const BENCHMARK_HISTORY_MINUTES: i64 = 30;

/// Points of price history copied into each snapshot
const SNAPSHOT_PRICE_POINTS: usize = 120;

/// Inputs for one snapshot computation
#[derive(Debug, Clone)]
pub struct SnapshotContext {
    pub instance_id: String,
    pub pool_address: String,
    pub position_addresses: Vec<String>,
    pub position_range: PositionRange,
    pub initial_investment: Decimal,
    pub created_at: DateTime<Utc>,
    /// Active bin already read this cycle, if any
    pub active_bin: Option<i32>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct History {
    prices: VecDeque<PricePoint>,
    yields: VecDeque<(DateTime<Utc>, Decimal)>,
    benchmark: VecDeque<(DateTime<Utc>, f64)>,
}

impl History {
    fn record_price(&mut self, now: DateTime<Utc>, price: f64) -> PriceChanges {
        self.prices.push_back(PricePoint { timestamp: now, price });
        let cutoff = now - Duration::hours(PRICE_HISTORY_HOURS);
        while self.prices.front().is_some_and(|p| p.timestamp < cutoff) {
            self.prices.pop_front();
        }
        PriceChanges {
            last_5m: self.price_change(now, Duration::minutes(5), price),
            last_15m: self.price_change(now, Duration::minutes(15), price),
            last_1h: self.price_change(now, Duration::hours(1), price),
        }
    }

    /// Change versus the oldest price inside the window, in percent
    fn price_change(&self, now: DateTime<Utc>, window: Duration, current: f64) -> f64 {
        let start = now - window;
        match self.prices.iter().find(|p| p.timestamp >= start) {
            Some(reference) if reference.price > 0.0 => {
                (current - reference.price) / reference.price * 100.0
            }
            _ => 0.0,
        }
    }

    fn record_yield(&mut self, now: DateTime<Utc>, total_yield: Decimal) {
        self.yields.push_back((now, total_yield));
        let cutoff = now - Duration::minutes(YIELD_HISTORY_MINUTES);
        while self.yields.front().is_some_and(|(t, _)| *t < cutoff) {
            self.yields.pop_front();
        }
    }

    /// Yield growth inside the window as a percentage of position value
    fn yield_efficiency(&self, now: DateTime<Utc>, window: Duration, position_value: Decimal) -> f64 {
        if position_value <= Decimal::ZERO {
            return 0.0;
        }
        let start = now - window;
        let (Some((_, first)), Some((_, last))) = (
            self.yields.iter().find(|(t, _)| *t >= start),
            self.yields.back(),
        ) else {
            return 0.0;
        };
        ((*last - *first) / position_value * Decimal::ONE_HUNDRED)
            .to_f64()
            .unwrap_or(0.0)
    }

    fn record_benchmark(&mut self, now: DateTime<Utc>, current: f64) {
        self.benchmark.push_back((now, current));
        let cutoff = now - Duration::minutes(BENCHMARK_HISTORY_MINUTES);
        while self.benchmark.front().is_some_and(|(t, _)| *t < cutoff) {
            self.benchmark.pop_front();
        }
    }

    fn benchmark_average(&self, now: DateTime<Utc>, window: Duration) -> f64 {
        let start = now - window;
        let samples: Vec<f64> = self
            .benchmark
            .iter()
            .filter(|(t, _)| *t >= start)
            .map(|(_, v)| *v)
            .collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().mean()
    }
}

/// Computes snapshots for one instance
pub struct MarketDataAnalyzer {
    chain: Arc<dyn ChainPositionProvider>,
    retry: Arc<RetryExecutor>,
    ledger: Arc<AccumulatedYieldManager>,
    history: Mutex<History>,
    fetches: AtomicU64,
}

impl MarketDataAnalyzer {
    pub fn new(
        chain: Arc<dyn ChainPositionProvider>,
        retry: Arc<RetryExecutor>,
        ledger: Arc<AccumulatedYieldManager>,
    ) -> Self {
        Self {
            chain,
            retry,
            ledger,
            history: Mutex::new(History::default()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Number of upstream fetches performed
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub async fn compute_snapshot(
        &self,
        cycle_id: u64,
        ctx: &SnapshotContext,
    ) -> Result<MarketSnapshot, EngineError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let pool_address = ctx.pool_address.as_str();

        let active_bin = match ctx.active_bin {
            Some(bin) => bin,
            None => {
                self.retry
                    .run(CHAIN_READ, || self.chain.get_active_bin(pool_address))
                    .await?
            }
        };
        let pool = self
            .retry
            .run(CHAIN_READ, || self.chain.get_pool_info(pool_address))
            .await?;
        let positions = try_join_all(ctx.position_addresses.iter().map(|address| {
            self.retry
                .run(CHAIN_READ, move || self.chain.get_position_on_chain_info(address))
        }))
        .await?;

        let price = pool.active_price;
        let price_dec = Decimal::try_from(price)
            .map_err(|_| EngineError::MarketData(format!("unrepresentable price {}", price)))?;

        let (mut x, mut y, mut fee_x, mut fee_y) =
            (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO, Decimal::ZERO);
        for info in &positions {
            x += info.total_x_amount;
            y += info.total_y_amount;
            fee_x += info.fee_x;
            fee_y += info.fee_y;
        }

        let position_value = x * price_dec + y;
        let pending_yield = fee_x * price_dec + fee_y;
        let extracted_yield = self.ledger.total_extracted();
        let net_pnl = position_value + pending_yield + extracted_yield - ctx.initial_investment;
        let net_pnl_percentage = percent_of(net_pnl, ctx.initial_investment);
        let total_return_rate = percent_of(pending_yield + extracted_yield, ctx.initial_investment);

        let now = ctx.now;
        let (price_changes, efficiency, benchmark, price_history) = {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            let price_changes = history.record_price(now, price);
            history.record_yield(now, pending_yield + extracted_yield);

            let efficiency = FeeYieldEfficiency {
                last_5m: history.yield_efficiency(now, Duration::minutes(5), position_value),
                last_15m: history.yield_efficiency(now, Duration::minutes(15), position_value),
                last_1h: history.yield_efficiency(now, Duration::hours(1), position_value),
            };

            let benchmark = if history.yields.len() >= 2 {
                history.record_benchmark(now, efficiency.last_5m);
                Some(BenchmarkYieldRates {
                    current_5min: efficiency.last_5m,
                    avg_5min: history.benchmark_average(now, Duration::minutes(5)),
                    avg_15min: history.benchmark_average(now, Duration::minutes(15)),
                    avg_30min: history.benchmark_average(now, Duration::minutes(30)),
                    bin_offset: (active_bin - ctx.position_range.midpoint()).unsigned_abs(),
                })
            } else {
                None
            };

            let skip = history.prices.len().saturating_sub(SNAPSHOT_PRICE_POINTS);
            let price_history: Vec<PricePoint> = history.prices.iter().skip(skip).copied().collect();
            (price_changes, efficiency, benchmark, price_history)
        };

        debug!(
            instance_id = %ctx.instance_id,
            cycle_id,
            active_bin,
            price,
            position_value = %position_value,
            pending_yield = %pending_yield,
            net_pnl_pct = format!("{:.3}", net_pnl_percentage),
            "Computed market snapshot"
        );

        Ok(MarketSnapshot {
            cycle_id,
            timestamp: now,
            current_price: price,
            price_history,
            position_value,
            pending_yield,
            extracted_yield,
            initial_investment: ctx.initial_investment,
            active_bin,
            position_lower_bin: ctx.position_range.lower_bin,
            position_upper_bin: ctx.position_range.upper_bin,
            net_pnl,
            net_pnl_percentage,
            holding_duration_secs: (now - ctx.created_at).num_seconds().max(0),
            historical_price_changes: price_changes,
            historical_yield_rates: YieldRates {
                total_return_rate,
                fee_yield_efficiency: efficiency,
            },
            benchmark_yield_rates: benchmark,
        })
    }

    /// Drop history so a rebuilt position starts from a clean baseline
    pub fn reset_history(&self) {
        *self.history.lock().unwrap_or_else(|e| e.into_inner()) = History::default();
    }

    pub async fn shutdown(&self) {
        self.reset_history();
        debug!(fetches = self.fetch_count(), "Market data analyzer stopped");
    }
}

fn percent_of(value: Decimal, base: Decimal) -> f64 {
    if base <= Decimal::ZERO {
        return 0.0;
    }
    (value / base * Decimal::ONE_HUNDRED).to_f64().unwrap_or(0.0)
}

#[derive(Debug, Default)]
struct CacheSlot {
    valid_cycle: Option<u64>,
    last: Option<Arc<MarketSnapshot>>,
}

/// Clears the in-flight flag when the extraction ends
pub struct ExtractionGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ExtractionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Per-instance, per-cycle snapshot cache
pub struct MarketSnapshotCache {
    analyzer: Arc<MarketDataAnalyzer>,
    slot: tokio::sync::Mutex<CacheSlot>,
    extraction_in_flight: AtomicBool,
}

impl MarketSnapshotCache {
    pub fn new(analyzer: Arc<MarketDataAnalyzer>) -> Self {
        Self {
            analyzer,
            slot: tokio::sync::Mutex::new(CacheSlot::default()),
            extraction_in_flight: AtomicBool::new(false),
        }
    }

    /// Invalidate at the start of a monitoring cycle.
    pub async fn begin_cycle(&self, cycle_id: u64) {
        let mut slot = self.slot.lock().await;
        if slot.valid_cycle != Some(cycle_id) {
            slot.valid_cycle = None;
        }
    }

    pub async fn collect_market_data(
        &self,
        cycle_id: u64,
        ctx: &SnapshotContext,
    ) -> Result<Arc<MarketSnapshot>, EngineError> {
        let mut slot = self.slot.lock().await;

        if slot.valid_cycle == Some(cycle_id) {
            if let Some(snapshot) = &slot.last {
                return Ok(snapshot.clone());
            }
        }

        if self.extraction_in_flight.load(Ordering::SeqCst) {
            if let Some(snapshot) = &slot.last {
                debug!(instance_id = %ctx.instance_id, cycle_id, "Extraction in flight, reusing cached snapshot");
                return Ok(snapshot.clone());
            }
        }

        let snapshot = Arc::new(self.analyzer.compute_snapshot(cycle_id, ctx).await?);
        slot.valid_cycle = Some(cycle_id);
        slot.last = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Force the next read to refetch.
    pub async fn invalidate(&self) {
        self.slot.lock().await.valid_cycle = None;
    }

    pub async fn cached(&self) -> Option<Arc<MarketSnapshot>> {
        self.slot.lock().await.last.clone()
    }

    pub fn begin_extraction(&self) -> ExtractionGuard<'_> {
        self.extraction_in_flight.store(true, Ordering::SeqCst);
        ExtractionGuard {
            flag: &self.extraction_in_flight,
        }
    }

    pub fn is_extraction_in_flight(&self) -> bool {
        self.extraction_in_flight.load(Ordering::SeqCst)
    }

    pub fn analyzer(&self) -> &Arc<MarketDataAnalyzer> {
        &self.analyzer
    }

    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        slot.valid_cycle = None;
        slot.last = None;
        info!(fetches = self.analyzer.fetch_count(), "Snapshot cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::mocks::FakeChain;
    use crate::ports::{ChainPositionProvider, CreatePositionRequest};
    use approx::assert_relative_eq;
    use rust_decimal_macros::dec;

    async fn setup() -> (Arc<FakeChain>, MarketSnapshotCache, SnapshotContext) {
        let chain = Arc::new(FakeChain::new(100));
        let created = chain
            .create_position(CreatePositionRequest {
                pool_address: "pool".into(),
                owner: "owner".into(),
                lower_bin: 91,
                upper_bin: 100,
                amount_y: dec!(10),
            })
            .await
            .unwrap();
        let analyzer = Arc::new(MarketDataAnalyzer::new(
            chain.clone(),
            Arc::new(RetryExecutor::without_delays()),
            Arc::new(AccumulatedYieldManager::new()),
        ));
        let ctx = SnapshotContext {
            instance_id: "inst".into(),
            pool_address: "pool".into(),
            position_addresses: vec![created.address.unwrap()],
            position_range: PositionRange::new(91, 100),
            initial_investment: dec!(10),
            created_at: Utc::now(),
            active_bin: None,
            now: Utc::now(),
        };
        (chain, MarketSnapshotCache::new(analyzer), ctx)
    }

    #[tokio::test]
    async fn test_same_cycle_returns_identical_snapshot() {
        let (_chain, cache, ctx) = setup().await;
        cache.begin_cycle(1).await;
        let a = cache.collect_market_data(1, &ctx).await.unwrap();
        let b = cache.collect_market_data(1, &ctx).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.analyzer().fetch_count(), 1);

        cache.begin_cycle(2).await;
        let c = cache.collect_market_data(2, &ctx).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.analyzer().fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_extraction_in_flight_pins_snapshot() {
        let (_chain, cache, ctx) = setup().await;
        let a = cache.collect_market_data(1, &ctx).await.unwrap();
        {
            let _guard = cache.begin_extraction();
            cache.begin_cycle(2).await;
            let b = cache.collect_market_data(2, &ctx).await.unwrap();
            assert!(Arc::ptr_eq(&a, &b));
        }
        assert!(!cache.is_extraction_in_flight());
        let c = cache.collect_market_data(2, &ctx).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_pnl_includes_pending_and_extracted() {
        let (chain, cache, ctx) = setup().await;
        chain.set_pending_fees(dec!(0.01), dec!(0.5));
        let snap = cache.collect_market_data(1, &ctx).await.unwrap();
        // value 10 (all Y), pending 0.01 * 100 + 0.5 = 1.5
        assert_eq!(snap.position_value, dec!(10));
        assert_eq!(snap.pending_yield, dec!(1.5));
        assert_eq!(snap.net_pnl, dec!(1.5));
        assert_relative_eq!(snap.net_pnl_percentage, 15.0);
        assert_eq!(snap.active_bin, 100);
        assert!(snap.benchmark_yield_rates.is_none());
    }

    #[tokio::test]
    async fn test_benchmark_after_second_sample() {
        let (chain, cache, mut ctx) = setup().await;
        cache.collect_market_data(1, &ctx).await.unwrap();

        chain.set_pending_fees(Decimal::ZERO, dec!(0.1));
        ctx.now += Duration::minutes(1);
        cache.begin_cycle(2).await;
        let snap = cache.collect_market_data(2, &ctx).await.unwrap();
        let benchmark = snap.benchmark_yield_rates.unwrap();
        // 0.1 growth over a value of 10
        assert_relative_eq!(benchmark.current_5min, 1.0);
        assert_relative_eq!(benchmark.avg_15min, 1.0);
        assert_eq!(benchmark.bin_offset, 5);
    }

    #[tokio::test]
    async fn test_transient_read_failure_is_retried() {
        let (chain, cache, ctx) = setup().await;
        chain.fail_next_reads(2);
        let snap = cache.collect_market_data(1, &ctx).await.unwrap();
        assert_eq!(snap.active_bin, 100);
    }

    #[test]
    fn test_price_change_windows() {
        let mut history = History::default();
        let t0 = Utc::now();
        history.record_price(t0, 100.0);
        history.record_price(t0 + Duration::minutes(30), 105.0);
        let changes = history.record_price(t0 + Duration::minutes(50), 110.0);
        assert_relative_eq!(changes.last_1h, 10.0);
        assert_relative_eq!(changes.last_15m, 0.0);
    }
}
