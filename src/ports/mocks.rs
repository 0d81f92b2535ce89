//! Scripted fakes for every port.
//!
//! Each fake records its calls and takes controlled responses, so integration
//! tests can drive the executor through exact chain outcomes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use solana_sdk::signature::Keypair;

use super::chain::{
    ChainError, ChainPositionProvider, CreatePositionRequest, HarvestResult, PoolInfo,
    PositionOnChainInfo, PositionOpResult, YieldHarvester,
};
use super::clock::Clock;
use super::events::EventBus;
use super::storage::{StorageError, StrategyStorage};
use super::swap::{SwapOutcome, SwapParams, SwapService};
use super::transaction::{SignatureStatus, TransactionService, TransactionStatus};
use super::wallet::WalletService;
use crate::domain::StrategyInstance;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub const FAKE_TOKEN_X: &str = "So11111111111111111111111111111111111111112";
pub const FAKE_TOKEN_Y: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

#[derive(Debug)]
struct ChainState {
    active_bin: i32,
    pool: PoolInfo,
    positions: HashMap<String, PositionOnChainInfo>,
    create_script: VecDeque<bool>,
    close_script: VecDeque<bool>,
    create_calls: Vec<CreatePositionRequest>,
    close_calls: Vec<String>,
    balances: HashMap<(String, String), u64>,
    failing_reads: u32,
    next_id: u64,
}

/// In-memory DLMM pool with scripted create/close outcomes
#[derive(Debug)]
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(active_bin: i32) -> Self {
        Self {
            state: Mutex::new(ChainState {
                active_bin,
                pool: PoolInfo {
                    token_x: FAKE_TOKEN_X.to_string(),
                    token_y: FAKE_TOKEN_Y.to_string(),
                    active_price: 100.0,
                    bin_step: 10,
                    token_x_decimals: 9,
                    token_y_decimals: 6,
                },
                positions: HashMap::new(),
                create_script: VecDeque::new(),
                close_script: VecDeque::new(),
                create_calls: Vec::new(),
                close_calls: Vec::new(),
                balances: HashMap::new(),
                failing_reads: 0,
                next_id: 0,
            }),
        }
    }

    pub fn set_active_bin(&self, bin: i32) {
        lock(&self.state).active_bin = bin;
    }

    pub fn set_price(&self, price: f64) {
        lock(&self.state).pool.active_price = price;
    }

    /// Outcome of the next create calls, in order; unscripted calls succeed
    pub fn script_creates(&self, outcomes: &[bool]) {
        lock(&self.state).create_script.extend(outcomes.iter().copied());
    }

    /// Outcome of the next close calls, in order; unscripted calls succeed
    pub fn script_closes(&self, outcomes: &[bool]) {
        lock(&self.state).close_script.extend(outcomes.iter().copied());
    }

    /// Unclaimed fees reported on every open position
    pub fn set_pending_fees(&self, fee_x: Decimal, fee_y: Decimal) {
        for info in lock(&self.state).positions.values_mut() {
            info.fee_x = fee_x;
            info.fee_y = fee_y;
        }
    }

    pub fn set_balance(&self, owner: &str, mint: &str, raw: u64) {
        lock(&self.state)
            .balances
            .insert((owner.to_string(), mint.to_string()), raw);
    }

    /// The next `n` active-bin reads fail with a timeout
    pub fn fail_next_reads(&self, n: u32) {
        lock(&self.state).failing_reads = n;
    }

    pub fn create_calls(&self) -> Vec<CreatePositionRequest> {
        lock(&self.state).create_calls.clone()
    }

    pub fn close_calls(&self) -> Vec<String> {
        lock(&self.state).close_calls.clone()
    }

    pub fn open_positions(&self) -> Vec<String> {
        let mut open: Vec<String> = lock(&self.state).positions.keys().cloned().collect();
        open.sort();
        open
    }
}

#[async_trait]
impl ChainPositionProvider for FakeChain {
    async fn get_active_bin(&self, _pool: &str) -> Result<i32, ChainError> {
        let mut state = lock(&self.state);
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(ChainError::Timeout);
        }
        Ok(state.active_bin)
    }

    async fn get_pool_info(&self, _pool: &str) -> Result<PoolInfo, ChainError> {
        Ok(lock(&self.state).pool.clone())
    }

    async fn get_position_on_chain_info(&self, address: &str) -> Result<PositionOnChainInfo, ChainError> {
        lock(&self.state)
            .positions
            .get(address)
            .cloned()
            .ok_or_else(|| ChainError::AccountNotFound(address.to_string()))
    }

    async fn create_position(&self, request: CreatePositionRequest) -> Result<PositionOpResult, ChainError> {
        let mut state = lock(&self.state);
        state.create_calls.push(request.clone());
        if !state.create_script.pop_front().unwrap_or(true) {
            return Ok(PositionOpResult::failed("simulated create failure"));
        }
        state.next_id += 1;
        let address = format!("position-{}", state.next_id);
        state.positions.insert(
            address.clone(),
            PositionOnChainInfo {
                total_x_amount: Decimal::ZERO,
                total_y_amount: request.amount_y,
                fee_x: Decimal::ZERO,
                fee_y: Decimal::ZERO,
                pool_address: request.pool_address.clone(),
            },
        );
        let signature = format!("create-sig-{}", state.next_id);
        Ok(PositionOpResult::ok(&address, &signature))
    }

    async fn close_position(&self, address: &str) -> Result<PositionOpResult, ChainError> {
        let mut state = lock(&self.state);
        state.close_calls.push(address.to_string());
        if !state.close_script.pop_front().unwrap_or(true) {
            return Ok(PositionOpResult::failed("simulated close failure"));
        }
        state.positions.remove(address);
        Ok(PositionOpResult::ok(address, &format!("close-sig-{}", address)))
    }

    async fn get_token_balance(&self, owner: &str, mint: &str) -> Result<u64, ChainError> {
        Ok(lock(&self.state)
            .balances
            .get(&(owner.to_string(), mint.to_string()))
            .copied()
            .unwrap_or(0))
    }
}

/// Harvester returning scripted results, then a default
#[derive(Debug, Default)]
pub struct FakeHarvester {
    scripted: Mutex<VecDeque<Result<HarvestResult, ChainError>>>,
    default: Mutex<HarvestResult>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeHarvester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn returning(result: HarvestResult) -> Self {
        let harvester = Self::default();
        *lock(&harvester.default) = result;
        harvester
    }

    pub fn push_result(&self, result: Result<HarvestResult, ChainError>) {
        lock(&self.scripted).push_back(result);
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl YieldHarvester for FakeHarvester {
    async fn harvest(&self, pool: &str, positions: &[String]) -> Result<HarvestResult, ChainError> {
        lock(&self.calls).push((pool.to_string(), positions.to_vec()));
        match lock(&self.scripted).pop_front() {
            Some(result) => result,
            None => Ok(lock(&self.default).clone()),
        }
    }
}

/// Signature statuses by signature, with a default for unknown ones
#[derive(Debug)]
pub struct FakeTransactions {
    statuses: Mutex<HashMap<String, TransactionStatus>>,
    default: TransactionStatus,
    lookups: AtomicUsize,
}

impl FakeTransactions {
    pub fn new(default: TransactionStatus) -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            default,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn confirming() -> Self {
        Self::new(TransactionStatus::Confirmed)
    }

    pub fn set_status(&self, signature: &str, status: TransactionStatus) {
        lock(&self.statuses).insert(signature.to_string(), status);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionService for FakeTransactions {
    async fn get_signature_status(&self, signature: &str) -> Result<SignatureStatus, ChainError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let status = lock(&self.statuses)
            .get(signature)
            .copied()
            .unwrap_or(self.default);
        Ok(SignatureStatus {
            status,
            slot: (status != TransactionStatus::Unknown).then_some(1),
            error: (status == TransactionStatus::Failed).then(|| "InstructionError".to_string()),
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeSwap {
    calls: Mutex<Vec<SwapParams>>,
    failing: AtomicBool,
}

impl FakeSwap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<SwapParams> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl SwapService for FakeSwap {
    async fn execute_swap(&self, params: SwapParams) -> Result<SwapOutcome, ChainError> {
        let mut calls = lock(&self.calls);
        calls.push(params.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChainError::Rejected("simulated swap failure".into()));
        }
        Ok(SwapOutcome {
            output_amount: params.amount,
            signature: format!("swap-sig-{}", calls.len()),
        })
    }
}

#[derive(Debug)]
pub struct FakeWallet {
    keypair: Arc<Keypair>,
    unlocked: AtomicBool,
    password: String,
}

impl FakeWallet {
    pub fn unlocked() -> Self {
        Self {
            keypair: Arc::new(Keypair::new()),
            unlocked: AtomicBool::new(true),
            password: "password".to_string(),
        }
    }

    pub fn locked(password: &str) -> Self {
        Self {
            keypair: Arc::new(Keypair::new()),
            unlocked: AtomicBool::new(false),
            password: password.to_string(),
        }
    }
}

impl WalletService for FakeWallet {
    fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::SeqCst)
    }

    fn get_current_keypair(&self) -> Option<Arc<Keypair>> {
        self.is_unlocked().then(|| self.keypair.clone())
    }

    fn unlock(&self, password: &str) -> bool {
        let ok = password == self.password;
        if ok {
            self.unlocked.store(true, Ordering::SeqCst);
        }
        ok
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    records: Mutex<HashMap<String, StrategyInstance>>,
    saves: AtomicUsize,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: &str) -> Option<StrategyInstance> {
        lock(&self.records).get(id).cloned()
    }
}

#[async_trait]
impl StrategyStorage for InMemoryStorage {
    async fn load_instances(&self) -> Result<Vec<StrategyInstance>, StorageError> {
        let mut instances: Vec<StrategyInstance> = lock(&self.records).values().cloned().collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn save_instance(&self, instance: &StrategyInstance) -> Result<(), StorageError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        lock(&self.records).insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn delete_instance(&self, id: &str) -> Result<(), StorageError> {
        lock(&self.records).remove(id);
        Ok(())
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now = *now + by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

#[derive(Debug, Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topics(&self) -> Vec<String> {
        lock(&self.events).iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        lock(&self.events).iter().filter(|(t, _)| t == topic).count()
    }

    pub fn last(&self, topic: &str) -> Option<serde_json::Value> {
        lock(&self.events)
            .iter()
            .rev()
            .find(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
    }
}

impl EventBus for RecordingEventBus {
    fn publish(&self, topic: &str, payload: serde_json::Value) {
        lock(&self.events).push((topic.to_string(), payload));
    }
}
