//! Paper DLMM Pool
//!
//! A deterministic, in-memory DLMM pool for `run --paper`. The price follows a
//! seeded log-normal walk that advances one step per active-bin read. Positions
//! accrue fees while the active bin sits inside their range, and every
//! submitted operation gets a signature the paper transaction service confirms.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use statrs::distribution::Normal;
use tracing::{debug, info};

use crate::config::PaperSection;
use crate::ports::{
    to_ui_amount, ChainError, ChainPositionProvider, CreatePositionRequest, HarvestResult,
    PoolInfo, PositionOnChainInfo, PositionOpResult, SignatureStatus, SwapOutcome, SwapParams,
    SwapService, TransactionService, TransactionStatus, YieldHarvester,
};

pub const PAPER_TOKEN_X: &str = "So11111111111111111111111111111111111111112";
pub const PAPER_TOKEN_Y: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
const X_DECIMALS: u8 = 9;
const Y_DECIMALS: u8 = 6;
const TX_FEE_LAMPORTS: u64 = 5_000;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn to_raw(ui: Decimal, decimals: u8) -> u64 {
    (ui * Decimal::from(10u64.pow(decimals as u32)))
        .floor()
        .to_u64()
        .unwrap_or(0)
}

fn decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

#[derive(Debug, Clone)]
struct PaperPosition {
    owner: String,
    pool: String,
    lower_bin: i32,
    upper_bin: i32,
    /// Y deposited, UI amount
    deposit_y: Decimal,
    fee_x: Decimal,
    fee_y: Decimal,
}

impl PaperPosition {
    /// Share of the range the price has fallen through. Those bins now hold X.
    fn converted_fraction(&self, active_bin: i32) -> Decimal {
        let width = (self.upper_bin - self.lower_bin + 1).max(1);
        let converted = (self.upper_bin - active_bin).clamp(0, width);
        Decimal::from(converted) / Decimal::from(width)
    }

    fn amounts(&self, active_bin: i32, price: f64) -> (Decimal, Decimal) {
        let fraction = self.converted_fraction(active_bin);
        let y_converted = self.deposit_y * fraction;
        let price = decimal(price);
        let x = if price.is_zero() {
            Decimal::ZERO
        } else {
            y_converted / price
        };
        (x, self.deposit_y - y_converted)
    }
}

struct PaperState {
    rng: StdRng,
    step: Normal,
    price: f64,
    bin_step: u16,
    fee_rate: Decimal,
    starting_balance: Decimal,
    positions: HashMap<String, PaperPosition>,
    balances: HashMap<(String, String), u64>,
    funded: HashSet<String>,
    signatures: HashMap<String, u64>,
    slot: u64,
}

impl PaperState {
    fn active_bin(&self) -> i32 {
        let base = 1.0 + self.bin_step as f64 / 10_000.0;
        (self.price.ln() / base.ln()).round() as i32
    }

    fn random_id(&mut self, len: usize) -> String {
        let bytes: Vec<u8> = (0..len).map(|_| self.rng.gen()).collect();
        bs58::encode(bytes).into_string()
    }

    fn sign(&mut self) -> String {
        self.slot += 1;
        let signature = self.random_id(64);
        self.signatures.insert(signature.clone(), self.slot);
        signature
    }

    fn fund(&mut self, owner: &str) {
        if self.funded.insert(owner.to_string()) {
            let raw = to_raw(self.starting_balance, Y_DECIMALS);
            *self.balance_mut(owner, PAPER_TOKEN_Y) += raw;
            info!(owner, balance = %self.starting_balance, "Paper wallet funded");
        }
    }

    fn balance_mut(&mut self, owner: &str, mint: &str) -> &mut u64 {
        self.balances
            .entry((owner.to_string(), mint.to_string()))
            .or_insert(0)
    }

    /// One walk step, then fee accrual for in-range positions
    fn advance(&mut self) {
        let shock: f64 = self.rng.sample(self.step);
        self.price = (self.price * shock.exp()).max(f64::MIN_POSITIVE);
        let active = self.active_bin();
        let fee_rate = self.fee_rate;
        for position in self.positions.values_mut() {
            if (position.lower_bin..=position.upper_bin).contains(&active) {
                position.fee_y += position.deposit_y * fee_rate;
            }
        }
    }
}

pub struct PaperChain {
    state: Mutex<PaperState>,
}

impl PaperChain {
    pub fn new(settings: &PaperSection) -> Result<Self, ChainError> {
        let step = Normal::new(0.0, settings.volatility_bps / 10_000.0)
            .map_err(|e| ChainError::Rejected(format!("Invalid paper volatility: {}", e)))?;
        Ok(Self {
            state: Mutex::new(PaperState {
                rng: StdRng::seed_from_u64(settings.seed),
                step,
                price: settings.initial_price,
                bin_step: settings.bin_step,
                fee_rate: decimal(settings.fee_rate_bps / 10_000.0),
                starting_balance: decimal(settings.starting_balance),
                positions: HashMap::new(),
                balances: HashMap::new(),
                funded: HashSet::new(),
                signatures: HashMap::new(),
                slot: 0,
            }),
        })
    }

    pub fn price(&self) -> f64 {
        lock(&self.state).price
    }

    /// Move the pool to a fixed price
    pub fn set_price(&self, price: f64) {
        lock(&self.state).price = price;
    }

    pub fn open_positions(&self) -> usize {
        lock(&self.state).positions.len()
    }

    pub fn balance(&self, owner: &str, mint: &str) -> u64 {
        lock(&self.state)
            .balances
            .get(&(owner.to_string(), mint.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChainPositionProvider for PaperChain {
    async fn get_active_bin(&self, pool: &str) -> Result<i32, ChainError> {
        let mut state = lock(&self.state);
        state.advance();
        let bin = state.active_bin();
        debug!(pool, bin, price = state.price, "Paper active bin");
        Ok(bin)
    }

    async fn get_pool_info(&self, _pool: &str) -> Result<PoolInfo, ChainError> {
        let state = lock(&self.state);
        Ok(PoolInfo {
            token_x: PAPER_TOKEN_X.to_string(),
            token_y: PAPER_TOKEN_Y.to_string(),
            active_price: state.price,
            bin_step: state.bin_step,
            token_x_decimals: X_DECIMALS,
            token_y_decimals: Y_DECIMALS,
        })
    }

    async fn get_position_on_chain_info(&self, address: &str) -> Result<PositionOnChainInfo, ChainError> {
        let state = lock(&self.state);
        let position = state
            .positions
            .get(address)
            .ok_or_else(|| ChainError::AccountNotFound(address.to_string()))?;
        let (x, y) = position.amounts(state.active_bin(), state.price);
        Ok(PositionOnChainInfo {
            total_x_amount: x,
            total_y_amount: y,
            fee_x: position.fee_x,
            fee_y: position.fee_y,
            pool_address: position.pool.clone(),
        })
    }

    async fn create_position(&self, request: CreatePositionRequest) -> Result<PositionOpResult, ChainError> {
        if request.lower_bin > request.upper_bin {
            return Ok(PositionOpResult::failed(format!(
                "Invalid bin range [{}, {}]",
                request.lower_bin, request.upper_bin
            )));
        }

        let mut state = lock(&self.state);
        state.fund(&request.owner);

        let needed = to_raw(request.amount_y, Y_DECIMALS);
        let available = *state.balance_mut(&request.owner, PAPER_TOKEN_Y);
        if needed > available {
            return Ok(PositionOpResult::failed(format!(
                "Insufficient funds: need {}, have {}",
                needed, available
            )));
        }
        *state.balance_mut(&request.owner, PAPER_TOKEN_Y) -= needed;

        let address = state.random_id(32);
        state.positions.insert(
            address.clone(),
            PaperPosition {
                owner: request.owner.clone(),
                pool: request.pool_address.clone(),
                lower_bin: request.lower_bin,
                upper_bin: request.upper_bin,
                deposit_y: request.amount_y,
                fee_x: Decimal::ZERO,
                fee_y: Decimal::ZERO,
            },
        );
        let signature = state.sign();

        info!(
            position = %address,
            lower_bin = request.lower_bin,
            upper_bin = request.upper_bin,
            amount_y = %request.amount_y,
            "Paper position created"
        );
        Ok(PositionOpResult::ok(&address, &signature))
    }

    async fn close_position(&self, address: &str) -> Result<PositionOpResult, ChainError> {
        let mut state = lock(&self.state);
        let Some(position) = state.positions.remove(address) else {
            return Ok(PositionOpResult::failed(format!("Position {} not found", address)));
        };

        let (x, y) = position.amounts(state.active_bin(), state.price);
        *state.balance_mut(&position.owner, PAPER_TOKEN_X) +=
            to_raw(x + position.fee_x, X_DECIMALS);
        *state.balance_mut(&position.owner, PAPER_TOKEN_Y) +=
            to_raw(y + position.fee_y, Y_DECIMALS);
        let signature = state.sign();

        info!(position = %address, x = %x, y = %y, "Paper position closed");
        Ok(PositionOpResult::ok(address, &signature))
    }

    async fn get_token_balance(&self, owner: &str, mint: &str) -> Result<u64, ChainError> {
        Ok(self.balance(owner, mint))
    }
}

#[async_trait]
impl YieldHarvester for PaperChain {
    async fn harvest(&self, pool: &str, positions: &[String]) -> Result<HarvestResult, ChainError> {
        let mut state = lock(&self.state);
        let mut harvested_x = 0u64;
        let mut harvested_y = 0u64;

        for address in positions {
            let position = state
                .positions
                .get_mut(address)
                .ok_or_else(|| ChainError::AccountNotFound(address.clone()))?;
            let x = to_raw(position.fee_x, X_DECIMALS);
            let y = to_raw(position.fee_y, Y_DECIMALS);
            position.fee_x = Decimal::ZERO;
            position.fee_y = Decimal::ZERO;
            let owner = position.owner.clone();

            *state.balance_mut(&owner, PAPER_TOKEN_X) += x;
            *state.balance_mut(&owner, PAPER_TOKEN_Y) += y;
            harvested_x += x;
            harvested_y += y;
        }

        let signature = state.sign();
        debug!(pool, harvested_x, harvested_y, %signature, "Paper harvest");
        Ok(HarvestResult {
            signature: Some(signature),
            harvested_x,
            harvested_y,
            fee_lamports: TX_FEE_LAMPORTS,
        })
    }
}

#[async_trait]
impl SwapService for PaperChain {
    async fn execute_swap(&self, params: SwapParams) -> Result<SwapOutcome, ChainError> {
        let mut state = lock(&self.state);
        let price = decimal(state.price);
        let slippage = Decimal::ONE - Decimal::new(params.slippage_bps as i64, 4) / Decimal::TWO;

        let output_ui = match (params.input_mint.as_str(), params.output_mint.as_str()) {
            (PAPER_TOKEN_X, PAPER_TOKEN_Y) => to_ui_amount(params.amount, X_DECIMALS) * price * slippage,
            (PAPER_TOKEN_Y, PAPER_TOKEN_X) if !price.is_zero() => {
                to_ui_amount(params.amount, Y_DECIMALS) / price * slippage
            }
            _ => {
                return Err(ChainError::Rejected(format!(
                    "No paper route {} -> {}",
                    params.input_mint, params.output_mint
                )))
            }
        };
        let output_decimals = if params.output_mint == PAPER_TOKEN_X { X_DECIMALS } else { Y_DECIMALS };
        let output_amount = to_raw(output_ui, output_decimals);

        let owner = params.user_public_key.as_str();
        let available = *state.balance_mut(owner, &params.input_mint);
        if params.amount > available {
            return Err(ChainError::InsufficientFunds {
                needed: params.amount,
                available,
            });
        }
        *state.balance_mut(owner, &params.input_mint) -= params.amount;
        *state.balance_mut(owner, &params.output_mint) += output_amount;
        let signature = state.sign();

        info!(amount = params.amount, output_amount, %signature, "Paper swap");
        Ok(SwapOutcome {
            output_amount,
            signature,
        })
    }
}

#[async_trait]
impl TransactionService for PaperChain {
    async fn get_signature_status(&self, signature: &str) -> Result<SignatureStatus, ChainError> {
        let state = lock(&self.state);
        Ok(match state.signatures.get(signature) {
            Some(slot) => SignatureStatus {
                status: TransactionStatus::Confirmed,
                slot: Some(*slot),
                error: None,
            },
            None => SignatureStatus::unknown(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const OWNER: &str = "owner";

    fn calm() -> PaperSection {
        PaperSection {
            volatility_bps: 0.0001,
            fee_rate_bps: 10.0,
            ..PaperSection::default()
        }
    }

    fn request(chain_bin: i32, amount: Decimal) -> CreatePositionRequest {
        CreatePositionRequest {
            pool_address: "pool".into(),
            owner: OWNER.into(),
            lower_bin: chain_bin - 5,
            upper_bin: chain_bin + 5,
            amount_y: amount,
        }
    }

    #[tokio::test]
    async fn test_same_seed_same_walk() {
        let settings = PaperSection::default();
        let a = PaperChain::new(&settings).unwrap();
        let b = PaperChain::new(&settings).unwrap();
        for _ in 0..20 {
            assert_eq!(a.get_active_bin("p").await.unwrap(), b.get_active_bin("p").await.unwrap());
        }
        assert_eq!(a.price(), b.price());
    }

    #[tokio::test]
    async fn test_create_debits_and_close_credits() {
        let chain = PaperChain::new(&calm()).unwrap();
        let bin = chain.get_active_bin("pool").await.unwrap();

        let created = chain.create_position(request(bin, dec!(100))).await.unwrap();
        assert!(created.success);
        assert_eq!(chain.balance(OWNER, PAPER_TOKEN_Y), to_raw(dec!(900), Y_DECIMALS));
        assert_eq!(chain.open_positions(), 1);

        let base58 = regex::Regex::new(r"^[1-9A-HJ-NP-Za-km-z]+$").unwrap();
        let address = created.address.unwrap();
        assert!(base58.is_match(&address));
        assert!(base58.is_match(created.signature.as_deref().unwrap()));

        let closed = chain.close_position(&address).await.unwrap();
        assert!(closed.success);
        assert_eq!(chain.open_positions(), 0);
        assert!(!chain.close_position(&address).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_insufficient_funds_fails_create() {
        let chain = PaperChain::new(&calm()).unwrap();
        let result = chain.create_position(request(0, dec!(5000))).await.unwrap();
        assert!(!result.success);
        assert_eq!(chain.open_positions(), 0);
    }

    #[tokio::test]
    async fn test_fees_accrue_in_range_and_harvest() {
        let chain = PaperChain::new(&calm()).unwrap();
        let bin = chain.get_active_bin("pool").await.unwrap();
        let address = chain
            .create_position(request(bin, dec!(100)))
            .await
            .unwrap()
            .address
            .unwrap();

        for _ in 0..3 {
            chain.get_active_bin("pool").await.unwrap();
        }
        let info = chain.get_position_on_chain_info(&address).await.unwrap();
        assert!(info.fee_y > Decimal::ZERO);

        let harvest = chain.harvest("pool", &[address.clone()]).await.unwrap();
        assert!(harvest.harvested_y > 0);
        let status = chain
            .get_signature_status(harvest.signature.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(status.status, TransactionStatus::Confirmed);

        let after = chain.get_position_on_chain_info(&address).await.unwrap();
        assert_eq!(after.fee_y, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_price_drop_converts_to_x_and_swaps_back() {
        let chain = PaperChain::new(&calm()).unwrap();
        let bin = chain.get_active_bin("pool").await.unwrap();
        let address = chain
            .create_position(request(bin, dec!(100)))
            .await
            .unwrap()
            .address
            .unwrap();

        chain.set_price(chain.price() * 0.9);
        let info = chain.get_position_on_chain_info(&address).await.unwrap();
        assert_eq!(info.total_y_amount, Decimal::ZERO);
        assert!(info.total_x_amount > Decimal::ZERO);

        chain.close_position(&address).await.unwrap();
        let x = chain.balance(OWNER, PAPER_TOKEN_X);
        assert!(x > 0);

        let outcome = chain
            .execute_swap(SwapParams {
                input_mint: PAPER_TOKEN_X.into(),
                output_mint: PAPER_TOKEN_Y.into(),
                amount: x,
                slippage_bps: 100,
                user_public_key: OWNER.into(),
            })
            .await
            .unwrap();
        assert!(outcome.output_amount > 0);
        assert_eq!(chain.balance(OWNER, PAPER_TOKEN_X), 0);
    }

    #[tokio::test]
    async fn test_unknown_signature() {
        let chain = PaperChain::new(&calm()).unwrap();
        let status = chain.get_signature_status("nope").await.unwrap();
        assert_eq!(status.status, TransactionStatus::Unknown);
    }
}
