//! CLI Command Handlers
//!
//! Implementation of all CLI commands for the DLMM keeper.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use solana_sdk::signature::Keypair;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::events::BroadcastEventBus;
use crate::adapters::jupiter::{JupiterClient, JupiterConfig, JupiterSwapService};
use crate::adapters::paper::PaperChain;
use crate::adapters::solana::{KeypairWallet, SolanaClient, SolanaTransactionService};
use crate::adapters::storage::JsonFileStorage;
use crate::application::retry::SWAP;
use crate::application::{FactorySettings, RetryExecutor, StrategyManager, WorkflowPorts};
use crate::config::{load_instance_config, Config};
use crate::domain::{InstanceStatus, StrategyInstance, SwapLockRegistry};
use crate::ports::{
    ChainPositionProvider, StrategyStorage, SwapParams, SwapService, WalletService, YieldHarvester,
};

/// dlmm-keeper - automated DLMM liquidity positions on Solana
#[derive(Parser, Debug)]
#[command(
    name = "dlmm-keeper",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = "Automated DLMM liquidity keeper for Solana",
    long_about = "dlmm-keeper runs per-instance DLMM position lifecycles: creation, \
                  out-of-range recreation, fee extraction and smart stop-loss."
)]
pub struct CliApp {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true, default_value = "config.toml")]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every stored instance until Ctrl+C
    Run(RunCmd),

    /// Register a new instance from an instance TOML file
    Add(AddCmd),

    /// List stored instances
    List,

    /// Delete a stored instance
    Remove(RemoveCmd),

    /// Verify a transaction signature
    Verify(VerifyCmd),

    /// Swap a wallet token balance through Jupiter
    Liquidate(LiquidateCmd),
}

#[derive(Parser, Debug)]
pub struct RunCmd {
    /// Run against the simulated pool (no real transactions)
    #[arg(short, long)]
    pub paper: bool,
}

#[derive(Parser, Debug)]
pub struct AddCmd {
    /// Display name for the instance
    #[arg(short, long)]
    pub name: String,

    /// Instance definition (`type = "chain_position"` plus its fields)
    #[arg(short, long, value_name = "FILE")]
    pub instance: PathBuf,
}

#[derive(Parser, Debug)]
pub struct RemoveCmd {
    /// Instance id
    #[arg(value_name = "ID")]
    pub id: String,
}

#[derive(Parser, Debug)]
pub struct VerifyCmd {
    /// Base58 transaction signature
    #[arg(value_name = "SIGNATURE")]
    pub signature: String,
}

#[derive(Parser, Debug)]
pub struct LiquidateCmd {
    /// Mint to sell
    #[arg(long, value_name = "MINT")]
    pub input_mint: String,

    /// Mint to receive
    #[arg(long, value_name = "MINT")]
    pub output_mint: String,

    /// Raw amount of the input mint (defaults to the whole wallet balance)
    #[arg(long)]
    pub amount: Option<u64>,

    /// Slippage tolerance in basis points
    #[arg(long, default_value_t = 100)]
    pub slippage_bps: u16,
}

/// Execute the CLI command
pub async fn execute(app: CliApp, config: Config) -> Result<()> {
    match app.command {
        Command::Run(cmd) => run_command(cmd, &config).await,
        Command::Add(cmd) => add_command(cmd, &config).await,
        Command::List => list_command(&config).await,
        Command::Remove(cmd) => remove_command(cmd, &config).await,
        Command::Verify(cmd) => verify_command(cmd, &config).await,
        Command::Liquidate(cmd) => liquidate_command(cmd, &config).await,
    }
}

fn storage(config: &Config) -> JsonFileStorage {
    JsonFileStorage::new(config.storage.data_dir())
}

/// Use the configured keypair when it unlocks, otherwise a throwaway one
fn paper_wallet(keypair_path: &Path) -> KeypairWallet {
    if keypair_path.exists() {
        let wallet = KeypairWallet::from_env(keypair_path);
        let password = std::env::var("WALLET_PASSWORD").unwrap_or_default();
        if wallet.unlock(&password) {
            return wallet;
        }
    }
    warn!(
        "Wallet not available at '{}' - using random wallet for paper trading",
        keypair_path.display()
    );
    KeypairWallet::ephemeral(Keypair::new())
}

/// Ports backed by the simulated pool
pub fn build_paper_ports(config: &Config) -> Result<(WorkflowPorts, Arc<BroadcastEventBus>)> {
    let chain = Arc::new(PaperChain::new(&config.paper).context("Failed to create paper pool")?);
    let wallet: Arc<dyn WalletService> = Arc::new(paper_wallet(&config.solana.get_keypair_path()));
    let events = Arc::new(BroadcastEventBus::default());

    let ports = WorkflowPorts {
        chain: chain.clone(),
        harvester: chain.clone(),
        transactions: chain.clone(),
        swap: chain,
        wallet,
        events: events.clone(),
        swap_locks: Arc::new(SwapLockRegistry::new()),
        retry: Arc::new(RetryExecutor::new()),
    };
    Ok((ports, events))
}

fn solana_client(config: &Config) -> SolanaClient {
    SolanaClient::with_commitment(config.solana.get_rpc_url(), &config.solana.commitment)
}

/// Keypair wallet unlocked with `WALLET_PASSWORD`
pub fn live_wallet(config: &Config) -> Result<KeypairWallet> {
    let path = config.solana.get_keypair_path();
    let wallet = KeypairWallet::from_env(path.clone());
    let password = std::env::var("WALLET_PASSWORD").unwrap_or_default();
    if !wallet.unlock(&password) {
        bail!("Failed to unlock wallet at {}", path.display());
    }
    Ok(wallet)
}

pub fn jupiter_swap_service(
    config: &Config,
    solana: SolanaClient,
    wallet: Arc<dyn WalletService>,
) -> Result<JupiterSwapService> {
    let client = JupiterClient::with_config(JupiterConfig::from_section(&config.jupiter))
        .map_err(|e| anyhow!("Failed to create Jupiter client: {}", e))?;
    Ok(JupiterSwapService::new(
        client,
        solana,
        wallet,
        config.jupiter.clone(),
    ))
}

/// Live ports around a DLMM provider supplied by the embedding program.
/// Signatures verify over Solana RPC and residual swaps route through Jupiter.
pub fn build_live_ports(
    config: &Config,
    chain: Arc<dyn ChainPositionProvider>,
    harvester: Arc<dyn YieldHarvester>,
    wallet: Arc<dyn WalletService>,
) -> Result<(WorkflowPorts, Arc<BroadcastEventBus>)> {
    let solana = solana_client(config);
    let swap = jupiter_swap_service(config, solana.clone(), wallet.clone())?;
    let events = Arc::new(BroadcastEventBus::default());

    let ports = WorkflowPorts {
        chain,
        harvester,
        transactions: Arc::new(SolanaTransactionService::new(solana)),
        swap: Arc::new(swap),
        wallet,
        events: events.clone(),
        swap_locks: Arc::new(SwapLockRegistry::new()),
        retry: Arc::new(RetryExecutor::new()),
    };
    Ok((ports, events))
}

pub fn factory_settings(config: &Config) -> FactorySettings {
    FactorySettings {
        max_instances_warning: config.engine.max_instances_warning,
        stale_after: Duration::from_secs(config.engine.stale_after_secs),
        ..FactorySettings::default()
    }
}

/// Start every stored instance that was CREATED or RUNNING. Returns the started ids.
pub async fn start_stored_instances(manager: &StrategyManager) -> Result<Vec<String>> {
    manager
        .load_from_storage()
        .await
        .context("Failed to load stored instances")?;

    let mut started = Vec::new();
    for instance in manager.list_instances().await {
        if !matches!(instance.status, InstanceStatus::Created | InstanceStatus::Running) {
            continue;
        }
        match manager.start_instance(&instance.id).await {
            Ok(_) => started.push(instance.id),
            Err(e) => warn!(instance_id = %instance.id, error = %e, "Failed to start instance"),
        }
    }
    Ok(started)
}

/// Handle run command
async fn run_command(cmd: RunCmd, config: &Config) -> Result<()> {
    if !cmd.paper {
        bail!(
            "Live mode needs an on-chain DLMM provider, which this build does not include.\n\
             Embed the keeper with `build_live_ports`, or run with --paper to use the simulated pool."
        );
    }
    warn!("Running in PAPER mode - no real transactions");

    let (ports, events) = build_paper_ports(config)?;
    let storage: Arc<dyn StrategyStorage> = Arc::new(storage(config));
    let manager = StrategyManager::with_settings(ports, storage, factory_settings(config));

    let started = start_stored_instances(&manager).await?;
    info!(count = started.len(), "Instances started");
    if started.is_empty() {
        warn!("No instances to run - add one with `dlmm-keeper add`");
    }

    let cancel = CancellationToken::new();
    let logger = events.spawn_logger(cancel.clone());
    let sweeper = manager.spawn_sweeper(
        Duration::from_secs(config.engine.sweep_interval_secs),
        Duration::from_secs(config.engine.idle_threshold_secs),
        cancel.clone(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutdown requested");

    let health = manager.health_check();
    if !health.healthy {
        warn!(warnings = ?health.warnings, "Service factory unhealthy at shutdown");
    }

    cancel.cancel();
    manager.shutdown().await;
    let _ = tokio::join!(logger, sweeper);
    info!("Stopped");
    Ok(())
}

/// Handle add command
async fn add_command(cmd: AddCmd, config: &Config) -> Result<()> {
    let instance_config = load_instance_config(&cmd.instance)
        .with_context(|| format!("Invalid instance file {}", cmd.instance.display()))?;
    let instance = StrategyInstance::new(&cmd.name, instance_config);
    storage(config)
        .save_instance(&instance)
        .await
        .context("Failed to store instance")?;

    println!("Added instance {} ({})", instance.id, instance.name);
    Ok(())
}

/// Handle list command
async fn list_command(config: &Config) -> Result<()> {
    let instances = storage(config)
        .load_instances()
        .await
        .context("Failed to load instances")?;

    if instances.is_empty() {
        println!("No instances stored in {}", config.storage.data_dir().display());
        return Ok(());
    }

    println!("{:<38} {:<20} {:<16} {:<8} {}", "ID", "NAME", "TYPE", "STATUS", "CREATED");
    for instance in &instances {
        println!("{}", format_instance_row(instance));
        if let Some(ref error) = instance.error {
            println!("    error: {}", error);
        }
    }
    Ok(())
}

pub fn format_instance_row(instance: &StrategyInstance) -> String {
    let status = format!("{:?}", instance.status).to_uppercase();
    format!(
        "{:<38} {:<20} {:<16} {:<8} {}",
        instance.id,
        instance.name,
        instance.strategy_type.to_string(),
        status,
        instance.created_at.format("%Y-%m-%d %H:%M:%S")
    )
}

/// Handle remove command
async fn remove_command(cmd: RemoveCmd, config: &Config) -> Result<()> {
    storage(config)
        .delete_instance(&cmd.id)
        .await
        .with_context(|| format!("Failed to delete instance {}", cmd.id))?;
    println!("Removed instance {}", cmd.id);
    Ok(())
}

/// Handle verify command
async fn verify_command(cmd: VerifyCmd, config: &Config) -> Result<()> {
    let service = SolanaTransactionService::new(solana_client(config));
    let result = RetryExecutor::new()
        .verify_transaction(&service, &cmd.signature)
        .await;

    println!("Signature: {}", cmd.signature);
    println!("  Status:  {:?}", result.status);
    if let Some(slot) = result.slot {
        println!("  Slot:    {}", slot);
    }
    if let Some(ref error) = result.error {
        println!("  Error:   {}", error);
    }

    if !result.success {
        bail!("Transaction {} not confirmed", cmd.signature);
    }
    Ok(())
}

/// Handle liquidate command
async fn liquidate_command(cmd: LiquidateCmd, config: &Config) -> Result<()> {
    let wallet: Arc<dyn WalletService> = Arc::new(live_wallet(config)?);
    let owner = wallet.public_key().context("Wallet is locked")?;
    let solana = solana_client(config);

    let amount = match cmd.amount {
        Some(amount) => amount,
        None => solana
            .get_token_balance(&owner, &cmd.input_mint)
            .await
            .map_err(|e| anyhow!("Failed to read {} balance: {}", cmd.input_mint, e))?,
    };
    if amount == 0 {
        println!("No {} balance to liquidate", cmd.input_mint);
        return Ok(());
    }

    let swap = jupiter_swap_service(config, solana.clone(), wallet)?;
    let retry = RetryExecutor::new();
    let params = SwapParams {
        input_mint: cmd.input_mint.clone(),
        output_mint: cmd.output_mint.clone(),
        amount,
        slippage_bps: cmd.slippage_bps,
        user_public_key: owner,
    };
    let outcome = retry
        .run(SWAP, || swap.execute_swap(params.clone()))
        .await
        .map_err(|e| anyhow!("Swap failed: {}", e))?;
    info!(signature = %outcome.signature, amount, "Liquidation submitted");

    let verification = retry
        .verify_transaction(&SolanaTransactionService::new(solana), &outcome.signature)
        .await;
    println!("Swapped {} {} -> {} {}", amount, cmd.input_mint, outcome.output_amount, cmd.output_mint);
    println!("  Signature: {}", outcome.signature);
    println!("  Status:    {:?}", verification.status);

    if !verification.success {
        bail!("Swap {} not confirmed", outcome.signature);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::storage::JsonFileStorage;
    use crate::config::{
        EngineSection, JupiterSection, LoggingSection, PaperSection, SolanaSection, StorageSection,
    };
    use crate::ports::mocks::{FakeChain, FakeHarvester};
    use crate::strategy::{ChainPositionConfig, InstanceConfig};
    use tempfile::TempDir;

    fn test_config(data_dir: &Path) -> Config {
        Config {
            engine: EngineSection::default(),
            solana: SolanaSection {
                rpc_url: "http://127.0.0.1:8899".to_string(),
                commitment: "confirmed".to_string(),
                keypair_path: "/nonexistent/id.json".to_string(),
            },
            jupiter: JupiterSection::default(),
            storage: StorageSection {
                data_dir: data_dir.display().to_string(),
            },
            logging: LoggingSection::default(),
            paper: PaperSection::default(),
        }
    }

    #[test]
    fn test_cli_app_parse_run_with_paper() {
        let args = vec!["dlmm-keeper", "run", "--config", "test.toml", "--paper"];
        let app = CliApp::try_parse_from(args).unwrap();

        assert_eq!(app.config, PathBuf::from("test.toml"));
        match app.command {
            Command::Run(cmd) => assert!(cmd.paper),
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_app_default_config() {
        let app = CliApp::try_parse_from(vec!["dlmm-keeper", "list"]).unwrap();
        assert_eq!(app.config, PathBuf::from("config.toml"));
        assert!(matches!(app.command, Command::List));
        assert!(!app.verbose);
    }

    #[test]
    fn test_cli_app_parse_add() {
        let args = vec![
            "dlmm-keeper", "add", "--name", "sol-usdc", "--instance", "sol.toml", "--debug",
        ];
        let app = CliApp::try_parse_from(args).unwrap();

        assert!(app.debug);
        match app.command {
            Command::Add(cmd) => {
                assert_eq!(cmd.name, "sol-usdc");
                assert_eq!(cmd.instance, PathBuf::from("sol.toml"));
            }
            _ => panic!("Expected Add command"),
        }
    }

    #[test]
    fn test_cli_app_parse_remove_and_verify() {
        let app = CliApp::try_parse_from(vec!["dlmm-keeper", "remove", "abc"]).unwrap();
        match app.command {
            Command::Remove(cmd) => assert_eq!(cmd.id, "abc"),
            _ => panic!("Expected Remove command"),
        }

        let app = CliApp::try_parse_from(vec!["dlmm-keeper", "verify", "5sig"]).unwrap();
        match app.command {
            Command::Verify(cmd) => assert_eq!(cmd.signature, "5sig"),
            _ => panic!("Expected Verify command"),
        }
    }

    #[test]
    fn test_cli_app_parse_liquidate() {
        let args = vec![
            "dlmm-keeper", "liquidate", "--input-mint", "X", "--output-mint", "Y", "--amount", "500",
        ];
        let app = CliApp::try_parse_from(args).unwrap();
        match app.command {
            Command::Liquidate(cmd) => {
                assert_eq!(cmd.input_mint, "X");
                assert_eq!(cmd.output_mint, "Y");
                assert_eq!(cmd.amount, Some(500));
                assert_eq!(cmd.slippage_bps, 100);
            }
            _ => panic!("Expected Liquidate command"),
        }
    }

    #[tokio::test]
    async fn test_liquidate_needs_wallet() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let cmd = LiquidateCmd {
            input_mint: "X".into(),
            output_mint: "Y".into(),
            amount: Some(1),
            slippage_bps: 100,
        };
        let err = liquidate_command(cmd, &config).await.unwrap_err();
        assert!(err.to_string().contains("Failed to unlock wallet"));
    }

    #[tokio::test]
    async fn test_live_ports_run_instances_over_plugged_provider() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let chain = Arc::new(FakeChain::new(100));
        let wallet: Arc<dyn WalletService> = Arc::new(KeypairWallet::ephemeral(Keypair::new()));

        let (ports, _events) =
            build_live_ports(&config, chain.clone(), Arc::new(FakeHarvester::new()), wallet).unwrap();
        let manager = StrategyManager::with_settings(
            ports,
            Arc::new(JsonFileStorage::new(dir.path())),
            factory_settings(&config),
        );
        let id = manager
            .create_instance(
                "live",
                InstanceConfig::ChainPosition(ChainPositionConfig::for_pool("Pool")),
            )
            .await
            .unwrap()
            .id;
        manager.start_instance(&id).await.unwrap();
        assert_eq!(chain.open_positions().len(), 2);
        manager.shutdown().await;
    }

    #[test]
    fn test_add_requires_name() {
        assert!(CliApp::try_parse_from(vec!["dlmm-keeper", "add", "--instance", "x.toml"]).is_err());
    }

    #[tokio::test]
    async fn test_live_run_refused() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let err = run_command(RunCmd { paper: false }, &config).await.unwrap_err();
        assert!(err.to_string().contains("--paper"));
    }

    #[tokio::test]
    async fn test_paper_ports_start_stored_instances() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());

        let store = JsonFileStorage::new(dir.path());
        let created = StrategyInstance::new(
            "paper",
            InstanceConfig::ChainPosition(ChainPositionConfig::for_pool("PaperPool")),
        );
        let mut stopped = StrategyInstance::new(
            "old",
            InstanceConfig::ChainPosition(ChainPositionConfig::for_pool("PaperPool")),
        );
        stopped.mark_stopped();
        store.save_instance(&created).await.unwrap();
        store.save_instance(&stopped).await.unwrap();

        let (ports, _events) = build_paper_ports(&config).unwrap();
        assert!(ports.wallet.is_unlocked());
        let manager = StrategyManager::with_settings(
            ports,
            Arc::new(JsonFileStorage::new(dir.path())),
            factory_settings(&config),
        );

        let started = start_stored_instances(&manager).await.unwrap();
        assert_eq!(started, vec![created.id.clone()]);

        let reloaded = store.load_instances().await.unwrap();
        let record = reloaded.iter().find(|i| i.id == created.id).unwrap();
        assert_eq!(record.status, InstanceStatus::Running);

        manager.shutdown().await;
    }

    #[test]
    fn test_format_instance_row() {
        let instance = StrategyInstance::new(
            "row",
            InstanceConfig::ChainPosition(ChainPositionConfig::for_pool("Pool")),
        );
        let row = format_instance_row(&instance);
        assert!(row.contains("chain_position"));
        assert!(row.contains("CREATED"));
    }
}
