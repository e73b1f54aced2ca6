//! `trader-operator` — operator CLI for the trader service.
//!
//! Subcommands cover the staking lifecycle (stake/unstake reconciliation,
//! reward claiming, program selection), the local mech events cache, and
//! the service report. Guard violations and transaction failures exit
//! non-zero; this is the only place errors become exit codes.

use std::io::Write;
use std::path::{Path, PathBuf};

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trader_operator_lib::catalog::{NO_STAKING_PROGRAM_ID, StakingCatalog};
use trader_operator_lib::config::{DEFAULT_CHAIN_ID, OperatorConfig};
use trader_operator_lib::env_store::{self, EnvFile};
use trader_operator_lib::mech_events::{MechContract, MechEventKind, MechEventMirror};
use trader_operator_lib::reconciler::{AutoConfirm, Confirm, Reconciler};
use trader_operator_lib::report::{self, ReportAccounts};
use trader_operator_lib::store::MechEventStore;
use trader_operator_lib::trades::{self, SubgraphClient};
use trader_runtime::chain::ChainClient;
use trader_runtime::error::OperatorError;
use trader_runtime::types::{wei_to_olas, wei_to_wxdai, wei_to_xdai};

/// Default mech contract scanned by `sync-events`.
const DEFAULT_MECH_CONTRACT: &str = "0x77af31De935740567Cf4fF1986D04B2c964A786a";
/// Block the default mech contract was deployed at.
const DEFAULT_MECH_EARLIEST_BLOCK: u64 = 27_911_296;

#[derive(Parser)]
#[command(
    name = "trader-operator",
    version,
    about = "Operate the trader service: staking, claiming, event sync, reports"
)]
struct Cli {
    /// Directory holding the .env selection file and the events cache.
    #[arg(long, global = true, default_value = ".trader_runner")]
    store_dir: PathBuf,

    /// Chain id of the target ledger.
    #[arg(long, global = true, default_value_t = DEFAULT_CHAIN_ID)]
    chain_id: u64,

    /// Skip interactive confirmations (checkpoint warnings, selections).
    #[arg(long, global = true)]
    unattended: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stake or unstake the service based on its on-chain state.
    Stake {
        /// The on-chain service id.
        service_id: u64,
        /// The service registry contract address.
        service_registry_address: Address,
        /// The staking contract address of the target program.
        staking_contract_address: Address,
        /// Path to the owner key file (raw hex or JSON keystore).
        owner_private_key_path: PathBuf,
        /// RPC for the Gnosis chain.
        rpc: String,
        /// True to drive toward unstaked instead of staked.
        #[arg(value_parser = clap::value_parser!(bool))]
        unstake: bool,
        /// Key file password (required for JSON keystores).
        #[arg(long)]
        password: Option<String>,
    },

    /// Claim accrued staking rewards while remaining staked.
    Claim {
        service_id: u64,
        staking_contract_address: Address,
        owner_private_key_path: PathBuf,
        rpc: String,
        #[arg(long)]
        password: Option<String>,
    },

    /// Select a staking program and populate the .env file.
    ChooseStaking {
        rpc: String,
        /// Program id to select without prompting.
        #[arg(long)]
        program: Option<String>,
        /// Reset USE_STAKING and STAKING_PROGRAM before selecting.
        #[arg(long)]
        reset: bool,
    },

    /// Incrementally mirror on-chain mech events into the local cache.
    SyncEvents {
        /// Sender (service Safe) address whose events are mirrored.
        sender: Address,
        rpc: String,
        /// Mech contract to scan.
        #[arg(long, default_value = DEFAULT_MECH_CONTRACT)]
        mech_contract: Address,
        /// Block to start scanning from on a fresh cache.
        #[arg(long, default_value_t = DEFAULT_MECH_EARLIEST_BLOCK)]
        earliest_block: u64,
        /// Mirror Deliver events instead of Request events.
        #[arg(long)]
        deliver: bool,
    },

    /// Print a report of the service's financial state.
    Report {
        service_id: u64,
        /// Agent EOA address.
        agent_address: Address,
        /// Service Safe address (the trade creator).
        safe_address: Address,
        /// Owner/operator address.
        operator_address: Address,
        rpc: String,
    },
}

fn setup_log() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Load the owner signer from a raw hex file or a JSON keystore. Key and
/// decryption errors surface here, before any chain interaction.
fn load_signer(path: &Path, password: Option<&str>) -> Result<PrivateKeySigner, OperatorError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| OperatorError::Key(format!("cannot read key file {}: {e}", path.display())))?;
    let trimmed = raw.trim();

    if trimmed.starts_with('{') {
        let password = password.ok_or_else(|| {
            OperatorError::Key("key file is a JSON keystore; --password is required".to_string())
        })?;
        return PrivateKeySigner::decrypt_keystore(path, password)
            .map_err(|e| OperatorError::Key(format!("keystore decryption failed: {e}")));
    }

    trimmed
        .parse()
        .map_err(|e| OperatorError::Key(format!("invalid private key: {e}")))
}

struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{prompt} (yes/no): ");
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "yes" | "y")
    }
}

/// Map a target staking contract address back to its program id.
fn program_for_address(
    catalog: &StakingCatalog,
    address: Address,
) -> Result<String, OperatorError> {
    catalog
        .programs()
        .iter()
        .find(|p| p.contract_address == address)
        .map(|p| p.program_id.to_string())
        .ok_or_else(|| OperatorError::UnknownProgram(format!("{address:#x}")))
}

fn operator_config(
    cli: &Cli,
    rpc: &str,
    service_id: u64,
    service_registry: Address,
    target_program: &str,
    key_path: &Path,
    password: Option<String>,
) -> OperatorConfig {
    OperatorConfig {
        rpc_url: rpc.to_string(),
        chain_id: cli.chain_id,
        service_id,
        service_registry,
        target_program: target_program.to_string(),
        key_path: key_path.to_path_buf(),
        password,
        attended: !cli.unattended,
        tx_settings: trader_runtime::chain::TxSettings::default(),
        store_dir: cli.store_dir.clone(),
        excluded_programs: OperatorConfig::default_excluded_programs(),
    }
}

async fn run(cli: Cli) -> Result<(), OperatorError> {
    let catalog = StakingCatalog::default();

    match &cli.command {
        Commands::Stake {
            service_id,
            service_registry_address,
            staking_contract_address,
            owner_private_key_path,
            rpc,
            unstake,
            password,
        } => {
            let signer = load_signer(owner_private_key_path, password.as_deref())?;
            let client = ChainClient::new(rpc, signer, cli.chain_id)?;

            let target = if *unstake {
                NO_STAKING_PROGRAM_ID.to_string()
            } else {
                program_for_address(&catalog, *staking_contract_address)?
            };
            let config = operator_config(
                &cli,
                rpc,
                *service_id,
                *service_registry_address,
                &target,
                owner_private_key_path,
                password.clone(),
            );

            let reconciler = Reconciler {
                client: &client,
                catalog: &catalog,
                config: &config,
            };
            let confirm: Box<dyn Confirm> = if config.attended {
                Box::new(StdinConfirm)
            } else {
                Box::new(AutoConfirm)
            };
            let outcome = reconciler.reconcile(&target, confirm.as_ref()).await?;

            for tx in &outcome.executed {
                println!("{}: {}", tx.kind, tx.tx_hash);
            }
            if let Some(note) = &outcome.note {
                println!("{note}");
            }
            Ok(())
        }

        Commands::Claim {
            service_id,
            staking_contract_address,
            owner_private_key_path,
            rpc,
            password,
        } => {
            let signer = load_signer(owner_private_key_path, password.as_deref())?;
            let client = ChainClient::new(rpc, signer, cli.chain_id)?;
            let program = program_for_address(&catalog, *staking_contract_address)?;
            let config = operator_config(
                &cli,
                rpc,
                *service_id,
                Address::ZERO,
                &program,
                owner_private_key_path,
                password.clone(),
            );

            let reconciler = Reconciler {
                client: &client,
                catalog: &catalog,
                config: &config,
            };
            let executed = reconciler.claim(&program).await?;
            println!("claim: {}", executed.tx_hash);
            Ok(())
        }

        Commands::ChooseStaking {
            rpc,
            program,
            reset,
        } => {
            let client = ChainClient::read_only(rpc, cli.chain_id)?;
            let mut catalog = catalog;
            let env_path = cli.store_dir.join(".env");
            let mut env = EnvFile::load(&env_path)?;

            if *reset {
                env_store::reset_selection(&mut env);
                println!("Reset USE_STAKING and STAKING_PROGRAM in {}", env_path.display());
            }

            let program_id = match program {
                Some(id) => {
                    catalog.resolve(id)?;
                    id.clone()
                }
                None if cli.unattended => {
                    println!("No staking program given; defaulting to '{NO_STAKING_PROGRAM_ID}'.");
                    NO_STAKING_PROGRAM_ID.to_string()
                }
                None => select_program(&client, &mut catalog).await,
            };

            println!("Selected staking program: {program_id}");
            let variables = env_store::staking_env_variables(&client, &catalog, &program_id).await?;
            variables.apply(&mut env);
            env.save()?;
            println!("Populated staking variables in {}", env_path.display());
            Ok(())
        }

        Commands::SyncEvents {
            sender,
            rpc,
            mech_contract,
            earliest_block,
            deliver,
        } => {
            let client = ChainClient::read_only(rpc, cli.chain_id)?;
            let store = MechEventStore::open(cli.store_dir.join("mech_events.json"))?;
            let mut mirror = MechEventMirror::new(
                store,
                vec![MechContract {
                    address: *mech_contract,
                    earliest_block: *earliest_block,
                }],
            );
            let kind = if *deliver {
                MechEventKind::Deliver
            } else {
                MechEventKind::Request
            };

            tokio::select! {
                result = mirror.sync(&client, *sender, kind) => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!(
                        "Event sync cancelled; the cache reflects progress up to the last \
                         completed chunk. Re-run to resume."
                    );
                }
            }

            let count = mirror.events(*sender, kind).len();
            println!("{count} {} events cached for {sender:#x}", kind.event_name());
            Ok(())
        }

        Commands::Report {
            service_id,
            agent_address,
            safe_address,
            operator_address,
            rpc,
        } => {
            let client = ChainClient::read_only(rpc, cli.chain_id)?;
            let config = operator_config(
                &cli,
                rpc,
                *service_id,
                Address::ZERO,
                NO_STAKING_PROGRAM_ID,
                Path::new(""),
                None,
            );

            let subgraph = SubgraphClient::default();
            let creator = format!("{safe_address:#x}");
            let trades = subgraph.trades(&creator).await?;
            let positions = subgraph.user_positions(&creator).await?;

            let store = MechEventStore::open(cli.store_dir.join("mech_events.json"))?;
            let requests = store.get(&creator, MechEventKind::Request.event_name());

            let now = chrono::Utc::now().timestamp().max(0) as u64;
            let statistics = trades::compute_statistics(&trades, &positions, &requests, now);

            let report = report::build_report(
                &client,
                &catalog,
                &config,
                ReportAccounts {
                    agent: *agent_address,
                    safe: *safe_address,
                    operator: *operator_address,
                },
                &trades,
                &statistics,
                now,
            )
            .await?;

            print_report(&report);
            Ok(())
        }
    }
}

async fn select_program(client: &ChainClient, catalog: &mut StakingCatalog) -> String {
    println!("Please, select your staking program preference");
    println!("----------------------------------------------");
    let ids: Vec<String> = catalog
        .active_programs()
        .map(|p| p.program_id.to_string())
        .collect();
    for (index, id) in ids.iter().enumerate() {
        let metadata = catalog.metadata(client, id).await;
        println!("{}) {}\n   {}\n", index + 1, metadata.name, metadata.description);
    }

    loop {
        print!("Enter your choice (1 - {}): ", ids.len());
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return NO_STAKING_PROGRAM_ID.to_string();
        }
        match answer.trim().parse::<usize>() {
            Ok(choice) if (1..=ids.len()).contains(&choice) => return ids[choice - 1].clone(),
            _ => println!("Please enter a valid option (1 - {}).", ids.len()),
        }
    }
}

fn print_report(report: &report::ServiceReport) {
    println!();
    println!("==============");
    println!("Service report");
    println!("==============");
    println!("Service id: {}", report.service_id);

    match &report.staking_program {
        Some(program) => {
            println!("Staked: yes ({program}{})", if report.evicted { ", EVICTED" } else { "" });
            println!("Accrued rewards: {}", wei_to_olas(report.accrued_rewards));
        }
        None => println!("Staked: no"),
    }

    println!(
        "ROI on closed markets: {:.2} %",
        report.roi_closed * rust_decimal::Decimal::ONE_HUNDRED
    );
    println!(
        "Trades on last {} days: {} trades on {} markets",
        report.lookback_days, report.recent_trades, report.recent_markets
    );

    println!();
    println!("Agent    {:#x}", report.agent.address);
    println!(
        "  xDAI balance: {}{}",
        wei_to_xdai(report.agent.native_wei),
        low_marker(report.agent.low_balance)
    );
    println!("Safe     {:#x}", report.safe.address);
    println!(
        "  xDAI balance: {}{}",
        wei_to_xdai(report.safe.native_wei),
        low_marker(report.safe.low_balance)
    );
    println!("  WxDAI balance: {}", wei_to_wxdai(report.safe_wxdai));
    println!("Operator {:#x}", report.operator.address);
    println!(
        "  xDAI balance: {}{}",
        wei_to_xdai(report.operator.native_wei),
        low_marker(report.operator.low_balance)
    );
    println!();
}

fn low_marker(low: bool) -> &'static str {
    if low { " - too low" } else { "" }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    setup_log();
    // Pick up RPC/connection defaults from a local .env if present.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
