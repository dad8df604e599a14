//! Riptide node binary.
//!
//! Runs a single-node ledger with the loopback sampler: transactions are
//! accepted, blocks are proposed and Snowball decides locally. Multi-node
//! networking plugs in through the `PeerSampler` trait and is provided by a
//! separate overlay daemon.
//!
//! Usage:
//!   riptide                        # run a node
//!   riptide node --benchmark      # run a node that spams nop transactions
//!   riptide genesis                # print the built-in developer genesis

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use riptide::applier::NoopExecutor;
use riptide::config::RiptideConfig;
use riptide::genesis;
use riptide::ledger::{Ledger, SoloSampler};
use riptide::state::StateTree;
use riptide::transaction::Tag;
use riptide::AccountId;

/// Riptide ledger node.
#[derive(Parser, Debug)]
#[command(name = "riptide", version, about = "Riptide DAG ledger node")]
struct Cli {
    /// Data directory (holds riptide.toml).
    #[arg(long, default_value = "./riptide-data", global = true)]
    data_dir: PathBuf,

    /// Path to a genesis JSON file (overrides the config file).
    #[arg(long, global = true)]
    genesis: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node (default).
    Node {
        /// Continuously submit nop transactions to keep rounds moving.
        #[arg(long)]
        benchmark: bool,
    },

    /// Print the built-in developer genesis allocation.
    Genesis,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut cli = Cli::parse();
    let config = RiptideConfig::load(&cli.data_dir);
    let command = cli.command.take().unwrap_or(Command::Node { benchmark: false });

    match command {
        Command::Genesis => {
            for account in genesis::dev_genesis() {
                println!("{}  balance={}", hex::encode(account.id.0), account.balance);
            }
            Ok(())
        }
        Command::Node { benchmark } => run_node(cli, config, benchmark).await,
    }
}

async fn run_node(
    cli: Cli,
    config: RiptideConfig,
    benchmark: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let genesis_path = cli
        .genesis
        .or_else(|| config.node.genesis_path.as_ref().map(PathBuf::from));

    let accounts = match genesis_path {
        Some(path) => genesis::load_genesis(&path)?,
        None => genesis::dev_genesis(),
    };

    let mut state = StateTree::new();
    genesis::apply_genesis(&mut state, &accounts);
    tracing::info!(
        num_accounts = accounts.len(),
        merkle = %hex::encode(&state.merkle_root()[..8]),
        "genesis applied"
    );

    // The loopback identity doubles as the benchmark transaction creator.
    let identity = accounts
        .first()
        .map(|account| account.id)
        .unwrap_or(AccountId([1u8; 32]));

    let consensus = Arc::new(config.consensus.clone());
    let ledger = Arc::new(Ledger::new(
        consensus,
        state,
        Box::new(NoopExecutor),
        Arc::new(SoloSampler::new(identity)),
    ));

    let shutdown = CancellationToken::new();

    let watchdog = tokio::spawn(
        Arc::clone(&ledger).watch_for_stall(shutdown.clone()),
    );

    let benchmark_task = benchmark.then(|| {
        let ledger = Arc::clone(&ledger);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut nonce = 0u64;
            let mut interval = tokio::time::interval(Duration::from_millis(50));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                nonce += 1;
                if let Err(error) =
                    ledger.create_transaction(identity, identity, nonce, Tag::Nop, vec![])
                {
                    tracing::warn!(%error, "failed to create benchmark transaction");
                }
            }
        })
    });

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, shutting down...");
                shutdown.cancel();
            }
        });
    }

    tracing::info!(
        data_dir = %cli.data_dir.display(),
        interval_ms = config.node.block_proposal_interval_ms,
        "starting Riptide node"
    );

    let proposal_interval = Duration::from_millis(config.node.block_proposal_interval_ms);
    let result = Arc::clone(&ledger).run(proposal_interval, shutdown.clone()).await;

    shutdown.cancel();
    if let Some(task) = benchmark_task {
        let _ = task.await;
    }
    let _ = watchdog.await;

    tracing::info!(
        round = ledger.round().index,
        num_tx = ledger.graph().num_transactions_in_store(),
        "node stopped"
    );

    result.map_err(Into::into)
}
