use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use rentflow::application::engine::{Ports, RentalEngine};
use rentflow::application::scheduler::{ReconciliationScheduler, Reconciler};
use rentflow::config::RentalConfig;
use rentflow::domain::account::AccountId;
use rentflow::domain::ports::RepositoryBox;
use rentflow::infrastructure::clock::SystemClock;
use rentflow::infrastructure::gateway::MockPaymentGateway;
use rentflow::infrastructure::in_memory::{InMemoryCatalog, InMemoryProfiles, InMemoryStore};
use rentflow::infrastructure::notifier::TracingNotifier;
use rentflow::interfaces::csv::car_reader::CarReader;
use rentflow::interfaces::csv::transaction_writer::TransactionWriter;
use rentflow::interfaces::csv::wallet_writer::WalletWriter;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, env = "RENTFLOW_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    /// JSON file overriding the default business rules.
    #[arg(long, env = "RENTFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Car catalog CSV (`car, owner, deposit, base_price`).
    #[arg(long, env = "RENTFLOW_CARS", global = true)]
    cars: Option<PathBuf>,

    /// Overrides the house account from the config file.
    #[arg(long, global = true)]
    house_account: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconciliation scheduler until Ctrl+C.
    Serve,
    /// Run one reconciliation tick and print its report.
    Tick,
    /// Recompute every wallet from its ledger.
    Audit,
    /// Print the ledger of one wallet.
    Statement {
        #[arg(long)]
        account: u64,
    },
}

fn open_repository(db_path: Option<PathBuf>) -> Result<RepositoryBox> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(path) = db_path {
        let store = rentflow::infrastructure::rocksdb::RocksDBStore::open(path).into_diagnostic()?;
        return Ok(Box::new(store));
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }

    Ok(Box::new(InMemoryStore::new()))
}

async fn load_catalog(path: Option<PathBuf>) -> Result<InMemoryCatalog> {
    let catalog = InMemoryCatalog::new();
    let Some(path) = path else {
        return Ok(catalog);
    };
    let file = File::open(&path).into_diagnostic()?;
    for listing in CarReader::new(file).cars() {
        match listing {
            Ok(listing) => catalog.insert(listing).await,
            Err(e) => warn!(error = %e, "Skipping car row"),
        }
    }
    info!(cars = catalog.len().await, path = %path.display(), "Car catalog loaded");
    Ok(catalog)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rentflow=debug")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RentalConfig::from_json_file(path)?,
        None => RentalConfig::default(),
    };
    if let Some(house) = cli.house_account {
        config.house_account = AccountId(house);
    }

    let ports = Ports {
        repository: open_repository(cli.db_path)?,
        catalog: Box::new(load_catalog(cli.cars).await?),
        profiles: Box::new(InMemoryProfiles::new()),
        notifier: Box::new(TracingNotifier),
        gateway: Box::new(MockPaymentGateway::default()),
        clock: Box::new(SystemClock),
    };
    let engine = Arc::new(RentalEngine::new(config, ports).await?);

    match cli.command {
        Command::Serve => {
            let handle = ReconciliationScheduler::new(engine).start();
            tokio::signal::ctrl_c().await.into_diagnostic()?;
            info!("Shutdown signal received");
            let ticks = handle.stop().await.into_diagnostic()?;
            info!(ticks, "Scheduler drained");
        }
        Command::Tick => {
            let report = Reconciler::new(engine).run_tick().await?;
            println!("expired,promoted,overlap_cancelled,failures");
            println!(
                "{},{},{},{}",
                report.expired.len(),
                report.promoted.len(),
                report.overlap_cancelled.len(),
                report.failures
            );
        }
        Command::Audit => {
            let audits = engine.audit_all().await?;
            let stdout = io::stdout();
            WalletWriter::new(stdout.lock()).write_audits(audits)?;
        }
        Command::Statement { account } => {
            let rows = engine.statement(AccountId(account)).await?;
            let stdout = io::stdout();
            TransactionWriter::new(stdout.lock()).write_transactions(&rows)?;
        }
    }

    Ok(())
}
