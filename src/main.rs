use chrono::Utc;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use paycontrol::config::{InvoicePluginConfig, OrchestratorConfig};
use paycontrol::domain::ports::PaymentStoreRef;
use paycontrol::infrastructure::in_memory::InMemoryPaymentStore;
#[cfg(feature = "storage-rocksdb")]
use paycontrol::infrastructure::rocksdb::RocksDBPaymentStore;
use paycontrol::interfaces::csv::outcome_writer::OutcomeWriter;
use paycontrol::interfaces::csv::scenario_reader::ScenarioReader;
use paycontrol::interfaces::scenario::ScenarioRunner;
use paycontrol::telemetry::init_tracing;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input scenario CSV file
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Number of scheduled retry rounds to run once the scenario is done.
    #[arg(long, default_value_t = 0)]
    retry_rounds: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let store = open_store(cli.db_path.as_deref()).into_diagnostic()?;
    let mut runner = ScenarioRunner::new(
        OrchestratorConfig::from_env(),
        InvoicePluginConfig::from_env(),
        store,
        Utc::now(),
    );

    let file = File::open(&cli.input).into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = OutcomeWriter::new(stdout.lock());

    for row_result in ScenarioReader::new(file).rows() {
        let row = match row_result {
            Ok(row) => row,
            Err(e) => {
                eprintln!("Error reading scenario row: {}", e);
                continue;
            }
        };
        let (action, account) = (row.action, row.account);
        match runner.apply(row).await {
            Ok(Some(record)) => writer.write(&record).into_diagnostic()?,
            Ok(None) => {}
            Err(e) => eprintln!("Error processing {} for account {}: {}", action, account, e),
        }
    }

    for _ in 0..cli.retry_rounds {
        let Some(records) = runner.run_next_retries().await else {
            break;
        };
        for record in records {
            match record {
                Ok(record) => writer.write(&record).into_diagnostic()?,
                Err(e) => eprintln!("Error retrying payment: {}", e),
            }
        }
    }

    writer.flush().into_diagnostic()?;
    Ok(())
}

#[cfg(feature = "storage-rocksdb")]
fn open_store(db_path: Option<&Path>) -> paycontrol::error::Result<PaymentStoreRef> {
    match db_path {
        Some(path) => Ok(Arc::new(RocksDBPaymentStore::open(path)?)),
        None => Ok(Arc::new(InMemoryPaymentStore::new())),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_store(db_path: Option<&Path>) -> paycontrol::error::Result<PaymentStoreRef> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(Arc::new(InMemoryPaymentStore::new()))
}
