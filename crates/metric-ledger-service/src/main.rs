//! Metric ledger command line.
//!
//! `concurrency-test` runs the lost-update scenario against the configured
//! backend; `load-test` measures sequential ingestion throughput.

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metric_ledger_core::IsolationMode;
use metric_ledger_store::MetricCatalog;
use metric_ledger_service::load_test::DEFAULT_SEED;
use metric_ledger_service::{
    seed_catalog, ConcurrencyHarness, ConcurrencyScenario, LoadTest, ServiceConfig, StoreBackend,
};

#[derive(Parser)]
#[command(author, version, about = "Metric ingestion ledger with optimistic concurrency control")]
struct Cli {
    /// Storage backend; overrides STORE_BACKEND.
    #[arg(long, global = true)]
    backend: Option<StoreBackend>,

    /// Print reports as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Charge one subscription from several concurrent workers and audit it
    ConcurrencyTest(ConcurrencyArgs),
    /// Ingest random observations one after another
    LoadTest {
        /// Observations to ingest.
        #[arg(long, default_value_t = 1000)]
        count: usize,
        /// RNG seed for catalog and observations.
        #[arg(long, default_value_t = DEFAULT_SEED)]
        seed: u64,
        /// Seed a demo catalog even if metrics already exist.
        #[arg(long)]
        populate: bool,
    },
}

#[derive(Args)]
struct ConcurrencyArgs {
    /// Concurrent workers.
    #[arg(long, default_value_t = 2)]
    concurrency: usize,
    /// Subscription price per observation, in cents.
    #[arg(long, default_value_t = 100)]
    amount_cents: i64,
    /// Opening balance, in cents.
    #[arg(long, default_value_t = 0)]
    initial_balance_cents: i64,
    /// optimistic or unchecked.
    #[arg(long, default_value_t = IsolationMode::Optimistic)]
    isolation: IsolationMode,
    /// Sleep between read and write, in milliseconds (0 disables).
    #[arg(long, default_value_t = 100)]
    delay_ms: u64,
    /// Attempts per charge; overrides LEDGER_MAX_ATTEMPTS.
    #[arg(long)]
    max_attempts: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,metric_ledger=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = ServiceConfig::from_env();
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    tracing::info!(
        backend = %config.backend,
        isolation_mode = %config.ledger.isolation_mode,
        max_attempts = config.ledger.max_attempts,
        "Service configuration loaded"
    );

    let store = config.open_store().await?;

    match cli.cmd {
        Command::ConcurrencyTest(args) => {
            let mut ledger = config.ledger.clone();
            if let Some(max_attempts) = args.max_attempts {
                ledger = ledger.with_max_attempts(max_attempts);
            }
            ledger.validate()?;
            let delay = (args.delay_ms > 0).then_some(Duration::from_millis(args.delay_ms));
            let scenario = ConcurrencyScenario::default()
                .with_concurrency(args.concurrency)
                .with_amount_cents(args.amount_cents)
                .with_initial_balance_cents(args.initial_balance_cents)
                .with_isolation_mode(args.isolation)
                .with_artificial_delay(delay);

            let report = ConcurrencyHarness::new(store, ledger).run(&scenario).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} workers, {} mode: final balance {} (expected {}), {} ledger rows totalling {}",
                    report.concurrency,
                    report.isolation_mode,
                    format_cents(report.final_balance_cents),
                    format_cents(report.expected_balance_cents),
                    report.transaction_count,
                    format_cents(report.ledger_sum_cents),
                );
            }

            if scenario.isolation_mode.detects_conflicts() && !report.consistent {
                return Err("ledger invariant violated under optimistic isolation".into());
            }
        }
        Command::LoadTest {
            count,
            seed,
            populate,
        } => {
            if populate || store.list_metrics().await?.is_empty() {
                seed_catalog(store.as_ref(), seed).await?;
            }

            let report = LoadTest::new(store, &config.ledger, seed).run(count).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} observations in {:.2}s ({:.1}/s), {} charges committed, {} failed",
                    report.ingested,
                    report.elapsed.as_secs_f64(),
                    report.throughput,
                    report.charges_committed,
                    report.charges_failed,
                );
            }
        }
    }

    Ok(())
}

fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{sign}{}.{:02}", cents / 100, cents % 100)
}
