use anyhow::Context;
use clap::Parser;
use microloan_sync::adapters::{InMemoryLedger, KivaGraphqlClient, LedgerWsSource, StaticCatalog};
use microloan_sync::cli::{self, Cli, Commands};
use microloan_sync::config::AppConfig;
use microloan_sync::domain::{CounterName, LoanId, OperationCall};
use microloan_sync::engine::{EngineHandle, ReconciliationEngine, Snapshot};
use microloan_sync::error::{Result, SyncError};
use microloan_sync::services::{
    LedgerSubscriptionHub, MetadataFetcher, PriceConverter, TransactionGateway,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{info, warn};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

/// Upper bound for each step of the offline demo
const DEMO_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Loans seeded onto the in-memory ledger before the demo starts
const DEMO_SEED_LOANS: [(LoanId, u64); 2] = [(1_568_001, 1225), (1_568_002, 850)];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Watch { ledger_url, json } => {
            let mut config = load_config(&cli)?;
            if let Some(url) = ledger_url {
                config.ledger.ws_url = url.clone();
            }
            config.validate().context("invalid configuration")?;
            init_logging(&config.logging);
            run_watch_mode(config, *json)
                .await
                .context("watch mode failed")?;
        }
        Commands::Demo { lend_amount, rate } => {
            let config = load_config(&cli)?;
            config.validate().context("invalid configuration")?;
            init_logging(&config.logging);
            run_demo_mode(config, *lend_amount, *rate)
                .await
                .context("offline demo failed")?;
        }
        Commands::Discover { exclude } => {
            init_logging_simple();
            let config = load_config(&cli)?;
            let kiva = Arc::new(
                KivaGraphqlClient::new(&config.metadata)
                    .context("failed to build the metadata client")?,
            );
            let fetcher = Arc::new(MetadataFetcher::new(kiva, &config.metadata));
            cli::discover_once(fetcher, exclude)
                .await
                .context("candidate discovery failed")?;
        }
        Commands::Convert { amount, rate } => {
            init_logging_simple();
            let config = load_config(&cli)?;
            cli::convert_amount(*amount, *rate, &config.pricing)?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;
    if let Some(dry_run) = cli.dry_run {
        config.gateway.dry_run = dry_run;
    }
    Ok(config)
}

fn start_engine(
    engine: ReconciliationEngine,
) -> (EngineHandle, broadcast::Sender<()>, tokio::task::JoinHandle<()>) {
    let handle = engine.handle();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(engine.run(shutdown_rx));
    (handle, shutdown_tx, task)
}

async fn run_watch_mode(config: AppConfig, json: bool) -> Result<()> {
    info!(
        ledger = %config.ledger.ws_url,
        metadata = %config.metadata.api_url,
        dry_run = config.gateway.dry_run,
        "starting live watch"
    );

    let source = Arc::new(LedgerWsSource::new(&config.ledger)?);
    let hub = Arc::new(LedgerSubscriptionHub::new(source.clone()));
    let kiva = Arc::new(KivaGraphqlClient::new(&config.metadata)?);
    let fetcher = Arc::new(MetadataFetcher::new(kiva, &config.metadata));
    let gateway = Arc::new(
        TransactionGateway::new(source, config.gateway.dry_run).with_submission_timeout(
            Duration::from_millis(config.gateway.submission_timeout_ms),
        ),
    );

    let engine = ReconciliationEngine::new(config.engine.clone(), hub, fetcher, gateway);
    let (mut handle, shutdown_tx, task) = start_engine(engine);
    let converter = PriceConverter::new(&config.pricing);
    let mut notifications = handle.subscribe_notifications();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupt received, stopping watch");
                break;
            }
            notification = notifications.recv() => {
                match notification {
                    Ok(notification) if !json => cli::print_notification(&notification),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            snapshot = handle.changed() => {
                let Ok(snapshot) = snapshot else { break };
                if json {
                    println!("{}", serde_json::to_string(snapshot.as_ref())?);
                } else {
                    cli::print_snapshot(&snapshot, &converter);
                }
            }
        }
    }

    let _ = shutdown_tx.send(());
    let _ = task.await;
    Ok(())
}

async fn demo_step<F>(handle: &EngineHandle, step: &str, predicate: F) -> Result<Arc<Snapshot>>
where
    F: FnMut(&Snapshot) -> bool,
{
    info!(step, "waiting for demo step");
    tokio::time::timeout(DEMO_STEP_TIMEOUT, handle.wait_for(predicate))
        .await
        .map_err(|_| SyncError::Internal(format!("demo step timed out: {}", step)))?
}

async fn run_demo_mode(config: AppConfig, lend_amount: u64, rate: i128) -> Result<()> {
    let ledger = Arc::new(InMemoryLedger::new());
    for (id, target) in DEMO_SEED_LOANS {
        ledger.add_loan(i64::from(id), target);
    }
    ledger.set_numeric(i64::from(DEMO_SEED_LOANS[0].0), 1_500, 250);
    ledger.set_oracle_rate(Some(rate));
    ledger.set_counter(CounterName::Staked, 10_000);

    let catalog = Arc::new(StaticCatalog::sample());
    let hub = Arc::new(LedgerSubscriptionHub::new(ledger.clone()));
    let fetcher = Arc::new(MetadataFetcher::new(catalog, &config.metadata));
    // The demo always writes to its own in-memory ledger
    let gateway = Arc::new(
        TransactionGateway::new(ledger.clone(), false).with_submission_timeout(
            Duration::from_millis(config.gateway.submission_timeout_ms),
        ),
    );

    let engine = ReconciliationEngine::new(config.engine.clone(), hub, fetcher, gateway);
    let (handle, shutdown_tx, task) = start_engine(engine);
    let converter = PriceConverter::new(&config.pricing);

    let mut notifications = handle.subscribe_notifications();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            cli::print_notification(&notification);
        }
    });

    let seeded = DEMO_SEED_LOANS.len();
    let snapshot = demo_step(&handle, "ledger loans described", |s| {
        s.loans.len() == seeded && s.pending_ids.is_empty() && s.oracle_rate.is_some()
    })
    .await?;
    cli::print_snapshot(&snapshot, &converter);

    handle.discover_candidate().await?;
    let snapshot = demo_step(&handle, "candidate discovered", |s| s.candidate.is_some()).await?;
    cli::print_snapshot(&snapshot, &converter);
    let candidate = snapshot
        .candidate
        .clone()
        .ok_or_else(|| SyncError::Internal("candidate vanished".into()))?;

    handle
        .submit(OperationCall::add_loan(candidate.id, candidate.target_amount))
        .await?;
    demo_step(&handle, "candidate promoted", |s| {
        s.candidate.is_none() && s.contains(candidate.id)
    })
    .await?;

    handle
        .submit(OperationCall::lend(candidate.id, lend_amount))
        .await?;
    let snapshot = demo_step(&handle, "loan funded", |s| {
        s.loan(candidate.id)
            .map(|loan| loan.funded_amount >= lend_amount)
            .unwrap_or(false)
    })
    .await?;
    cli::print_snapshot(&snapshot, &converter);

    handle.shutdown().await?;
    let _ = task.await;
    drop(shutdown_tx);
    Ok(())
}
