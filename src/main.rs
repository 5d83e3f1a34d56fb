use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courtwatch::channel::{MemoryChannel, NotificationChannel, RoutedChannel, WebhookChannel};
use courtwatch::config::Config;
use courtwatch::lock::{ExecutionLock, InMemoryLeaseStore};
use courtwatch::orchestrator::Orchestrator;
use courtwatch::reconciler::{PassOutcome, Reconciler};
use courtwatch::retraction::{RetractionQueue, RetractionWorker};
use courtwatch::scheduler;
use courtwatch::source::RecApiSource;
use courtwatch::store::TimeslotStore;

#[derive(Parser)]
#[command(name = "courtwatch", about = "Watch court booking availability and announce changes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile on a fixed interval until interrupted (default).
    Run,
    /// Run a single locked pass and print what changed.
    Once,
    /// List facilities linked from a seed facility.
    Discover { seed: String },
}

struct Components {
    reconciler: Arc<Reconciler>,
    store: Arc<TimeslotStore>,
    worker: RetractionWorker,
}

/// Per-facility webhooks first, then the shared webhook, else log only.
fn notification_channel(config: &Config) -> Result<RoutedChannel, Box<dyn std::error::Error>> {
    let fallback: Arc<dyn NotificationChannel> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookChannel::new(url.clone(), config.fetch_timeout)?),
        None => {
            info!("no shared webhook configured, unrouted notifications are logged only");
            Arc::new(MemoryChannel::new())
        }
    };
    let mut routed = RoutedChannel::new(fallback);
    for (facility_id, url) in &config.facility_webhooks {
        let webhook = WebhookChannel::new(url.clone(), config.fetch_timeout)?;
        routed = routed.with_route(facility_id.clone(), Arc::new(webhook));
    }
    Ok(routed)
}

fn build(config: &Config) -> Result<Components, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(TimeslotStore::open(config.wal_path())?);

    let channel = Arc::new(notification_channel(config)?);
    let source = Arc::new(RecApiSource::new(&config.api_base, config.fetch_timeout)?);
    let (retractions, worker) = RetractionQueue::start_recording(channel.clone(), store.clone());
    retractions.resume(store.pending_retractions(config.retract_after));

    let orchestrator = Orchestrator::new(store.clone(), channel, retractions)
        .with_retract_after(config.retract_after);
    let reconciler = Reconciler::new(
        source,
        store.clone(),
        orchestrator,
        ExecutionLock::new(Arc::new(InMemoryLeaseStore::new())),
    )
    .with_options(config.extract_options())
    .with_lease(config.lease);

    Ok(Components {
        reconciler: Arc::new(reconciler),
        store,
        worker,
    })
}

async fn shutdown_signal() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = ctrl_c => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    Ok(())
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let facilities = config.require_facilities()?.to_vec();
    let Components {
        reconciler,
        store,
        worker,
    } = build(&config)?;

    info!("courtwatch watching {} facilities", facilities.len());
    info!("  data_dir: {}", config.data_dir.display());
    info!("  interval: {:?}", config.interval);
    info!("  webhook: {}", if config.webhook_url.is_some() { "enabled" } else { "disabled" });
    info!("  facility webhooks: {}", config.facility_webhooks.len());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let cancel = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler::run_scheduler(
        reconciler,
        facilities,
        config.interval,
        cancel.clone(),
    ));
    let compactor_task = tokio::spawn(scheduler::run_compactor(
        store,
        config.compact_threshold,
        cancel.clone(),
    ));

    shutdown_signal().await?;
    info!("shutdown signal received, finishing current pass");
    cancel.cancel();
    scheduler_task.await?;
    compactor_task.await?;
    worker.shutdown().await;

    info!("courtwatch stopped");
    Ok(())
}

async fn once(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let facilities = config.require_facilities()?.to_vec();
    let Components {
        reconciler, worker, ..
    } = build(&config)?;

    match reconciler.run_pass(&facilities).await {
        PassOutcome::Skipped => println!("another pass is running"),
        PassOutcome::Ran(summary) => {
            for report in &summary.reports {
                for slot in &report.opened {
                    println!("opened  {slot}");
                }
                for slot in &report.closed {
                    println!("closed  {slot}");
                }
                for failed in &report.failed_opens {
                    println!("failed  {} ({})", failed.slot, failed.reason);
                }
            }
            for (facility_id, e) in &summary.failures {
                println!("error   {facility_id}: {e}");
            }
            println!("{} opened, {} closed", summary.opened(), summary.closed());
        }
    }

    // Pending retractions belong to a long-running process.
    worker.shutdown().await;
    Ok(())
}

async fn discover(config: Config, seed: String) -> Result<(), Box<dyn std::error::Error>> {
    let source = RecApiSource::new(&config.api_base, config.fetch_timeout)?;
    for facility in source.discover_facilities(&seed).await? {
        match &facility.name {
            Some(name) => println!("{}={name}", facility.id),
            None => println!("{}", facility.id),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    courtwatch::observability::init(config.metrics_port)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Once => once(config).await,
        Command::Discover { seed } => discover(config, seed).await,
    }
}
