use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use orderflow_bot::broadcast::{BroadcastGate, WsHub};
use orderflow_bot::config::AppConfig;
use orderflow_bot::connector::{ExecutionConnector, FuturesRestConnector, MockConnector};
use orderflow_bot::ingest::FeedIngestor;
use orderflow_bot::logger::OrchestratorLogger;
use orderflow_bot::orchestrator::{Orchestrator, OrchestratorConfig};
use orderflow_bot::snapshot::SnapshotFetcher;
use orderflow_bot::telemetry;

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone)]
struct EngineArgs {
    config_path: String,
}

fn parse_args() -> Result<EngineArgs> {
    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let mut args = EngineArgs {
        config_path: DEFAULT_CONFIG_PATH.to_string(),
    };

    let mut i = 0usize;
    while i < raw_args.len() {
        match raw_args[i].as_str() {
            "--config" => {
                i += 1;
                let Some(value) = raw_args.get(i) else {
                    bail!("missing value for --config");
                };
                args.config_path = value.clone();
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            value => bail!("unknown argument '{}'", value),
        }
        i += 1;
    }

    Ok(args)
}

fn print_usage() {
    eprintln!(
        "Usage:
  cargo run --bin engine -- [--config config/default.toml]

Set FUTURES_API_KEY / FUTURES_API_SECRET when [execution].enabled = true."
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    telemetry::init("engine");

    let cfg = AppConfig::load_from_path(&args.config_path)
        .with_context(|| format!("failed to load config {}", args.config_path))?;
    let symbols: BTreeSet<String> = cfg.general.symbols_upper().into_iter().collect();
    info!(symbols = ?symbols, "engine starting");

    let (logger, halt_rx, _logger_runtime) =
        OrchestratorLogger::spawn(&cfg.general.logs_dir, &cfg.logger);

    let orchestrator_cfg = OrchestratorConfig {
        gate: (&cfg.gate).into(),
        decision: (&cfg.decision).into(),
        execution_enabled: cfg.execution.enabled,
    };

    let (connector, events_rx): (Arc<dyn ExecutionConnector>, Option<_>) = if cfg.execution.enabled
    {
        let (connector, events_rx) = FuturesRestConnector::from_settings(&cfg.execution)
            .context("execution connector init failed")?;
        connector.start_user_stream();
        (Arc::new(connector), Some(events_rx))
    } else {
        info!("execution disabled; decisions will be recorded but not routed");
        (Arc::new(MockConnector::default()), None)
    };

    let orchestrator = Orchestrator::new(connector, logger, orchestrator_cfg);
    run_engine(cfg, orchestrator, events_rx, halt_rx, symbols).await
}

async fn run_engine(
    cfg: AppConfig,
    orchestrator: Orchestrator,
    events_rx: Option<tokio::sync::mpsc::Receiver<orderflow_bot::connector::ExecutionEvent>>,
    halt_rx: tokio::sync::mpsc::Receiver<u64>,
    symbols: BTreeSet<String>,
) -> Result<()> {
    orchestrator.spawn_logger_halt_watcher(halt_rx);
    if let Some(events_rx) = events_rx {
        orchestrator.spawn_execution_pump(events_rx);
        orchestrator.set_connected(true);
    }

    orchestrator.set_execution_symbols(symbols.clone()).await;

    let hub = WsHub::new();
    hub.spawn_server(cfg.marketdata.ws_bind_addr.clone());

    let fetcher = Arc::new(
        SnapshotFetcher::from_config(&cfg.marketdata).context("snapshot fetcher init failed")?,
    );

    // Structured health heartbeat: rate-limit state and fan-out load.
    let health_fetcher = fetcher.clone();
    let health_hub = hub.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let fetch_health = health_fetcher.health().await;
            let resyncing = fetch_health.iter().filter(|h| h.resyncing).count();
            let erroring = fetch_health
                .iter()
                .filter(|h| h.consecutive_errors > 0)
                .count();
            let ws_subscribers = health_hub.subscriber_count().await;
            info!(
                global_backoff_until_ms = health_fetcher.global_backoff_until_ms(),
                symbols_resyncing = resyncing,
                symbols_erroring = erroring,
                ws_subscribers = ws_subscribers,
                "health"
            );
        }
    });

    let (symbols_tx, symbols_rx) = watch::channel(symbols);
    let gate = BroadcastGate::new(
        cfg.marketdata.broadcast_throttle_ms,
        cfg.marketdata.book_depth_levels(),
        hub.clone(),
        orchestrator.clone(),
    );
    let ingestor = FeedIngestor::new(cfg.marketdata.clone(), fetcher, gate, symbols_rx);
    let feed_handle = ingestor.spawn();

    info!("engine running; ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    warn!("shutdown requested; draining actors");
    feed_handle.abort();
    drop(symbols_tx);
    orchestrator.flush().await;
    info!("engine stopped");
    Ok(())
}
