use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use orderflow_bot::config::AppConfig;
use orderflow_bot::connector::MockConnector;
use orderflow_bot::logger::OrchestratorLogger;
use orderflow_bot::orchestrator::{Orchestrator, OrchestratorConfig};
use orderflow_bot::replay::{self, ReplayInputs};
use orderflow_bot::telemetry;
use orderflow_bot::util::now_millis;

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Default)]
struct ReplayArgs {
    config_path: Option<String>,
    metrics_paths: Vec<PathBuf>,
    execution_paths: Vec<PathBuf>,
    out_dir: Option<PathBuf>,
}

fn parse_args() -> Result<ReplayArgs> {
    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let mut args = ReplayArgs::default();

    let mut i = 0usize;
    while i < raw_args.len() {
        match raw_args[i].as_str() {
            "--config" => {
                i += 1;
                let Some(value) = raw_args.get(i) else {
                    bail!("missing value for --config");
                };
                args.config_path = Some(value.clone());
            }
            "--metrics" => {
                i += 1;
                let Some(value) = raw_args.get(i) else {
                    bail!("missing value for --metrics");
                };
                args.metrics_paths.push(PathBuf::from(value));
            }
            "--execution" => {
                i += 1;
                let Some(value) = raw_args.get(i) else {
                    bail!("missing value for --execution");
                };
                args.execution_paths.push(PathBuf::from(value));
            }
            "--out-dir" => {
                i += 1;
                let Some(value) = raw_args.get(i) else {
                    bail!("missing value for --out-dir");
                };
                args.out_dir = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            value => bail!("unknown argument '{}'", value),
        }
        i += 1;
    }

    if args.metrics_paths.is_empty() && args.execution_paths.is_empty() {
        bail!("nothing to replay: pass --metrics and/or --execution at least once");
    }

    Ok(args)
}

fn print_usage() {
    eprintln!(
        "Usage:
  cargo run --bin replay -- --metrics logs/orchestrator/metrics_20231114.jsonl \\
      --execution logs/orchestrator/execution_20231114.jsonl \\
      [--config config/default.toml] [--out-dir runs/replay]"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    telemetry::init("replay");

    let cfg = match &args.config_path {
        Some(path) => {
            AppConfig::load_from_path(path).with_context(|| format!("failed to load {path}"))?
        }
        None => AppConfig::load_from_path(DEFAULT_CONFIG_PATH).unwrap_or_else(|_| {
            // Replaying logged gates does not need a real config file.
            toml::from_str("[general]\nsymbols = [\"BTCUSDT\"]\n")
                .expect("fallback config must parse")
        }),
    };

    let out_dir = args
        .out_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("runs/replay_{}", now_millis())));

    let (logger, _halt_rx, _logger_runtime) = OrchestratorLogger::spawn(&out_dir, &cfg.logger);
    let orchestrator = Orchestrator::new(
        Arc::new(MockConnector::default()),
        logger,
        OrchestratorConfig {
            gate: (&cfg.gate).into(),
            decision: (&cfg.decision).into(),
            execution_enabled: false,
        },
    );

    let inputs = ReplayInputs {
        metrics_paths: args.metrics_paths.clone(),
        execution_paths: args.execution_paths.clone(),
    };
    let report = replay::run(&orchestrator, &inputs).await?;

    println!("replay summary");
    println!("  metrics_lines: {}", report.metrics_lines);
    println!("  execution_lines: {}", report.execution_lines);
    println!("  skipped_lines: {}", report.skipped_lines);
    println!("  decisions: {}", report.decisions);
    println!("  decision_hash: {}", report.decision_hash);
    println!("  final_state_hash: {}", report.final_state_hash);
    println!("  out_dir: {}", out_dir.display());

    Ok(())
}
