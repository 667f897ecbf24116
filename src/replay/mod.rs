use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::connector::ExecutionEvent;
use crate::orchestrator::{ExecutionLogLine, MetricsLogLine, Orchestrator};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read line {line} of {path}: {source}")]
    Read {
        path: PathBuf,
        line: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization failed while hashing: {0}")]
    Hashing(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Default)]
pub struct ReplayInputs {
    pub metrics_paths: Vec<PathBuf>,
    pub execution_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub metrics_lines: usize,
    pub execution_lines: usize,
    pub skipped_lines: usize,
    pub decisions: usize,
    pub decision_hash: String,
    pub final_state_hash: String,
}

enum ReplayEntry {
    Metrics(MetricsLogLine),
    Execution(ExecutionEvent),
}

impl ReplayEntry {
    fn event_time_ms(&self) -> u64 {
        match self {
            Self::Metrics(line) => line.exchange_event_time_ms,
            Self::Execution(event) => event.event_time_ms(),
        }
    }
}

/// Feeds logged metrics and execution streams back through an orchestrator
/// in event-time order, waits for the actors to go idle, and fingerprints
/// the outcome. Same logs + same config must reproduce both hashes.
pub async fn run(
    orchestrator: &Orchestrator,
    inputs: &ReplayInputs,
) -> Result<ReplayReport, ReplayError> {
    let mut entries: Vec<ReplayEntry> = Vec::new();
    let mut skipped_lines = 0usize;

    for path in &inputs.metrics_paths {
        read_lines(path, |raw| {
            match serde_json::from_str::<MetricsLogLine>(raw) {
                Ok(line) if line.metrics.is_some() => entries.push(ReplayEntry::Metrics(line)),
                Ok(_) | Err(_) => {
                    skipped_lines += 1;
                    debug!(path = %path.display(), "skipping unusable metrics line");
                }
            }
        })?;
    }

    for path in &inputs.execution_paths {
        read_lines(path, |raw| match parse_execution_line(raw) {
            Some(event) => entries.push(ReplayEntry::Execution(event)),
            None => {
                skipped_lines += 1;
                debug!(path = %path.display(), "skipping unusable execution line");
            }
        })?;
    }

    // Stable by event time: same-timestamp entries keep file order, with
    // metrics ahead of execution the way they were loaded.
    entries.sort_by_key(ReplayEntry::event_time_ms);

    let mut metrics_lines = 0usize;
    let mut execution_lines = 0usize;

    for entry in entries {
        match entry {
            ReplayEntry::Metrics(line) => {
                metrics_lines += 1;
                let Some(envelope) = line.metrics else {
                    continue;
                };
                match line.gate {
                    Some(gate) => {
                        orchestrator.ingest_logged_metrics(envelope, gate).await;
                    }
                    None => {
                        orchestrator.ingest(envelope).await;
                    }
                }
            }
            ReplayEntry::Execution(event) => {
                execution_lines += 1;
                orchestrator.ingest_execution_replay(event).await;
            }
        }
    }

    orchestrator.flush().await;

    let ledger = orchestrator.decision_ledger().await;
    let final_states = orchestrator.final_states().await;

    let decision_hash = hash_serialized_items(&ledger)?;
    let final_state_hash = hash_canonical(&final_states)?;

    let report = ReplayReport {
        metrics_lines,
        execution_lines,
        skipped_lines,
        decisions: ledger.len(),
        decision_hash,
        final_state_hash,
    };
    info!(
        decisions = report.decisions,
        metrics_lines = report.metrics_lines,
        execution_lines = report.execution_lines,
        "replay complete"
    );
    Ok(report)
}

fn parse_execution_line(raw: &str) -> Option<ExecutionEvent> {
    if let Ok(line) = serde_json::from_str::<ExecutionLogLine>(raw) {
        return Some(line.event);
    }
    serde_json::from_str::<ExecutionEvent>(raw).ok()
}

fn read_lines(
    path: &Path,
    mut on_line: impl FnMut(&str),
) -> Result<(), ReplayError> {
    let file = File::open(path).map_err(|source| ReplayError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);

    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| ReplayError::Read {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        on_line(trimmed);
    }
    Ok(())
}

/// SHA-256 over the canonical serialization of each item, newline-framed.
pub fn hash_serialized_items<T: Serialize>(items: &[T]) -> Result<String, ReplayError> {
    let mut hasher = Sha256::new();
    for item in items {
        let raw = serde_json::to_vec(item).map_err(ReplayError::Hashing)?;
        hasher.update(&raw);
        hasher.update(b"\n");
    }
    Ok(hex_digest(hasher))
}

pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String, ReplayError> {
    let raw = serde_json::to_vec(value).map_err(ReplayError::Hashing)?;
    let mut hasher = Sha256::new();
    hasher.update(&raw);
    Ok(hex_digest(hasher))
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Arc;

    use super::{hash_canonical, hash_serialized_items, run, ReplayInputs};
    use crate::connector::{ExecutionEvent, MockConnector};
    use crate::decision::DecisionConfig;
    use crate::gate::{GateConfig, GateMode};
    use crate::logger::OrchestratorLogger;
    use crate::metrics::{LegacyMetricsSnapshot, MetricsEnvelope};
    use crate::orchestrator::{MetricsLogLine, Orchestrator, OrchestratorConfig};

    fn replay_orchestrator(tag: &str) -> Orchestrator {
        let dir = std::env::temp_dir().join(format!(
            "orderflow-replay-{tag}-{}",
            std::process::id()
        ));
        let settings = toml::from_str("").expect("default logger settings");
        let (logger, _halt_rx, _runtime) = OrchestratorLogger::spawn(dir, &settings);

        Orchestrator::new(
            Arc::new(MockConnector::default()),
            logger,
            OrchestratorConfig {
                gate: GateConfig {
                    mode: GateMode::V1NoLatency,
                    max_spread_pct: 0.08,
                    min_obi_deep: 0.05,
                    max_network_latency_ms: 100,
                },
                decision: DecisionConfig {
                    initial_margin_usdt: 50.0,
                    max_leverage: 5.0,
                    cooldown_min_ms: 1_000,
                    cooldown_max_ms: 60_000,
                },
                execution_enabled: false,
            },
        )
    }

    fn metrics_line(canonical: u64, delta_z: f64) -> MetricsLogLine {
        let envelope = MetricsEnvelope {
            symbol: "BTCUSDT".to_string(),
            canonical_time_ms: canonical,
            exchange_event_time_ms: canonical,
            spread_pct: 0.01,
            prints_per_second: 4.0,
            best_bid: 100.0,
            best_ask: 100.1,
            legacy: Some(LegacyMetricsSnapshot {
                obi_weighted: 0.2,
                obi_deep: 0.3,
                obi_divergence: -0.1,
                delta_z,
                cvd_slope: 0.2,
                oi_delta: None,
            }),
        };
        MetricsLogLine {
            canonical_time_ms: canonical,
            exchange_event_time_ms: canonical,
            symbol: "BTCUSDT".to_string(),
            gate: None,
            metrics: Some(envelope),
        }
    }

    fn write_fixture(tag: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "orderflow-replay-fixture-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("fixture dir");

        let metrics_path = dir.join("metrics_20231114.jsonl");
        let mut metrics_file = std::fs::File::create(&metrics_path).expect("metrics file");
        for (ts, dz) in [(1_000u64, 0.0), (2_000, 1.5), (3_000, -0.4)] {
            let line = serde_json::to_string(&metrics_line(ts, dz)).expect("serialize");
            writeln!(metrics_file, "{line}").expect("write");
        }

        let execution_path = dir.join("execution_20231114.jsonl");
        let mut execution_file = std::fs::File::create(&execution_path).expect("execution file");
        let events = [
            ExecutionEvent::AccountUpdate {
                symbol: "BTCUSDT".to_string(),
                event_time_ms: 1_500,
                available_balance: 900.0,
                wallet_balance: 1_000.0,
                position_amt: 0.0,
                entry_price: 0.0,
                unrealized_pnl: 0.0,
            },
            ExecutionEvent::SystemHalt {
                symbol: "BTCUSDT".to_string(),
                event_time_ms: 2_500,
                reason: "test".to_string(),
            },
            ExecutionEvent::SystemResume {
                symbol: "BTCUSDT".to_string(),
                event_time_ms: 2_900,
            },
        ];
        for event in &events {
            let line = serde_json::to_string(event).expect("serialize");
            writeln!(execution_file, "{line}").expect("write");
        }

        (metrics_path, execution_path)
    }

    #[tokio::test]
    async fn replay_is_deterministic_across_runs() {
        let (metrics_path, execution_path) = write_fixture("determinism");
        let inputs = ReplayInputs {
            metrics_paths: vec![metrics_path],
            execution_paths: vec![execution_path],
        };

        let first = run(&replay_orchestrator("first"), &inputs)
            .await
            .expect("first run");
        let second = run(&replay_orchestrator("second"), &inputs)
            .await
            .expect("second run");

        assert_eq!(first.decisions, 3);
        assert_eq!(first.metrics_lines, 3);
        assert_eq!(first.execution_lines, 3);
        assert_eq!(first.decision_hash, second.decision_hash);
        assert_eq!(first.final_state_hash, second.final_state_hash);
    }

    #[tokio::test]
    async fn merge_interleaves_execution_by_event_time() {
        let dir = std::env::temp_dir().join(format!(
            "orderflow-replay-fixture-merge-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("fixture dir");

        let metrics_path = dir.join("metrics.jsonl");
        let mut metrics_file = std::fs::File::create(&metrics_path).expect("metrics file");
        for (ts, dz) in [(1_000u64, 1.5), (3_000, 1.5)] {
            let line = serde_json::to_string(&metrics_line(ts, dz)).expect("serialize");
            writeln!(metrics_file, "{line}").expect("write");
        }

        let execution_path = dir.join("execution.jsonl");
        let mut execution_file = std::fs::File::create(&execution_path).expect("execution file");
        let halt = ExecutionEvent::SystemHalt {
            symbol: "BTCUSDT".to_string(),
            event_time_ms: 2_000,
            reason: "test".to_string(),
        };
        writeln!(
            execution_file,
            "{}",
            serde_json::to_string(&halt).expect("serialize")
        )
        .expect("write");

        let orchestrator = replay_orchestrator("merge");
        let report = run(
            &orchestrator,
            &ReplayInputs {
                metrics_paths: vec![metrics_path],
                execution_paths: vec![execution_path],
            },
        )
        .await
        .expect("run");
        assert_eq!(report.decisions, 2);

        let ledger = orchestrator.decision_ledger().await;
        // Before the halt: a live probe. After the halt: a halted noop.
        assert!(!ledger[0].actions[0].is_noop());
        assert!(ledger[1].actions[0].is_noop());
        assert_eq!(ledger[1].actions[0].reason(), "halted");
        assert!(orchestrator.final_states().await["BTCUSDT"].halted);
    }

    #[test]
    fn item_hash_is_order_sensitive() {
        let a = vec!["x".to_string(), "y".to_string()];
        let b = vec!["y".to_string(), "x".to_string()];
        assert_ne!(
            hash_serialized_items(&a).expect("hash"),
            hash_serialized_items(&b).expect("hash")
        );
        assert_eq!(
            hash_canonical(&a).expect("hash"),
            hash_canonical(&a).expect("hash")
        );
    }
}
