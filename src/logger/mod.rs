use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use crate::config::LoggerSettings;
use crate::util::utc_date_key;

const DROP_CHECK_INTERVAL_SECS: u64 = 10;
const SUBDIR: &str = "orchestrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    Metrics,
    Execution,
    Decision,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Execution => "execution",
            Self::Decision => "decision",
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("failed to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write log line: {0}")]
    Write(#[from] std::io::Error),
}

#[derive(Debug)]
struct LogItem {
    kind: LogKind,
    event_time_ms: u64,
    line: JsonValue,
}

/// Bounded-queue JSONL writer for the orchestrator's three streams.
///
/// Enqueue never blocks: when the queue is full the line is dropped and
/// counted. A 10 s watcher compares the windowed drop count against the
/// halt threshold and signals the orchestrator, which responds by halting
/// every live actor. Files are one per (kind, UTC date of event time).
#[derive(Clone)]
pub struct OrchestratorLogger {
    tx: mpsc::Sender<LogItem>,
    drop_total: Arc<AtomicU64>,
    drop_window: Arc<AtomicU64>,
    drop_halt_threshold: u64,
}

pub struct LoggerRuntime {
    pub flusher: JoinHandle<()>,
    pub watcher: JoinHandle<()>,
}

impl OrchestratorLogger {
    /// Returns the handle, the halt-signal receiver (windowed drop count at
    /// trip time), and the background tasks.
    pub fn spawn(
        logs_dir: impl AsRef<Path>,
        settings: &LoggerSettings,
    ) -> (Self, mpsc::Receiver<u64>, LoggerRuntime) {
        let dir = logs_dir.as_ref().join(SUBDIR);
        let (tx, rx) = mpsc::channel(settings.queue_limit());
        let drop_total = Arc::new(AtomicU64::new(0));
        let drop_window = Arc::new(AtomicU64::new(0));
        let (halt_tx, halt_rx) = mpsc::channel(8);

        let logger = Self {
            tx,
            drop_total,
            drop_window: drop_window.clone(),
            drop_halt_threshold: settings.drop_halt_threshold(),
        };

        let flusher = tokio::spawn(flusher_loop(dir, rx));

        let threshold = settings.drop_halt_threshold();
        let watcher = tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_secs(DROP_CHECK_INTERVAL_SECS));
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let window = drop_window.swap(0, AtomicOrdering::Relaxed);
                if window >= threshold {
                    warn!(dropped = window, threshold, "logger drop spike");
                    if halt_tx.send(window).await.is_err() {
                        return;
                    }
                }
            }
        });

        (logger, halt_rx, LoggerRuntime { flusher, watcher })
    }

    /// Non-blocking enqueue; false means the line was dropped.
    pub fn enqueue(&self, kind: LogKind, event_time_ms: u64, line: JsonValue) -> bool {
        match self.tx.try_send(LogItem {
            kind,
            event_time_ms,
            line,
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.drop_total.fetch_add(1, AtomicOrdering::Relaxed);
                self.drop_window.fetch_add(1, AtomicOrdering::Relaxed);
                false
            }
        }
    }

    pub fn drop_total(&self) -> u64 {
        self.drop_total.load(AtomicOrdering::Relaxed)
    }

    pub fn drop_window(&self) -> u64 {
        self.drop_window.load(AtomicOrdering::Relaxed)
    }

    pub fn drop_halt_threshold(&self) -> u64 {
        self.drop_halt_threshold
    }
}

async fn flusher_loop(dir: PathBuf, mut rx: mpsc::Receiver<LogItem>) {
    let mut writers: HashMap<(LogKind, String), BufWriter<tokio::fs::File>> = HashMap::new();

    if let Err(error) = fs::create_dir_all(&dir).await {
        warn!(error = %error, dir = %dir.display(), "failed to create log dir");
    }

    while let Some(item) = rx.recv().await {
        if let Err(error) = write_item(&dir, &mut writers, &item).await {
            warn!(error = %error, kind = item.kind.as_str(), "log write failed");
        }
    }

    for ((kind, date), mut writer) in writers.drain() {
        if let Err(error) = writer.flush().await {
            warn!(error = %error, kind = kind.as_str(), date, "log flush on close failed");
        }
    }
    info!("logger flusher stopped");
}

async fn write_item(
    dir: &Path,
    writers: &mut HashMap<(LogKind, String), BufWriter<tokio::fs::File>>,
    item: &LogItem,
) -> Result<(), LoggerError> {
    let date = utc_date_key(item.event_time_ms);
    let key = (item.kind, date.clone());

    if !writers.contains_key(&key) {
        let path = dir.join(format!("{}_{}.jsonl", item.kind.as_str(), date));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| LoggerError::Open {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), "log file opened");
        writers.insert(key.clone(), BufWriter::new(file));
    }

    let writer = writers
        .get_mut(&key)
        .ok_or_else(|| LoggerError::Write(std::io::Error::other("writer vanished")))?;

    let raw = serde_json::to_vec(&item.line).map_err(std::io::Error::other)?;
    writer.write_all(&raw).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
