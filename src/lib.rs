//! Real-time crypto-futures orderflow engine: sequence-validated L2 book
//! reconstruction, gated orderflow metrics, per-symbol decision actors, and
//! deterministic replay from JSONL logs.

pub mod actor;
pub mod broadcast;
pub mod config;
pub mod connector;
pub mod decision;
pub mod gate;
pub mod ingest;
pub mod logger;
pub mod metrics;
pub mod orchestrator;
pub mod orderbook;
pub mod replay;
pub mod snapshot;
pub mod tape;
pub mod telemetry;
pub mod util;
