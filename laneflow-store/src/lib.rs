//! Durable storage for counters and queue events.
//!
//! Two independent SQLite files so the high-rate counter history writer can
//! never stall the latency-sensitive queue writer: [`CounterStore`] holds
//! the per-camera counter snapshots plus the normalized count history, and
//! [`QueueStore`] is a dedicated append-only log of completed queue waits.
//! Both open with write-ahead journaling so external read-only consumers
//! (the HTTP API, dashboards) can query while the pipeline writes.

pub mod counter_store;
pub mod queue_store;

pub use counter_store::{CameraRow, CounterStore, HistoryEvent, HistoryFilter, Metrics24h};
pub use queue_store::{QueueFilter, QueueMetrics, QueueRow, QueueStore};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("sqlite error: {source}")]
    Sqlite {
        #[from]
        source: rusqlite::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
