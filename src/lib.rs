//! driftwatch - streaming metric anomaly detection.
//!
//! An ingestion pipeline accepts timestamped metric samples over TCP
//! (length-prefixed batches) and UDP (single-record datagrams), buffers
//! them through a bounded queue into an in-memory timeseries store, and a
//! periodic detection engine runs an ensemble of statistical algorithms
//! over each metric's recent window. Consensus anomalies are confirmed
//! against a longer escalation window before an alert fires.
//!
//! The library crate exists so integration tests and the load generator
//! can drive the pipeline without a running binary; [`context::AppContext`]
//! is the seam everything hangs off.

pub mod analyzer;
pub mod background;
pub mod config;
pub mod context;
pub mod ingest;
pub mod store;
pub mod types;

pub use context::AppContext;
