//! simda — System Information Monitoring DAemon.
//!
//! `simdad` samples kernel and network sources and streams time-windowed
//! aggregate snapshots to clients over gRPC; `simda` is the matching
//! stream-printing client. The sampling core lives in `simda-metrics`, the
//! wire schema in `simda-proto`.

pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod server;
pub mod watcher;
