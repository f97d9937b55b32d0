//! Kernel and network samplers feeding the per-client snapshot streamer.
//!
//! Each metric family pairs a stateless reader (pure functions over
//! [`SystemPaths`]) with a 1 Hz collector task; [`SnapshotStreamer`] fans the
//! collector channels into time-windowed [`simda_proto::pb::Snapshot`]s.
//! Linux only — everything here reads procfs, sysfs or a live capture.

mod collector;
pub mod connections;
pub mod cpu;
pub mod disk_io;
pub mod disk_usage;
mod error;
pub mod flags;
pub mod loadavg;
pub mod packets;
mod paths;
pub mod streamer;

pub use error::MetricError;
pub use flags::{Family, MetricFlags};
pub use paths::SystemPaths;
pub use streamer::SnapshotStreamer;
