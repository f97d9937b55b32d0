//! Process-wide metric enable flags.
//!
//! One atomic boolean per metric family. Readers: every collector (each
//! tick) and the snapshot builder. Writers: the config watcher (any flag,
//! either direction) and each collector's self-disable path (its own gate
//! only, always to `false`). A self-disabled family stays off until a config
//! reload turns it back on.

use std::sync::atomic::{AtomicBool, Ordering::Relaxed};

/// Metric family identifiers, one per snapshot section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    LoadAvg,
    CpuAvg,
    DiskIo,
    DiskUsage,
    NetConnections,
    NetConnectionStates,
    NetTopByProtocol,
    NetTopByConnection,
}

#[derive(Debug)]
pub struct MetricFlags {
    load_avg: AtomicBool,
    cpu_avg: AtomicBool,
    disk_io: AtomicBool,
    disk_usage: AtomicBool,
    net_connections: AtomicBool,
    net_connection_states: AtomicBool,
    net_top_by_protocol: AtomicBool,
    net_top_by_connection: AtomicBool,
}

impl MetricFlags {
    pub fn all_enabled() -> Self {
        Self {
            load_avg: AtomicBool::new(true),
            cpu_avg: AtomicBool::new(true),
            disk_io: AtomicBool::new(true),
            disk_usage: AtomicBool::new(true),
            net_connections: AtomicBool::new(true),
            net_connection_states: AtomicBool::new(true),
            net_top_by_protocol: AtomicBool::new(true),
            net_top_by_connection: AtomicBool::new(true),
        }
    }

    fn cell(&self, family: Family) -> &AtomicBool {
        match family {
            Family::LoadAvg => &self.load_avg,
            Family::CpuAvg => &self.cpu_avg,
            Family::DiskIo => &self.disk_io,
            Family::DiskUsage => &self.disk_usage,
            Family::NetConnections => &self.net_connections,
            Family::NetConnectionStates => &self.net_connection_states,
            Family::NetTopByProtocol => &self.net_top_by_protocol,
            Family::NetTopByConnection => &self.net_top_by_connection,
        }
    }

    pub fn enabled(&self, family: Family) -> bool {
        self.cell(family).load(Relaxed)
    }

    pub fn set(&self, family: Family, on: bool) {
        self.cell(family).store(on, Relaxed);
    }

    pub fn disable(&self, family: Family) {
        self.set(family, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_is_sticky_until_set() {
        let flags = MetricFlags::all_enabled();
        assert!(flags.enabled(Family::CpuAvg));

        flags.disable(Family::CpuAvg);
        assert!(!flags.enabled(Family::CpuAvg));
        assert!(flags.enabled(Family::LoadAvg));

        flags.set(Family::CpuAvg, true);
        assert!(flags.enabled(Family::CpuAvg));
    }
}
