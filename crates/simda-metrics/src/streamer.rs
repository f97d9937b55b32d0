//! Per-client snapshot streaming engine.
//!
//! [`SnapshotStreamer`] fans in every collector channel, buffers up to
//! `warming` samples per family, and once warm-up completes emits one
//! [`pb::Snapshot`] per `period` seconds, dropping the oldest `period`
//! entries from each buffer after every emission.
//!
//! Warm-up is a conjunction over the enabled families only: it is *in
//! progress* while every enabled family is still short of `warming` entries,
//! so the first enabled family to fill its buffer ends warm-up, and disabled
//! families neither delay nor shortcut it. The observable cadence (first
//! snapshot after roughly `warming` seconds, one per `period` after that) is
//! what the contract guarantees.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use simda_proto::pb;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::connections::{Connection, ConnectionList};
use crate::cpu::CpuSample;
use crate::disk_io::DiskIoMap;
use crate::disk_usage::DiskUsageMap;
use crate::flags::{Family, MetricFlags};
use crate::loadavg::LoadAvgSample;
use crate::packets::PacketList;
use crate::paths::SystemPaths;
use crate::{connections, cpu, disk_io, disk_usage, loadavg, packets};

/// Warm-up completion is re-evaluated on this cadence.
const EMIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct SnapshotStreamer {
    request: pb::Request,
    flags: Arc<MetricFlags>,
    paths: SystemPaths,
    cancel: CancellationToken,
}

// ---------------------------------------------------------------------------
// Collector wiring
// ---------------------------------------------------------------------------

/// One receiver per family; `None` when the prime read failed and the family
/// was recorded disabled for this stream.
struct CollectorInputs {
    load_avg: Option<mpsc::Receiver<LoadAvgSample>>,
    cpu: Option<mpsc::Receiver<CpuSample>>,
    disk_usage: Option<mpsc::Receiver<DiskUsageMap>>,
    disk_io: Option<mpsc::Receiver<DiskIoMap>>,
    connections: Option<mpsc::Receiver<ConnectionList>>,
    packets: Option<mpsc::Receiver<PacketList>>,
}

fn spawn_logged<T>(
    name: &str,
    result: Result<mpsc::Receiver<T>, crate::MetricError>,
) -> Option<mpsc::Receiver<T>> {
    match result {
        Ok(rx) => Some(rx),
        Err(e) => {
            error!(error = %e, "failed to create {name} collector, metric disabled");
            None
        }
    }
}

impl CollectorInputs {
    fn start(paths: &SystemPaths, flags: &Arc<MetricFlags>, cancel: &CancellationToken) -> Self {
        Self {
            load_avg: spawn_logged(
                "load average",
                loadavg::spawn(paths.clone(), flags.clone(), cancel.clone()),
            ),
            cpu: spawn_logged(
                "cpu average",
                cpu::spawn(paths.clone(), flags.clone(), cancel.clone()),
            ),
            disk_usage: spawn_logged(
                "disk usage",
                disk_usage::spawn(paths.clone(), flags.clone(), cancel.clone()),
            ),
            disk_io: spawn_logged(
                "disk i/o",
                disk_io::spawn(paths.clone(), flags.clone(), cancel.clone()),
            ),
            connections: spawn_logged(
                "network connections",
                connections::spawn(paths.clone(), flags.clone(), cancel.clone()),
            ),
            packets: spawn_logged(
                "network packets",
                packets::spawn(paths.interface.clone(), flags.clone(), cancel.clone()),
            ),
        }
    }
}

/// Receives from an optional channel. A missing channel never yields; a
/// closed one (collector self-disabled) stops yielding as well.
async fn recv_or_never<T>(rx: &mut Option<mpsc::Receiver<T>>) -> T {
    match rx {
        Some(channel) => match channel.recv().await {
            Some(value) => value,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SampleBuffers {
    load_avg: Vec<LoadAvgSample>,
    cpu: Vec<CpuSample>,
    disk_usage: Vec<DiskUsageMap>,
    disk_io: Vec<DiskIoMap>,
    connections: Vec<ConnectionList>,
    packets: Vec<PacketList>,
}

fn push_capped<T>(buf: &mut Vec<T>, value: T, cap: usize) {
    // The collector over-produced for this window; drop silently.
    if buf.len() < cap {
        buf.push(value);
    }
}

impl SampleBuffers {
    /// Drops the oldest `period` entries from each buffer; a buffer with
    /// fewer entries is left empty.
    fn shift(&mut self, period: usize) {
        fn drain<T>(buf: &mut Vec<T>, period: usize) {
            buf.drain(..period.min(buf.len()));
        }
        drain(&mut self.load_avg, period);
        drain(&mut self.cpu, period);
        drain(&mut self.disk_usage, period);
        drain(&mut self.disk_io, period);
        drain(&mut self.connections, period);
        drain(&mut self.packets, period);
    }
}

/// Warm-up is in progress while every *enabled* family is still short of
/// `warming` entries; disabled families are neutral. It completes when any
/// enabled family reaches `warming`, or when no family is enabled at all.
fn warming_in_progress(flags: &MetricFlags, bufs: &SampleBuffers, warming: usize) -> bool {
    let load_avg = flags.enabled(Family::LoadAvg);
    let cpu_avg = flags.enabled(Family::CpuAvg);
    let disk_usage = flags.enabled(Family::DiskUsage);
    let disk_io = flags.enabled(Family::DiskIo);
    let connections =
        flags.enabled(Family::NetConnections) || flags.enabled(Family::NetConnectionStates);
    let packets =
        flags.enabled(Family::NetTopByConnection) || flags.enabled(Family::NetTopByProtocol);

    if !(load_avg || cpu_avg || disk_usage || disk_io || connections || packets) {
        return false;
    }

    (!load_avg || bufs.load_avg.len() < warming)
        && (!cpu_avg || bufs.cpu.len() < warming)
        && (!disk_usage || bufs.disk_usage.len() < warming)
        && (!disk_io || bufs.disk_io.len() < warming)
        && (!connections || bufs.connections.len() < warming)
        && (!packets || bufs.packets.len() < warming)
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// `None` when the buffer is empty — an enabled family with nothing sampled
/// yet contributes no aggregate rather than a NaN-filled one.
fn average_load(data: &[LoadAvgSample]) -> Option<pb::LoadAverage> {
    if data.is_empty() {
        return None;
    }
    let mut result = pb::LoadAverage::default();
    for sample in data {
        result.one += sample.one;
        result.five += sample.five;
        result.fifteen += sample.fifteen;
    }
    let n = data.len() as f64;
    result.one /= n;
    result.five /= n;
    result.fifteen /= n;
    Some(result)
}

fn average_cpu(data: &[CpuSample]) -> Option<pb::CpuAverage> {
    if data.is_empty() {
        return None;
    }
    let mut result = pb::CpuAverage::default();
    for sample in data {
        result.user += sample.user;
        result.system += sample.system;
        result.idle += sample.idle;
    }
    let n = data.len() as f64;
    result.user /= n;
    result.system /= n;
    result.idle /= n;
    Some(result)
}

/// Keyed by mount point; the first entry seeds the key set, later entries
/// add into existing keys only, then everything is divided by the buffer
/// length.
fn average_disk_usage(data: &[DiskUsageMap]) -> Vec<pb::DiskUsage> {
    // Empty buffer: no rows, and no zero-length division below.
    let Some(first) = data.first() else {
        return Vec::new();
    };

    let mut avg: HashMap<&str, pb::DiskUsage> = first
        .values()
        .map(|stat| {
            (
                stat.mount_point.as_str(),
                pb::DiskUsage {
                    device: stat.device.clone(),
                    mount_point: stat.mount_point.clone(),
                    ..Default::default()
                },
            )
        })
        .collect();

    for item in data {
        for (mount_point, stat) in item {
            if let Some(entry) = avg.get_mut(mount_point.as_str()) {
                entry.usage_percent += stat.usage_percent;
                entry.usage += stat.usage;
                entry.inode_available_percent += stat.inode_available_percent;
                entry.inode_count += stat.inode_count;
            }
        }
    }

    let n = data.len() as f64;
    avg.into_values()
        .map(|mut entry| {
            entry.usage_percent /= n;
            entry.usage /= n;
            entry.inode_available_percent /= n;
            entry.inode_count /= n;
            entry
        })
        .collect()
}

/// Same seeding scheme as disk usage, keyed by device name.
fn average_disk_io(data: &[DiskIoMap]) -> Vec<pb::DiskIo> {
    // Empty buffer: no rows, and no zero-length division below.
    let Some(first) = data.first() else {
        return Vec::new();
    };

    let mut avg: HashMap<&str, pb::DiskIo> = first
        .values()
        .map(|stat| {
            (
                stat.name.as_str(),
                pb::DiskIo {
                    name: stat.name.clone(),
                    ..Default::default()
                },
            )
        })
        .collect();

    for item in data {
        for (name, stat) in item {
            if let Some(entry) = avg.get_mut(name.as_str()) {
                entry.tps += stat.tps;
                entry.rd_speed += stat.rd_speed;
                entry.wr_speed += stat.wr_speed;
            }
        }
    }

    let n = data.len() as f64;
    avg.into_values()
        .map(|mut entry| {
            entry.tps /= n;
            entry.rd_speed /= n;
            entry.wr_speed /= n;
            entry
        })
        .collect()
}

/// Deduplicates across the whole buffer by socket id, keeping the last
/// observation of each socket.
fn dedup_connections(data: &[ConnectionList]) -> HashMap<&str, &Connection> {
    let mut dedup = HashMap::new();
    for sample in data {
        for conn in sample {
            dedup.insert(conn.socket_id.as_str(), conn);
        }
    }
    dedup
}

fn sock_addr(addr: &crate::connections::SockAddr) -> pb::SockAddr {
    pb::SockAddr {
        ip: addr.ip.to_string(),
        port: u32::from(addr.port),
    }
}

fn connection_rows(data: &[ConnectionList]) -> Vec<pb::NetConnection> {
    dedup_connections(data)
        .into_values()
        .map(|conn| pb::NetConnection {
            protocol: conn.protocol.to_string(),
            process: conn.process.as_ref().map(|p| pb::Process {
                pid: p.pid,
                cmd_line: p.cmd_line.clone(),
            }),
            user: conn.user.clone(),
            local_addr: Some(sock_addr(&conn.local_addr)),
            foreign_addr: Some(sock_addr(&conn.foreign_addr)),
            state: conn.state.to_string(),
            user_id: conn.user_id,
        })
        .collect()
}

fn state_counts(data: &[ConnectionList]) -> Vec<pb::NetConnectionStates> {
    let mut states: HashMap<&str, u32> = HashMap::new();
    for conn in dedup_connections(data).into_values() {
        *states.entry(conn.state).or_default() += 1;
    }
    states
        .into_iter()
        .map(|(state, count)| pb::NetConnectionStates {
            state: state.to_string(),
            count,
        })
        .collect()
}

fn top_by_protocol(data: &[PacketList]) -> Vec<pb::NetTopByProtocol> {
    let mut protocols: HashMap<&str, u64> = HashMap::new();
    let mut total_bytes = 0u64;
    for sample in data {
        for packet in sample {
            total_bytes += packet.payload_bytes;
            *protocols.entry(packet.protocol.as_str()).or_default() += packet.payload_bytes;
        }
    }

    protocols
        .into_iter()
        .map(|(protocol, bytes)| pb::NetTopByProtocol {
            protocol: protocol.to_string(),
            bytes,
            percent: if total_bytes > 0 {
                bytes as f64 / total_bytes as f64 * 100.0
            } else {
                0.0
            },
        })
        .collect()
}

/// Buckets packets by `"protocol src:port-dst:port"`. The percent column is
/// `(warming / bytes) * 100` — a wire-contract quirk consumers depend on.
fn top_by_connection(data: &[PacketList], warming: u32) -> Vec<pb::NetTopByConnection> {
    let mut buckets: HashMap<String, Vec<&crate::packets::PacketInfo>> = HashMap::new();
    for sample in data {
        for packet in sample {
            buckets.entry(packet.connection_id()).or_default().push(packet);
        }
    }

    buckets
        .into_values()
        .map(|packets| {
            let first = packets[0];
            let bytes: u64 = packets.iter().map(|p| p.payload_bytes).sum();
            let percent = if bytes > 0 {
                f64::from(warming) / bytes as f64 * 100.0
            } else {
                0.0
            };
            pb::NetTopByConnection {
                protocol: first.protocol.clone(),
                bytes,
                percent,
                source_addr: Some(pb::SockAddr {
                    ip: first.source_ip.to_string(),
                    port: u32::from(first.source_port),
                }),
                destination_addr: Some(pb::SockAddr {
                    ip: first.destination_ip.to_string(),
                    port: u32::from(first.destination_port),
                }),
            }
        })
        .collect()
}

fn build_snapshot(
    request: &pb::Request,
    flags: &MetricFlags,
    bufs: &SampleBuffers,
) -> pb::Snapshot {
    let enabled = |f: Family| flags.enabled(f);

    pb::Snapshot {
        metrics: Some(pb::EnabledMetrics {
            load_avg: enabled(Family::LoadAvg),
            cpu_avg: enabled(Family::CpuAvg),
            disk_io: enabled(Family::DiskIo),
            disk_usage: enabled(Family::DiskUsage),
            net_connections: enabled(Family::NetConnections),
            net_connection_states: enabled(Family::NetConnectionStates),
            net_top_by_protocol: enabled(Family::NetTopByProtocol),
            net_top_by_connection: enabled(Family::NetTopByConnection),
        }),
        load_avg: if enabled(Family::LoadAvg) {
            average_load(&bufs.load_avg)
        } else {
            None
        },
        cpu_avg: if enabled(Family::CpuAvg) {
            average_cpu(&bufs.cpu)
        } else {
            None
        },
        disk_usage: if enabled(Family::DiskUsage) {
            average_disk_usage(&bufs.disk_usage)
        } else {
            Vec::new()
        },
        disk_io: if enabled(Family::DiskIo) {
            average_disk_io(&bufs.disk_io)
        } else {
            Vec::new()
        },
        net_connections: if enabled(Family::NetConnections) {
            connection_rows(&bufs.connections)
        } else {
            Vec::new()
        },
        net_connections_states: if enabled(Family::NetConnectionStates) {
            state_counts(&bufs.connections)
        } else {
            Vec::new()
        },
        net_top_by_protocol: if enabled(Family::NetTopByProtocol) {
            top_by_protocol(&bufs.packets)
        } else {
            Vec::new()
        },
        net_top_by_connection: if enabled(Family::NetTopByConnection) {
            top_by_connection(&bufs.packets, request.warming)
        } else {
            Vec::new()
        },
    }
}

// ---------------------------------------------------------------------------
// SnapshotStreamer
// ---------------------------------------------------------------------------

impl SnapshotStreamer {
    /// `cancel` must already combine server shutdown and client disconnect;
    /// the streamer and its collectors observe nothing else.
    pub fn new(
        request: pb::Request,
        flags: Arc<MetricFlags>,
        paths: SystemPaths,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request,
            flags,
            paths,
            cancel,
        }
    }

    /// Starts the collectors and the fan-in task, returning the snapshot
    /// channel. The channel closes when the cancellation fires.
    pub fn stream(self) -> mpsc::Receiver<pb::Snapshot> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(self.run(tx));
        rx
    }

    async fn run(self, out: mpsc::Sender<pb::Snapshot>) {
        // Ticker first: its phase leads the collectors' 1 s cadence, so the
        // completing tick lands after a full sample wave, not inside one.
        let mut ticker = interval_at(Instant::now() + EMIT_POLL_INTERVAL, EMIT_POLL_INTERVAL);
        let mut inputs = CollectorInputs::start(&self.paths, &self.flags, &self.cancel);
        let mut bufs = SampleBuffers::default();
        let warming = self.request.warming as usize;

        loop {
            // Fan-in until warm-up completes.
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!("snapshot streamer stopped");
                        return;
                    }
                    value = recv_or_never(&mut inputs.load_avg) => {
                        push_capped(&mut bufs.load_avg, value, warming);
                    }
                    value = recv_or_never(&mut inputs.cpu) => {
                        push_capped(&mut bufs.cpu, value, warming);
                    }
                    value = recv_or_never(&mut inputs.disk_usage) => {
                        push_capped(&mut bufs.disk_usage, value, warming);
                    }
                    value = recv_or_never(&mut inputs.disk_io) => {
                        push_capped(&mut bufs.disk_io, value, warming);
                    }
                    value = recv_or_never(&mut inputs.connections) => {
                        push_capped(&mut bufs.connections, value, warming);
                    }
                    value = recv_or_never(&mut inputs.packets) => {
                        push_capped(&mut bufs.packets, value, warming);
                    }
                    _ = ticker.tick() => {
                        if !warming_in_progress(&self.flags, &bufs, warming) {
                            break;
                        }
                    }
                }
            }

            let snapshot = build_snapshot(&self.request, &self.flags, &bufs);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("snapshot streamer stopped");
                    return;
                }
                sent = out.send(snapshot) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            debug!("snapshot sent to client");
            bufs.shift(self.request.period as usize);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
