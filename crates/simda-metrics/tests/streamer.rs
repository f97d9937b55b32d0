//! Streamer integration tests against a synthetic procfs/sysfs tree.
//!
//! The packet families are expected to self-disable here: opening a live
//! capture needs capabilities a test runner usually lacks, and the streamer
//! must degrade gracefully either way.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use simda_metrics::{Family, MetricFlags, SnapshotStreamer, SystemPaths};
use simda_proto::pb;
use tokio_util::sync::CancellationToken;

const TCP_HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";
const TCP_ROW: &str = "   0: 0100007F:0277 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0";

/// Builds a fake root with every file-backed source populated.
fn fake_roots(dir: &Path) -> SystemPaths {
    let proc = dir.join("proc");
    let sys = dir.join("sys");
    fs::create_dir_all(proc.join("1")).unwrap();
    fs::create_dir_all(proc.join("net")).unwrap();
    fs::create_dir_all(sys.join("block")).unwrap();

    fs::write(proc.join("loadavg"), "0.50 0.40 0.30 1/100 4242\n").unwrap();
    fs::write(
        proc.join("stat"),
        "cpu 1826207 68727 673820 42671281 86015 158628 47813 0 0 0\n",
    )
    .unwrap();
    fs::write(proc.join("uptime"), "38716.67 581428.07\n").unwrap();
    fs::write(proc.join("filesystems"), "nodev\ttmpfs\n\text4\n").unwrap();
    fs::write(
        proc.join("1").join("mountinfo"),
        format!(
            "22 1 8:1 / / rw,relatime shared:1 - ext4 {} rw\n",
            "/dev/sda1"
        ),
    )
    .unwrap();

    // One LISTEN socket per table flavour; v6 tables stay header-only.
    fs::write(proc.join("net").join("tcp"), format!("{TCP_HEADER}\n{TCP_ROW}\n")).unwrap();
    fs::write(proc.join("net").join("tcp6"), format!("{TCP_HEADER}\n")).unwrap();
    fs::write(proc.join("net").join("udp"), format!("{TCP_HEADER}\n")).unwrap();
    fs::write(proc.join("net").join("udp6"), format!("{TCP_HEADER}\n")).unwrap();

    let sda = sys.join("block").join("sda");
    fs::create_dir_all(&sda).unwrap();
    fs::write(sda.join("stat"), "868236 185895 87551823 40173900\n").unwrap();

    SystemPaths {
        tcp: proc.join("net").join("tcp"),
        tcp6: proc.join("net").join("tcp6"),
        udp: proc.join("net").join("udp"),
        udp6: proc.join("net").join("udp6"),
        proc,
        sys,
        dev: dir.join("dev"),
        run: dir.join("run"),
        proc_mount_info: None,
        interface: "any".to_string(),
    }
}

async fn first_snapshot(rx: &mut tokio::sync::mpsc::Receiver<pb::Snapshot>) -> pb::Snapshot {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no snapshot within warm-up budget")
        .expect("stream closed before the first snapshot")
}

#[tokio::test(flavor = "multi_thread")]
async fn emits_file_backed_families_after_warm_up() {
    let dir = tempfile::tempdir().unwrap();
    let paths = fake_roots(dir.path());
    let flags = Arc::new(MetricFlags::all_enabled());
    let cancel = CancellationToken::new();

    let request = pb::Request {
        warming: 1,
        period: 1,
    };
    let streamer = SnapshotStreamer::new(request, flags.clone(), paths, cancel.clone());
    let mut rx = streamer.stream();

    let snapshot = first_snapshot(&mut rx).await;
    let metrics = snapshot.metrics.as_ref().unwrap();

    assert!(metrics.load_avg);
    assert!(metrics.cpu_avg);
    assert!(metrics.disk_io);
    assert!(metrics.disk_usage);
    assert!(metrics.net_connections);
    assert!(metrics.net_connection_states);

    let load = snapshot.load_avg.as_ref().unwrap();
    assert!((load.one - 0.50).abs() < 1e-9);
    assert!((load.five - 0.40).abs() < 1e-9);

    let cpu = snapshot.cpu_avg.as_ref().unwrap();
    assert!(cpu.user + cpu.system + cpu.idle <= 100.0 + 1e-9);

    assert_eq!(snapshot.disk_io.len(), 1);
    assert_eq!(snapshot.disk_io[0].name, "sda");
    assert_eq!(snapshot.disk_usage.len(), 1);
    assert_eq!(snapshot.disk_usage[0].mount_point, "/");

    assert_eq!(snapshot.net_connections.len(), 1);
    assert_eq!(snapshot.net_connections[0].state, "LISTEN");
    assert_eq!(snapshot.net_connections_states.len(), 1);
    assert_eq!(snapshot.net_connections_states[0].count, 1);

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn broken_prime_disables_only_that_family() {
    let dir = tempfile::tempdir().unwrap();
    let paths = fake_roots(dir.path());
    // Too few fields: the cpu prime read must fail.
    fs::write(paths.proc.join("stat"), "cpu 1 2 3\n").unwrap();

    let flags = Arc::new(MetricFlags::all_enabled());
    let cancel = CancellationToken::new();
    let request = pb::Request {
        warming: 1,
        period: 1,
    };
    let mut rx = SnapshotStreamer::new(request, flags.clone(), paths, cancel.clone()).stream();

    let snapshot = first_snapshot(&mut rx).await;
    let metrics = snapshot.metrics.as_ref().unwrap();

    assert!(!metrics.cpu_avg);
    assert!(snapshot.cpu_avg.is_none());
    assert!(!flags.enabled(Family::CpuAvg));

    assert!(metrics.load_avg);
    assert!(snapshot.load_avg.is_some());

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn disabling_a_flag_removes_the_family_from_later_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let paths = fake_roots(dir.path());
    let flags = Arc::new(MetricFlags::all_enabled());
    let cancel = CancellationToken::new();
    let request = pb::Request {
        warming: 1,
        period: 1,
    };
    let mut rx = SnapshotStreamer::new(request, flags.clone(), paths, cancel.clone()).stream();

    let snapshot = first_snapshot(&mut rx).await;
    assert!(snapshot.load_avg.is_some());

    flags.disable(Family::LoadAvg);

    // The flip may race one in-flight emission; the one after must omit it.
    let next = first_snapshot(&mut rx).await;
    let settled = if next.load_avg.is_some() {
        first_snapshot(&mut rx).await
    } else {
        next
    };
    assert!(settled.load_avg.is_none());
    assert!(!settled.metrics.as_ref().unwrap().load_avg);
    assert!(settled.cpu_avg.is_some());

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn mid_stream_reader_failure_self_disables_the_family() {
    let dir = tempfile::tempdir().unwrap();
    let paths = fake_roots(dir.path());
    let stat_path = paths.proc.join("stat");
    let flags = Arc::new(MetricFlags::all_enabled());
    let cancel = CancellationToken::new();
    let request = pb::Request {
        warming: 1,
        period: 1,
    };
    let mut rx = SnapshotStreamer::new(request, flags.clone(), paths, cancel.clone()).stream();

    let first = first_snapshot(&mut rx).await;
    assert!(first.cpu_avg.is_some());

    // Break the source: the next cpu tick fails, and the collector must
    // disable the family exactly once and go quiet.
    fs::remove_file(&stat_path).unwrap();

    let disabled = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = first_snapshot(&mut rx).await;
            if snapshot.cpu_avg.is_none() {
                break snapshot;
            }
        }
    })
    .await
    .expect("cpu family never left the stream");

    assert!(!disabled.metrics.as_ref().unwrap().cpu_avg);
    assert!(!flags.enabled(Family::CpuAvg));
    // The other file-backed families keep streaming.
    assert!(disabled.load_avg.is_some());

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_closes_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let paths = fake_roots(dir.path());
    let flags = Arc::new(MetricFlags::all_enabled());
    let cancel = CancellationToken::new();

    // Long warm-up: cancel mid-warm-up, before anything is emitted.
    let request = pb::Request {
        warming: 120,
        period: 5,
    };
    let mut rx = SnapshotStreamer::new(request, flags, paths, cancel.clone()).stream();

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if rx.recv().await.is_none() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "output channel not closed after cancellation");
}
