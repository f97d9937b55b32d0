//! Stream-printing client: connects, subscribes, renders each snapshot as a
//! compact text block.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use simda_proto::pb;
use simda_proto::pb::simda_client::SimdaClient;

use crate::cli::ClientCli;

pub async fn run(opts: &ClientCli) -> Result<()> {
    let endpoint = format!("http://{}:{}", opts.server, opts.port);
    let mut client = SimdaClient::connect(endpoint.clone())
        .await
        .with_context(|| format!("failed to connect to server {endpoint}"))?;

    let request = pb::Request {
        warming: opts.warm,
        period: opts.receive,
    };
    let mut stream = client
        .stream_snapshots(request)
        .await
        .context("stream request rejected")?
        .into_inner();

    eprintln!(
        "warming up for {}s, then one snapshot every {}s (Ctrl-C to stop)",
        opts.warm, opts.receive
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            message = stream.next() => match message {
                Some(snapshot) => print_snapshot(&snapshot.context("stream error")?),
                // Clean end of stream means the daemon went away.
                None => bail!("server terminated"),
            }
        }
    }
}

fn print_snapshot(snapshot: &pb::Snapshot) {
    println!(
        "──── snapshot {} ─────────────────────────────────────────",
        chrono::Local::now().format("%H:%M:%S")
    );

    if let Some(load) = &snapshot.load_avg {
        println!(
            "load average   {:.2} {:.2} {:.2}",
            load.one, load.five, load.fifteen
        );
    }
    if let Some(cpu) = &snapshot.cpu_avg {
        println!(
            "cpu            user {:.1}%  system {:.1}%  idle {:.1}%",
            cpu.user, cpu.system, cpu.idle
        );
    }

    let mut disk_io: Vec<_> = snapshot.disk_io.iter().collect();
    disk_io.sort_by(|a, b| a.name.cmp(&b.name));
    for disk in disk_io {
        println!(
            "disk i/o       {:<12} tps {:.2}  rd {:.2} kB/s  wr {:.2} kB/s",
            disk.name, disk.tps, disk.rd_speed, disk.wr_speed
        );
    }

    let mut disk_usage: Vec<_> = snapshot.disk_usage.iter().collect();
    disk_usage.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
    for usage in disk_usage {
        println!(
            "disk usage     {:<20} {:<12} {:.1}% used, {:.1}% inodes free",
            usage.mount_point, usage.device, usage.usage_percent, usage.inode_available_percent
        );
    }

    if !snapshot.net_connections.is_empty() {
        println!("connections    {} sockets", snapshot.net_connections.len());
    }
    let mut states: Vec<_> = snapshot.net_connections_states.iter().collect();
    states.sort_by(|a, b| b.count.cmp(&a.count));
    for state in states {
        println!("  state        {:<14} {}", state.state, state.count);
    }

    let mut by_protocol: Vec<_> = snapshot.net_top_by_protocol.iter().collect();
    by_protocol.sort_by(|a, b| b.bytes.cmp(&a.bytes));
    for row in by_protocol {
        println!(
            "  protocol     {:<10} {:>10} B  {:.1}%",
            row.protocol, row.bytes, row.percent
        );
    }

    let mut by_connection: Vec<_> = snapshot.net_top_by_connection.iter().collect();
    by_connection.sort_by(|a, b| b.bytes.cmp(&a.bytes));
    for row in by_connection.iter().take(10) {
        let addr = |a: &Option<pb::SockAddr>| {
            a.as_ref()
                .map(|a| format!("{}:{}", a.ip, a.port))
                .unwrap_or_default()
        };
        println!(
            "  talker       {:<6} {} -> {}  {} B",
            row.protocol,
            addr(&row.source_addr),
            addr(&row.destination_addr),
            row.bytes
        );
    }
    println!();
}
