//! Live packet capture feeding the traffic-top families.
//!
//! The capture runs on its own named thread (pcap reads are blocking) and
//! flushes the packets parsed since the last flush downstream once per
//! second. A poll timeout is not an error; any other capture failure
//! disables both packet-derived families and ends the thread.
//!
//! Only ARP and IPv4 frames are kept; IPv6 is intentionally dropped. The
//! `any` pseudo-device delivers Linux cooked frames, so SLL and SLL2
//! framing are recognised next to plain Ethernet.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pcap::{Active, Capture, Linktype};
use pnet_packet::arp::ArpPacket;
use pnet_packet::ip::IpNextHeaderProtocol;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use pnet_packet::Packet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::MetricError;
use crate::flags::{Family, MetricFlags};

/// Capture poll timeout. Part of the observable behaviour.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Downstream flush cadence, matching the other collectors' tick.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const SNAP_LEN: i32 = 65535;

const GATE: &[Family] = &[Family::NetTopByProtocol, Family::NetTopByConnection];

#[derive(Debug, Clone, PartialEq)]
pub struct PacketInfo {
    pub source_ip: IpAddr,
    pub destination_ip: IpAddr,
    pub protocol: String,
    pub source_port: u16,
    pub destination_port: u16,
    pub payload_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

impl PacketInfo {
    /// Bucket key for per-connection traffic accounting.
    pub fn connection_id(&self) -> String {
        format!(
            "{} {}:{}-{}:{}",
            self.protocol,
            self.source_ip,
            self.source_port,
            self.destination_ip,
            self.destination_port
        )
    }
}

/// Packets accumulated over one flush interval.
pub type PacketList = Vec<PacketInfo>;

// ---------------------------------------------------------------------------
// Frame dissection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkFraming {
    Ethernet,
    LinuxSll,
    LinuxSll2,
}

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_ARP: u16 = 0x0806;

/// Strips the link header, returning the ethertype and its payload.
fn ethertype_and_payload(framing: LinkFraming, data: &[u8]) -> Option<(u16, &[u8])> {
    match framing {
        LinkFraming::Ethernet if data.len() > 14 => {
            Some((u16::from_be_bytes([data[12], data[13]]), &data[14..]))
        }
        LinkFraming::LinuxSll if data.len() > 16 => {
            Some((u16::from_be_bytes([data[14], data[15]]), &data[16..]))
        }
        LinkFraming::LinuxSll2 if data.len() > 20 => {
            Some((u16::from_be_bytes([data[0], data[1]]), &data[20..]))
        }
        _ => None,
    }
}

fn transport_name(proto: IpNextHeaderProtocol) -> String {
    match proto.0 {
        1 => "ICMPv4".to_string(),
        2 => "IGMP".to_string(),
        6 => "TCP".to_string(),
        17 => "UDP".to_string(),
        47 => "GRE".to_string(),
        50 => "ESP".to_string(),
        51 => "AH".to_string(),
        58 => "ICMPv6".to_string(),
        132 => "SCTP".to_string(),
        n => format!("IP({n})"),
    }
}

/// Dissects one captured frame into a [`PacketInfo`], or `None` for frames
/// outside the contract (IPv6, non-IP, truncated).
pub(crate) fn parse_packet(
    framing: LinkFraming,
    data: &[u8],
    capture_len: u32,
    timestamp: DateTime<Utc>,
) -> Option<PacketInfo> {
    let (ethertype, payload) = ethertype_and_payload(framing, data)?;

    match ethertype {
        ETHERTYPE_ARP => {
            let arp = ArpPacket::new(payload)?;
            Some(PacketInfo {
                source_ip: IpAddr::V4(arp.get_sender_proto_addr()),
                destination_ip: IpAddr::V4(arp.get_target_proto_addr()),
                protocol: "ARP".to_string(),
                source_port: 0,
                destination_port: 0,
                // Header plus trailing padding, the whole link payload.
                payload_bytes: payload.len() as u64,
                timestamp,
            })
        }
        ETHERTYPE_IPV4 => {
            let ip = Ipv4Packet::new(payload)?;
            let proto = ip.get_next_level_protocol();
            let (source_port, destination_port) = match proto.0 {
                6 => TcpPacket::new(ip.payload())
                    .map(|t| (t.get_source(), t.get_destination()))
                    .unwrap_or((0, 0)),
                17 => UdpPacket::new(ip.payload())
                    .map(|u| (u.get_source(), u.get_destination()))
                    .unwrap_or((0, 0)),
                _ => (0, 0),
            };
            Some(PacketInfo {
                source_ip: IpAddr::V4(ip.get_source()),
                destination_ip: IpAddr::V4(ip.get_destination()),
                protocol: transport_name(proto),
                source_port,
                destination_port,
                payload_bytes: capture_len as u64,
                timestamp,
            })
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Capture thread
// ---------------------------------------------------------------------------

fn open_capture(interface: &str) -> Result<(Capture<Active>, LinkFraming), MetricError> {
    let capture = Capture::from_device(interface)
        .map_err(|e| MetricError::Capture(e.to_string()))?
        .snaplen(SNAP_LEN)
        .timeout(POLL_TIMEOUT.as_millis() as i32)
        .open()
        .map_err(|e| MetricError::Capture(e.to_string()))?;

    let datalink = capture.get_datalink();
    let framing = if datalink == Linktype::LINUX_SLL {
        LinkFraming::LinuxSll
    } else if datalink == Linktype::LINUX_SLL2 {
        LinkFraming::LinuxSll2
    } else {
        LinkFraming::Ethernet
    };
    Ok((capture, framing))
}

fn capture_loop(
    mut capture: Capture<Active>,
    framing: LinkFraming,
    flags: Arc<MetricFlags>,
    cancel: CancellationToken,
    tx: mpsc::Sender<PacketList>,
) {
    let mut pending = PacketList::new();
    let mut last_flush = Instant::now();

    loop {
        if cancel.is_cancelled() {
            debug!("packet collector stopped");
            return;
        }

        let gate_open = GATE.iter().any(|f| flags.enabled(*f));

        if last_flush.elapsed() >= FLUSH_INTERVAL {
            last_flush = Instant::now();
            if gate_open {
                if tx.blocking_send(std::mem::take(&mut pending)).is_err() {
                    return;
                }
            } else {
                pending.clear();
            }
        }

        if !gate_open {
            // Keep the session open so a config reload resumes emission,
            // but stop pulling packets while disabled.
            std::thread::sleep(POLL_TIMEOUT);
            continue;
        }

        match capture.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let timestamp = DateTime::from_timestamp(ts.tv_sec, ts.tv_usec as u32 * 1000)
                    .unwrap_or_default();
                if let Some(info) =
                    parse_packet(framing, packet.data, packet.header.caplen, timestamp)
                {
                    pending.push(info);
                }
            }
            // The poll timeout just means the wire was quiet.
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                error!(error = %e, "packet collector error, metrics disabled");
                for family in GATE {
                    flags.disable(*family);
                }
                return;
            }
        }
    }
}

/// Opens the capture session and starts the capture thread. A failed open
/// clears both gate flags and hands the error back.
pub fn spawn(
    interface: String,
    flags: Arc<MetricFlags>,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<PacketList>, MetricError> {
    let (capture, framing) = match open_capture(&interface) {
        Ok(v) => v,
        Err(e) => {
            for family in GATE {
                flags.disable(*family);
            }
            return Err(e);
        }
    };

    let (tx, rx) = mpsc::channel(1);
    std::thread::Builder::new()
        .name("packet-capture".to_string())
        .spawn(move || capture_loop(capture, framing, flags, cancel, tx))
        .map_err(|e| MetricError::Capture(e.to_string()))?;

    Ok(rx)
}
