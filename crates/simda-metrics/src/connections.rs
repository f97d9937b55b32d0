//! Socket-table parsing from `{tcp}`, `{tcp6}`, `{udp}`, `{udp6}` plus
//! process attribution via `{proc}/[pid]/fd` socket links.
//!
//! The kernel prints addresses as `HEX_IP:HEX_PORT` where the IP bytes are
//! little-endian per 32-bit word; the parser reproduces the human-readable
//! textual form. The socket inode (`socket_id`) is the uniquing key within a
//! sample and the correlation key against `/proc/[pid]/fd` links.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;

use nix::unistd::{Uid, User};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::collector::spawn_sampler;
use crate::error::MetricError;
use crate::flags::{Family, MetricFlags};
use crate::paths::SystemPaths;

pub const PROTOCOL_TCP: &str = "tcp";
pub const PROTOCOL_TCP6: &str = "tcp6";
pub const PROTOCOL_UDP: &str = "udp";
pub const PROTOCOL_UDP6: &str = "udp6";

const IPV4_HEX_LEN: usize = 8;
const IPV6_HEX_LEN: usize = 32;
const SOCK_PREFIX: &str = "socket:[";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddr {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmd_line: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    /// Kernel socket inode; unique within one sample.
    pub socket_id: String,
    pub protocol: &'static str,
    pub process: Option<ProcessInfo>,
    pub user: String,
    pub local_addr: SockAddr,
    pub foreign_addr: SockAddr,
    pub state: &'static str,
    pub user_id: u32,
}

pub type ConnectionList = Vec<Connection>;

// ---------------------------------------------------------------------------
// Address and state decoding
// ---------------------------------------------------------------------------

pub(crate) fn state_name(code: u8) -> &'static str {
    match code {
        0x01 => "ESTABLISHED",
        0x02 => "SYN_SENT",
        0x03 => "SYN_RECV",
        0x04 => "FIN_WAIT1",
        0x05 => "FIN_WAIT2",
        0x06 => "TIME_WAIT",
        0x07 => "CLOSE",
        0x08 => "CLOSE_WAIT",
        0x09 => "LAST_ACK",
        0x0a => "LISTEN",
        0x0b => "CLOSING",
        0x0c => "NEW_SYN_RECV",
        _ => "UNKNOWN",
    }
}

fn parse_ipv4(hex: &str) -> Result<Ipv4Addr, MetricError> {
    let v = u32::from_str_radix(hex, 16)
        .map_err(|_| MetricError::parse(format!("netstat: bad ipv4 hex: {hex}")))?;
    Ok(Ipv4Addr::from(v.to_le_bytes()))
}

fn parse_ipv6(hex: &str) -> Result<Ipv6Addr, MetricError> {
    let bad = || MetricError::parse(format!("netstat: bad ipv6 hex: {hex}"));
    let mut bytes = [0u8; 16];
    for (i, chunk) in hex.as_bytes().chunks(8).enumerate() {
        let group = std::str::from_utf8(chunk).map_err(|_| bad())?;
        let v = u32::from_str_radix(group, 16).map_err(|_| bad())?;
        bytes[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
    Ok(Ipv6Addr::from(bytes))
}

pub(crate) fn parse_addr(s: &str) -> Result<SockAddr, MetricError> {
    let (ip_hex, port_hex) = s
        .split_once(':')
        .ok_or_else(|| MetricError::parse(format!("netstat: not enough fields: {s}")))?;

    let ip = match ip_hex.len() {
        IPV4_HEX_LEN => IpAddr::V4(parse_ipv4(ip_hex)?),
        IPV6_HEX_LEN => IpAddr::V6(parse_ipv6(ip_hex)?),
        _ => {
            return Err(MetricError::parse(format!(
                "netstat: bad formatted string: {ip_hex}"
            )))
        }
    };
    let port = u16::from_str_radix(port_hex, 16)
        .map_err(|_| MetricError::parse(format!("netstat: bad port hex: {port_hex}")))?;

    Ok(SockAddr { ip, port })
}

// ---------------------------------------------------------------------------
// Username cache
// ---------------------------------------------------------------------------

/// Lazy uid -> username map, kept for the lifetime of one collector.
#[derive(Debug, Default)]
pub(crate) struct UserCache {
    names: HashMap<u32, String>,
}

impl UserCache {
    fn name_for(&mut self, uid: u32) -> String {
        self.names
            .entry(uid)
            .or_insert_with(|| {
                User::from_uid(Uid::from_raw(uid))
                    .ok()
                    .flatten()
                    .map(|u| u.name)
                    .unwrap_or_else(|| "-".to_string())
            })
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Table parsing
// ---------------------------------------------------------------------------

pub(crate) fn parse_socket_table(
    text: &str,
    protocol: &'static str,
    users: &mut UserCache,
) -> Result<Vec<Connection>, MetricError> {
    let mut table = Vec::new();

    // First line is the column header.
    for line in text.lines().skip(1) {
        let line = line.split('#').next().unwrap_or(line);
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 12 {
            return Err(MetricError::parse(format!(
                "netstat: not enough fields: {}, {fields:?}",
                fields.len()
            )));
        }

        let local_addr = parse_addr(fields[1])?;
        let foreign_addr = parse_addr(fields[2])?;
        let state_code = u8::from_str_radix(fields[3], 16)
            .map_err(|_| MetricError::parse(format!("netstat: bad state: {}", fields[3])))?;
        let user_id: u32 = fields[7]
            .parse()
            .map_err(|_| MetricError::parse(format!("netstat: bad uid: {}", fields[7])))?;

        table.push(Connection {
            socket_id: fields[9].to_string(),
            protocol,
            process: None,
            user: users.name_for(user_id),
            local_addr,
            foreign_addr,
            state: state_name(state_code),
            user_id,
        });
    }
    Ok(table)
}

// ---------------------------------------------------------------------------
// Process attribution
// ---------------------------------------------------------------------------

/// Walks the numeric entries of `{proc}` and attaches `{pid, cmd_line}` to
/// every connection whose socket inode appears among the process's fd links.
pub(crate) fn attach_processes(proc_root: &Path, connections: &mut [Connection]) {
    let Ok(entries) = fs::read_dir(proc_root) else {
        return;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };
        let root = proc_root.join(&name);
        let cmd_line = fs::read_link(root.join("exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let Ok(fd_entries) = fs::read_dir(root.join("fd")) else {
            continue;
        };
        let mut inodes = HashSet::new();
        for fd in fd_entries.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            if let Some(inode) = target
                .strip_prefix(SOCK_PREFIX)
                .and_then(|rest| rest.strip_suffix(']'))
            {
                inodes.insert(inode.to_string());
            }
        }
        if inodes.is_empty() {
            continue;
        }

        for conn in connections.iter_mut() {
            if inodes.contains(&conn.socket_id) {
                conn.process = Some(ProcessInfo {
                    pid,
                    cmd_line: cmd_line.clone(),
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reader + collector
// ---------------------------------------------------------------------------

pub(crate) fn read_connections(
    paths: &SystemPaths,
    users: &mut UserCache,
) -> Result<ConnectionList, MetricError> {
    let tables = [
        (&paths.tcp, PROTOCOL_TCP),
        (&paths.tcp6, PROTOCOL_TCP6),
        (&paths.udp, PROTOCOL_UDP),
        (&paths.udp6, PROTOCOL_UDP6),
    ];

    let mut connections = Vec::new();
    for (path, protocol) in tables {
        let text = fs::read_to_string(path)?;
        connections.extend(parse_socket_table(&text, protocol, users)?);
    }
    attach_processes(&paths.proc, &mut connections);
    Ok(connections)
}

/// Primes the reader and starts the 1 Hz collector. One gate covers both
/// connection-derived families.
pub fn spawn(
    paths: SystemPaths,
    flags: Arc<MetricFlags>,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<ConnectionList>, MetricError> {
    const GATE: &[Family] = &[Family::NetConnections, Family::NetConnectionStates];

    let mut users = UserCache::default();
    if let Err(e) = read_connections(&paths, &mut users) {
        for family in GATE {
            flags.disable(*family);
        }
        return Err(e);
    }

    Ok(spawn_sampler("connections", flags, GATE, cancel, move || {
        read_connections(&paths, &mut users)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TCP_HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

    #[test]
    fn decodes_little_endian_ipv4() {
        let addr = parse_addr("7C01A8C0:9F52").unwrap();
        assert_eq!(addr.ip, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 124)));
        assert_eq!(addr.port, 40786);
    }

    #[test]
    fn decodes_word_swapped_ipv6() {
        let addr = parse_addr("00000000000000000000000001000000:0035").unwrap();
        assert_eq!(addr.ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(addr.port, 0x35);
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(parse_addr("7C01A8C:9F52").is_err()); // 7 hex chars
        assert!(parse_addr("7C01A8C0FF:9F52").is_err()); // 10 hex chars
        assert!(parse_addr("7C01A8C0").is_err()); // no port
        assert!(parse_addr("ZZZZZZZZ:9F52").is_err());
    }

    #[test]
    fn maps_state_codes() {
        assert_eq!(state_name(0x01), "ESTABLISHED");
        assert_eq!(state_name(0x0a), "LISTEN");
        assert_eq!(state_name(0x0c), "NEW_SYN_RECV");
        assert_eq!(state_name(0x0d), "UNKNOWN");
        assert_eq!(state_name(0x00), "UNKNOWN");
    }

    #[test]
    fn parses_a_socket_table_row() {
        let text = format!(
            "{TCP_HEADER}\n   0: 0100007F:0277 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0\n"
        );
        let mut users = UserCache::default();
        let table = parse_socket_table(&text, PROTOCOL_TCP, &mut users).unwrap();

        assert_eq!(table.len(), 1);
        let conn = &table[0];
        assert_eq!(conn.protocol, "tcp");
        assert_eq!(conn.local_addr.ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(conn.local_addr.port, 0x277);
        assert_eq!(conn.state, "LISTEN");
        assert_eq!(conn.user_id, 0);
        assert_eq!(conn.socket_id, "12345");
        assert!(conn.process.is_none());
    }

    #[test]
    fn short_rows_are_parse_errors() {
        let text = format!("{TCP_HEADER}\n   0: 0100007F:0277 00000000:0000 0A\n");
        let mut users = UserCache::default();
        assert!(parse_socket_table(&text, PROTOCOL_TCP, &mut users).is_err());
    }

    #[test]
    fn header_only_table_is_empty() {
        let mut users = UserCache::default();
        let table = parse_socket_table(TCP_HEADER, PROTOCOL_TCP, &mut users).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn attaches_processes_by_socket_inode() {
        let dir = tempfile::tempdir().unwrap();
        let proc = dir.path();

        let pid_dir = proc.join("4242");
        fs::create_dir_all(pid_dir.join("fd")).unwrap();
        std::os::unix::fs::symlink("/usr/bin/testd", pid_dir.join("exe")).unwrap();
        std::os::unix::fs::symlink("socket:[12345]", pid_dir.join("fd").join("3")).unwrap();
        fs::File::create(proc.join("not-a-pid"))
            .unwrap()
            .write_all(b"")
            .unwrap();

        let mut connections = vec![
            Connection {
                socket_id: "12345".to_string(),
                protocol: PROTOCOL_TCP,
                process: None,
                user: "-".to_string(),
                local_addr: parse_addr("0100007F:0277").unwrap(),
                foreign_addr: parse_addr("00000000:0000").unwrap(),
                state: "LISTEN",
                user_id: 0,
            },
            Connection {
                socket_id: "99999".to_string(),
                protocol: PROTOCOL_TCP,
                process: None,
                user: "-".to_string(),
                local_addr: parse_addr("0100007F:0278").unwrap(),
                foreign_addr: parse_addr("00000000:0000").unwrap(),
                state: "LISTEN",
                user_id: 0,
            },
        ];

        attach_processes(proc, &mut connections);

        let process = connections[0].process.as_ref().unwrap();
        assert_eq!(process.pid, 4242);
        assert_eq!(process.cmd_line, "/usr/bin/testd");
        assert!(connections[1].process.is_none());
    }
}
