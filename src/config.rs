//! YAML daemon configuration with `${NAME}` environment expansion.
//!
//! Every key has a default, so a missing or partial file still yields a
//! usable configuration. The `metrics.*` flags are the hot-reloadable part:
//! the watcher re-applies them to the shared [`MetricFlags`] record while
//! the daemon runs. Address, log level and the system roots take effect on
//! restart.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use simda_metrics::{Family, MetricFlags, SystemPaths};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    pub log_level: LogLevel,
    pub metrics: MetricsConfig,
    pub system: SystemConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 50051,
            log_level: LogLevel::Debug,
            metrics: MetricsConfig::default(),
            system: SystemConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub load_avg: bool,
    pub cpu_avg: bool,
    pub disk_io: bool,
    pub disk_usage: bool,
    pub net_connections: bool,
    pub net_connections_states: bool,
    pub net_top_by_protocol: bool,
    pub net_top_by_connection: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            load_avg: true,
            cpu_avg: true,
            disk_io: true,
            disk_usage: true,
            net_connections: true,
            net_connections_states: true,
            net_top_by_protocol: true,
            net_top_by_connection: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    pub proc: String,
    pub sys: String,
    pub dev: String,
    pub run: String,
    pub tcp: String,
    pub tcp6: String,
    pub udp: String,
    pub udp6: String,
    #[serde(rename = "procMountInfo")]
    pub proc_mount_info: String,
    pub interface: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            proc: "/proc".to_string(),
            sys: "/sys".to_string(),
            dev: "/dev".to_string(),
            run: "/run".to_string(),
            tcp: "/proc/net/tcp".to_string(),
            tcp6: "/proc/net/tcp6".to_string(),
            udp: "/proc/net/udp".to_string(),
            udp6: "/proc/net/udp6".to_string(),
            proc_mount_info: String::new(),
            interface: "any".to_string(),
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let expanded = expand_env(&text);
        let cfg: Self = serde_yaml::from_str(&expanded)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn system_paths(&self) -> SystemPaths {
        SystemPaths {
            proc: self.system.proc.clone().into(),
            sys: self.system.sys.clone().into(),
            dev: self.system.dev.clone().into(),
            run: self.system.run.clone().into(),
            tcp: self.system.tcp.clone().into(),
            tcp6: self.system.tcp6.clone().into(),
            udp: self.system.udp.clone().into(),
            udp6: self.system.udp6.clone().into(),
            proc_mount_info: if self.system.proc_mount_info.is_empty() {
                None
            } else {
                Some(self.system.proc_mount_info.clone().into())
            },
            interface: self.system.interface.clone(),
        }
    }

    /// Writes the configured flag values into the shared record. This is the
    /// only path that can re-enable a self-disabled family.
    pub fn apply_metrics(&self, flags: &MetricFlags) {
        let m = &self.metrics;
        flags.set(Family::LoadAvg, m.load_avg);
        flags.set(Family::CpuAvg, m.cpu_avg);
        flags.set(Family::DiskIo, m.disk_io);
        flags.set(Family::DiskUsage, m.disk_usage);
        flags.set(Family::NetConnections, m.net_connections);
        flags.set(Family::NetConnectionStates, m.net_connections_states);
        flags.set(Family::NetTopByProtocol, m.net_top_by_protocol);
        flags.set(Family::NetTopByConnection, m.net_top_by_connection);
    }
}

/// Replaces every `${NAME}` occurrence with the environment value, or the
/// empty string when the variable is unset.
fn expand_env(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
