//! Block-device throughput from `{sys}/block/{dev}/stat`.
//!
//! Accepts both the 4-field legacy stat layout and the extended (>= 11
//! field) layout; discard counters are folded in when the kernel provides
//! them. Rates are normalised against `{proc}/uptime` field 0 with the
//! decimal point removed, preserving the units the wire contract was
//! observed with.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::collector::spawn_sampler;
use crate::error::MetricError;
use crate::flags::{Family, MetricFlags};
use crate::paths::SystemPaths;

#[derive(Debug, Clone, PartialEq)]
pub struct DiskIoStat {
    pub name: String,
    pub tps: f64,
    pub rd_speed: f64,
    pub wr_speed: f64,
}

/// Per-device stats keyed by block-device name.
pub type DiskIoMap = HashMap<String, DiskIoStat>;

/// Raw counters from one block stat row.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct BlockCounters {
    pub rd_ios: u64,
    pub rd_sectors: u64,
    pub wr_ios: u64,
    pub wr_sectors: u64,
    pub dc_ios: u64,
}

impl BlockCounters {
    pub(crate) fn into_stat(self, name: &str, uptime: u64) -> DiskIoStat {
        let uptime = uptime as f64;
        DiskIoStat {
            name: name.to_string(),
            tps: (self.rd_ios + self.wr_ios + self.dc_ios) as f64 / uptime * 100.0,
            rd_speed: (self.rd_sectors / 2) as f64 / uptime * 100.0,
            wr_speed: (self.wr_sectors / 2) as f64 / uptime * 100.0,
        }
    }
}

pub(crate) fn parse_block_stat(line: &str) -> Result<BlockCounters, MetricError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let field = |idx: usize| fields[idx].parse::<u64>().unwrap_or(0);

    if fields.len() >= 11 {
        Ok(BlockCounters {
            rd_ios: field(0),
            rd_sectors: field(2),
            wr_ios: field(4),
            wr_sectors: field(6),
            dc_ios: if fields.len() >= 15 { field(11) } else { 0 },
        })
    } else if fields.len() == 4 {
        Ok(BlockCounters {
            rd_ios: field(0),
            rd_sectors: field(1),
            wr_ios: field(2),
            wr_sectors: field(3),
            dc_ios: 0,
        })
    } else {
        Err(MetricError::parse(format!(
            "unexpected number of fields: {}",
            fields.len()
        )))
    }
}

/// `(uptime, idle)` with the decimal point stripped, e.g. `38716.67` -> `3871667`.
pub(crate) fn parse_uptime(line: &str) -> Result<(u64, u64), MetricError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 2 {
        return Ok((0, 0));
    }
    let value = |field: &str| -> Result<u64, MetricError> {
        field
            .replace('.', "")
            .parse()
            .map_err(|_| MetricError::parse(format!("uptime: bad value: {field}")))
    };
    Ok((value(fields[0])?, value(fields[1])?))
}

pub fn read_uptime(paths: &SystemPaths) -> Result<(u64, u64), MetricError> {
    let text = fs::read_to_string(paths.proc.join("uptime"))?;
    let line = text
        .lines()
        .next()
        .ok_or_else(|| MetricError::parse("uptime: empty file"))?;
    parse_uptime(line)
}

/// Lists entries of `{sys}/block`.
pub fn block_devices(paths: &SystemPaths) -> Result<Vec<String>, MetricError> {
    let mut devices = Vec::new();
    for entry in fs::read_dir(paths.sys.join("block"))? {
        devices.push(entry?.file_name().to_string_lossy().into_owned());
    }
    Ok(devices)
}

fn read_device(paths: &SystemPaths, device: &str, uptime: u64) -> Result<DiskIoStat, MetricError> {
    let stat_path = paths.sys.join("block").join(device).join("stat");
    let text = fs::read_to_string(stat_path)?;
    let line = text
        .lines()
        .next()
        .ok_or_else(|| MetricError::parse("block stat: empty file"))?;
    Ok(parse_block_stat(line)?.into_stat(device, uptime))
}

/// Primes the device list and starts the 1 Hz collector. A device that fails
/// mid-stream is logged and skipped for that tick; the family itself only
/// disables if uptime becomes unreadable.
pub fn spawn(
    paths: SystemPaths,
    flags: Arc<MetricFlags>,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<DiskIoMap>, MetricError> {
    const GATE: &[Family] = &[Family::DiskIo];

    let devices = match block_devices(&paths) {
        Ok(devices) => devices,
        Err(e) => {
            flags.disable(Family::DiskIo);
            return Err(e);
        }
    };

    Ok(spawn_sampler("disk i/o", flags, GATE, cancel, move || {
        let (uptime, _) = read_uptime(&paths)?;
        let mut map = DiskIoMap::with_capacity(devices.len());
        for device in &devices {
            match read_device(&paths, device, uptime) {
                Ok(stat) => {
                    map.insert(device.clone(), stat);
                }
                Err(e) => warn!(device, error = %e, "failed to read disk i/o stat"),
            }
        }
        Ok(map)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_legacy_four_field_row() {
        let c = parse_block_stat("868236 185895 87551823 40173900").unwrap();
        assert_eq!(c.rd_ios, 868236);
        assert_eq!(c.rd_sectors, 185895);
        assert_eq!(c.wr_ios, 87551823);
        assert_eq!(c.wr_sectors, 40173900);
        assert_eq!(c.dc_ios, 0);
    }

    #[test]
    fn parses_extended_row() {
        let line = "8590 4193 548924 2419 11032 8742 1166152 13372 0 15796 19302 832 0 41943040 722 110 2788";
        let c = parse_block_stat(line).unwrap();
        assert_eq!(c.rd_ios, 8590);
        assert_eq!(c.rd_sectors, 548924);
        assert_eq!(c.wr_ios, 11032);
        assert_eq!(c.wr_sectors, 1166152);
        assert_eq!(c.dc_ios, 832);
    }

    #[test]
    fn rejects_odd_field_counts() {
        assert!(parse_block_stat("1 2 3").is_err());
        assert!(parse_block_stat("1 2 3 4 5").is_err());
    }

    #[test]
    fn uptime_strips_decimal_point() {
        assert_eq!(
            parse_uptime("38716.67 581428.07").unwrap(),
            (3871667, 58142807)
        );
    }

    #[test]
    fn uptime_with_wrong_field_count_is_zero() {
        assert_eq!(parse_uptime("38716.67").unwrap(), (0, 0));
    }

    #[test]
    fn rates_follow_the_uptime_formula() {
        let c = parse_block_stat("868236 185895 87551823 40173900").unwrap();
        let stat = c.into_stat("sda", 3_871_667);
        assert!((stat.tps - (868_236.0 + 87_551_823.0) / 3_871_667.0 * 100.0).abs() < 1e-9);
        assert!((stat.rd_speed - (185_895 / 2) as f64 / 3_871_667.0 * 100.0).abs() < 1e-9);
        assert!((stat.wr_speed - (40_173_900 / 2) as f64 / 3_871_667.0 * 100.0).abs() < 1e-9);
    }
}
