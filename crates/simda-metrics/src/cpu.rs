//! CPU accounting from the aggregate `cpu` line of `{proc}/stat`.
//!
//! Deliberately not delta-based: each sample reports user/system/idle as a
//! percentage of the cumulative jiffy total at read time, which is what the
//! wire contract expects.

use std::fs;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::collector::spawn_sampler;
use crate::error::MetricError;
use crate::flags::{Family, MetricFlags};
use crate::paths::SystemPaths;

/// Scheduler tick frequency: 1 jiffy = 1/100 s.
pub const CLOCKS_PER_SEC: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSample {
    pub user: f64,
    pub system: f64,
    pub idle: f64,
}

pub fn read_cpu(paths: &SystemPaths) -> Result<CpuSample, MetricError> {
    let text = fs::read_to_string(paths.proc.join("stat"))?;
    let line = text
        .lines()
        .next()
        .ok_or_else(|| MetricError::parse("stat: empty file"))?;
    parse_stat_line(line)
}

pub(crate) fn parse_stat_line(line: &str) -> Result<CpuSample, MetricError> {
    let fields: Vec<&str> = line.split_whitespace().collect();

    if fields.len() < 8 {
        return Err(MetricError::parse("stat does not contain cpu info"));
    }
    if !fields[0].starts_with("cpu") {
        return Err(MetricError::parse(format!(
            "stat: unexpected row prefix: {}",
            fields[0]
        )));
    }

    let jiffies = |idx: usize| -> Result<f64, MetricError> {
        fields[idx]
            .parse::<f64>()
            .map_err(|_| MetricError::parse(format!("stat: bad jiffy value: {}", fields[idx])))
            .map(|v| v / CLOCKS_PER_SEC)
    };

    let user = jiffies(1)?;
    let nice = jiffies(2)?;
    let system = jiffies(3)?;
    let idle = jiffies(4)?;
    let iowait = jiffies(5)?;
    let irq = jiffies(6)?;
    let softirq = jiffies(7)?;

    // Linux >= 2.6.11 appends steal; guest and guest_nice follow on newer
    // kernels. Only steal feeds the total, the rest are validated and dropped.
    let steal = if fields.len() > 8 { jiffies(8)? } else { 0.0 };
    for idx in 9..fields.len().min(11) {
        jiffies(idx)?;
    }

    let total = user + nice + system + idle + iowait + irq + softirq + steal;

    Ok(CpuSample {
        user: user / total * 100.0,
        system: system / total * 100.0,
        idle: idle / total * 100.0,
    })
}

pub fn spawn(
    paths: SystemPaths,
    flags: Arc<MetricFlags>,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<CpuSample>, MetricError> {
    const GATE: &[Family] = &[Family::CpuAvg];

    if let Err(e) = read_cpu(&paths) {
        flags.disable(Family::CpuAvg);
        return Err(e);
    }

    Ok(spawn_sampler("cpu average", flags, GATE, cancel, move || {
        read_cpu(&paths)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_stat_line() {
        let sample =
            parse_stat_line("cpu 1826207 68727 673820 42671281 86015 158628 47813 0 0 0").unwrap();
        assert!(sample.user > 0.0);
        assert!(sample.system > 0.0);
        assert!(sample.idle > 0.0);
        assert!(sample.user + sample.system + sample.idle <= 100.0);
    }

    #[test]
    fn parses_line_without_steal() {
        // 2.6-era kernels stop after softirq.
        let sample = parse_stat_line("cpu 100 0 100 700 50 25 25").unwrap();
        assert!((sample.user - 10.0).abs() < 1e-9);
        assert!((sample.system - 10.0).abs() < 1e-9);
        assert!((sample.idle - 70.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_short_line() {
        assert!(parse_stat_line("cpu 1826207 68727 673820 42671281 86015 158628").is_err());
    }

    #[test]
    fn rejects_non_numeric() {
        assert!(
            parse_stat_line("cpu hello 68727 673820 42671281 86015 158628 47813 0 0 0").is_err()
        );
    }

    #[test]
    fn rejects_non_cpu_row() {
        assert!(parse_stat_line("intr 1 2 3 4 5 6 7 8").is_err());
    }
}
