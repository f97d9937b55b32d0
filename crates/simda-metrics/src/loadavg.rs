//! Load-average sampling from `{proc}/loadavg`.

use std::fs;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::collector::spawn_sampler;
use crate::error::MetricError;
use crate::flags::{Family, MetricFlags};
use crate::paths::SystemPaths;

/// One `/proc/loadavg` observation: 1/5/15-minute run-queue averages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAvgSample {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

pub fn read_load_avg(paths: &SystemPaths) -> Result<LoadAvgSample, MetricError> {
    let text = fs::read_to_string(paths.proc.join("loadavg"))?;
    parse_load_avg(&text)
}

fn parse_load_avg(text: &str) -> Result<LoadAvgSample, MetricError> {
    let mut fields = text.split_whitespace();
    let mut next = |name: &str| -> Result<f64, MetricError> {
        let field = fields
            .next()
            .ok_or_else(|| MetricError::parse(format!("loadavg: missing {name} field")))?;
        field
            .parse()
            .map_err(|_| MetricError::parse(format!("loadavg: bad {name} value: {field}")))
    };
    Ok(LoadAvgSample {
        one: next("load1")?,
        five: next("load5")?,
        fifteen: next("load15")?,
    })
}

/// Primes the reader and starts the 1 Hz collector.
///
/// A failed prime clears the flag and hands the error back so the streamer
/// can record the channel as absent.
pub fn spawn(
    paths: SystemPaths,
    flags: Arc<MetricFlags>,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<LoadAvgSample>, MetricError> {
    const GATE: &[Family] = &[Family::LoadAvg];

    if let Err(e) = read_load_avg(&paths) {
        flags.disable(Family::LoadAvg);
        return Err(e);
    }

    Ok(spawn_sampler("load average", flags, GATE, cancel, move || {
        read_load_avg(&paths)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_line() {
        let sample = parse_load_avg("0.52 0.58 0.59 1/1059 282316\n").unwrap();
        assert_eq!(sample.one, 0.52);
        assert_eq!(sample.five, 0.58);
        assert_eq!(sample.fifteen, 0.59);
    }

    #[test]
    fn rejects_short_line() {
        assert!(parse_load_avg("0.52 0.58\n").is_err());
        assert!(parse_load_avg("").is_err());
    }

    #[test]
    fn rejects_non_numeric() {
        assert!(parse_load_avg("0.52 abc 0.59 1/1059 282316\n").is_err());
    }
}
