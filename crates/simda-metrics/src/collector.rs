//! Shared 1 Hz sampling loop for the file-backed collectors.
//!
//! Every non-packet collector is the same machine: a prime read performed by
//! the caller, then a ticking task that skips disabled ticks, sends each
//! sample downstream on a rendezvous-sized channel, and on the first failed
//! read logs, clears its gate flags, closes the channel and exits. The task
//! also exits when the stream's cancellation fires or when the receiving
//! streamer goes away.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::MetricError;
use crate::flags::{Family, MetricFlags};

/// Collector tick cadence. Part of the observable behaviour.
pub(crate) const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Spawns the sampling loop and returns its output channel.
///
/// `gate` lists the families sharing this collector: the tick is taken when
/// any of them is enabled, and all of them are cleared on failure.
pub(crate) fn spawn_sampler<T, F>(
    name: &'static str,
    flags: Arc<MetricFlags>,
    gate: &'static [Family],
    cancel: CancellationToken,
    mut sample: F,
) -> mpsc::Receiver<T>
where
    T: Send + 'static,
    F: FnMut() -> Result<T, MetricError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + SAMPLE_INTERVAL, SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("{name} collector stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if !gate.iter().any(|f| flags.enabled(*f)) {
                        continue;
                    }
                    match sample() {
                        Ok(value) => {
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    debug!("{name} collector stopped");
                                    return;
                                }
                                sent = tx.send(value) => {
                                    if sent.is_err() {
                                        // Streamer gone; nothing left to feed.
                                        return;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "{name} collector error, metric disabled");
                            for family in gate {
                                flags.disable(*family);
                            }
                            return;
                        }
                    }
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

    #[tokio::test(start_paused = true)]
    async fn emits_once_per_tick_and_respects_gate() {
        let flags = Arc::new(MetricFlags::all_enabled());
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        let mut rx = spawn_sampler("test", flags.clone(), &[Family::LoadAvg], cancel.clone(), move || {
            counted.fetch_add(1, Relaxed);
            Ok(7u32)
        });

        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(calls.load(Relaxed), 1);

        // With the gate off the loop keeps ticking but never samples.
        flags.disable(Family::LoadAvg);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(calls.load(Relaxed), 1);

        // Re-enable (as a config reload would) and sampling resumes.
        flags.set(Family::LoadAvg, true);
        assert_eq!(rx.recv().await, Some(7));

        cancel.cancel();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_disables_every_gated_family_and_closes() {
        let flags = Arc::new(MetricFlags::all_enabled());
        let cancel = CancellationToken::new();

        const GATE: &[Family] = &[Family::NetConnections, Family::NetConnectionStates];
        let mut rx = spawn_sampler::<u32, _>("test", flags.clone(), GATE, cancel, move || {
            Err(MetricError::parse("bad row"))
        });

        assert_eq!(rx.recv().await, None);
        assert!(!flags.enabled(Family::NetConnections));
        assert!(!flags.enabled(Family::NetConnectionStates));
        assert!(flags.enabled(Family::LoadAvg));
    }
}
