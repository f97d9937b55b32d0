//! Config hot-reload: re-applies the metric flags when the file changes.
//!
//! The parent directory is watched rather than the file itself so that
//! editors and config-management tools that replace the file atomically
//! (write + rename) keep triggering events. A reload that fails to parse
//! keeps the previous values.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use simda_metrics::MetricFlags;
use tracing::{info, warn};

use crate::config::DaemonConfig;

pub struct ConfigWatcher {
    // Dropping the watcher stops event delivery; held for daemon lifetime.
    _watcher: RecommendedWatcher,
}

pub fn spawn(path: PathBuf, flags: Arc<MetricFlags>) -> Result<ConfigWatcher> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
    let watch_dir = canonical
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let (tx, rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    })
    .context("failed to create config watcher")?;
    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch config directory: {}", watch_dir.display()))?;

    std::thread::Builder::new()
        .name("config-watch".to_string())
        .spawn(move || {
            for event in rx {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "config watch error");
                        continue;
                    }
                };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                if !event.paths.iter().any(|p| p == &canonical || p == &path) {
                    continue;
                }
                reload(&path, &flags);
            }
        })
        .context("failed to spawn config watch thread")?;

    Ok(ConfigWatcher { _watcher: watcher })
}

fn reload(path: &std::path::Path, flags: &MetricFlags) {
    match DaemonConfig::load(path) {
        Ok(cfg) => {
            cfg.apply_metrics(flags);
            info!("configuration reloaded");
        }
        Err(e) => warn!(error = %e, "config reload failed, keeping previous values"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simda_metrics::Family;
    use std::io::Write;
    use std::time::{Duration, Instant};

    #[test]
    fn flag_flip_is_applied_on_file_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "metrics:\n  load_avg: true\n").unwrap();

        let flags = Arc::new(MetricFlags::all_enabled());
        let _watcher = spawn(path.clone(), flags.clone()).unwrap();

        // Give the backend a moment to arm before mutating the file.
        std::thread::sleep(Duration::from_millis(200));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "metrics:\n  load_avg: false").unwrap();
        drop(file);

        let deadline = Instant::now() + Duration::from_secs(5);
        while flags.enabled(Family::LoadAvg) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!flags.enabled(Family::LoadAvg));
        assert!(flags.enabled(Family::CpuAvg));
    }

    #[test]
    fn unparsable_reload_keeps_previous_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "metrics: {}\n").unwrap();

        let flags = Arc::new(MetricFlags::all_enabled());
        reload(&path, &flags);
        assert!(flags.enabled(Family::LoadAvg));

        std::fs::write(&path, "log_level: [not, a, level]\n").unwrap();
        flags.disable(Family::LoadAvg);
        reload(&path, &flags);
        // Bad file: the earlier (disabled) state stays.
        assert!(!flags.enabled(Family::LoadAvg));
    }
}
