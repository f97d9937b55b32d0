//! Filesystem roots and the capture interface.
//!
//! All readers take their kernel entry points from here instead of
//! hard-coding `/proc` and friends, so tests can point a whole streamer at a
//! synthetic tree.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SystemPaths {
    pub proc: PathBuf,
    pub sys: PathBuf,
    pub dev: PathBuf,
    pub run: PathBuf,
    pub tcp: PathBuf,
    pub tcp6: PathBuf,
    pub udp: PathBuf,
    pub udp6: PathBuf,
    /// Overrides the mountinfo location when set. An explicit override never
    /// falls back to the other mount sources.
    pub proc_mount_info: Option<PathBuf>,
    /// Capture interface; `any` is the kernel's catch-all pseudo-device.
    pub interface: String,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            proc: PathBuf::from("/proc"),
            sys: PathBuf::from("/sys"),
            dev: PathBuf::from("/dev"),
            run: PathBuf::from("/run"),
            tcp: PathBuf::from("/proc/net/tcp"),
            tcp6: PathBuf::from("/proc/net/tcp6"),
            udp: PathBuf::from("/proc/net/udp"),
            udp6: PathBuf::from("/proc/net/udp6"),
            proc_mount_info: None,
            interface: "any".to_string(),
        }
    }
}
