//! Mounted-filesystem usage via mountinfo enumeration and `statfs`.
//!
//! Partitions come from `{proc}/1/mountinfo` (PID 1 sees the host view),
//! falling back to the `mounts` format and then to `{proc}/self/`, and are
//! filtered down to the filesystem types the kernel lists as disk-backed in
//! `{proc}/filesystems` (`nodev` rows are excluded, except `zfs`).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::statfs::statfs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::collector::spawn_sampler;
use crate::error::MetricError;
use crate::flags::{Family, MetricFlags};
use crate::paths::SystemPaths;

#[derive(Debug, Clone, PartialEq)]
pub struct DiskUsageStat {
    pub device: String,
    pub mount_point: String,
    /// Bytes in use.
    pub usage: f64,
    pub usage_percent: f64,
    pub inode_count: f64,
    pub inode_available_percent: f64,
}

/// Per-partition stats keyed by mount point.
pub type DiskUsageMap = HashMap<String, DiskUsageStat>;

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
}

// ---------------------------------------------------------------------------
// Known-filesystem filter
// ---------------------------------------------------------------------------

/// Parses `{proc}/filesystems` content into the set of disk-backed types.
pub(crate) fn known_filesystems(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in text.lines() {
        if !line.starts_with("nodev") {
            out.push(line.trim().to_string());
            continue;
        }
        let mut parts = line.split('\t');
        let (Some(_), Some(fs_type), None) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if fs_type == "zfs" {
            out.push(fs_type.trim().to_string());
        }
    }
    out
}

fn read_filesystems(paths: &SystemPaths) -> Result<Vec<String>, MetricError> {
    let text = fs::read_to_string(paths.proc.join("filesystems"))?;
    Ok(known_filesystems(&text))
}

// ---------------------------------------------------------------------------
// Partition enumeration
// ---------------------------------------------------------------------------

/// Undoes the octal escapes mount files use for whitespace (`\040` etc).
pub(crate) fn unescape_fstab(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &path[i + 1..i + 4];
            if let Ok(v) = u8::from_str_radix(digits, 8) {
                out.push(v as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

struct MountFile {
    lines: Vec<String>,
    /// True when the simpler `mounts` format was read instead of mountinfo.
    use_mounts: bool,
    filename: PathBuf,
}

fn read_mount_file(root: &Path) -> Result<MountFile, MetricError> {
    let mountinfo = root.join("mountinfo");
    match fs::read_to_string(&mountinfo) {
        Ok(text) => Ok(MountFile {
            lines: text.lines().map(str::to_string).collect(),
            use_mounts: false,
            filename: mountinfo,
        }),
        Err(_) => {
            let mounts = root.join("mounts");
            let text = fs::read_to_string(&mounts)?;
            Ok(MountFile {
                lines: text.lines().map(str::to_string).collect(),
                use_mounts: true,
                filename: mounts,
            })
        }
    }
}

fn parse_mounts_line(line: &str, fs_types: &[String]) -> Result<Option<Partition>, MetricError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(MetricError::parse(format!("invalid mounts line: {line}")));
    }
    let partition = Partition {
        device: fields[0].to_string(),
        mount_point: unescape_fstab(fields[1]),
        fs_type: fields[2].to_string(),
    };
    if partition.device == "none" || !fs_types.iter().any(|t| t == &partition.fs_type) {
        return Ok(None);
    }
    Ok(Some(partition))
}

fn parse_mountinfo_line(
    line: &str,
    fs_types: &[String],
    paths: &SystemPaths,
    filename: &Path,
) -> Result<Option<Partition>, MetricError> {
    let parts: Vec<&str> = line.split(" - ").collect();
    if parts.len() != 2 {
        return Err(MetricError::parse(format!(
            "found invalid mountinfo line in file {}: {line}",
            filename.display()
        )));
    }

    let fields: Vec<&str> = parts[0].split_whitespace().collect();
    if fields.len() < 6 {
        return Err(MetricError::parse(format!(
            "found invalid mountinfo line in file {}: {line}",
            filename.display()
        )));
    }
    let block_device_id = fields[2];
    let mount_point = unescape_fstab(fields[4]);

    let fields: Vec<&str> = parts[1].split_whitespace().collect();
    if fields.len() < 2 {
        return Err(MetricError::parse(format!(
            "found invalid mountinfo line in file {}: {line}",
            filename.display()
        )));
    }
    let fs_type = fields[0].to_string();
    let mut device = fields[1].to_string();

    if device == "none" || !fs_types.iter().any(|t| t == &fs_type) {
        return Ok(None);
    }

    // Device-mapper names resolve to their backing block device.
    if let Some(mapped) = device.strip_prefix("/dev/") {
        if device.starts_with("/dev/mapper/") {
            if let Ok(resolved) = fs::canonicalize(paths.dev.join(mapped)) {
                device = resolved.to_string_lossy().into_owned();
            }
        }
    }

    // `/dev/root` only exists on the kernel command line; map it back through
    // the sysfs block-device id.
    if device == "/dev/root" {
        let link = paths.sys.join("dev").join("block").join(block_device_id);
        if let Ok(target) = fs::read_link(&link) {
            if let Some(base) = target.file_name() {
                device = format!("/dev/{}", base.to_string_lossy());
            }
        }
    }

    Ok(Some(Partition {
        device,
        mount_point,
        fs_type,
    }))
}

/// Enumerates the disk-backed partitions visible through `{proc}`.
pub fn partitions(paths: &SystemPaths) -> Result<Vec<Partition>, MetricError> {
    let root = match &paths.proc_mount_info {
        Some(p) => p
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/")),
        None => paths.proc.join("1"),
    };

    let mount_file = match read_mount_file(&root) {
        Ok(f) => f,
        Err(e) => {
            // An explicit override never falls back.
            if paths.proc_mount_info.is_some() {
                return Err(e);
            }
            read_mount_file(&paths.proc.join("self"))?
        }
    };

    let fs_types = read_filesystems(paths)?;

    let mut out = Vec::with_capacity(mount_file.lines.len());
    for line in &mount_file.lines {
        let parsed = if mount_file.use_mounts {
            parse_mounts_line(line, &fs_types)?
        } else {
            parse_mountinfo_line(line, &fs_types, paths, &mount_file.filename)?
        };
        if let Some(partition) = parsed {
            out.push(partition);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// statfs
// ---------------------------------------------------------------------------

pub fn read_usage(device: &str, mount_point: &str) -> Result<DiskUsageStat, MetricError> {
    let stat = statfs(Path::new(mount_point))
        .map_err(|e| MetricError::Read(std::io::Error::from_raw_os_error(e as i32)))?;

    let block_size = stat.block_size() as u64;
    let usage = (stat.blocks() - stat.blocks_free()) * block_size;
    let free = stat.blocks_available() * block_size;
    let inodes_total = stat.files();
    let inodes_free = stat.files_free();

    let usage_percent = if usage + free == 0 {
        0.0
    } else {
        usage as f64 / (usage + free) as f64 * 100.0
    };

    let mut result = DiskUsageStat {
        device: device.to_string(),
        mount_point: mount_point.to_string(),
        usage: usage as f64,
        usage_percent,
        inode_count: inodes_total as f64,
        inode_available_percent: 0.0,
    };

    // A filesystem reporting more free inodes than total is lying; skip the
    // inode computation rather than underflow.
    if inodes_total < inodes_free {
        return Ok(result);
    }
    let inodes_used = inodes_total - inodes_free;
    if inodes_total != 0 {
        result.inode_available_percent =
            100.0 - inodes_used as f64 / inodes_total as f64 * 100.0;
    }

    Ok(result)
}

/// Primes the partition list and starts the 1 Hz collector.
pub fn spawn(
    paths: SystemPaths,
    flags: Arc<MetricFlags>,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<DiskUsageMap>, MetricError> {
    const GATE: &[Family] = &[Family::DiskUsage];

    let partitions = match partitions(&paths) {
        Ok(p) => p,
        Err(e) => {
            flags.disable(Family::DiskUsage);
            return Err(e);
        }
    };

    Ok(spawn_sampler("disk usage", flags, GATE, cancel, move || {
        let mut map = DiskUsageMap::with_capacity(partitions.len());
        for partition in &partitions {
            let stat = read_usage(&partition.device, &partition.mount_point)?;
            map.insert(partition.mount_point.clone(), stat);
        }
        Ok(map)
    }))
}
