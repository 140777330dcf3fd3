//! Discovery of the tmpfs-class mount backing shared-memory files.

use std::path::{Path, PathBuf};

use crate::conf::FusionConfig;

const FALLBACK: &str = "/dev/shm";

/// Pick the directory for shared-memory files.
///
/// A configured override wins. Otherwise the largest writable
/// tmpfs/shmfs/ramfs mount is chosen, falling back to `/dev/shm` when none
/// can be determined.
pub fn tmpfs_dir(conf: &FusionConfig) -> PathBuf {
    if let Some(dir) = &conf.tmpfs {
        return dir.clone();
    }

    match largest_tmpfs_mount() {
        Some(dir) => dir,
        None => PathBuf::from(FALLBACK),
    }
}

fn largest_tmpfs_mount() -> Option<PathBuf> {
    let mounts = std::fs::read_to_string("/proc/mounts").ok()?;

    let mut best: Option<(u64, PathBuf)> = None;

    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let Some(_device) = fields.next() else { continue };
        let Some(mount_point) = fields.next() else { continue };
        let Some(fs_type) = fields.next() else { continue };

        if !matches!(fs_type, "tmpfs" | "shmfs" | "ramfs") {
            continue;
        }

        let path = Path::new(mount_point);
        if !is_writable_dir(path) {
            continue;
        }

        let size = mount_size(path);
        if best.as_ref().map_or(true, |(s, _)| size > *s) {
            best = Some((size, path.to_path_buf()));
        }
    }

    best.map(|(_, p)| p)
}

fn is_writable_dir(path: &Path) -> bool {
    rustix::fs::access(path, rustix::fs::Access::WRITE_OK).is_ok()
}

fn mount_size(path: &Path) -> u64 {
    match rustix::fs::statvfs(path) {
        Ok(st) => st.f_blocks.saturating_mul(st.f_frsize),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_override_wins() {
        let mut conf = FusionConfig::default();
        conf.tmpfs = Some(PathBuf::from("/tmp/pinned"));
        assert_eq!(tmpfs_dir(&conf), PathBuf::from("/tmp/pinned"));
    }

    #[test]
    fn test_discovery_returns_writable_dir() {
        let conf = FusionConfig::default();
        let dir = tmpfs_dir(&conf);
        // Either a discovered mount or the fallback; both must be absolute.
        assert!(dir.is_absolute());
    }
}
