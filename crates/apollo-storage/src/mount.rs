//! Mount syscalls and filesystem detection.

use std::ffi::CString;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;

use apollo_common::StorageResult;
use rustix::mount::{MountFlags, UnmountFlags};

/// Filesystem magic numbers recognized by [`filesystem_detect`].
const FILESYSTEM_SUPER_MAGIC_TMPFS: u64 = 0x0102_1994;
const FILESYSTEM_SUPER_MAGIC_EXT4: u64 = 0xEF53;
const FILESYSTEM_SUPER_MAGIC_XFS: u64 = 0x5846_5342;
const FILESYSTEM_SUPER_MAGIC_NFS: u64 = 0x6969;
const FILESYSTEM_SUPER_MAGIC_ZFS: u64 = 0x2fc1_2fc1;
const FILESYSTEM_SUPER_MAGIC_BTRFS: u64 = 0x9123_683E;

/// How long mount/unmount attempts keep retrying before giving up.
const MOUNT_ATTEMPTS: u32 = 20;
const MOUNT_DELAY: Duration = Duration::from_millis(100);

/// Return the filesystem the given path sits on.
///
/// Unknown magics render as hex instead of failing; callers treat the result
/// as informational.
pub fn filesystem_detect(path: &Path) -> StorageResult<String> {
    let fs = rustix::fs::statfs(path).map_err(std::io::Error::from)?;

    let magic = fs.f_type as u64;
    let name = match magic {
        FILESYSTEM_SUPER_MAGIC_BTRFS => "btrfs",
        FILESYSTEM_SUPER_MAGIC_ZFS => "zfs",
        FILESYSTEM_SUPER_MAGIC_TMPFS => "tmpfs",
        FILESYSTEM_SUPER_MAGIC_EXT4 => "ext4",
        FILESYSTEM_SUPER_MAGIC_XFS => "xfs",
        FILESYSTEM_SUPER_MAGIC_NFS => "nfs",
        _ => {
            tracing::debug!(magic = format!("{:#x}", magic), "Unknown backing filesystem");
            return Ok(format!("{:#x}", magic));
        }
    };
    Ok(name.to_string())
}

/// Whether `path` is the root of a mounted filesystem.
///
/// Decided by comparing the device of `path` with its parent; the root
/// directory is always a mount point.
#[must_use]
pub fn is_mount_point(path: &Path) -> bool {
    let Ok(meta) = path.symlink_metadata() else {
        return false;
    };
    let Some(parent) = path.parent() else {
        return true;
    };
    let Ok(parent_meta) = parent.symlink_metadata() else {
        return false;
    };
    meta.dev() != parent_meta.dev()
}

/// Translate a comma-separated mount option string into flags plus the
/// leftover data string passed through to the filesystem.
#[must_use]
pub fn resolve_mount_options(options: &str) -> (MountFlags, String) {
    let mut flags = MountFlags::empty();
    let mut data = Vec::new();

    for opt in options.split(',').filter(|o| !o.is_empty()) {
        match opt {
            "defaults" => {}
            "ro" => flags |= MountFlags::RDONLY,
            "noatime" => flags |= MountFlags::NOATIME,
            "nodiratime" => flags |= MountFlags::NODIRATIME,
            "nodev" => flags |= MountFlags::NODEV,
            "noexec" => flags |= MountFlags::NOEXEC,
            "nosuid" => flags |= MountFlags::NOSUID,
            "relatime" => flags |= MountFlags::RELATIME,
            "strictatime" => flags |= MountFlags::STRICTATIME,
            "sync" => flags |= MountFlags::SYNCHRONOUS,
            other => data.push(other),
        }
    }

    (flags, data.join(","))
}

/// Mount with a short retry loop.
///
/// Device nodes handed out by `rbd map` or LVM activation can take a moment
/// to appear; retrying briefly covers that window.
pub fn try_mount(
    source: &Path,
    target: &Path,
    fstype: &str,
    flags: MountFlags,
    data: &str,
) -> StorageResult<()> {
    let fstype_c = CString::new(fstype).map_err(|_| invalid("fstype contains NUL"))?;
    let data_c = CString::new(data).map_err(|_| invalid("mount data contains NUL"))?;

    let mut last = None;
    for _ in 0..MOUNT_ATTEMPTS {
        match rustix::mount::mount(source, target, fstype_c.as_c_str(), flags, data_c.as_c_str())
        {
            Ok(()) => {
                tracing::debug!(
                    source = %source.display(),
                    target = %target.display(),
                    fstype,
                    "Mounted filesystem"
                );
                return Ok(());
            }
            Err(e) => last = Some(e),
        }
        std::thread::sleep(MOUNT_DELAY);
    }

    Err(std::io::Error::from(last.expect("at least one attempt ran")).into())
}

/// Unmount with a short retry loop.
///
/// `EINVAL` and `ENOENT` mean the target is not mounted, which callers treat
/// as already done.
pub fn try_unmount(target: &Path, flags: UnmountFlags) -> StorageResult<()> {
    let mut last = None;
    for _ in 0..MOUNT_ATTEMPTS {
        match rustix::mount::unmount(target, flags) {
            Ok(()) => {
                tracing::debug!(target = %target.display(), "Unmounted filesystem");
                return Ok(());
            }
            Err(rustix::io::Errno::INVAL) | Err(rustix::io::Errno::NOENT) => return Ok(()),
            Err(e) => last = Some(e),
        }
        std::thread::sleep(MOUNT_DELAY);
    }

    Err(std::io::Error::from(last.expect("at least one attempt ran")).into())
}

fn invalid(message: &str) -> apollo_common::StorageError {
    apollo_common::StorageError::config(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_returns_known_name_or_hex() {
        let name = filesystem_detect(Path::new("/")).unwrap();
        assert!(!name.is_empty());
        // Whatever / sits on, the result is either a known name or a hex
        // rendering; it never errors out for unknown magics.
        if name.starts_with("0x") {
            assert!(u64::from_str_radix(&name[2..], 16).is_ok());
        }
    }

    #[test]
    fn root_is_a_mount_point() {
        assert!(is_mount_point(Path::new("/")));
    }

    #[test]
    fn plain_directory_is_not_a_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_mount_point(dir.path()));
    }

    #[test]
    fn options_split_into_flags_and_data() {
        let (flags, data) = resolve_mount_options("noatime,discard,nodev");
        assert!(flags.contains(MountFlags::NOATIME));
        assert!(flags.contains(MountFlags::NODEV));
        assert_eq!(data, "discard");
    }

    #[test]
    fn empty_options_resolve_to_nothing() {
        let (flags, data) = resolve_mount_options("");
        assert!(flags.is_empty());
        assert!(data.is_empty());
    }
}
