//! Mount-point directories and stable symlinks.
//!
//! Directory modes are part of the external contract: pool roots and
//! snapshot trees are 0711, container mount points are 0700 (privileged) or
//! 0755 (unprivileged), image mount points 0700.

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;

use apollo_common::StorageResult;

/// Create a container mount point and its stable symlink.
pub fn create_container_mount_point(
    mount_point: &Path,
    mount_point_symlink: &Path,
    privileged: bool,
) -> StorageResult<()> {
    let mode = if privileged { 0o700 } else { 0o755 };

    if !mount_point.exists() {
        fs::create_dir_all(mount_point)?;
    }
    fs::set_permissions(mount_point, fs::Permissions::from_mode(mode))?;

    if mount_point_symlink.symlink_metadata().is_err() {
        if let Some(parent) = mount_point_symlink.parent() {
            fs::create_dir_all(parent)?;
        }
        symlink(mount_point, mount_point_symlink)?;
    }

    Ok(())
}

/// Remove a container mount point, its stable symlink, and any old-style
/// `<symlink>.<driver>` symlink left behind by earlier daemon versions.
pub fn delete_container_mount_point(
    mount_point: &Path,
    mount_point_symlink: &Path,
    driver_name: &str,
) -> StorageResult<()> {
    if mount_point_symlink.symlink_metadata().is_ok() {
        fs::remove_file(mount_point_symlink)?;
    }

    if mount_point.exists() {
        fs::remove_dir_all(mount_point)?;
    }

    if !driver_name.is_empty() {
        let old_style = mount_point_symlink.with_extension(driver_name);
        if old_style.symlink_metadata().is_ok() {
            fs::remove_file(old_style)?;
        }
    }

    Ok(())
}

/// Rename a container mount point and re-point its stable symlink.
pub fn rename_container_mount_point(
    old_mount_point: &Path,
    old_symlink: &Path,
    new_mount_point: &Path,
    new_symlink: &Path,
) -> StorageResult<()> {
    if old_mount_point.exists() {
        fs::rename(old_mount_point, new_mount_point)?;
    }

    if old_symlink.symlink_metadata().is_ok() {
        fs::remove_file(old_symlink)?;
    }
    symlink(new_mount_point, new_symlink)?;

    Ok(())
}

/// Create a snapshot mount point (0711) and the per-container snapshots
/// symlink if missing.
pub fn create_snapshot_mount_point(
    snapshot_mount_point: &Path,
    symlink_target: &Path,
    snapshots_symlink: &Path,
) -> StorageResult<()> {
    if !snapshot_mount_point.exists() {
        fs::create_dir_all(snapshot_mount_point)?;
        fs::set_permissions(snapshot_mount_point, fs::Permissions::from_mode(0o711))?;
    }

    if snapshots_symlink.symlink_metadata().is_err() {
        if let Some(parent) = snapshots_symlink.parent() {
            fs::create_dir_all(parent)?;
        }
        symlink(symlink_target, snapshots_symlink)?;
    }

    Ok(())
}

/// Remove a snapshot mount point; when the per-container snapshots directory
/// is gone too, drop the stable symlink with it.
pub fn delete_snapshot_mount_point(
    snapshot_mount_point: &Path,
    symlink_target: &Path,
    snapshots_symlink: &Path,
) -> StorageResult<()> {
    if snapshot_mount_point.exists() {
        fs::remove_dir_all(snapshot_mount_point)?;
    }

    let mut could_remove = false;
    if symlink_target.exists() && fs::remove_dir(symlink_target).is_ok() {
        could_remove = true;
    }

    if could_remove && snapshots_symlink.symlink_metadata().is_ok() {
        fs::remove_file(snapshots_symlink)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::tempdir;

    #[test]
    fn container_mount_point_modes() {
        let tmp = tempdir().unwrap();
        let mp = tmp.path().join("pool/containers/c1");
        let link = tmp.path().join("containers/c1");

        create_container_mount_point(&mp, &link, true).unwrap();
        assert_eq!(fs::metadata(&mp).unwrap().mode() & 0o777, 0o700);
        assert_eq!(fs::read_link(&link).unwrap(), mp);

        // Re-running with the other privilege just fixes the mode.
        create_container_mount_point(&mp, &link, false).unwrap();
        assert_eq!(fs::metadata(&mp).unwrap().mode() & 0o777, 0o755);
    }

    #[test]
    fn delete_removes_mount_point_and_symlink() {
        let tmp = tempdir().unwrap();
        let mp = tmp.path().join("pool/containers/c1");
        let link = tmp.path().join("containers/c1");
        create_container_mount_point(&mp, &link, false).unwrap();

        delete_container_mount_point(&mp, &link, "dir").unwrap();
        assert!(!mp.exists());
        assert!(link.symlink_metadata().is_err());
    }

    #[test]
    fn rename_moves_and_repoints() {
        let tmp = tempdir().unwrap();
        let old_mp = tmp.path().join("pool/containers/old");
        let old_link = tmp.path().join("containers/old");
        let new_mp = tmp.path().join("pool/containers/new");
        let new_link = tmp.path().join("containers/new");
        create_container_mount_point(&old_mp, &old_link, false).unwrap();
        fs::write(old_mp.join("f"), b"data").unwrap();

        rename_container_mount_point(&old_mp, &old_link, &new_mp, &new_link).unwrap();

        assert!(!old_mp.exists());
        assert!(old_link.symlink_metadata().is_err());
        assert_eq!(fs::read(new_mp.join("f")).unwrap(), b"data");
        assert_eq!(fs::read_link(&new_link).unwrap(), new_mp);
    }

    #[test]
    fn snapshot_symlink_follows_last_snapshot() {
        let tmp = tempdir().unwrap();
        let snap_mp = tmp.path().join("pool/snapshots/c1/s1");
        let target = tmp.path().join("pool/snapshots/c1");
        let link = tmp.path().join("snapshots/c1");

        create_snapshot_mount_point(&snap_mp, &target, &link).unwrap();
        assert!(snap_mp.exists());
        assert!(link.symlink_metadata().is_ok());

        delete_snapshot_mount_point(&snap_mp, &target, &link).unwrap();
        assert!(!snap_mp.exists());
        // The per-container directory was empty, so the symlink went too.
        assert!(link.symlink_metadata().is_err());
    }
}
