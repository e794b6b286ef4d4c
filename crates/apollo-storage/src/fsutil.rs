//! Recursive filesystem helpers used by the copy-based backends.

use std::fs;
use std::os::unix::fs::{lchown, symlink, MetadataExt, PermissionsExt};
use std::path::Path;

use apollo_common::StorageResult;

/// Recursively copy `src` into `dst`, preserving file modes, symlink targets
/// and (best-effort) ownership.
///
/// `dst` is created if missing. Ownership changes that fail with `EPERM` are
/// ignored so unprivileged daemons can still copy trees they own.
pub fn copy_tree(src: &Path, dst: &Path) -> StorageResult<()> {
    let src_meta = src.symlink_metadata()?;
    if !dst.exists() {
        fs::create_dir_all(dst)?;
        fs::set_permissions(dst, fs::Permissions::from_mode(src_meta.permissions().mode()))?;
    }
    copy_ownership(&src_meta, dst)?;

    for entry in walkdir::WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io_error)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields children of src");
        let target = dst.join(rel);
        let meta = entry.path().symlink_metadata()?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            fs::set_permissions(&target, fs::Permissions::from_mode(meta.permissions().mode()))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            symlink(&link, &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
            fs::set_permissions(&target, fs::Permissions::from_mode(meta.permissions().mode()))?;
        } else {
            // Fifos, sockets and device nodes are skipped; container images
            // recreate them at start time.
            tracing::debug!(path = %entry.path().display(), "Skipping special file");
            continue;
        }

        copy_ownership(&meta, &target)?;
    }

    Ok(())
}

/// Remove every entry inside `dir` without removing `dir` itself.
pub fn clear_dir(dir: &Path) -> StorageResult<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Total apparent size of all regular files under `path`, in bytes.
pub fn tree_usage(path: &Path) -> StorageResult<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(io_error)?;
        let meta = entry.path().symlink_metadata()?;
        if meta.file_type().is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Whether a directory exists and has no entries.
pub fn dir_is_empty(path: &Path) -> StorageResult<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

fn copy_ownership(meta: &fs::Metadata, target: &Path) -> StorageResult<()> {
    match lchown(target, Some(meta.uid()), Some(meta.gid())) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn io_error(e: walkdir::Error) -> apollo_common::StorageError {
    apollo_common::StorageError::Io(
        e.into_io_error()
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk failed")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copy_tree_preserves_structure_and_modes() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");

        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a"), b"alpha").unwrap();
        fs::write(src.join("sub/b"), b"beta").unwrap();
        fs::set_permissions(src.join("a"), fs::Permissions::from_mode(0o640)).unwrap();
        symlink("a", src.join("link")).unwrap();

        copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("a")).unwrap(), b"alpha");
        assert_eq!(fs::read(dst.join("sub/b")).unwrap(), b"beta");
        assert_eq!(
            fs::metadata(dst.join("a")).unwrap().permissions().mode() & 0o777,
            0o640
        );
        assert_eq!(fs::read_link(dst.join("link")).unwrap().to_str(), Some("a"));
    }

    #[test]
    fn clear_dir_empties_but_keeps_root() {
        let tmp = tempdir().unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        fs::write(tmp.path().join("f"), b"x").unwrap();

        clear_dir(tmp.path()).unwrap();

        assert!(tmp.path().exists());
        assert!(dir_is_empty(tmp.path()).unwrap());
    }

    #[test]
    fn tree_usage_sums_file_sizes() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("a"), vec![0u8; 100]).unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        fs::write(tmp.path().join("d/b"), vec![0u8; 50]).unwrap();
        assert_eq!(tree_usage(tmp.path()).unwrap(), 150);
    }
}
