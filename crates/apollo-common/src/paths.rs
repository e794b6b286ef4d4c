//! Stable on-disk paths for the Apollo storage subsystem.
//!
//! Everything the storage core writes lives under the daemon's var directory
//! (default `/var/lib/apollo`). The layout below is part of the external
//! contract: containers see their rootfs through the stable symlink at
//! `{VAR}/containers/<name>` regardless of which pool backs it.

use std::path::{Path, PathBuf};

/// Default var directory of the daemon.
const DEFAULT_VAR_DIR: &str = "/var/lib/apollo";

/// Path helper rooted at the daemon's var directory.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    var_dir: PathBuf,
}

impl StoragePaths {
    /// Paths rooted at the default location, honoring the `APOLLO_DIR`
    /// environment override.
    #[must_use]
    pub fn new() -> Self {
        let var_dir = std::env::var("APOLLO_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_VAR_DIR));
        Self { var_dir }
    }

    /// Paths rooted at a custom var directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            var_dir: root.into(),
        }
    }

    /// The var directory itself.
    #[must_use]
    pub fn var_dir(&self) -> &Path {
        &self.var_dir
    }

    /// `{VAR}/storage-pools/<pool>`
    #[must_use]
    pub fn pool_mount_point(&self, pool: &str) -> PathBuf {
        self.var_dir.join("storage-pools").join(pool)
    }

    /// `{VAR}/storage-pools/<pool>/containers/<name>`
    #[must_use]
    pub fn container_mount_point(&self, pool: &str, name: &str) -> PathBuf {
        self.pool_mount_point(pool).join("containers").join(name)
    }

    /// `{VAR}/storage-pools/<pool>/snapshots/<name>`
    ///
    /// `name` is either a container name (the per-container snapshots
    /// directory) or `container/snapshot` (one snapshot's tree).
    #[must_use]
    pub fn snapshot_mount_point(&self, pool: &str, name: &str) -> PathBuf {
        self.pool_mount_point(pool).join("snapshots").join(name)
    }

    /// `{VAR}/storage-pools/<pool>/images/<fingerprint>`
    #[must_use]
    pub fn image_mount_point(&self, pool: &str, fingerprint: &str) -> PathBuf {
        self.pool_mount_point(pool).join("images").join(fingerprint)
    }

    /// `{VAR}/storage-pools/<pool>/custom/<volume>`
    #[must_use]
    pub fn custom_mount_point(&self, pool: &str, volume: &str) -> PathBuf {
        self.pool_mount_point(pool).join("custom").join(volume)
    }

    /// `{VAR}/containers/<name>`, the stable symlink other subsystems read.
    #[must_use]
    pub fn container_symlink(&self, name: &str) -> PathBuf {
        self.var_dir.join("containers").join(name)
    }

    /// `{VAR}/snapshots/<container>`, the stable snapshots symlink.
    #[must_use]
    pub fn snapshots_symlink(&self, container: &str) -> PathBuf {
        self.var_dir.join("snapshots").join(container)
    }

    /// `{VAR}/images/<fingerprint>`, the downloaded image tarball consumed
    /// by the unpack collaborator.
    #[must_use]
    pub fn image_file(&self, fingerprint: &str) -> PathBuf {
        self.var_dir.join("images").join(fingerprint)
    }
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_contract() {
        let paths = StoragePaths::with_root("/var/lib/apollo");
        assert_eq!(
            paths.container_mount_point("p1", "c1"),
            PathBuf::from("/var/lib/apollo/storage-pools/p1/containers/c1")
        );
        assert_eq!(
            paths.snapshot_mount_point("p1", "c1/s1"),
            PathBuf::from("/var/lib/apollo/storage-pools/p1/snapshots/c1/s1")
        );
        assert_eq!(
            paths.image_mount_point("p1", "abc"),
            PathBuf::from("/var/lib/apollo/storage-pools/p1/images/abc")
        );
        assert_eq!(
            paths.custom_mount_point("p1", "v1"),
            PathBuf::from("/var/lib/apollo/storage-pools/p1/custom/v1")
        );
        assert_eq!(
            paths.container_symlink("c1"),
            PathBuf::from("/var/lib/apollo/containers/c1")
        );
        assert_eq!(
            paths.snapshots_symlink("c1"),
            PathBuf::from("/var/lib/apollo/snapshots/c1")
        );
    }
}
