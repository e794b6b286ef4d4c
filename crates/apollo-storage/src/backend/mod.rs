//! The storage backend contract and its six drivers.
//!
//! The driver set is closed and enumerable; callers never inject backends at
//! runtime. [`StorageBackend`] is the tagged union the façade hands out, and
//! [`Backend`] is the contract every driver implements. Mutating operations
//! keep a [`crate::revert::Reverter`] so partial failures unwind and a
//! delete-then-create always succeeds afterwards.

mod btrfs;
mod ceph;
mod dir;
mod lvm;
mod mock;
mod zfs;

pub use btrfs::BtrfsBackend;
pub use ceph::CephBackend;
pub use dir::DirBackend;
pub use lvm::LvmBackend;
pub use mock::MockBackend;
pub use zfs::ZfsBackend;

use std::path::Path;
use std::sync::Arc;

use apollo_common::{StorageError, StoragePaths, StorageResult};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::container::ContainerHandle;
use crate::meta::{MetaStore, StoragePool, StorageVolume, VolumeKind};
use crate::migration::{MigrationFsType, MigrationSinkArgs, MigrationSource, MigrationStream};

/// The closed set of storage drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Plain directory trees.
    Dir,
    /// Btrfs subvolumes and snapshots.
    Btrfs,
    /// ZFS datasets and clones.
    Zfs,
    /// LVM thin volumes.
    Lvm,
    /// Ceph RBD images.
    Ceph,
    /// No-op driver for tests.
    Mock,
}

/// Driver names an administrator may create pools with (`mock` excluded).
pub const SUPPORTED_DRIVERS: &[DriverKind] = &[
    DriverKind::Btrfs,
    DriverKind::Ceph,
    DriverKind::Dir,
    DriverKind::Lvm,
    DriverKind::Zfs,
];

impl DriverKind {
    /// The canonical driver name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dir => "dir",
            Self::Btrfs => "btrfs",
            Self::Zfs => "zfs",
            Self::Lvm => "lvm",
            Self::Ceph => "ceph",
            Self::Mock => "mock",
        }
    }

    /// Parse a driver name.
    pub fn parse(name: &str) -> StorageResult<Self> {
        match name {
            "dir" => Ok(Self::Dir),
            "btrfs" => Ok(Self::Btrfs),
            "zfs" => Ok(Self::Zfs),
            "lvm" => Ok(Self::Lvm),
            "ceph" => Ok(Self::Ceph),
            "mock" => Ok(Self::Mock),
            other => Err(StorageError::config(format!(
                "invalid storage driver '{}'",
                other
            ))),
        }
    }

    /// Whether this driver clones containers from images instead of copying.
    #[must_use]
    pub fn supports_clones(self) -> bool {
        matches!(self, Self::Btrfs | Self::Zfs | Self::Lvm | Self::Ceph)
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The image unpack collaborator.
///
/// Unpacking and verifying image tarballs happens outside the storage core;
/// the backend hands it the tarball path and the mounted target directory.
pub trait Unpacker: Send + Sync {
    /// Unpack the image at `image_path` into `target`.
    fn unpack(&self, image_path: &Path, target: &Path, driver: DriverKind) -> StorageResult<()>;
}

/// State shared by every driver: the loaded pool, the optional volume the
/// operation addresses, and handles to the external collaborators.
pub struct BackendState {
    /// Path conventions rooted at the daemon's var directory.
    pub paths: StoragePaths,
    /// The metadata store.
    pub store: Arc<dyn MetaStore>,
    /// The image unpack collaborator.
    pub unpacker: Arc<dyn Unpacker>,
    /// Database id of the pool.
    pub pool_id: i64,
    /// The pool record (writable; the façade persists changes).
    pub pool: StoragePool,
    /// The volume record the operation addresses, when there is one.
    pub volume: Option<StorageVolume>,
    /// Version string reported by the driver tool at init.
    pub version: String,
}

impl BackendState {
    /// The addressed volume, or a config error for operations requiring one.
    pub fn volume(&self) -> StorageResult<&StorageVolume> {
        self.volume
            .as_ref()
            .ok_or_else(|| StorageError::config("operation requires a storage volume"))
    }

    /// Mutable access to the addressed volume.
    pub fn volume_mut(&mut self) -> StorageResult<&mut StorageVolume> {
        self.volume
            .as_mut()
            .ok_or_else(|| StorageError::config("operation requires a storage volume"))
    }
}

/// The contract every storage driver implements.
///
/// Mount-shaped operations return `did_work`: `true` when this call actually
/// performed the (un)mount, `false` when a concurrent caller already had, so
/// the caller knows whether to schedule the matching unmount.
pub trait Backend {
    /// The driver this backend dispatches to.
    fn kind(&self) -> DriverKind;

    /// Version of the backing tool probed at init.
    fn version(&self) -> &str;

    /// Shared state (pool, volume, collaborators).
    fn state(&self) -> &BackendState;

    /// Mutable shared state.
    fn state_mut(&mut self) -> &mut BackendState;

    /// Create the pool's underlying store and mount-point directory.
    fn pool_create(&mut self) -> StorageResult<()>;

    /// Destroy the underlying store iff this host created it
    /// (`volatile.pool.pristine`); always remove the mount point.
    fn pool_delete(&mut self) -> StorageResult<()>;

    /// Mount the pool.
    fn pool_mount(&mut self) -> StorageResult<bool>;

    /// Unmount the pool.
    fn pool_umount(&mut self) -> StorageResult<bool>;

    /// Apply a validated config change.
    fn pool_update(&mut self, changed: &[String]) -> StorageResult<()>;

    /// Create the addressed custom volume.
    fn volume_create(&mut self) -> StorageResult<()>;

    /// Delete the addressed custom volume, including its metadata row.
    fn volume_delete(&mut self) -> StorageResult<()>;

    /// Mount the addressed custom volume.
    fn volume_mount(&mut self) -> StorageResult<bool>;

    /// Unmount the addressed custom volume.
    fn volume_umount(&mut self) -> StorageResult<bool>;

    /// Apply a validated config change to the addressed volume.
    fn volume_update(&mut self, changed: &[String]) -> StorageResult<()>;

    /// Create an empty container volume (no rootfs content).
    fn container_create(&mut self, container: &dyn ContainerHandle) -> StorageResult<()>;

    /// Create a container volume from a cached image, unpacking the image
    /// into the pool's cache first when absent (§ image cache).
    fn container_create_from_image(
        &mut self,
        container: &dyn ContainerHandle,
        fingerprint: &str,
    ) -> StorageResult<()>;

    /// Pre-check for restore; drivers may refuse specific combinations.
    fn container_can_restore(
        &self,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
    ) -> StorageResult<()>;

    /// Delete a container volume, its mount point and stable symlink.
    fn container_delete(&mut self, container: &dyn ContainerHandle) -> StorageResult<()>;

    /// Copy a container volume, optionally including snapshots.
    fn container_copy(
        &mut self,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
        container_only: bool,
    ) -> StorageResult<()>;

    /// Mount a container volume.
    fn container_mount(&mut self, container: &dyn ContainerHandle) -> StorageResult<bool>;

    /// Unmount a container volume.
    fn container_umount(&mut self, name: &str, path: &Path) -> StorageResult<bool>;

    /// Rename a container volume, its mount point, symlink and snapshots.
    fn container_rename(
        &mut self,
        container: &dyn ContainerHandle,
        new_name: &str,
    ) -> StorageResult<()>;

    /// Restore a container from one of its snapshots.
    fn container_restore(
        &mut self,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
    ) -> StorageResult<()>;

    /// Bytes used by the container volume.
    fn container_usage(&self, container: &dyn ContainerHandle) -> StorageResult<u64>;

    /// Whether the container's volume exists on the store.
    fn container_storage_ready(&self, name: &str) -> bool;

    /// Snapshot a container.
    fn snapshot_create(
        &mut self,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
    ) -> StorageResult<()>;

    /// Create an empty snapshot placeholder (migration sinks).
    fn snapshot_create_empty(&mut self, target: &dyn ContainerHandle) -> StorageResult<()>;

    /// Delete a snapshot.
    fn snapshot_delete(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<()>;

    /// Rename a snapshot.
    fn snapshot_rename(
        &mut self,
        snapshot: &dyn ContainerHandle,
        new_name: &str,
    ) -> StorageResult<()>;

    /// Make a read-only snapshot browsable (transient writable clone where
    /// the store cannot mount raw snapshots).
    fn snapshot_start(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<bool>;

    /// Tear down what [`Backend::snapshot_start`] set up.
    fn snapshot_stop(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<bool>;

    /// Populate the pool's image cache entry for `fingerprint`.
    fn image_create(&mut self, fingerprint: &str) -> StorageResult<()>;

    /// Drop an image cache entry; fails soft (zombie) while clones depend
    /// on it, hard when none do.
    fn image_delete(&mut self, fingerprint: &str) -> StorageResult<()>;

    /// Mount an image volume.
    fn image_mount(&mut self, fingerprint: &str) -> StorageResult<bool>;

    /// Unmount an image volume.
    fn image_umount(&mut self, fingerprint: &str) -> StorageResult<bool>;

    /// Apply a size quota to a volume.
    fn set_quota(
        &mut self,
        kind: VolumeKind,
        size: u64,
        container: Option<&dyn ContainerHandle>,
    ) -> StorageResult<()>;

    /// The wire format this driver migrates with.
    fn migration_type(&self) -> MigrationFsType;

    /// Whether cross-host transport keeps inode numbers stable.
    fn preserves_inodes(&self) -> bool;

    /// Build the source driver for migrating `container` off this host.
    fn migration_source(
        &self,
        container: &dyn ContainerHandle,
        container_only: bool,
    ) -> StorageResult<Box<dyn MigrationSource>>;

    /// Receive a migration stream into `args.container`.
    fn migration_sink(
        &mut self,
        args: MigrationSinkArgs<'_>,
        stream: &mut dyn MigrationStream,
    ) -> StorageResult<()>;
}

impl std::fmt::Debug for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageBackend::Dir(_) => "Dir",
            StorageBackend::Btrfs(_) => "Btrfs",
            StorageBackend::Zfs(_) => "Zfs",
            StorageBackend::Lvm(_) => "Lvm",
            StorageBackend::Ceph(_) => "Ceph",
            StorageBackend::Mock(_) => "Mock",
        };
        f.debug_tuple(name).finish()
    }
}

/// The tagged union the façade hands to callers.
pub enum StorageBackend {
    /// Directory-tree backend.
    Dir(DirBackend),
    /// Btrfs backend.
    Btrfs(BtrfsBackend),
    /// ZFS backend.
    Zfs(ZfsBackend),
    /// LVM thin-pool backend.
    Lvm(LvmBackend),
    /// Ceph RBD backend.
    Ceph(CephBackend),
    /// Mock backend.
    Mock(MockBackend),
}

impl StorageBackend {
    /// Initialize a backend for a loaded pool (and optional volume).
    pub fn init(
        paths: StoragePaths,
        store: Arc<dyn MetaStore>,
        unpacker: Arc<dyn Unpacker>,
        pool_id: i64,
        pool: StoragePool,
        volume: Option<StorageVolume>,
    ) -> StorageResult<Self> {
        let state = BackendState {
            paths,
            store,
            unpacker,
            pool_id,
            pool,
            volume,
            version: String::new(),
        };
        match state.pool.driver {
            DriverKind::Dir => DirBackend::init(state).map(Self::Dir),
            DriverKind::Btrfs => BtrfsBackend::init(state).map(Self::Btrfs),
            DriverKind::Zfs => ZfsBackend::init(state).map(Self::Zfs),
            DriverKind::Lvm => LvmBackend::init(state).map(Self::Lvm),
            DriverKind::Ceph => CephBackend::init(state).map(Self::Ceph),
            DriverKind::Mock => MockBackend::init(state).map(Self::Mock),
        }
    }

    /// The contract implementation.
    #[must_use]
    pub fn ops(&self) -> &dyn Backend {
        match self {
            Self::Dir(b) => b,
            Self::Btrfs(b) => b,
            Self::Zfs(b) => b,
            Self::Lvm(b) => b,
            Self::Ceph(b) => b,
            Self::Mock(b) => b,
        }
    }

    /// Mutable contract implementation.
    pub fn ops_mut(&mut self) -> &mut dyn Backend {
        match self {
            Self::Dir(b) => b,
            Self::Btrfs(b) => b,
            Self::Zfs(b) => b,
            Self::Lvm(b) => b,
            Self::Ceph(b) => b,
            Self::Mock(b) => b,
        }
    }

    /// The driver kind.
    #[must_use]
    pub fn kind(&self) -> DriverKind {
        self.ops().kind()
    }

    /// The loaded pool record.
    #[must_use]
    pub fn pool(&self) -> &StoragePool {
        &self.ops().state().pool
    }

    /// The loaded pool's database id.
    #[must_use]
    pub fn pool_id(&self) -> i64 {
        self.ops().state().pool_id
    }

    /// The addressed volume record, when one was loaded.
    #[must_use]
    pub fn volume(&self) -> Option<&StorageVolume> {
        self.ops().state().volume.as_ref()
    }
}

/// Probe a driver's backing tool, returning its version string.
pub fn probe_driver(kind: DriverKind) -> StorageResult<String> {
    match kind {
        DriverKind::Dir => dir::probe(),
        DriverKind::Btrfs => btrfs::probe(),
        DriverKind::Zfs => zfs::probe(),
        DriverKind::Lvm => lvm::probe(),
        DriverKind::Ceph => ceph::probe(),
        DriverKind::Mock => mock::probe(),
    }
}

/// One usable driver on this host.
#[derive(Debug, Clone)]
pub struct DriverInfo {
    /// The driver.
    pub kind: DriverKind,
    /// Tool version reported by the probe.
    pub version: String,
}

static DRIVERS_CACHE: Lazy<Mutex<Option<Vec<DriverInfo>>>> = Lazy::new(|| Mutex::new(None));

/// The drivers usable on this host, probed once and cached.
///
/// Refreshed at daemon start and after administrative pool create/delete via
/// [`refresh_supported_drivers`].
pub fn supported_drivers() -> Vec<DriverInfo> {
    let mut cache = DRIVERS_CACHE.lock();
    if let Some(drivers) = cache.as_ref() {
        return drivers.clone();
    }
    let drivers = probe_all();
    *cache = Some(drivers.clone());
    drivers
}

/// Re-probe every supported driver and replace the cache.
pub fn refresh_supported_drivers() -> Vec<DriverInfo> {
    let drivers = probe_all();
    *DRIVERS_CACHE.lock() = Some(drivers.clone());
    drivers
}

fn probe_all() -> Vec<DriverInfo> {
    let mut drivers = Vec::new();
    for &kind in SUPPORTED_DRIVERS {
        match probe_driver(kind) {
            Ok(version) => drivers.push(DriverInfo { kind, version }),
            Err(err) => {
                tracing::debug!(driver = kind.as_str(), error = %err, "Driver unavailable");
            }
        }
    }
    drivers
}

/// Create a filesystem on a block device. Shared by the block-backed drivers.
pub(crate) fn make_fs_type(device: &Path, fstype: &str) -> StorageResult<String> {
    let mkfs = format!("mkfs.{}", fstype);
    match fstype {
        // xfs refuses to overwrite old signatures without -f.
        "xfs" => crate::cmd::run_command(&mkfs, &["-f", &device.display().to_string()]),
        _ => crate::cmd::run_command(&mkfs, &[&device.display().to_string()]),
    }
}

/// No-op unpacker for callers that never create from images (tests, probes).
pub struct NullUnpacker;

impl Unpacker for NullUnpacker {
    fn unpack(&self, _image_path: &Path, _target: &Path, _driver: DriverKind) -> StorageResult<()> {
        Err(StorageError::config("no image unpacker configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_names_round_trip() {
        for kind in [
            DriverKind::Dir,
            DriverKind::Btrfs,
            DriverKind::Zfs,
            DriverKind::Lvm,
            DriverKind::Ceph,
            DriverKind::Mock,
        ] {
            assert_eq!(DriverKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(DriverKind::parse("overlay").is_err());
    }

    #[test]
    fn mock_is_not_administratively_supported() {
        assert!(!SUPPORTED_DRIVERS.contains(&DriverKind::Mock));
    }

    #[test]
    fn clone_capability_matches_drivers() {
        assert!(!DriverKind::Dir.supports_clones());
        assert!(!DriverKind::Mock.supports_clones());
        assert!(DriverKind::Btrfs.supports_clones());
        assert!(DriverKind::Zfs.supports_clones());
        assert!(DriverKind::Lvm.supports_clones());
        assert!(DriverKind::Ceph.supports_clones());
    }
}
