//! Directory-tree storage backend.
//!
//! No copy-on-write: containers are plain directories, clones are recursive
//! copies, snapshots are sibling trees under the pool's `snapshots/`
//! directory. The upside is that it works on any filesystem.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use apollo_common::{Idmap, StorageError, StorageResult};
use rustix::mount::{MountFlags, UnmountFlags};

use crate::backend::{Backend, BackendState, DriverKind};
use crate::container::{split_snapshot_name, ContainerHandle};
use crate::layout;
use crate::lock::{LockId, RunOutcome, OPERATIONS};
use crate::meta::{StorageVolume, VolumeKind};
use crate::migration::{
    shift_if_necessary, MigrationFsType, MigrationObject, MigrationSinkArgs, MigrationSource,
    MigrationStream,
};
use crate::fsutil;
use crate::mount::{is_mount_point, try_mount, try_unmount};
use crate::revert::Reverter;

/// Probe the dir driver. Always available; the "tool" is the filesystem.
pub(super) fn probe() -> StorageResult<String> {
    Ok("1".to_string())
}

/// The directory-tree backend.
pub struct DirBackend {
    state: BackendState,
}

impl DirBackend {
    pub(super) fn init(mut state: BackendState) -> StorageResult<Self> {
        state.version = probe()?;
        Ok(Self { state })
    }

    fn pool_name(&self) -> &str {
        &self.state.pool.name
    }

    /// The directory holding the pool's data: the configured `source`, or
    /// the pool mount point when none was given.
    fn source_path(&self) -> PathBuf {
        match self.state.pool.config.get("source") {
            Some(source) if !source.is_empty() => PathBuf::from(source),
            _ => self.state.paths.pool_mount_point(self.pool_name()),
        }
    }

    fn container_mnt(&self, name: &str) -> PathBuf {
        self.state.paths.container_mount_point(self.pool_name(), name)
    }

    fn snapshot_mnt(&self, name: &str) -> PathBuf {
        self.state.paths.snapshot_mount_point(self.pool_name(), name)
    }

    fn image_mnt(&self, fingerprint: &str) -> PathBuf {
        self.state.paths.image_mount_point(self.pool_name(), fingerprint)
    }

    fn custom_mnt(&self, volume: &str) -> PathBuf {
        self.state.paths.custom_mount_point(self.pool_name(), volume)
    }

    /// Apply the container's idmap to a freshly-populated rootfs.
    fn shift_rootfs(&self, container: &dyn ContainerHandle) -> StorageResult<()> {
        if container.is_privileged() {
            return Ok(());
        }
        if let Some(idmap) = container.idmap()? {
            idmap.shift_rootfs(&container.rootfs_path())?;
            tracing::debug!(container = container.name(), "Shifted rootfs");
        }
        Ok(())
    }
}

impl Backend for DirBackend {
    fn kind(&self) -> DriverKind {
        DriverKind::Dir
    }

    fn version(&self) -> &str {
        &self.state.version
    }

    fn state(&self) -> &BackendState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut BackendState {
        &mut self.state
    }

    fn pool_create(&mut self) -> StorageResult<()> {
        let pool_name = self.pool_name().to_string();
        tracing::info!(pool = %pool_name, "Creating DIR storage pool");

        let initial_source = self
            .state
            .pool
            .config
            .get("source")
            .cloned()
            .unwrap_or_default();
        self.state
            .pool
            .config
            .insert("volatile.initial_source".to_string(), initial_source);

        let source = self.source_path();
        self.state
            .pool
            .config
            .insert("source".to_string(), source.display().to_string());

        let mut revert = Reverter::new();

        // The pool is pristine when this host creates the backing directory.
        let pristine = !source.exists();
        self.state.pool.config.insert(
            "volatile.pool.pristine".to_string(),
            pristine.to_string(),
        );
        if pristine {
            fs::create_dir_all(&source)?;
            let source_revert = source.clone();
            revert.push("remove source directory", move || {
                fs::remove_dir_all(&source_revert)?;
                Ok(())
            });
        } else if !fsutil::dir_is_empty(&source)? {
            return Err(StorageError::config(format!(
                "source directory '{}' is not empty",
                source.display()
            )));
        }

        let pool_mnt = self.state.paths.pool_mount_point(&pool_name);
        if !pool_mnt.exists() {
            fs::create_dir_all(&pool_mnt)?;
            let mnt_revert = pool_mnt.clone();
            revert.push("remove pool mount point", move || {
                fs::remove_dir_all(&mnt_revert)?;
                Ok(())
            });
        }
        fs::set_permissions(&pool_mnt, fs::Permissions::from_mode(0o711))?;

        for sub in ["containers", "snapshots", "images", "custom"] {
            fs::create_dir_all(pool_mnt.join(sub))?;
        }

        tracing::info!(pool = %pool_name, "Created DIR storage pool");
        revert.success();
        Ok(())
    }

    fn pool_delete(&mut self) -> StorageResult<()> {
        let pool_name = self.pool_name().to_string();
        tracing::info!(pool = %pool_name, "Deleting DIR storage pool");

        let source = self.source_path();
        if self.state.pool.config_bool("volatile.pool.pristine") && source.exists() {
            fs::remove_dir_all(&source)?;
        }

        let pool_mnt = self.state.paths.pool_mount_point(&pool_name);
        if pool_mnt.exists() {
            if is_mount_point(&pool_mnt) {
                try_unmount(&pool_mnt, UnmountFlags::DETACH)?;
            }
            fs::remove_dir_all(&pool_mnt)?;
        }

        tracing::info!(pool = %pool_name, "Deleted DIR storage pool");
        Ok(())
    }

    fn pool_mount(&mut self) -> StorageResult<bool> {
        let source = self.source_path();
        let pool_mnt = self.state.paths.pool_mount_point(self.pool_name());
        if source == pool_mnt {
            return Ok(true);
        }

        let id = LockId::pool_mount(self.pool_name());
        let outcome = OPERATIONS.run(&id, || {
            if is_mount_point(&pool_mnt) {
                return Ok(false);
            }
            try_mount(&source, &pool_mnt, "none", MountFlags::BIND, "")?;
            Ok(true)
        })?;
        match outcome {
            RunOutcome::Performed(mounted) => Ok(mounted),
            RunOutcome::AlreadyInProgress => Ok(false),
        }
    }

    fn pool_umount(&mut self) -> StorageResult<bool> {
        let source = self.source_path();
        let pool_mnt = self.state.paths.pool_mount_point(self.pool_name());
        if source == pool_mnt {
            return Ok(true);
        }

        let id = LockId::pool_umount(self.pool_name());
        let outcome = OPERATIONS.run(&id, || {
            if !is_mount_point(&pool_mnt) {
                return Ok(false);
            }
            try_unmount(&pool_mnt, UnmountFlags::DETACH)?;
            Ok(true)
        })?;
        match outcome {
            RunOutcome::Performed(unmounted) => Ok(unmounted),
            RunOutcome::AlreadyInProgress => Ok(false),
        }
    }

    fn pool_update(&mut self, changed: &[String]) -> StorageResult<()> {
        tracing::debug!(pool = self.pool_name(), ?changed, "Updated DIR storage pool");
        Ok(())
    }

    fn volume_create(&mut self) -> StorageResult<()> {
        let volume = self.state.volume()?.name.clone();
        let mnt = self.custom_mnt(&volume);
        if mnt.exists() {
            return Err(StorageError::already_exists("storage volume", &volume));
        }
        fs::create_dir_all(&mnt)?;
        fs::set_permissions(&mnt, fs::Permissions::from_mode(0o711))?;
        tracing::debug!(pool = self.pool_name(), volume = %volume, "Created DIR storage volume");
        Ok(())
    }

    fn volume_delete(&mut self) -> StorageResult<()> {
        let volume = self.state.volume()?.name.clone();
        let mnt = self.custom_mnt(&volume);
        if mnt.exists() {
            fs::remove_dir_all(&mnt)?;
        }

        let pool_id = self.state.pool_id;
        if let Err(err) = self
            .state
            .store
            .volume_delete(pool_id, &volume, VolumeKind::Custom)
        {
            if !err.is_not_found() {
                return Err(err);
            }
        }
        tracing::debug!(pool = self.pool_name(), volume = %volume, "Deleted DIR storage volume");
        Ok(())
    }

    fn volume_mount(&mut self) -> StorageResult<bool> {
        let volume = self.state.volume()?.name.clone();
        let id = LockId::custom_mount(self.pool_name(), &volume);
        match OPERATIONS.run(&id, || Ok(true))? {
            RunOutcome::Performed(v) => Ok(v),
            RunOutcome::AlreadyInProgress => Ok(false),
        }
    }

    fn volume_umount(&mut self) -> StorageResult<bool> {
        let volume = self.state.volume()?.name.clone();
        let id = LockId::custom_umount(self.pool_name(), &volume);
        match OPERATIONS.run(&id, || Ok(true))? {
            RunOutcome::Performed(v) => Ok(v),
            RunOutcome::AlreadyInProgress => Ok(false),
        }
    }

    fn volume_update(&mut self, changed: &[String]) -> StorageResult<()> {
        tracing::debug!(pool = self.pool_name(), ?changed, "Updated DIR storage volume");
        Ok(())
    }

    fn container_create(&mut self, container: &dyn ContainerHandle) -> StorageResult<()> {
        let name = container.name().to_string();
        tracing::debug!(pool = self.pool_name(), container = %name, "Creating DIR container volume");

        let mnt = self.container_mnt(&name);
        if mnt.exists() {
            return Err(StorageError::already_exists("container volume", &name));
        }

        let mut revert = Reverter::new();

        fs::create_dir_all(mnt.join("rootfs"))?;
        let mnt_revert = mnt.clone();
        revert.push("remove container directory", move || {
            fs::remove_dir_all(&mnt_revert)?;
            Ok(())
        });

        layout::create_container_mount_point(&mnt, &container.path(), container.is_privileged())?;
        let symlink = container.path();
        revert.push("remove container symlink", move || {
            if symlink.symlink_metadata().is_ok() {
                fs::remove_file(&symlink)?;
            }
            Ok(())
        });

        revert.success();
        Ok(())
    }

    fn container_create_from_image(
        &mut self,
        container: &dyn ContainerHandle,
        fingerprint: &str,
    ) -> StorageResult<()> {
        let name = container.name().to_string();
        tracing::debug!(
            pool = self.pool_name(),
            container = %name,
            image = fingerprint,
            "Creating DIR container volume from image"
        );

        // Serialize the cache fill per (pool, fingerprint). A waiter assumes
        // the holder populated the cache and proceeds straight to copying.
        let image_mnt = self.image_mnt(fingerprint);
        let lock = LockId::image_create(self.pool_name(), fingerprint);
        let pool_id = self.state.pool_id;
        let store = std::sync::Arc::clone(&self.state.store);
        let mut fill_result = Ok(());
        OPERATIONS.run(&lock, || {
            let missing = !image_mnt.exists()
                || store
                    .volume_get(pool_id, fingerprint, VolumeKind::Image)
                    .is_err();
            if missing {
                fill_result = self.image_create_locked(fingerprint);
            }
            Ok(())
        })?;
        fill_result?;

        let mut revert = Reverter::new();

        let mnt = self.container_mnt(&name);
        fsutil::copy_tree(&self.image_mnt(fingerprint), &mnt)?;
        let mnt_revert = mnt.clone();
        revert.push("remove container directory", move || {
            fs::remove_dir_all(&mnt_revert)?;
            Ok(())
        });
        if !mnt.join("rootfs").exists() {
            fs::create_dir_all(mnt.join("rootfs"))?;
        }

        layout::create_container_mount_point(&mnt, &container.path(), container.is_privileged())?;
        let symlink = container.path();
        revert.push("remove container symlink", move || {
            if symlink.symlink_metadata().is_ok() {
                fs::remove_file(&symlink)?;
            }
            Ok(())
        });

        self.shift_rootfs(container)?;

        container.template_apply("create")?;

        revert.success();
        Ok(())
    }

    fn container_can_restore(
        &self,
        _target: &dyn ContainerHandle,
        _source: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        Ok(())
    }

    fn container_delete(&mut self, container: &dyn ContainerHandle) -> StorageResult<()> {
        let name = container.name().to_string();
        tracing::debug!(pool = self.pool_name(), container = %name, "Deleting DIR container volume");

        let mnt = self.container_mnt(&name);
        layout::delete_container_mount_point(&mnt, &container.path(), "dir")?;

        let snapshots = self.snapshot_mnt(&name);
        if snapshots.exists() {
            fs::remove_dir_all(&snapshots)?;
        }
        let snapshots_symlink = self.state.paths.snapshots_symlink(&name);
        if snapshots_symlink.symlink_metadata().is_ok() {
            fs::remove_file(&snapshots_symlink)?;
        }

        Ok(())
    }

    fn container_copy(
        &mut self,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
        container_only: bool,
    ) -> StorageResult<()> {
        let source_name = source.name().to_string();
        let target_name = target.name().to_string();
        tracing::debug!(
            pool = self.pool_name(),
            source = %source_name,
            target = %target_name,
            "Copying DIR container volume"
        );

        let mut revert = Reverter::new();

        let target_mnt = self.container_mnt(&target_name);
        fsutil::copy_tree(&self.container_mnt(&source_name), &target_mnt)?;
        let mnt_revert = target_mnt.clone();
        revert.push("remove copied container directory", move || {
            fs::remove_dir_all(&mnt_revert)?;
            Ok(())
        });

        layout::create_container_mount_point(&target_mnt, &target.path(), target.is_privileged())?;
        let symlink = target.path();
        revert.push("remove container symlink", move || {
            if symlink.symlink_metadata().is_ok() {
                fs::remove_file(&symlink)?;
            }
            Ok(())
        });

        if !container_only {
            for snapshot in source.snapshots()? {
                let (_, snap_only) = split_snapshot_name(&snapshot)?;
                let source_snap = self.snapshot_mnt(&snapshot);
                let target_snap =
                    self.snapshot_mnt(&format!("{}/{}", target_name, snap_only));
                fsutil::copy_tree(&source_snap, &target_snap)?;

                let symlink_target = self.snapshot_mnt(&target_name);
                let snapshots_symlink = self.state.paths.snapshots_symlink(&target_name);
                layout::create_snapshot_mount_point(
                    &target_snap,
                    &symlink_target,
                    &snapshots_symlink,
                )?;
                let snap_revert = target_snap.clone();
                revert.push("remove copied snapshot", move || {
                    fs::remove_dir_all(&snap_revert)?;
                    Ok(())
                });
            }
        }

        target.template_apply("copy")?;

        revert.success();
        Ok(())
    }

    fn container_mount(&mut self, container: &dyn ContainerHandle) -> StorageResult<bool> {
        let id = LockId::container_mount(self.pool_name(), container.name());
        match OPERATIONS.run(&id, || Ok(true))? {
            RunOutcome::Performed(v) => Ok(v),
            RunOutcome::AlreadyInProgress => Ok(false),
        }
    }

    fn container_umount(&mut self, name: &str, _path: &Path) -> StorageResult<bool> {
        let id = LockId::container_umount(self.pool_name(), name);
        match OPERATIONS.run(&id, || Ok(true))? {
            RunOutcome::Performed(v) => Ok(v),
            RunOutcome::AlreadyInProgress => Ok(false),
        }
    }

    fn container_rename(
        &mut self,
        container: &dyn ContainerHandle,
        new_name: &str,
    ) -> StorageResult<()> {
        let old_name = container.name().to_string();
        tracing::debug!(
            pool = self.pool_name(),
            container = %old_name,
            new_name,
            "Renaming DIR container volume"
        );

        let mut revert = Reverter::new();

        let old_mnt = self.container_mnt(&old_name);
        let new_mnt = self.container_mnt(new_name);
        let old_symlink = container.path();
        let new_symlink = self.state.paths.container_symlink(new_name);
        layout::rename_container_mount_point(&old_mnt, &old_symlink, &new_mnt, &new_symlink)?;
        {
            let (old_mnt, old_symlink, new_mnt, new_symlink) = (
                old_mnt.clone(),
                old_symlink.clone(),
                new_mnt.clone(),
                new_symlink.clone(),
            );
            revert.push("rename container mount point back", move || {
                layout::rename_container_mount_point(&new_mnt, &new_symlink, &old_mnt, &old_symlink)
            });
        }

        let old_snapshots = self.snapshot_mnt(&old_name);
        let new_snapshots = self.snapshot_mnt(new_name);
        if old_snapshots.exists() {
            fs::rename(&old_snapshots, &new_snapshots)?;
            {
                let (old_snapshots, new_snapshots) = (old_snapshots.clone(), new_snapshots.clone());
                revert.push("rename snapshots directory back", move || {
                    fs::rename(&new_snapshots, &old_snapshots)?;
                    Ok(())
                });
            }

            let old_link = self.state.paths.snapshots_symlink(&old_name);
            if old_link.symlink_metadata().is_ok() {
                fs::remove_file(&old_link)?;
            }
            let new_link = self.state.paths.snapshots_symlink(new_name);
            if new_link.symlink_metadata().is_err() {
                if let Some(parent) = new_link.parent() {
                    fs::create_dir_all(parent)?;
                }
                std::os::unix::fs::symlink(&new_snapshots, &new_link)?;
            }
        }

        revert.success();
        Ok(())
    }

    fn container_restore(
        &mut self,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        tracing::debug!(
            pool = self.pool_name(),
            container = target.name(),
            snapshot = source.name(),
            "Restoring DIR container volume"
        );

        let target_rootfs = target.rootfs_path();
        let snapshot_rootfs = self.snapshot_mnt(source.name()).join("rootfs");

        fsutil::clear_dir(&target_rootfs)?;
        fsutil::copy_tree(&snapshot_rootfs, &target_rootfs)?;

        Ok(())
    }

    fn container_usage(&self, container: &dyn ContainerHandle) -> StorageResult<u64> {
        fsutil::tree_usage(&self.container_mnt(container.name()))
    }

    fn container_storage_ready(&self, name: &str) -> bool {
        self.container_mnt(name).is_dir()
    }

    fn snapshot_create(
        &mut self,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        let target_name = target.name().to_string();
        tracing::debug!(
            pool = self.pool_name(),
            snapshot = %target_name,
            "Creating DIR snapshot volume"
        );

        let mut revert = Reverter::new();

        let snap_mnt = self.snapshot_mnt(&target_name);
        fsutil::copy_tree(&self.container_mnt(source.name()), &snap_mnt)?;
        let snap_revert = snap_mnt.clone();
        revert.push("remove snapshot directory", move || {
            fs::remove_dir_all(&snap_revert)?;
            Ok(())
        });

        let (parent, _) = split_snapshot_name(&target_name)?;
        let symlink_target = self.snapshot_mnt(parent);
        let snapshots_symlink = self.state.paths.snapshots_symlink(parent);
        layout::create_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;

        revert.success();
        Ok(())
    }

    fn snapshot_create_empty(&mut self, target: &dyn ContainerHandle) -> StorageResult<()> {
        let target_name = target.name().to_string();
        let snap_mnt = self.snapshot_mnt(&target_name);
        fs::create_dir_all(snap_mnt.join("rootfs"))?;

        let (parent, _) = split_snapshot_name(&target_name)?;
        let symlink_target = self.snapshot_mnt(parent);
        let snapshots_symlink = self.state.paths.snapshots_symlink(parent);
        layout::create_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;
        Ok(())
    }

    fn snapshot_delete(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<()> {
        let name = snapshot.name().to_string();
        tracing::debug!(pool = self.pool_name(), snapshot = %name, "Deleting DIR snapshot volume");

        let (parent, _) = split_snapshot_name(&name)?;
        let snap_mnt = self.snapshot_mnt(&name);
        let symlink_target = self.snapshot_mnt(parent);
        let snapshots_symlink = self.state.paths.snapshots_symlink(parent);
        layout::delete_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;
        Ok(())
    }

    fn snapshot_rename(
        &mut self,
        snapshot: &dyn ContainerHandle,
        new_name: &str,
    ) -> StorageResult<()> {
        let old = self.snapshot_mnt(snapshot.name());
        let new = self.snapshot_mnt(new_name);
        if let Some(parent) = new.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&old, &new)?;
        Ok(())
    }

    fn snapshot_start(&mut self, _snapshot: &dyn ContainerHandle) -> StorageResult<bool> {
        // Snapshot trees are plain directories, nothing to prepare.
        Ok(false)
    }

    fn snapshot_stop(&mut self, _snapshot: &dyn ContainerHandle) -> StorageResult<bool> {
        Ok(false)
    }

    fn image_create(&mut self, fingerprint: &str) -> StorageResult<()> {
        let pool = self.pool_name().to_string();
        let lock = LockId::image_create(&pool, fingerprint);
        let mut result = Ok(());
        OPERATIONS.run(&lock, || {
            result = self.image_create_locked(fingerprint);
            Ok(())
        })?;
        result
    }

    fn image_delete(&mut self, fingerprint: &str) -> StorageResult<()> {
        tracing::debug!(pool = self.pool_name(), image = fingerprint, "Deleting DIR image volume");

        let mnt = self.image_mnt(fingerprint);
        if mnt.exists() {
            fs::remove_dir_all(&mnt)?;
        }

        let pool_id = self.state.pool_id;
        if let Err(err) = self
            .state
            .store
            .volume_delete(pool_id, fingerprint, VolumeKind::Image)
        {
            if !err.is_not_found() {
                return Err(err);
            }
        }
        Ok(())
    }

    fn image_mount(&mut self, _fingerprint: &str) -> StorageResult<bool> {
        Ok(true)
    }

    fn image_umount(&mut self, _fingerprint: &str) -> StorageResult<bool> {
        Ok(true)
    }

    fn set_quota(
        &mut self,
        _kind: VolumeKind,
        _size: u64,
        _container: Option<&dyn ContainerHandle>,
    ) -> StorageResult<()> {
        Err(StorageError::QuotaUnsupported {
            driver: "dir".to_string(),
        })
    }

    fn migration_type(&self) -> MigrationFsType {
        MigrationFsType::Rsync
    }

    fn preserves_inodes(&self) -> bool {
        false
    }

    fn migration_source(
        &self,
        container: &dyn ContainerHandle,
        container_only: bool,
    ) -> StorageResult<Box<dyn MigrationSource>> {
        let mut objects = vec![MigrationObject::base(container.name())];
        if !container_only {
            for snapshot in container.snapshots()? {
                let (_, snap_only) = split_snapshot_name(&snapshot)?;
                objects.push(MigrationObject::snapshot(container.name(), snap_only));
            }
        }

        Ok(Box::new(DirMigrationSource {
            pool: self.pool_name().to_string(),
            paths: self.state.paths.clone(),
            objects,
        }))
    }

    fn migration_sink(
        &mut self,
        args: MigrationSinkArgs<'_>,
        stream: &mut dyn MigrationStream,
    ) -> StorageResult<()> {
        let container = args.container;
        let name = container.name().to_string();

        for object in &args.objects {
            if args.container_only && object.snapshot.is_some() {
                continue;
            }

            let target = match &object.snapshot {
                None => self.container_mnt(&name),
                Some(snap) => {
                    let snap_name = format!("{}/{}", name, snap);
                    let handle = SnapshotPlaceholder {
                        name: snap_name.clone(),
                        path: self.snapshot_mnt(&snap_name),
                    };
                    self.snapshot_create_empty(&handle)?;
                    self.snapshot_mnt(&snap_name)
                }
            };

            fs::create_dir_all(&target)?;
            let reader = stream.object_stream(object)?;
            let mut archive = tar::Archive::new(reader);
            archive.set_preserve_permissions(true);
            archive.unpack(&target)?;
        }

        layout::create_container_mount_point(
            &self.container_mnt(&name),
            &container.path(),
            container.is_privileged(),
        )?;

        shift_if_necessary(container, args.source_idmap.as_ref())?;
        Ok(())
    }
}

impl DirBackend {
    /// Populate the image cache entry. Caller holds the image-create lock.
    fn image_create_locked(&mut self, fingerprint: &str) -> StorageResult<()> {
        tracing::debug!(pool = self.pool_name(), image = fingerprint, "Creating DIR image volume");

        let mut revert = Reverter::new();

        let mnt = self.image_mnt(fingerprint);
        if !mnt.exists() {
            fs::create_dir_all(&mnt)?;
            fs::set_permissions(&mnt, fs::Permissions::from_mode(0o700))?;
            let mnt_revert = mnt.clone();
            revert.push("remove image mount point", move || {
                fs::remove_dir_all(&mnt_revert)?;
                Ok(())
            });
        }

        let image_path = self.state.paths.image_file(fingerprint);
        self.state
            .unpacker
            .unpack(&image_path, &mnt, DriverKind::Dir)?;

        let pool_id = self.state.pool_id;
        if self
            .state
            .store
            .volume_get(pool_id, fingerprint, VolumeKind::Image)
            .is_err()
        {
            self.state
                .store
                .volume_create(pool_id, &StorageVolume::new(fingerprint, VolumeKind::Image))?;
        }

        revert.success();
        Ok(())
    }
}

/// Migration source shipping plain tar streams.
struct DirMigrationSource {
    pool: String,
    paths: apollo_common::StoragePaths,
    objects: Vec<MigrationObject>,
}

impl MigrationSource for DirMigrationSource {
    fn objects(&self) -> Vec<MigrationObject> {
        self.objects.clone()
    }

    fn preserves_inodes(&self) -> bool {
        false
    }

    fn send_object(
        &mut self,
        object: &MigrationObject,
        sink: &mut dyn std::io::Write,
    ) -> StorageResult<()> {
        let path = match &object.snapshot {
            None => self.paths.container_mount_point(&self.pool, &object.container),
            Some(snap) => self
                .paths
                .snapshot_mount_point(&self.pool, &format!("{}/{}", object.container, snap)),
        };

        let mut builder = tar::Builder::new(sink);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &path)?;
        builder.finish()?;
        Ok(())
    }
}

/// Stand-in handle for snapshots materialized by the migration sink.
struct SnapshotPlaceholder {
    name: String,
    path: PathBuf,
}

impl ContainerHandle for SnapshotPlaceholder {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn is_privileged(&self) -> bool {
        false
    }

    fn idmap(&self) -> StorageResult<Option<Idmap>> {
        Ok(None)
    }

    fn config_set(&self, _key: &str, _value: &str) -> StorageResult<()> {
        Ok(())
    }

    fn template_apply(&self, _trigger: &str) -> StorageResult<()> {
        Ok(())
    }

    fn snapshots(&self) -> StorageResult<Vec<String>> {
        Ok(Vec::new())
    }
}
