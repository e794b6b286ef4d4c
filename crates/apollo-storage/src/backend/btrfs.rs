//! Btrfs storage backend.
//!
//! The pool is a directory on a btrfs filesystem holding one top-level
//! subvolume per volume class. Containers and images are subvolumes, clones
//! and snapshots are `btrfs subvolume snapshot`s, so create-from-image and
//! copy are O(1). Snapshots are read-only subvolumes toggled writable for
//! `snapshot_start`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use apollo_common::{StorageError, StorageResult};

use crate::backend::{Backend, BackendState, DriverKind};
use crate::cmd::run_command;
use crate::container::{split_snapshot_name, ContainerHandle};
use crate::layout;
use crate::lock::{LockId, RunOutcome, OPERATIONS};
use crate::meta::{StorageVolume, VolumeKind};
use crate::migration::{
    shift_if_necessary, MigrationFsType, MigrationObject, MigrationSinkArgs, MigrationSource,
    MigrationStream,
};
use crate::fsutil;
use crate::mount::filesystem_detect;
use crate::revert::Reverter;

/// Probe the `btrfs` CLI.
pub(super) fn probe() -> StorageResult<String> {
    let out = run_command("btrfs", &["version"]).map_err(|e| StorageError::BackendUnavailable {
        driver: "btrfs".to_string(),
        reason: e.to_string(),
    })?;
    Ok(out.lines().next().unwrap_or_default().to_string())
}

fn subvolume_create(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    run_command("btrfs", &["subvolume", "create", &path.display().to_string()])?;
    Ok(())
}

fn subvolume_delete(path: &Path) -> StorageResult<()> {
    run_command("btrfs", &["subvolume", "delete", &path.display().to_string()])?;
    Ok(())
}

fn subvolume_snapshot(source: &Path, target: &Path, readonly: bool) -> StorageResult<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let src = source.display().to_string();
    let dst = target.display().to_string();
    if readonly {
        run_command("btrfs", &["subvolume", "snapshot", "-r", &src, &dst])?;
    } else {
        run_command("btrfs", &["subvolume", "snapshot", &src, &dst])?;
    }
    Ok(())
}

fn subvolume_set_readonly(path: &Path, readonly: bool) -> StorageResult<()> {
    let flag = if readonly { "true" } else { "false" };
    run_command(
        "btrfs",
        &["property", "set", &path.display().to_string(), "ro", flag],
    )?;
    Ok(())
}

/// The btrfs backend.
pub struct BtrfsBackend {
    state: BackendState,
}

impl BtrfsBackend {
    pub(super) fn init(mut state: BackendState) -> StorageResult<Self> {
        state.version = probe()?;
        tracing::debug!(pool = %state.pool.name, "Initializing a BTRFS driver");
        Ok(Self { state })
    }

    fn pool_name(&self) -> &str {
        &self.state.pool.name
    }

    fn pool_mnt(&self) -> PathBuf {
        self.state.paths.pool_mount_point(self.pool_name())
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

    /// Populate the image cache entry. Caller holds the image-create lock.
    fn image_create_locked(&mut self, fingerprint: &str) -> StorageResult<()> {
        tracing::debug!(
            pool = self.pool_name(),
            image = fingerprint,
            "Creating BTRFS image volume"
        );

        let mut revert = Reverter::new();

        let image_mnt = self.image_mnt(fingerprint);
        subvolume_create(&image_mnt)?;
        fs::set_permissions(&image_mnt, fs::Permissions::from_mode(0o700))?;
        {
            let mnt_revert = image_mnt.clone();
            revert.push("delete image subvolume", move || {
                subvolume_delete(&mnt_revert)
            });
        }

        let image_path = self.state.paths.image_file(fingerprint);
        self.state
            .unpacker
            .unpack(&image_path, &image_mnt, DriverKind::Btrfs)?;

        // Clones snapshot the image subvolume; keep the original immutable.
        subvolume_set_readonly(&image_mnt, true)?;

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

impl Backend for BtrfsBackend {
    fn kind(&self) -> DriverKind {
        DriverKind::Btrfs
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
        tracing::info!(pool = %pool_name, "Creating BTRFS storage pool");

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
            .insert("volatile.initial_source".to_string(), initial_source.clone());

        let mut revert = Reverter::new();

        let pool_mnt = self.pool_mnt();
        let created = !pool_mnt.exists();
        if created {
            fs::create_dir_all(&pool_mnt)?;
            let mnt_revert = pool_mnt.clone();
            revert.push("remove pool mount point", move || {
                fs::remove_dir_all(&mnt_revert)?;
                Ok(())
            });
        }
        fs::set_permissions(&pool_mnt, fs::Permissions::from_mode(0o711))?;
        self.state.pool.config.insert(
            "volatile.pool.pristine".to_string(),
            created.to_string(),
        );

        let backing = filesystem_detect(&pool_mnt)?;
        if backing != "btrfs" {
            return Err(StorageError::config(format!(
                "'{}' is backed by {}, not btrfs",
                pool_mnt.display(),
                backing
            )));
        }

        for class in ["containers", "snapshots", "images", "custom"] {
            let subvol = pool_mnt.join(class);
            if !subvol.exists() {
                subvolume_create(&subvol)?;
                revert.push("delete class subvolume", move || subvolume_delete(&subvol));
            }
        }

        tracing::info!(pool = %pool_name, "Created BTRFS storage pool");
        revert.success();
        Ok(())
    }

    fn pool_delete(&mut self) -> StorageResult<()> {
        let pool_name = self.pool_name().to_string();
        tracing::info!(pool = %pool_name, "Deleting BTRFS storage pool");

        let pool_mnt = self.pool_mnt();
        if self.state.pool.config_bool("volatile.pool.pristine") {
            for class in ["containers", "snapshots", "images", "custom"] {
                let subvol = pool_mnt.join(class);
                if subvol.exists() {
                    subvolume_delete(&subvol)?;
                }
            }
        }
        if pool_mnt.exists() {
            fs::remove_dir_all(&pool_mnt)?;
        }

        tracing::info!(pool = %pool_name, "Deleted BTRFS storage pool");
        Ok(())
    }

    fn pool_mount(&mut self) -> StorageResult<bool> {
        // The pool directory sits on an already-mounted btrfs filesystem.
        Ok(true)
    }

    fn pool_umount(&mut self) -> StorageResult<bool> {
        Ok(true)
    }

    fn pool_update(&mut self, changed: &[String]) -> StorageResult<()> {
        tracing::debug!(pool = self.pool_name(), ?changed, "Updated BTRFS storage pool");
        Ok(())
    }

    fn volume_create(&mut self) -> StorageResult<()> {
        let volume = self.state.volume()?.name.clone();
        let mnt = self.custom_mnt(&volume);
        if mnt.exists() {
            return Err(StorageError::already_exists("storage volume", &volume));
        }
        subvolume_create(&mnt)?;
        fs::set_permissions(&mnt, fs::Permissions::from_mode(0o711))?;
        tracing::debug!(pool = self.pool_name(), volume = %volume, "Created BTRFS storage volume");
        Ok(())
    }

    fn volume_delete(&mut self) -> StorageResult<()> {
        let volume = self.state.volume()?.name.clone();
        let mnt = self.custom_mnt(&volume);
        if mnt.exists() {
            subvolume_delete(&mnt)?;
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
        tracing::debug!(pool = self.pool_name(), volume = %volume, "Deleted BTRFS storage volume");
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
        tracing::debug!(pool = self.pool_name(), ?changed, "Updated BTRFS storage volume");
        Ok(())
    }

    fn container_create(&mut self, container: &dyn ContainerHandle) -> StorageResult<()> {
        let name = container.name().to_string();
        tracing::debug!(pool = self.pool_name(), container = %name, "Creating BTRFS container volume");

        let mut revert = Reverter::new();

        let mnt = self.container_mnt(&name);
        subvolume_create(&mnt)?;
        fs::create_dir_all(mnt.join("rootfs"))?;
        {
            let mnt_revert = mnt.clone();
            revert.push("delete container subvolume", move || {
                subvolume_delete(&mnt_revert)
            });
        }

        layout::create_container_mount_point(&mnt, &container.path(), container.is_privileged())?;

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
            "Creating BTRFS container volume from image"
        );

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
        subvolume_snapshot(&self.image_mnt(fingerprint), &mnt, false)?;
        {
            let mnt_revert = mnt.clone();
            revert.push("delete cloned container subvolume", move || {
                subvolume_delete(&mnt_revert)
            });
        }
        if !mnt.join("rootfs").exists() {
            fs::create_dir_all(mnt.join("rootfs"))?;
        }

        layout::create_container_mount_point(&mnt, &container.path(), container.is_privileged())?;
        {
            let symlink = container.path();
            revert.push("remove container symlink", move || {
                if symlink.symlink_metadata().is_ok() {
                    fs::remove_file(&symlink)?;
                }
                Ok(())
            });
        }

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
        tracing::debug!(pool = self.pool_name(), container = %name, "Deleting BTRFS container volume");

        let mnt = self.container_mnt(&name);
        if mnt.exists() {
            subvolume_delete(&mnt)?;
        }
        layout::delete_container_mount_point(&mnt, &container.path(), "btrfs")?;

        let snapshots = self.snapshot_mnt(&name);
        if snapshots.exists() {
            for entry in fs::read_dir(&snapshots)? {
                let entry = entry?;
                if entry.path().is_dir() {
                    subvolume_delete(&entry.path())?;
                }
            }
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
            "Copying BTRFS container volume"
        );

        let mut revert = Reverter::new();

        let target_mnt = self.container_mnt(&target_name);
        subvolume_snapshot(&self.container_mnt(&source_name), &target_mnt, false)?;
        {
            let mnt_revert = target_mnt.clone();
            revert.push("delete copied container subvolume", move || {
                subvolume_delete(&mnt_revert)
            });
        }

        layout::create_container_mount_point(&target_mnt, &target.path(), target.is_privileged())?;

        if !container_only {
            for snapshot in source.snapshots()? {
                let (_, snap_only) = split_snapshot_name(&snapshot)?;
                let source_snap = self.snapshot_mnt(&snapshot);
                let target_snap = self.snapshot_mnt(&format!("{}/{}", target_name, snap_only));
                subvolume_snapshot(&source_snap, &target_snap, true)?;
                {
                    let snap_revert = target_snap.clone();
                    revert.push("delete copied snapshot subvolume", move || {
                        subvolume_delete(&snap_revert)
                    });
                }

                let symlink_target = self.snapshot_mnt(&target_name);
                let snapshots_symlink = self.state.paths.snapshots_symlink(&target_name);
                layout::create_snapshot_mount_point(
                    &target_snap,
                    &symlink_target,
                    &snapshots_symlink,
                )?;
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
            "Renaming BTRFS container volume"
        );

        let mut revert = Reverter::new();

        // Subvolume renames are plain directory renames.
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
        if old_snapshots.exists() {
            let new_snapshots = self.snapshot_mnt(new_name);
            fs::rename(&old_snapshots, &new_snapshots)?;

            let old_link = self.state.paths.snapshots_symlink(&old_name);
            if old_link.symlink_metadata().is_ok() {
                fs::remove_file(&old_link)?;
            }
            let new_link = self.state.paths.snapshots_symlink(new_name);
            if new_link.symlink_metadata().is_err() {
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
            "Restoring BTRFS container volume"
        );

        let target_mnt = self.container_mnt(target.name());
        subvolume_delete(&target_mnt)?;
        subvolume_snapshot(&self.snapshot_mnt(source.name()), &target_mnt, false)?;

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
        tracing::debug!(pool = self.pool_name(), snapshot = %target_name, "Creating BTRFS snapshot volume");

        let mut revert = Reverter::new();

        let snap_mnt = self.snapshot_mnt(&target_name);
        subvolume_snapshot(&self.container_mnt(source.name()), &snap_mnt, true)?;
        {
            let snap_revert = snap_mnt.clone();
            revert.push("delete snapshot subvolume", move || {
                subvolume_delete(&snap_revert)
            });
        }

        let (parent, _) = split_snapshot_name(&target_name)?;
        let symlink_target = self.snapshot_mnt(parent);
        let snapshots_symlink = self.state.paths.snapshots_symlink(parent);
        layout::create_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;

        revert.success();
        Ok(())
    }

    fn snapshot_create_empty(&mut self, target: &dyn ContainerHandle) -> StorageResult<()> {
        let snap_mnt = self.snapshot_mnt(target.name());
        subvolume_create(&snap_mnt)?;

        let (parent, _) = split_snapshot_name(target.name())?;
        let symlink_target = self.snapshot_mnt(parent);
        let snapshots_symlink = self.state.paths.snapshots_symlink(parent);
        layout::create_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;
        Ok(())
    }

    fn snapshot_delete(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<()> {
        let name = snapshot.name().to_string();
        tracing::debug!(pool = self.pool_name(), snapshot = %name, "Deleting BTRFS snapshot volume");

        let snap_mnt = self.snapshot_mnt(&name);
        if snap_mnt.exists() {
            subvolume_delete(&snap_mnt)?;
        }

        let (parent, _) = split_snapshot_name(&name)?;
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

    fn snapshot_start(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<bool> {
        // Snapshots are read-only subvolumes; flip them writable in place.
        subvolume_set_readonly(&self.snapshot_mnt(snapshot.name()), false)?;
        Ok(true)
    }

    fn snapshot_stop(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<bool> {
        subvolume_set_readonly(&self.snapshot_mnt(snapshot.name()), true)?;
        Ok(true)
    }

    fn image_create(&mut self, fingerprint: &str) -> StorageResult<()> {
        let pool = self.pool_name().to_string();
        let id = LockId::image_create(&pool, fingerprint);
        let mut result = Ok(());
        OPERATIONS.run(&id, || {
            result = self.image_create_locked(fingerprint);
            Ok(())
        })?;
        result
    }

    fn image_delete(&mut self, fingerprint: &str) -> StorageResult<()> {
        tracing::debug!(pool = self.pool_name(), image = fingerprint, "Deleting BTRFS image volume");

        // Btrfs snapshots are independent of their origin, so clones never
        // pin the image; deletion is always hard.
        let mnt = self.image_mnt(fingerprint);
        if mnt.exists() {
            subvolume_set_readonly(&mnt, false)?;
            subvolume_delete(&mnt)?;
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
        kind: VolumeKind,
        size: u64,
        container: Option<&dyn ContainerHandle>,
    ) -> StorageResult<()> {
        let path = match kind {
            VolumeKind::Container => {
                let container = container.ok_or_else(|| {
                    StorageError::config("container quota requires a container handle")
                })?;
                self.container_mnt(container.name())
            }
            VolumeKind::Custom => self.custom_mnt(&self.state.volume()?.name.clone()),
            other => {
                return Err(StorageError::config(format!(
                    "quota not applicable to {} volumes",
                    other
                )))
            }
        };

        run_command(
            "btrfs",
            &[
                "qgroup",
                "limit",
                &size.to_string(),
                &path.display().to_string(),
            ],
        )?;
        Ok(())
    }

    fn migration_type(&self) -> MigrationFsType {
        MigrationFsType::BtrfsSend
    }

    fn preserves_inodes(&self) -> bool {
        true
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

        Ok(Box::new(BtrfsMigrationSource {
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

            let (receive_dir, final_path) = match &object.snapshot {
                None => (
                    self.container_mnt(&name)
                        .parent()
                        .expect("container mount points have a parent")
                        .to_path_buf(),
                    self.container_mnt(&name),
                ),
                Some(snap) => {
                    let snap_name = format!("{}/{}", name, snap);
                    let dir = self.snapshot_mnt(&name);
                    fs::create_dir_all(&dir)?;
                    (dir, self.snapshot_mnt(&snap_name))
                }
            };

            let mut reader = stream.object_stream(object)?;
            let mut child = std::process::Command::new("btrfs")
                .args(["receive", "-e", &receive_dir.display().to_string()])
                .stdin(std::process::Stdio::piped())
                .spawn()
                .map_err(|e| StorageError::Transient {
                    command: format!("btrfs receive -e {}", receive_dir.display()),
                    message: format!("failed to spawn: {}", e),
                })?;
            if let Some(mut stdin) = child.stdin.take() {
                std::io::copy(&mut reader, &mut stdin)?;
            }
            let status = child.wait()?;
            if !status.success() {
                return Err(StorageError::Transient {
                    command: format!("btrfs receive -e {}", receive_dir.display()),
                    message: format!("exited with {}", status),
                });
            }

            // The base ships as a temporary read-only snapshot; move it into
            // place and make it writable.
            if object.snapshot.is_none() {
                let received = receive_dir.join(MIGRATION_SEND_NAME);
                if received.exists() {
                    if final_path.exists() {
                        subvolume_delete(&final_path)?;
                    }
                    fs::rename(&received, &final_path)?;
                }
                subvolume_set_readonly(&final_path, false)?;
            } else {
                let symlink_target = self.snapshot_mnt(&name);
                let snapshots_symlink = self.state.paths.snapshots_symlink(&name);
                layout::create_snapshot_mount_point(
                    &final_path,
                    &symlink_target,
                    &snapshots_symlink,
                )?;
            }
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

/// Name of the transient read-only snapshot `btrfs send` needs for the base.
const MIGRATION_SEND_NAME: &str = ".migration-send";

/// Migration source shipping `btrfs send` streams.
struct BtrfsMigrationSource {
    pool: String,
    paths: apollo_common::StoragePaths,
    objects: Vec<MigrationObject>,
}

impl MigrationSource for BtrfsMigrationSource {
    fn objects(&self) -> Vec<MigrationObject> {
        self.objects.clone()
    }

    fn preserves_inodes(&self) -> bool {
        true
    }

    fn send_object(
        &mut self,
        object: &MigrationObject,
        sink: &mut dyn std::io::Write,
    ) -> StorageResult<()> {
        let (send_path, cleanup) = match &object.snapshot {
            None => {
                // btrfs only sends read-only subvolumes; snapshot the live
                // state under a transient name.
                let base = self.paths.container_mount_point(&self.pool, &object.container);
                let tmp = base
                    .parent()
                    .expect("container mount points have a parent")
                    .join(MIGRATION_SEND_NAME);
                if tmp.exists() {
                    subvolume_delete(&tmp)?;
                }
                subvolume_snapshot(&base, &tmp, true)?;
                (tmp.clone(), Some(tmp))
            }
            Some(snap) => (
                self.paths
                    .snapshot_mount_point(&self.pool, &format!("{}/{}", object.container, snap)),
                None,
            ),
        };

        let output = std::process::Command::new("btrfs")
            .args(["send", &send_path.display().to_string()])
            .output()
            .map_err(|e| StorageError::Transient {
                command: format!("btrfs send {}", send_path.display()),
                message: format!("failed to spawn: {}", e),
            })?;

        if let Some(tmp) = cleanup {
            let _ = subvolume_delete(&tmp);
        }

        if !output.status.success() {
            return Err(StorageError::Transient {
                command: format!("btrfs send {}", send_path.display()),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        sink.write_all(&output.stdout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::validate_volume_name;

    #[test]
    fn migration_send_name_cannot_collide_with_container_names() {
        // The transient send snapshot lives next to real container
        // subvolumes; its dot prefix keeps it out of the valid name space.
        assert!(MIGRATION_SEND_NAME.starts_with('.'));
        assert!(validate_volume_name(MIGRATION_SEND_NAME).is_err());
    }
}
