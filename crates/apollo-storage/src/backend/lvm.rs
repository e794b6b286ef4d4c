//! LVM thin-pool storage backend.
//!
//! The pool attaches to an existing volume group and drives a thin pool
//! inside it. Logical volumes are named `<class>_<name>`; container
//! snapshots are thin snapshots named `containers_<c>_snapshot_<s>` so that
//! renaming a container renames its snapshot LVs with it. Thin snapshots do
//! not pin their origin, so image deletion is always hard.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use apollo_common::{StorageError, StorageResult};
use rustix::mount::UnmountFlags;

use crate::backend::{make_fs_type, Backend, BackendState, DriverKind};
use crate::cmd::run_command;
use crate::container::{split_snapshot_name, ContainerHandle};
use crate::layout;
use crate::lock::{LockId, RunOutcome, OPERATIONS};
use crate::meta::{StorageVolume, VolumeKind};
use crate::migration::{
    shift_if_necessary, MigrationFsType, MigrationObject, MigrationSinkArgs, MigrationSource,
    MigrationStream,
};
use crate::mount::{is_mount_point, resolve_mount_options, try_mount, try_unmount};
use crate::revert::Reverter;
use crate::fsutil;

/// Default thin pool name inside the volume group.
const DEFAULT_THINPOOL: &str = "ApolloThinPool";

/// Default size for new thin volumes.
const DEFAULT_LV_SIZE: &str = "10GiB";

/// Probe the `lvm` CLI.
pub(super) fn probe() -> StorageResult<String> {
    let out = run_command("lvm", &["version"]).map_err(|e| StorageError::BackendUnavailable {
        driver: "lvm".to_string(),
        reason: e.to_string(),
    })?;
    Ok(out.lines().next().unwrap_or_default().trim().to_string())
}

/// LV holding one container snapshot. The name embeds the container so a
/// container rename can find and rename its snapshot LVs.
fn snapshot_lv_name(container: &str, snapshot: &str) -> String {
    format!("containers_{}_snapshot_{}", container, snapshot)
}

/// The LVM backend.
pub struct LvmBackend {
    state: BackendState,
    vg_name: String,
    thinpool: String,
}

impl LvmBackend {
    pub(super) fn init(mut state: BackendState) -> StorageResult<Self> {
        state.version = probe()?;
        tracing::debug!(pool = %state.pool.name, "Initializing an LVM driver");

        let vg_name = state
            .pool
            .config
            .get("lvm.vg_name")
            .or_else(|| state.pool.config.get("source"))
            .cloned()
            .unwrap_or_else(|| state.pool.name.clone());
        let thinpool = state
            .pool
            .config
            .get("lvm.thinpool_name")
            .cloned()
            .unwrap_or_else(|| DEFAULT_THINPOOL.to_string());

        Ok(Self {
            state,
            vg_name,
            thinpool,
        })
    }

    fn pool_name(&self) -> &str {
        &self.state.pool.name
    }

    fn lv_name(&self, kind: VolumeKind, name: &str) -> String {
        let prefix = match kind {
            VolumeKind::Container => "containers",
            VolumeKind::Image => "images",
            VolumeKind::Custom => "custom",
            VolumeKind::Snapshot => "snapshots",
        };
        format!("{}_{}", prefix, name)
    }

    fn lv_path(&self, lv: &str) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{}", self.vg_name, lv))
    }

    fn lv_exists(&self, lv: &str) -> bool {
        run_command("lvs", &[&format!("{}/{}", self.vg_name, lv)]).is_ok()
    }

    fn lv_size(&self) -> String {
        self.state
            .volume
            .as_ref()
            .and_then(|v| v.config.get("size"))
            .or_else(|| self.state.pool.config.get("volume.size"))
            .cloned()
            .unwrap_or_else(|| DEFAULT_LV_SIZE.to_string())
    }

    fn block_filesystem(&self) -> String {
        self.state
            .volume
            .as_ref()
            .and_then(|v| v.config.get("block.filesystem"))
            .or_else(|| self.state.pool.config.get("volume.block.filesystem"))
            .cloned()
            .unwrap_or_else(|| "ext4".to_string())
    }

    fn block_mount_options(&self) -> String {
        self.state
            .volume
            .as_ref()
            .and_then(|v| v.config.get("block.mount_options"))
            .or_else(|| self.state.pool.config.get("volume.block.mount_options"))
            .cloned()
            .unwrap_or_else(|| "discard".to_string())
    }

    /// Create a thin volume and format it.
    fn lv_create(&self, lv: &str, size: &str) -> StorageResult<()> {
        run_command(
            "lvcreate",
            &[
                "--thin",
                "-V",
                size,
                "--name",
                lv,
                &format!("{}/{}", self.vg_name, self.thinpool),
            ],
        )?;
        make_fs_type(&self.lv_path(lv), &self.block_filesystem())?;
        Ok(())
    }

    /// Thin snapshot; shares extents with the origin until written.
    fn lv_snapshot(&self, origin_lv: &str, snapshot_lv: &str) -> StorageResult<()> {
        run_command(
            "lvcreate",
            &[
                "-s",
                "--name",
                snapshot_lv,
                "--setactivationskip",
                "n",
                &format!("{}/{}", self.vg_name, origin_lv),
            ],
        )?;
        Ok(())
    }

    fn lv_activate(&self, lv: &str) -> StorageResult<()> {
        run_command(
            "lvchange",
            &["-ay", "-K", &format!("{}/{}", self.vg_name, lv)],
        )?;
        Ok(())
    }

    fn lv_remove(&self, lv: &str) -> StorageResult<()> {
        run_command("lvremove", &["-f", &format!("{}/{}", self.vg_name, lv)])?;
        Ok(())
    }

    fn lv_rename(&self, old_lv: &str, new_lv: &str) -> StorageResult<()> {
        run_command("lvrename", &[&self.vg_name, old_lv, new_lv])?;
        Ok(())
    }

    /// Names of the LVs in the volume group.
    fn lv_list(&self) -> StorageResult<Vec<String>> {
        let out = run_command("lvs", &["--noheadings", "-o", "lv_name", &self.vg_name])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn mount_lv(&self, lv: &str, mnt: &Path) -> StorageResult<()> {
        self.lv_activate(lv)?;
        let (flags, data) = resolve_mount_options(&self.block_mount_options());
        try_mount(&self.lv_path(lv), mnt, &self.block_filesystem(), flags, &data)
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
        tracing::debug!(pool = self.pool_name(), image = fingerprint, "Creating LVM image volume");

        let mut revert = Reverter::new();

        let lv = self.lv_name(VolumeKind::Image, fingerprint);
        self.lv_create(&lv, &self.lv_size())?;
        {
            let vg = self.vg_name.clone();
            let lv = lv.clone();
            revert.push("remove image LV", move || {
                run_command("lvremove", &["-f", &format!("{}/{}", vg, lv)])?;
                Ok(())
            });
        }

        let image_mnt = self.image_mnt(fingerprint);
        fs::create_dir_all(&image_mnt)?;
        fs::set_permissions(&image_mnt, fs::Permissions::from_mode(0o700))?;
        {
            let mnt_revert = image_mnt.clone();
            revert.push("remove image mount point", move || {
                fs::remove_dir_all(&mnt_revert)?;
                Ok(())
            });
        }

        self.mount_lv(&lv, &image_mnt)?;
        let image_path = self.state.paths.image_file(fingerprint);
        let unpacked = self
            .state
            .unpacker
            .unpack(&image_path, &image_mnt, DriverKind::Lvm);
        try_unmount(&image_mnt, UnmountFlags::DETACH)?;
        unpacked?;

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

impl Backend for LvmBackend {
    fn kind(&self) -> DriverKind {
        DriverKind::Lvm
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
        tracing::info!(pool = %pool_name, vg = %self.vg_name, "Creating LVM storage pool");

        let source = self
            .state
            .pool
            .config
            .get("source")
            .cloned()
            .unwrap_or_default();
        self.state
            .pool
            .config
            .insert("volatile.initial_source".to_string(), source.clone());
        if !source.is_empty() {
            self.vg_name = source;
        }
        self.state
            .pool
            .config
            .insert("lvm.vg_name".to_string(), self.vg_name.clone());
        self.state
            .pool
            .config
            .insert("lvm.thinpool_name".to_string(), self.thinpool.clone());

        if run_command("vgs", &[&self.vg_name]).is_err() {
            return Err(StorageError::not_found("volume group", &self.vg_name));
        }

        let mut revert = Reverter::new();

        // The thin pool decides ownership: we only destroy what we created.
        if self.lv_exists(&self.thinpool) {
            self.state
                .pool
                .config
                .insert("volatile.pool.pristine".to_string(), "false".to_string());
        } else {
            run_command(
                "lvcreate",
                &[
                    "--poolmetadatasize",
                    "1G",
                    "-l",
                    "100%FREE",
                    "--thinpool",
                    &format!("{}/{}", self.vg_name, self.thinpool),
                ],
            )?;
            self.state
                .pool
                .config
                .insert("volatile.pool.pristine".to_string(), "true".to_string());
            {
                let vg = self.vg_name.clone();
                let thinpool = self.thinpool.clone();
                revert.push("remove thin pool", move || {
                    run_command("lvremove", &["-f", &format!("{}/{}", vg, thinpool)])?;
                    Ok(())
                });
            }
        }

        let pool_mnt = self.state.paths.pool_mount_point(&pool_name);
        fs::create_dir_all(&pool_mnt)?;
        fs::set_permissions(&pool_mnt, fs::Permissions::from_mode(0o711))?;
        {
            let mnt_revert = pool_mnt.clone();
            revert.push("remove pool mount point", move || {
                fs::remove_dir_all(&mnt_revert)?;
                Ok(())
            });
        }

        tracing::info!(pool = %pool_name, vg = %self.vg_name, "Created LVM storage pool");
        revert.success();
        Ok(())
    }

    fn pool_delete(&mut self) -> StorageResult<()> {
        let pool_name = self.pool_name().to_string();
        tracing::info!(pool = %pool_name, vg = %self.vg_name, "Deleting LVM storage pool");

        if self.state.pool.config_bool("volatile.pool.pristine")
            && self.lv_exists(&self.thinpool)
        {
            let thinpool = self.thinpool.clone();
            self.lv_remove(&thinpool)?;
        }

        let pool_mnt = self.state.paths.pool_mount_point(&pool_name);
        if pool_mnt.exists() {
            fs::remove_dir_all(&pool_mnt)?;
        }

        tracing::info!(pool = %pool_name, vg = %self.vg_name, "Deleted LVM storage pool");
        Ok(())
    }

    fn pool_mount(&mut self) -> StorageResult<bool> {
        // The volume group needs no mounting; volumes mount individually.
        Ok(true)
    }

    fn pool_umount(&mut self) -> StorageResult<bool> {
        Ok(true)
    }

    fn pool_update(&mut self, changed: &[String]) -> StorageResult<()> {
        tracing::debug!(pool = self.pool_name(), ?changed, "Updated LVM storage pool");
        Ok(())
    }

    fn volume_create(&mut self) -> StorageResult<()> {
        let volume = self.state.volume()?.name.clone();
        tracing::debug!(pool = self.pool_name(), volume = %volume, "Creating LVM storage volume");

        let mut revert = Reverter::new();

        let lv = self.lv_name(VolumeKind::Custom, &volume);
        self.lv_create(&lv, &self.lv_size())?;
        {
            let vg = self.vg_name.clone();
            let lv = lv.clone();
            revert.push("remove LV", move || {
                run_command("lvremove", &["-f", &format!("{}/{}", vg, lv)])?;
                Ok(())
            });
        }

        let mnt = self.custom_mnt(&volume);
        fs::create_dir_all(&mnt)?;
        fs::set_permissions(&mnt, fs::Permissions::from_mode(0o711))?;

        revert.success();
        Ok(())
    }

    fn volume_delete(&mut self) -> StorageResult<()> {
        let volume = self.state.volume()?.name.clone();
        tracing::debug!(pool = self.pool_name(), volume = %volume, "Deleting LVM storage volume");

        let mnt = self.custom_mnt(&volume);
        if is_mount_point(&mnt) {
            try_unmount(&mnt, UnmountFlags::DETACH)?;
        }

        let lv = self.lv_name(VolumeKind::Custom, &volume);
        if self.lv_exists(&lv) {
            self.lv_remove(&lv)?;
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

        if mnt.exists() {
            fs::remove_dir_all(&mnt)?;
        }
        Ok(())
    }

    fn volume_mount(&mut self) -> StorageResult<bool> {
        let volume = self.state.volume()?.name.clone();
        let lv = self.lv_name(VolumeKind::Custom, &volume);
        let mnt = self.custom_mnt(&volume);

        let id = LockId::custom_mount(self.pool_name(), &volume);
        let mut mount_result = Ok(());
        let outcome = OPERATIONS.run(&id, || {
            if is_mount_point(&mnt) {
                return Ok(false);
            }
            mount_result = self.mount_lv(&lv, &mnt);
            Ok(true)
        })?;
        mount_result?;
        match outcome {
            RunOutcome::Performed(mounted) => Ok(mounted),
            RunOutcome::AlreadyInProgress => Ok(false),
        }
    }

    fn volume_umount(&mut self) -> StorageResult<bool> {
        let volume = self.state.volume()?.name.clone();
        let mnt = self.custom_mnt(&volume);

        let id = LockId::custom_umount(self.pool_name(), &volume);
        let mut umount_result = Ok(());
        let outcome = OPERATIONS.run(&id, || {
            if !is_mount_point(&mnt) {
                return Ok(false);
            }
            umount_result = try_unmount(&mnt, UnmountFlags::DETACH);
            Ok(true)
        })?;
        umount_result?;
        match outcome {
            RunOutcome::Performed(unmounted) => Ok(unmounted),
            RunOutcome::AlreadyInProgress => Ok(false),
        }
    }

    fn volume_update(&mut self, changed: &[String]) -> StorageResult<()> {
        tracing::debug!(pool = self.pool_name(), ?changed, "Updated LVM storage volume");
        Ok(())
    }

    fn container_create(&mut self, container: &dyn ContainerHandle) -> StorageResult<()> {
        let name = container.name().to_string();
        tracing::debug!(pool = self.pool_name(), container = %name, "Creating LVM container volume");

        let mut revert = Reverter::new();

        let lv = self.lv_name(VolumeKind::Container, &name);
        self.lv_create(&lv, &self.lv_size())?;
        {
            let vg = self.vg_name.clone();
            let lv = lv.clone();
            revert.push("remove container LV", move || {
                run_command("lvremove", &["-f", &format!("{}/{}", vg, lv)])?;
                Ok(())
            });
        }

        let mnt = self.container_mnt(&name);
        layout::create_container_mount_point(&mnt, &container.path(), container.is_privileged())?;
        {
            let mnt = mnt.clone();
            let symlink = container.path();
            revert.push("remove container mount point", move || {
                layout::delete_container_mount_point(&mnt, &symlink, "")
            });
        }

        self.mount_lv(&lv, &mnt)?;
        fs::create_dir_all(mnt.join("rootfs"))?;
        try_unmount(&mnt, UnmountFlags::DETACH)?;

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
            "Creating LVM container volume from image"
        );

        let image_lv = self.lv_name(VolumeKind::Image, fingerprint);
        let lock = LockId::image_create(self.pool_name(), fingerprint);
        let mut fill_result = Ok(());
        OPERATIONS.run(&lock, || {
            if !self.lv_exists(&image_lv) {
                fill_result = self.image_create_locked(fingerprint);
            }
            Ok(())
        })?;
        fill_result?;

        let mut revert = Reverter::new();

        let container_lv = self.lv_name(VolumeKind::Container, &name);
        self.lv_snapshot(&image_lv, &container_lv)?;
        {
            let vg = self.vg_name.clone();
            let lv = container_lv.clone();
            revert.push("remove cloned container LV", move || {
                run_command("lvremove", &["-f", &format!("{}/{}", vg, lv)])?;
                Ok(())
            });
        }

        let mnt = self.container_mnt(&name);
        layout::create_container_mount_point(&mnt, &container.path(), container.is_privileged())?;
        {
            let mnt = mnt.clone();
            let symlink = container.path();
            revert.push("remove container mount point", move || {
                layout::delete_container_mount_point(&mnt, &symlink, "")
            });
        }

        self.mount_lv(&container_lv, &mnt)?;
        let shift_and_template = (|| -> StorageResult<()> {
            self.shift_rootfs(container)?;
            container.template_apply("create")
        })();
        try_unmount(&mnt, UnmountFlags::DETACH)?;
        shift_and_template?;

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
        tracing::debug!(pool = self.pool_name(), container = %name, "Deleting LVM container volume");

        self.container_umount(&name, &container.path())?;

        let lv = self.lv_name(VolumeKind::Container, &name);
        if self.lv_exists(&lv) {
            self.lv_remove(&lv)?;
        }

        // Snapshot LVs carry the container prefix; remove them with it.
        let snapshot_prefix = format!("containers_{}_snapshot_", name);
        for lv in self.lv_list()? {
            if lv.starts_with(&snapshot_prefix) {
                self.lv_remove(&lv)?;
            }
        }

        let mnt = self.container_mnt(&name);
        layout::delete_container_mount_point(&mnt, &container.path(), "lvm")?;

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
            "Copying LVM container volume"
        );

        let mut revert = Reverter::new();

        let source_lv = self.lv_name(VolumeKind::Container, &source_name);
        let target_lv = self.lv_name(VolumeKind::Container, &target_name);
        self.lv_snapshot(&source_lv, &target_lv)?;
        {
            let vg = self.vg_name.clone();
            let lv = target_lv.clone();
            revert.push("remove copied container LV", move || {
                run_command("lvremove", &["-f", &format!("{}/{}", vg, lv)])?;
                Ok(())
            });
        }

        let target_mnt = self.container_mnt(&target_name);
        layout::create_container_mount_point(&target_mnt, &target.path(), target.is_privileged())?;

        if !container_only {
            for snapshot in source.snapshots()? {
                let (_, snap_only) = split_snapshot_name(&snapshot)?;
                let source_snap_lv = snapshot_lv_name(&source_name, snap_only);
                let target_snap_lv = snapshot_lv_name(&target_name, snap_only);
                self.lv_snapshot(&source_snap_lv, &target_snap_lv)?;
                {
                    let vg = self.vg_name.clone();
                    let lv = target_snap_lv.clone();
                    revert.push("remove copied snapshot LV", move || {
                        run_command("lvremove", &["-f", &format!("{}/{}", vg, lv)])?;
                        Ok(())
                    });
                }

                let new_snap_name = format!("{}/{}", target_name, snap_only);
                let snap_mnt = self.snapshot_mnt(&new_snap_name);
                let symlink_target = self.snapshot_mnt(&target_name);
                let snapshots_symlink = self.state.paths.snapshots_symlink(&target_name);
                layout::create_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;
            }
        }

        let our_mount = self.container_mount(target)?;
        let template = target.template_apply("copy");
        if our_mount {
            let _ = self.container_umount(&target_name, &target.path());
        }
        template?;

        revert.success();
        Ok(())
    }

    fn container_mount(&mut self, container: &dyn ContainerHandle) -> StorageResult<bool> {
        let name = container.name().to_string();
        let lv = self.lv_name(VolumeKind::Container, &name);
        let mnt = self.container_mnt(&name);

        let id = LockId::container_mount(self.pool_name(), &name);
        let mut mount_result = Ok(());
        let outcome = OPERATIONS.run(&id, || {
            if is_mount_point(&mnt) {
                return Ok(false);
            }
            mount_result = self.mount_lv(&lv, &mnt);
            Ok(true)
        })?;
        mount_result?;
        match outcome {
            RunOutcome::Performed(mounted) => Ok(mounted),
            RunOutcome::AlreadyInProgress => Ok(false),
        }
    }

    fn container_umount(&mut self, name: &str, _path: &Path) -> StorageResult<bool> {
        let mnt = self.container_mnt(name);

        let id = LockId::container_umount(self.pool_name(), name);
        let mut umount_result = Ok(());
        let outcome = OPERATIONS.run(&id, || {
            if !is_mount_point(&mnt) {
                return Ok(false);
            }
            umount_result = try_unmount(&mnt, UnmountFlags::DETACH);
            Ok(true)
        })?;
        umount_result?;
        match outcome {
            RunOutcome::Performed(unmounted) => Ok(unmounted),
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
            "Renaming LVM container volume"
        );

        self.container_umount(&old_name, &container.path())?;

        let mut revert = Reverter::new();

        let old_lv = self.lv_name(VolumeKind::Container, &old_name);
        let new_lv = self.lv_name(VolumeKind::Container, new_name);
        self.lv_rename(&old_lv, &new_lv)?;
        {
            let vg = self.vg_name.clone();
            let (old_lv, new_lv) = (old_lv.clone(), new_lv.clone());
            revert.push("rename container LV back", move || {
                run_command("lvrename", &[&vg, &new_lv, &old_lv])?;
                Ok(())
            });
        }

        // Snapshot LVs embed the container name; rename them along.
        let old_prefix = format!("containers_{}_snapshot_", old_name);
        for lv in self.lv_list()? {
            if let Some(snap_only) = lv.strip_prefix(&old_prefix) {
                let renamed = snapshot_lv_name(new_name, snap_only);
                self.lv_rename(&lv, &renamed)?;
                {
                    let vg = self.vg_name.clone();
                    let (lv, renamed) = (lv.clone(), renamed.clone());
                    revert.push("rename snapshot LV back", move || {
                        run_command("lvrename", &[&vg, &renamed, &lv])?;
                        Ok(())
                    });
                }
            }
        }

        let old_mnt = self.container_mnt(&old_name);
        let new_mnt = self.container_mnt(new_name);
        let old_symlink = container.path();
        let new_symlink = self.state.paths.container_symlink(new_name);
        layout::rename_container_mount_point(&old_mnt, &old_symlink, &new_mnt, &new_symlink)?;

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
        let (parent, snap_only) = split_snapshot_name(source.name())?;
        tracing::debug!(
            pool = self.pool_name(),
            container = target.name(),
            snapshot = snap_only,
            "Restoring LVM container volume"
        );

        // No native rollback for thin volumes; restore by copying the
        // snapshot's tree over a cleared rootfs.
        let snap_lv = snapshot_lv_name(parent, snap_only);
        let snap_mnt = self.snapshot_mnt(source.name());
        fs::create_dir_all(&snap_mnt)?;
        self.mount_lv(&snap_lv, &snap_mnt)?;

        let restore = (|| -> StorageResult<()> {
            let our_mount = self.container_mount(target)?;
            let result = (|| {
                let target_rootfs = target.rootfs_path();
                fsutil::clear_dir(&target_rootfs)?;
                fsutil::copy_tree(&snap_mnt.join("rootfs"), &target_rootfs)
            })();
            if our_mount {
                let _ = self.container_umount(target.name(), &target.path());
            }
            result
        })();

        try_unmount(&snap_mnt, UnmountFlags::DETACH)?;
        restore
    }

    fn container_usage(&self, _container: &dyn ContainerHandle) -> StorageResult<u64> {
        Err(StorageError::Unsupported {
            feature: "LVM usage reporting".to_string(),
        })
    }

    fn container_storage_ready(&self, name: &str) -> bool {
        self.lv_exists(&self.lv_name(VolumeKind::Container, name))
    }

    fn snapshot_create(
        &mut self,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        let target_name = target.name().to_string();
        tracing::debug!(pool = self.pool_name(), snapshot = %target_name, "Creating LVM snapshot volume");

        let mut revert = Reverter::new();

        let (parent, snap_only) = split_snapshot_name(&target_name)?;
        let source_lv = self.lv_name(VolumeKind::Container, source.name());
        let snap_lv = snapshot_lv_name(parent, snap_only);
        self.lv_snapshot(&source_lv, &snap_lv)?;
        {
            let vg = self.vg_name.clone();
            let lv = snap_lv.clone();
            revert.push("remove snapshot LV", move || {
                run_command("lvremove", &["-f", &format!("{}/{}", vg, lv)])?;
                Ok(())
            });
        }

        let snap_mnt = self.snapshot_mnt(&target_name);
        let symlink_target = self.snapshot_mnt(parent);
        let snapshots_symlink = self.state.paths.snapshots_symlink(parent);
        layout::create_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;

        revert.success();
        Ok(())
    }

    fn snapshot_create_empty(&mut self, target: &dyn ContainerHandle) -> StorageResult<()> {
        let (parent, snap_only) = split_snapshot_name(target.name())?;
        let snap_lv = snapshot_lv_name(parent, snap_only);
        self.lv_create(&snap_lv, &self.lv_size())?;

        let snap_mnt = self.snapshot_mnt(target.name());
        let symlink_target = self.snapshot_mnt(parent);
        let snapshots_symlink = self.state.paths.snapshots_symlink(parent);
        layout::create_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;
        Ok(())
    }

    fn snapshot_delete(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<()> {
        let name = snapshot.name().to_string();
        tracing::debug!(pool = self.pool_name(), snapshot = %name, "Deleting LVM snapshot volume");

        let (parent, snap_only) = split_snapshot_name(&name)?;
        let snap_lv = snapshot_lv_name(parent, snap_only);
        if self.lv_exists(&snap_lv) {
            self.lv_remove(&snap_lv)?;
        }

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
        let old_name = snapshot.name().to_string();
        let (parent, old_snap_only) = split_snapshot_name(&old_name)?;
        let (_, new_snap_only) = split_snapshot_name(new_name)?;

        self.lv_rename(
            &snapshot_lv_name(parent, old_snap_only),
            &snapshot_lv_name(parent, new_snap_only),
        )?;

        let old_mnt = self.snapshot_mnt(&old_name);
        if old_mnt.exists() {
            fs::rename(&old_mnt, self.snapshot_mnt(new_name))?;
        }
        Ok(())
    }

    fn snapshot_start(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<bool> {
        let name = snapshot.name().to_string();
        let (parent, snap_only) = split_snapshot_name(&name)?;
        let snap_lv = snapshot_lv_name(parent, snap_only);
        let mnt = self.snapshot_mnt(&name);
        fs::create_dir_all(&mnt)?;
        self.mount_lv(&snap_lv, &mnt)?;
        Ok(true)
    }

    fn snapshot_stop(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<bool> {
        let mnt = self.snapshot_mnt(snapshot.name());
        try_unmount(&mnt, UnmountFlags::DETACH)?;
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
        tracing::debug!(pool = self.pool_name(), image = fingerprint, "Deleting LVM image volume");

        // Thin snapshots never pin their origin; deletion is always hard.
        let lv = self.lv_name(VolumeKind::Image, fingerprint);
        if self.lv_exists(&lv) {
            self.lv_remove(&lv)?;
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

        let mnt = self.image_mnt(fingerprint);
        if mnt.exists() {
            fs::remove_dir_all(&mnt)?;
        }
        Ok(())
    }

    fn image_mount(&mut self, fingerprint: &str) -> StorageResult<bool> {
        let mnt = self.image_mnt(fingerprint);
        if is_mount_point(&mnt) {
            return Ok(false);
        }
        let lv = self.lv_name(VolumeKind::Image, fingerprint);
        fs::create_dir_all(&mnt)?;
        self.mount_lv(&lv, &mnt)?;
        Ok(true)
    }

    fn image_umount(&mut self, fingerprint: &str) -> StorageResult<bool> {
        let mnt = self.image_mnt(fingerprint);
        if !is_mount_point(&mnt) {
            return Ok(false);
        }
        try_unmount(&mnt, UnmountFlags::empty())?;
        Ok(true)
    }

    fn set_quota(
        &mut self,
        kind: VolumeKind,
        size: u64,
        container: Option<&dyn ContainerHandle>,
    ) -> StorageResult<()> {
        let lv = match kind {
            VolumeKind::Container => {
                let container = container.ok_or_else(|| {
                    StorageError::config("container quota requires a container handle")
                })?;
                self.lv_name(VolumeKind::Container, container.name())
            }
            VolumeKind::Custom => {
                let volume = self.state.volume()?.name.clone();
                self.lv_name(VolumeKind::Custom, &volume)
            }
            other => {
                return Err(StorageError::config(format!(
                    "quota not applicable to {} volumes",
                    other
                )))
            }
        };

        // Growing resizes LV and filesystem together; shrinking thin volumes
        // under a live filesystem is refused by the tools, let that surface.
        run_command(
            "lvextend",
            &[
                "-r",
                "-L",
                &format!("{}B", size),
                &format!("{}/{}", self.vg_name, lv),
            ],
        )?;
        Ok(())
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

        // File-level streams of the mounted trees; the caller keeps the
        // container storage started for the duration of the migration.
        Ok(Box::new(LvmMigrationSource {
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

            match &object.snapshot {
                None => {
                    let mnt = self.container_mnt(&name);
                    let our_mount = self.container_mount(container)?;
                    let mut reader = stream.object_stream(object)?;
                    let mut archive = tar::Archive::new(&mut reader);
                    archive.set_preserve_permissions(true);
                    let unpacked: Result<(), StorageError> = archive.unpack(&mnt).map_err(Into::into);
                    if our_mount {
                        let _ = self.container_umount(&name, &container.path());
                    }
                    let () = unpacked?;
                }
                Some(snap) => {
                    let snap_name = format!("{}/{}", name, snap);
                    let placeholder = LvmSnapshotPlaceholder {
                        name: snap_name.clone(),
                        path: self.snapshot_mnt(&snap_name),
                    };
                    self.snapshot_create_empty(&placeholder)?;

                    let (parent, snap_only) = split_snapshot_name(&snap_name)?;
                    let snap_lv = snapshot_lv_name(parent, snap_only);
                    let snap_mnt = self.snapshot_mnt(&snap_name);
                    fs::create_dir_all(&snap_mnt)?;
                    self.mount_lv(&snap_lv, &snap_mnt)?;
                    let mut reader = stream.object_stream(object)?;
                    let mut archive = tar::Archive::new(&mut reader);
                    archive.set_preserve_permissions(true);
                    let unpacked: Result<(), StorageError> = archive.unpack(&snap_mnt).map_err(Into::into);
                    try_unmount(&snap_mnt, UnmountFlags::DETACH)?;
                    let () = unpacked?;
                }
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

/// Migration source shipping tar streams of the mounted trees.
struct LvmMigrationSource {
    pool: String,
    paths: apollo_common::StoragePaths,
    objects: Vec<MigrationObject>,
}

impl MigrationSource for LvmMigrationSource {
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

struct LvmSnapshotPlaceholder {
    name: String,
    path: PathBuf,
}

impl ContainerHandle for LvmSnapshotPlaceholder {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn is_privileged(&self) -> bool {
        false
    }

    fn idmap(&self) -> StorageResult<Option<apollo_common::Idmap>> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_lv_names_carry_container_prefix() {
        // snapshot_start mounts exactly this LV; the rename sweep strips
        // exactly this prefix.
        assert_eq!(snapshot_lv_name("c1", "s1"), "containers_c1_snapshot_s1");

        let prefix = "containers_c1_snapshot_";
        assert!(snapshot_lv_name("c1", "s1").starts_with(prefix));
        assert!(!snapshot_lv_name("c10", "s1").starts_with(prefix));
    }
}
