//! ZFS storage backend.
//!
//! The pool maps to a dataset tree `<zpool>/{containers,images,custom}`;
//! snapshots are native ZFS snapshots `@snapshot_<name>` on the container
//! dataset, and create-from-image clones the image dataset's protected
//! `@readonly` snapshot. Restore is `zfs rollback -r`, which is atomic but
//! destroys snapshots taken after the restore point; that is ZFS semantics
//! and surfaced to the operator rather than prevented.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use apollo_common::{StorageError, StorageResult};

use crate::backend::{Backend, BackendState, DriverKind};
use crate::cmd::{pipe_commands, run_command};
use crate::container::{split_snapshot_name, ContainerHandle};
use crate::layout;
use crate::lock::{LockId, RunOutcome, OPERATIONS};
use crate::meta::{StorageVolume, VolumeKind};
use crate::migration::{
    shift_if_necessary, MigrationFsType, MigrationObject, MigrationSinkArgs, MigrationSource,
    MigrationStream,
};
use crate::mount::is_mount_point;
use crate::revert::Reverter;

/// Probe the `zfs` CLI.
pub(super) fn probe() -> StorageResult<String> {
    let out = run_command("zfs", &["version"]).map_err(|e| StorageError::BackendUnavailable {
        driver: "zfs".to_string(),
        reason: e.to_string(),
    })?;
    Ok(out.lines().next().unwrap_or_default().to_string())
}

fn dataset_exists(dataset: &str) -> bool {
    run_command("zfs", &["list", "-H", "-o", "name", dataset]).is_ok()
}

/// Transient writable clone dataset serving a started read-only snapshot.
fn start_clone_dataset(zpool: &str, container: &str, snapshot: &str) -> String {
    format!("{}/containers/{}_{}_start_clone", zpool, container, snapshot)
}

/// The ZFS backend.
pub struct ZfsBackend {
    state: BackendState,
    zpool: String,
}

impl ZfsBackend {
    pub(super) fn init(mut state: BackendState) -> StorageResult<Self> {
        state.version = probe()?;
        tracing::debug!(pool = %state.pool.name, "Initializing a ZFS driver");

        let zpool = state
            .pool
            .config
            .get("zfs.pool_name")
            .or_else(|| state.pool.config.get("source"))
            .cloned()
            .unwrap_or_else(|| state.pool.name.clone());

        Ok(Self { state, zpool })
    }

    fn pool_name(&self) -> &str {
        &self.state.pool.name
    }

    fn dataset(&self, class: &str, name: &str) -> String {
        format!("{}/{}/{}", self.zpool, class, name)
    }

    fn container_dataset(&self, name: &str) -> String {
        self.dataset("containers", name)
    }

    fn image_dataset(&self, fingerprint: &str) -> String {
        self.dataset("images", fingerprint)
    }

    fn custom_dataset(&self, volume: &str) -> String {
        self.dataset("custom", volume)
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

    fn create_dataset(&self, dataset: &str, mountpoint: &Path) -> StorageResult<()> {
        run_command(
            "zfs",
            &[
                "create",
                "-p",
                "-o",
                &format!("mountpoint={}", mountpoint.display()),
                dataset,
            ],
        )?;
        Ok(())
    }

    fn destroy_dataset(&self, dataset: &str) -> StorageResult<()> {
        run_command("zfs", &["destroy", "-r", dataset])?;
        Ok(())
    }

    fn clone_dataset(
        &self,
        source: &str,
        snapshot: &str,
        target: &str,
        mountpoint: &Path,
    ) -> StorageResult<()> {
        run_command(
            "zfs",
            &[
                "clone",
                "-p",
                "-o",
                &format!("mountpoint={}", mountpoint.display()),
                &format!("{}@{}", source, snapshot),
                target,
            ],
        )?;
        Ok(())
    }

    fn mount_dataset(&self, dataset: &str) -> StorageResult<()> {
        match run_command("zfs", &["mount", dataset]) {
            Ok(_) => Ok(()),
            Err(StorageError::Transient { message, .. })
                if message.contains("already mounted") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn umount_dataset(&self, dataset: &str) -> StorageResult<()> {
        match run_command("zfs", &["unmount", dataset]) {
            Ok(_) => Ok(()),
            Err(StorageError::Transient { message, .. }) if message.contains("not currently mounted") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
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
        tracing::debug!(pool = self.pool_name(), image = fingerprint, "Creating ZFS image volume");

        let mut revert = Reverter::new();

        let dataset = self.image_dataset(fingerprint);
        let image_mnt = self.image_mnt(fingerprint);

        if dataset_exists(&format!("{}/deleted/images/{}", self.zpool, fingerprint)) {
            // Resurrect the zombie rather than unpacking again.
            run_command(
                "zfs",
                &[
                    "rename",
                    &format!("{}/deleted/images/{}", self.zpool, fingerprint),
                    &dataset,
                ],
            )?;
        } else {
            self.create_dataset(&dataset, &image_mnt)?;
            {
                let dataset = dataset.clone();
                revert.push("destroy image dataset", move || {
                    run_command("zfs", &["destroy", "-r", &dataset])?;
                    Ok(())
                });
            }
            fs::set_permissions(&image_mnt, fs::Permissions::from_mode(0o700))?;

            let image_path = self.state.paths.image_file(fingerprint);
            self.state
                .unpacker
                .unpack(&image_path, &image_mnt, DriverKind::Zfs)?;

            // Clones hang off this snapshot.
            run_command("zfs", &["snapshot", &format!("{}@readonly", dataset)])?;
        }

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

impl Backend for ZfsBackend {
    fn kind(&self) -> DriverKind {
        DriverKind::Zfs
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
        tracing::info!(pool = %pool_name, zpool = %self.zpool, "Creating ZFS storage pool");

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
        if source.is_empty() {
            return Err(StorageError::config(
                "the ZFS driver requires an existing zpool or dataset as 'source'",
            ));
        }
        self.zpool = source.clone();
        self.state
            .pool
            .config
            .insert("zfs.pool_name".to_string(), source.clone());

        let mut revert = Reverter::new();

        if dataset_exists(&self.zpool) {
            // Attaching to a pre-existing dataset tree.
            self.state
                .pool
                .config
                .insert("volatile.pool.pristine".to_string(), "false".to_string());
        } else {
            // `tank/apollo` style sources create a dataset inside an
            // existing zpool; a bare pool name must already exist.
            if !source.contains('/') {
                return Err(StorageError::not_found("zpool", &source));
            }
            run_command("zfs", &["create", "-o", "mountpoint=none", &self.zpool])?;
            self.state
                .pool
                .config
                .insert("volatile.pool.pristine".to_string(), "true".to_string());
            {
                let zpool = self.zpool.clone();
                revert.push("destroy pool dataset", move || {
                    run_command("zfs", &["destroy", "-r", &zpool])?;
                    Ok(())
                });
            }
        }

        for class in ["containers", "images", "custom", "deleted"] {
            let dataset = format!("{}/{}", self.zpool, class);
            if !dataset_exists(&dataset) {
                run_command("zfs", &["create", "-o", "mountpoint=none", &dataset])?;
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

        tracing::info!(pool = %pool_name, zpool = %self.zpool, "Created ZFS storage pool");
        revert.success();
        Ok(())
    }

    fn pool_delete(&mut self) -> StorageResult<()> {
        let pool_name = self.pool_name().to_string();
        tracing::info!(pool = %pool_name, zpool = %self.zpool, "Deleting ZFS storage pool");

        if self.state.pool.config_bool("volatile.pool.pristine") && dataset_exists(&self.zpool) {
            let zpool = self.zpool.clone();
            self.destroy_dataset(&zpool)?;
        }

        let pool_mnt = self.state.paths.pool_mount_point(&pool_name);
        if pool_mnt.exists() {
            fs::remove_dir_all(&pool_mnt)?;
        }

        tracing::info!(pool = %pool_name, zpool = %self.zpool, "Deleted ZFS storage pool");
        Ok(())
    }

    fn pool_mount(&mut self) -> StorageResult<bool> {
        // Datasets mount themselves through their mountpoint property.
        Ok(true)
    }

    fn pool_umount(&mut self) -> StorageResult<bool> {
        Ok(true)
    }

    fn pool_update(&mut self, changed: &[String]) -> StorageResult<()> {
        tracing::debug!(pool = self.pool_name(), ?changed, "Updated ZFS storage pool");
        Ok(())
    }

    fn volume_create(&mut self) -> StorageResult<()> {
        let volume = self.state.volume()?.name.clone();
        let dataset = self.custom_dataset(&volume);
        if dataset_exists(&dataset) {
            return Err(StorageError::already_exists("storage volume", &volume));
        }
        let mnt = self.custom_mnt(&volume);
        self.create_dataset(&dataset, &mnt)?;
        tracing::debug!(pool = self.pool_name(), volume = %volume, "Created ZFS storage volume");
        Ok(())
    }

    fn volume_delete(&mut self) -> StorageResult<()> {
        let volume = self.state.volume()?.name.clone();
        let dataset = self.custom_dataset(&volume);
        if dataset_exists(&dataset) {
            self.destroy_dataset(&dataset)?;
        }
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
        tracing::debug!(pool = self.pool_name(), volume = %volume, "Deleted ZFS storage volume");
        Ok(())
    }

    fn volume_mount(&mut self) -> StorageResult<bool> {
        let volume = self.state.volume()?.name.clone();
        let dataset = self.custom_dataset(&volume);
        let mnt = self.custom_mnt(&volume);

        let id = LockId::custom_mount(self.pool_name(), &volume);
        let mut mount_result = Ok(());
        let outcome = OPERATIONS.run(&id, || {
            if is_mount_point(&mnt) {
                return Ok(false);
            }
            mount_result = self.mount_dataset(&dataset);
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
        let dataset = self.custom_dataset(&volume);
        let mnt = self.custom_mnt(&volume);

        let id = LockId::custom_umount(self.pool_name(), &volume);
        let mut umount_result = Ok(());
        let outcome = OPERATIONS.run(&id, || {
            if !is_mount_point(&mnt) {
                return Ok(false);
            }
            umount_result = self.umount_dataset(&dataset);
            Ok(true)
        })?;
        umount_result?;
        match outcome {
            RunOutcome::Performed(unmounted) => Ok(unmounted),
            RunOutcome::AlreadyInProgress => Ok(false),
        }
    }

    fn volume_update(&mut self, changed: &[String]) -> StorageResult<()> {
        tracing::debug!(pool = self.pool_name(), ?changed, "Updated ZFS storage volume");
        Ok(())
    }

    fn container_create(&mut self, container: &dyn ContainerHandle) -> StorageResult<()> {
        let name = container.name().to_string();
        tracing::debug!(pool = self.pool_name(), container = %name, "Creating ZFS container volume");

        let mut revert = Reverter::new();

        let dataset = self.container_dataset(&name);
        let mnt = self.container_mnt(&name);
        self.create_dataset(&dataset, &mnt)?;
        {
            let dataset = dataset.clone();
            revert.push("destroy container dataset", move || {
                run_command("zfs", &["destroy", "-r", &dataset])?;
                Ok(())
            });
        }
        fs::create_dir_all(mnt.join("rootfs"))?;

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
            "Creating ZFS container volume from image"
        );

        let image_dataset = self.image_dataset(fingerprint);
        let lock = LockId::image_create(self.pool_name(), fingerprint);
        let mut fill_result = Ok(());
        OPERATIONS.run(&lock, || {
            if !dataset_exists(&image_dataset) {
                fill_result = self.image_create_locked(fingerprint);
            }
            Ok(())
        })?;
        fill_result?;

        let mut revert = Reverter::new();

        let dataset = self.container_dataset(&name);
        let mnt = self.container_mnt(&name);
        self.clone_dataset(&image_dataset, "readonly", &dataset, &mnt)?;
        {
            let dataset = dataset.clone();
            revert.push("destroy cloned container dataset", move || {
                run_command("zfs", &["destroy", "-r", &dataset])?;
                Ok(())
            });
        }
        self.mount_dataset(&dataset)?;
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
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        // Rolling back to anything but the newest snapshot destroys the
        // snapshots in between (`zfs rollback -r`). The operation is allowed;
        // the operator sees the consequence documented at the API layer.
        let _ = (target, source);
        Ok(())
    }

    fn container_delete(&mut self, container: &dyn ContainerHandle) -> StorageResult<()> {
        let name = container.name().to_string();
        tracing::debug!(pool = self.pool_name(), container = %name, "Deleting ZFS container volume");

        let dataset = self.container_dataset(&name);
        if dataset_exists(&dataset) {
            self.umount_dataset(&dataset)?;
            if self.destroy_dataset(&dataset).is_err() {
                // Clones of this container's snapshots keep the data pinned.
                run_command(
                    "zfs",
                    &[
                        "rename",
                        "-p",
                        &dataset,
                        &format!("{}/deleted/containers/{}", self.zpool, name),
                    ],
                )?;
                tracing::debug!(container = %name, "Marked ZFS container dataset as zombie");
            }
        }

        let mnt = self.container_mnt(&name);
        layout::delete_container_mount_point(&mnt, &container.path(), "zfs")?;

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
            "Copying ZFS container volume"
        );

        let snapshots = source.snapshots()?;
        let source_dataset = self.container_dataset(&source_name);
        let target_dataset = self.container_dataset(&target_name);
        let target_mnt = self.container_mnt(&target_name);

        let mut revert = Reverter::new();

        let clone_copy = self
            .state
            .pool
            .config
            .get("zfs.clone_copy")
            .map(|v| v != "false")
            .unwrap_or(true);

        if container_only || snapshots.is_empty() {
            if clone_copy {
                // Sparse: clone a fresh snapshot of the source's state.
                let copy_snap = format!("copy_{}", target_name);
                run_command(
                    "zfs",
                    &["snapshot", &format!("{}@{}", source_dataset, copy_snap)],
                )?;
                self.clone_dataset(&source_dataset, &copy_snap, &target_dataset, &target_mnt)?;
            } else {
                let send = format!("{}@copy_{}", source_dataset, target_name);
                run_command("zfs", &["snapshot", &send])?;
                pipe_commands(
                    ("zfs", &["send", &send]),
                    ("zfs", &["receive", "-F", &target_dataset]),
                )?;
                run_command("zfs", &["destroy", &send])?;
                run_command(
                    "zfs",
                    &[
                        "set",
                        &format!("mountpoint={}", target_mnt.display()),
                        &target_dataset,
                    ],
                )?;
            }
        } else {
            // Replay the snapshot chain with incremental sends, oldest first.
            let mut prev: Option<String> = None;
            for snapshot in &snapshots {
                let (_, snap_only) = split_snapshot_name(snapshot)?;
                let snap_object = format!("snapshot_{}", snap_only);
                let full = format!("{}@{}", source_dataset, snap_object);
                match &prev {
                    None => pipe_commands(
                        ("zfs", &["send", &full]),
                        ("zfs", &["receive", "-F", &target_dataset]),
                    )?,
                    Some(prev_snap) => pipe_commands(
                        (
                            "zfs",
                            &[
                                "send",
                                "-i",
                                &format!("{}@{}", source_dataset, prev_snap),
                                &full,
                            ],
                        ),
                        ("zfs", &["receive", "-F", &target_dataset]),
                    )?,
                };
                prev = Some(snap_object);

                let new_snap_name = format!("{}/{}", target_name, snap_only);
                let snap_mnt = self.snapshot_mnt(&new_snap_name);
                let symlink_target = self.snapshot_mnt(&target_name);
                let snapshots_symlink = self.state.paths.snapshots_symlink(&target_name);
                layout::create_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;
            }

            // Ship the live state referencing the newest snapshot.
            let live_snap = format!("{}@copy_{}", source_dataset, target_name);
            run_command("zfs", &["snapshot", &live_snap])?;
            pipe_commands(
                (
                    "zfs",
                    &[
                        "send",
                        "-i",
                        &format!("{}@{}", source_dataset, prev.expect("chain is non-empty")),
                        &live_snap,
                    ],
                ),
                ("zfs", &["receive", "-F", &target_dataset]),
            )?;
            run_command("zfs", &["destroy", &live_snap])?;
            run_command(
                "zfs",
                &[
                    "set",
                    &format!("mountpoint={}", target_mnt.display()),
                    &target_dataset,
                ],
            )?;
        }

        {
            let target_dataset = target_dataset.clone();
            revert.push("destroy copied container dataset", move || {
                run_command("zfs", &["destroy", "-r", &target_dataset])?;
                Ok(())
            });
        }

        self.mount_dataset(&target_dataset)?;
        layout::create_container_mount_point(&target_mnt, &target.path(), target.is_privileged())?;
        target.template_apply("copy")?;

        revert.success();
        Ok(())
    }

    fn container_mount(&mut self, container: &dyn ContainerHandle) -> StorageResult<bool> {
        let name = container.name().to_string();
        let dataset = self.container_dataset(&name);
        let mnt = self.container_mnt(&name);

        let id = LockId::container_mount(self.pool_name(), &name);
        let mut mount_result = Ok(());
        let outcome = OPERATIONS.run(&id, || {
            if is_mount_point(&mnt) {
                return Ok(false);
            }
            mount_result = self.mount_dataset(&dataset);
            Ok(true)
        })?;
        mount_result?;
        match outcome {
            RunOutcome::Performed(mounted) => Ok(mounted),
            RunOutcome::AlreadyInProgress => Ok(false),
        }
    }

    fn container_umount(&mut self, name: &str, _path: &Path) -> StorageResult<bool> {
        let dataset = self.container_dataset(name);
        let mnt = self.container_mnt(name);

        let id = LockId::container_umount(self.pool_name(), name);
        let mut umount_result = Ok(());
        let outcome = OPERATIONS.run(&id, || {
            if !is_mount_point(&mnt) {
                return Ok(false);
            }
            umount_result = self.umount_dataset(&dataset);
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
            "Renaming ZFS container volume"
        );

        self.container_umount(&old_name, &container.path())?;

        let mut revert = Reverter::new();

        let old_dataset = self.container_dataset(&old_name);
        let new_dataset = self.container_dataset(new_name);
        run_command("zfs", &["rename", &old_dataset, &new_dataset])?;
        {
            let (old_dataset, new_dataset) = (old_dataset.clone(), new_dataset.clone());
            revert.push("rename container dataset back", move || {
                run_command("zfs", &["rename", &new_dataset, &old_dataset])?;
                Ok(())
            });
        }

        let old_mnt = self.container_mnt(&old_name);
        let new_mnt = self.container_mnt(new_name);
        run_command(
            "zfs",
            &[
                "set",
                &format!("mountpoint={}", new_mnt.display()),
                &new_dataset,
            ],
        )?;

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
        let (_, snap_only) = split_snapshot_name(source.name())?;
        tracing::debug!(
            pool = self.pool_name(),
            container = target.name(),
            snapshot = snap_only,
            "Restoring ZFS container volume"
        );

        // Atomic, and destroys any snapshot newer than the restore point.
        let dataset = self.container_dataset(target.name());
        run_command(
            "zfs",
            &[
                "rollback",
                "-r",
                &format!("{}@snapshot_{}", dataset, snap_only),
            ],
        )?;
        Ok(())
    }

    fn container_usage(&self, container: &dyn ContainerHandle) -> StorageResult<u64> {
        let dataset = self.container_dataset(container.name());
        let out = run_command("zfs", &["get", "-H", "-p", "-o", "value", "used", &dataset])?;
        out.trim().parse::<u64>().map_err(|_| {
            StorageError::config(format!("unparsable 'used' value '{}'", out.trim()))
        })
    }

    fn container_storage_ready(&self, name: &str) -> bool {
        dataset_exists(&self.container_dataset(name))
    }

    fn snapshot_create(
        &mut self,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        let target_name = target.name().to_string();
        tracing::debug!(pool = self.pool_name(), snapshot = %target_name, "Creating ZFS snapshot volume");

        let mut revert = Reverter::new();

        let (_, snap_only) = split_snapshot_name(&target_name)?;
        let dataset = self.container_dataset(source.name());
        let full = format!("{}@snapshot_{}", dataset, snap_only);
        run_command("zfs", &["snapshot", &full])?;
        {
            let full = full.clone();
            revert.push("destroy ZFS snapshot", move || {
                run_command("zfs", &["destroy", &full])?;
                Ok(())
            });
        }

        let snap_mnt = self.snapshot_mnt(&target_name);
        let (parent, _) = split_snapshot_name(&target_name)?;
        let symlink_target = self.snapshot_mnt(parent);
        let snapshots_symlink = self.state.paths.snapshots_symlink(parent);
        layout::create_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;

        revert.success();
        Ok(())
    }

    fn snapshot_create_empty(&mut self, target: &dyn ContainerHandle) -> StorageResult<()> {
        tracing::debug!(
            pool = self.pool_name(),
            snapshot = target.name(),
            "Creating empty ZFS snapshot volume (noop)"
        );
        Ok(())
    }

    fn snapshot_delete(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<()> {
        let name = snapshot.name().to_string();
        tracing::debug!(pool = self.pool_name(), snapshot = %name, "Deleting ZFS snapshot volume");

        let (parent, snap_only) = split_snapshot_name(&name)?;
        let dataset = self.container_dataset(parent);
        let full = format!("{}@snapshot_{}", dataset, snap_only);
        run_command("zfs", &["destroy", &full])?;

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
        let dataset = self.container_dataset(parent);

        run_command(
            "zfs",
            &[
                "rename",
                &format!("{}@snapshot_{}", dataset, old_snap_only),
                &format!("{}@snapshot_{}", dataset, new_snap_only),
            ],
        )?;

        let old_mnt = self.snapshot_mnt(&old_name);
        if old_mnt.exists() {
            fs::rename(&old_mnt, self.snapshot_mnt(new_name))?;
        }
        Ok(())
    }

    fn snapshot_start(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<bool> {
        let name = snapshot.name().to_string();
        tracing::debug!(pool = self.pool_name(), snapshot = %name, "Starting ZFS snapshot volume");

        // ZFS snapshots cannot be mounted writable; serve a transient clone.
        let (parent, snap_only) = split_snapshot_name(&name)?;
        let dataset = self.container_dataset(parent);
        let clone = start_clone_dataset(&self.zpool, parent, snap_only);
        let mnt = self.snapshot_mnt(&name);
        fs::create_dir_all(&mnt)?;
        run_command(
            "zfs",
            &[
                "clone",
                "-o",
                &format!("mountpoint={}", mnt.display()),
                &format!("{}@snapshot_{}", dataset, snap_only),
                &clone,
            ],
        )?;
        self.mount_dataset(&clone)?;
        Ok(true)
    }

    fn snapshot_stop(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<bool> {
        let name = snapshot.name().to_string();
        tracing::debug!(pool = self.pool_name(), snapshot = %name, "Stopping ZFS snapshot volume");

        let (parent, snap_only) = split_snapshot_name(&name)?;
        let clone = start_clone_dataset(&self.zpool, parent, snap_only);
        self.umount_dataset(&clone)?;
        self.destroy_dataset(&clone)?;
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
        tracing::debug!(pool = self.pool_name(), image = fingerprint, "Deleting ZFS image volume");

        let dataset = self.image_dataset(fingerprint);
        if dataset_exists(&dataset) {
            self.umount_dataset(&dataset)?;
            if self.destroy_dataset(&dataset).is_err() {
                // Clones still reference @readonly; keep the dataset as a
                // zombie until the last clone goes away.
                run_command(
                    "zfs",
                    &[
                        "rename",
                        "-p",
                        &dataset,
                        &format!("{}/deleted/images/{}", self.zpool, fingerprint),
                    ],
                )?;
                tracing::debug!(image = fingerprint, "Marked ZFS image dataset as zombie");
            }
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
        let dataset = self.image_dataset(fingerprint);
        self.mount_dataset(&dataset)?;
        Ok(true)
    }

    fn image_umount(&mut self, fingerprint: &str) -> StorageResult<bool> {
        let mnt = self.image_mnt(fingerprint);
        if !is_mount_point(&mnt) {
            return Ok(false);
        }
        let dataset = self.image_dataset(fingerprint);
        self.umount_dataset(&dataset)?;
        Ok(true)
    }

    fn set_quota(
        &mut self,
        kind: VolumeKind,
        size: u64,
        container: Option<&dyn ContainerHandle>,
    ) -> StorageResult<()> {
        let dataset = match kind {
            VolumeKind::Container => {
                let container = container.ok_or_else(|| {
                    StorageError::config("container quota requires a container handle")
                })?;
                self.container_dataset(container.name())
            }
            VolumeKind::Custom => {
                let volume = self.state.volume()?.name.clone();
                self.custom_dataset(&volume)
            }
            other => {
                return Err(StorageError::config(format!(
                    "quota not applicable to {} volumes",
                    other
                )))
            }
        };

        run_command("zfs", &["set", &format!("quota={}", size), &dataset])?;
        Ok(())
    }

    fn migration_type(&self) -> MigrationFsType {
        MigrationFsType::ZfsSend
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

        Ok(Box::new(ZfsMigrationSource {
            zpool: self.zpool.clone(),
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
        let dataset = self.container_dataset(&name);

        for object in &args.objects {
            if args.container_only && object.snapshot.is_some() {
                continue;
            }

            let mut reader = stream.object_stream(object)?;
            let mut child = std::process::Command::new("zfs")
                .args(["receive", "-F", &dataset])
                .stdin(std::process::Stdio::piped())
                .spawn()
                .map_err(|e| StorageError::Transient {
                    command: format!("zfs receive -F {}", dataset),
                    message: format!("failed to spawn: {}", e),
                })?;
            if let Some(mut stdin) = child.stdin.take() {
                std::io::copy(&mut reader, &mut stdin)?;
            }
            let status = child.wait()?;
            if !status.success() {
                return Err(StorageError::Transient {
                    command: format!("zfs receive -F {}", dataset),
                    message: format!("exited with {}", status),
                });
            }

            if let Some(snap) = &object.snapshot {
                let snap_name = format!("{}/{}", name, snap);
                let snap_mnt = self.snapshot_mnt(&snap_name);
                let symlink_target = self.snapshot_mnt(&name);
                let snapshots_symlink = self.state.paths.snapshots_symlink(&name);
                layout::create_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;
            }
        }

        let mnt = self.container_mnt(&name);
        run_command(
            "zfs",
            &["set", &format!("mountpoint={}", mnt.display()), &dataset],
        )?;
        self.mount_dataset(&dataset)?;

        layout::create_container_mount_point(&mnt, &container.path(), container.is_privileged())?;
        shift_if_necessary(container, args.source_idmap.as_ref())?;
        Ok(())
    }
}

/// Migration source shipping `zfs send` streams.
struct ZfsMigrationSource {
    zpool: String,
    objects: Vec<MigrationObject>,
}

impl MigrationSource for ZfsMigrationSource {
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
        let dataset = format!("{}/containers/{}", self.zpool, object.container);
        let spec = match &object.snapshot {
            None => {
                // The live state ships as a transient snapshot.
                let migration = format!("{}@migration", dataset);
                let _ = run_command("zfs", &["destroy", &migration]);
                run_command("zfs", &["snapshot", &migration])?;
                migration
            }
            Some(snap) => format!("{}@snapshot_{}", dataset, snap),
        };

        let output = std::process::Command::new("zfs")
            .args(["send", &spec])
            .output()
            .map_err(|e| StorageError::Transient {
                command: format!("zfs send {}", spec),
                message: format!("failed to spawn: {}", e),
            })?;

        if object.snapshot.is_none() {
            let _ = run_command("zfs", &["destroy", &spec]);
        }

        if !output.status.success() {
            return Err(StorageError::Transient {
                command: format!("zfs send {}", spec),
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

    #[test]
    fn start_clone_name_matches_contract() {
        assert_eq!(
            start_clone_dataset("tank", "c1", "s1"),
            "tank/containers/c1_s1_start_clone"
        );
    }

    #[test]
    fn start_clone_lives_outside_the_snapshot_namespace() {
        // The transient clone is a regular dataset under containers/, so
        // destroying it on stop can never touch a real snapshot.
        let clone = start_clone_dataset("tank", "c1", "s1");
        assert!(!clone.contains('@'));
        assert!(clone.starts_with("tank/containers/"));
    }
}
