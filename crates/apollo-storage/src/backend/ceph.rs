//! Ceph RBD storage backend.
//!
//! Volumes are RBD images on an OSD pool, named `<type>_<name>` because every
//! volume type shares one flat namespace there. Containers are clones of the
//! image volume's protected `readonly` snapshot; snapshots are RBD snapshots
//! named `snapshot_<name>` on the parent volume. Images that still have
//! dependent clones at delete time are renamed with a `zombie_` prefix and
//! reaped later.
//!
//! All state changes go through the `rbd` and `ceph` CLIs:
//! `rbd --name client.<user> --cluster <cluster> ...`. The output parsers
//! here (notably `pg_num:`) are part of the external contract; newer tool
//! output formats are a breaking change, not something to paper over.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use apollo_common::{StorageError, StorageResult};
use rustix::mount::UnmountFlags;

use crate::backend::{make_fs_type, Backend, BackendState, DriverKind};
use crate::cmd::{pipe_commands, run_command, try_run_command};
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

/// Default size for RBD volumes when neither the volume nor the pool sets one.
const DEFAULT_RBD_SIZE: &str = "10GB";

/// Probe the `rbd` CLI.
pub(super) fn probe() -> StorageResult<String> {
    run_command("rbd", &["--version"]).map_err(|e| StorageError::BackendUnavailable {
        driver: "ceph".to_string(),
        reason: e.to_string(),
    })
}

/// Extract the placement-group count from `ceph osd pool get <pool> pg_num`.
///
/// The tool prints `pg_num: N`. This parse breaks silently if the output
/// format ever changes; that is a known sharp edge of the external contract.
fn parse_pg_num(output: &str) -> Option<String> {
    let idx = output.find("pg_num:")?;
    let value = output[idx + "pg_num:".len()..].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// `<type>_<name>`: the flat RBD namespace encoding.
fn rbd_object(kind: VolumeKind, name: &str) -> String {
    format!("{}_{}", kind.as_str(), name)
}

/// Zombie rename of an RBD object.
fn zombie_object(kind: VolumeKind, name: &str) -> String {
    format!("zombie_{}_{}", kind.as_str(), name)
}

/// Transient writable clone serving a started read-only snapshot.
fn start_clone_object(container: &str, snapshot: &str) -> String {
    format!("{}_{}_start_clone", container, snapshot)
}

/// The Ceph RBD backend.
pub struct CephBackend {
    state: BackendState,
    cluster_name: String,
    osd_pool_name: String,
    user_name: String,
    pg_num: String,
}

impl CephBackend {
    pub(super) fn init(mut state: BackendState) -> StorageResult<Self> {
        state.version = probe()?;
        tracing::debug!(pool = %state.pool.name, "Initializing a CEPH driver");

        let config = &state.pool.config;
        let cluster_name = config
            .get("ceph.cluster_name")
            .cloned()
            .unwrap_or_else(|| "ceph".to_string());
        let osd_pool_name = config
            .get("ceph.osd.pool_name")
            .cloned()
            .unwrap_or_default();
        let user_name = config
            .get("ceph.user.name")
            .cloned()
            .unwrap_or_else(|| "admin".to_string());
        let pg_num = config
            .get("ceph.osd.pg_num")
            .cloned()
            .unwrap_or_else(|| "32".to_string());

        Ok(Self {
            state,
            cluster_name,
            osd_pool_name,
            user_name,
            pg_num,
        })
    }

    fn pool_name(&self) -> &str {
        &self.state.pool.name
    }

    fn client_name(&self) -> String {
        format!("client.{}", self.user_name)
    }

    /// Run `rbd` with the cluster/user/pool preamble.
    fn rbd(&self, args: &[&str]) -> StorageResult<String> {
        let client = self.client_name();
        let mut full: Vec<&str> = vec![
            "--name",
            &client,
            "--cluster",
            &self.cluster_name,
            "--pool",
            &self.osd_pool_name,
        ];
        full.extend_from_slice(args);
        run_command("rbd", &full)
    }

    /// Run `ceph` with the cluster/user preamble.
    fn ceph(&self, args: &[&str]) -> StorageResult<String> {
        let client = self.client_name();
        let mut full: Vec<&str> = vec!["--name", &client, "--cluster", &self.cluster_name];
        full.extend_from_slice(args);
        run_command("ceph", &full)
    }

    fn osd_pool_exists(&self, name: &str) -> bool {
        self.ceph(&["osd", "pool", "get", name, "size"]).is_ok()
    }

    fn osd_pool_destroy(&self, name: &str) -> StorageResult<()> {
        self.ceph(&[
            "osd",
            "pool",
            "delete",
            name,
            name,
            "--yes-i-really-really-mean-it",
        ])?;
        Ok(())
    }

    fn rbd_volume_exists(&self, object: &str) -> bool {
        self.rbd(&["info", object]).is_ok()
    }

    fn rbd_volume_create(&self, object: &str, size: &str) -> StorageResult<()> {
        self.rbd(&["--image-feature", "layering", "--size", size, "create", object])?;
        Ok(())
    }

    fn rbd_volume_delete(&self, object: &str) -> StorageResult<()> {
        self.rbd(&["rm", object])?;
        Ok(())
    }

    fn rbd_volume_map(&self, object: &str) -> StorageResult<PathBuf> {
        let dev = self.rbd(&["map", object])?;
        Ok(PathBuf::from(dev))
    }

    /// Unmap, retrying while the kernel still holds the device busy.
    fn rbd_volume_unmap(&self, object: &str) -> StorageResult<()> {
        let client = self.client_name();
        match try_run_command(
            "rbd",
            &[
                "--name",
                &client,
                "--cluster",
                &self.cluster_name,
                "--pool",
                &self.osd_pool_name,
                "unmap",
                object,
            ],
        ) {
            Ok(_) => Ok(()),
            // Not mapped in the first place.
            Err(StorageError::Transient { message, .. }) if message.contains("not mapped") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The device path of a mapped volume, mapping it first when needed.
    fn rbd_mapped_dev_path(&self, object: &str) -> StorageResult<PathBuf> {
        let udev_path = PathBuf::from(format!("/dev/rbd/{}/{}", self.osd_pool_name, object));
        if udev_path.exists() {
            return Ok(udev_path);
        }
        self.rbd_volume_map(object)
    }

    fn rbd_clone_create(
        &self,
        source_object: &str,
        source_snap: &str,
        target_object: &str,
    ) -> StorageResult<()> {
        let src = format!("{}/{}@{}", self.osd_pool_name, source_object, source_snap);
        let dst = format!("{}/{}", self.osd_pool_name, target_object);
        self.rbd(&["--image-feature", "layering", "clone", &src, &dst])?;
        Ok(())
    }

    fn rbd_snapshot_create(&self, object: &str, snap: &str) -> StorageResult<()> {
        self.rbd(&["snap", "create", &format!("{}@{}", object, snap)])?;
        Ok(())
    }

    fn rbd_snapshot_delete(&self, object: &str, snap: &str) -> StorageResult<()> {
        self.rbd(&["snap", "rm", &format!("{}@{}", object, snap)])?;
        Ok(())
    }

    fn rbd_snapshot_protect(&self, object: &str, snap: &str) -> StorageResult<()> {
        match self.rbd(&["snap", "protect", &format!("{}@{}", object, snap)]) {
            Ok(_) => Ok(()),
            Err(StorageError::Transient { message, .. })
                if message.contains("already protected") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn rbd_snapshot_unprotect(&self, object: &str, snap: &str) -> StorageResult<()> {
        match self.rbd(&["snap", "unprotect", &format!("{}@{}", object, snap)]) {
            Ok(_) => Ok(()),
            Err(StorageError::Transient { message, .. })
                if message.contains("snap is already unprotected") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn rbd_snapshot_rename(&self, object: &str, old: &str, new: &str) -> StorageResult<()> {
        self.rbd(&[
            "snap",
            "rename",
            &format!("{}@{}", object, old),
            &format!("{}@{}", object, new),
        ])?;
        Ok(())
    }

    fn rbd_snapshot_purge(&self, object: &str) -> StorageResult<()> {
        self.rbd(&["snap", "purge", object])?;
        Ok(())
    }

    /// Clones depending on `object@snap`; empty when none.
    fn rbd_snapshot_clones(&self, object: &str, snap: &str) -> StorageResult<Vec<String>> {
        let out = self.rbd(&["children", &format!("{}@{}", object, snap)])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn rbd_rename(&self, old_object: &str, new_object: &str) -> StorageResult<()> {
        self.rbd(&["mv", old_object, new_object])?;
        Ok(())
    }

    fn rbd_mark_deleted(&self, kind: VolumeKind, name: &str) -> StorageResult<()> {
        self.rbd_rename(&rbd_object(kind, name), &zombie_object(kind, name))
    }

    fn rbd_unmark_deleted(&self, kind: VolumeKind, name: &str) -> StorageResult<()> {
        self.rbd_rename(&zombie_object(kind, name), &rbd_object(kind, name))
    }

    /// Size for new RBD volumes, in `rbd`'s `--size` syntax.
    fn rbd_size(&self) -> String {
        let raw = self
            .state
            .volume
            .as_ref()
            .and_then(|v| v.config.get("size"))
            .or_else(|| self.state.pool.config.get("size"))
            .cloned()
            .unwrap_or_else(|| DEFAULT_RBD_SIZE.to_string());
        // rbd understands K/M/G/T suffixes, not KB/MB/GB/TB.
        raw.trim_end_matches(['b', 'B']).to_string()
    }

    /// Filesystem new RBD volumes are formatted with.
    fn rbd_filesystem(&self) -> String {
        self.state
            .volume
            .as_ref()
            .and_then(|v| v.config.get("block.filesystem"))
            .or_else(|| self.state.pool.config.get("volume.block.filesystem"))
            .cloned()
            .unwrap_or_else(|| "ext4".to_string())
    }

    fn rbd_mount_options(&self) -> String {
        self.state
            .volume
            .as_ref()
            .and_then(|v| v.config.get("block.mount_options"))
            .or_else(|| self.state.pool.config.get("volume.block.mount_options"))
            .cloned()
            .unwrap_or_else(|| "discard".to_string())
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

    fn mount_device(&self, object: &str, mnt: &Path) -> StorageResult<()> {
        let dev = self.rbd_mapped_dev_path(object)?;
        let (flags, data) = resolve_mount_options(&self.rbd_mount_options());
        try_mount(&dev, mnt, &self.rbd_filesystem(), flags, &data)
    }

    /// Chain one incremental transfer: `rbd export-diff | rbd import-diff`.
    fn copy_with_snapshots(
        &self,
        source_spec: &str,
        target_spec: &str,
        prev_snap: Option<&str>,
    ) -> StorageResult<()> {
        let client = self.client_name();
        let mut export: Vec<&str> = vec![
            "--name",
            &client,
            "--cluster",
            &self.cluster_name,
            "export-diff",
        ];
        if let Some(prev) = prev_snap {
            export.push("--from-snap");
            export.push(prev);
        }
        export.push(source_spec);
        export.push("-");

        let import: Vec<&str> = vec![
            "--name",
            &client,
            "--cluster",
            &self.cluster_name,
            "import-diff",
            "-",
            target_spec,
        ];

        pipe_commands(("rbd", &export), ("rbd", &import))?;
        Ok(())
    }

    /// Sparse copy: clone the source's fresh `snapshot_<target>` snapshot.
    fn copy_without_snapshots_sparse(
        &self,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        let source_object = rbd_object(VolumeKind::Container, source.name());
        let snap = format!("snapshot_{}", target.name());

        self.rbd_snapshot_create(&source_object, &snap)?;
        self.rbd_snapshot_protect(&source_object, &snap)?;
        self.rbd_clone_create(
            &source_object,
            &snap,
            &rbd_object(VolumeKind::Container, target.name()),
        )?;
        Ok(())
    }

    /// Full copy: `rbd export | rbd import`, no clone dependency.
    fn copy_without_snapshots_full(
        &self,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        let client = self.client_name();
        let src = format!(
            "{}/{}",
            self.osd_pool_name,
            rbd_object(VolumeKind::Container, source.name())
        );
        let dst = format!(
            "{}/{}",
            self.osd_pool_name,
            rbd_object(VolumeKind::Container, target.name())
        );

        let export: Vec<&str> = vec![
            "--name",
            &client,
            "--cluster",
            &self.cluster_name,
            "export",
            &src,
            "-",
        ];
        let import: Vec<&str> = vec![
            "--name",
            &client,
            "--cluster",
            &self.cluster_name,
            "import",
            "-",
            &dst,
        ];
        pipe_commands(("rbd", &export), ("rbd", &import))?;
        Ok(())
    }

    /// Populate the image cache entry. Caller holds the image-create lock.
    fn image_create_locked(&mut self, fingerprint: &str) -> StorageResult<()> {
        tracing::debug!(
            pool = self.pool_name(),
            image = fingerprint,
            "Creating RBD image volume"
        );

        let mut revert = Reverter::new();

        let image_mnt = self.image_mnt(fingerprint);
        if !image_mnt.exists() {
            fs::create_dir_all(&image_mnt)?;
            fs::set_permissions(&image_mnt, fs::Permissions::from_mode(0o700))?;
            let mnt_revert = image_mnt.clone();
            revert.push("remove image mount point", move || {
                fs::remove_dir_all(&mnt_revert)?;
                Ok(())
            });
        }

        let object = rbd_object(VolumeKind::Image, fingerprint);
        if self.rbd_volume_exists(&zombie_object(VolumeKind::Image, fingerprint)) {
            // A zombie with live clones still holds the content; resurrect it
            // instead of unpacking again.
            self.rbd_unmark_deleted(VolumeKind::Image, fingerprint)?;
            let old = rbd_object(VolumeKind::Image, fingerprint);
            let new = zombie_object(VolumeKind::Image, fingerprint);
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("mark image volume deleted again", move || {
                run_command(
                    "rbd",
                    &[
                        "--name", &user, "--cluster", &cluster, "--pool", &osd_pool, "mv", &old,
                        &new,
                    ],
                )?;
                Ok(())
            });
        } else {
            self.rbd_volume_create(&object, &self.rbd_size())?;
            {
                let object = object.clone();
                let cluster = self.cluster_name.clone();
                let user = self.client_name();
                let osd_pool = self.osd_pool_name.clone();
                revert.push("delete image volume", move || {
                    run_command(
                        "rbd",
                        &[
                            "--name", &user, "--cluster", &cluster, "--pool", &osd_pool, "rm",
                            &object,
                        ],
                    )?;
                    Ok(())
                });
            }

            let dev = self.rbd_volume_map(&object)?;
            {
                let object = object.clone();
                let cluster = self.cluster_name.clone();
                let user = self.client_name();
                let osd_pool = self.osd_pool_name.clone();
                revert.push("unmap image volume", move || {
                    run_command(
                        "rbd",
                        &[
                            "--name", &user, "--cluster", &cluster, "--pool", &osd_pool, "unmap",
                            &object,
                        ],
                    )?;
                    Ok(())
                });
            }

            make_fs_type(&dev, &self.rbd_filesystem())?;

            self.image_mount(fingerprint)?;

            let image_path = self.state.paths.image_file(fingerprint);
            let unpacked = self
                .state
                .unpacker
                .unpack(&image_path, &image_mnt, DriverKind::Ceph);
            self.image_umount(fingerprint)?;
            unpacked?;

            self.rbd_volume_unmap(&object)?;

            self.rbd_snapshot_create(&object, "readonly")?;
            {
                let object = object.clone();
                let cluster = self.cluster_name.clone();
                let user = self.client_name();
                let osd_pool = self.osd_pool_name.clone();
                revert.push("delete readonly snapshot", move || {
                    run_command(
                        "rbd",
                        &[
                            "--name",
                            &user,
                            "--cluster",
                            &cluster,
                            "--pool",
                            &osd_pool,
                            "snap",
                            "rm",
                            &format!("{}@readonly", object),
                        ],
                    )?;
                    Ok(())
                });
            }
            self.rbd_snapshot_protect(&object, "readonly")?;
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

impl Backend for CephBackend {
    fn kind(&self) -> DriverKind {
        DriverKind::Ceph
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
        tracing::info!(
            pool = %pool_name,
            cluster = %self.cluster_name,
            "Creating CEPH OSD storage pool"
        );

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

        let osd_pool_name = self
            .state
            .pool
            .config
            .get("ceph.osd.pool_name")
            .cloned()
            .unwrap_or_default();
        if !source.is_empty() && !osd_pool_name.is_empty() && source != osd_pool_name {
            return Err(StorageError::config(
                "the 'source' and 'ceph.osd.pool_name' properties must not differ for CEPH OSD storage pools",
            ));
        }

        // An explicit source names a pre-existing OSD pool to attach to.
        self.osd_pool_name = if !source.is_empty() {
            source
        } else if !osd_pool_name.is_empty() {
            osd_pool_name
        } else {
            pool_name.clone()
        };
        self.state.pool.config.insert(
            "ceph.osd.pool_name".to_string(),
            self.osd_pool_name.clone(),
        );
        self.state
            .pool
            .config
            .insert("source".to_string(), self.osd_pool_name.clone());

        let mut revert = Reverter::new();

        if !self.osd_pool_exists(&self.osd_pool_name) {
            tracing::debug!(osd_pool = %self.osd_pool_name, "CEPH OSD pool does not exist, creating");
            let osd_pool = self.osd_pool_name.clone();
            let pg_num = self.pg_num.clone();
            self.ceph(&["osd", "pool", "create", &osd_pool, &pg_num])?;
            {
                let cluster = self.cluster_name.clone();
                let user = self.client_name();
                let osd_pool = self.osd_pool_name.clone();
                revert.push("destroy OSD pool", move || {
                    run_command(
                        "ceph",
                        &[
                            "--name",
                            &user,
                            "--cluster",
                            &cluster,
                            "osd",
                            "pool",
                            "delete",
                            &osd_pool,
                            &osd_pool,
                            "--yes-i-really-really-mean-it",
                        ],
                    )?;
                    Ok(())
                });
            }
        } else {
            tracing::debug!(osd_pool = %self.osd_pool_name, "Reusing existing CEPH OSD pool");
            let osd_pool = self.osd_pool_name.clone();
            let out = self.ceph(&["osd", "pool", "get", &osd_pool, "pg_num"])?;
            match parse_pg_num(&out) {
                Some(pg_num) => {
                    self.pg_num = pg_num.clone();
                    self.state
                        .pool
                        .config
                        .insert("ceph.osd.pg_num".to_string(), pg_num);
                }
                None => {
                    tracing::error!(
                        osd_pool = %self.osd_pool_name,
                        output = %out,
                        "Failed to parse placement group count"
                    );
                }
            }
        }

        self.state
            .pool
            .config
            .entry("ceph.cluster_name".to_string())
            .or_insert_with(|| "ceph".to_string());
        self.state
            .pool
            .config
            .entry("ceph.osd.pg_num".to_string())
            .or_insert_with(|| "32".to_string());

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

        // A marker volume named after the pool lets other hosts detect that
        // this OSD pool is already driven by a daemon; its absence at create
        // time decides ownership.
        let marker = rbd_object(VolumeKind::Custom, &pool_name);
        if self.rbd_volume_exists(&marker) {
            self.state
                .pool
                .config
                .insert("volatile.pool.pristine".to_string(), "false".to_string());
        } else {
            self.state
                .pool
                .config
                .insert("volatile.pool.pristine".to_string(), "true".to_string());
            self.rbd_volume_create(&marker, "0")?;
        }

        tracing::info!(
            pool = %pool_name,
            cluster = %self.cluster_name,
            "Created CEPH OSD storage pool"
        );
        revert.success();
        Ok(())
    }

    fn pool_delete(&mut self) -> StorageResult<()> {
        let pool_name = self.pool_name().to_string();
        tracing::info!(
            pool = %pool_name,
            cluster = %self.cluster_name,
            "Deleting CEPH OSD storage pool"
        );

        if !self.osd_pool_exists(&self.osd_pool_name) {
            return Err(StorageError::not_found("CEPH OSD pool", &self.osd_pool_name));
        }

        // Only destroy the OSD pool when this host created it.
        if self.state.pool.config_bool("volatile.pool.pristine") {
            tracing::debug!(osd_pool = %self.osd_pool_name, "This host owns the OSD pool, destroying");
            let osd_pool = self.osd_pool_name.clone();
            self.osd_pool_destroy(&osd_pool)?;
        }

        let pool_mnt = self.state.paths.pool_mount_point(&pool_name);
        if pool_mnt.exists() {
            fs::remove_dir_all(&pool_mnt)?;
        }

        tracing::info!(
            pool = %pool_name,
            cluster = %self.cluster_name,
            "Deleted CEPH OSD storage pool"
        );
        Ok(())
    }

    fn pool_mount(&mut self) -> StorageResult<bool> {
        // OSD pools are not mounted.
        Ok(true)
    }

    fn pool_umount(&mut self) -> StorageResult<bool> {
        Ok(true)
    }

    fn pool_update(&mut self, _changed: &[String]) -> StorageResult<()> {
        Err(StorageError::Unsupported {
            feature: "changing OSD storage pool properties".to_string(),
        })
    }

    fn volume_create(&mut self) -> StorageResult<()> {
        let volume = self.state.volume()?.name.clone();
        tracing::debug!(pool = self.pool_name(), volume = %volume, "Creating RBD storage volume");

        let mut revert = Reverter::new();

        let object = rbd_object(VolumeKind::Custom, &volume);
        self.rbd_volume_create(&object, &self.rbd_size())?;
        {
            let object = object.clone();
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("delete RBD volume", move || {
                run_command(
                    "rbd",
                    &[
                        "--name", &user, "--cluster", &cluster, "--pool", &osd_pool, "rm", &object,
                    ],
                )?;
                Ok(())
            });
        }

        let dev = self.rbd_volume_map(&object)?;
        {
            let object = object.clone();
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("unmap RBD volume", move || {
                run_command(
                    "rbd",
                    &[
                        "--name", &user, "--cluster", &cluster, "--pool", &osd_pool, "unmap",
                        &object,
                    ],
                )?;
                Ok(())
            });
        }

        make_fs_type(&dev, &self.rbd_filesystem())?;

        let mnt = self.custom_mnt(&volume);
        fs::create_dir_all(&mnt)?;
        fs::set_permissions(&mnt, fs::Permissions::from_mode(0o711))?;

        tracing::debug!(pool = self.pool_name(), volume = %volume, "Created RBD storage volume");
        revert.success();
        Ok(())
    }

    fn volume_delete(&mut self) -> StorageResult<()> {
        let volume = self.state.volume()?.name.clone();
        tracing::debug!(pool = self.pool_name(), volume = %volume, "Deleting RBD storage volume");

        let mnt = self.custom_mnt(&volume);
        if is_mount_point(&mnt) {
            try_unmount(&mnt, UnmountFlags::DETACH)?;
        }

        let object = rbd_object(VolumeKind::Custom, &volume);
        self.rbd_volume_unmap(&object)?;
        self.rbd_volume_delete(&object)?;

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

        tracing::debug!(pool = self.pool_name(), volume = %volume, "Deleted RBD storage volume");
        Ok(())
    }

    fn volume_mount(&mut self) -> StorageResult<bool> {
        let volume = self.state.volume()?.name.clone();
        let mnt = self.custom_mnt(&volume);
        let object = rbd_object(VolumeKind::Custom, &volume);

        let id = LockId::custom_mount(self.pool_name(), &volume);
        let mut mount_result = Ok(());
        let outcome = OPERATIONS.run(&id, || {
            if is_mount_point(&mnt) {
                return Ok(false);
            }
            mount_result = self.mount_device(&object, &mnt);
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

    fn volume_update(&mut self, _changed: &[String]) -> StorageResult<()> {
        Err(StorageError::Unsupported {
            feature: "changing RBD storage volume properties".to_string(),
        })
    }

    fn container_create(&mut self, container: &dyn ContainerHandle) -> StorageResult<()> {
        let name = container.name().to_string();
        tracing::debug!(pool = self.pool_name(), container = %name, "Creating RBD container volume");

        let mut revert = Reverter::new();

        let object = rbd_object(VolumeKind::Container, &name);
        self.rbd_volume_create(&object, &self.rbd_size())?;
        {
            let object = object.clone();
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("delete RBD container volume", move || {
                run_command(
                    "rbd",
                    &[
                        "--name", &user, "--cluster", &cluster, "--pool", &osd_pool, "rm", &object,
                    ],
                )?;
                Ok(())
            });
        }

        let dev = self.rbd_volume_map(&object)?;
        {
            let object = object.clone();
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("unmap RBD container volume", move || {
                run_command(
                    "rbd",
                    &[
                        "--name", &user, "--cluster", &cluster, "--pool", &osd_pool, "unmap",
                        &object,
                    ],
                )?;
                Ok(())
            });
        }

        make_fs_type(&dev, &self.rbd_filesystem())?;

        let mnt = self.container_mnt(&name);
        layout::create_container_mount_point(&mnt, &container.path(), container.is_privileged())?;
        {
            let mnt = mnt.clone();
            let symlink = container.path();
            revert.push("remove container mount point", move || {
                layout::delete_container_mount_point(&mnt, &symlink, "")
            });
        }

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
            "Creating RBD container volume from image"
        );

        let lock = LockId::image_create(self.pool_name(), fingerprint);
        let image_object = rbd_object(VolumeKind::Image, fingerprint);
        let mut fill_result = Ok(());
        OPERATIONS.run(&lock, || {
            if !self.rbd_volume_exists(&image_object) {
                fill_result = self.image_create_locked(fingerprint);
            }
            Ok(())
        })?;
        fill_result?;

        let mut revert = Reverter::new();

        let container_object = rbd_object(VolumeKind::Container, &name);
        self.rbd_clone_create(&image_object, "readonly", &container_object)?;
        {
            let object = container_object.clone();
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("delete cloned container volume", move || {
                run_command(
                    "rbd",
                    &[
                        "--name", &user, "--cluster", &cluster, "--pool", &osd_pool, "rm", &object,
                    ],
                )?;
                Ok(())
            });
        }

        self.rbd_volume_map(&container_object)?;
        {
            let object = container_object.clone();
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("unmap cloned container volume", move || {
                run_command(
                    "rbd",
                    &[
                        "--name", &user, "--cluster", &cluster, "--pool", &osd_pool, "unmap",
                        &object,
                    ],
                )?;
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

        let our_mount = self.container_mount(container)?;

        let shift_and_template = (|| -> StorageResult<()> {
            if !container.is_privileged() {
                if let Some(idmap) = container.idmap()? {
                    idmap.shift_rootfs(&container.rootfs_path())?;
                    tracing::debug!(container = %name, "Shifted rootfs");
                }
                fs::set_permissions(&mnt, fs::Permissions::from_mode(0o755))?;
            } else {
                fs::set_permissions(&mnt, fs::Permissions::from_mode(0o700))?;
            }

            container.template_apply("create")
        })();

        if our_mount {
            let _ = self.container_umount(&name, &container.path());
        }
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
        tracing::debug!(pool = self.pool_name(), container = %name, "Deleting RBD container volume");

        self.container_umount(&name, &container.path())?;

        let object = rbd_object(VolumeKind::Container, &name);
        self.rbd_volume_unmap(&object)?;

        // A container cloned from by copies cannot be removed outright; keep
        // it as a zombie until the dependent clones disappear.
        if self.rbd_snapshot_purge(&object).is_err() || self.rbd_volume_delete(&object).is_err() {
            self.rbd_mark_deleted(VolumeKind::Container, &name)?;
            tracing::debug!(container = %name, "Marked RBD container volume as zombie");
        }

        let mnt = self.container_mnt(&name);
        layout::delete_container_mount_point(&mnt, &container.path(), "ceph")?;

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
            "Copying RBD container storage"
        );

        let snapshots = source.snapshots()?;

        let mut revert = Reverter::new();

        if container_only || snapshots.is_empty() {
            let clone_copy = self
                .state
                .pool
                .config
                .get("ceph.rbd.clone_copy")
                .map(|v| v != "false")
                .unwrap_or(true);
            if clone_copy {
                self.copy_without_snapshots_sparse(target, source)?;
            } else {
                self.copy_without_snapshots_full(target, source)?;
            }
        } else {
            let target_mnt = self.container_mnt(&target_name);
            layout::create_container_mount_point(&target_mnt, &target.path(), target.is_privileged())?;
            {
                let mnt = target_mnt.clone();
                let symlink = target.path();
                revert.push("remove container mount point", move || {
                    layout::delete_container_mount_point(&mnt, &symlink, "")
                });
            }

            // Receive into an empty volume, then chain the per-snapshot
            // incremental transfers onto it, oldest first.
            let target_object = rbd_object(VolumeKind::Container, &target_name);
            self.rbd_volume_create(&target_object, "0")?;
            {
                let object = target_object.clone();
                let cluster = self.cluster_name.clone();
                let user = self.client_name();
                let osd_pool = self.osd_pool_name.clone();
                revert.push("delete copied container volume", move || {
                    run_command(
                        "rbd",
                        &[
                            "--name", &user, "--cluster", &cluster, "--pool", &osd_pool, "rm",
                            &object,
                        ],
                    )?;
                    Ok(())
                });
            }

            let source_object = rbd_object(VolumeKind::Container, &source_name);
            let target_spec = format!("{}/{}", self.osd_pool_name, target_object);
            let mut prev_snap: Option<String> = None;
            for snapshot in &snapshots {
                let (_, snap_only) = split_snapshot_name(snapshot)?;
                let snap_object = format!("snapshot_{}", snap_only);
                let source_spec = format!(
                    "{}/{}@{}",
                    self.osd_pool_name, source_object, snap_object
                );
                self.copy_with_snapshots(&source_spec, &target_spec, prev_snap.as_deref())?;
                prev_snap = Some(snap_object);

                let new_snap_name = format!("{}/{}", target_name, snap_only);
                let snap_mnt = self.snapshot_mnt(&new_snap_name);
                let symlink_target = self.snapshot_mnt(&target_name);
                let snapshots_symlink = self.state.paths.snapshots_symlink(&target_name);
                layout::create_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;
            }

            // Finally ship the live state, referencing the newest snapshot.
            let source_spec = format!("{}/{}", self.osd_pool_name, source_object);
            self.copy_with_snapshots(&source_spec, &target_spec, prev_snap.as_deref())?;

            self.rbd_volume_map(&target_object)?;
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
        let mnt = self.container_mnt(&name);
        let object = rbd_object(VolumeKind::Container, &name);

        let id = LockId::container_mount(self.pool_name(), &name);
        let mut mount_result = Ok(());
        let outcome = OPERATIONS.run(&id, || {
            if is_mount_point(&mnt) {
                return Ok(false);
            }
            mount_result = self.mount_device(&object, &mnt);
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
            "Renaming RBD container volume"
        );

        self.container_umount(&old_name, &container.path())?;

        let mut revert = Reverter::new();

        let old_object = rbd_object(VolumeKind::Container, &old_name);
        let new_object = rbd_object(VolumeKind::Container, new_name);
        self.rbd_volume_unmap(&old_object)?;
        self.rbd_rename(&old_object, &new_object)?;
        {
            let (old_object, new_object) = (old_object.clone(), new_object.clone());
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("rename RBD volume back", move || {
                run_command(
                    "rbd",
                    &[
                        "--name",
                        &user,
                        "--cluster",
                        &cluster,
                        "--pool",
                        &osd_pool,
                        "mv",
                        &new_object,
                        &old_object,
                    ],
                )?;
                Ok(())
            });
        }
        self.rbd_volume_map(&new_object)?;

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
        let (_, snap_only) = split_snapshot_name(source.name())?;
        tracing::debug!(
            pool = self.pool_name(),
            container = target.name(),
            snapshot = snap_only,
            "Restoring RBD container volume"
        );

        // RBD rollback is atomic; intervening snapshots survive, but their
        // clones keep referencing the pre-rollback data per RBD semantics.
        let was_mounted = self.container_umount(target.name(), &target.path())?;

        let object = rbd_object(VolumeKind::Container, target.name());
        self.rbd(&[
            "snap",
            "rollback",
            &format!("{}@snapshot_{}", object, snap_only),
        ])?;

        if was_mounted {
            self.container_mount(target)?;
        }
        Ok(())
    }

    fn container_usage(&self, _container: &dyn ContainerHandle) -> StorageResult<u64> {
        Err(StorageError::Unsupported {
            feature: "RBD usage reporting".to_string(),
        })
    }

    fn container_storage_ready(&self, name: &str) -> bool {
        self.rbd_volume_exists(&rbd_object(VolumeKind::Container, name))
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
            "Creating RBD snapshot volume"
        );

        let mut revert = Reverter::new();

        let (_, snap_only) = split_snapshot_name(&target_name)?;
        let snap_object = format!("snapshot_{}", snap_only);
        let source_object = rbd_object(VolumeKind::Container, source.name());
        self.rbd_snapshot_create(&source_object, &snap_object)?;
        {
            let (source_object, snap_object) = (source_object.clone(), snap_object.clone());
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("delete RBD snapshot", move || {
                run_command(
                    "rbd",
                    &[
                        "--name",
                        &user,
                        "--cluster",
                        &cluster,
                        "--pool",
                        &osd_pool,
                        "snap",
                        "rm",
                        &format!("{}@{}", source_object, snap_object),
                    ],
                )?;
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
            "Creating empty RBD snapshot volume (noop)"
        );
        Ok(())
    }

    fn snapshot_delete(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<()> {
        let name = snapshot.name().to_string();
        tracing::debug!(pool = self.pool_name(), snapshot = %name, "Deleting RBD snapshot volume");

        let (parent, snap_only) = split_snapshot_name(&name)?;
        let parent_object = rbd_object(VolumeKind::Container, parent);
        let snap_object = format!("snapshot_{}", snap_only);

        let clones = self
            .rbd_snapshot_clones(&parent_object, &snap_object)
            .unwrap_or_default();
        if clones.is_empty() {
            self.rbd_snapshot_unprotect(&parent_object, &snap_object)?;
            self.rbd_snapshot_delete(&parent_object, &snap_object)?;
        } else {
            // Keep the data alive for the clones under a zombie name.
            self.rbd_snapshot_rename(
                &parent_object,
                &snap_object,
                &format!("zombie_{}", snap_object),
            )?;
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
        tracing::debug!(
            pool = self.pool_name(),
            snapshot = %old_name,
            new_name,
            "Renaming RBD snapshot volume"
        );

        let mut revert = Reverter::new();

        let (parent, old_snap_only) = split_snapshot_name(&old_name)?;
        let (_, new_snap_only) = split_snapshot_name(new_name)?;
        let parent_object = rbd_object(VolumeKind::Container, parent);
        let old_snap = format!("snapshot_{}", old_snap_only);
        let new_snap = format!("snapshot_{}", new_snap_only);
        self.rbd_snapshot_rename(&parent_object, &old_snap, &new_snap)?;
        {
            let (parent_object, old_snap, new_snap) =
                (parent_object.clone(), old_snap.clone(), new_snap.clone());
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("rename RBD snapshot back", move || {
                run_command(
                    "rbd",
                    &[
                        "--name",
                        &user,
                        "--cluster",
                        &cluster,
                        "--pool",
                        &osd_pool,
                        "snap",
                        "rename",
                        &format!("{}@{}", parent_object, new_snap),
                        &format!("{}@{}", parent_object, old_snap),
                    ],
                )?;
                Ok(())
            });
        }

        let old_mnt = self.snapshot_mnt(&old_name);
        let new_mnt = self.snapshot_mnt(new_name);
        fs::rename(&old_mnt, &new_mnt)?;

        revert.success();
        Ok(())
    }

    fn snapshot_start(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<bool> {
        let name = snapshot.name().to_string();
        tracing::debug!(pool = self.pool_name(), snapshot = %name, "Starting RBD snapshot volume");

        let mut revert = Reverter::new();

        let (parent, snap_only) = split_snapshot_name(&name)?;
        let parent_object = rbd_object(VolumeKind::Container, parent);
        let snap_object = format!("snapshot_{}", snap_only);

        // RBD cannot mount a raw snapshot writable; serve a transient clone.
        self.rbd_snapshot_protect(&parent_object, &snap_object)?;
        {
            let (parent_object, snap_object) = (parent_object.clone(), snap_object.clone());
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("unprotect RBD snapshot", move || {
                run_command(
                    "rbd",
                    &[
                        "--name",
                        &user,
                        "--cluster",
                        &cluster,
                        "--pool",
                        &osd_pool,
                        "snap",
                        "unprotect",
                        &format!("{}@{}", parent_object, snap_object),
                    ],
                )?;
                Ok(())
            });
        }

        let clone_object = start_clone_object(parent, snap_only);
        self.rbd_clone_create(&parent_object, &snap_object, &clone_object)?;
        {
            let clone_object = clone_object.clone();
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("delete transient snapshot clone", move || {
                run_command(
                    "rbd",
                    &[
                        "--name",
                        &user,
                        "--cluster",
                        &cluster,
                        "--pool",
                        &osd_pool,
                        "rm",
                        &clone_object,
                    ],
                )?;
                Ok(())
            });
        }

        let dev = self.rbd_volume_map(&clone_object)?;
        {
            let clone_object = clone_object.clone();
            let cluster = self.cluster_name.clone();
            let user = self.client_name();
            let osd_pool = self.osd_pool_name.clone();
            revert.push("unmap transient snapshot clone", move || {
                run_command(
                    "rbd",
                    &[
                        "--name",
                        &user,
                        "--cluster",
                        &cluster,
                        "--pool",
                        &osd_pool,
                        "unmap",
                        &clone_object,
                    ],
                )?;
                Ok(())
            });
        }

        let mnt = self.snapshot_mnt(&name);
        fs::create_dir_all(&mnt)?;
        let (flags, data) = resolve_mount_options(&self.rbd_mount_options());
        try_mount(&dev, &mnt, &self.rbd_filesystem(), flags, &data)?;

        revert.success();
        Ok(true)
    }

    fn snapshot_stop(&mut self, snapshot: &dyn ContainerHandle) -> StorageResult<bool> {
        let name = snapshot.name().to_string();
        tracing::debug!(pool = self.pool_name(), snapshot = %name, "Stopping RBD snapshot volume");

        let mnt = self.snapshot_mnt(&name);
        try_unmount(&mnt, UnmountFlags::DETACH)?;

        let (parent, snap_only) = split_snapshot_name(&name)?;
        let clone_object = start_clone_object(parent, snap_only);
        self.rbd_volume_unmap(&clone_object)?;
        self.rbd_volume_delete(&clone_object)?;

        Ok(true)
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
        tracing::debug!(pool = self.pool_name(), image = fingerprint, "Deleting RBD image volume");

        self.image_umount(fingerprint)?;

        let object = rbd_object(VolumeKind::Image, fingerprint);
        let clones = self
            .rbd_snapshot_clones(&object, "readonly")
            .unwrap_or_default();
        if clones.is_empty() {
            // Nothing depends on the image; really remove it.
            self.rbd_snapshot_unprotect(&object, "readonly")?;
            self.rbd_snapshot_purge(&object)?;
            self.rbd_volume_unmap(&object)?;
            self.rbd_volume_delete(&object)?;
        } else {
            // Live clones keep the data pinned; fail soft as a zombie.
            self.rbd_volume_unmap(&object)?;
            self.rbd_mark_deleted(VolumeKind::Image, fingerprint)?;
            tracing::debug!(image = fingerprint, "Marked RBD image volume as zombie");
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

        let object = rbd_object(VolumeKind::Image, fingerprint);
        self.mount_device(&object, &mnt)?;
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
        _kind: VolumeKind,
        _size: u64,
        _container: Option<&dyn ContainerHandle>,
    ) -> StorageResult<()> {
        Err(StorageError::QuotaUnsupported {
            driver: "ceph".to_string(),
        })
    }

    fn migration_type(&self) -> MigrationFsType {
        MigrationFsType::RbdExport
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

        Ok(Box::new(CephMigrationSource {
            cluster_name: self.cluster_name.clone(),
            client_name: self.client_name(),
            osd_pool_name: self.osd_pool_name.clone(),
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
        let object = rbd_object(VolumeKind::Container, &name);
        let spec = format!("{}/{}", self.osd_pool_name, object);

        for migration_object in &args.objects {
            if args.container_only && migration_object.snapshot.is_some() {
                continue;
            }

            let mut reader = stream.object_stream(migration_object)?;
            let verb = match &migration_object.snapshot {
                None => "import",
                Some(_) => "import-diff",
            };

            let client = self.client_name();
            let mut child = std::process::Command::new("rbd")
                .args([
                    "--name",
                    &client,
                    "--cluster",
                    &self.cluster_name,
                    verb,
                    "-",
                    &spec,
                ])
                .stdin(std::process::Stdio::piped())
                .spawn()
                .map_err(|e| StorageError::Transient {
                    command: format!("rbd {} - {}", verb, spec),
                    message: format!("failed to spawn: {}", e),
                })?;

            if let Some(mut stdin) = child.stdin.take() {
                std::io::copy(&mut reader, &mut stdin)?;
            }
            let status = child.wait()?;
            if !status.success() {
                return Err(StorageError::Transient {
                    command: format!("rbd {} - {}", verb, spec),
                    message: format!("exited with {}", status),
                });
            }

            if let Some(snap) = &migration_object.snapshot {
                let snap_name = format!("{}/{}", name, snap);
                let snap_mnt = self.snapshot_mnt(&snap_name);
                let symlink_target = self.snapshot_mnt(&name);
                let snapshots_symlink = self.state.paths.snapshots_symlink(&name);
                layout::create_snapshot_mount_point(&snap_mnt, &symlink_target, &snapshots_symlink)?;
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

/// Migration source shipping `rbd export` / `export-diff` streams.
struct CephMigrationSource {
    cluster_name: String,
    client_name: String,
    osd_pool_name: String,
    objects: Vec<MigrationObject>,
}

impl MigrationSource for CephMigrationSource {
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
        let rbd_name = rbd_object(VolumeKind::Container, &object.container);
        let (verb, spec) = match &object.snapshot {
            // The base ships first as a full export; snapshots follow as
            // incremental diffs the sink replays in order.
            None => (
                "export",
                format!("{}/{}", self.osd_pool_name, rbd_name),
            ),
            Some(snap) => (
                "export-diff",
                format!("{}/{}@snapshot_{}", self.osd_pool_name, rbd_name, snap),
            ),
        };

        let output = std::process::Command::new("rbd")
            .args([
                "--name",
                &self.client_name,
                "--cluster",
                &self.cluster_name,
                verb,
                &spec,
                "-",
            ])
            .output()
            .map_err(|e| StorageError::Transient {
                command: format!("rbd {} {} -", verb, spec),
                message: format!("failed to spawn: {}", e),
            })?;

        if !output.status.success() {
            return Err(StorageError::Transient {
                command: format!("rbd {} {} -", verb, spec),
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
    fn pg_num_parses_tool_output() {
        assert_eq!(parse_pg_num("pg_num: 32").as_deref(), Some("32"));
        assert_eq!(parse_pg_num("pg_num: 128\n").as_deref(), Some("128"));
        assert_eq!(parse_pg_num("size: 3"), None);
        assert_eq!(parse_pg_num("pg_num:"), None);
    }

    #[test]
    fn rbd_namespace_encoding() {
        assert_eq!(rbd_object(VolumeKind::Container, "c1"), "container_c1");
        assert_eq!(rbd_object(VolumeKind::Image, "abc"), "image_abc");
        assert_eq!(zombie_object(VolumeKind::Image, "abc"), "zombie_image_abc");
    }

    #[test]
    fn start_clone_name_matches_contract() {
        assert_eq!(start_clone_object("c1", "s1"), "c1_s1_start_clone");
    }
}
