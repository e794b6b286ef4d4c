//! The storage façade.
//!
//! Callers never construct backends directly; they go through [`Storage`],
//! which loads pool and volume records from the metadata store, initializes
//! the right driver, validates configuration, and keeps database rows and
//! on-disk state committed together. The attach path runs the idmap-shift
//! pipeline: a volume's on-disk ownership follows the idmap of the container
//! it is attached to, and `volatile.idmap.last`/`volatile.idmap.next` track
//! what is actually applied versus required.

use std::collections::BTreeMap;
use std::sync::Arc;

use apollo_common::{
    idmap::idmaps_equal, Idmap, StorageError, StoragePaths, StorageResult,
};

use crate::backend::{
    refresh_supported_drivers, DriverInfo, DriverKind, StorageBackend, Unpacker,
};
use crate::config::{apply_defaults, validate_pool_config, validate_pool_update};
use crate::container::{
    split_snapshot_name, validate_volume_name, ContainerHandle, ContainerLoader,
};
use crate::meta::{MetaStore, StoragePool, StorageVolume, VolumeKind};
use crate::migration::{BufferedMigration, MigrationSinkArgs};

/// Entry point of the storage subsystem.
pub struct Storage {
    paths: StoragePaths,
    store: Arc<dyn MetaStore>,
    unpacker: Arc<dyn Unpacker>,
    containers: Option<Arc<dyn ContainerLoader>>,
}

impl Storage {
    /// Create the façade and probe the drivers usable on this host.
    pub fn new(
        paths: StoragePaths,
        store: Arc<dyn MetaStore>,
        unpacker: Arc<dyn Unpacker>,
    ) -> Self {
        refresh_supported_drivers();
        Self {
            paths,
            store,
            unpacker,
            containers: None,
        }
    }

    /// Attach the daemon's container registry so the attach pipeline can
    /// compare the idmaps of containers sharing a custom volume.
    #[must_use]
    pub fn with_container_loader(mut self, loader: Arc<dyn ContainerLoader>) -> Self {
        self.containers = Some(loader);
        self
    }

    /// Drivers usable on this host, with tool versions.
    #[must_use]
    pub fn supported_drivers(&self) -> Vec<DriverInfo> {
        crate::backend::supported_drivers()
    }

    /// Initialize a backend for a pool, optionally loading a volume record.
    fn storage_init(
        &self,
        pool_name: &str,
        volume: Option<(&str, VolumeKind)>,
    ) -> StorageResult<StorageBackend> {
        let (pool_id, pool) = self.store.pool_get(pool_name)?;

        let volume = match volume {
            Some((name, kind)) => Some(self.store.volume_get(pool_id, name, kind)?.1),
            None => None,
        };

        StorageBackend::init(
            self.paths.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.unpacker),
            pool_id,
            pool,
            volume,
        )
    }

    /// Initialize a backend addressing only the pool.
    pub fn pool_init(&self, pool_name: &str) -> StorageResult<StorageBackend> {
        self.storage_init(pool_name, None)
    }

    /// Initialize a backend addressing a volume of the pool.
    pub fn volume_init(
        &self,
        pool_name: &str,
        volume_name: &str,
        kind: VolumeKind,
    ) -> StorageResult<StorageBackend> {
        self.storage_init(pool_name, Some((volume_name, kind)))
    }

    /// Initialize a backend for a container, resolving its pool.
    pub fn container_load_init(&self, container_name: &str) -> StorageResult<StorageBackend> {
        let pool_name = self.store.container_pool(container_name)?;
        self.volume_init(&pool_name, container_name, VolumeKind::Container)
    }

    /// Create a storage pool: validate config, create the database row, then
    /// the underlying store, and persist the config the driver stamped.
    pub fn pool_create(
        &self,
        name: &str,
        driver: DriverKind,
        description: &str,
        mut config: BTreeMap<String, String>,
    ) -> StorageResult<()> {
        tracing::info!(pool = name, driver = %driver, "Creating storage pool");
        validate_volume_name(name)?;
        validate_pool_config(driver, &config)?;
        apply_defaults(driver, &mut config);

        let pool = StoragePool {
            name: name.to_string(),
            driver,
            description: description.to_string(),
            config,
        };
        let pool_id = self.store.pool_create(&pool)?;

        let mut backend = match StorageBackend::init(
            self.paths.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.unpacker),
            pool_id,
            pool,
            None,
        ) {
            Ok(backend) => backend,
            Err(err) => {
                let _ = self.store.pool_delete(name);
                return Err(err);
            }
        };

        if let Err(err) = backend.ops_mut().pool_create() {
            tracing::error!(pool = name, error = %err, "Failed to create storage pool");
            let _ = self.store.pool_delete(name);
            return Err(err);
        }

        // The driver stamps volatile.* keys during create; persist them in
        // the same logical operation.
        self.store.pool_update(pool_id, backend.pool())?;
        refresh_supported_drivers();

        tracing::info!(pool = name, driver = %driver, "Created storage pool");
        Ok(())
    }

    /// Delete a storage pool. Refused while any volume remains.
    pub fn pool_delete(&self, name: &str) -> StorageResult<()> {
        tracing::info!(pool = name, "Deleting storage pool");

        let mut backend = self.pool_init(name)?;
        let volumes = self.store.volumes(backend.pool_id())?;
        if !volumes.is_empty() {
            return Err(StorageError::InUse {
                what: "storage pool".to_string(),
                name: name.to_string(),
                used_by: format!("{} storage volumes", volumes.len()),
            });
        }

        backend.ops_mut().pool_delete()?;
        self.store.pool_delete(name)?;
        refresh_supported_drivers();

        tracing::info!(pool = name, "Deleted storage pool");
        Ok(())
    }

    /// Update a pool's description and configuration.
    pub fn pool_update(
        &self,
        name: &str,
        description: &str,
        config: BTreeMap<String, String>,
    ) -> StorageResult<()> {
        let mut backend = self.pool_init(name)?;
        let changed = validate_pool_update(backend.kind(), &backend.pool().config, &config)?;
        if changed.is_empty() && description == backend.pool().description {
            return Ok(());
        }

        backend.ops_mut().pool_update(&changed)?;

        let state = backend.ops_mut().state_mut();
        state.pool.description = description.to_string();
        state.pool.config = config;
        self.store.pool_update(backend.pool_id(), backend.pool())?;

        tracing::info!(pool = name, ?changed, "Updated storage pool");
        Ok(())
    }

    /// Create a custom storage volume.
    pub fn volume_create(
        &self,
        pool_name: &str,
        volume_name: &str,
        config: BTreeMap<String, String>,
    ) -> StorageResult<()> {
        tracing::info!(pool = pool_name, volume = volume_name, "Creating storage volume");
        validate_volume_name(volume_name)?;

        let pool_id = self.store.pool_id(pool_name)?;
        let mut volume = StorageVolume::new(volume_name, VolumeKind::Custom);
        volume.config = config;
        self.store.volume_create(pool_id, &volume)?;

        let mut backend =
            match self.volume_init(pool_name, volume_name, VolumeKind::Custom) {
                Ok(backend) => backend,
                Err(err) => {
                    let _ = self
                        .store
                        .volume_delete(pool_id, volume_name, VolumeKind::Custom);
                    return Err(err);
                }
            };

        if let Err(err) = backend.ops_mut().volume_create() {
            tracing::error!(
                pool = pool_name,
                volume = volume_name,
                error = %err,
                "Failed to create storage volume"
            );
            let _ = self
                .store
                .volume_delete(pool_id, volume_name, VolumeKind::Custom);
            return Err(err);
        }

        tracing::info!(pool = pool_name, volume = volume_name, "Created storage volume");
        Ok(())
    }

    /// Delete a custom storage volume. Refused while containers use it.
    pub fn volume_delete(&self, pool_name: &str, volume_name: &str) -> StorageResult<()> {
        tracing::info!(pool = pool_name, volume = volume_name, "Deleting storage volume");

        let used_by = self
            .store
            .volume_used_by(volume_name, VolumeKind::Custom)?;
        if !used_by.is_empty() {
            return Err(StorageError::InUse {
                what: "storage volume".to_string(),
                name: volume_name.to_string(),
                used_by: used_by.join(", "),
            });
        }

        let mut backend = self.volume_init(pool_name, volume_name, VolumeKind::Custom)?;
        backend.ops_mut().volume_delete()?;

        tracing::info!(pool = pool_name, volume = volume_name, "Deleted storage volume");
        Ok(())
    }

    /// Initialize a volume's backend for attaching it to a container,
    /// shifting the on-disk tree when the container's idmap differs from the
    /// one last applied.
    pub fn volume_attach_init(
        &self,
        pool_name: &str,
        volume_name: &str,
        kind: VolumeKind,
        container: &dyn ContainerHandle,
    ) -> StorageResult<StorageBackend> {
        let mut backend = self.volume_init(pool_name, volume_name, kind)?;

        let volume_config = backend
            .volume()
            .expect("volume loaded by volume_init")
            .config
            .clone();

        // A failed shift leaves the tree half-shifted; refuse to touch it
        // again until an operator resolves it and clears the flag.
        if volume_config
            .get("volatile.idmap.dirty")
            .map(String::as_str)
            == Some("true")
        {
            return Err(StorageError::Fatal {
                object: volume_name.to_string(),
                message: "volume is half-shifted from a previously failed attach".to_string(),
            });
        }

        let last = match volume_config.get("volatile.idmap.last") {
            Some(raw) if !raw.is_empty() => Idmap::from_json(raw).map_err(|err| {
                tracing::error!(volume = volume_name, error = %err, "Failed to unmarshal last idmap");
                err
            })?,
            _ => None,
        };
        let next = container.idmap()?;

        {
            let state = backend.ops_mut().state_mut();
            let volume = state.volume_mut()?;
            volume
                .config
                .insert("volatile.idmap.next".to_string(), Idmap::to_json(next.as_ref())?);
        }

        if !idmaps_equal(last.as_ref(), next.as_ref()) {
            tracing::debug!(volume = volume_name, "Shifting storage volume");

            // Custom volumes may be attached to several containers; shifting
            // is only safe when every user agrees on the target idmap.
            if kind == VolumeKind::Custom {
                let used_by = self.store.volume_used_by(volume_name, kind)?;
                if used_by.len() == 1 && used_by[0] != container.name() {
                    return Err(StorageError::IdmapConflict {
                        volume: volume_name.to_string(),
                        container: used_by[0].clone(),
                    });
                }
                if used_by.len() > 1 {
                    for user in used_by.iter().filter(|u| *u != container.name()) {
                        let Some(loader) = &self.containers else {
                            return Err(StorageError::IdmapConflict {
                                volume: volume_name.to_string(),
                                container: user.clone(),
                            });
                        };
                        let Ok(other) = loader.load(user) else {
                            continue;
                        };
                        let other_idmap = other.idmap()?;
                        if !idmaps_equal(next.as_ref(), other_idmap.as_ref()) {
                            return Err(StorageError::IdmapConflict {
                                volume: volume_name.to_string(),
                                container: user.clone(),
                            });
                        }
                    }
                }
            }

            let remap_path = match kind {
                VolumeKind::Custom => self.paths.custom_mount_point(pool_name, volume_name),
                _ => self.paths.container_mount_point(pool_name, volume_name),
            };

            let our_mount = backend.ops_mut().volume_mount()?;

            let shift = (|| -> StorageResult<()> {
                if let Some(last) = &last {
                    last.unshift_rootfs(&remap_path).map_err(|err| {
                        tracing::error!(path = %remap_path.display(), error = %err, "Failed to unshift");
                        err
                    })?;
                    tracing::debug!(path = %remap_path.display(), "Unshifted");
                }
                if let Some(next) = &next {
                    next.shift_rootfs(&remap_path).map_err(|err| {
                        tracing::error!(path = %remap_path.display(), error = %err, "Failed to shift");
                        err
                    })?;
                    tracing::debug!(path = %remap_path.display(), "Shifted");
                }
                Ok(())
            })();

            if our_mount {
                if let Err(err) = backend.ops_mut().volume_umount() {
                    tracing::warn!(volume = volume_name, error = %err, "Failed to unmount storage volume");
                }
            }

            if let Err(err) = shift {
                // Record the half-shifted state before surfacing the error.
                let state = backend.ops_mut().state_mut();
                let pool_id = state.pool_id;
                let volume = state.volume_mut()?;
                volume
                    .config
                    .insert("volatile.idmap.dirty".to_string(), "true".to_string());
                let (description, config) = (volume.description.clone(), volume.config.clone());
                self.store
                    .volume_update(pool_id, volume_name, kind, &description, &config)?;
                return Err(err);
            }

            tracing::debug!(volume = volume_name, "Shifted storage volume");
        }

        // Invariant: after a successful attach, last == next.
        {
            let state = backend.ops_mut().state_mut();
            let pool_id = state.pool_id;
            let volume = state.volume_mut()?;
            volume
                .config
                .insert("volatile.idmap.last".to_string(), Idmap::to_json(next.as_ref())?);
            let (description, config) = (volume.description.clone(), volume.config.clone());
            self.store
                .volume_update(pool_id, volume_name, kind, &description, &config)?;
        }

        Ok(backend)
    }

    /// Create a container volume from a cached image.
    pub fn container_create_from_image(
        &self,
        pool_name: &str,
        container: &dyn ContainerHandle,
        fingerprint: &str,
    ) -> StorageResult<()> {
        validate_volume_name(container.name())?;

        let pool_id = self.store.pool_id(pool_name)?;
        self.store.volume_create(
            pool_id,
            &StorageVolume::new(container.name(), VolumeKind::Container),
        )?;

        let mut backend = self.pool_init(pool_name)?;
        if let Err(err) = backend
            .ops_mut()
            .container_create_from_image(container, fingerprint)
        {
            let _ = self
                .store
                .volume_delete(pool_id, container.name(), VolumeKind::Container);
            return Err(err);
        }
        Ok(())
    }

    /// Delete a container volume, its snapshots, and their records.
    pub fn container_delete(
        &self,
        pool_name: &str,
        container: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        let pool_id = self.store.pool_id(pool_name)?;
        let mut backend = self.pool_init(pool_name)?;

        for snapshot in container.snapshots()? {
            let _ = self
                .store
                .volume_delete(pool_id, &snapshot, VolumeKind::Snapshot);
        }

        backend.ops_mut().container_delete(container)?;
        if let Err(err) =
            self.store
                .volume_delete(pool_id, container.name(), VolumeKind::Container)
        {
            if !err.is_not_found() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Copy a container within one pool. Cross-pool copies are refused.
    pub fn container_copy(
        &self,
        pool_name: &str,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
        container_only: bool,
    ) -> StorageResult<()> {
        validate_volume_name(target.name())?;

        let source_pool = self.store.container_pool(source.name())?;
        if source_pool != pool_name {
            return Err(StorageError::CrossPoolCopy {
                source_pool,
                target_pool: pool_name.to_string(),
            });
        }

        let pool_id = self.store.pool_id(pool_name)?;
        self.store.volume_create(
            pool_id,
            &StorageVolume::new(target.name(), VolumeKind::Container),
        )?;

        let mut backend = self.pool_init(pool_name)?;
        if let Err(err) = backend
            .ops_mut()
            .container_copy(target, source, container_only)
        {
            let _ = self
                .store
                .volume_delete(pool_id, target.name(), VolumeKind::Container);
            return Err(err);
        }

        if !container_only {
            for snapshot in source.snapshots()? {
                let (_, snap_only) = split_snapshot_name(&snapshot)?;
                let new_name = format!("{}/{}", target.name(), snap_only);
                self.store
                    .volume_create(pool_id, &StorageVolume::new(&new_name, VolumeKind::Snapshot))?;
            }
        }
        Ok(())
    }

    /// Snapshot a container.
    pub fn snapshot_create(
        &self,
        pool_name: &str,
        target: &dyn ContainerHandle,
        source: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        let (parent, _) = split_snapshot_name(target.name())?;
        if parent != source.name() {
            return Err(StorageError::config(format!(
                "snapshot '{}' does not belong to container '{}'",
                target.name(),
                source.name()
            )));
        }

        let pool_id = self.store.pool_id(pool_name)?;
        self.store.volume_create(
            pool_id,
            &StorageVolume::new(target.name(), VolumeKind::Snapshot),
        )?;

        let mut backend = self.pool_init(pool_name)?;
        if let Err(err) = backend.ops_mut().snapshot_create(target, source) {
            let _ = self
                .store
                .volume_delete(pool_id, target.name(), VolumeKind::Snapshot);
            return Err(err);
        }
        Ok(())
    }

    /// Delete a snapshot.
    pub fn snapshot_delete(
        &self,
        pool_name: &str,
        snapshot: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        let pool_id = self.store.pool_id(pool_name)?;
        let mut backend = self.pool_init(pool_name)?;
        backend.ops_mut().snapshot_delete(snapshot)?;
        if let Err(err) =
            self.store
                .volume_delete(pool_id, snapshot.name(), VolumeKind::Snapshot)
        {
            if !err.is_not_found() {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Restore a container from one of its snapshots. Target and snapshot
    /// must share a parent.
    pub fn container_restore(
        &self,
        pool_name: &str,
        target: &dyn ContainerHandle,
        snapshot: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        let (parent, _) = split_snapshot_name(snapshot.name())?;
        if parent != target.name() {
            return Err(StorageError::config(format!(
                "snapshot '{}' does not belong to container '{}'",
                snapshot.name(),
                target.name()
            )));
        }

        let mut backend = self.pool_init(pool_name)?;
        backend.ops().container_can_restore(target, snapshot)?;
        backend.ops_mut().container_restore(target, snapshot)
    }

    /// Rename a container volume: the store object, the mount point, the
    /// stable symlink, the snapshots directory, and every metadata row.
    pub fn container_rename(
        &self,
        pool_name: &str,
        container: &dyn ContainerHandle,
        new_name: &str,
    ) -> StorageResult<()> {
        validate_volume_name(new_name)?;

        let pool_id = self.store.pool_id(pool_name)?;
        let mut backend = self.pool_init(pool_name)?;
        backend.ops_mut().container_rename(container, new_name)?;

        self.store
            .volume_rename(pool_id, container.name(), VolumeKind::Container, new_name)?;

        // Renaming a parent renames all its snapshots.
        for snapshot in container.snapshots()? {
            let (_, snap_only) = split_snapshot_name(&snapshot)?;
            let renamed = format!("{}/{}", new_name, snap_only);
            self.store
                .volume_rename(pool_id, &snapshot, VolumeKind::Snapshot, &renamed)?;
        }
        Ok(())
    }

    /// Move a container between hosts' pools through the migration pipeline.
    ///
    /// This drives a source driver into an in-memory stream and replays it
    /// into the sink driver; a network transport would sit between the two
    /// halves instead.
    pub fn migrate(
        &self,
        source_pool: &str,
        source: &dyn ContainerHandle,
        target_pool: &str,
        target: &dyn ContainerHandle,
        container_only: bool,
    ) -> StorageResult<()> {
        let source_backend = self.pool_init(source_pool)?;
        let mut migration_source = source_backend
            .ops()
            .migration_source(source, container_only)?;
        let source_idmap = source.idmap()?;

        let mut buffered = BufferedMigration::drain(migration_source.as_mut())?;
        let objects = buffered.objects();

        let pool_id = self.store.pool_id(target_pool)?;
        self.store.volume_create(
            pool_id,
            &StorageVolume::new(target.name(), VolumeKind::Container),
        )?;

        let mut sink_backend = self.pool_init(target_pool)?;
        let args = MigrationSinkArgs {
            live: false,
            container: target,
            objects: objects.clone(),
            source_idmap,
            container_only,
        };
        if let Err(err) = sink_backend.ops_mut().migration_sink(args, &mut buffered) {
            let _ = self
                .store
                .volume_delete(pool_id, target.name(), VolumeKind::Container);
            return Err(err);
        }

        for object in &objects {
            if let Some(snap) = &object.snapshot {
                if !container_only {
                    let name = format!("{}/{}", target.name(), snap);
                    self.store
                        .volume_create(pool_id, &StorageVolume::new(&name, VolumeKind::Snapshot))?;
                }
            }
        }
        Ok(())
    }
}
