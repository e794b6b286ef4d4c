//! No-op storage backend used by the test suite.

use std::path::Path;

use apollo_common::{StorageError, StorageResult};

use crate::backend::{Backend, BackendState, DriverKind};
use crate::container::ContainerHandle;
use crate::meta::VolumeKind;
use crate::migration::{
    MigrationFsType, MigrationObject, MigrationSinkArgs, MigrationSource, MigrationStream,
};

pub(super) fn probe() -> StorageResult<String> {
    Ok("1".to_string())
}

/// Backend that accepts every operation without touching disk.
pub struct MockBackend {
    state: BackendState,
}

impl MockBackend {
    pub(super) fn init(mut state: BackendState) -> StorageResult<Self> {
        state.version = probe()?;
        tracing::debug!(pool = %state.pool.name, "Initializing a MOCK driver");
        Ok(Self { state })
    }
}

impl Backend for MockBackend {
    fn kind(&self) -> DriverKind {
        DriverKind::Mock
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
        self.state
            .pool
            .config
            .insert("volatile.pool.pristine".to_string(), "true".to_string());
        Ok(())
    }

    fn pool_delete(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn pool_mount(&mut self) -> StorageResult<bool> {
        Ok(true)
    }

    fn pool_umount(&mut self) -> StorageResult<bool> {
        Ok(true)
    }

    fn pool_update(&mut self, _changed: &[String]) -> StorageResult<()> {
        Ok(())
    }

    fn volume_create(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn volume_delete(&mut self) -> StorageResult<()> {
        let volume = self.state.volume()?.name.clone();
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
        Ok(())
    }

    fn volume_mount(&mut self) -> StorageResult<bool> {
        Ok(true)
    }

    fn volume_umount(&mut self) -> StorageResult<bool> {
        Ok(true)
    }

    fn volume_update(&mut self, _changed: &[String]) -> StorageResult<()> {
        Ok(())
    }

    fn container_create(&mut self, _container: &dyn ContainerHandle) -> StorageResult<()> {
        Ok(())
    }

    fn container_create_from_image(
        &mut self,
        _container: &dyn ContainerHandle,
        _fingerprint: &str,
    ) -> StorageResult<()> {
        Ok(())
    }

    fn container_can_restore(
        &self,
        _target: &dyn ContainerHandle,
        _source: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        Ok(())
    }

    fn container_delete(&mut self, _container: &dyn ContainerHandle) -> StorageResult<()> {
        Ok(())
    }

    fn container_copy(
        &mut self,
        _target: &dyn ContainerHandle,
        _source: &dyn ContainerHandle,
        _container_only: bool,
    ) -> StorageResult<()> {
        Ok(())
    }

    fn container_mount(&mut self, _container: &dyn ContainerHandle) -> StorageResult<bool> {
        Ok(true)
    }

    fn container_umount(&mut self, _name: &str, _path: &Path) -> StorageResult<bool> {
        Ok(true)
    }

    fn container_rename(
        &mut self,
        _container: &dyn ContainerHandle,
        _new_name: &str,
    ) -> StorageResult<()> {
        Ok(())
    }

    fn container_restore(
        &mut self,
        _target: &dyn ContainerHandle,
        _source: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        Ok(())
    }

    fn container_usage(&self, _container: &dyn ContainerHandle) -> StorageResult<u64> {
        Ok(0)
    }

    fn container_storage_ready(&self, _name: &str) -> bool {
        true
    }

    fn snapshot_create(
        &mut self,
        _target: &dyn ContainerHandle,
        _source: &dyn ContainerHandle,
    ) -> StorageResult<()> {
        Ok(())
    }

    fn snapshot_create_empty(&mut self, _target: &dyn ContainerHandle) -> StorageResult<()> {
        Ok(())
    }

    fn snapshot_delete(&mut self, _snapshot: &dyn ContainerHandle) -> StorageResult<()> {
        Ok(())
    }

    fn snapshot_rename(
        &mut self,
        _snapshot: &dyn ContainerHandle,
        _new_name: &str,
    ) -> StorageResult<()> {
        Ok(())
    }

    fn snapshot_start(&mut self, _snapshot: &dyn ContainerHandle) -> StorageResult<bool> {
        Ok(true)
    }

    fn snapshot_stop(&mut self, _snapshot: &dyn ContainerHandle) -> StorageResult<bool> {
        Ok(true)
    }

    fn image_create(&mut self, _fingerprint: &str) -> StorageResult<()> {
        Ok(())
    }

    fn image_delete(&mut self, _fingerprint: &str) -> StorageResult<()> {
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
            driver: "mock".to_string(),
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
        _container_only: bool,
    ) -> StorageResult<Box<dyn MigrationSource>> {
        Ok(Box::new(MockMigrationSource {
            objects: vec![MigrationObject::base(container.name())],
        }))
    }

    fn migration_sink(
        &mut self,
        _args: MigrationSinkArgs<'_>,
        _stream: &mut dyn MigrationStream,
    ) -> StorageResult<()> {
        Ok(())
    }
}

struct MockMigrationSource {
    objects: Vec<MigrationObject>,
}

impl MigrationSource for MockMigrationSource {
    fn objects(&self) -> Vec<MigrationObject> {
        self.objects.clone()
    }

    fn preserves_inodes(&self) -> bool {
        false
    }

    fn send_object(
        &mut self,
        _object: &MigrationObject,
        _sink: &mut dyn std::io::Write,
    ) -> StorageResult<()> {
        Ok(())
    }
}
