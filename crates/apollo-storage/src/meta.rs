//! The metadata store consumed by the storage core.
//!
//! The daemon's real persistence layer lives outside this crate; the core
//! only sees the [`MetaStore`] trait. [`JsonMetaStore`] is a JSON-file-backed
//! implementation for single-host deployments and tests. Every backend
//! operation that mutates on-disk state commits its metadata change in the
//! same call, so readers never observe disk and metadata disagreeing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use apollo_common::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::backend::DriverKind;

/// The type of a storage volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    /// A container's root filesystem.
    Container,
    /// A read-only snapshot of a container.
    Snapshot,
    /// A cached image the pool clones containers from.
    Image,
    /// An administrator-managed volume attachable to containers.
    Custom,
}

impl VolumeKind {
    /// The canonical name, also used as the on-store object prefix
    /// (`container_<name>`, `image_<fingerprint>`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Snapshot => "snapshot",
            Self::Image => "image",
            Self::Custom => "custom",
        }
    }
}

impl std::fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage pool record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePool {
    /// Pool name.
    pub name: String,
    /// The backend driver bound to this pool.
    pub driver: DriverKind,
    /// Free-form description.
    pub description: String,
    /// Driver-specific configuration, including `volatile.*` keys.
    pub config: BTreeMap<String, String>,
}

impl StoragePool {
    /// Read a boolean config key, defaulting to `false`.
    #[must_use]
    pub fn config_bool(&self, key: &str) -> bool {
        matches!(
            self.config.get(key).map(String::as_str),
            Some("true") | Some("1") | Some("yes") | Some("on")
        )
    }
}

/// A storage volume record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageVolume {
    /// Volume name, unique within (pool, kind).
    pub name: String,
    /// Volume type.
    pub kind: VolumeKind,
    /// Free-form description.
    pub description: String,
    /// Volume configuration, including the `volatile.idmap.*` keys.
    pub config: BTreeMap<String, String>,
    /// Creation time.
    pub created: DateTime<Utc>,
}

impl StorageVolume {
    /// A fresh volume record with empty config.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: VolumeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            config: BTreeMap::new(),
            created: Utc::now(),
        }
    }
}

/// Pool/volume CRUD and usage queries the core consumes.
pub trait MetaStore: Send + Sync {
    /// Look up a pool by name.
    fn pool_get(&self, name: &str) -> StorageResult<(i64, StoragePool)>;

    /// Look up a pool's id by name.
    fn pool_id(&self, name: &str) -> StorageResult<i64> {
        Ok(self.pool_get(name)?.0)
    }

    /// All pool names.
    fn pool_names(&self) -> StorageResult<Vec<String>>;

    /// Create a pool record; fails on name collision.
    fn pool_create(&self, pool: &StoragePool) -> StorageResult<i64>;

    /// Replace a pool record.
    fn pool_update(&self, id: i64, pool: &StoragePool) -> StorageResult<()>;

    /// Delete a pool record.
    fn pool_delete(&self, name: &str) -> StorageResult<()>;

    /// Look up a volume by (pool, name, kind).
    fn volume_get(
        &self,
        pool_id: i64,
        name: &str,
        kind: VolumeKind,
    ) -> StorageResult<(i64, StorageVolume)>;

    /// All volumes of a pool.
    fn volumes(&self, pool_id: i64) -> StorageResult<Vec<StorageVolume>>;

    /// Create a volume record; fails on (name, kind) collision.
    fn volume_create(&self, pool_id: i64, volume: &StorageVolume) -> StorageResult<i64>;

    /// Delete a volume record.
    fn volume_delete(&self, pool_id: i64, name: &str, kind: VolumeKind) -> StorageResult<()>;

    /// Update a volume's description and config.
    fn volume_update(
        &self,
        pool_id: i64,
        name: &str,
        kind: VolumeKind,
        description: &str,
        config: &BTreeMap<String, String>,
    ) -> StorageResult<()>;

    /// Rename a volume record.
    fn volume_rename(
        &self,
        pool_id: i64,
        name: &str,
        kind: VolumeKind,
        new_name: &str,
    ) -> StorageResult<()>;

    /// Names of containers currently using the given volume.
    fn volume_used_by(&self, volume: &str, kind: VolumeKind) -> StorageResult<Vec<String>>;

    /// The pool a container's root volume lives on.
    fn container_pool(&self, container: &str) -> StorageResult<String>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    next_id: i64,
    pools: Vec<PoolRow>,
    volumes: Vec<VolumeRow>,
    attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PoolRow {
    id: i64,
    pool: StoragePool,
}

#[derive(Debug, Serialize, Deserialize)]
struct VolumeRow {
    id: i64,
    pool_id: i64,
    volume: StorageVolume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Attachment {
    container: String,
    volume: String,
    kind: VolumeKind,
}

/// JSON-file-backed [`MetaStore`].
///
/// With no path the store is memory-only, which tests use.
pub struct JsonMetaStore {
    path: Option<PathBuf>,
    state: Mutex<State>,
}

impl JsonMetaStore {
    /// Create or load a store persisted at `path`.
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            State::default()
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Create an in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Convenience for handing the store to the façade.
    #[must_use]
    pub fn into_shared(self) -> Arc<dyn MetaStore> {
        Arc::new(self)
    }

    /// Record that `container` uses the custom volume `volume`.
    pub fn attachment_add(&self, container: &str, volume: &str, kind: VolumeKind) {
        let mut state = self.state.lock();
        let att = Attachment {
            container: container.to_string(),
            volume: volume.to_string(),
            kind,
        };
        if !state.attachments.contains(&att) {
            state.attachments.push(att);
        }
        let _ = self.save(&state);
    }

    /// Remove a usage record.
    pub fn attachment_remove(&self, container: &str, volume: &str, kind: VolumeKind) {
        let mut state = self.state.lock();
        state
            .attachments
            .retain(|a| !(a.container == container && a.volume == volume && a.kind == kind));
        let _ = self.save(&state);
    }

    fn save(&self, state: &State) -> StorageResult<()> {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let raw = serde_json::to_string_pretty(state)?;
            std::fs::write(path, raw)?;
        }
        Ok(())
    }
}

impl MetaStore for JsonMetaStore {
    fn pool_get(&self, name: &str) -> StorageResult<(i64, StoragePool)> {
        let state = self.state.lock();
        state
            .pools
            .iter()
            .find(|r| r.pool.name == name)
            .map(|r| (r.id, r.pool.clone()))
            .ok_or_else(|| StorageError::not_found("storage pool", name))
    }

    fn pool_names(&self) -> StorageResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state.pools.iter().map(|r| r.pool.name.clone()).collect())
    }

    fn pool_create(&self, pool: &StoragePool) -> StorageResult<i64> {
        let mut state = self.state.lock();
        if state.pools.iter().any(|r| r.pool.name == pool.name) {
            return Err(StorageError::already_exists("storage pool", &pool.name));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.pools.push(PoolRow {
            id,
            pool: pool.clone(),
        });
        self.save(&state)?;
        Ok(id)
    }

    fn pool_update(&self, id: i64, pool: &StoragePool) -> StorageResult<()> {
        let mut state = self.state.lock();
        let row = state
            .pools
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StorageError::not_found("storage pool", pool.name.clone()))?;
        row.pool = pool.clone();
        self.save(&state)
    }

    fn pool_delete(&self, name: &str) -> StorageResult<()> {
        let mut state = self.state.lock();
        let Some(idx) = state.pools.iter().position(|r| r.pool.name == name) else {
            return Err(StorageError::not_found("storage pool", name));
        };
        let id = state.pools[idx].id;
        if state.volumes.iter().any(|v| v.pool_id == id) {
            return Err(StorageError::InUse {
                what: "storage pool".to_string(),
                name: name.to_string(),
                used_by: "storage volumes".to_string(),
            });
        }
        state.pools.remove(idx);
        self.save(&state)
    }

    fn volume_get(
        &self,
        pool_id: i64,
        name: &str,
        kind: VolumeKind,
    ) -> StorageResult<(i64, StorageVolume)> {
        let state = self.state.lock();
        state
            .volumes
            .iter()
            .find(|r| r.pool_id == pool_id && r.volume.name == name && r.volume.kind == kind)
            .map(|r| (r.id, r.volume.clone()))
            .ok_or_else(|| StorageError::not_found("storage volume", name))
    }

    fn volumes(&self, pool_id: i64) -> StorageResult<Vec<StorageVolume>> {
        let state = self.state.lock();
        Ok(state
            .volumes
            .iter()
            .filter(|r| r.pool_id == pool_id)
            .map(|r| r.volume.clone())
            .collect())
    }

    fn volume_create(&self, pool_id: i64, volume: &StorageVolume) -> StorageResult<i64> {
        let mut state = self.state.lock();
        if state
            .volumes
            .iter()
            .any(|r| r.pool_id == pool_id && r.volume.name == volume.name && r.volume.kind == volume.kind)
        {
            return Err(StorageError::already_exists("storage volume", &volume.name));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.volumes.push(VolumeRow {
            id,
            pool_id,
            volume: volume.clone(),
        });
        self.save(&state)?;
        Ok(id)
    }

    fn volume_delete(&self, pool_id: i64, name: &str, kind: VolumeKind) -> StorageResult<()> {
        let mut state = self.state.lock();
        let before = state.volumes.len();
        state
            .volumes
            .retain(|r| !(r.pool_id == pool_id && r.volume.name == name && r.volume.kind == kind));
        if state.volumes.len() == before {
            return Err(StorageError::not_found("storage volume", name));
        }
        self.save(&state)
    }

    fn volume_update(
        &self,
        pool_id: i64,
        name: &str,
        kind: VolumeKind,
        description: &str,
        config: &BTreeMap<String, String>,
    ) -> StorageResult<()> {
        let mut state = self.state.lock();
        let row = state
            .volumes
            .iter_mut()
            .find(|r| r.pool_id == pool_id && r.volume.name == name && r.volume.kind == kind)
            .ok_or_else(|| StorageError::not_found("storage volume", name))?;
        row.volume.description = description.to_string();
        row.volume.config = config.clone();
        self.save(&state)
    }

    fn volume_rename(
        &self,
        pool_id: i64,
        name: &str,
        kind: VolumeKind,
        new_name: &str,
    ) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state
            .volumes
            .iter()
            .any(|r| r.pool_id == pool_id && r.volume.name == new_name && r.volume.kind == kind)
        {
            return Err(StorageError::already_exists("storage volume", new_name));
        }
        let row = state
            .volumes
            .iter_mut()
            .find(|r| r.pool_id == pool_id && r.volume.name == name && r.volume.kind == kind)
            .ok_or_else(|| StorageError::not_found("storage volume", name))?;
        row.volume.name = new_name.to_string();
        self.save(&state)
    }

    fn volume_used_by(&self, volume: &str, kind: VolumeKind) -> StorageResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .attachments
            .iter()
            .filter(|a| a.volume == volume && a.kind == kind)
            .map(|a| a.container.clone())
            .collect())
    }

    fn container_pool(&self, container: &str) -> StorageResult<String> {
        let state = self.state.lock();
        for row in &state.volumes {
            if row.volume.kind == VolumeKind::Container && row.volume.name == container {
                if let Some(pool) = state.pools.iter().find(|p| p.id == row.pool_id) {
                    return Ok(pool.pool.name.clone());
                }
            }
        }
        Err(StorageError::not_found("container", container))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str) -> StoragePool {
        StoragePool {
            name: name.to_string(),
            driver: DriverKind::Dir,
            description: String::new(),
            config: BTreeMap::new(),
        }
    }

    #[test]
    fn pool_round_trip() {
        let store = JsonMetaStore::in_memory();
        let id = store.pool_create(&pool("p1")).unwrap();
        assert_eq!(store.pool_id("p1").unwrap(), id);
        assert!(matches!(
            store.pool_create(&pool("p1")),
            Err(StorageError::AlreadyExists { .. })
        ));
        store.pool_delete("p1").unwrap();
        assert!(store.pool_get("p1").is_err());
    }

    #[test]
    fn pool_delete_refused_while_volumes_exist() {
        let store = JsonMetaStore::in_memory();
        let id = store.pool_create(&pool("p1")).unwrap();
        store
            .volume_create(id, &StorageVolume::new("c1", VolumeKind::Container))
            .unwrap();
        assert!(matches!(
            store.pool_delete("p1"),
            Err(StorageError::InUse { .. })
        ));
        store.volume_delete(id, "c1", VolumeKind::Container).unwrap();
        store.pool_delete("p1").unwrap();
    }

    #[test]
    fn volume_names_unique_per_kind() {
        let store = JsonMetaStore::in_memory();
        let id = store.pool_create(&pool("p1")).unwrap();
        store
            .volume_create(id, &StorageVolume::new("x", VolumeKind::Container))
            .unwrap();
        // Same name, different kind, is fine.
        store
            .volume_create(id, &StorageVolume::new("x", VolumeKind::Custom))
            .unwrap();
        assert!(store
            .volume_create(id, &StorageVolume::new("x", VolumeKind::Container))
            .is_err());
    }

    #[test]
    fn attachments_drive_used_by() {
        let store = JsonMetaStore::in_memory();
        store.attachment_add("c1", "v1", VolumeKind::Custom);
        store.attachment_add("c2", "v1", VolumeKind::Custom);
        store.attachment_add("c1", "v1", VolumeKind::Custom);

        let mut users = store.volume_used_by("v1", VolumeKind::Custom).unwrap();
        users.sort();
        assert_eq!(users, vec!["c1", "c2"]);

        store.attachment_remove("c1", "v1", VolumeKind::Custom);
        assert_eq!(
            store.volume_used_by("v1", VolumeKind::Custom).unwrap(),
            vec!["c2"]
        );
    }

    #[test]
    fn persists_to_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("meta.json");
        {
            let store = JsonMetaStore::open(&path).unwrap();
            store.pool_create(&pool("p1")).unwrap();
        }
        let store = JsonMetaStore::open(&path).unwrap();
        assert!(store.pool_get("p1").is_ok());
    }

    #[test]
    fn container_pool_resolves_through_volume_row() {
        let store = JsonMetaStore::in_memory();
        let id = store.pool_create(&pool("p1")).unwrap();
        store
            .volume_create(id, &StorageVolume::new("c1", VolumeKind::Container))
            .unwrap();
        assert_eq!(store.container_pool("c1").unwrap(), "p1");
        assert!(store.container_pool("nope").is_err());
    }
}
