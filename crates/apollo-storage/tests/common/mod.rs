//! Shared fixtures for the storage integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use apollo_common::{Idmap, StoragePaths, StorageResult};
use apollo_storage::backend::{DriverKind, Unpacker};
use apollo_storage::container::ContainerHandle;
use apollo_storage::facade::Storage;
use apollo_storage::meta::JsonMetaStore;

/// In-memory container handle backed by the test's temp directory.
pub struct TestContainer {
    pub name: String,
    pub path: PathBuf,
    pub privileged: bool,
    pub idmap: Option<Idmap>,
    pub snapshot_names: Vec<String>,
    pub config: Mutex<BTreeMap<String, String>>,
    pub triggers: Mutex<Vec<String>>,
}

impl TestContainer {
    pub fn new(name: &str, path: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            path,
            privileged: true,
            idmap: None,
            snapshot_names: Vec::new(),
            config: Mutex::new(BTreeMap::new()),
            triggers: Mutex::new(Vec::new()),
        }
    }
}

impl ContainerHandle for TestContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn idmap(&self) -> StorageResult<Option<Idmap>> {
        Ok(self.idmap.clone())
    }

    fn config_set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.config
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn template_apply(&self, trigger: &str) -> StorageResult<()> {
        self.triggers.lock().unwrap().push(trigger.to_string());
        Ok(())
    }

    fn snapshots(&self) -> StorageResult<Vec<String>> {
        Ok(self.snapshot_names.clone())
    }
}

/// Unpacker writing a small fixed rootfs and counting its invocations.
pub struct TestUnpacker {
    pub calls: AtomicU32,
}

impl TestUnpacker {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

impl Unpacker for TestUnpacker {
    fn unpack(&self, _image_path: &Path, target: &Path, _driver: DriverKind) -> StorageResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(target.join("rootfs/etc"))?;
        std::fs::write(target.join("rootfs/etc/hostname"), b"apollo\n")?;
        std::fs::write(target.join("rootfs/os-release"), b"Apollo Test Image\n")?;
        std::fs::write(target.join("metadata.yaml"), b"architecture: x86_64\n")?;
        Ok(())
    }
}

/// A façade over a fresh temp var directory plus its collaborators.
pub struct Harness {
    pub storage: Storage,
    pub paths: StoragePaths,
    pub store: Arc<JsonMetaStore>,
    pub unpacker: Arc<TestUnpacker>,
}

pub fn harness(root: &Path) -> Harness {
    let paths = StoragePaths::with_root(root);
    let store = Arc::new(JsonMetaStore::in_memory());
    let unpacker = Arc::new(TestUnpacker::new());
    let store_handle: Arc<dyn apollo_storage::meta::MetaStore> = store.clone() as Arc<dyn apollo_storage::meta::MetaStore>;
    let unpacker_handle: Arc<dyn Unpacker> = unpacker.clone() as Arc<dyn Unpacker>;
    let storage = Storage::new(paths.clone(), store_handle, unpacker_handle);
    Harness {
        storage,
        paths,
        store,
        unpacker,
    }
}

/// A container handle living at the stable symlink location.
pub fn container(paths: &StoragePaths, name: &str) -> TestContainer {
    TestContainer::new(name, paths.container_symlink(name))
}

/// A snapshot handle living at its mount point.
pub fn snapshot(paths: &StoragePaths, pool: &str, name: &str) -> TestContainer {
    TestContainer::new(name, paths.snapshot_mount_point(pool, name))
}
