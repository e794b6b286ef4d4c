//! Integration tests for the dir backend through the storage façade.

mod common;

use std::collections::BTreeMap;
use std::fs;

use apollo_common::StorageError;
use apollo_storage::backend::DriverKind;
use apollo_storage::meta::{MetaStore, VolumeKind};
use common::{container, harness, snapshot};
use tempfile::tempdir;

const FINGERPRINT: &str = "abc123def456";

#[test]
fn create_container_from_image_populates_rootfs_and_symlink() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();

    let c1 = container(&h.paths, "c1");
    h.storage
        .container_create_from_image("p1", &c1, FINGERPRINT)
        .unwrap();

    // The image contents land under the container's rootfs.
    let rootfs = h.paths.container_mount_point("p1", "c1").join("rootfs");
    assert_eq!(
        fs::read(rootfs.join("etc/hostname")).unwrap(),
        b"apollo\n"
    );

    // The stable symlink points at the backend mount point.
    let symlink = h.paths.container_symlink("c1");
    assert_eq!(
        fs::read_link(&symlink).unwrap(),
        h.paths.container_mount_point("p1", "c1")
    );

    // The create template ran, and metadata rows exist for both the
    // container volume and the cached image.
    assert_eq!(*c1.triggers.lock().unwrap(), vec!["create"]);
    let pool_id = h.store.pool_id("p1").unwrap();
    assert!(h.store.volume_get(pool_id, "c1", VolumeKind::Container).is_ok());
    assert!(h
        .store
        .volume_get(pool_id, FINGERPRINT, VolumeKind::Image)
        .is_ok());
}

#[test]
fn second_create_reuses_cached_image() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();

    let c1 = container(&h.paths, "c1");
    let c2 = container(&h.paths, "c2");
    h.storage
        .container_create_from_image("p1", &c1, FINGERPRINT)
        .unwrap();
    h.storage
        .container_create_from_image("p1", &c2, FINGERPRINT)
        .unwrap();

    assert_eq!(h.unpacker.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn snapshot_then_restore_recovers_content() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    let c1 = container(&h.paths, "c1");
    h.storage
        .container_create_from_image("p1", &c1, FINGERPRINT)
        .unwrap();

    let marker = h
        .paths
        .container_mount_point("p1", "c1")
        .join("rootfs/etc/hostname");
    let original = fs::read(&marker).unwrap();

    let s1 = snapshot(&h.paths, "p1", "c1/s1");
    h.storage.snapshot_create("p1", &s1, &c1).unwrap();

    // The snapshot tree exists and the snapshots symlink is in place.
    assert!(h
        .paths
        .snapshot_mount_point("p1", "c1/s1")
        .join("rootfs/etc/hostname")
        .exists());
    assert!(h.paths.snapshots_symlink("c1").symlink_metadata().is_ok());

    fs::write(&marker, b"tampered\n").unwrap();
    h.storage.container_restore("p1", &c1, &s1).unwrap();

    assert_eq!(fs::read(&marker).unwrap(), original);
}

#[test]
fn restore_rejects_foreign_snapshot() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    let c1 = container(&h.paths, "c1");
    h.storage
        .container_create_from_image("p1", &c1, FINGERPRINT)
        .unwrap();

    let foreign = snapshot(&h.paths, "p1", "c9/s1");
    assert!(h.storage.container_restore("p1", &c1, &foreign).is_err());
}

#[test]
fn snapshot_delete_returns_parent_to_prior_state() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    let c1 = container(&h.paths, "c1");
    h.storage
        .container_create_from_image("p1", &c1, FINGERPRINT)
        .unwrap();

    let rootfs = h.paths.container_mount_point("p1", "c1").join("rootfs");
    let before: Vec<_> = walk_files(&rootfs);

    let s1 = snapshot(&h.paths, "p1", "c1/s1");
    h.storage.snapshot_create("p1", &s1, &c1).unwrap();
    h.storage.snapshot_delete("p1", &s1).unwrap();

    // Parent is untouched, the snapshot tree and symlink are gone.
    assert_eq!(walk_files(&rootfs), before);
    assert!(!h.paths.snapshot_mount_point("p1", "c1/s1").exists());
    assert!(h.paths.snapshots_symlink("c1").symlink_metadata().is_err());

    let pool_id = h.store.pool_id("p1").unwrap();
    assert!(h
        .store
        .volume_get(pool_id, "c1/s1", VolumeKind::Snapshot)
        .is_err());
}

#[test]
fn copy_with_snapshots_preserves_order_and_content() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    let mut c1 = container(&h.paths, "c1");
    h.storage
        .container_create_from_image("p1", &c1, FINGERPRINT)
        .unwrap();

    let rootfs = h.paths.container_mount_point("p1", "c1").join("rootfs");
    for snap in ["s1", "s2", "s3"] {
        fs::write(rootfs.join("stamp"), snap).unwrap();
        let s = snapshot(&h.paths, "p1", &format!("c1/{}", snap));
        h.storage.snapshot_create("p1", &s, &c1).unwrap();
        c1.snapshot_names.push(format!("c1/{}", snap));
    }

    let c2 = container(&h.paths, "c2");
    h.storage.container_copy("p1", &c2, &c1, false).unwrap();

    // Each copied snapshot carries the content of its counterpart.
    for snap in ["s1", "s2", "s3"] {
        let stamp = h
            .paths
            .snapshot_mount_point("p1", &format!("c2/{}", snap))
            .join("rootfs/stamp");
        assert_eq!(fs::read(&stamp).unwrap(), snap.as_bytes());
    }

    // The live state matches, and the copy template ran.
    let copied = h
        .paths
        .container_mount_point("p1", "c2")
        .join("rootfs/stamp");
    assert_eq!(fs::read(&copied).unwrap(), b"s3");
    assert_eq!(*c2.triggers.lock().unwrap(), vec!["copy"]);

    let pool_id = h.store.pool_id("p1").unwrap();
    for snap in ["s1", "s2", "s3"] {
        assert!(h
            .store
            .volume_get(pool_id, &format!("c2/{}", snap), VolumeKind::Snapshot)
            .is_ok());
    }
}

#[test]
fn cross_pool_copy_is_refused() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    h.storage
        .pool_create("p2", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    let c1 = container(&h.paths, "c1");
    h.storage
        .container_create_from_image("p1", &c1, FINGERPRINT)
        .unwrap();

    let c2 = container(&h.paths, "c2");
    let err = h.storage.container_copy("p2", &c2, &c1, true).unwrap_err();
    assert!(matches!(err, StorageError::CrossPoolCopy { .. }));
}

#[test]
fn rename_round_trip_is_lossless() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    let mut c1 = container(&h.paths, "c1");
    h.storage
        .container_create_from_image("p1", &c1, FINGERPRINT)
        .unwrap();
    let s1 = snapshot(&h.paths, "p1", "c1/s1");
    h.storage.snapshot_create("p1", &s1, &c1).unwrap();
    c1.snapshot_names.push("c1/s1".to_string());

    let rootfs = h.paths.container_mount_point("p1", "c1").join("rootfs");
    let before = walk_files(&rootfs);

    h.storage.container_rename("p1", &c1, "c9").unwrap();

    let mut c9 = container(&h.paths, "c9");
    c9.snapshot_names.push("c9/s1".to_string());
    assert!(h.paths.container_mount_point("p1", "c9").exists());
    assert!(!h.paths.container_mount_point("p1", "c1").exists());
    assert!(h.paths.snapshot_mount_point("p1", "c9/s1").exists());

    h.storage.container_rename("p1", &c9, "c1").unwrap();

    assert_eq!(walk_files(&rootfs), before);
    assert_eq!(
        fs::read_link(h.paths.container_symlink("c1")).unwrap(),
        h.paths.container_mount_point("p1", "c1")
    );
    assert!(h.paths.snapshot_mount_point("p1", "c1/s1").exists());

    let pool_id = h.store.pool_id("p1").unwrap();
    assert!(h.store.volume_get(pool_id, "c1", VolumeKind::Container).is_ok());
    assert!(h
        .store
        .volume_get(pool_id, "c1/s1", VolumeKind::Snapshot)
        .is_ok());
}

#[test]
fn container_delete_removes_everything() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    let mut c1 = container(&h.paths, "c1");
    h.storage
        .container_create_from_image("p1", &c1, FINGERPRINT)
        .unwrap();
    let s1 = snapshot(&h.paths, "p1", "c1/s1");
    h.storage.snapshot_create("p1", &s1, &c1).unwrap();
    c1.snapshot_names.push("c1/s1".to_string());

    h.storage.container_delete("p1", &c1).unwrap();

    assert!(!h.paths.container_mount_point("p1", "c1").exists());
    assert!(h.paths.container_symlink("c1").symlink_metadata().is_err());
    assert!(!h.paths.snapshot_mount_point("p1", "c1").exists());

    let pool_id = h.store.pool_id("p1").unwrap();
    assert!(h
        .store
        .volume_get(pool_id, "c1", VolumeKind::Container)
        .is_err());
    assert!(h
        .store
        .volume_get(pool_id, "c1/s1", VolumeKind::Snapshot)
        .is_err());
}

#[test]
fn pool_delete_refused_until_empty() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    let c1 = container(&h.paths, "c1");
    h.storage
        .container_create_from_image("p1", &c1, FINGERPRINT)
        .unwrap();

    assert!(matches!(
        h.storage.pool_delete("p1"),
        Err(StorageError::InUse { .. })
    ));

    h.storage.container_delete("p1", &c1).unwrap();
    let mut backend = h.storage.pool_init("p1").unwrap();
    backend.ops_mut().image_delete(FINGERPRINT).unwrap();

    h.storage.pool_delete("p1").unwrap();
    assert!(!h.paths.pool_mount_point("p1").exists());
}

#[test]
fn custom_volume_lifecycle() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    h.storage
        .volume_create("p1", "v1", BTreeMap::new())
        .unwrap();
    assert!(h.paths.custom_mount_point("p1", "v1").is_dir());

    // A second create collides.
    assert!(h.storage.volume_create("p1", "v1", BTreeMap::new()).is_err());

    // Delete refused while a container uses the volume.
    h.store.attachment_add("c1", "v1", VolumeKind::Custom);
    assert!(matches!(
        h.storage.volume_delete("p1", "v1"),
        Err(StorageError::InUse { .. })
    ));

    h.store.attachment_remove("c1", "v1", VolumeKind::Custom);
    h.storage.volume_delete("p1", "v1").unwrap();
    assert!(!h.paths.custom_mount_point("p1", "v1").exists());
}

#[test]
fn quota_is_rejected_on_dir() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    let c1 = container(&h.paths, "c1");
    h.storage
        .container_create_from_image("p1", &c1, FINGERPRINT)
        .unwrap();

    let mut backend = h.storage.pool_init("p1").unwrap();
    let err = backend
        .ops_mut()
        .set_quota(VolumeKind::Container, 1 << 30, Some(&c1))
        .unwrap_err();
    assert!(matches!(err, StorageError::QuotaUnsupported { .. }));
}

#[test]
fn unknown_config_key_rejected_at_create() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    let mut config = BTreeMap::new();
    config.insert("ceph.osd.pg_num".to_string(), "64".to_string());
    let err = h
        .storage
        .pool_create("p1", DriverKind::Dir, "", config)
        .unwrap_err();
    assert!(matches!(err, StorageError::Config { .. }));
    assert!(h.store.pool_get("p1").is_err());
}

fn walk_files(root: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .into_owned();
            files.push((rel, fs::read(entry.path()).unwrap()));
        }
    }
    files
}
