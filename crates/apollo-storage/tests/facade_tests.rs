//! Façade-level tests: image-create coordination, the idmap attach
//! pipeline, and the migration round trip.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use apollo_common::idmap::{Idmap, IdmapEntry, IdmapKind};
use apollo_common::StorageError;
use apollo_storage::backend::DriverKind;
use apollo_storage::meta::{MetaStore, VolumeKind};
use common::{container, harness, snapshot};
use tempfile::tempdir;

const FINGERPRINT: &str = "abc123def456";

#[test]
fn parallel_creates_unpack_once() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();

    std::thread::scope(|scope| {
        for i in 0..10 {
            let storage = &h.storage;
            let paths = &h.paths;
            scope.spawn(move || {
                let c = container(paths, &format!("c{}", i));
                storage
                    .container_create_from_image("p1", &c, FINGERPRINT)
                    .unwrap();
            });
        }
    });

    // One unpack, ten distinct container volumes, all holding the content.
    assert_eq!(h.unpacker.calls.load(Ordering::SeqCst), 1);
    for i in 0..10 {
        let rootfs = h
            .paths
            .container_mount_point("p1", &format!("c{}", i))
            .join("rootfs");
        assert_eq!(fs_read(&rootfs.join("etc/hostname")), b"apollo\n");
    }
}

#[test]
fn attach_records_idmap_invariant() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    h.storage
        .volume_create("p1", "v1", BTreeMap::new())
        .unwrap();

    // Privileged container: no idmap, nothing to shift.
    let c1 = container(&h.paths, "c1");
    h.storage
        .volume_attach_init("p1", "v1", VolumeKind::Custom, &c1)
        .unwrap();

    let pool_id = h.store.pool_id("p1").unwrap();
    let (_, volume) = h.store.volume_get(pool_id, "v1", VolumeKind::Custom).unwrap();
    // Invariant: after a successful attach, last == next.
    assert_eq!(
        volume.config.get("volatile.idmap.last"),
        volume.config.get("volatile.idmap.next")
    );
    assert_eq!(volume.config.get("volatile.idmap.last").unwrap(), "[]");
}

#[test]
fn attach_conflict_when_other_user_disagrees() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    h.storage
        .volume_create("p1", "v1", BTreeMap::new())
        .unwrap();

    // The volume was last shifted for some other container's idmap.
    let shifted = Idmap::new(vec![IdmapEntry {
        kind: IdmapKind::Both,
        host_base: 100_000,
        ns_base: 0,
        length: 65_536,
    }]);
    let pool_id = h.store.pool_id("p1").unwrap();
    let (_, mut volume) = h.store.volume_get(pool_id, "v1", VolumeKind::Custom).unwrap();
    volume.config.insert(
        "volatile.idmap.last".to_string(),
        Idmap::to_json(Some(&shifted)).unwrap(),
    );
    h.store
        .volume_update(pool_id, "v1", VolumeKind::Custom, "", &volume.config)
        .unwrap();
    h.store.attachment_add("other", "v1", VolumeKind::Custom);

    // A privileged container now needs the volume unshifted, but another
    // container still uses it.
    let c1 = container(&h.paths, "c1");
    let err = h
        .storage
        .volume_attach_init("p1", "v1", VolumeKind::Custom, &c1)
        .unwrap_err();
    assert!(matches!(err, StorageError::IdmapConflict { .. }));
}

#[test]
fn attach_refused_while_volume_is_dirty() {
    let tmp = tempdir().unwrap();
    let h = harness(tmp.path());

    h.storage
        .pool_create("p1", DriverKind::Dir, "", BTreeMap::new())
        .unwrap();
    h.storage
        .volume_create("p1", "v1", BTreeMap::new())
        .unwrap();

    let pool_id = h.store.pool_id("p1").unwrap();
    let (_, mut volume) = h.store.volume_get(pool_id, "v1", VolumeKind::Custom).unwrap();
    volume
        .config
        .insert("volatile.idmap.dirty".to_string(), "true".to_string());
    h.store
        .volume_update(pool_id, "v1", VolumeKind::Custom, "", &volume.config)
        .unwrap();

    let c1 = container(&h.paths, "c1");
    let err = h
        .storage
        .volume_attach_init("p1", "v1", VolumeKind::Custom, &c1)
        .unwrap_err();
    assert!(matches!(err, StorageError::Fatal { .. }));
}

#[test]
fn migration_round_trip_preserves_snapshots() {
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
    for snap in ["s1", "s2"] {
        std::fs::write(rootfs.join("stamp"), snap).unwrap();
        let s = snapshot(&h.paths, "p1", &format!("c1/{}", snap));
        h.storage.snapshot_create("p1", &s, &c1).unwrap();
        c1.snapshot_names.push(format!("c1/{}", snap));
    }

    let c2 = container(&h.paths, "c2");
    h.storage.migrate("p1", &c1, "p1", &c2, false).unwrap();

    // Snapshot count, order and per-snapshot content survive the stream.
    let pool_id = h.store.pool_id("p1").unwrap();
    for snap in ["s1", "s2"] {
        let stamp = h
            .paths
            .snapshot_mount_point("p1", &format!("c2/{}", snap))
            .join("rootfs/stamp");
        assert_eq!(fs_read(&stamp), snap.as_bytes());
        assert!(h
            .store
            .volume_get(pool_id, &format!("c2/{}", snap), VolumeKind::Snapshot)
            .is_ok());
    }
    let live = h
        .paths
        .container_mount_point("p1", "c2")
        .join("rootfs/stamp");
    assert_eq!(fs_read(&live), b"s2");
}

#[test]
fn migration_container_only_skips_snapshots() {
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

    let c2 = container(&h.paths, "c2");
    h.storage.migrate("p1", &c1, "p1", &c2, true).unwrap();

    assert!(h
        .paths
        .container_mount_point("p1", "c2")
        .join("rootfs/etc/hostname")
        .exists());
    assert!(!h.paths.snapshot_mount_point("p1", "c2/s1").exists());
}

fn fs_read(path: &std::path::Path) -> Vec<u8> {
    std::fs::read(path).unwrap_or_else(|e| panic!("read {}: {}", path.display(), e))
}
