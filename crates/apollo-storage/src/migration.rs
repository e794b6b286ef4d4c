//! Cross-host migration plumbing.
//!
//! Transport is out of scope; the core produces and consumes byte streams.
//! A [`MigrationSource`] exposes the ordered list of objects to ship (the
//! base container first, then snapshots oldest first, so incremental sends
//! can reference a parent) and writes each object's stream lazily. The sink
//! side receives one stream per object through a [`MigrationStream`] and,
//! once done, records the source idmap on the container so the attach
//! pipeline can shift the tree for the destination's namespace.

use std::io::{Cursor, Read, Write};

use apollo_common::{idmap::idmaps_equal, Idmap, StorageError, StorageResult};

use crate::container::ContainerHandle;

/// The wire format a driver ships volumes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationFsType {
    /// Plain file streams (tar), applicable to any backend.
    Rsync,
    /// `btrfs send` streams.
    BtrfsSend,
    /// `zfs send` streams.
    ZfsSend,
    /// `rbd export-diff` streams.
    RbdExport,
}

impl MigrationFsType {
    /// Canonical protocol name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rsync => "rsync",
            Self::BtrfsSend => "btrfs-send",
            Self::ZfsSend => "zfs-send",
            Self::RbdExport => "rbd-export",
        }
    }
}

/// One object in a migration stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationObject {
    /// The container the object belongs to.
    pub container: String,
    /// `None` for the base container, `Some(snapshot)` for a snapshot.
    pub snapshot: Option<String>,
}

impl MigrationObject {
    /// The base container object.
    #[must_use]
    pub fn base(container: &str) -> Self {
        Self {
            container: container.to_string(),
            snapshot: None,
        }
    }

    /// A snapshot object.
    #[must_use]
    pub fn snapshot(container: &str, snapshot: &str) -> Self {
        Self {
            container: container.to_string(),
            snapshot: Some(snapshot.to_string()),
        }
    }
}

/// Driver object producing a migration stream.
pub trait MigrationSource {
    /// The objects to ship, in mandatory order: base container first, then
    /// snapshots oldest first.
    fn objects(&self) -> Vec<MigrationObject>;

    /// Whether the stream keeps inode numbers stable across hosts.
    fn preserves_inodes(&self) -> bool;

    /// Write one object's stream into `sink`.
    fn send_object(
        &mut self,
        object: &MigrationObject,
        sink: &mut dyn Write,
    ) -> StorageResult<()>;
}

/// Per-object byte streams consumed by a migration sink.
pub trait MigrationStream {
    /// Yield the stream for `object`. Objects are requested in source order.
    fn object_stream(&mut self, object: &MigrationObject)
        -> StorageResult<Box<dyn Read + '_>>;
}

/// Arguments to a driver's migration sink.
pub struct MigrationSinkArgs<'a> {
    /// Whether this is a live migration (process state follows separately).
    pub live: bool,
    /// The container being received into.
    pub container: &'a dyn ContainerHandle,
    /// The expected objects, in source order.
    pub objects: Vec<MigrationObject>,
    /// The idmap applied to the stream's bytes on the source host.
    pub source_idmap: Option<Idmap>,
    /// Skip snapshots, receive only the base container.
    pub container_only: bool,
}

/// An in-memory source-to-sink adapter.
///
/// Drains a source's objects into buffers up front; used for local moves and
/// by tests. Real transports stream object by object instead.
pub struct BufferedMigration {
    buffers: Vec<(MigrationObject, Vec<u8>)>,
}

impl BufferedMigration {
    /// Pull every object out of `source`.
    pub fn drain(source: &mut dyn MigrationSource) -> StorageResult<Self> {
        let mut buffers = Vec::new();
        for object in source.objects() {
            let mut buf = Vec::new();
            source.send_object(&object, &mut buf)?;
            buffers.push((object, buf));
        }
        Ok(Self { buffers })
    }

    /// The buffered objects, in source order.
    #[must_use]
    pub fn objects(&self) -> Vec<MigrationObject> {
        self.buffers.iter().map(|(o, _)| o.clone()).collect()
    }
}

impl MigrationStream for BufferedMigration {
    fn object_stream(
        &mut self,
        object: &MigrationObject,
    ) -> StorageResult<Box<dyn Read + '_>> {
        let buf = self
            .buffers
            .iter()
            .find(|(o, _)| o == object)
            .map(|(_, b)| b)
            .ok_or_else(|| {
                StorageError::config(format!(
                    "object '{}' missing from migration stream",
                    object.container
                ))
            })?;
        Ok(Box::new(Cursor::new(buf.as_slice())))
    }
}

/// Record the idmap a migrated tree arrived with.
///
/// When the source idmap differs from the destination container's, the
/// container's `volatile.last_state.idmap` is set so the next storage start
/// unshifts the source map before shifting the destination's.
pub fn shift_if_necessary(
    container: &dyn ContainerHandle,
    source_idmap: Option<&Idmap>,
) -> StorageResult<()> {
    let dst_idmap = container.idmap()?;

    if !idmaps_equal(source_idmap, dst_idmap.as_ref()) {
        let json = Idmap::to_json(source_idmap)?;
        container.config_set("volatile.last_state.idmap", &json)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use apollo_common::idmap::{IdmapEntry, IdmapKind};
    use std::path::PathBuf;

    struct VecSource {
        objects: Vec<MigrationObject>,
    }

    impl MigrationSource for VecSource {
        fn objects(&self) -> Vec<MigrationObject> {
            self.objects.clone()
        }

        fn preserves_inodes(&self) -> bool {
            false
        }

        fn send_object(
            &mut self,
            object: &MigrationObject,
            sink: &mut dyn Write,
        ) -> StorageResult<()> {
            let tag = object.snapshot.as_deref().unwrap_or("base");
            sink.write_all(tag.as_bytes())?;
            Ok(())
        }
    }

    #[test]
    fn buffered_round_trip_preserves_order() {
        let mut source = VecSource {
            objects: vec![
                MigrationObject::base("c1"),
                MigrationObject::snapshot("c1", "s1"),
                MigrationObject::snapshot("c1", "s2"),
            ],
        };
        let mut buffered = BufferedMigration::drain(&mut source).unwrap();

        assert_eq!(buffered.objects(), source.objects());

        for object in source.objects() {
            let mut out = String::new();
            buffered
                .object_stream(&object)
                .unwrap()
                .read_to_string(&mut out)
                .unwrap();
            assert_eq!(out, object.snapshot.as_deref().unwrap_or("base"));
        }
    }

    #[test]
    fn shift_if_necessary_records_differing_map() {
        let container = crate::container::testing::TestContainer::new(
            "c1",
            PathBuf::from("/var/lib/apollo/containers/c1"),
        );
        let src = Idmap::new(vec![IdmapEntry {
            kind: IdmapKind::Both,
            host_base: 100_000,
            ns_base: 0,
            length: 65_536,
        }]);

        shift_if_necessary(&container, Some(&src)).unwrap();
        let config = container.config.lock().unwrap();
        let recorded = config.get("volatile.last_state.idmap").unwrap();
        assert!(recorded.contains("100000"));
    }

    #[test]
    fn shift_if_necessary_noop_when_equal() {
        let container = crate::container::testing::TestContainer::new(
            "c1",
            PathBuf::from("/var/lib/apollo/containers/c1"),
        );
        shift_if_necessary(&container, None).unwrap();
        assert!(container.config.lock().unwrap().is_empty());
    }
}
