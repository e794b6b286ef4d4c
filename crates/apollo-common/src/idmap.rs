//! UID/GID map handling.
//!
//! An [`Idmap`] describes how host ids map onto ids inside a user namespace.
//! Storage volumes record the map that was last applied to the bytes on disk
//! (`volatile.idmap.last`) and the map the next attaching container requires
//! (`volatile.idmap.next`); when they differ the tree is walked and every
//! inode's ownership rewritten.

use std::os::unix::fs::{lchown, MetadataExt, PermissionsExt};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Which id space a map entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdmapKind {
    /// UIDs only.
    Uid,
    /// GIDs only.
    Gid,
    /// Both UIDs and GIDs.
    Both,
}

impl IdmapKind {
    /// Whether this entry translates UIDs.
    #[must_use]
    pub fn maps_uid(self) -> bool {
        matches!(self, Self::Uid | Self::Both)
    }

    /// Whether this entry translates GIDs.
    #[must_use]
    pub fn maps_gid(self) -> bool {
        matches!(self, Self::Gid | Self::Both)
    }
}

/// One contiguous id range translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdmapEntry {
    /// Id space this entry applies to.
    pub kind: IdmapKind,
    /// First id on the host side.
    pub host_base: u32,
    /// First id inside the namespace.
    pub ns_base: u32,
    /// Number of ids covered.
    pub length: u32,
}

impl IdmapEntry {
    /// Translate a namespace id to its host id, if covered by this entry.
    #[must_use]
    pub fn shift(&self, id: u32) -> Option<u32> {
        if id >= self.ns_base && (id - self.ns_base) < self.length {
            Some(self.host_base + (id - self.ns_base))
        } else {
            None
        }
    }

    /// Translate a host id back to its namespace id, if covered by this entry.
    #[must_use]
    pub fn unshift(&self, id: u32) -> Option<u32> {
        if id >= self.host_base && (id - self.host_base) < self.length {
            Some(self.ns_base + (id - self.host_base))
        } else {
            None
        }
    }
}

/// Wire shape matching the daemon's `volatile.idmap.*` JSON format.
#[derive(Serialize, Deserialize)]
struct WireEntry {
    #[serde(rename = "Isuid")]
    is_uid: bool,
    #[serde(rename = "Isgid")]
    is_gid: bool,
    #[serde(rename = "Hostid")]
    host_id: u32,
    #[serde(rename = "Nsid")]
    ns_id: u32,
    #[serde(rename = "Maprange")]
    map_range: u32,
}

/// A UID/GID range translation set.
#[derive(Debug, Clone, Default)]
pub struct Idmap {
    entries: Vec<IdmapEntry>,
}

impl Idmap {
    /// Create a map from a list of entries.
    #[must_use]
    pub fn new(entries: Vec<IdmapEntry>) -> Self {
        Self { entries }
    }

    /// The entries of this map.
    #[must_use]
    pub fn entries(&self) -> &[IdmapEntry] {
        &self.entries
    }

    /// True if the map translates nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a map from its JSON wire form. An empty list parses to `None`.
    pub fn from_json(raw: &str) -> StorageResult<Option<Self>> {
        let wire: Vec<WireEntry> = serde_json::from_str(raw)?;
        if wire.is_empty() {
            return Ok(None);
        }

        let mut entries = Vec::with_capacity(wire.len());
        for w in wire {
            let kind = match (w.is_uid, w.is_gid) {
                (true, true) => IdmapKind::Both,
                (true, false) => IdmapKind::Uid,
                (false, true) => IdmapKind::Gid,
                (false, false) => {
                    return Err(StorageError::config(
                        "idmap entry maps neither uids nor gids",
                    ))
                }
            };
            entries.push(IdmapEntry {
                kind,
                host_base: w.host_id,
                ns_base: w.ns_id,
                length: w.map_range,
            });
        }
        Ok(Some(Self { entries }))
    }

    /// Serialize to the JSON wire form. `None` maps serialize as `[]`.
    pub fn to_json(map: Option<&Self>) -> StorageResult<String> {
        let wire: Vec<WireEntry> = map
            .map(|m| {
                m.entries
                    .iter()
                    .map(|e| WireEntry {
                        is_uid: e.kind.maps_uid(),
                        is_gid: e.kind.maps_gid(),
                        host_id: e.host_base,
                        ns_id: e.ns_base,
                        map_range: e.length,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(serde_json::to_string(&wire)?)
    }

    /// Translate a namespace uid to the host, leaving unmapped ids unchanged.
    #[must_use]
    pub fn shift_uid(&self, uid: u32) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.kind.maps_uid())
            .find_map(|e| e.shift(uid))
            .unwrap_or(uid)
    }

    /// Translate a namespace gid to the host, leaving unmapped ids unchanged.
    #[must_use]
    pub fn shift_gid(&self, gid: u32) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.kind.maps_gid())
            .find_map(|e| e.shift(gid))
            .unwrap_or(gid)
    }

    /// Translate a host uid back into the namespace, leaving unmapped ids unchanged.
    #[must_use]
    pub fn unshift_uid(&self, uid: u32) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.kind.maps_uid())
            .find_map(|e| e.unshift(uid))
            .unwrap_or(uid)
    }

    /// Translate a host gid back into the namespace, leaving unmapped ids unchanged.
    #[must_use]
    pub fn unshift_gid(&self, gid: u32) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.kind.maps_gid())
            .find_map(|e| e.unshift(gid))
            .unwrap_or(gid)
    }

    /// Walk `root` applying this map to every inode's ownership (ns -> host).
    pub fn shift_rootfs(&self, root: &Path) -> StorageResult<()> {
        self.walk(root, ShiftDirection::Shift)
    }

    /// Walk `root` inverting this map on every inode's ownership (host -> ns).
    pub fn unshift_rootfs(&self, root: &Path) -> StorageResult<()> {
        self.walk(root, ShiftDirection::Unshift)
    }

    fn walk(&self, root: &Path, direction: ShiftDirection) -> StorageResult<()> {
        for entry in walkdir::WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| {
                StorageError::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walk failed")
                }))
            })?;

            let meta = entry.path().symlink_metadata()?;
            let (uid, gid) = (meta.uid(), meta.gid());
            let (new_uid, new_gid) = match direction {
                ShiftDirection::Shift => (self.shift_uid(uid), self.shift_gid(gid)),
                ShiftDirection::Unshift => (self.unshift_uid(uid), self.unshift_gid(gid)),
            };

            if new_uid == uid && new_gid == gid {
                continue;
            }

            lchown(entry.path(), Some(new_uid), Some(new_gid))?;

            // chown(2) strips setuid/setgid bits on regular files; put them back.
            let mode = meta.permissions().mode();
            if meta.file_type().is_file() && mode & 0o6000 != 0 {
                std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(mode))?;
            }
        }
        Ok(())
    }
}

impl PartialEq for Idmap {
    fn eq(&self, other: &Self) -> bool {
        let mut a = self.entries.clone();
        let mut b = other.entries.clone();
        a.sort_unstable();
        b.sort_unstable();
        a == b
    }
}

impl Eq for Idmap {}

/// Compare two optional maps, treating `None` and an empty map as equal.
#[must_use]
pub fn idmaps_equal(a: Option<&Idmap>, b: Option<&Idmap>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(m), None) | (None, Some(m)) => m.is_empty(),
        (Some(a), Some(b)) => a == b,
    }
}

enum ShiftDirection {
    Shift,
    Unshift,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unprivileged_map() -> Idmap {
        Idmap::new(vec![
            IdmapEntry {
                kind: IdmapKind::Uid,
                host_base: 100_000,
                ns_base: 0,
                length: 65_536,
            },
            IdmapEntry {
                kind: IdmapKind::Gid,
                host_base: 100_000,
                ns_base: 0,
                length: 65_536,
            },
        ])
    }

    #[test]
    fn shift_maps_into_host_range() {
        let map = unprivileged_map();
        assert_eq!(map.shift_uid(0), 100_000);
        assert_eq!(map.shift_uid(1000), 101_000);
        assert_eq!(map.shift_gid(65_535), 165_535);
    }

    #[test]
    fn unshift_inverts_shift() {
        let map = unprivileged_map();
        for id in [0, 1, 999, 65_535] {
            assert_eq!(map.unshift_uid(map.shift_uid(id)), id);
            assert_eq!(map.unshift_gid(map.shift_gid(id)), id);
        }
    }

    #[test]
    fn ids_outside_ranges_pass_through() {
        let map = unprivileged_map();
        assert_eq!(map.shift_uid(70_000), 70_000);
        assert_eq!(map.unshift_uid(50_000), 50_000);
    }

    #[test]
    fn json_round_trip() {
        let map = unprivileged_map();
        let raw = Idmap::to_json(Some(&map)).unwrap();
        let parsed = Idmap::from_json(&raw).unwrap().unwrap();
        assert_eq!(map, parsed);
    }

    #[test]
    fn empty_list_parses_to_none() {
        assert!(Idmap::from_json("[]").unwrap().is_none());
        assert_eq!(Idmap::to_json(None).unwrap(), "[]");
    }

    #[test]
    fn equality_ignores_entry_order() {
        let a = unprivileged_map();
        let mut entries = a.entries().to_vec();
        entries.reverse();
        let b = Idmap::new(entries);
        assert_eq!(a, b);
        assert!(idmaps_equal(Some(&a), Some(&b)));
    }

    #[test]
    fn none_equals_empty() {
        assert!(idmaps_equal(None, None));
        assert!(idmaps_equal(Some(&Idmap::default()), None));
        assert!(!idmaps_equal(Some(&unprivileged_map()), None));
    }

    #[test]
    fn walk_leaves_unmapped_trees_alone() {
        use std::os::unix::fs::MetadataExt;

        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("d/f"), b"x").unwrap();
        let before = tmp.path().join("d/f").metadata().unwrap().uid();

        // No real uid falls inside this namespace range, so the walk must
        // visit every inode and change nothing.
        let map = Idmap::new(vec![IdmapEntry {
            kind: IdmapKind::Both,
            host_base: 900_000,
            ns_base: 500_000,
            length: 1_000,
        }]);
        map.shift_rootfs(tmp.path()).unwrap();
        map.unshift_rootfs(tmp.path()).unwrap();

        assert_eq!(tmp.path().join("d/f").metadata().unwrap().uid(), before);
    }

    #[test]
    fn both_kind_round_trips() {
        let map = Idmap::new(vec![IdmapEntry {
            kind: IdmapKind::Both,
            host_base: 1_000_000,
            ns_base: 0,
            length: 10_000,
        }]);
        let raw = Idmap::to_json(Some(&map)).unwrap();
        assert!(raw.contains("\"Isuid\":true"));
        assert!(raw.contains("\"Isgid\":true"));
        let parsed = Idmap::from_json(&raw).unwrap().unwrap();
        assert_eq!(map, parsed);
    }
}
