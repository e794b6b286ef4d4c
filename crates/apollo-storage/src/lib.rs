//! # apollo-storage
//!
//! The storage subsystem of the Apollo container daemon: materializes
//! container root filesystems, image caches, snapshots and custom volumes on
//! top of pluggable backends (plain directories, Btrfs, ZFS, LVM thin pools,
//! and networked Ceph/RBD).
//!
//! ## Architecture
//!
//! - **Backend drivers** ([`backend`]): one per technology, all implementing
//!   the common [`backend::Backend`] contract behind the
//!   [`backend::StorageBackend`] tagged union.
//! - **Mount coordination** ([`lock`]): a process-wide map serializing
//!   mount/unmount/image-create per object; concurrent callers wait and
//!   assume the holder's outcome.
//! - **Idmap shifting** ([`apollo_common::idmap`], driven by
//!   [`facade::Storage::volume_attach_init`]): rewrites on-disk ownership
//!   when a volume changes user-namespace hands.
//! - **Façade** ([`facade::Storage`]): the functions callers actually
//!   invoke, keeping metadata rows and on-disk state committed together.
//!
//! ## Usage
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use apollo_common::StoragePaths;
//! use apollo_storage::backend::{DriverKind, NullUnpacker};
//! use apollo_storage::facade::Storage;
//! use apollo_storage::meta::JsonMetaStore;
//!
//! # fn main() -> apollo_common::StorageResult<()> {
//! let store = JsonMetaStore::open("/var/lib/apollo/storage.json")?.into_shared();
//! let storage = Storage::new(StoragePaths::new(), store, Arc::new(NullUnpacker));
//!
//! storage.pool_create("default", DriverKind::Dir, "", BTreeMap::new())?;
//! let mut pool = storage.pool_init("default")?;
//! pool.ops_mut().pool_mount()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cmd;
pub mod config;
pub mod container;
pub mod facade;
pub mod fsutil;
pub mod layout;
pub mod lock;
pub mod meta;
pub mod migration;
pub mod mount;
pub mod revert;

pub use backend::{DriverKind, StorageBackend};
pub use container::{ContainerHandle, SNAPSHOT_DELIMITER};
pub use facade::Storage;
pub use meta::{MetaStore, StoragePool, StorageVolume, VolumeKind};
