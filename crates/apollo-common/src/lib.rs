//! # apollo-common
//!
//! Shared leaf types for the Apollo container daemon:
//! - The storage error taxonomy
//! - UID/GID map handling (shifting trees into and out of user namespaces)
//! - The stable on-disk path conventions other subsystems depend on

#![warn(missing_docs)]

pub mod error;
pub mod idmap;
pub mod paths;

pub use error::{StorageError, StorageResult};
pub use idmap::{Idmap, IdmapEntry, IdmapKind};
pub use paths::StoragePaths;
