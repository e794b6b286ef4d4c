//! The container capability consumed by the storage core, and snapshot name
//! handling.
//!
//! The container object model (start, exec, freeze, ...) lives outside this
//! crate. Storage only needs a narrow capability: identity, the stable path,
//! the privilege bit, the idmap, and hooks to persist per-container config
//! and apply templates.

use std::path::PathBuf;

use apollo_common::{Idmap, StorageError, StorageResult};

/// Separator between a container name and a snapshot name in caller-visible
/// snapshot names (`c1/s1`). Forbidden in ordinary container names.
pub const SNAPSHOT_DELIMITER: &str = "/";

/// True if `name` refers to a snapshot rather than a container.
#[must_use]
pub fn is_snapshot_name(name: &str) -> bool {
    name.contains(SNAPSHOT_DELIMITER)
}

/// Split `c1/s1` into `("c1", "s1")`.
pub fn split_snapshot_name(name: &str) -> StorageResult<(&str, &str)> {
    name.split_once(SNAPSHOT_DELIMITER).ok_or_else(|| {
        StorageError::config(format!("'{}' is not a snapshot name", name))
    })
}

/// Validate an ordinary container or volume name.
pub fn validate_volume_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::config("name must not be empty"));
    }
    if name.contains(SNAPSHOT_DELIMITER) {
        return Err(StorageError::config(format!(
            "name '{}' must not contain the snapshot delimiter '{}'",
            name, SNAPSHOT_DELIMITER
        )));
    }
    if name.starts_with('.') {
        return Err(StorageError::config(format!(
            "name '{}' must not start with a dot",
            name
        )));
    }
    Ok(())
}

/// The capability the storage core requires from a container.
pub trait ContainerHandle {
    /// The container's name; snapshots use `parent/snap`.
    fn name(&self) -> &str;

    /// The stable path other subsystems resolve (`{VAR}/containers/<name>`,
    /// or the snapshot mount point for snapshots).
    fn path(&self) -> PathBuf;

    /// The rootfs directory below [`Self::path`].
    fn rootfs_path(&self) -> PathBuf {
        self.path().join("rootfs")
    }

    /// Whether the container runs without a user namespace.
    fn is_privileged(&self) -> bool;

    /// The idmap the container's user namespace requires. `None` for
    /// privileged containers.
    fn idmap(&self) -> StorageResult<Option<Idmap>>;

    /// Persist a `volatile.*` key on the container.
    fn config_set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Apply the container's templates for the given trigger
    /// (`create`, `copy`).
    fn template_apply(&self, trigger: &str) -> StorageResult<()>;

    /// Names of this container's snapshots, oldest first.
    fn snapshots(&self) -> StorageResult<Vec<String>>;
}

/// Resolves container names to handles.
///
/// The attach pipeline needs the idmaps of every container sharing a custom
/// volume; the daemon's container registry provides this lookup.
pub trait ContainerLoader: Send + Sync {
    /// Load a container by name.
    fn load(&self, name: &str) -> StorageResult<Box<dyn ContainerHandle>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Minimal in-memory container used by unit tests.
    pub struct TestContainer {
        pub name: String,
        pub path: PathBuf,
        pub privileged: bool,
        pub idmap: Option<Idmap>,
        pub snapshots: Vec<String>,
        pub config: Mutex<BTreeMap<String, String>>,
        pub template_triggers: Mutex<Vec<String>>,
    }

    impl TestContainer {
        pub fn new(name: &str, path: PathBuf) -> Self {
            Self {
                name: name.to_string(),
                path,
                privileged: true,
                idmap: None,
                snapshots: Vec::new(),
                config: Mutex::new(BTreeMap::new()),
                template_triggers: Mutex::new(Vec::new()),
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
            self.template_triggers
                .lock()
                .unwrap()
                .push(trigger.to_string());
            Ok(())
        }

        fn snapshots(&self) -> StorageResult<Vec<String>> {
            Ok(self.snapshots.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_names_split() {
        assert!(is_snapshot_name("c1/s1"));
        assert!(!is_snapshot_name("c1"));
        assert_eq!(split_snapshot_name("c1/s1").unwrap(), ("c1", "s1"));
        assert!(split_snapshot_name("c1").is_err());
    }

    #[test]
    fn delimiter_rejected_in_names() {
        assert!(validate_volume_name("c1").is_ok());
        assert!(validate_volume_name("c1/s1").is_err());
        assert!(validate_volume_name("").is_err());
        assert!(validate_volume_name(".hidden").is_err());
    }
}
