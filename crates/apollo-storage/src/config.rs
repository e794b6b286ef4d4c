//! Per-driver configuration key tables.
//!
//! The set of recognized keys is fixed per driver and encoded as data so a
//! new key is a one-line addition. Unknown keys are rejected at create and
//! update time; immutable keys are rejected on update.

use std::collections::BTreeMap;

use apollo_common::{StorageError, StorageResult};

use crate::backend::DriverKind;

/// One recognized pool configuration key.
pub struct ConfigKey {
    /// The key name.
    pub name: &'static str,
    /// Whether the key may change after pool creation.
    pub immutable: bool,
    /// Default stamped at create time when the key is absent.
    pub default: Option<&'static str>,
}

const fn key(name: &'static str) -> ConfigKey {
    ConfigKey {
        name,
        immutable: false,
        default: None,
    }
}

const fn immutable(name: &'static str) -> ConfigKey {
    ConfigKey {
        name,
        immutable: true,
        default: None,
    }
}

const fn immutable_with_default(name: &'static str, default: &'static str) -> ConfigKey {
    ConfigKey {
        name,
        immutable: true,
        default: Some(default),
    }
}

/// Keys every driver recognizes. The `volatile.*` keys are stamped by the
/// backend during create and never writable by the administrator.
const COMMON_KEYS: &[ConfigKey] = &[
    immutable("source"),
    key("size"),
    immutable("volatile.initial_source"),
    immutable("volatile.pool.pristine"),
];

const DIR_KEYS: &[ConfigKey] = &[];

const BTRFS_KEYS: &[ConfigKey] = &[key("btrfs.mount_options")];

const ZFS_KEYS: &[ConfigKey] = &[
    immutable("zfs.pool_name"),
    key("zfs.clone_copy"),
];

const LVM_KEYS: &[ConfigKey] = &[
    immutable("lvm.vg_name"),
    immutable("lvm.thinpool_name"),
    immutable("lvm.use_thinpool"),
    key("volume.block.filesystem"),
    key("volume.block.mount_options"),
    key("volume.size"),
];

const CEPH_KEYS: &[ConfigKey] = &[
    immutable_with_default("ceph.cluster_name", "ceph"),
    immutable("ceph.osd.pool_name"),
    immutable_with_default("ceph.user.name", "admin"),
    immutable_with_default("ceph.osd.pg_num", "32"),
    key("ceph.rbd.clone_copy"),
    key("volume.block.filesystem"),
    key("volume.block.mount_options"),
];

const MOCK_KEYS: &[ConfigKey] = &[];

/// The driver-specific keys (not including [`COMMON_KEYS`]).
#[must_use]
pub fn driver_config_keys(kind: DriverKind) -> &'static [ConfigKey] {
    match kind {
        DriverKind::Dir => DIR_KEYS,
        DriverKind::Btrfs => BTRFS_KEYS,
        DriverKind::Zfs => ZFS_KEYS,
        DriverKind::Lvm => LVM_KEYS,
        DriverKind::Ceph => CEPH_KEYS,
        DriverKind::Mock => MOCK_KEYS,
    }
}

fn lookup(kind: DriverKind, name: &str) -> Option<&'static ConfigKey> {
    COMMON_KEYS
        .iter()
        .chain(driver_config_keys(kind))
        .find(|k| k.name == name)
}

/// Validate a pool config at create time: every key must be recognized.
pub fn validate_pool_config(
    kind: DriverKind,
    config: &BTreeMap<String, String>,
) -> StorageResult<()> {
    for name in config.keys() {
        if lookup(kind, name).is_none() {
            return Err(StorageError::config(format!(
                "unknown configuration key '{}' for driver '{}'",
                name, kind
            )));
        }
    }
    Ok(())
}

/// Stamp driver defaults into a config map where keys are absent.
pub fn apply_defaults(kind: DriverKind, config: &mut BTreeMap<String, String>) {
    for k in COMMON_KEYS.iter().chain(driver_config_keys(kind)) {
        if let Some(default) = k.default {
            config
                .entry(k.name.to_string())
                .or_insert_with(|| default.to_string());
        }
    }
}

/// Validate a pool update: keys must be recognized and immutable keys must
/// not change value.
pub fn validate_pool_update(
    kind: DriverKind,
    current: &BTreeMap<String, String>,
    proposed: &BTreeMap<String, String>,
) -> StorageResult<Vec<String>> {
    validate_pool_config(kind, proposed)?;

    let mut changed = Vec::new();
    let keys: std::collections::BTreeSet<&String> =
        current.keys().chain(proposed.keys()).collect();
    for name in keys {
        let before = current.get(name);
        let after = proposed.get(name);
        if before == after {
            continue;
        }
        let descriptor = lookup(kind, name).expect("validated above");
        if descriptor.immutable {
            return Err(StorageError::config(format!(
                "configuration key '{}' cannot be changed",
                name
            )));
        }
        changed.push(name.clone());
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_key_rejected() {
        let mut config = BTreeMap::new();
        config.insert("zfs.pool_name".to_string(), "tank".to_string());
        assert!(validate_pool_config(DriverKind::Zfs, &config).is_ok());
        assert!(validate_pool_config(DriverKind::Dir, &config).is_err());
    }

    #[test]
    fn ceph_defaults_applied() {
        let mut config = BTreeMap::new();
        apply_defaults(DriverKind::Ceph, &mut config);
        assert_eq!(config.get("ceph.cluster_name").unwrap(), "ceph");
        assert_eq!(config.get("ceph.user.name").unwrap(), "admin");
        assert_eq!(config.get("ceph.osd.pg_num").unwrap(), "32");
    }

    #[test]
    fn defaults_do_not_override() {
        let mut config = BTreeMap::new();
        config.insert("ceph.osd.pg_num".to_string(), "64".to_string());
        apply_defaults(DriverKind::Ceph, &mut config);
        assert_eq!(config.get("ceph.osd.pg_num").unwrap(), "64");
    }

    #[test]
    fn immutable_key_change_rejected() {
        let mut current = BTreeMap::new();
        current.insert("source".to_string(), "tank".to_string());
        current.insert("zfs.clone_copy".to_string(), "true".to_string());

        let mut proposed = current.clone();
        proposed.insert("zfs.clone_copy".to_string(), "false".to_string());
        let changed = validate_pool_update(DriverKind::Zfs, &current, &proposed).unwrap();
        assert_eq!(changed, vec!["zfs.clone_copy"]);

        proposed.insert("source".to_string(), "other".to_string());
        assert!(validate_pool_update(DriverKind::Zfs, &current, &proposed).is_err());
    }

    #[test]
    fn volatile_keys_are_immutable() {
        let mut current = BTreeMap::new();
        current.insert("volatile.initial_source".to_string(), "a".to_string());
        let mut proposed = BTreeMap::new();
        proposed.insert("volatile.initial_source".to_string(), "b".to_string());
        assert!(validate_pool_update(DriverKind::Dir, &current, &proposed).is_err());
    }
}
