use std::collections::HashMap;

use tracing::warn;

use crate::client::DEFAULT_MAX_DOWNLOAD_SIZE;
use crate::protocol::parse_var_u64;

/// Immutable typed snapshot of the device's advertised variables
///
/// Produced by [crate::FastbootClient::device_info] from the variable
/// cache; it never refreshes itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub product: Option<String>,
    pub serialno: Option<String>,
    pub variant: Option<String>,
    pub secure: bool,
    pub unlocked: bool,
    /// True in userspace fastboot (fastbootd) rather than the bootloader
    pub is_userspace: bool,
    pub current_slot: Option<String>,
    pub slot_count: u32,
    pub version_bootloader: Option<String>,
    pub version_baseband: Option<String>,
    pub hw_revision: Option<String>,
    pub max_download_size: u64,
    /// Partition name to byte size, from `partition-size:<name>`
    pub partition_sizes: HashMap<String, u64>,
    /// Partition name to dynamic-partition flag, from `is-logical:<name>`
    pub logical_partitions: HashMap<String, bool>,
}

impl DeviceInfo {
    /// Project a variable map into a snapshot
    ///
    /// Keys are expected lower-cased, the way the client caches them.
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let get = |name: &str| vars.get(name).cloned();
        let flag = |name: &str| vars.get(name).map(|v| v == "yes").unwrap_or(false);

        let mut partition_sizes = HashMap::new();
        let mut logical_partitions = HashMap::new();
        for (key, value) in vars {
            if let Some(name) = key.strip_prefix("partition-size:") {
                match parse_var_u64(value) {
                    Some(size) => {
                        partition_sizes.insert(name.to_string(), size);
                    }
                    None => warn!("Unparseable size for partition {name}: {value:?}"),
                }
            } else if let Some(name) = key.strip_prefix("is-logical:") {
                logical_partitions.insert(name.to_string(), value == "yes");
            }
        }

        DeviceInfo {
            product: get("product"),
            serialno: get("serialno"),
            variant: get("variant"),
            secure: flag("secure"),
            unlocked: flag("unlocked"),
            is_userspace: flag("is-userspace"),
            current_slot: get("current-slot"),
            slot_count: vars
                .get("slot-count")
                .and_then(|v| parse_var_u64(v))
                .unwrap_or(0) as u32,
            version_bootloader: get("version-bootloader"),
            version_baseband: get("version-baseband"),
            hw_revision: get("hw-revision"),
            max_download_size: vars
                .get("max-download-size")
                .and_then(|v| parse_var_u64(v))
                .unwrap_or(DEFAULT_MAX_DOWNLOAD_SIZE),
            partition_sizes,
            logical_partitions,
        }
    }

    /// Size of a partition in bytes, when the device advertises it
    pub fn partition_size(&self, name: &str) -> Option<u64> {
        self.partition_sizes
            .get(&name.to_ascii_lowercase())
            .copied()
    }

    /// Whether a partition lives inside the super partition
    pub fn is_logical(&self, name: &str) -> bool {
        self.logical_partitions
            .get(&name.to_ascii_lowercase())
            .copied()
            .unwrap_or(false)
    }

    /// Whether the device uses A/B slots
    pub fn has_slots(&self) -> bool {
        self.slot_count > 1
    }
}
