//! Device naming and labeling
//!
//! The record name is a pure function of (node, index, vendor, device) and
//! never derived from anything else; the advertised index keeps its
//! zero-padding so names stay stable across relabels.

use std::collections::BTreeMap;

use crate::labels::DEVICE_LABEL_PREFIX;
use crate::snapshot::DeviceSnapshot;

/// Label selecting all devices of one node.
pub const LABEL_DEVICE_NODE: &str = "gpu.inventory.dev/device.node";
/// Label carrying the advertised index of a device.
pub const LABEL_DEVICE_INDEX: &str = "gpu.inventory.dev/device.index";
pub const LABEL_DEVICE_VENDOR: &str = "gpu.inventory.dev/device.vendor";
pub const LABEL_DEVICE_DEVICE: &str = "gpu.inventory.dev/device.device";
pub const LABEL_DEVICE_CLASS: &str = "gpu.inventory.dev/device.class";
pub const LABEL_DEVICE_PRODUCT: &str = "gpu.inventory.dev/device.product";
pub const LABEL_DEVICE_UUID: &str = "gpu.inventory.dev/device.uuid";
pub const LABEL_DEVICE_MEMORY: &str = "gpu.inventory.dev/device.memoryMiB";
pub const LABEL_DEVICE_MIG_CAPABLE: &str = "gpu.inventory.dev/device.mig.capable";

/// Compute the cluster-unique record name for one device:
/// `{node}-{index}-{vendor}-{device}`, lowercased.
pub fn device_name(node: &str, snapshot: &DeviceSnapshot) -> String {
    format!(
        "{}-{}-{}-{}",
        node, snapshot.index, snapshot.vendor, snapshot.device
    )
    .to_lowercase()
}

/// Compute the full label set for one device record.
///
/// Besides the controller-owned identity labels, every node label of the
/// form `device.<NN>.*` for this index is copied through verbatim.
pub fn device_labels(node: &str, snapshot: &DeviceSnapshot) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();

    labels.insert(LABEL_DEVICE_NODE.to_string(), sanitize_label_value(node));
    labels.insert(LABEL_DEVICE_INDEX.to_string(), snapshot.index.clone());
    labels.insert(LABEL_DEVICE_VENDOR.to_string(), snapshot.vendor.clone());
    labels.insert(LABEL_DEVICE_DEVICE.to_string(), snapshot.device.clone());
    labels.insert(LABEL_DEVICE_CLASS.to_string(), snapshot.class.clone());

    if !snapshot.product.is_empty() {
        labels.insert(
            LABEL_DEVICE_PRODUCT.to_string(),
            sanitize_label_value(&snapshot.product),
        );
    }
    if !snapshot.uuid.is_empty() {
        labels.insert(
            LABEL_DEVICE_UUID.to_string(),
            sanitize_label_value(&snapshot.uuid),
        );
    }
    if snapshot.memory_mib > 0 {
        labels.insert(LABEL_DEVICE_MEMORY.to_string(), snapshot.memory_mib.to_string());
    }
    labels.insert(
        LABEL_DEVICE_MIG_CAPABLE.to_string(),
        snapshot.mig.capable.to_string(),
    );

    let own_prefix = format!("{}{}.", DEVICE_LABEL_PREFIX, snapshot.index);
    for (key, value) in &snapshot.raw_labels {
        if key.starts_with(&own_prefix) {
            labels.insert(key.clone(), value.clone());
        }
    }

    labels
}

/// Clamp a free-form string to a valid Kubernetes label value: allowed
/// characters only, at most 63, starting and ending alphanumeric.
pub fn sanitize_label_value(value: &str) -> String {
    let mut out: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    while out.ends_with(|c: char| !c.is_ascii_alphanumeric()) {
        out.pop();
    }
    while out.starts_with(|c: char| !c.is_ascii_alphanumeric()) {
        out.remove(0);
    }
    out
}
