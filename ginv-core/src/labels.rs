//! Feature-discovery label decoding
//!
//! Node-feature labels advertise each physically present GPU as
//! `gpu.inventory.dev/device.<NN>.<field>` with a zero-padded index. This
//! module materializes those labels into per-GPU snapshots and provides the
//! gate that decides whether a node carries GPU hardware at all.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::status::{MigProfileCapacity, MigStrategy};

/// Label domain owned by this controller.
pub const LABEL_DOMAIN: &str = "gpu.inventory.dev";
/// Prefix of per-device feature labels: `gpu.inventory.dev/device.<NN>.<field>`.
pub const DEVICE_LABEL_PREFIX: &str = "gpu.inventory.dev/device.";
/// Vendor domain used for the MIG / gpu label families.
pub const VENDOR_DOMAIN: &str = "nvidia.com";
/// Node label opting a node out of controller management.
pub const NODE_MANAGED_LABEL: &str = "gpu.inventory.dev/managed";
/// Vendor label advertising the node-wide MIG strategy.
pub const MIG_STRATEGY_LABEL: &str = "nvidia.com/mig.strategy";

static DEVICE_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\.(.+)$").expect("device label pattern"));
static MIG_CAPACITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^nvidia\.com/mig-(.+)\.count$").expect("mig capacity pattern"));

/// Per-GPU snapshot decoded from node-feature labels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelSnapshot {
    /// Advertised index, zero-padding preserved.
    pub index: String,
    pub vendor: String,
    pub device: String,
    pub class: String,
    /// All `device.<NN>.*` labels for this index, full key to value.
    pub raw: BTreeMap<String, String>,
}

/// Decode per-device label snapshots from a node's label set, ordered by
/// advertised index.
pub fn decode_label_snapshots(labels: &BTreeMap<String, String>) -> Vec<LabelSnapshot> {
    let mut by_index: BTreeMap<String, LabelSnapshot> = BTreeMap::new();

    for (key, value) in labels {
        let Some(rest) = key.strip_prefix(DEVICE_LABEL_PREFIX) else {
            continue;
        };
        let Some(caps) = DEVICE_LABEL_RE.captures(rest) else {
            continue;
        };
        let index = &caps[1];
        let field = &caps[2];

        let snapshot = by_index
            .entry(index.to_string())
            .or_insert_with(|| LabelSnapshot {
                index: index.to_string(),
                ..Default::default()
            });
        match field {
            "vendor" => snapshot.vendor = value.to_lowercase(),
            "device" => snapshot.device = value.to_lowercase(),
            "class" => snapshot.class = value.to_lowercase(),
            _ => {}
        }
        snapshot.raw.insert(key.clone(), value.clone());
    }

    by_index.into_values().collect()
}

/// Whether a node's labels advertise GPU hardware.
///
/// True iff any per-device identity label, any vendor MIG label, or any
/// vendor gpu label is present. Absent labels mean not a GPU node.
pub fn node_has_gpu_hardware_labels(labels: Option<&BTreeMap<String, String>>) -> bool {
    let Some(labels) = labels else {
        return false;
    };

    labels.keys().any(|key| {
        if let Some(rest) = key.strip_prefix(DEVICE_LABEL_PREFIX) {
            if let Some(caps) = DEVICE_LABEL_RE.captures(rest) {
                if matches!(&caps[2], "vendor" | "device" | "class") {
                    return true;
                }
            }
        }
        key.starts_with("nvidia.com/mig-")
            || key.starts_with("nvidia.com/mig.")
            || key.starts_with("nvidia.com/gpu.")
    })
}

/// Decode the node-wide MIG strategy and per-profile capacities from vendor
/// labels.
pub fn decode_mig_labels(
    labels: &BTreeMap<String, String>,
) -> (MigStrategy, Vec<MigProfileCapacity>) {
    let strategy = labels
        .get(MIG_STRATEGY_LABEL)
        .map(|v| MigStrategy::parse(v))
        .unwrap_or_default();

    let mut capacities = Vec::new();
    for (key, value) in labels {
        let Some(caps) = MIG_CAPACITY_RE.captures(key) else {
            continue;
        };
        let Ok(count) = value.parse::<i32>() else {
            continue;
        };
        capacities.push(MigProfileCapacity {
            profile: caps[1].to_string(),
            count,
        });
    }

    (strategy, capacities)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_decode_single_device() {
        let labels = labels(&[
            ("gpu.inventory.dev/device.00.vendor", "10DE"),
            ("gpu.inventory.dev/device.00.device", "1DB4"),
            ("gpu.inventory.dev/device.00.class", "0300"),
            ("gpu.inventory.dev/device.00.rack", "r12"),
            ("kubernetes.io/hostname", "node-a"),
        ]);

        let snapshots = decode_label_snapshots(&labels);
        assert_eq!(snapshots.len(), 1);
        let s = &snapshots[0];
        assert_eq!(s.index, "00");
        assert_eq!(s.vendor, "10de");
        assert_eq!(s.device, "1db4");
        assert_eq!(s.class, "0300");
        assert_eq!(s.raw.len(), 4);
        assert_eq!(
            s.raw.get("gpu.inventory.dev/device.00.rack").unwrap(),
            "r12"
        );
    }

    #[test]
    fn test_decode_multiple_devices_ordered() {
        let labels = labels(&[
            ("gpu.inventory.dev/device.1.vendor", "10de"),
            ("gpu.inventory.dev/device.0.vendor", "10de"),
            ("gpu.inventory.dev/device.0.device", "1db4"),
            ("gpu.inventory.dev/device.1.device", "20b0"),
        ]);

        let snapshots = decode_label_snapshots(&labels);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].index, "0");
        assert_eq!(snapshots[1].index, "1");
        assert_eq!(snapshots[1].device, "20b0");
    }

    #[test]
    fn test_gpu_hardware_gate() {
        assert!(!node_has_gpu_hardware_labels(None));
        assert!(!node_has_gpu_hardware_labels(Some(&labels(&[(
            "kubernetes.io/hostname",
            "node-a"
        )]))));

        assert!(node_has_gpu_hardware_labels(Some(&labels(&[(
            "gpu.inventory.dev/device.00.vendor",
            "10de"
        )]))));
        assert!(node_has_gpu_hardware_labels(Some(&labels(&[(
            "nvidia.com/mig-1g.5gb.count",
            "7"
        )]))));
        assert!(node_has_gpu_hardware_labels(Some(&labels(&[(
            "nvidia.com/mig.strategy",
            "single"
        )]))));
        assert!(node_has_gpu_hardware_labels(Some(&labels(&[(
            "nvidia.com/gpu.product",
            "A100"
        )]))));

        // A free-form device label alone does not make a GPU node.
        assert!(!node_has_gpu_hardware_labels(Some(&labels(&[(
            "gpu.inventory.dev/device.00.rack",
            "r12"
        )]))));
    }

    #[test]
    fn test_decode_mig_labels() {
        let labels = labels(&[
            ("nvidia.com/mig.strategy", "mixed"),
            ("nvidia.com/mig-1g.5gb.count", "7"),
            ("nvidia.com/mig-3g.20gb.count", "2"),
            ("nvidia.com/mig-bad.count", "x"),
        ]);

        let (strategy, capacities) = decode_mig_labels(&labels);
        assert_eq!(strategy, MigStrategy::Mixed);
        assert_eq!(capacities.len(), 2);
        assert!(capacities
            .iter()
            .any(|c| c.profile == "1g.5gb" && c.count == 7));
        assert!(capacities
            .iter()
            .any(|c| c.profile == "3g.20gb" && c.count == 2));
    }

    #[test]
    fn test_decode_mig_labels_defaults() {
        let (strategy, capacities) = decode_mig_labels(&BTreeMap::new());
        assert_eq!(strategy, MigStrategy::None);
        assert!(capacities.is_empty());
    }
}
