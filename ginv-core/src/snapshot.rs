//! Per-device source fusion
//!
//! Builds one `DeviceSnapshot` per advertised GPU by layering the detection
//! agent's entry over the label-derived skeleton. Detection is additive: a
//! field updates the snapshot only when the agent actually reported it, so
//! a sparse detection response never erases label-derived facts.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::detection::{DetectionEntry, NodeDetection};
use crate::labels::LabelSnapshot;
use crate::status::{
    ComputeCapability, DeviceHardware, MigInfo, MigProfileCapacity, MigStrategy, PciInfo, PcieInfo,
};

/// Errors raised when a snapshot is too incomplete to identify a device.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("device snapshot is missing the {0} field")]
    MissingField(&'static str),
}

/// MIG configuration carried by a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigSnapshot {
    pub capable: bool,
    pub strategy: MigStrategy,
    pub profiles_supported: Vec<String>,
    pub capacities: Vec<MigProfileCapacity>,
}

/// Transient fusion of label, detection, and telemetry inputs for one GPU.
/// Lives only within one reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSnapshot {
    /// Advertised index, zero-padding preserved.
    pub index: String,
    pub vendor: String,
    pub device: String,
    pub class: String,
    pub pci_address: String,
    pub pci_subsystem: String,
    pub product: String,
    pub uuid: String,
    pub board: String,
    pub family: String,
    pub serial: String,
    pub display_mode: String,
    pub p_state: String,
    pub memory_mib: i32,
    pub compute_major: i32,
    pub compute_minor: i32,
    pub temperature_c: i32,
    pub numa_node: Option<i32>,
    pub power_limit_milli_watt: Option<i32>,
    pub sm_count: Option<i32>,
    pub mem_bandwidth_mib: Option<i32>,
    pub pcie_gen: Option<i32>,
    pub pcie_link_width: Option<i32>,
    pub precision: Vec<String>,
    pub mig: MigSnapshot,
    /// The node's `device.<NN>.*` labels, copied through to the device.
    pub raw_labels: BTreeMap<String, String>,
}

impl DeviceSnapshot {
    /// Start a snapshot from the label-derived skeleton plus the node-wide
    /// MIG advertisement.
    pub fn from_labels(
        labels: &LabelSnapshot,
        mig_strategy: MigStrategy,
        mig_capacities: Vec<MigProfileCapacity>,
    ) -> Self {
        Self {
            index: labels.index.clone(),
            vendor: labels.vendor.clone(),
            device: labels.device.clone(),
            class: labels.class.clone(),
            raw_labels: labels.raw.clone(),
            mig: MigSnapshot {
                capable: false,
                strategy: mig_strategy,
                profiles_supported: Vec::new(),
                capacities: mig_capacities,
            },
            ..Default::default()
        }
    }

    /// Fuse one advertised device with the node's detection index.
    pub fn fuse(
        labels: &LabelSnapshot,
        mig_strategy: MigStrategy,
        mig_capacities: Vec<MigProfileCapacity>,
        detection: &NodeDetection,
    ) -> Self {
        let mut snapshot = Self::from_labels(labels, mig_strategy, mig_capacities);
        if let Some(entry) = detection.find(&snapshot.uuid, &snapshot.index) {
            snapshot.apply_detection(entry);
        }
        snapshot.normalize();
        snapshot
    }

    /// Overlay a detection entry. Strings apply when non-empty, numerics when
    /// non-zero, nullables when present. Compute capability and the PCIE link
    /// are each replaced as a pair when either half differs.
    pub fn apply_detection(&mut self, entry: &DetectionEntry) {
        apply_string(&mut self.product, &entry.product);
        apply_string(&mut self.uuid, &entry.uuid);
        apply_string(&mut self.board, &entry.board);
        apply_string(&mut self.family, &entry.family);
        apply_string(&mut self.serial, &entry.serial);
        apply_string(&mut self.display_mode, &entry.display_mode);
        apply_string(&mut self.vendor, &entry.pci.vendor);
        apply_string(&mut self.device, &entry.pci.device);
        apply_string(&mut self.class, &entry.pci.class);
        apply_string(&mut self.pci_address, &entry.pci.address);
        apply_string(&mut self.pci_subsystem, &entry.pci.subsystem);

        self.p_state = format!("P{}", entry.power_state);

        let memory = entry.memory_mib_or_derived();
        if memory > 0 {
            self.memory_mib = memory;
        }
        if entry.temperature_c != 0 {
            self.temperature_c = entry.temperature_c;
        }

        if (entry.compute_major != 0 || entry.compute_minor != 0)
            && (entry.compute_major != self.compute_major
                || entry.compute_minor != self.compute_minor)
        {
            self.compute_major = entry.compute_major;
            self.compute_minor = entry.compute_minor;
        }

        if (entry.pcie.generation.is_some() || entry.pcie.width.is_some())
            && (entry.pcie.generation != self.pcie_gen || entry.pcie.width != self.pcie_link_width)
        {
            self.pcie_gen = entry.pcie.generation;
            self.pcie_link_width = entry.pcie.width;
        }

        if entry.numa_node.is_some() {
            self.numa_node = entry.numa_node;
        }
        if entry.power_management_default_limit > 0 {
            self.power_limit_milli_watt = Some(entry.power_management_default_limit as i32);
        }
        if entry.sm_count.is_some() {
            self.sm_count = entry.sm_count;
        }
        if entry.memory_bandwidth_mib.is_some() {
            self.mem_bandwidth_mib = entry.memory_bandwidth_mib;
        }
        if !entry.precision.is_empty() {
            self.precision = entry.precision.clone();
        }

        if entry.mig.capable {
            self.mig.capable = true;
        }
        if !entry.mig.mode.is_empty() {
            self.mig.strategy = MigStrategy::parse(&entry.mig.mode);
        }
        if !entry.mig.profiles_supported.is_empty() {
            self.mig.profiles_supported = entry.mig.profiles_supported.clone();
        }
    }

    /// Lowercase the PCI hex fields and bus address.
    pub fn normalize(&mut self) {
        self.vendor = self.vendor.to_lowercase();
        self.device = self.device.to_lowercase();
        self.class = self.class.to_lowercase();
        self.pci_address = self.pci_address.to_lowercase();
        self.pci_subsystem = self.pci_subsystem.to_lowercase();
    }

    /// A snapshot must carry at least index, vendor, and device to name a
    /// record.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.index.is_empty() {
            return Err(SnapshotError::MissingField("index"));
        }
        if self.vendor.is_empty() {
            return Err(SnapshotError::MissingField("vendor"));
        }
        if self.device.is_empty() {
            return Err(SnapshotError::MissingField("device"));
        }
        Ok(())
    }

    /// Build the hardware block this snapshot describes.
    pub fn hardware(&self) -> DeviceHardware {
        DeviceHardware {
            pci: PciInfo {
                address: self.pci_address.clone(),
                vendor: self.vendor.clone(),
                device: self.device.clone(),
                class: self.class.clone(),
                subsystem: self.pci_subsystem.clone(),
            },
            pcie: (self.pcie_gen.is_some() || self.pcie_link_width.is_some()).then_some(PcieInfo {
                generation: self.pcie_gen,
                width: self.pcie_link_width,
            }),
            mig: MigInfo {
                capable: self.mig.capable,
                strategy: self.mig.strategy,
                profiles_supported: self.mig.profiles_supported.clone(),
                capacities: self.mig.capacities.clone(),
            },
            compute: (self.compute_major != 0 || self.compute_minor != 0).then_some(
                ComputeCapability {
                    major: self.compute_major,
                    minor: self.compute_minor,
                },
            ),
            memory_mib: self.memory_mib,
            product: self.product.clone(),
            uuid: self.uuid.clone(),
            board: self.board.clone(),
            family: self.family.clone(),
            serial: self.serial.clone(),
            display_mode: self.display_mode.clone(),
            p_state: self.p_state.clone(),
            numa_node: self.numa_node,
            power_limit_milli_watt: self.power_limit_milli_watt,
            sm_count: self.sm_count,
            memory_bandwidth_mib: self.mem_bandwidth_mib,
            precision: self.precision.clone(),
        }
    }
}

fn apply_string(target: &mut String, value: &str) {
    if !value.is_empty() {
        *target = value.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{MigDetection, PciDetection, PcieDetection};

    fn label_snapshot() -> LabelSnapshot {
        LabelSnapshot {
            index: "0".to_string(),
            vendor: "10de".to_string(),
            device: "1db4".to_string(),
            class: "0300".to_string(),
            raw: BTreeMap::new(),
        }
    }

    fn detection_entry() -> DetectionEntry {
        DetectionEntry {
            index: 0,
            uuid: "GPU-AAA".to_string(),
            product: "A100".to_string(),
            memory_mib: 40960,
            compute_major: 8,
            compute_minor: 0,
            power_state: 0,
            numa_node: Some(1),
            power_management_default_limit: 250,
            sm_count: Some(108),
            memory_bandwidth_mib: Some(1555),
            pci: PciDetection {
                address: "0000:65:00.0".to_string(),
                ..Default::default()
            },
            pcie: PcieDetection {
                generation: Some(4),
                width: Some(16),
            },
            board: "board-id".to_string(),
            family: "ampere".to_string(),
            serial: "serial-1".to_string(),
            display_mode: "Enabled".to_string(),
            precision: vec!["fp16".to_string()],
            mig: MigDetection {
                capable: true,
                mode: "single".to_string(),
                profiles_supported: vec!["1g.5gb".to_string()],
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_fuse_enriches_label_skeleton() {
        let detection = NodeDetection::from_entries(vec![detection_entry()]);
        let snapshot = DeviceSnapshot::fuse(&label_snapshot(), MigStrategy::None, Vec::new(), &detection);

        assert_eq!(snapshot.vendor, "10de");
        assert_eq!(snapshot.product, "A100");
        assert_eq!(snapshot.uuid, "GPU-AAA");
        assert_eq!(snapshot.memory_mib, 40960);
        assert_eq!(snapshot.numa_node, Some(1));
        assert_eq!(snapshot.power_limit_milli_watt, Some(250));
        assert_eq!(snapshot.sm_count, Some(108));
        assert_eq!(snapshot.mem_bandwidth_mib, Some(1555));
        assert_eq!(snapshot.pcie_gen, Some(4));
        assert_eq!(snapshot.pcie_link_width, Some(16));
        assert_eq!(snapshot.board, "board-id");
        assert_eq!(snapshot.family, "ampere");
        assert_eq!(snapshot.serial, "serial-1");
        assert_eq!(snapshot.display_mode, "Enabled");
        assert_eq!(snapshot.p_state, "P0");
        assert_eq!(snapshot.precision, vec!["fp16"]);
        assert!(snapshot.mig.capable);
        assert_eq!(snapshot.mig.strategy, MigStrategy::Single);
        assert_eq!(snapshot.pci_address, "0000:65:00.0");
    }

    #[test]
    fn test_pci_hex_lowercased_on_exit() {
        let mut entry = detection_entry();
        entry.pci.vendor = "10DE".to_string();
        entry.pci.address = "0000:65:00.0".to_uppercase();
        let detection = NodeDetection::from_entries(vec![entry]);

        let mut labels = label_snapshot();
        labels.vendor = "10DE".to_string();
        let snapshot = DeviceSnapshot::fuse(&labels, MigStrategy::None, Vec::new(), &detection);

        assert_eq!(snapshot.vendor, "10de");
        assert_eq!(snapshot.pci_address, "0000:65:00.0");
    }

    #[test]
    fn test_detection_is_additive() {
        let mut snapshot = DeviceSnapshot::from_labels(&label_snapshot(), MigStrategy::None, Vec::new());
        snapshot.product = "known-product".to_string();
        snapshot.memory_mib = 16384;

        // A sparse entry with nothing reported leaves prior fields alone.
        snapshot.apply_detection(&DetectionEntry::default());
        assert_eq!(snapshot.product, "known-product");
        assert_eq!(snapshot.memory_mib, 16384);
        assert_eq!(snapshot.vendor, "10de");
    }

    #[test]
    fn test_compute_and_pcie_replaced_as_pairs() {
        let mut snapshot = DeviceSnapshot::from_labels(&label_snapshot(), MigStrategy::None, Vec::new());
        snapshot.compute_major = 7;
        snapshot.compute_minor = 5;
        snapshot.pcie_gen = Some(3);
        snapshot.pcie_link_width = Some(8);

        let entry = DetectionEntry {
            compute_major: 8,
            compute_minor: 0,
            pcie: PcieDetection {
                generation: Some(4),
                width: None,
            },
            ..Default::default()
        };
        snapshot.apply_detection(&entry);

        assert_eq!(snapshot.compute_major, 8);
        assert_eq!(snapshot.compute_minor, 0);
        assert_eq!(snapshot.pcie_gen, Some(4));
        assert_eq!(snapshot.pcie_link_width, None, "pair replaced wholesale");
    }

    #[test]
    fn test_memory_derived_from_bytes() {
        let mut snapshot = DeviceSnapshot::from_labels(&label_snapshot(), MigStrategy::None, Vec::new());
        let entry = DetectionEntry {
            memory_info: crate::detection::MemoryInfo {
                total: 16 * 1024 * 1024 * 1024,
                ..Default::default()
            },
            ..Default::default()
        };
        snapshot.apply_detection(&entry);
        assert_eq!(snapshot.memory_mib, 16384);
    }

    #[test]
    fn test_validate_rejects_incomplete_snapshots() {
        let detection = NodeDetection::default();
        let snapshot = DeviceSnapshot::fuse(&label_snapshot(), MigStrategy::None, Vec::new(), &detection);
        assert!(snapshot.validate().is_ok());

        let mut incomplete = label_snapshot();
        incomplete.vendor = String::new();
        let snapshot = DeviceSnapshot::fuse(&incomplete, MigStrategy::None, Vec::new(), &detection);
        assert!(matches!(
            snapshot.validate(),
            Err(SnapshotError::MissingField("vendor"))
        ));
    }

    #[test]
    fn test_hardware_block() {
        let detection = NodeDetection::from_entries(vec![detection_entry()]);
        let snapshot = DeviceSnapshot::fuse(&label_snapshot(), MigStrategy::None, Vec::new(), &detection);
        let hardware = snapshot.hardware();

        assert_eq!(hardware.pci.vendor, "10de");
        assert_eq!(hardware.pci.address, "0000:65:00.0");
        assert_eq!(hardware.pcie.unwrap().generation, Some(4));
        assert_eq!(hardware.compute.unwrap().major, 8);
        assert_eq!(hardware.memory_mib, 40960);
        assert!(hardware.mig.capable);
    }
}
