//! Detection agent snapshot model
//!
//! JSON shapes returned by the per-node detection agent's
//! `/api/v1/detect/gpu` endpoint, and the per-node index built from them.
//! Every field is defaulted so partial agent responses still decode.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Device memory totals in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryInfo {
    #[serde(rename = "Total")]
    pub total: u64,
    #[serde(rename = "Free")]
    pub free: u64,
    #[serde(rename = "Used")]
    pub used: u64,
}

/// Device utilization percentages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Utilization {
    #[serde(rename = "Gpu")]
    pub gpu: u32,
    #[serde(rename = "Memory")]
    pub memory: u32,
}

/// PCI identity as reported by the detection agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PciDetection {
    pub address: String,
    pub vendor: String,
    pub device: String,
    pub class: String,
    pub subsystem: String,
}

/// Negotiated PCIE link as reported by the detection agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcieDetection {
    pub generation: Option<i32>,
    pub width: Option<i32>,
}

/// MIG capability as reported by the detection agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MigDetection {
    pub capable: bool,
    pub mode: String,
    pub profiles_supported: Vec<String>,
}

/// One per-GPU entry of the detection agent response array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectionEntry {
    pub index: i32,
    pub uuid: String,
    pub product: String,
    pub memory_info: MemoryInfo,
    pub power_usage: u32,
    pub power_management_default_limit: u32,
    pub utilization: Utilization,
    pub power_state: u32,
    #[serde(rename = "temperatureC")]
    pub temperature_c: i32,
    #[serde(rename = "memoryMiB")]
    pub memory_mib: i32,
    pub compute_major: i32,
    pub compute_minor: i32,
    pub numa_node: Option<i32>,
    pub sm_count: Option<i32>,
    #[serde(rename = "memoryBandwidthMiB")]
    pub memory_bandwidth_mib: Option<i32>,
    pub pci: PciDetection,
    pub pcie: PcieDetection,
    pub board: String,
    pub family: String,
    pub serial: String,
    pub display_mode: String,
    pub precision: Vec<String>,
    pub mig: MigDetection,
}

impl DetectionEntry {
    /// Memory size in MiB, falling back to the byte total when the agent
    /// does not report MiB directly.
    pub fn memory_mib_or_derived(&self) -> i32 {
        if self.memory_mib > 0 {
            self.memory_mib
        } else {
            (self.memory_info.total / (1024 * 1024)) as i32
        }
    }
}

/// Detection entries for one node, indexed by UUID and by decimal index.
#[derive(Debug, Clone, Default)]
pub struct NodeDetection {
    pub by_uuid: HashMap<String, DetectionEntry>,
    pub by_index: HashMap<String, DetectionEntry>,
}

impl NodeDetection {
    pub fn from_entries(entries: Vec<DetectionEntry>) -> Self {
        let mut detection = NodeDetection::default();
        for entry in entries {
            if !entry.uuid.is_empty() {
                detection.by_uuid.insert(entry.uuid.clone(), entry.clone());
            }
            detection.by_index.insert(entry.index.to_string(), entry);
        }
        detection
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty() && self.by_index.is_empty()
    }

    /// Look up an entry, preferring the UUID key over the index key.
    pub fn find(&self, uuid: &str, index: &str) -> Option<&DetectionEntry> {
        if !uuid.is_empty() {
            if let Some(entry) = self.by_uuid.get(uuid) {
                return Some(entry);
            }
        }
        if index.is_empty() {
            return None;
        }
        // Advertised indices may be zero-padded; the agent reports plain
        // decimals.
        if let Some(entry) = self.by_index.get(index) {
            return Some(entry);
        }
        let unpadded = index.trim_start_matches('0');
        let unpadded = if unpadded.is_empty() { "0" } else { unpadded };
        self.by_index.get(unpadded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"[
          {
            "index": 0,
            "uuid": "GPU-AAA",
            "product": "A100",
            "memoryInfo": {"Total": 42949672960, "Free": 42949672960, "Used": 0},
            "powerUsage": 60000,
            "powerManagementDefaultLimit": 250000,
            "utilization": {"Gpu": 2, "Memory": 1},
            "powerState": 0,
            "temperatureC": 38,
            "memoryMiB": 40960,
            "computeMajor": 8,
            "computeMinor": 0,
            "numaNode": 1,
            "smCount": 108,
            "memoryBandwidthMiB": 1555,
            "pci": {"address": "0000:65:00.0", "vendor": "10DE", "device": "20B0", "class": "0302"},
            "pcie": {"generation": 4, "width": 16},
            "board": "board-id",
            "family": "ampere",
            "serial": "serial-1",
            "displayMode": "Enabled",
            "precision": ["fp16"],
            "mig": {"capable": true, "mode": "single", "profilesSupported": ["1g.5gb"]}
          }
        ]"#
    }

    #[test]
    fn test_decode_entry_array() {
        let entries: Vec<DetectionEntry> = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.uuid, "GPU-AAA");
        assert_eq!(entry.memory_mib, 40960);
        assert_eq!(entry.memory_bandwidth_mib, Some(1555));
        assert_eq!(entry.pcie.generation, Some(4));
        assert_eq!(entry.mig.profiles_supported, vec!["1g.5gb"]);
        assert_eq!(entry.power_state, 0);
    }

    #[test]
    fn test_decode_partial_entry() {
        let entries: Vec<DetectionEntry> =
            serde_json::from_str(r#"[{"index": 2, "uuid": "GPU-BBB"}]"#).unwrap();
        assert_eq!(entries[0].index, 2);
        assert_eq!(entries[0].memory_mib, 0);
        assert!(entries[0].numa_node.is_none());
    }

    #[test]
    fn test_index_keys() {
        let entries: Vec<DetectionEntry> = serde_json::from_str(sample_json()).unwrap();
        let detection = NodeDetection::from_entries(entries);
        assert!(detection.by_uuid.contains_key("GPU-AAA"));
        assert!(detection.by_index.contains_key("0"));
    }

    #[test]
    fn test_find_prefers_uuid_then_index() {
        let detection = NodeDetection::from_entries(vec![
            DetectionEntry {
                index: 0,
                uuid: "GPU-AAA".to_string(),
                product: "by-uuid".to_string(),
                ..Default::default()
            },
            DetectionEntry {
                index: 3,
                product: "by-index".to_string(),
                ..Default::default()
            },
        ]);

        assert_eq!(detection.find("GPU-AAA", "9").unwrap().product, "by-uuid");
        assert_eq!(detection.find("GPU-XXX", "3").unwrap().product, "by-index");
        assert_eq!(detection.find("", "03").unwrap().product, "by-index");
        assert!(detection.find("GPU-XXX", "7").is_none());
    }

    #[test]
    fn test_memory_fallback_from_bytes() {
        let entry = DetectionEntry {
            memory_info: MemoryInfo {
                total: 40960 * 1024 * 1024,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(entry.memory_mib_or_derived(), 40960);
    }
}
