//! Persisted per-device status blocks
//!
//! Shapes of the hardware and health sections stored on a GPUDevice record.
//! Hardware updates are additive (an unset field never erases a known one);
//! the health block is replaced wholesale by the health state machine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PCI identity of a device. Hex fields are persisted lowercase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct PciInfo {
    /// PCI bus address, e.g. "0000:65:00.0"
    #[serde(skip_serializing_if = "String::is_empty")]
    pub address: String,
    /// PCI vendor id (hex string)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub vendor: String,
    /// PCI device id (hex string)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device: String,
    /// PCI class code (hex string)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub class: String,
    /// PCI subsystem id (hex string)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subsystem: String,
}

/// Negotiated PCIE link parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct PcieInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
}

/// CUDA compute capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct ComputeCapability {
    pub major: i32,
    pub minor: i32,
}

/// Multi-instance partitioning strategy advertised for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum MigStrategy {
    #[default]
    None,
    Single,
    Mixed,
}

impl fmt::Display for MigStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigStrategy::None => write!(f, "none"),
            MigStrategy::Single => write!(f, "single"),
            MigStrategy::Mixed => write!(f, "mixed"),
        }
    }
}

impl MigStrategy {
    /// Parse an advertised strategy string; unknown values fall back to none.
    pub fn parse(s: &str) -> Self {
        match s {
            "single" => MigStrategy::Single,
            "mixed" => MigStrategy::Mixed,
            _ => MigStrategy::None,
        }
    }
}

/// Capacity of one supported MIG profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct MigProfileCapacity {
    pub profile: String,
    pub count: i32,
}

/// MIG configuration of a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct MigInfo {
    pub capable: bool,
    pub strategy: MigStrategy,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub profiles_supported: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capacities: Vec<MigProfileCapacity>,
}

/// Hardware block of a device record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceHardware {
    pub pci: PciInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pcie: Option<PcieInfo>,
    pub mig: MigInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute: Option<ComputeCapability>,
    #[serde(rename = "memoryMiB", skip_serializing_if = "is_zero_i32")]
    pub memory_mib: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub product: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub board: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub family: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub serial: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub display_mode: String,
    #[serde(rename = "pState", skip_serializing_if = "String::is_empty")]
    pub p_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numa_node: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_limit_milli_watt: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sm_count: Option<i32>,
    #[serde(rename = "memoryBandwidthMiB", skip_serializing_if = "Option::is_none")]
    pub memory_bandwidth_mib: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub precision: Vec<String>,
}

/// Health block of a device record.
///
/// `metrics` holds the stringified monotonic counter baselines the health
/// state machine compares new samples against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceHealth {
    /// Last known temperature in Celsius; 0 means never observed.
    #[serde(rename = "temperatureC", skip_serializing_if = "is_zero_i32")]
    pub temperature_c: i32,
    /// Aggregate double-bit ECC error total as last reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecc_total: Option<i64>,
    /// Reason code of the active fault, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_reason: Option<String>,
    /// Human-readable message of the active fault.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_healthy_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated_time: Option<DateTime<Utc>>,
    /// Healthy samples seen since the last fault.
    #[serde(skip_serializing_if = "is_zero_i32")]
    pub consecutive_healthy: i32,
    /// Stringified counter baselines keyed by metric name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, String>,
}

impl DeviceHealth {
    /// Whether a fault is currently recorded.
    pub fn has_fault(&self) -> bool {
        self.last_error_reason.is_some()
    }
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mig_strategy_parse() {
        assert_eq!(MigStrategy::parse("single"), MigStrategy::Single);
        assert_eq!(MigStrategy::parse("mixed"), MigStrategy::Mixed);
        assert_eq!(MigStrategy::parse("none"), MigStrategy::None);
        assert_eq!(MigStrategy::parse("garbage"), MigStrategy::None);
    }

    #[test]
    fn test_hardware_serialized_field_names() {
        let hw = DeviceHardware {
            memory_mib: 40960,
            memory_bandwidth_mib: Some(1555),
            p_state: "P0".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&hw).unwrap();
        assert_eq!(json["memoryMiB"], 40960);
        assert_eq!(json["memoryBandwidthMiB"], 1555);
        assert_eq!(json["pState"], "P0");
    }

    #[test]
    fn test_health_default_is_empty() {
        let health = DeviceHealth::default();
        assert!(!health.has_fault());
        assert_eq!(health.consecutive_healthy, 0);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }
}
