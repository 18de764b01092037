//! Custom resource types
//!
//! `GPUDevice` is the record this controller owns: one per physically
//! present GPU, named `{node}-{index}-{vendor}-{device}` and owner-referenced
//! to its node. `NodeFeature` is consumed only; the feature-discovery agent
//! publishes one per node carrying the advertised label set.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ginv_core::status::{DeviceHardware, DeviceHealth};

/// API group of the controller-owned resources.
pub const API_GROUP: &str = "gpu.inventory.dev";
pub const API_VERSION: &str = "v1alpha1";

/// Desired state of one GPU device record.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gpu.inventory.dev",
    version = "v1alpha1",
    kind = "GPUDevice",
    plural = "gpudevices",
    shortname = "gpudev",
    status = "GpuDeviceStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct GpuDeviceSpec {
    /// Whether the device is attached to the controller's management.
    /// Flipped to true by the approval policy; never flipped back
    /// automatically.
    #[serde(default)]
    pub managed: bool,
}

/// Observed state of one GPU device record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct GpuDeviceStatus {
    /// Node the device is physically attached to; always equals the owner.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<DeviceHardware>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<DeviceHealth>,
}

/// Feature-discovery object published per node by the node-feature agent.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "nfd.k8s-sigs.io",
    version = "v1alpha1",
    kind = "NodeFeature",
    plural = "nodefeatures",
    namespaced,
    derive = "Default"
)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeFeatureSpec {
    /// Labels the agent advertises for the node.
    pub labels: BTreeMap<String, String>,
}
