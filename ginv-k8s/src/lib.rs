//! GINV Kubernetes Integration
//!
//! Custom resources, client wrapper, agent HTTP sources, and the device and
//! node reconcilers of the GPU inventory controller.

pub mod agents;
pub mod client;
pub mod crd;
pub mod device;
pub mod node;

pub use agents::{DetectionSource, TelemetrySource};
pub use client::K8sClient;
pub use crd::{GPUDevice, GpuDeviceSpec, GpuDeviceStatus, NodeFeature, NodeFeatureSpec};
pub use device::DeviceReconciler;
pub use node::{NodeReconciler, ReconcileOutcome};
