//! GINV Core Library
//!
//! Core inventory logic for the GPU inventory controller.
//! This crate fuses feature-discovery labels, detection agent snapshots, and
//! exporter telemetry into per-device records and drives their health state.

pub mod approval;
pub mod detection;
pub mod health;
pub mod labels;
pub mod metrics;
pub mod naming;
pub mod snapshot;
pub mod status;
pub mod telemetry;

// Re-export common types
pub use approval::{ApprovalError, ApprovalMode, ApprovalPolicy, LabelSelectorConfig};
pub use detection::{DetectionEntry, NodeDetection};
pub use health::{FaultReason, HealthTransition, DEVICE_HEALTH_RECOVERY_THRESHOLD};
pub use labels::LabelSnapshot;
pub use snapshot::{DeviceSnapshot, SnapshotError};
pub use status::{DeviceHardware, DeviceHealth, MigStrategy};
pub use telemetry::{NodeTelemetry, TelemetryPoint};
