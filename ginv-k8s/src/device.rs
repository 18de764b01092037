//! Device reconciler
//!
//! Creates or updates the cluster record for one discovered GPU. Updates are
//! idempotent: nothing is persisted unless the semantic diff is non-empty,
//! metadata/spec land before status, and version conflicts are retried a
//! bounded number of times against a fresh read.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::client::K8sClient;
use crate::crd::{GPUDevice, GpuDeviceStatus};
use ginv_core::approval::ApprovalPolicy;
use ginv_core::health::{self, HealthTransition};
use ginv_core::naming::{device_labels, device_name};
use ginv_core::snapshot::DeviceSnapshot;
use ginv_core::status::{DeviceHardware, MigInfo};
use ginv_core::telemetry::NodeTelemetry;

/// Attempts per write before a version conflict is surfaced.
const CONFLICT_RETRIES: usize = 3;

pub const EVENT_CREATED: &str = "Created";
pub const EVENT_UPDATED: &str = "Updated";
pub const EVENT_HEALTH_DEGRADED: &str = "HealthDegraded";
pub const EVENT_HEALTH_RECOVERED: &str = "HealthRecovered";

/// Reconciles individual device records.
pub struct DeviceReconciler {
    client: K8sClient,
    reporter: Reporter,
}

impl DeviceReconciler {
    pub fn new(client: K8sClient) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: "ginv-controller".to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    /// Create or update the record for one device.
    ///
    /// Returns the record name and whether anything was persisted. The
    /// snapshot must already be validated; store errors are retryable and
    /// surfaced to the caller.
    pub async fn reconcile_device(
        &self,
        node: &Node,
        snapshot: &DeviceSnapshot,
        node_managed: bool,
        approval: &ApprovalPolicy,
        telemetry: &NodeTelemetry,
    ) -> Result<(String, bool)> {
        snapshot
            .validate()
            .context("Snapshot cannot identify a device")?;

        let node_name = node.name_any();
        let name = device_name(&node_name, snapshot);
        let api = self.client.gpu_devices();

        match api.get_opt(&name).await? {
            None => {
                self.create_device(&api, node, &name, snapshot, node_managed, approval, telemetry)
                    .await?;
                Ok((name, true))
            }
            Some(existing) => {
                let changed = self
                    .update_device(
                        &api,
                        node,
                        &name,
                        existing,
                        snapshot,
                        node_managed,
                        approval,
                        telemetry,
                    )
                    .await?;
                Ok((name, changed))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_device(
        &self,
        api: &Api<GPUDevice>,
        node: &Node,
        name: &str,
        snapshot: &DeviceSnapshot,
        node_managed: bool,
        approval: &ApprovalPolicy,
        telemetry: &NodeTelemetry,
    ) -> Result<()> {
        let node_name = node.name_any();
        let mut device = GPUDevice::new(
            name,
            crate::crd::GpuDeviceSpec {
                managed: approval.auto_attach(node_managed, node.labels()),
            },
        );
        device.metadata.labels = Some(device_labels(&node_name, snapshot));
        device.metadata.owner_references = node.controller_owner_ref(&()).map(|r| vec![r]);

        let mut created = api
            .create(&PostParams::default(), &device)
            .await
            .with_context(|| format!("Failed to create device: {}", name))?;

        let (status, transition) = build_status(&node_name, None, snapshot, telemetry);
        created.status = Some(status);
        self.replace_status_with_retry(api, name, created.clone())
            .await?;

        info!(device = name, node = %node_name, managed = created.spec.managed, "Device record created");
        self.publish(
            &created,
            EventType::Normal,
            EVENT_CREATED,
            format!("Discovered GPU {} on node {}", snapshot.index, node_name),
        )
        .await;
        self.publish_transition(&created, transition).await;

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_device(
        &self,
        api: &Api<GPUDevice>,
        node: &Node,
        name: &str,
        existing: GPUDevice,
        snapshot: &DeviceSnapshot,
        node_managed: bool,
        approval: &ApprovalPolicy,
        telemetry: &NodeTelemetry,
    ) -> Result<bool> {
        let node_name = node.name_any();

        let auto_attach = approval.auto_attach(node_managed, node.labels());
        let mut desired = existing.clone();
        apply_desired_metadata(&mut desired, node, snapshot, auto_attach);
        if desired.spec.managed && !existing.spec.managed {
            info!(device = name, "Device auto-attached by approval policy");
        }

        let metadata_changed = desired.metadata.labels != existing.metadata.labels
            || desired.metadata.owner_references != existing.metadata.owner_references
            || desired.spec != existing.spec;

        let mut current = if metadata_changed {
            self.replace_with_retry(api, name, desired, node, snapshot, auto_attach)
                .await?
        } else {
            existing.clone()
        };

        let (status, transition) =
            build_status(&node_name, existing.status.as_ref(), snapshot, telemetry);
        let status_changed = existing.status.as_ref() != Some(&status);
        if status_changed {
            current.status = Some(status);
            current = self
                .replace_status_with_retry(api, name, current)
                .await?;
        }

        let changed = metadata_changed || status_changed;
        if changed {
            debug!(device = name, "Device record updated");
            self.publish(
                &current,
                EventType::Normal,
                EVENT_UPDATED,
                format!("Refreshed GPU {} on node {}", snapshot.index, node_name),
            )
            .await;
        }
        self.publish_transition(&current, transition).await;

        Ok(changed)
    }

    /// Replace metadata + spec, retrying version conflicts against a fresh
    /// read.
    #[allow(clippy::too_many_arguments)]
    async fn replace_with_retry(
        &self,
        api: &Api<GPUDevice>,
        name: &str,
        mut desired: GPUDevice,
        node: &Node,
        snapshot: &DeviceSnapshot,
        auto_attach: bool,
    ) -> Result<GPUDevice> {
        for attempt in 1..=CONFLICT_RETRIES {
            match api.replace(name, &PostParams::default(), &desired).await {
                Ok(obj) => return Ok(obj),
                Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < CONFLICT_RETRIES => {
                    debug!(device = name, attempt, "Conflict on device update, retrying");
                    desired = api.get(name).await?;
                    apply_desired_metadata(&mut desired, node, snapshot, auto_attach);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to update device: {}", name))
                }
            }
        }
        unreachable!("conflict retry loop always returns");
    }

    /// Replace the status subresource, retrying version conflicts while
    /// keeping the computed status.
    async fn replace_status_with_retry(
        &self,
        api: &Api<GPUDevice>,
        name: &str,
        mut desired: GPUDevice,
    ) -> Result<GPUDevice> {
        for attempt in 1..=CONFLICT_RETRIES {
            let data = serde_json::to_vec(&desired)?;
            match api.replace_status(name, &PostParams::default(), data).await {
                Ok(obj) => return Ok(obj),
                Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < CONFLICT_RETRIES => {
                    debug!(device = name, attempt, "Conflict on status update, retrying");
                    let status = desired.status.take();
                    desired = api.get(name).await?;
                    desired.status = status;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to update device status: {}", name))
                }
            }
        }
        unreachable!("conflict retry loop always returns");
    }

    async fn publish(&self, device: &GPUDevice, type_: EventType, reason: &str, note: String) {
        let recorder = Recorder::new(
            self.client.inner().clone(),
            self.reporter.clone(),
            device.object_ref(&()),
        );
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(device = %device.name_any(), error = %e, "Failed to publish event");
        }
    }

    async fn publish_transition(&self, device: &GPUDevice, transition: Option<HealthTransition>) {
        match transition {
            Some(HealthTransition::Degraded { reason, message }) => {
                self.publish(
                    device,
                    EventType::Warning,
                    EVENT_HEALTH_DEGRADED,
                    format!("{}: {}", reason, message),
                )
                .await;
            }
            Some(HealthTransition::Recovered) => {
                self.publish(
                    device,
                    EventType::Normal,
                    EVENT_HEALTH_RECOVERED,
                    "Device health recovered".to_string(),
                )
                .await;
            }
            None => {}
        }
    }
}

/// Overlay the desired labels, owner reference, and approval onto a device
/// record. Controller-owned labels are recomputed from the fusion; labels
/// owned by others are preserved. Manual detach wins: approval may flip
/// managed on, never off.
fn apply_desired_metadata(
    device: &mut GPUDevice,
    node: &Node,
    snapshot: &DeviceSnapshot,
    auto_attach: bool,
) {
    let node_name = node.name_any();

    let mut labels = device.labels().clone();
    labels.retain(|key, _| !key.starts_with("gpu.inventory.dev/"));
    labels.extend(device_labels(&node_name, snapshot));
    device.metadata.labels = Some(labels);

    if let Some(owner) = node.controller_owner_ref(&()) {
        device.metadata.owner_references = Some(vec![owner]);
    }

    if auto_attach && !device.spec.managed {
        device.spec.managed = true;
    }
}

/// Build the desired status from the previous one plus the current fusion.
///
/// Hardware merges additively: a field the snapshot leaves unset keeps its
/// previously known value. Health is carried forward and advanced by the
/// telemetry sample when one exists; an absent sample leaves it untouched.
fn build_status(
    node_name: &str,
    previous: Option<&GpuDeviceStatus>,
    snapshot: &DeviceSnapshot,
    telemetry: &NodeTelemetry,
) -> (GpuDeviceStatus, Option<HealthTransition>) {
    let mut status = previous.cloned().unwrap_or_default();
    status.node_name = node_name.to_string();

    let mut hardware = status.hardware.take().unwrap_or_default();
    merge_hardware(&mut hardware, &snapshot.hardware());
    status.hardware = Some(hardware);

    let mut device_health = status.health.take().unwrap_or_default();
    health::apply_detection_temperature(&mut device_health, snapshot.temperature_c);
    let transition = telemetry
        .find(&snapshot.uuid, &snapshot.index)
        .and_then(|point| health::apply_telemetry(&mut device_health, &point));
    status.health = Some(device_health);

    (status, transition)
}

/// Additive hardware update: only fields the fusion produced overwrite; the
/// PCI identity is forced lowercase in the persisted form.
fn merge_hardware(current: &mut DeviceHardware, desired: &DeviceHardware) {
    merge_string(&mut current.pci.address, &desired.pci.address);
    merge_string(&mut current.pci.vendor, &desired.pci.vendor);
    merge_string(&mut current.pci.device, &desired.pci.device);
    merge_string(&mut current.pci.class, &desired.pci.class);
    merge_string(&mut current.pci.subsystem, &desired.pci.subsystem);
    current.pci.address = current.pci.address.to_lowercase();
    current.pci.vendor = current.pci.vendor.to_lowercase();
    current.pci.device = current.pci.device.to_lowercase();
    current.pci.class = current.pci.class.to_lowercase();
    current.pci.subsystem = current.pci.subsystem.to_lowercase();

    if desired.pcie.is_some() {
        current.pcie = desired.pcie;
    }
    if desired.compute.is_some() {
        current.compute = desired.compute;
    }
    if desired.memory_mib > 0 {
        current.memory_mib = desired.memory_mib;
    }

    merge_string(&mut current.product, &desired.product);
    merge_string(&mut current.uuid, &desired.uuid);
    merge_string(&mut current.board, &desired.board);
    merge_string(&mut current.family, &desired.family);
    merge_string(&mut current.serial, &desired.serial);
    merge_string(&mut current.display_mode, &desired.display_mode);
    merge_string(&mut current.p_state, &desired.p_state);

    if desired.numa_node.is_some() {
        current.numa_node = desired.numa_node;
    }
    if desired.power_limit_milli_watt.is_some() {
        current.power_limit_milli_watt = desired.power_limit_milli_watt;
    }
    if desired.sm_count.is_some() {
        current.sm_count = desired.sm_count;
    }
    if desired.memory_bandwidth_mib.is_some() {
        current.memory_bandwidth_mib = desired.memory_bandwidth_mib;
    }
    if !desired.precision.is_empty() {
        current.precision = desired.precision.clone();
    }

    merge_mig(&mut current.mig, &desired.mig);
}

fn merge_mig(current: &mut MigInfo, desired: &MigInfo) {
    if desired.capable {
        current.capable = true;
    }
    if desired.strategy != ginv_core::status::MigStrategy::None {
        current.strategy = desired.strategy;
    }
    if !desired.profiles_supported.is_empty() {
        current.profiles_supported = desired.profiles_supported.clone();
    }
    if !desired.capacities.is_empty() {
        current.capacities = desired.capacities.clone();
    }
}

fn merge_string(current: &mut String, desired: &str) {
    if !desired.is_empty() {
        *current = desired.to_string();
    }
}
