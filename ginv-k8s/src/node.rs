//! Node reconciler
//!
//! Orchestrates one full reconciliation of a node: decode the advertised
//! devices from its labels, collect the agent sources, fuse and reconcile
//! each device, then garbage-collect records whose advertised index is gone.
//! Agent source failures are never fatal; they only earn a requeue hint with
//! exponential backoff across consecutive failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::agents::{DetectionSource, TelemetrySource};
use crate::client::K8sClient;
use crate::crd::GPUDevice;
use crate::device::DeviceReconciler;
use ginv_core::approval::ApprovalPolicy;
use ginv_core::detection::NodeDetection;
use ginv_core::labels::{
    decode_label_snapshots, decode_mig_labels, node_has_gpu_hardware_labels, NODE_MANAGED_LABEL,
};
use ginv_core::metrics::MetricsRegistry;
use ginv_core::naming::LABEL_DEVICE_INDEX;
use ginv_core::snapshot::DeviceSnapshot;
use ginv_core::telemetry::NodeTelemetry;

/// Default requeue delay after a source failure.
pub const REQUEUE_BASE: Duration = Duration::from_secs(30);
/// Upper bound of the source-failure backoff.
pub const REQUEUE_CAP: Duration = Duration::from_secs(300);

/// Result of one node reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// When set, the node should be revisited after this delay because a
    /// non-fatal source failed.
    pub requeue_after: Option<Duration>,
}

/// Reconciles the full device set of one node.
pub struct NodeReconciler {
    client: K8sClient,
    devices: DeviceReconciler,
    telemetry: Arc<dyn TelemetrySource>,
    detection: Arc<dyn DetectionSource>,
    approval: ApprovalPolicy,
    metrics: Arc<MetricsRegistry>,
    requeue_base: Duration,
    requeue_cap: Duration,
    /// Consecutive source-failure counts per node, for backoff.
    source_failures: Mutex<HashMap<String, u32>>,
}

impl NodeReconciler {
    pub fn new(
        client: K8sClient,
        telemetry: Arc<dyn TelemetrySource>,
        detection: Arc<dyn DetectionSource>,
        approval: ApprovalPolicy,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            devices: DeviceReconciler::new(client.clone()),
            client,
            telemetry,
            detection,
            approval,
            metrics,
            requeue_base: REQUEUE_BASE,
            requeue_cap: REQUEUE_CAP,
            source_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Override the source-failure requeue bounds.
    pub fn with_requeue(mut self, base: Duration, cap: Duration) -> Self {
        self.requeue_base = base;
        self.requeue_cap = cap;
        self
    }

    /// Reconcile one node end to end.
    pub async fn reconcile_node(&self, node_name: &str) -> Result<ReconcileOutcome> {
        let started = Instant::now();
        let outcome = self.reconcile_inner(node_name).await;
        self.metrics
            .observe_reconcile_duration(node_name, started.elapsed().as_secs_f64());
        match &outcome {
            Ok(o) if o.requeue_after.is_some() => self.metrics.inc_reconcile("requeued"),
            Ok(_) => self.metrics.inc_reconcile("ok"),
            Err(_) => self.metrics.inc_reconcile("error"),
        }
        outcome
    }

    async fn reconcile_inner(&self, node_name: &str) -> Result<ReconcileOutcome> {
        let Some(node) = self.client.get_node(node_name).await? else {
            info!(node = node_name, "Node gone, removing its device records");
            self.delete_node_devices(node_name).await?;
            self.clear_source_failures(node_name);
            return Ok(ReconcileOutcome::default());
        };

        if !node_has_gpu_hardware_labels(Some(node.labels())) {
            info!(
                node = node_name,
                "Node no longer advertises GPU hardware, removing its device records"
            );
            self.delete_node_devices(node_name).await?;
            self.clear_source_failures(node_name);
            return Ok(ReconcileOutcome::default());
        }

        let label_snapshots = decode_label_snapshots(node.labels());
        let (mig_strategy, mig_capacities) = decode_mig_labels(node.labels());
        let advertised: HashSet<String> =
            label_snapshots.iter().map(|s| s.index.clone()).collect();

        let mut source_failed = false;
        let telemetry = match self.telemetry.collect(node_name).await {
            Ok(telemetry) => telemetry,
            Err(e) => {
                warn!(node = node_name, error = %format!("{e:#}"), "Telemetry collection failed");
                self.metrics.inc_source_failure(node_name, "telemetry");
                source_failed = true;
                NodeTelemetry::default()
            }
        };
        let detection = match self.detection.collect(node_name).await {
            Ok(detection) => detection,
            Err(e) => {
                warn!(node = node_name, error = %format!("{e:#}"), "Detection collection failed");
                self.metrics.inc_source_failure(node_name, "detection");
                source_failed = true;
                NodeDetection::default()
            }
        };

        let node_managed = node_is_managed(&node);
        let mut errors: Vec<anyhow::Error> = Vec::new();

        for label_snapshot in &label_snapshots {
            let snapshot = DeviceSnapshot::fuse(
                label_snapshot,
                mig_strategy,
                mig_capacities.clone(),
                &detection,
            );
            if let Err(e) = snapshot.validate() {
                warn!(
                    node = node_name,
                    index = %label_snapshot.index,
                    error = %e,
                    "Skipping device with incomplete identity"
                );
                continue;
            }

            match self
                .devices
                .reconcile_device(&node, &snapshot, node_managed, &self.approval, &telemetry)
                .await
            {
                Ok((name, changed)) => {
                    debug!(node = node_name, device = %name, changed, "Device reconciled")
                }
                Err(e) => errors.push(e.context(format!(
                    "device index {} on node {}",
                    label_snapshot.index, node_name
                ))),
            }
        }

        match self.client.list_node_devices(node_name).await {
            Ok(existing) => {
                for device in stale_devices(&existing, &advertised) {
                    let name = device.name_any();
                    info!(node = node_name, device = %name, "Deleting stale device record");
                    if let Err(e) = self.client.delete_device(&name).await {
                        errors.push(e);
                    }
                }
                self.metrics
                    .set_device_count(node_name, advertised.len() as i64);
            }
            Err(e) => errors.push(e),
        }

        // Advance or clear the consecutive-failure streak before surfacing
        // device errors, so the backoff stays accurate across mixed passes.
        let requeue_after = if source_failed {
            Some(self.next_backoff(node_name))
        } else {
            self.clear_source_failures(node_name);
            None
        };

        if !errors.is_empty() {
            return Err(join_errors(errors));
        }

        Ok(ReconcileOutcome { requeue_after })
    }

    /// Remove every device record labeled with a node. Safe to race the
    /// cluster garbage collector.
    async fn delete_node_devices(&self, node_name: &str) -> Result<()> {
        let devices = self.client.list_node_devices(node_name).await?;
        let mut errors = Vec::new();
        for device in devices {
            if let Err(e) = self.client.delete_device(&device.name_any()).await {
                errors.push(e);
            }
        }
        self.metrics.set_device_count(node_name, 0);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(join_errors(errors))
        }
    }

    fn next_backoff(&self, node_name: &str) -> Duration {
        let mut failures = self
            .source_failures
            .lock()
            .expect("source failure map poisoned");
        let count = failures.entry(node_name.to_string()).or_insert(0);
        *count += 1;
        backoff_for(*count, self.requeue_base, self.requeue_cap)
    }

    fn clear_source_failures(&self, node_name: &str) {
        self.source_failures
            .lock()
            .expect("source failure map poisoned")
            .remove(node_name);
    }
}

/// A node is managed unless it is unschedulable or explicitly opted out.
pub fn node_is_managed(node: &Node) -> bool {
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    let opted_out = node.labels().get(NODE_MANAGED_LABEL).map(String::as_str) == Some("false");
    !unschedulable && !opted_out
}

/// Devices whose advertised index is no longer present on the node.
fn stale_devices<'a>(
    existing: &'a [GPUDevice],
    advertised: &HashSet<String>,
) -> Vec<&'a GPUDevice> {
    existing
        .iter()
        .filter(|device| {
            device
                .labels()
                .get(LABEL_DEVICE_INDEX)
                .map_or(true, |index| !advertised.contains(index))
        })
        .collect()
}

/// Exponential backoff over consecutive failures, capped.
fn backoff_for(consecutive_failures: u32, base: Duration, cap: Duration) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(cap)
}

fn join_errors(errors: Vec<anyhow::Error>) -> anyhow::Error {
    let joined = errors
        .iter()
        .map(|e| format!("{e:#}"))
        .collect::<Vec<_>>()
        .join("; ");
    anyhow!("{} error(s) during reconciliation: {}", errors.len(), joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSpec;
    use kube::core::ObjectMeta;
    use std::collections::BTreeMap;

    fn node(labels: &[(&str, &str)], unschedulable: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-a".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn device(name: &str, index: Option<&str>) -> GPUDevice {
        let mut labels = BTreeMap::new();
        if let Some(index) = index {
            labels.insert(LABEL_DEVICE_INDEX.to_string(), index.to_string());
        }
        let mut device = GPUDevice::new(name, Default::default());
        device.metadata.labels = Some(labels);
        device
    }

    #[test]
    fn test_node_is_managed() {
        assert!(node_is_managed(&node(&[], false)));
        assert!(!node_is_managed(&node(&[], true)));
        assert!(!node_is_managed(&node(
            &[("gpu.inventory.dev/managed", "false")],
            false
        )));
        assert!(node_is_managed(&node(
            &[("gpu.inventory.dev/managed", "true")],
            false
        )));
    }

    #[test]
    fn test_stale_devices() {
        let advertised: HashSet<String> = ["0".to_string()].into_iter().collect();
        let devices = vec![
            device("node-a-0-10de-1db4", Some("0")),
            device("node-a-1-10de-1db4", Some("1")),
            device("node-a-x-10de-1db4", None),
        ];

        let stale = stale_devices(&devices, &advertised);
        let names: Vec<String> = stale.iter().map(|d| d.name_any()).collect();
        assert_eq!(names, vec!["node-a-1-10de-1db4", "node-a-x-10de-1db4"]);
    }

    #[test]
    fn test_backoff_progression() {
        let base = Duration::from_secs(30);
        let cap = Duration::from_secs(300);

        assert_eq!(backoff_for(1, base, cap), Duration::from_secs(30));
        assert_eq!(backoff_for(2, base, cap), Duration::from_secs(60));
        assert_eq!(backoff_for(3, base, cap), Duration::from_secs(120));
        assert_eq!(backoff_for(4, base, cap), Duration::from_secs(240));
        assert_eq!(backoff_for(5, base, cap), Duration::from_secs(300));
        assert_eq!(backoff_for(50, base, cap), Duration::from_secs(300));
    }

    #[test]
    fn test_join_errors_merges_messages() {
        let joined = join_errors(vec![anyhow!("first"), anyhow!("second")]);
        let message = format!("{joined}");
        assert!(message.contains("2 error(s)"));
        assert!(message.contains("first"));
        assert!(message.contains("second"));
    }
}
