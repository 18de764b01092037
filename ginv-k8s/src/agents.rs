//! Node agent sources
//!
//! Each GPU node runs two agent pods this controller consumes: a detection
//! agent serving a JSON snapshot of the installed GPUs, and a telemetry
//! exporter serving text-exposition metrics. Both are reached over plain
//! HTTP at the pod IP; both are behind traits so tests can install stubs.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::client::K8sClient;
use ginv_core::detection::{DetectionEntry, NodeDetection};
use ginv_core::telemetry::{parse_exporter_metrics, NodeTelemetry};

/// Namespace the agent pods run in.
pub const WORKLOADS_NAMESPACE: &str = "gpu-system";
/// `app` label of the detection agent pods.
pub const DETECTION_APP_LABEL: &str = "gfd-extender";
/// `app` label of the telemetry exporter pods.
pub const EXPORTER_APP_LABEL: &str = "dcgm-exporter";
/// Container of the detection agent that serves the API.
pub const DETECTION_CONTAINER: &str = "gfd-extender";
/// Detection endpoint path.
pub const DETECTION_PATH: &str = "/api/v1/detect/gpu";
/// Exporter metrics path.
pub const EXPORTER_PATH: &str = "/metrics";
/// Port the exporter listens on when its pod spec does not say.
pub const EXPORTER_DEFAULT_PORT: i32 = 9400;

/// Detection HTTP timeout.
pub const DETECTION_TIMEOUT: Duration = Duration::from_secs(2);
/// Telemetry scrape HTTP timeout.
pub const EXPORTER_TIMEOUT: Duration = Duration::from_secs(3);

/// Source of detection snapshots for a node.
#[async_trait]
pub trait DetectionSource: Send + Sync {
    async fn collect(&self, node: &str) -> Result<NodeDetection>;
}

/// Source of exporter telemetry for a node.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn collect(&self, node: &str) -> Result<NodeTelemetry>;
}

/// Resolved network endpoint of an agent pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub ip: String,
    pub port: i32,
}

impl AgentEndpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// First positive containerPort, optionally restricted to a named container.
fn pod_port(pod: &Pod, container: Option<&str>) -> Option<i32> {
    let containers = &pod.spec.as_ref()?.containers;
    containers
        .iter()
        .filter(|c| container.map_or(true, |name| c.name == name))
        .filter_map(|c| c.ports.as_ref())
        .flatten()
        .map(|p| p.container_port)
        .find(|port| *port > 0)
}

/// Pick the agent pod serving a node: scheduled there, carrying a pod IP,
/// Ready, and exposing a usable port. `default_port` covers agents that do
/// not declare their port.
pub fn select_agent_pod(
    pods: &[Pod],
    node: &str,
    container: Option<&str>,
    default_port: Option<i32>,
) -> Option<AgentEndpoint> {
    pods.iter().find_map(|pod| {
        let on_node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .is_some_and(|n| n == node);
        if !on_node || !pod_is_ready(pod) {
            return None;
        }

        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .filter(|ip| !ip.is_empty())?;
        let port = pod_port(pod, container).or(default_port)?;

        Some(AgentEndpoint { ip, port })
    })
}

pub(crate) async fn fetch_detection(
    http: &reqwest::Client,
    base: &str,
) -> Result<Vec<DetectionEntry>> {
    let url = format!("{}{}", base, DETECTION_PATH);
    let response = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Detection request to {} failed", url))?;

    if !response.status().is_success() {
        bail!("Detection agent returned HTTP {}", response.status());
    }

    response
        .json()
        .await
        .context("Failed to decode detection response")
}

pub(crate) async fn fetch_exporter_text(http: &reqwest::Client, base: &str) -> Result<String> {
    let url = format!("{}{}", base, EXPORTER_PATH);
    let response = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Telemetry scrape of {} failed", url))?;

    if !response.status().is_success() {
        bail!("Telemetry exporter returned HTTP {}", response.status());
    }

    response
        .text()
        .await
        .context("Failed to read telemetry response body")
}

/// Detection agent reached over pod-IP HTTP.
pub struct HttpDetectionSource {
    client: K8sClient,
    http: reqwest::Client,
    namespace: String,
    app_label: String,
}

impl HttpDetectionSource {
    pub fn new(
        client: K8sClient,
        namespace: String,
        app_label: String,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build detection HTTP client")?;
        Ok(Self {
            client,
            http,
            namespace,
            app_label,
        })
    }
}

#[async_trait]
impl DetectionSource for HttpDetectionSource {
    async fn collect(&self, node: &str) -> Result<NodeDetection> {
        let pods = self
            .client
            .list_app_pods(&self.namespace, &self.app_label)
            .await?;
        let endpoint = select_agent_pod(&pods, node, Some(DETECTION_CONTAINER), None)
            .with_context(|| format!("No ready {} pod found on node {}", self.app_label, node))?;

        debug!(node, endpoint = %endpoint.base_url(), "Fetching detection snapshot");
        let entries = fetch_detection(&self.http, &endpoint.base_url()).await?;
        Ok(NodeDetection::from_entries(entries))
    }
}

/// Telemetry exporter scraped over pod-IP HTTP.
pub struct HttpTelemetrySource {
    client: K8sClient,
    http: reqwest::Client,
    namespace: String,
    app_label: String,
}

impl HttpTelemetrySource {
    pub fn new(
        client: K8sClient,
        namespace: String,
        app_label: String,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build telemetry HTTP client")?;
        Ok(Self {
            client,
            http,
            namespace,
            app_label,
        })
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetrySource {
    async fn collect(&self, node: &str) -> Result<NodeTelemetry> {
        let pods = self
            .client
            .list_app_pods(&self.namespace, &self.app_label)
            .await?;
        let endpoint = select_agent_pod(&pods, node, None, Some(EXPORTER_DEFAULT_PORT))
            .with_context(|| format!("No ready {} pod found on node {}", self.app_label, node))?;

        debug!(node, endpoint = %endpoint.base_url(), "Scraping exporter");
        let body = fetch_exporter_text(&self.http, &endpoint.base_url()).await?;
        Ok(parse_exporter_metrics(&body))
    }
}

/// Static detection source for tests.
pub struct MockDetectionSource {
    pub entries: Vec<DetectionEntry>,
    pub fail: bool,
}

impl MockDetectionSource {
    pub fn new(entries: Vec<DetectionEntry>) -> Self {
        Self {
            entries,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            entries: Vec::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl DetectionSource for MockDetectionSource {
    async fn collect(&self, _node: &str) -> Result<NodeDetection> {
        if self.fail {
            bail!("mock detection source failure");
        }
        Ok(NodeDetection::from_entries(self.entries.clone()))
    }
}

/// Static telemetry source for tests.
pub struct MockTelemetrySource {
    pub body: String,
    pub fail: bool,
}

impl MockTelemetrySource {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            body: String::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl TelemetrySource for MockTelemetrySource {
    async fn collect(&self, _node: &str) -> Result<NodeTelemetry> {
        if self.fail {
            bail!("mock telemetry source failure");
        }
        Ok(parse_exporter_metrics(&self.body))
    }
}
