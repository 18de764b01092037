//! Configuration module for GINV
//!
//! Handles loading and validating configuration from YAML files.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use ginv_core::approval::{ApprovalMode, ApprovalPolicy, LabelSelectorConfig};

/// Approval policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Approval mode: manual, automatic, or selector. Unknown values fall
    /// back to manual.
    #[serde(default = "default_approval_mode")]
    pub mode: String,

    /// Node label selector consulted in selector mode
    #[serde(default)]
    pub selector: Option<LabelSelectorConfig>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            mode: default_approval_mode(),
            selector: None,
        }
    }
}

impl ApprovalConfig {
    /// Compile the approval policy. A bad selector is fatal at startup.
    pub fn build_policy(&self) -> Result<ApprovalPolicy> {
        let mode = ApprovalMode::parse(&self.mode);
        ApprovalPolicy::new(mode, self.selector.as_ref())
            .context("Invalid approval selector")
    }
}

/// One node agent endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// `app` label of the agent pods
    pub app_label: String,

    /// HTTP timeout for requests to the agent
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// Requeue backoff after agent source failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequeueConfig {
    /// First retry delay
    #[serde(with = "humantime_serde", default = "default_requeue_base")]
    pub base: Duration,

    /// Backoff cap across consecutive failures
    #[serde(with = "humantime_serde", default = "default_requeue_cap")]
    pub cap: Duration,
}

impl Default for RequeueConfig {
    fn default() -> Self {
        Self {
            base: default_requeue_base(),
            cap: default_requeue_cap(),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port to expose metrics on
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of parallel reconcile workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Namespace the agent pods run in
    #[serde(default = "default_workloads_namespace")]
    pub workloads_namespace: String,

    /// Approval policy for discovered devices
    #[serde(default)]
    pub approval: ApprovalConfig,

    /// Telemetry exporter agent
    #[serde(default = "default_telemetry_agent")]
    pub telemetry: AgentConfig,

    /// Detection agent
    #[serde(default = "default_detection_agent")]
    pub detection: AgentConfig,

    /// Requeue backoff after source failures
    #[serde(default)]
    pub requeue: RequeueConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            workloads_namespace: default_workloads_namespace(),
            approval: ApprovalConfig::default(),
            telemetry: default_telemetry_agent(),
            detection: default_detection_agent(),
            requeue: RequeueConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be > 0");
        }
        if self.workloads_namespace.is_empty() {
            anyhow::bail!("workloads_namespace must not be empty");
        }
        if self.telemetry.timeout.is_zero() || self.detection.timeout.is_zero() {
            anyhow::bail!("agent timeouts must be > 0");
        }
        if self.requeue.base.is_zero() || self.requeue.base > self.requeue.cap {
            anyhow::bail!("requeue.base must be > 0 and <= requeue.cap");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        Ok(())
    }
}

// Default value functions
fn default_workers() -> usize {
    4
}

fn default_workloads_namespace() -> String {
    ginv_k8s::agents::WORKLOADS_NAMESPACE.to_string()
}

fn default_approval_mode() -> String {
    "manual".to_string()
}

fn default_telemetry_agent() -> AgentConfig {
    AgentConfig {
        app_label: ginv_k8s::agents::EXPORTER_APP_LABEL.to_string(),
        timeout: ginv_k8s::agents::EXPORTER_TIMEOUT,
    }
}

fn default_detection_agent() -> AgentConfig {
    AgentConfig {
        app_label: ginv_k8s::agents::DETECTION_APP_LABEL.to_string(),
        timeout: ginv_k8s::agents::DETECTION_TIMEOUT,
    }
}

fn default_requeue_base() -> Duration {
    Duration::from_secs(30)
}

fn default_requeue_cap() -> Duration {
    Duration::from_secs(300)
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_true() -> bool {
    true
}
