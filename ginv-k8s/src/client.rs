//! Kubernetes Client wrapper
//!
//! Provides a simplified interface to the Kubernetes API for the inventory
//! controller: typed accessors, node lookup that distinguishes "gone" from
//! errors, and label-scoped device listing and deletion.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, ListParams};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::crd::{GPUDevice, NodeFeature};
use ginv_core::naming::LABEL_DEVICE_NODE;

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct K8sClient {
    client: Client,
}

impl K8sClient {
    /// Create a new K8s client using in-cluster config
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;

        info!("Connected to Kubernetes API server");
        Ok(Self { client })
    }

    /// Create a new K8s client with custom config
    pub async fn with_config(config: Config) -> Result<Self> {
        let client = Client::try_from(config)
            .context("Failed to create Kubernetes client from config")?;

        Ok(Self { client })
    }

    /// Get the underlying kube client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get node API
    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    /// Get pods API for a namespace
    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Get GPU device API
    pub fn gpu_devices(&self) -> Api<GPUDevice> {
        Api::all(self.client.clone())
    }

    /// Get node-feature API across all namespaces
    pub fn node_features(&self) -> Api<NodeFeature> {
        Api::all(self.client.clone())
    }

    /// Get a node by name; a missing node is not an error.
    pub async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        self.nodes()
            .get_opt(name)
            .await
            .with_context(|| format!("Failed to get node: {}", name))
    }

    /// Check if the API server is reachable
    pub async fn health_check(&self) -> Result<()> {
        let _ = self
            .nodes()
            .list(&ListParams::default().limit(1))
            .await
            .context("Failed to list nodes")?;
        Ok(())
    }

    /// List the device records labeled with a node.
    pub async fn list_node_devices(&self, node: &str) -> Result<Vec<GPUDevice>> {
        let params = ListParams::default().labels(&format!("{}={}", LABEL_DEVICE_NODE, node));

        let devices = self
            .gpu_devices()
            .list(&params)
            .await
            .with_context(|| format!("Failed to list devices of node: {}", node))?;

        Ok(devices.items)
    }

    /// Delete a device record. Already-gone records are fine; the cluster
    /// garbage collector may have raced us on node deletion.
    pub async fn delete_device(&self, name: &str) -> Result<()> {
        match self
            .gpu_devices()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(device = name, "Device record deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(device = name, "Device record already gone");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to delete device: {}", name)),
        }
    }

    /// List pods of one agent app in a namespace.
    pub async fn list_app_pods(&self, namespace: &str, app: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&format!("app={}", app));

        let pods = self
            .pods(namespace)
            .list(&params)
            .await
            .with_context(|| format!("Failed to list {} pods in {}", app, namespace))?;

        Ok(pods.items)
    }
}
