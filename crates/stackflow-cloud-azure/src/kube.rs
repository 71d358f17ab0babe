//! Kubernetes provider for the workload pass
//!
//! Each workload resource carries its whole object under the `manifest`
//! property; the live object is reported back under the same key.

use crate::error::Result;
use crate::kubectl::Kubectl;
use async_trait::async_trait;
use serde_json::{Value, json};
use stackflow_cloud::{
    ActualState, AuthStatus, CloudError, CloudProvider, ConnectionDescriptor, ResolvedResource,
    ResourceKey, WorkloadTarget,
};
use stackflow_core::manifest::MANIFEST_PROPERTY;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::time::Instant;

/// Reported while a LoadBalancer service has no address yet
pub const INGRESS_PENDING: &str = "Pending...";

/// Kinds that are not namespaced
const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED.contains(&kind)
}

fn kind_of(key: &ResourceKey) -> std::result::Result<&str, CloudError> {
    key.resource_type
        .kind()
        .ok_or_else(|| CloudError::Configuration(format!("{} is not a Kubernetes object", key)))
}

fn namespace_of<'a>(key: &'a ResourceKey, kind: &str) -> Option<&'a str> {
    if is_cluster_scoped(kind) {
        None
    } else {
        key.scope.as_deref()
    }
}

/// External address of a LoadBalancer service, `None` for other objects
pub fn ingress_address(object: &Value) -> Option<String> {
    if object.get("kind").and_then(|k| k.as_str()) != Some("Service")
        || object.pointer("/spec/type").and_then(|t| t.as_str()) != Some("LoadBalancer")
    {
        return None;
    }
    let first = object.pointer("/status/loadBalancer/ingress/0");
    let address = first
        .and_then(|i| i.get("hostname").or_else(|| i.get("ip")))
        .and_then(|a| a.as_str())
        .filter(|a| !a.is_empty());
    Some(address.unwrap_or(INGRESS_PENDING).to_string())
}

pub fn actual_state(object: Value) -> ActualState {
    let mut state = ActualState::default();
    if let Some(uid) = object.pointer("/metadata/uid") {
        state = state.with_output("uid", uid.clone());
    }
    if let Some(ingress) = ingress_address(&object) {
        state = state.with_output("ingress", ingress);
    }
    state.properties = json!({ MANIFEST_PROPERTY: object });
    state
}

/// Object to apply: the declared manifest pinned to the key's name and
/// namespace
pub fn apply_document(resource: &ResolvedResource) -> std::result::Result<Value, CloudError> {
    let key = &resource.key;
    let kind = kind_of(key)?;
    let mut manifest = resource
        .property(MANIFEST_PROPERTY)
        .cloned()
        .filter(|m| m.is_object())
        .ok_or_else(|| {
            CloudError::Configuration(format!("{} has no {} object", resource.id, MANIFEST_PROPERTY))
        })?;

    if manifest.get("metadata").is_none_or(|m| !m.is_object()) {
        manifest["metadata"] = json!({});
    }
    manifest["metadata"]["name"] = json!(key.name);
    if let Some(ns) = namespace_of(key, kind) {
        manifest["metadata"]["namespace"] = json!(ns);
    }
    Ok(manifest)
}

/// Kubernetes provider bound to one cluster
pub struct KubeProvider {
    kubectl: Kubectl,
    // keeps a temporary kubeconfig alive for the provider's lifetime
    _kubeconfig: Option<NamedTempFile>,
    ingress_wait: Duration,
    poll_interval: Duration,
}

impl KubeProvider {
    pub fn new(kubectl: Kubectl) -> Self {
        Self {
            kubectl,
            _kubeconfig: None,
            ingress_wait: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Provider over a kubeconfig document, written to a private file
    pub fn from_kubeconfig(kubeconfig: &str, context: Option<String>) -> Result<Self> {
        let mut file = NamedTempFile::new()?;
        file.write_all(kubeconfig.as_bytes())?;
        file.flush()?;

        let mut provider = Self::new(Kubectl::new(file.path(), context));
        provider._kubeconfig = Some(file);
        Ok(provider)
    }

    /// How long to wait for a LoadBalancer address before reporting it pending
    pub fn with_ingress_wait(mut self, wait: Duration) -> Self {
        self.ingress_wait = wait;
        self
    }

    pub fn kubectl(&self) -> &Kubectl {
        &self.kubectl
    }

    async fn apply(&self, resource: &ResolvedResource) -> Result<ActualState> {
        let document = apply_document(resource)?;
        let mut applied = self.kubectl.apply(&document).await?;

        if ingress_address(&applied).as_deref() == Some(INGRESS_PENDING) {
            applied = self.wait_for_ingress(&resource.key, applied).await?;
        }
        Ok(actual_state(applied))
    }

    async fn wait_for_ingress(&self, key: &ResourceKey, mut object: Value) -> Result<Value> {
        let kind = kind_of(key)?;
        let namespace = namespace_of(key, kind);
        let deadline = Instant::now() + self.ingress_wait;

        while Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
            if let Some(live) = self.kubectl.get(kind, &key.name, namespace).await? {
                object = live;
            }
            if ingress_address(&object).as_deref() != Some(INGRESS_PENDING) {
                return Ok(object);
            }
            tracing::debug!("Waiting for an external address on {}", key);
        }
        tracing::warn!("{} has no external address yet", key);
        Ok(object)
    }
}

#[async_trait]
impl CloudProvider for KubeProvider {
    fn name(&self) -> &str {
        "kubernetes"
    }

    fn display_name(&self) -> &str {
        "Kubernetes"
    }

    async fn check_auth(&self) -> stackflow_cloud::Result<AuthStatus> {
        match self.kubectl.server_version().await {
            Ok(version) => Ok(AuthStatus::ok(format!("cluster {}", version))),
            Err(e) => Ok(AuthStatus::failed(e.to_string())),
        }
    }

    async fn read(&self, key: &ResourceKey) -> stackflow_cloud::Result<Option<ActualState>> {
        let kind = kind_of(key)?;
        let object = self
            .kubectl
            .get(kind, &key.name, namespace_of(key, kind))
            .await?;
        Ok(object.map(actual_state))
    }

    async fn create(&self, resource: &ResolvedResource) -> stackflow_cloud::Result<ActualState> {
        tracing::info!("Applying {}", resource.key);
        Ok(self.apply(resource).await?)
    }

    async fn update(
        &self,
        resource: &ResolvedResource,
        _actual: &ActualState,
    ) -> stackflow_cloud::Result<ActualState> {
        tracing::info!("Re-applying {}", resource.key);
        Ok(self.apply(resource).await?)
    }

    async fn delete(&self, key: &ResourceKey) -> stackflow_cloud::Result<()> {
        let kind = kind_of(key)?;
        tracing::info!("Deleting {}", key);
        Ok(self
            .kubectl
            .delete(kind, &key.name, namespace_of(key, kind))
            .await?)
    }
}

/// Connects the workload pass to a cluster through its kubeconfig
#[derive(Debug, Clone, Default)]
pub struct KubeTarget {
    ingress_wait: Option<Duration>,
}

impl KubeTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ingress_wait(mut self, wait: Duration) -> Self {
        self.ingress_wait = Some(wait);
        self
    }
}

#[async_trait]
impl WorkloadTarget for KubeTarget {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> stackflow_cloud::Result<Arc<dyn CloudProvider>> {
        let ConnectionDescriptor::Cluster(connection) = descriptor else {
            return Err(CloudError::Configuration(
                "workloads need cluster credentials, got a registry login".to_string(),
            ));
        };

        tracing::debug!("Connecting to {} as {}", connection.server, connection.user);
        let mut provider =
            KubeProvider::from_kubeconfig(&connection.kubeconfig, Some(connection.context.clone()))
                .map_err(CloudError::from)?;
        if let Some(wait) = self.ingress_wait {
            provider = provider.with_ingress_wait(wait);
        }
        Ok(Arc::new(provider))
    }
}
