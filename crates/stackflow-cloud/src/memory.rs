//! In-memory provider
//!
//! Holds resources in a map keyed like a real provider and answers credential
//! requests from that map. Faults, latency and call timings can be injected
//! per resource name, which is what the engine tests build on.

use crate::credentials::ConnectionDescriptor;
use crate::error::{CloudError, Result};
use crate::provider::{
    ActualState, AuthStatus, CloudProvider, CredentialSource, CredentialTarget, ResolvedResource,
    ResourceKey, WorkloadTarget,
};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use stackflow_core::model::{CredentialScope, ResourceType};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const SUBSCRIPTION: &str = "/subscriptions/00000000-0000-0000-0000-000000000000";

/// Provider operation, for fault injection and the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Read,
    Create,
    Update,
    Delete,
}

/// One finished provider call
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub op: Op,
    pub name: String,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Default)]
struct Inner {
    resources: BTreeMap<ResourceKey, ActualState>,
    faults: HashMap<(Op, String), VecDeque<CloudError>>,
    delays: HashMap<String, Duration>,
    retained: HashSet<String>,
    calls: Vec<CallRecord>,
    credentials: HashMap<String, Vec<String>>,
    credential_fetches: usize,
    credential_delay: Option<Duration>,
}

/// Provider that keeps every resource in process memory
pub struct MemoryProvider {
    name: String,
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking test thread must not hide the state from the others
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `times` calls of `op` on the resource called `name`
    pub fn fail_next(&self, op: Op, name: &str, error: CloudError, times: usize) {
        let mut inner = self.lock();
        let queue = inner.faults.entry((op, name.to_string())).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Make mutating calls on `name` take `delay`
    pub fn delay(&self, name: &str, delay: Duration) {
        self.lock().delays.insert(name.to_string(), delay);
    }

    /// Deleting `name` reports success but leaves the resource in place
    pub fn retain_on_delete(&self, name: &str) {
        self.lock().retained.insert(name.to_string());
    }

    /// Payloads returned for credential requests on `name`, instead of
    /// synthesized ones
    pub fn set_credentials(&self, name: &str, payloads: Vec<String>) {
        self.lock().credentials.insert(name.to_string(), payloads);
    }

    /// Make every credential fetch take `delay`
    pub fn delay_credentials(&self, delay: Duration) {
        self.lock().credential_delay = Some(delay);
    }

    /// Replace the stored state of a resource, as an out-of-band change would
    pub fn put(&self, key: ResourceKey, state: ActualState) {
        self.lock().resources.insert(key, state);
    }

    /// Stored resource called `name`, whatever its type and scope
    pub fn find(&self, name: &str) -> Option<(ResourceKey, ActualState)> {
        self.lock()
            .resources
            .iter()
            .find(|(key, _)| key.name == name)
            .map(|(key, state)| (key.clone(), state.clone()))
    }

    pub fn get(&self, key: &ResourceKey) -> Option<ActualState> {
        self.lock().resources.get(key).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().resources.is_empty()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    /// Names touched by `op`, in completion order
    pub fn calls_of(&self, op: Op) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Most mutating calls observed in flight at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn credential_fetches(&self) -> usize {
        self.lock().credential_fetches
    }

    fn take_fault(&self, op: Op, name: &str) -> Option<CloudError> {
        self.lock()
            .faults
            .get_mut(&(op, name.to_string()))
            .and_then(|queue| queue.pop_front())
    }

    async fn call<T>(&self, op: Op, name: &str, body: impl FnOnce(&mut Inner) -> T) -> Result<T> {
        let started = Instant::now();
        let mutating = op != Op::Read;
        if mutating {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = self.lock().delays.get(name).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        let result = match self.take_fault(op, name) {
            Some(error) => Err(error),
            None => Ok(body(&mut self.lock())),
        };

        if mutating {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        self.lock().calls.push(CallRecord {
            op,
            name: name.to_string(),
            started,
            finished: Instant::now(),
        });
        result
    }
}

fn arm_id(key: &ResourceKey) -> String {
    let group = key.scope.as_deref().unwrap_or_default();
    let provider = match &key.resource_type {
        ResourceType::ResourceGroup => return format!("{}/resourceGroups/{}", SUBSCRIPTION, key.name),
        ResourceType::ContainerRegistry => "Microsoft.ContainerRegistry/registries",
        ResourceType::ManagedCluster => "Microsoft.ContainerService/managedClusters",
        ResourceType::RoleAssignment => {
            return format!("{}/providers/Microsoft.Authorization/roleAssignments/{}", group, key.name);
        }
        ResourceType::AppServicePlan => "Microsoft.Web/serverfarms",
        ResourceType::WebApp => "Microsoft.Web/sites",
        ResourceType::WorkloadSet | ResourceType::Kubernetes(_) => {
            return format!("{}/{}/{}", group, key.resource_type, key.name);
        }
    };
    format!(
        "{}/resourceGroups/{}/providers/{}/{}",
        SUBSCRIPTION, group, provider, key.name
    )
}

/// State a real provider would report right after create or update
fn provisioned(resource: &ResolvedResource) -> ActualState {
    let key = &resource.key;
    let mut properties = resource.properties.clone();
    if let Value::Object(map) = &mut properties {
        map.insert("provisioningState".to_string(), json!("Succeeded"));
    }

    let mut state = ActualState::new(properties).with_output("id", arm_id(key));
    match &key.resource_type {
        ResourceType::ContainerRegistry => {
            state = state.with_output("loginServer", format!("{}.azurecr.io", key.name));
        }
        ResourceType::ManagedCluster => {
            state = state
                .with_output("kubeletIdentityObjectId", format!("kubelet-{}", key.name))
                .with_output("fqdn", format!("{}.hcp.azmk8s.io", key.name));
        }
        ResourceType::WebApp => {
            state = state.with_output("defaultHostName", format!("{}.azurewebsites.net", key.name));
        }
        ResourceType::Kubernetes(kind) if kind == "Service" => {
            let service_type = resource
                .properties
                .pointer("/manifest/spec/type")
                .and_then(|v| v.as_str());
            if service_type == Some("LoadBalancer") {
                state = state.with_output("ingress", "203.0.113.10");
            }
        }
        _ => {}
    }
    state
}

/// Kubeconfig a cluster called `name` would hand out
pub fn synthetic_kubeconfig(name: &str, scope: CredentialScope) -> String {
    let user = match scope {
        CredentialScope::Admin => format!("clusterAdmin_{}", name),
        CredentialScope::User => format!("clusterUser_{}", name),
    };
    format!(
        "apiVersion: v1\nkind: Config\nclusters:\n- cluster:\n    server: https://{name}.hcp.azmk8s.io:443\n  name: {name}\ncontexts:\n- context:\n    cluster: {name}\n    user: {user}\n  name: {name}\ncurrent-context: {name}\nusers:\n- name: {user}\n  user:\n    token: memory\n"
    )
}

#[async_trait]
impl CloudProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        "In-memory"
    }

    async fn check_auth(&self) -> Result<AuthStatus> {
        Ok(AuthStatus::ok(format!("memory:{}", self.name)))
    }

    async fn read(&self, key: &ResourceKey) -> Result<Option<ActualState>> {
        self.call(Op::Read, &key.name, |inner| inner.resources.get(key).cloned())
            .await
    }

    async fn create(&self, resource: &ResolvedResource) -> Result<ActualState> {
        self.call(Op::Create, &resource.key.name, |inner| {
            let state = provisioned(resource);
            inner.resources.insert(resource.key.clone(), state.clone());
            state
        })
        .await
    }

    async fn update(&self, resource: &ResolvedResource, actual: &ActualState) -> Result<ActualState> {
        self.call(Op::Update, &resource.key.name, |inner| {
            let mut state = provisioned(resource);
            // properties the declaration does not mention are kept
            if let (Value::Object(merged), Value::Object(previous)) =
                (&mut state.properties, &actual.properties)
            {
                for (k, v) in previous {
                    merged.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            inner.resources.insert(resource.key.clone(), state.clone());
            state
        })
        .await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        self.call(Op::Delete, &key.name, |inner| {
            if !inner.retained.contains(&key.name) {
                inner.resources.remove(key);
            }
        })
        .await
    }
}

#[async_trait]
impl CredentialSource for MemoryProvider {
    async fn fetch(&self, target: &CredentialTarget) -> Result<Vec<String>> {
        let delay = self.lock().credential_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.lock();
        inner.credential_fetches += 1;
        let key = target.key();
        if let Some(payloads) = inner.credentials.get(&key.name) {
            return Ok(payloads.clone());
        }
        if !inner.resources.contains_key(key) {
            return Err(CloudError::ResourceNotFound(key.to_string()));
        }
        let payload = match target {
            CredentialTarget::Cluster { scope, .. } => synthetic_kubeconfig(&key.name, *scope),
            CredentialTarget::Registry { .. } => format!("{}:password-{}", key.name, key.name),
        };
        Ok(vec![STANDARD.encode(payload)])
    }
}

/// Workload target that hands out the same in-memory provider for any
/// cluster descriptor
pub struct MemoryTarget {
    provider: Arc<MemoryProvider>,
    connections: Mutex<Vec<String>>,
}

impl MemoryTarget {
    pub fn new(provider: Arc<MemoryProvider>) -> Self {
        Self {
            provider,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// API servers connected to so far
    pub fn connections(&self) -> Vec<String> {
        self.connections
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkloadTarget for MemoryTarget {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn CloudProvider>> {
        let ConnectionDescriptor::Cluster(connection) = descriptor else {
            return Err(CloudError::InvalidConfig(
                "workloads need a cluster connection".to_string(),
            ));
        };
        if let Ok(mut connections) = self.connections.lock() {
            connections.push(connection.server.clone());
        }
        Ok(self.provider.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::decode_payload;

    fn registry() -> ResolvedResource {
        ResolvedResource {
            id: "container-registry".to_string(),
            key: ResourceKey::new(
                ResourceType::ContainerRegistry,
                Some("demo-rg".to_string()),
                "demoacr",
            ),
            properties: json!({ "sku": { "name": "Basic" }, "adminUserEnabled": true }),
        }
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let provider = MemoryProvider::new("azure");
        let resource = registry();

        assert!(provider.read(&resource.key).await.unwrap().is_none());
        let state = provider.create(&resource).await.unwrap();
        assert_eq!(state.outputs["loginServer"], json!("demoacr.azurecr.io"));
        assert!(state.matches(&resource.properties));

        let read = provider.read(&resource.key).await.unwrap().unwrap();
        assert_eq!(read, state);

        provider.delete(&resource.key).await.unwrap();
        assert!(provider.is_empty());
        assert_eq!(
            provider.calls_of(Op::Read),
            vec!["demoacr".to_string(), "demoacr".to_string()]
        );
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed() {
        let provider = MemoryProvider::new("azure");
        provider.fail_next(
            Op::Create,
            "demoacr",
            CloudError::RateLimited("429".to_string()),
            1,
        );

        assert!(provider.create(&registry()).await.is_err());
        assert!(provider.create(&registry()).await.is_ok());
    }

    #[tokio::test]
    async fn test_credentials_decode() {
        let provider = MemoryProvider::new("azure");
        let resource = registry();
        let target = CredentialTarget::Registry {
            key: resource.key.clone(),
        };
        assert!(provider.fetch(&target).await.is_err());

        provider.create(&resource).await.unwrap();
        let payloads = provider.fetch(&target).await.unwrap();
        let ConnectionDescriptor::Registry(login) =
            decode_payload("container-registry", &target, &payloads[0]).unwrap()
        else {
            panic!("expected registry login");
        };
        assert_eq!(login.username, "demoacr");

        let cluster = CredentialTarget::Cluster {
            key: ResourceKey::new(ResourceType::ManagedCluster, None, "aks"),
            scope: CredentialScope::Admin,
        };
        provider.put(cluster.key().clone(), ActualState::default());
        let payloads = provider.fetch(&cluster).await.unwrap();
        let ConnectionDescriptor::Cluster(conn) =
            decode_payload("aks-cluster", &cluster, &payloads[0]).unwrap()
        else {
            panic!("expected cluster connection");
        };
        assert_eq!(conn.server, "https://aks.hcp.azmk8s.io:443");
        assert_eq!(conn.user, "clusterAdmin_aks");
        assert_eq!(provider.credential_fetches(), 3);
    }
}
