//! Cloud provider trait definition

use crate::credentials::ConnectionDescriptor;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stackflow_core::model::{CredentialScope, ResourceType};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Output properties of a settled resource
pub type Outputs = BTreeMap<String, Value>;

/// Cloud provider abstraction trait
///
/// Resources are addressed by `(type, scope, name)`; `read` reports
/// `Ok(None)` when the resource does not exist.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Returns the provider name (e.g., "azure", "kubernetes")
    fn name(&self) -> &str;

    /// Returns the provider display name for UI
    fn display_name(&self) -> &str;

    /// Check if the provider is properly configured and authenticated
    async fn check_auth(&self) -> Result<AuthStatus>;

    /// Current state of a resource, `None` when it does not exist
    async fn read(&self, key: &ResourceKey) -> Result<Option<ActualState>>;

    /// Create the resource. Creating a resource that already matches is a no-op
    async fn create(&self, resource: &ResolvedResource) -> Result<ActualState>;

    /// Bring an existing resource in line with the desired properties
    async fn update(&self, resource: &ResolvedResource, actual: &ActualState)
    -> Result<ActualState>;

    /// Delete the resource; deleting a missing resource succeeds
    async fn delete(&self, key: &ResourceKey) -> Result<()>;
}

/// Which credentials to fetch for a settled resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialTarget {
    Cluster {
        key: ResourceKey,
        scope: CredentialScope,
    },
    Registry {
        key: ResourceKey,
    },
}

impl CredentialTarget {
    pub fn key(&self) -> &ResourceKey {
        match self {
            CredentialTarget::Cluster { key, .. } | CredentialTarget::Registry { key } => key,
        }
    }
}

/// Credential endpoint: zero or more base64 payloads for a target
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, target: &CredentialTarget) -> Result<Vec<String>>;
}

/// Binds a resolved connection descriptor to a provider for the workload pass
#[async_trait]
pub trait WorkloadTarget: Send + Sync {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn CloudProvider>>;
}

/// Authentication status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether authentication is valid
    pub authenticated: bool,

    /// Account/user information if available
    pub account_info: Option<String>,

    /// Error message if not authenticated
    pub error: Option<String>,
}

impl AuthStatus {
    pub fn ok(account_info: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account_info: Some(account_info.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account_info: None,
            error: Some(error.into()),
        }
    }
}

/// Provider-side address of a resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    /// Resource group, registry id or namespace
    pub scope: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, scope: Option<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type,
            scope,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}/{}", self.resource_type, scope, self.name),
            None => write!(f, "{}:{}", self.resource_type, self.name),
        }
    }
}

/// A resource whose deferred properties have all been resolved
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResource {
    pub id: String,
    pub key: ResourceKey,
    /// JSON object of desired properties
    pub properties: Value,
}

impl ResolvedResource {
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

/// State reported by the provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActualState {
    /// Properties as the provider reports them
    pub properties: Value,
    /// Provider-assigned outputs (id, loginServer, identity ids, ...)
    pub outputs: Outputs,
}

impl ActualState {
    pub fn new(properties: Value) -> Self {
        Self {
            properties,
            outputs: Outputs::new(),
        }
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }

    /// Whether every desired property is already present with the same value
    pub fn matches(&self, desired: &Value) -> bool {
        is_subset(desired, &self.properties)
    }

    /// Outputs visible to dependents: top-level properties, the name, then
    /// provider outputs, later entries winning
    pub fn settled_outputs(&self, key: &ResourceKey) -> Outputs {
        let mut outputs = Outputs::new();
        if let Value::Object(map) = &self.properties {
            for (k, v) in map {
                outputs.insert(k.clone(), v.clone());
            }
        }
        outputs.insert("name".to_string(), Value::String(key.name.clone()));
        outputs.extend(self.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        outputs
    }
}

/// `desired` is contained in `actual`.
///
/// Objects match key by key (extra actual keys are ignored), arrays must have
/// the same length with every desired element matching a distinct actual
/// element, scalars compare equal. Numbers given as strings on one side match
/// their numeric form on the other.
pub fn is_subset(desired: &Value, actual: &Value) -> bool {
    match (desired, actual) {
        (Value::Object(d), Value::Object(a)) => d
            .iter()
            .all(|(k, dv)| a.get(k).is_some_and(|av| is_subset(dv, av))),
        (Value::Array(d), Value::Array(a)) => {
            if d.len() != a.len() {
                return false;
            }
            let mut used = vec![false; a.len()];
            d.iter().all(|dv| {
                let found = a
                    .iter()
                    .enumerate()
                    .find(|(i, av)| !used[*i] && is_subset(dv, av))
                    .map(|(i, _)| i);
                match found {
                    Some(i) => {
                        used[i] = true;
                        true
                    }
                    None => false,
                }
            })
        }
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        (d, a) => d == a,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subset_ignores_extra_actual_fields() {
        let desired = json!({ "sku": { "name": "Basic" }, "adminUserEnabled": true });
        let actual = json!({
            "sku": { "name": "Basic", "tier": "Basic" },
            "adminUserEnabled": true,
            "provisioningState": "Succeeded"
        });
        assert!(is_subset(&desired, &actual));
        assert!(!is_subset(&actual, &desired));
    }

    #[test]
    fn test_subset_detects_drift() {
        let desired = json!({ "spec": { "replicas": 3 } });
        let actual = json!({ "spec": { "replicas": 2 } });
        assert!(!is_subset(&desired, &actual));
    }

    #[test]
    fn test_subset_arrays_are_order_insensitive() {
        let desired = json!([{ "name": "PORT", "value": "3001" }, { "name": "NODE_ENV" }]);
        let actual = json!([
            { "name": "NODE_ENV", "value": "production" },
            { "name": "PORT", "value": "3001" }
        ]);
        assert!(is_subset(&desired, &actual));

        let shorter = json!([{ "name": "PORT" }]);
        assert!(!is_subset(&shorter, &actual));
    }

    #[test]
    fn test_subset_numeric_strings() {
        assert!(is_subset(&json!(30), &json!("30")));
        assert!(is_subset(&json!("3001"), &json!(3001)));
        assert!(!is_subset(&json!("3001"), &json!(3000)));
    }

    #[test]
    fn test_settled_outputs_layering() {
        let key = ResourceKey::new(ResourceType::ContainerRegistry, Some("rg".into()), "acr");
        let state = ActualState::new(json!({ "sku": { "name": "Basic" }, "name": "stale" }))
            .with_output("loginServer", "acr.azurecr.io");

        let outputs = state.settled_outputs(&key);
        assert_eq!(outputs["name"], json!("acr"));
        assert_eq!(outputs["loginServer"], json!("acr.azurecr.io"));
        assert_eq!(outputs["sku"], json!({ "name": "Basic" }));
    }

    #[test]
    fn test_resource_key_display() {
        let key = ResourceKey::new(ResourceType::ManagedCluster, Some("demo-rg".into()), "aks");
        assert_eq!(key.to_string(), "managed-cluster:demo-rg/aks");
        let key = ResourceKey::new(ResourceType::ResourceGroup, None, "demo-rg");
        assert_eq!(key.to_string(), "resource-group:demo-rg");
    }
}
