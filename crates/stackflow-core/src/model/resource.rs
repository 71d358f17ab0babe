//! Resource declarations

use super::value::{CredentialRef, PropertyValue};
use crate::error::StackError;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const MINUTE: u64 = 60;

/// Type tag of a declared resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceType {
    ResourceGroup,
    ContainerRegistry,
    ManagedCluster,
    RoleAssignment,
    AppServicePlan,
    WebApp,
    /// Namespaced workloads applied against a freshly provisioned cluster
    WorkloadSet,
    /// Kubernetes object of the given kind (Namespace, Deployment, ...)
    Kubernetes(String),
}

impl ResourceType {
    pub fn kubernetes(kind: impl Into<String>) -> Self {
        ResourceType::Kubernetes(kind.into())
    }

    /// Timeout applied when neither the resource nor the stack overrides it
    pub fn default_timeout(&self) -> Duration {
        let minutes = match self {
            ResourceType::ManagedCluster => 60,
            ResourceType::WorkloadSet => 30,
            ResourceType::ContainerRegistry | ResourceType::WebApp => 20,
            ResourceType::AppServicePlan => 15,
            ResourceType::Kubernetes(_) => 10,
            ResourceType::ResourceGroup | ResourceType::RoleAssignment => 5,
        };
        Duration::from_secs(minutes * MINUTE)
    }

    pub fn is_kubernetes(&self) -> bool {
        matches!(self, ResourceType::Kubernetes(_))
    }

    /// Kubernetes kind, if this is a Kubernetes object
    pub fn kind(&self) -> Option<&str> {
        match self {
            ResourceType::Kubernetes(kind) => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::ResourceGroup => write!(f, "resource-group"),
            ResourceType::ContainerRegistry => write!(f, "container-registry"),
            ResourceType::ManagedCluster => write!(f, "managed-cluster"),
            ResourceType::RoleAssignment => write!(f, "role-assignment"),
            ResourceType::AppServicePlan => write!(f, "app-service-plan"),
            ResourceType::WebApp => write!(f, "web-app"),
            ResourceType::WorkloadSet => write!(f, "workload-set"),
            ResourceType::Kubernetes(kind) => write!(f, "kubernetes/{}", kind),
        }
    }
}

impl FromStr for ResourceType {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resource-group" => Ok(ResourceType::ResourceGroup),
            "container-registry" => Ok(ResourceType::ContainerRegistry),
            "managed-cluster" => Ok(ResourceType::ManagedCluster),
            "role-assignment" => Ok(ResourceType::RoleAssignment),
            "app-service-plan" => Ok(ResourceType::AppServicePlan),
            "web-app" => Ok(ResourceType::WebApp),
            "workload-set" => Ok(ResourceType::WorkloadSet),
            other => match other.strip_prefix("kubernetes/") {
                Some(kind) if !kind.is_empty() => Ok(ResourceType::kubernetes(kind)),
                _ => Err(StackError::InvalidConfig(format!(
                    "unknown resource type: {}",
                    other
                ))),
            },
        }
    }
}

/// Desired-state description of a single resource
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Stack-unique identifier used in references and reports
    pub id: String,

    pub resource_type: ResourceType,

    /// Name of the resource on the provider side
    pub name: String,

    /// Provider scope (resource group, namespace, role scope)
    pub scope: Option<PropertyValue>,

    /// Declared properties, literal or deferred
    pub properties: BTreeMap<String, PropertyValue>,

    /// Explicit `dependsOn` edges
    pub depends_on: Vec<String>,

    /// Per-resource operation timeout override
    pub timeout: Option<Duration>,
}

impl Resource {
    pub fn new(
        id: impl Into<String>,
        resource_type: ResourceType,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type,
            name: name.into(),
            scope: None,
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_scope(mut self, scope: PropertyValue) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_literal(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_property(key, PropertyValue::Literal(value.into()))
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resources referenced through scope or properties (implicit edges)
    pub fn references(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        if let Some(scope) = &self.scope {
            ids.extend(scope.references());
        }
        for value in self.properties.values() {
            ids.extend(value.references());
        }
        ids
    }

    /// Explicit and implicit dependencies together
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut ids = self.references();
        ids.extend(self.depends_on.iter().cloned());
        ids
    }

    pub fn credential_refs(&self) -> Vec<&CredentialRef> {
        self.properties
            .values()
            .flat_map(|v| v.credential_refs())
            .collect()
    }

    pub fn effective_timeout(&self) -> Duration {
        self.timeout
            .unwrap_or_else(|| self.resource_type.default_timeout())
    }
}
