//! Stack configuration
//!
//! One parameterised description covers every deployment variant: an AKS
//! cluster with or without inline workloads, with admin or user credentials,
//! or a pair of App Service web apps.

use crate::error::{Result, StackError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LOCATION: &str = "eastus";
pub const DEFAULT_NODE_SIZE: &str = "Standard_D2s_v5";
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Deployment target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    /// Managed Kubernetes cluster
    #[default]
    Cluster,
    /// App Service web apps running containers
    AppService,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Cluster => write!(f, "cluster"),
            Platform::AppService => write!(f, "app-service"),
        }
    }
}

impl FromStr for Platform {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cluster" | "aks" | "kubernetes" => Ok(Platform::Cluster),
            "app-service" | "appservice" | "webapp" => Ok(Platform::AppService),
            other => Err(StackError::InvalidConfig(format!(
                "unknown platform '{}' (expected cluster or app-service)",
                other
            ))),
        }
    }
}

/// Which cluster credentials are fetched for the workload pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialScope {
    Admin,
    #[default]
    User,
}

impl fmt::Display for CredentialScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialScope::Admin => write!(f, "admin"),
            CredentialScope::User => write!(f, "user"),
        }
    }
}

impl FromStr for CredentialScope {
    type Err = StackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(CredentialScope::Admin),
            "user" => Ok(CredentialScope::User),
            other => Err(StackError::InvalidConfig(format!(
                "unknown credential scope '{}' (expected admin or user)",
                other
            ))),
        }
    }
}

/// System node pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    pub vm_size: String,
    pub count: u32,
    pub os_disk_size_gb: Option<u32>,
    pub enable_auto_scaling: bool,
}

impl Default for NodePool {
    fn default() -> Self {
        Self {
            name: "agentpool".to_string(),
            vm_size: DEFAULT_NODE_SIZE.to_string(),
            count: 1,
            os_disk_size_gb: Some(30),
            enable_auto_scaling: false,
        }
    }
}

/// Cluster network settings (Azure CNI)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkProfile {
    pub network_plugin: String,
    pub network_policy: String,
    pub load_balancer_sku: String,
    pub service_cidr: String,
    pub dns_service_ip: String,
}

impl Default for NetworkProfile {
    fn default() -> Self {
        Self {
            network_plugin: "azure".to_string(),
            network_policy: "azure".to_string(),
            load_balancer_sku: "standard".to_string(),
            service_cidr: "10.0.0.0/16".to_string(),
            dns_service_ip: "10.0.0.10".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    /// Defaults to `<name>-dns`
    pub dns_prefix: Option<String>,
    pub node_pool: NodePool,
    pub credential_scope: CredentialScope,
    pub network: Option<NetworkProfile>,
    pub enable_rbac: bool,
    /// Grant the kubelet identity AcrPull on the registry
    pub grant_registry_pull: bool,
}

impl ClusterConfig {
    pub fn dns_prefix(&self) -> String {
        self.dns_prefix
            .clone()
            .unwrap_or_else(|| format!("{}-dns", self.name))
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "microservices-aks".to_string(),
            dns_prefix: None,
            node_pool: NodePool::default(),
            credential_scope: CredentialScope::default(),
            network: None,
            enable_rbac: true,
            grant_registry_pull: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub name: String,
    pub sku: String,
    pub admin_user_enabled: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            name: "microservicesacr".to_string(),
            sku: "Basic".to_string(),
            admin_user_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppServiceConfig {
    pub plan_name: String,
    pub sku: String,
    pub tier: String,
    pub capacity: u32,
    pub backend_app_name: String,
    pub frontend_app_name: String,
    pub backend_port: u16,
    pub frontend_port: u16,
}

impl Default for AppServiceConfig {
    fn default() -> Self {
        Self {
            plan_name: "microservices-plan".to_string(),
            sku: "B1".to_string(),
            tier: "Basic".to_string(),
            capacity: 1,
            backend_app_name: "microservices-backend".to_string(),
            frontend_app_name: "microservices-frontend".to_string(),
            backend_port: 3001,
            frontend_port: 3000,
        }
    }
}

/// Source of the namespaced workload definitions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestSet {
    /// Built-in namespace, config map, two deployments and two services
    #[default]
    Demo,
    /// YAML manifest files, relative to the stack file
    Files(Vec<PathBuf>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// When disabled, workloads are left to an external process
    pub enabled: bool,
    pub namespace: String,
    pub replicas: u32,
    pub backend_image: String,
    pub frontend_image: String,
    pub manifests: ManifestSet,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "microservices-demo".to_string(),
            replicas: 2,
            backend_image: "backend-service:latest".to_string(),
            frontend_image: "frontend-service:latest".to_string(),
            manifests: ManifestSet::default(),
        }
    }
}

/// Complete stack description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    pub project: String,
    /// Stack/environment name, stamped into tags
    pub environment: String,
    pub platform: Platform,
    pub location: String,
    pub resource_group: String,
    /// `None` deploys without a registry (cluster platform only)
    pub registry: Option<RegistryConfig>,
    pub cluster: ClusterConfig,
    pub app_service: AppServiceConfig,
    pub workloads: WorkloadConfig,
    /// Timeout overrides keyed by resource id or resource type name
    pub timeouts: BTreeMap<String, Duration>,
    /// Maximum in-flight provider operations
    pub concurrency: usize,
    /// Attempts per provider call for transient failures
    pub max_attempts: u32,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            project: "microservices-demo".to_string(),
            environment: "dev".to_string(),
            platform: Platform::default(),
            location: DEFAULT_LOCATION.to_string(),
            resource_group: "microservices-demo-rg".to_string(),
            registry: Some(RegistryConfig::default()),
            cluster: ClusterConfig::default(),
            app_service: AppServiceConfig::default(),
            workloads: WorkloadConfig::default(),
            timeouts: BTreeMap::new(),
            concurrency: DEFAULT_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl StackConfig {
    /// Defaults with `LOCATION` and `NODE_SIZE` taken from the environment
    pub fn with_env_defaults() -> Self {
        let mut config = Self::default();
        if let Ok(location) = std::env::var("LOCATION")
            && !location.is_empty()
        {
            config.location = location;
        }
        if let Ok(node_size) = std::env::var("NODE_SIZE")
            && !node_size.is_empty()
        {
            config.cluster.node_pool.vm_size = node_size;
        }
        config
    }

    /// Tags stamped on every Azure resource
    pub fn tags(&self) -> serde_json::Value {
        serde_json::json!({
            "environment": self.environment,
            "project": self.project,
        })
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(StackError::InvalidConfig(msg));

        if self.resource_group.trim().is_empty() {
            return invalid("resource-group must not be empty".to_string());
        }
        if self.location.trim().is_empty() {
            return invalid("location must not be empty".to_string());
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1".to_string());
        }
        if self.max_attempts == 0 {
            return invalid("max-attempts must be at least 1".to_string());
        }
        if let Some(registry) = &self.registry {
            let len = registry.name.len();
            if !(5..=50).contains(&len) || !registry.name.chars().all(|c| c.is_ascii_alphanumeric())
            {
                return invalid(format!(
                    "registry name '{}' must be 5-50 alphanumeric characters",
                    registry.name
                ));
            }
        }

        match self.platform {
            Platform::Cluster => {
                if self.cluster.name.trim().is_empty() {
                    return invalid("cluster name must not be empty".to_string());
                }
                if self.cluster.node_pool.count == 0 {
                    return invalid("node pool count must be at least 1".to_string());
                }
                if self.workloads.enabled && self.workloads.namespace.trim().is_empty() {
                    return invalid("workload namespace must not be empty".to_string());
                }
            }
            Platform::AppService => {
                if self.registry.is_none() {
                    return invalid("the app-service platform requires a registry".to_string());
                }
                if self.app_service.backend_app_name == self.app_service.frontend_app_name {
                    return invalid("backend and frontend app names must differ".to_string());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StackConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster.dns_prefix(), "microservices-aks-dns");
        assert_eq!(config.cluster.credential_scope, CredentialScope::User);
    }

    #[test]
    fn test_env_defaults() {
        temp_env::with_vars(
            [("LOCATION", Some("westeurope")), ("NODE_SIZE", Some("Standard_DC2s_v3"))],
            || {
                let config = StackConfig::with_env_defaults();
                assert_eq!(config.location, "westeurope");
                assert_eq!(config.cluster.node_pool.vm_size, "Standard_DC2s_v3");
            },
        );
    }

    #[test]
    fn test_app_service_requires_registry() {
        let config = StackConfig {
            platform: Platform::AppService,
            registry: None,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_registry_name_rules() {
        let mut config = StackConfig::default();
        config.registry = Some(RegistryConfig {
            name: "bad-name".to_string(),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("aks".parse::<Platform>().unwrap(), Platform::Cluster);
        assert_eq!("webapp".parse::<Platform>().unwrap(), Platform::AppService);
        assert!("vm".parse::<Platform>().is_err());
    }
}
