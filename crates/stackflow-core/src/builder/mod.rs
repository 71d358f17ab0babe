//! Stack builder
//!
//! Turns a [`StackConfig`] into the declared resource graph. Every deployment
//! variant goes through here, so the near-identical resource definitions are
//! written once and switched by configuration.

mod cluster;
mod webapp;

use crate::error::Result;
use crate::graph::{ConvergencePlan, ResourceGraph};
use crate::model::{Platform, PropertyValue, Resource, StackConfig};
use std::path::Path;
use tracing::debug;

pub const RESOURCE_GROUP: &str = "resource-group";
pub const REGISTRY: &str = "container-registry";
pub const CLUSTER: &str = "aks-cluster";
pub const ACR_PULL: &str = "aks-acr-pull";
pub const WORKLOADS: &str = "workloads";
pub const APP_SERVICE_PLAN: &str = "app-service-plan";
pub const BACKEND_APP: &str = "backend-webapp";
pub const FRONTEND_APP: &str = "frontend-webapp";

/// Built-in AcrPull role definition
pub const ACR_PULL_ROLE_DEFINITION: &str = "7f951dda-4ed3-4680-a7ca-43fe172d538d";

/// Value exported once the stack has converged
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub value: PropertyValue,
    /// Redacted unless explicitly requested
    pub sensitive: bool,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
            sensitive: false,
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// Second-stage resources applied against the provisioned cluster
#[derive(Debug, Clone)]
pub struct WorkloadSet {
    /// Id of the workload-set node in the stack graph
    pub id: String,
    /// Id of the cluster whose credentials target the pass
    pub cluster: String,
    pub graph: ResourceGraph,
}

/// Everything the engine needs to converge a stack
#[derive(Debug, Clone)]
pub struct StackDefinition {
    pub name: String,
    pub platform: Platform,
    pub graph: ResourceGraph,
    pub workloads: Option<WorkloadSet>,
    pub outputs: Vec<OutputSpec>,
}

impl StackDefinition {
    /// Plan the stack graph and check the workload graph sorts as well
    pub fn plan(&self) -> Result<ConvergencePlan> {
        if let Some(workloads) = &self.workloads {
            workloads.graph.plan()?;
        }
        self.graph.plan()
    }
}

/// Build the resource graph for `config`.
///
/// `base_dir` resolves relative manifest paths (normally the directory of
/// the stack file).
pub fn build_stack(config: &StackConfig, base_dir: &Path) -> Result<StackDefinition> {
    config.validate()?;

    let definition = match config.platform {
        Platform::Cluster => cluster::build(config, base_dir)?,
        Platform::AppService => webapp::build(config)?,
    };

    // Surface cycles and dangling references before anything runs
    let plan = definition.plan()?;
    debug!(
        stack = %definition.name,
        platform = %definition.platform,
        resources = plan.len(),
        "Built stack definition"
    );
    Ok(definition)
}

fn with_timeout(config: &StackConfig, mut resource: Resource) -> Resource {
    if resource.timeout.is_none() {
        let by_type = resource.resource_type.to_string();
        let by_family = if resource.resource_type.is_kubernetes() {
            Some("kubernetes")
        } else {
            None
        };
        resource.timeout = config
            .timeouts
            .get(&resource.id)
            .or_else(|| config.timeouts.get(&by_type))
            .or_else(|| by_family.and_then(|f| config.timeouts.get(f)))
            .copied();
    }
    resource
}

fn declare(graph: &mut ResourceGraph, config: &StackConfig, resource: Resource) -> Result<()> {
    graph.add(with_timeout(config, resource))
}

fn resource_group(config: &StackConfig) -> Resource {
    Resource::new(
        RESOURCE_GROUP,
        crate::model::ResourceType::ResourceGroup,
        &config.resource_group,
    )
    .with_literal("location", config.location.as_str())
    .with_literal("tags", config.tags())
}

fn container_registry(config: &StackConfig, registry: &crate::model::RegistryConfig) -> Resource {
    Resource::new(
        REGISTRY,
        crate::model::ResourceType::ContainerRegistry,
        &registry.name,
    )
    .with_scope(PropertyValue::output(RESOURCE_GROUP, "name"))
    .with_property("location", PropertyValue::output(RESOURCE_GROUP, "location"))
    .with_literal("sku", serde_json::json!({ "name": registry.sku }))
    .with_literal("adminUserEnabled", registry.admin_user_enabled)
    .with_literal("tags", config.tags())
}

fn registry_outputs(outputs: &mut Vec<OutputSpec>) {
    outputs.push(OutputSpec::new(
        "acrLoginServer",
        PropertyValue::output(REGISTRY, "loginServer"),
    ));
    outputs.push(OutputSpec::new("acrName", PropertyValue::output(REGISTRY, "name")));
}

#[cfg(test)]
mod tests;
