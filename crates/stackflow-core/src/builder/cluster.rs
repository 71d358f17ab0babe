//! Managed cluster variant

use super::{
    ACR_PULL, ACR_PULL_ROLE_DEFINITION, CLUSTER, OutputSpec, REGISTRY, RESOURCE_GROUP,
    StackDefinition, WORKLOADS, WorkloadSet, container_registry, declare, registry_outputs,
    resource_group, with_timeout,
};
use crate::error::Result;
use crate::graph::ResourceGraph;
use crate::manifest::{demo_manifests, ingress_service, load_manifest_files};
use crate::model::{
    CredentialField, ManifestSet, Platform, PropertyValue, Resource, ResourceType, StackConfig,
};
use serde_json::json;
use std::path::Path;

fn managed_cluster(config: &StackConfig) -> Resource {
    let cluster = &config.cluster;
    let pool = &cluster.node_pool;

    let mut profile = json!({
        "name": pool.name,
        "count": pool.count,
        "vmSize": pool.vm_size,
        "mode": "System",
        "osType": "Linux",
        "type": "VirtualMachineScaleSets",
        "enableAutoScaling": pool.enable_auto_scaling,
    });
    if let Some(disk) = pool.os_disk_size_gb {
        profile["osDiskSizeGB"] = json!(disk);
    }

    let mut resource = Resource::new(CLUSTER, ResourceType::ManagedCluster, &cluster.name)
        .with_scope(PropertyValue::output(RESOURCE_GROUP, "name"))
        .with_property("location", PropertyValue::output(RESOURCE_GROUP, "location"))
        .with_literal("dnsPrefix", cluster.dns_prefix())
        .with_literal("agentPoolProfiles", json!([profile]))
        .with_literal("identity", json!({ "type": "SystemAssigned" }))
        .with_literal("enableRBAC", cluster.enable_rbac)
        .with_literal("tags", config.tags());

    if let Some(network) = &cluster.network {
        resource = resource.with_literal(
            "networkProfile",
            json!({
                "networkPlugin": network.network_plugin,
                "networkPolicy": network.network_policy,
                "loadBalancerSku": network.load_balancer_sku,
                "serviceCidr": network.service_cidr,
                "dnsServiceIP": network.dns_service_ip,
            }),
        );
    }
    resource
}

fn acr_pull_grant() -> Resource {
    Resource::new(ACR_PULL, ResourceType::RoleAssignment, ACR_PULL)
        .with_scope(PropertyValue::output(REGISTRY, "id"))
        .with_property(
            "principalId",
            PropertyValue::output(CLUSTER, "kubeletIdentityObjectId"),
        )
        .with_literal("principalType", "ServicePrincipal")
        .with_literal("roleDefinitionId", ACR_PULL_ROLE_DEFINITION)
}

fn workload_graph(config: &StackConfig, base_dir: &Path) -> Result<ResourceGraph> {
    let registry = config.registry.as_ref().map(|_| REGISTRY);
    let declared = match &config.workloads.manifests {
        ManifestSet::Demo => demo_manifests(&config.workloads, &config.environment, registry)?,
        ManifestSet::Files(paths) => load_manifest_files(paths, base_dir)?,
    };

    let mut graph = ResourceGraph::new();
    for resource in declared.iter() {
        graph.add(with_timeout(config, resource.clone()))?;
    }
    let externals = graph.external_references();
    Ok(graph.with_externals(externals))
}

pub(super) fn build(config: &StackConfig, base_dir: &Path) -> Result<StackDefinition> {
    let mut graph = ResourceGraph::new();
    let mut outputs = vec![OutputSpec::new(
        "resourceGroupName",
        PropertyValue::output(RESOURCE_GROUP, "name"),
    )];

    declare(&mut graph, config, resource_group(config))?;

    if let Some(registry) = &config.registry {
        declare(&mut graph, config, container_registry(config, registry))?;
        registry_outputs(&mut outputs);
    }

    declare(&mut graph, config, managed_cluster(config))?;
    outputs.push(OutputSpec::new(
        "aksClusterName",
        PropertyValue::output(CLUSTER, "name"),
    ));

    let grant = if config.registry.is_some() && config.cluster.grant_registry_pull {
        declare(&mut graph, config, acr_pull_grant())?;
        Some(ACR_PULL)
    } else {
        None
    };

    let workloads = if config.workloads.enabled {
        let workload_graph = workload_graph(config, base_dir)?;

        let mut node = Resource::new(WORKLOADS, ResourceType::WorkloadSet, &config.workloads.namespace)
            .with_property("cluster", PropertyValue::output(CLUSTER, "id"))
            .with_literal("namespace", config.workloads.namespace.as_str());
        if let Some(grant) = grant {
            node = node.depends_on(grant);
        }
        for external in workload_graph.externals() {
            node = node.depends_on(external.as_str());
        }
        declare(&mut graph, config, node)?;

        if let Some(service) = ingress_service(&workload_graph) {
            outputs.push(OutputSpec::new(
                "frontendUrl",
                PropertyValue::output(WORKLOADS, format!("{}.ingress", service)),
            ));
        }

        Some(WorkloadSet {
            id: WORKLOADS.to_string(),
            cluster: CLUSTER.to_string(),
            graph: workload_graph,
        })
    } else {
        None
    };

    outputs.push(
        OutputSpec::new(
            "kubeconfig",
            PropertyValue::credential(CLUSTER, CredentialField::Kubeconfig),
        )
        .sensitive(),
    );

    Ok(StackDefinition {
        name: config.project.clone(),
        platform: Platform::Cluster,
        graph,
        workloads,
        outputs,
    })
}
