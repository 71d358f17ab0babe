//! Section nodes of a stack file

use super::{bool_arg, duration_arg, integer_arg, string_arg};
use crate::error::Result;
use crate::model::{
    AppServiceConfig, ClusterConfig, ManifestSet, NetworkProfile, NodePool, StackConfig,
    WorkloadConfig,
};
use kdl::KdlNode;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// `registry "name" { sku "Basic"; admin-user #true }` or `registry #false`
pub fn parse_registry(node: &KdlNode, config: &mut StackConfig) {
    if bool_arg(node) == Some(false) {
        config.registry = None;
        return;
    }

    let mut registry = config.registry.take().unwrap_or_default();
    if let Some(name) = string_arg(node) {
        registry.name = name;
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "name" => {
                    if let Some(name) = string_arg(child) {
                        registry.name = name;
                    }
                }
                "sku" => {
                    if let Some(sku) = string_arg(child) {
                        registry.sku = sku;
                    }
                }
                "admin-user" | "admin_user" | "admin-user-enabled" => {
                    if let Some(enabled) = bool_arg(child) {
                        registry.admin_user_enabled = enabled;
                    }
                }
                _ => {}
            }
        }
    }

    config.registry = Some(registry);
}

pub fn parse_cluster(node: &KdlNode, cluster: &mut ClusterConfig) -> Result<()> {
    if let Some(name) = string_arg(node) {
        cluster.name = name;
    }

    let Some(children) = node.children() else {
        return Ok(());
    };
    for child in children.nodes() {
        match child.name().value() {
            "name" => {
                if let Some(name) = string_arg(child) {
                    cluster.name = name;
                }
            }
            "dns-prefix" | "dns_prefix" => cluster.dns_prefix = string_arg(child),
            "credentials" | "credential-scope" => {
                if let Some(scope) = string_arg(child) {
                    cluster.credential_scope = scope.parse()?;
                }
            }
            "rbac" | "enable-rbac" => {
                if let Some(enabled) = bool_arg(child) {
                    cluster.enable_rbac = enabled;
                }
            }
            "grant-registry-pull" | "acr-pull" => {
                if let Some(enabled) = bool_arg(child) {
                    cluster.grant_registry_pull = enabled;
                }
            }
            "node-pool" | "node_pool" => parse_node_pool(child, &mut cluster.node_pool),
            "network" => cluster.network = Some(parse_network(child)),
            _ => {}
        }
    }
    Ok(())
}

fn parse_node_pool(node: &KdlNode, pool: &mut NodePool) {
    if let Some(name) = string_arg(node) {
        pool.name = name;
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "vm-size" | "vm_size" | "size" => {
                    if let Some(size) = string_arg(child) {
                        pool.vm_size = size;
                    }
                }
                "count" => {
                    if let Some(count) = integer_arg(child) {
                        pool.count = count as u32;
                    }
                }
                "os-disk-gb" | "os_disk_size_gb" => {
                    pool.os_disk_size_gb = integer_arg(child).map(|v| v as u32);
                }
                "auto-scaling" | "enable-auto-scaling" => {
                    if let Some(enabled) = bool_arg(child) {
                        pool.enable_auto_scaling = enabled;
                    }
                }
                _ => {}
            }
        }
    }
}

fn parse_network(node: &KdlNode) -> NetworkProfile {
    let mut network = NetworkProfile::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let Some(value) = string_arg(child) else {
                continue;
            };
            match child.name().value() {
                "plugin" | "network-plugin" => network.network_plugin = value,
                "policy" | "network-policy" => network.network_policy = value,
                "load-balancer-sku" => network.load_balancer_sku = value,
                "service-cidr" => network.service_cidr = value,
                "dns-service-ip" => network.dns_service_ip = value,
                _ => {}
            }
        }
    }
    network
}

/// `backend "name" port=3001` style app entry
fn parse_app_entry(node: &KdlNode, name: &mut String, port: &mut u16) {
    if let Some(value) = string_arg(node) {
        *name = value;
    }
    if let Some(value) = node.get("port").and_then(|v| v.as_integer()) {
        *port = value as u16;
    }
}

pub fn parse_app_service(node: &KdlNode, app: &mut AppServiceConfig) {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "plan" => {
                    if let Some(plan) = string_arg(child) {
                        app.plan_name = plan;
                    }
                }
                "sku" => {
                    if let Some(sku) = string_arg(child) {
                        app.sku = sku;
                    }
                }
                "tier" => {
                    if let Some(tier) = string_arg(child) {
                        app.tier = tier;
                    }
                }
                "capacity" => {
                    if let Some(capacity) = integer_arg(child) {
                        app.capacity = capacity as u32;
                    }
                }
                "backend" => {
                    parse_app_entry(child, &mut app.backend_app_name, &mut app.backend_port)
                }
                "frontend" => {
                    parse_app_entry(child, &mut app.frontend_app_name, &mut app.frontend_port)
                }
                _ => {}
            }
        }
    }
}

/// `workloads #false` disables the workload pass entirely
pub fn parse_workloads(node: &KdlNode, workloads: &mut WorkloadConfig) {
    if let Some(enabled) = bool_arg(node) {
        workloads.enabled = enabled;
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "enabled" => {
                    if let Some(enabled) = bool_arg(child) {
                        workloads.enabled = enabled;
                    }
                }
                "namespace" => {
                    if let Some(namespace) = string_arg(child) {
                        workloads.namespace = namespace;
                    }
                }
                "replicas" => {
                    if let Some(replicas) = integer_arg(child) {
                        workloads.replicas = replicas as u32;
                    }
                }
                "backend-image" | "backend_image" => {
                    if let Some(image) = string_arg(child) {
                        workloads.backend_image = image;
                    }
                }
                "frontend-image" | "frontend_image" => {
                    if let Some(image) = string_arg(child) {
                        workloads.frontend_image = image;
                    }
                }
                "manifests" => {
                    let files: Vec<PathBuf> = child
                        .entries()
                        .iter()
                        .filter_map(|e| e.value().as_string().map(PathBuf::from))
                        .collect();
                    workloads.manifests = if files.is_empty() {
                        ManifestSet::Demo
                    } else {
                        ManifestSet::Files(files)
                    };
                }
                _ => {}
            }
        }
    }
}

/// `timeouts { managed-cluster "90m"; aks-cluster 3600 }`
pub fn parse_timeouts(node: &KdlNode, timeouts: &mut BTreeMap<String, Duration>) -> Result<()> {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if let Some(timeout) = duration_arg(child)? {
                timeouts.insert(child.name().value().to_string(), timeout);
            }
        }
    }
    Ok(())
}
