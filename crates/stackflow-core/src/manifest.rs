//! Workload manifest sets
//!
//! The workload pass applies a namespace-scoped set of Kubernetes objects.
//! The objects are opaque to the engine apart from the dependency edges
//! between them and the `${resource.output}` references in their strings.

use crate::error::{Result, StackError};
use crate::graph::ResourceGraph;
use crate::model::{PropertyValue, Resource, ResourceType, WorkloadConfig};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};

/// Property holding the full Kubernetes object
pub const MANIFEST_PROPERTY: &str = "manifest";

/// Id of the externally reachable service in the built-in set
pub const DEMO_INGRESS_SERVICE: &str = "frontend-service";

/// Kinds applied before workloads that consume them in the same namespace
const CONFIG_KINDS: &[&str] = &["ConfigMap", "Secret", "ServiceAccount", "PersistentVolumeClaim"];
const WORKLOAD_KINDS: &[&str] = &["Deployment", "StatefulSet", "DaemonSet", "Job", "CronJob", "Pod"];

fn kube_resource(id: &str, kind: &str, manifest: Value) -> Result<Resource> {
    let name = manifest
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .unwrap_or(id)
        .to_string();
    let namespace = manifest
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut resource = Resource::new(id, ResourceType::kubernetes(kind), name)
        .with_property(MANIFEST_PROPERTY, PropertyValue::from_json(manifest)?);
    if let Some(ns) = namespace {
        resource = resource.with_scope(PropertyValue::literal(ns));
    }
    Ok(resource)
}

fn image_ref(registry: Option<&str>, image: &str) -> String {
    match registry {
        Some(id) => format!("${{{}.loginServer}}/{}", id, image),
        None => image.to_string(),
    }
}

fn container(name: &str, image: String, port: u16, env: Value) -> Value {
    json!({
        "name": name,
        "image": image,
        "imagePullPolicy": "Always",
        "ports": [{ "containerPort": port, "name": "http", "protocol": "TCP" }],
        "env": env,
        "resources": {
            "requests": { "memory": "128Mi", "cpu": "100m" },
            "limits": { "memory": "256Mi", "cpu": "200m" },
        },
        "livenessProbe": {
            "httpGet": { "path": "/health", "port": port },
            "initialDelaySeconds": 10,
            "periodSeconds": 10,
            "timeoutSeconds": 5,
            "failureThreshold": 3,
        },
        "readinessProbe": {
            "httpGet": { "path": "/health", "port": port },
            "initialDelaySeconds": 5,
            "periodSeconds": 5,
            "timeoutSeconds": 3,
            "failureThreshold": 2,
        },
    })
}

fn deployment(config: &WorkloadConfig, app: &str, container: Value) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": app,
            "namespace": config.namespace,
            "labels": { "app": app, "version": "v1" },
        },
        "spec": {
            "replicas": config.replicas,
            "selector": { "matchLabels": { "app": app } },
            "template": {
                "metadata": { "labels": { "app": app, "version": "v1" } },
                "spec": { "containers": [container] },
            },
        },
    })
}

fn service(config: &WorkloadConfig, app: &str, service_type: &str, port: u16, target: u16) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": app,
            "namespace": config.namespace,
            "labels": { "app": app },
        },
        "spec": {
            "type": service_type,
            "selector": { "app": app },
            "ports": [{ "port": port, "targetPort": target, "protocol": "TCP", "name": "http" }],
        },
    })
}

/// Built-in two-tier set: namespace, config, backend and frontend.
///
/// `registry` is the id of the registry resource whose login server prefixes
/// the container images, if any.
pub fn demo_manifests(
    config: &WorkloadConfig,
    environment: &str,
    registry: Option<&str>,
) -> Result<ResourceGraph> {
    let ns = config.namespace.as_str();
    let backend_url = "http://backend:3001";
    let mut graph = ResourceGraph::new();

    graph.add(kube_resource(
        "microservices-namespace",
        "Namespace",
        json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": ns,
                "labels": { "name": ns, "environment": environment },
            },
        }),
    )?
    .with_scope(PropertyValue::literal(ns)))?;

    graph.add(
        kube_resource(
            "app-config",
            "ConfigMap",
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {
                    "name": "app-config",
                    "namespace": ns,
                    "labels": { "app": "microservices-demo" },
                },
                "data": {
                    "BACKEND_URL": backend_url,
                    "NODE_ENV": "production",
                    "LOG_LEVEL": "info",
                },
            }),
        )?
        .depends_on("microservices-namespace"),
    )?;

    let backend = container(
        "backend",
        image_ref(registry, &config.backend_image),
        3001,
        json!([
            { "name": "PORT", "value": "3001" },
            { "name": "NODE_ENV", "value": "production" },
        ]),
    );
    graph.add(
        kube_resource("backend-deployment", "Deployment", deployment(config, "backend", backend))?
            .depends_on("microservices-namespace")
            .depends_on("app-config"),
    )?;

    graph.add(
        kube_resource(
            "backend-service",
            "Service",
            service(config, "backend", "ClusterIP", 3001, 3001),
        )?
        .depends_on("microservices-namespace"),
    )?;

    let frontend = container(
        "frontend",
        image_ref(registry, &config.frontend_image),
        3000,
        json!([
            { "name": "PORT", "value": "3000" },
            { "name": "BACKEND_URL", "value": backend_url },
            { "name": "NODE_ENV", "value": "production" },
        ]),
    );
    graph.add(
        kube_resource(
            "frontend-deployment",
            "Deployment",
            deployment(config, "frontend", frontend),
        )?
        .depends_on("microservices-namespace")
        .depends_on("backend-service")
        .depends_on("app-config"),
    )?;

    graph.add(
        kube_resource(
            DEMO_INGRESS_SERVICE,
            "Service",
            service(config, "frontend", "LoadBalancer", 80, 3000),
        )?
        .depends_on("microservices-namespace"),
    )?;

    Ok(graph)
}

/// Load YAML manifest files (multi-document) into a workload graph.
///
/// Objects depend on their Namespace object when it is part of the set, and
/// workloads depend on config objects declared before them in the same
/// namespace.
pub fn load_manifest_files(paths: &[PathBuf], base_dir: &Path) -> Result<ResourceGraph> {
    let mut graph = ResourceGraph::new();
    let mut namespaces: Vec<(String, String)> = Vec::new();
    let mut configs: Vec<(Option<String>, String)> = Vec::new();

    for relative in paths {
        let path = if relative.is_absolute() {
            relative.clone()
        } else {
            base_dir.join(relative)
        };
        let content = std::fs::read_to_string(&path).map_err(|e| StackError::IoError {
            path: path.clone(),
            message: e.to_string(),
        })?;

        for document in serde_yaml::Deserializer::from_str(&content) {
            let invalid = |message: String| StackError::InvalidManifest {
                path: path.clone(),
                message,
            };
            let yaml = serde_yaml::Value::deserialize(document).map_err(|e| invalid(e.to_string()))?;
            if yaml.is_null() {
                continue;
            }
            let object: Value = serde_json::to_value(&yaml).map_err(|e| invalid(e.to_string()))?;

            let kind = object
                .get("kind")
                .and_then(|v| v.as_str())
                .ok_or_else(|| invalid("object without kind".to_string()))?
                .to_string();
            let name = object
                .pointer("/metadata/name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| invalid(format!("{} without metadata.name", kind)))?
                .to_string();
            let namespace = object
                .pointer("/metadata/namespace")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());

            let id = format!("{}-{}", kind.to_lowercase(), name);
            let mut resource = kube_resource(&id, &kind, object)?;

            if kind == "Namespace" {
                resource = resource.with_scope(PropertyValue::literal(name.clone()));
                namespaces.push((name, id.clone()));
            } else if let Some(ns) = &namespace
                && let Some((_, ns_id)) = namespaces.iter().find(|(n, _)| n == ns)
            {
                resource = resource.depends_on(ns_id.clone());
            }

            if WORKLOAD_KINDS.contains(&kind.as_str()) {
                for (config_ns, config_id) in &configs {
                    if config_ns == &namespace {
                        resource = resource.depends_on(config_id.clone());
                    }
                }
            }
            if CONFIG_KINDS.contains(&kind.as_str()) {
                configs.push((namespace, id));
            }

            graph.add(resource)?;
        }
    }

    Ok(graph)
}

/// Id of the first LoadBalancer service, whose ingress becomes the public URL
pub fn ingress_service(graph: &ResourceGraph) -> Option<&str> {
    graph
        .iter()
        .find(|r| {
            r.resource_type.kind() == Some("Service")
                && r.properties
                    .get(MANIFEST_PROPERTY)
                    .and_then(|m| m.literal_at(&["spec", "type"]))
                    .and_then(|t| t.as_str())
                    == Some("LoadBalancer")
        })
        .map(|r| r.id.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_demo_manifest_order() {
        let config = WorkloadConfig::default();
        let graph = demo_manifests(&config, "dev", Some("container-registry"))
            .unwrap()
            .with_externals(["container-registry"]);
        let plan = graph.plan().unwrap();

        assert_eq!(
            plan.order(),
            [
                "microservices-namespace",
                "app-config",
                "backend-deployment",
                "backend-service",
                "frontend-deployment",
                "frontend-service",
            ]
        );
        let pos = |id: &str| plan.position(id).unwrap();
        assert!(pos("backend-service") < pos("frontend-deployment"));
        assert_eq!(
            graph.external_references().into_iter().collect::<Vec<_>>(),
            vec!["container-registry"]
        );
    }

    #[test]
    fn test_demo_images_reference_registry() {
        let graph = demo_manifests(&WorkloadConfig::default(), "dev", Some("container-registry"))
            .unwrap();
        let backend = graph.get("backend-deployment").unwrap();
        assert!(backend.references().contains("container-registry"));
        assert_eq!(backend.name, "backend");
        assert!(matches!(
            backend.properties[MANIFEST_PROPERTY],
            PropertyValue::Map(_)
        ));
        assert_eq!(
            backend.properties[MANIFEST_PROPERTY].literal_at(&["spec", "replicas"]),
            Some(&json!(2))
        );

        let plain = demo_manifests(&WorkloadConfig::default(), "dev", None).unwrap();
        assert!(plain.external_references().is_empty());
        assert_eq!(
            plain.get("backend-deployment").unwrap().properties[MANIFEST_PROPERTY]
                .literal_at(&["spec", "replicas"]),
            Some(&json!(2))
        );
    }

    #[test]
    fn test_ingress_service() {
        let graph = demo_manifests(&WorkloadConfig::default(), "dev", None).unwrap();
        assert_eq!(ingress_service(&graph), Some(DEMO_INGRESS_SERVICE));
    }

    #[test]
    fn test_load_manifest_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("namespace.yaml"),
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: demo\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("app.yaml"),
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: api
  namespace: demo
spec:
  replicas: 1
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: demo
data:
  LOG_LEVEL: info
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: demo
spec:
  template:
    spec:
      containers:
        - name: web
          image: "${container-registry.loginServer}/web:1"
"#,
        )
        .unwrap();

        let graph = load_manifest_files(
            &[PathBuf::from("namespace.yaml"), PathBuf::from("app.yaml")],
            dir.path(),
        )
        .unwrap();

        assert_eq!(graph.len(), 4);
        let web = graph.get("deployment-web").unwrap();
        let deps = web.dependencies();
        assert!(deps.contains("namespace-demo"));
        assert!(deps.contains("configmap-settings"));
        assert!(deps.contains("container-registry"));
        assert!(
            !graph
                .get("deployment-api")
                .unwrap()
                .dependencies()
                .contains("configmap-settings")
        );
    }

    #[test]
    fn test_manifest_without_kind_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.yaml"), "metadata:\n  name: x\n").unwrap();
        let result = load_manifest_files(&[PathBuf::from("bad.yaml")], dir.path());
        assert!(matches!(result, Err(StackError::InvalidManifest { .. })));
    }
}
