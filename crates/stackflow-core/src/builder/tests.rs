use super::*;
use crate::model::{CredentialField, ManifestSet, Platform, PropertyValue, ResourceType};
use std::path::Path;
use std::time::Duration;

fn ids(definition: &StackDefinition) -> Vec<String> {
    definition.plan().unwrap().order().to_vec()
}

#[test]
fn test_cluster_stack_order() {
    let definition = build_stack(&StackConfig::default(), Path::new(".")).unwrap();

    assert_eq!(definition.platform, Platform::Cluster);
    assert_eq!(
        ids(&definition),
        vec![RESOURCE_GROUP, REGISTRY, CLUSTER, ACR_PULL, WORKLOADS]
    );
}

#[test]
fn test_acr_pull_grant_targets_kubelet_identity() {
    let definition = build_stack(&StackConfig::default(), Path::new(".")).unwrap();
    let grant = definition.graph.get(ACR_PULL).unwrap();

    assert_eq!(grant.resource_type, ResourceType::RoleAssignment);
    assert_eq!(grant.scope, Some(PropertyValue::output(REGISTRY, "id")));
    assert_eq!(
        grant.properties.get("principalId"),
        Some(&PropertyValue::output(CLUSTER, "kubeletIdentityObjectId"))
    );
    assert_eq!(
        grant.properties.get("roleDefinitionId"),
        Some(&PropertyValue::literal(ACR_PULL_ROLE_DEFINITION))
    );
}

#[test]
fn test_workload_set_depends_on_grant_and_externals() {
    let definition = build_stack(&StackConfig::default(), Path::new(".")).unwrap();
    let node = definition.graph.get(WORKLOADS).unwrap();

    assert_eq!(node.resource_type, ResourceType::WorkloadSet);
    let deps = node.dependencies();
    assert!(deps.contains(CLUSTER));
    assert!(deps.contains(ACR_PULL));
    assert!(deps.contains(REGISTRY));

    let workloads = definition.workloads.as_ref().unwrap();
    assert_eq!(workloads.cluster, CLUSTER);
    assert!(workloads.graph.externals().contains(REGISTRY));
    assert_eq!(workloads.graph.len(), 6);
}

#[test]
fn test_cluster_outputs() {
    let definition = build_stack(&StackConfig::default(), Path::new(".")).unwrap();
    let names: Vec<_> = definition.outputs.iter().map(|o| o.name.as_str()).collect();

    assert_eq!(
        names,
        vec![
            "resourceGroupName",
            "acrLoginServer",
            "acrName",
            "aksClusterName",
            "frontendUrl",
            "kubeconfig"
        ]
    );

    let kubeconfig = definition.outputs.last().unwrap();
    assert!(kubeconfig.sensitive);
    assert_eq!(
        kubeconfig.value,
        PropertyValue::credential(CLUSTER, CredentialField::Kubeconfig)
    );

    let frontend = definition
        .outputs
        .iter()
        .find(|o| o.name == "frontendUrl")
        .unwrap();
    assert_eq!(
        frontend.value,
        PropertyValue::output(WORKLOADS, "frontend-service.ingress")
    );
}

#[test]
fn test_workloads_disabled_drops_node() {
    let mut config = StackConfig::default();
    config.workloads.enabled = false;

    let definition = build_stack(&config, Path::new(".")).unwrap();
    assert!(definition.workloads.is_none());
    assert!(!definition.graph.contains(WORKLOADS));
    assert!(!definition.outputs.iter().any(|o| o.name == "frontendUrl"));
}

#[test]
fn test_cluster_without_registry() {
    let mut config = StackConfig::default();
    config.registry = None;
    config.workloads.enabled = false;

    let definition = build_stack(&config, Path::new(".")).unwrap();
    assert_eq!(ids(&definition), vec![RESOURCE_GROUP, CLUSTER]);
    assert!(!definition.outputs.iter().any(|o| o.name == "acrName"));
}

#[test]
fn test_node_size_flows_into_pool_profile() {
    let mut config = StackConfig::default();
    config.cluster.node_pool.vm_size = "Standard_B2s".to_string();
    config.cluster.node_pool.count = 3;

    let definition = build_stack(&config, Path::new(".")).unwrap();
    let cluster = definition.graph.get(CLUSTER).unwrap();
    let pool = cluster.properties["agentPoolProfiles"]
        .literal_at(&[])
        .and_then(|v| v.get(0))
        .cloned()
        .unwrap();

    assert_eq!(pool["vmSize"], "Standard_B2s");
    assert_eq!(pool["count"], 3);
    assert_eq!(pool["mode"], "System");
}

#[test]
fn test_timeout_overrides() {
    let mut config = StackConfig::default();
    config
        .timeouts
        .insert("managed-cluster".to_string(), Duration::from_secs(90 * 60));
    config
        .timeouts
        .insert("kubernetes".to_string(), Duration::from_secs(120));
    config
        .timeouts
        .insert(RESOURCE_GROUP.to_string(), Duration::from_secs(30));

    let definition = build_stack(&config, Path::new(".")).unwrap();
    assert_eq!(
        definition.graph.get(CLUSTER).unwrap().effective_timeout(),
        Duration::from_secs(90 * 60)
    );
    assert_eq!(
        definition.graph.get(RESOURCE_GROUP).unwrap().effective_timeout(),
        Duration::from_secs(30)
    );
    let workloads = definition.workloads.unwrap();
    assert!(
        workloads
            .graph
            .iter()
            .all(|r| r.effective_timeout() == Duration::from_secs(120))
    );
}

#[test]
fn test_app_service_stack() {
    let config = StackConfig {
        platform: Platform::AppService,
        ..Default::default()
    };
    let definition = build_stack(&config, Path::new(".")).unwrap();

    assert!(definition.workloads.is_none());
    assert_eq!(
        ids(&definition),
        vec![
            RESOURCE_GROUP,
            REGISTRY,
            APP_SERVICE_PLAN,
            BACKEND_APP,
            FRONTEND_APP
        ]
    );

    let frontend = definition.graph.get(FRONTEND_APP).unwrap();
    assert!(frontend.dependencies().contains(BACKEND_APP));
    let creds: Vec<_> = frontend
        .credential_refs()
        .into_iter()
        .map(|c| c.field)
        .collect();
    assert_eq!(
        creds,
        vec![CredentialField::Username, CredentialField::Password]
    );

    let names: Vec<_> = definition.outputs.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "resourceGroupName",
            "acrLoginServer",
            "acrName",
            "backendUrl",
            "frontendUrl",
            "appServicePlanName"
        ]
    );
}

#[test]
fn test_app_service_plan_family() {
    let mut config = StackConfig {
        platform: Platform::AppService,
        ..Default::default()
    };
    config.app_service.sku = "P1v3".to_string();
    config.app_service.tier = "PremiumV3".to_string();

    let definition = build_stack(&config, Path::new(".")).unwrap();
    let plan = definition.graph.get(APP_SERVICE_PLAN).unwrap();
    let sku = plan.properties["sku"].literal_at(&[]).unwrap();
    assert_eq!(sku["family"], "P");
    assert_eq!(sku["tier"], "PremiumV3");
}

#[test]
fn test_manifest_files_resolve_against_base_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("app.yaml"),
        r#"
apiVersion: v1
kind: Namespace
metadata:
  name: shop
---
apiVersion: v1
kind: Service
metadata:
  name: web
  namespace: shop
spec:
  type: LoadBalancer
  ports:
    - port: 80
"#,
    )
    .unwrap();

    let mut config = StackConfig::default();
    config.workloads.manifests = ManifestSet::Files(vec!["app.yaml".into()]);

    let definition = build_stack(&config, dir.path()).unwrap();
    let workloads = definition.workloads.unwrap();
    assert_eq!(workloads.graph.len(), 2);
    assert!(
        definition
            .outputs
            .iter()
            .any(|o| o.value == PropertyValue::output(WORKLOADS, "service-web.ingress"))
    );
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = StackConfig::default();
    config.resource_group = String::new();
    let err = build_stack(&config, Path::new(".")).unwrap_err();
    assert!(err.is_configuration_error());
}
