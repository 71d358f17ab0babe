//! Mapping between declared properties and Azure Resource Manager documents
//!
//! Declarations carry a flat property object. On the wire, a handful of
//! envelope keys sit at the top of the document and everything else lives
//! under `properties`; reads flatten the document back into the same shape
//! so drift can be checked key by key.

use serde_json::{Map, Value, json};
use stackflow_cloud::{ActualState, CloudError, ResourceKey};
use stackflow_core::model::ResourceType;
use uuid::Uuid;

/// Keys that live on the ARM envelope rather than under `properties`
const ENVELOPE_KEYS: &[&str] = &["location", "tags", "sku", "identity", "kind", "managedBy"];

/// Provisioning states after which polling stops
const TERMINAL_STATES: &[&str] = &["Succeeded", "Failed", "Canceled"];

/// ARM address of a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmResource {
    pub id: String,
    pub api_version: &'static str,
}

impl ArmResource {
    /// Path of an action or child resource below this one
    pub fn child(&self, segment: &str) -> String {
        format!("{}/{}", self.id, segment)
    }
}

fn api_version(resource_type: &ResourceType) -> &'static str {
    match resource_type {
        ResourceType::ResourceGroup => "2021-04-01",
        ResourceType::ContainerRegistry => "2023-07-01",
        ResourceType::ManagedCluster => "2024-05-01",
        ResourceType::RoleAssignment => "2022-04-01",
        ResourceType::AppServicePlan | ResourceType::WebApp => "2023-12-01",
        ResourceType::WorkloadSet | ResourceType::Kubernetes(_) => "",
    }
}

/// Role assignment names are GUIDs; derive a stable one from scope and name
pub fn role_assignment_name(scope: &str, name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{}/{}", scope, name).as_bytes())
}

pub fn locate(subscription: &str, key: &ResourceKey) -> Result<ArmResource, CloudError> {
    let group = || {
        key.scope
            .as_deref()
            .ok_or_else(|| CloudError::Configuration(format!("{} has no resource group", key)))
    };
    let in_group = |provider: &str| -> Result<String, CloudError> {
        Ok(format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}",
            subscription,
            group()?,
            provider,
            key.name
        ))
    };

    let id = match &key.resource_type {
        ResourceType::ResourceGroup => {
            format!("/subscriptions/{}/resourceGroups/{}", subscription, key.name)
        }
        ResourceType::ContainerRegistry => in_group("Microsoft.ContainerRegistry/registries")?,
        ResourceType::ManagedCluster => in_group("Microsoft.ContainerService/managedClusters")?,
        ResourceType::AppServicePlan => in_group("Microsoft.Web/serverfarms")?,
        ResourceType::WebApp => in_group("Microsoft.Web/sites")?,
        ResourceType::RoleAssignment => {
            let scope = key.scope.as_deref().ok_or_else(|| {
                CloudError::Configuration(format!("{} has no scope", key))
            })?;
            format!(
                "{}/providers/Microsoft.Authorization/roleAssignments/{}",
                scope.trim_end_matches('/'),
                role_assignment_name(scope, &key.name)
            )
        }
        other => {
            return Err(CloudError::Configuration(format!(
                "{} is not an Azure resource",
                other
            )));
        }
    };

    Ok(ArmResource {
        id,
        api_version: api_version(&key.resource_type),
    })
}

/// Build the PUT document for a resource
pub fn request_body(subscription: &str, key: &ResourceKey, properties: &Value) -> Value {
    let mut envelope = Map::new();
    let mut inner = Map::new();

    if let Value::Object(map) = properties {
        for (k, v) in map {
            if ENVELOPE_KEYS.contains(&k.as_str()) {
                envelope.insert(k.clone(), v.clone());
            } else if key.resource_type == ResourceType::RoleAssignment && k == "roleDefinitionId" {
                inner.insert(k.clone(), json!(role_definition_path(subscription, v)));
            } else {
                inner.insert(k.clone(), v.clone());
            }
        }
    }

    if !inner.is_empty() {
        envelope.insert("properties".to_string(), Value::Object(inner));
    }
    Value::Object(envelope)
}

fn role_definition_path(subscription: &str, value: &Value) -> String {
    let id = value.as_str().unwrap_or_default();
    if id.starts_with('/') {
        id.to_string()
    } else {
        format!(
            "/subscriptions/{}/providers/Microsoft.Authorization/roleDefinitions/{}",
            subscription, id
        )
    }
}

/// Flatten an ARM document into the declared property shape and pick the
/// outputs dependents consume
pub fn actual_state(key: &ResourceKey, document: &Value) -> ActualState {
    let mut flat = Map::new();
    if let Value::Object(map) = document {
        for k in ENVELOPE_KEYS {
            if let Some(v) = map.get(*k) {
                flat.insert(k.to_string(), v.clone());
            }
        }
        if let Some(Value::Object(inner)) = map.get("properties") {
            for (k, v) in inner {
                flat.insert(k.clone(), v.clone());
            }
        }
    }

    if key.resource_type == ResourceType::RoleAssignment {
        if let Some(Value::String(path)) = flat.get("roleDefinitionId") {
            let guid = path.rsplit('/').next().unwrap_or_default().to_string();
            flat.insert("roleDefinitionId".to_string(), json!(guid));
        }
    }

    let mut state = ActualState::new(Value::Object(flat));
    if let Some(id) = document.get("id") {
        state = state.with_output("id", id.clone());
    }

    let pick = |pointer: &str| document.pointer(pointer).cloned();
    let extra: &[(&str, &str)] = match &key.resource_type {
        ResourceType::ContainerRegistry => &[("loginServer", "/properties/loginServer")],
        ResourceType::ManagedCluster => &[
            (
                "kubeletIdentityObjectId",
                "/properties/identityProfile/kubeletidentity/objectId",
            ),
            ("fqdn", "/properties/fqdn"),
            ("principalId", "/identity/principalId"),
        ],
        ResourceType::WebApp => &[("defaultHostName", "/properties/defaultHostName")],
        _ => &[],
    };
    for (name, pointer) in extra {
        if let Some(value) = pick(pointer) {
            state = state.with_output(*name, value);
        }
    }
    state
}

/// Provisioning state of a document, when it reports one
pub fn provisioning_state(document: &Value) -> Option<&str> {
    document
        .pointer("/properties/provisioningState")
        .and_then(|v| v.as_str())
}

pub fn is_terminal(state: &str) -> bool {
    TERMINAL_STATES.iter().any(|t| t.eq_ignore_ascii_case(state))
}

/// Fold a web app's site configuration and app settings (which the site
/// document leaves out) into its flattened properties
pub fn merge_site_config(state: &mut ActualState, web: Option<&Value>, settings: Option<&Value>) {
    let Value::Object(flat) = &mut state.properties else {
        return;
    };

    let mut site_config = match web.and_then(|w| w.get("properties")) {
        Some(Value::Object(config)) => config.clone(),
        _ => match flat.get("siteConfig") {
            Some(Value::Object(config)) => config.clone(),
            _ => Map::new(),
        },
    };

    if let Some(Value::Object(values)) = settings.and_then(|s| s.get("properties")) {
        let list: Vec<Value> = values
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        site_config.insert("appSettings".to_string(), Value::Array(list));
    }

    flat.insert("siteConfig".to_string(), Value::Object(site_config));
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUB: &str = "00000000-0000-0000-0000-000000000000";

    fn key(resource_type: ResourceType, scope: Option<&str>, name: &str) -> ResourceKey {
        ResourceKey::new(resource_type, scope.map(String::from), name)
    }

    #[test]
    fn test_locate_resources() {
        let rg = locate(SUB, &key(ResourceType::ResourceGroup, None, "demo-rg")).unwrap();
        assert_eq!(rg.id, format!("/subscriptions/{}/resourceGroups/demo-rg", SUB));
        assert_eq!(rg.api_version, "2021-04-01");

        let aks = locate(SUB, &key(ResourceType::ManagedCluster, Some("demo-rg"), "aks")).unwrap();
        assert_eq!(
            aks.id,
            format!(
                "/subscriptions/{}/resourceGroups/demo-rg/providers/Microsoft.ContainerService/managedClusters/aks",
                SUB
            )
        );
        assert_eq!(
            aks.child("listClusterUserCredential"),
            format!("{}/listClusterUserCredential", aks.id)
        );

        let missing_group = locate(SUB, &key(ResourceType::WebApp, None, "app"));
        assert!(matches!(missing_group, Err(CloudError::Configuration(_))));

        let kube = locate(SUB, &key(ResourceType::kubernetes("Deployment"), Some("ns"), "api"));
        assert!(kube.is_err());
    }

    #[test]
    fn test_role_assignment_name_is_stable() {
        let scope = "/subscriptions/x/resourceGroups/rg/providers/Microsoft.ContainerRegistry/registries/acr";
        let a = role_assignment_name(scope, "aks-acr-pull");
        assert_eq!(a, role_assignment_name(scope, "aks-acr-pull"));
        assert_ne!(a, role_assignment_name(scope, "other"));

        let grant = locate(SUB, &key(ResourceType::RoleAssignment, Some(scope), "aks-acr-pull")).unwrap();
        assert!(grant.id.starts_with(scope));
        assert!(grant.id.ends_with(&a.to_string()));
    }

    #[test]
    fn test_request_body_splits_envelope() {
        let registry = key(ResourceType::ContainerRegistry, Some("rg"), "acr");
        let body = request_body(
            SUB,
            &registry,
            &json!({
                "location": "eastus",
                "sku": { "name": "Basic" },
                "tags": { "environment": "dev" },
                "adminUserEnabled": true,
            }),
        );
        assert_eq!(body["location"], "eastus");
        assert_eq!(body["sku"]["name"], "Basic");
        assert_eq!(body["properties"], json!({ "adminUserEnabled": true }));

        let rg = request_body(SUB, &key(ResourceType::ResourceGroup, None, "rg"), &json!({ "location": "eastus" }));
        assert!(rg.get("properties").is_none());
    }

    #[test]
    fn test_role_definition_round_trip() {
        let grant = key(ResourceType::RoleAssignment, Some("/scope"), "aks-acr-pull");
        let desired = json!({
            "principalId": "kubelet",
            "principalType": "ServicePrincipal",
            "roleDefinitionId": "7f951dda-4ed3-4680-a7ca-43fe172d538d",
        });
        let body = request_body(SUB, &grant, &desired);
        let full = body["properties"]["roleDefinitionId"].as_str().unwrap();
        assert!(full.starts_with(&format!("/subscriptions/{}/providers/", SUB)));

        let mut document = body.clone();
        document["id"] = json!("/scope/providers/Microsoft.Authorization/roleAssignments/guid");
        document["properties"]["scope"] = json!("/scope");
        let state = actual_state(&grant, &document);
        assert!(state.matches(&desired));
    }

    #[test]
    fn test_actual_state_outputs() {
        let cluster = key(ResourceType::ManagedCluster, Some("rg"), "aks");
        let document = json!({
            "id": "/subscriptions/x/resourceGroups/rg/providers/Microsoft.ContainerService/managedClusters/aks",
            "location": "eastus",
            "identity": { "type": "SystemAssigned", "principalId": "p-1" },
            "properties": {
                "provisioningState": "Succeeded",
                "dnsPrefix": "aks-dns",
                "fqdn": "aks-dns.hcp.eastus.azmk8s.io",
                "identityProfile": { "kubeletidentity": { "objectId": "kubelet-oid" } },
            },
        });

        let state = actual_state(&cluster, &document);
        assert_eq!(state.outputs["kubeletIdentityObjectId"], "kubelet-oid");
        assert_eq!(state.outputs["fqdn"], "aks-dns.hcp.eastus.azmk8s.io");
        assert!(state.matches(&json!({
            "location": "eastus",
            "dnsPrefix": "aks-dns",
            "identity": { "type": "SystemAssigned" },
        })));
        assert_eq!(provisioning_state(&document), Some("Succeeded"));
        assert!(is_terminal("succeeded"));
        assert!(!is_terminal("Creating"));
    }

    #[test]
    fn test_merge_site_config() {
        let site = key(ResourceType::WebApp, Some("rg"), "backend");
        let mut state = actual_state(
            &site,
            &json!({
                "id": "/sites/backend",
                "kind": "app,linux,container",
                "properties": { "defaultHostName": "backend.azurewebsites.net", "siteConfig": { "appSettings": null } },
            }),
        );
        merge_site_config(
            &mut state,
            Some(&json!({ "properties": { "linuxFxVersion": "DOCKER|acr.azurecr.io/backend-service:latest", "alwaysOn": false } })),
            Some(&json!({ "properties": { "PORT": "3001", "NODE_ENV": "production" } })),
        );

        assert!(state.matches(&json!({
            "siteConfig": {
                "alwaysOn": false,
                "appSettings": [
                    { "name": "NODE_ENV", "value": "production" },
                    { "name": "PORT", "value": "3001" },
                ],
            },
        })));
        assert_eq!(state.outputs["defaultHostName"], "backend.azurewebsites.net");
    }
}
