//! App Service variant: two container web apps behind one Linux plan

use super::{
    APP_SERVICE_PLAN, BACKEND_APP, FRONTEND_APP, OutputSpec, REGISTRY, RESOURCE_GROUP,
    StackDefinition, container_registry, declare, registry_outputs, resource_group,
};
use crate::error::{Result, StackError};
use crate::graph::ResourceGraph;
use crate::model::{CredentialField, Platform, PropertyValue, Resource, ResourceType, StackConfig};
use serde_json::json;
use std::collections::BTreeMap;

fn setting(name: &str, value: PropertyValue) -> PropertyValue {
    PropertyValue::Map(BTreeMap::from([
        ("name".to_string(), PropertyValue::literal(name)),
        ("value".to_string(), value),
    ]))
}

fn web_app(
    config: &StackConfig,
    id: &str,
    name: &str,
    service: &str,
    port: u16,
    extra: Vec<PropertyValue>,
) -> Result<Resource> {
    let mut settings = vec![
        setting("WEBSITES_ENABLE_APP_SERVICE_STORAGE", PropertyValue::literal("false")),
        setting(
            "DOCKER_REGISTRY_SERVER_URL",
            PropertyValue::template(&format!("https://${{{}.loginServer}}", REGISTRY))?,
        ),
        setting(
            "DOCKER_REGISTRY_SERVER_USERNAME",
            PropertyValue::credential(REGISTRY, CredentialField::Username),
        ),
        setting(
            "DOCKER_REGISTRY_SERVER_PASSWORD",
            PropertyValue::credential(REGISTRY, CredentialField::Password),
        ),
        setting("PORT", PropertyValue::literal(port.to_string())),
    ];
    settings.extend(extra);
    settings.push(setting("NODE_ENV", PropertyValue::literal("production")));
    settings.push(setting(
        "DD_SERVICE",
        PropertyValue::literal(format!("{}-service", service)),
    ));
    settings.push(setting(
        "DD_ENV",
        PropertyValue::literal(config.environment.as_str()),
    ));

    let site_config = PropertyValue::Map(BTreeMap::from([
        (
            "linuxFxVersion".to_string(),
            PropertyValue::template(&format!(
                "DOCKER|${{{}.loginServer}}/{}-service:latest",
                REGISTRY, service
            ))?,
        ),
        ("alwaysOn".to_string(), PropertyValue::literal(false)),
        ("appSettings".to_string(), PropertyValue::List(settings)),
    ]));

    let mut tags = config.tags();
    tags["service"] = json!(service);

    Ok(Resource::new(id, ResourceType::WebApp, name)
        .with_scope(PropertyValue::output(RESOURCE_GROUP, "name"))
        .with_property("location", PropertyValue::output(RESOURCE_GROUP, "location"))
        .with_property("serverFarmId", PropertyValue::output(APP_SERVICE_PLAN, "id"))
        .with_literal("kind", "app,linux,container")
        .with_property("siteConfig", site_config)
        .with_literal("httpsOnly", true)
        .with_literal("tags", tags))
}

pub(super) fn build(config: &StackConfig) -> Result<StackDefinition> {
    let registry = config.registry.as_ref().ok_or_else(|| {
        StackError::InvalidConfig("the app-service platform requires a registry".to_string())
    })?;
    let app = &config.app_service;

    let mut graph = ResourceGraph::new();
    let mut outputs = vec![OutputSpec::new(
        "resourceGroupName",
        PropertyValue::output(RESOURCE_GROUP, "name"),
    )];

    declare(&mut graph, config, resource_group(config))?;
    declare(&mut graph, config, container_registry(config, registry))?;
    registry_outputs(&mut outputs);

    // Letter of the SKU ("B1" -> "B") is the family
    let family: String = app.sku.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    declare(
        &mut graph,
        config,
        Resource::new(APP_SERVICE_PLAN, ResourceType::AppServicePlan, &app.plan_name)
            .with_scope(PropertyValue::output(RESOURCE_GROUP, "name"))
            .with_property("location", PropertyValue::output(RESOURCE_GROUP, "location"))
            .with_literal("kind", "linux")
            .with_literal("reserved", true)
            .with_literal(
                "sku",
                json!({
                    "name": app.sku,
                    "tier": app.tier,
                    "size": app.sku,
                    "family": family,
                    "capacity": app.capacity,
                }),
            )
            .with_literal("tags", config.tags()),
    )?;

    declare(
        &mut graph,
        config,
        web_app(
            config,
            BACKEND_APP,
            &app.backend_app_name,
            "backend",
            app.backend_port,
            Vec::new(),
        )?,
    )?;

    declare(
        &mut graph,
        config,
        web_app(
            config,
            FRONTEND_APP,
            &app.frontend_app_name,
            "frontend",
            app.frontend_port,
            vec![setting(
                "BACKEND_URL",
                PropertyValue::template(&format!("https://${{{}.defaultHostName}}", BACKEND_APP))?,
            )],
        )?,
    )?;

    outputs.push(OutputSpec::new(
        "backendUrl",
        PropertyValue::template(&format!("https://${{{}.defaultHostName}}", BACKEND_APP))?,
    ));
    outputs.push(OutputSpec::new(
        "frontendUrl",
        PropertyValue::template(&format!("https://${{{}.defaultHostName}}", FRONTEND_APP))?,
    ));
    outputs.push(OutputSpec::new(
        "appServicePlanName",
        PropertyValue::output(APP_SERVICE_PLAN, "name"),
    ));

    Ok(StackDefinition {
        name: config.project.clone(),
        platform: Platform::AppService,
        graph,
        workloads: None,
        outputs,
    })
}
