use super::*;
use crate::model::{CredentialScope, ManifestSet, Platform};
use std::path::PathBuf;

fn parse(kdl: &str) -> StackConfig {
    temp_env::with_vars_unset(["LOCATION", "NODE_SIZE"], || {
        parse_stack_string(kdl).unwrap()
    })
}

#[test]
fn test_parse_empty_document_keeps_defaults() {
    let config = parse("");
    assert_eq!(config, StackConfig::default());
}

#[test]
fn test_parse_cluster_stack() {
    let kdl = r#"
        stack "shop" {
            environment "staging"
            location "westeurope"
            resource-group "shop-rg"
            concurrency 4

            registry "shopacr01" {
                sku "Standard"
                admin-user #false
            }

            cluster "shop-aks" {
                dns-prefix "shop"
                credentials "admin"
                node-pool "system" {
                    vm-size "Standard_B2s"
                    count 2
                    os-disk-gb 64
                    auto-scaling #true
                }
                network {
                    plugin "kubenet"
                    service-cidr "10.1.0.0/16"
                }
            }
        }
    "#;

    let config = parse(kdl);
    assert_eq!(config.project, "shop");
    assert_eq!(config.environment, "staging");
    assert_eq!(config.location, "westeurope");
    assert_eq!(config.resource_group, "shop-rg");
    assert_eq!(config.concurrency, 4);
    assert_eq!(config.platform, Platform::Cluster);

    let registry = config.registry.unwrap();
    assert_eq!(registry.name, "shopacr01");
    assert_eq!(registry.sku, "Standard");
    assert!(!registry.admin_user_enabled);

    let cluster = config.cluster;
    assert_eq!(cluster.name, "shop-aks");
    assert_eq!(cluster.dns_prefix(), "shop");
    assert_eq!(cluster.credential_scope, CredentialScope::Admin);
    assert_eq!(cluster.node_pool.name, "system");
    assert_eq!(cluster.node_pool.vm_size, "Standard_B2s");
    assert_eq!(cluster.node_pool.count, 2);
    assert_eq!(cluster.node_pool.os_disk_size_gb, Some(64));
    assert!(cluster.node_pool.enable_auto_scaling);

    let network = cluster.network.unwrap();
    assert_eq!(network.network_plugin, "kubenet");
    assert_eq!(network.service_cidr, "10.1.0.0/16");
    assert_eq!(network.dns_service_ip, "10.0.0.10");
}

#[test]
fn test_parse_top_level_nodes() {
    let kdl = r#"
        project "flat"
        platform "app-service"
        registry "flatacr99"
    "#;

    let config = parse(kdl);
    assert_eq!(config.project, "flat");
    assert_eq!(config.platform, Platform::AppService);
    assert_eq!(config.registry.unwrap().name, "flatacr99");
}

#[test]
fn test_parse_app_service() {
    let kdl = r#"
        stack "demo" {
            platform "webapp"
            app-service {
                plan "demo-plan"
                sku "S1"
                tier "Standard"
                capacity 2
                backend "demo-api" port=8080
                frontend "demo-web"
            }
        }
    "#;

    let config = parse(kdl);
    let app = config.app_service;
    assert_eq!(config.platform, Platform::AppService);
    assert_eq!(app.plan_name, "demo-plan");
    assert_eq!(app.sku, "S1");
    assert_eq!(app.capacity, 2);
    assert_eq!(app.backend_app_name, "demo-api");
    assert_eq!(app.backend_port, 8080);
    assert_eq!(app.frontend_app_name, "demo-web");
    assert_eq!(app.frontend_port, 3000);
}

#[test]
fn test_parse_workloads_and_timeouts() {
    let kdl = r#"
        stack "demo" {
            workloads {
                namespace "shop"
                replicas 3
                manifests "k8s/app.yaml" "k8s/ingress.yaml"
            }
            timeouts {
                managed-cluster "90m"
                kubernetes 120
                resource-group "1h"
            }
        }
    "#;

    let config = parse(kdl);
    assert!(config.workloads.enabled);
    assert_eq!(config.workloads.namespace, "shop");
    assert_eq!(config.workloads.replicas, 3);
    assert_eq!(
        config.workloads.manifests,
        ManifestSet::Files(vec![
            PathBuf::from("k8s/app.yaml"),
            PathBuf::from("k8s/ingress.yaml")
        ])
    );
    assert_eq!(
        config.timeouts["managed-cluster"],
        Duration::from_secs(90 * 60)
    );
    assert_eq!(config.timeouts["kubernetes"], Duration::from_secs(120));
    assert_eq!(config.timeouts["resource-group"], Duration::from_secs(3600));
}

#[test]
fn test_parse_disabled_sections() {
    let kdl = r#"
        stack "bare" {
            registry #false
            workloads #false
        }
    "#;

    let config = parse(kdl);
    assert!(config.registry.is_none());
    assert!(!config.workloads.enabled);
}

#[test]
fn test_env_fallbacks_apply_when_absent() {
    temp_env::with_vars(
        [("LOCATION", Some("japaneast")), ("NODE_SIZE", Some("Standard_D4s_v5"))],
        || {
            let config = parse_stack_string(r#"stack "demo" {}"#).unwrap();
            assert_eq!(config.location, "japaneast");
            assert_eq!(config.cluster.node_pool.vm_size, "Standard_D4s_v5");

            // explicit file value wins over the environment
            let config = parse_stack_string(r#"stack "demo" { location "eastus2" }"#).unwrap();
            assert_eq!(config.location, "eastus2");
        },
    );
}

#[test]
fn test_invalid_values() {
    assert!(parse_stack_string(r#"platform "mainframe""#).is_err());
    assert!(parse_stack_string(r#"cluster { credentials "root" }"#).is_err());
    assert!(parse_stack_string(r#"timeouts { managed-cluster "forever" }"#).is_err());
    assert!(parse_stack_string("stack {").is_err());
}

#[test]
fn test_parse_duration() {
    assert_eq!(parse_duration("60m").unwrap(), Duration::from_secs(3600));
    assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
    assert_eq!(parse_duration(" 300 ").unwrap(), Duration::from_secs(300));
    assert!(parse_duration("m").is_err());
    assert!(parse_duration("-5m").is_err());
}

#[test]
fn test_parse_stack_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stack.kdl");
    std::fs::write(&path, r#"stack "from-file" { environment "prod" }"#).unwrap();

    let config = temp_env::with_vars_unset(["LOCATION", "NODE_SIZE"], || {
        parse_stack_file(&path).unwrap()
    });
    assert_eq!(config.project, "from-file");
    assert_eq!(config.environment, "prod");

    let missing = parse_stack_file(dir.path().join("missing.kdl"));
    assert!(matches!(missing, Err(StackError::IoError { .. })));
}
