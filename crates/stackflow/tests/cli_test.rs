#![allow(deprecated)] // Command::cargo_bin

mod common;

use common::{APP_SERVICE_STACK, CLUSTER_STACK, TestProject};
use predicates::prelude::*;

#[test]
fn test_cli_help() {
    let project = TestProject::new();
    project
        .command()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("up"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("destroy"))
        .stdout(predicate::str::contains("outputs"));
}

#[test]
fn test_cli_version() {
    let project = TestProject::new();
    project
        .command()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("stackflow"));
}

#[test]
fn test_up_help() {
    let project = TestProject::new();
    project
        .command()
        .args(["up", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--concurrency"))
        .stdout(predicate::str::contains("--no-workloads"))
        .stdout(predicate::str::contains("--reveal"));
}

#[test]
fn test_invalid_command() {
    let project = TestProject::new();
    project.command().arg("invalid-command").assert().failure();
}

#[test]
fn test_validate_cluster_stack() {
    let project = TestProject::new();
    project.write_stack_kdl(CLUSTER_STACK);

    project
        .command()
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Stack is valid"))
        .stdout(predicate::str::contains("[0] resource-group shop-rg"))
        .stdout(predicate::str::contains("aks-cluster"))
        .stdout(predicate::str::contains("aks-acr-pull"))
        .stdout(predicate::str::contains("backend-deployment"))
        .stdout(predicate::str::contains("kubeconfig (sensitive)"));
}

#[test]
fn test_validate_without_workloads() {
    let project = TestProject::new();
    project.write_stack_kdl(
        r#"
stack "bare" {
    resource-group "bare-rg"
    registry "bareacr01"
    cluster "bare-aks"
    workloads #false
}
"#,
    );

    project
        .command()
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Workloads: disabled"))
        .stdout(predicate::str::contains("backend-deployment").not());
}

#[test]
fn test_validate_app_service_stack() {
    let project = TestProject::new();
    project.write_stack_kdl(APP_SERVICE_STACK);

    project
        .command()
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("app-service-plan"))
        .stdout(predicate::str::contains("backend-webapp"))
        .stdout(predicate::str::contains("frontend-webapp"))
        .stdout(predicate::str::contains("aks-cluster").not());
}

#[test]
fn test_validate_explicit_file() {
    let project = TestProject::new();
    let other = project.path().join("other.kdl");
    std::fs::write(&other, APP_SERVICE_STACK).unwrap();

    project
        .command()
        .args(["validate", "--file"])
        .arg(&other)
        .assert()
        .success()
        .stdout(predicate::str::contains("shopweb"));
}

#[test]
fn test_validate_rejects_bad_kdl() {
    let project = TestProject::new();
    project.write_stack_kdl("stack \"broken\" {\n    location \n");

    project
        .command()
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid stack"));
}

#[test]
fn test_validate_without_stack_file() {
    let project = TestProject::new();
    project.command().arg("validate").assert().failure();
}

#[test]
fn test_destroy_requires_confirmation() {
    let project = TestProject::new();
    project.write_stack_kdl(CLUSTER_STACK);

    let output = project
        .command()
        .arg("destroy")
        .assert()
        .success()
        .stdout(predicate::str::contains("--yes"))
        .get_output()
        .stdout
        .clone();

    // dependents are listed before what they depend on
    let stdout = String::from_utf8(output).unwrap();
    let workloads = stdout.find("- workloads").unwrap();
    let cluster = stdout.find("- aks-cluster").unwrap();
    let group = stdout.find("- resource-group").unwrap();
    assert!(workloads < cluster);
    assert!(cluster < group);
    assert!(!project.path().join(".stackflow").join("lock.json").exists());
}

#[test]
fn test_outputs_before_first_apply() {
    let project = TestProject::new();
    project.write_stack_kdl(CLUSTER_STACK);

    project
        .command()
        .arg("outputs")
        .assert()
        .success()
        .stdout(predicate::str::contains("No outputs recorded yet"));
}

#[test]
fn test_outputs_from_state() {
    let project = TestProject::new();
    project.write_stack_kdl(CLUSTER_STACK);
    project.write_state(
        r#"{
  "version": 1,
  "stack": "shop",
  "updated_at": "2026-01-01T00:00:00Z",
  "resources": {},
  "outputs": {
    "acrLoginServer": "shopacr01.azurecr.io",
    "aksClusterName": "shop-aks"
  }
}"#,
    );

    project
        .command()
        .arg("outputs")
        .assert()
        .success()
        .stdout(predicate::str::contains("acrLoginServer = shopacr01.azurecr.io"))
        .stdout(predicate::str::contains("aksClusterName = shop-aks"));

    project
        .command()
        .args(["outputs", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"aksClusterName\": \"shop-aks\""));
}

#[test]
fn test_outputs_rejects_foreign_state() {
    let project = TestProject::new();
    project.write_stack_kdl(CLUSTER_STACK);
    project.write_state(
        r#"{"version":1,"stack":"other","updated_at":"2026-01-01T00:00:00Z","resources":{},"outputs":{}}"#,
    );

    project
        .command()
        .arg("outputs")
        .assert()
        .failure()
        .stderr(predicate::str::contains("belongs to stack 'other'"));
}

#[test]
fn test_foreign_state_stops_before_azure_calls() {
    let project = TestProject::new();
    project.write_stack_kdl(CLUSTER_STACK);
    project.write_state(
        r#"{"version":1,"stack":"other","updated_at":"2026-01-01T00:00:00Z","resources":{},"outputs":{}}"#,
    );

    for args in [vec!["up"], vec!["destroy", "--yes"]] {
        project
            .command()
            .args(&args)
            .env("PATH", project.path().join("no-bin"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("belongs to stack 'other'"))
            .stdout(predicate::str::contains("Checking Azure login").not());
        assert!(!project.path().join(".stackflow").join("lock.json").exists());
    }
}

#[test]
fn test_newer_state_version_stops_up() {
    let project = TestProject::new();
    project.write_stack_kdl(CLUSTER_STACK);
    project.write_state(
        r#"{"version":99,"stack":"shop","updated_at":"2026-01-01T00:00:00Z","resources":{},"outputs":{}}"#,
    );

    project
        .command()
        .arg("up")
        .env("PATH", project.path().join("no-bin"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("newer than supported version"))
        .stdout(predicate::str::contains("Checking Azure login").not());
}
