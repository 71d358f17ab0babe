//! KDL parser
//!
//! Reads a `stack.kdl` file into a [`StackConfig`]. Keys missing from the
//! file keep the environment fallbacks (`LOCATION`, `NODE_SIZE`) and the
//! built-in defaults.

mod stack;

use stack::{parse_app_service, parse_cluster, parse_registry, parse_timeouts, parse_workloads};

use crate::error::{Result, StackError};
use crate::model::StackConfig;
use kdl::{KdlDocument, KdlNode};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Parse a stack file
pub fn parse_stack_file<P: AsRef<Path>>(path: P) -> Result<StackConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| StackError::IoError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_stack_string(&content)
}

/// Parse stack KDL from a string
///
/// The settings may sit inside a `stack "<project>" { ... }` node or at the
/// top level of the document.
pub fn parse_stack_string(content: &str) -> Result<StackConfig> {
    let doc: KdlDocument = content.parse()?;
    let mut config = StackConfig::with_env_defaults();

    let stack_node = doc.nodes().iter().find(|n| n.name().value() == "stack");
    match stack_node {
        Some(node) => {
            if let Some(project) = string_arg(node) {
                config.project = project;
            }
            if let Some(children) = node.children() {
                apply_nodes(&mut config, children)?;
            }
        }
        None => apply_nodes(&mut config, &doc)?,
    }

    Ok(config)
}

fn apply_nodes(config: &mut StackConfig, doc: &KdlDocument) -> Result<()> {
    for node in doc.nodes() {
        match node.name().value() {
            "project" => {
                if let Some(project) = string_arg(node) {
                    config.project = project;
                }
            }
            "environment" | "env" => {
                if let Some(environment) = string_arg(node) {
                    config.environment = environment;
                }
            }
            "platform" => {
                if let Some(platform) = string_arg(node) {
                    config.platform = platform.parse()?;
                }
            }
            "location" => {
                if let Some(location) = string_arg(node) {
                    config.location = location;
                }
            }
            "resource-group" | "resource_group" => {
                if let Some(rg) = string_arg(node) {
                    config.resource_group = rg;
                }
            }
            "concurrency" => {
                if let Some(value) = integer_arg(node) {
                    config.concurrency = value as usize;
                }
            }
            "max-attempts" | "max_attempts" => {
                if let Some(value) = integer_arg(node) {
                    config.max_attempts = value as u32;
                }
            }
            "registry" => parse_registry(node, config),
            "cluster" => parse_cluster(node, &mut config.cluster)?,
            "app-service" | "app_service" => parse_app_service(node, &mut config.app_service),
            "workloads" => parse_workloads(node, &mut config.workloads),
            "timeouts" => parse_timeouts(node, &mut config.timeouts)?,
            _ => {
                // unknown nodes are ignored so files stay forward compatible
            }
        }
    }
    Ok(())
}

/// Parse a duration such as `60m`, `30s`, `2h` or a bare number of seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || {
        StackError::InvalidConfig(format!(
            "invalid duration '{}', expected e.g. 1h, 30m, 90s",
            s
        ))
    };

    let (digits, unit) = if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else if let Some(minutes) = s.strip_suffix('m') {
        (minutes, 60)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else {
        (s, 1)
    };

    let n: u64 = digits.trim().parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(n * unit))
}

pub(crate) fn string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries().first().and_then(|e| e.value().as_integer())
}

pub(crate) fn bool_arg(node: &KdlNode) -> Option<bool> {
    node.entries().first().and_then(|e| e.value().as_bool())
}

/// Duration given either as a string (`"20m"`) or as integer seconds
pub(crate) fn duration_arg(node: &KdlNode) -> Result<Option<Duration>> {
    let Some(entry) = node.entries().first() else {
        return Ok(None);
    };
    if let Some(secs) = entry.value().as_integer() {
        return Ok(Some(Duration::from_secs(secs.max(0) as u64)));
    }
    match entry.value().as_string() {
        Some(s) => parse_duration(s).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests;
