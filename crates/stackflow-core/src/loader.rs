//! Stack loader
//!
//! Reads the stack file and builds the resource graph in one step.

use crate::builder::{StackDefinition, build_stack};
use crate::error::Result;
use crate::model::StackConfig;
use crate::parser::parse_stack_file;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// A parsed stack file together with the directory it was read from
#[derive(Debug, Clone)]
pub struct LoadedStack {
    pub path: PathBuf,
    pub config: StackConfig,
    pub definition: StackDefinition,
}

impl LoadedStack {
    /// Directory that relative manifest paths resolve against
    pub fn base_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Load a stack file and build its definition
#[instrument(skip(path), fields(path = %path.display()))]
pub fn load_stack(path: &Path) -> Result<LoadedStack> {
    debug!("Parsing stack file");
    let config = parse_stack_file(path)?;
    load_stack_with_config(path, config)
}

/// Build a definition from an already parsed (and possibly overridden) config
pub fn load_stack_with_config(path: &Path, config: StackConfig) -> Result<LoadedStack> {
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let definition = build_stack(&config, base_dir)?;
    info!(
        stack = %definition.name,
        platform = %definition.platform,
        resources = definition.graph.len(),
        "Stack loaded"
    );

    Ok(LoadedStack {
        path: path.to_path_buf(),
        config,
        definition,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_stack_resolves_manifests_next_to_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("k8s")).unwrap();
        fs::write(
            dir.path().join("k8s/app.yaml"),
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: shop\n",
        )
        .unwrap();
        let path = dir.path().join("stack.kdl");
        fs::write(
            &path,
            r#"stack "shop" { workloads { manifests "k8s/app.yaml" } }"#,
        )
        .unwrap();

        let loaded = load_stack(&path).unwrap();
        assert_eq!(loaded.base_dir(), dir.path());
        assert_eq!(loaded.definition.name, "shop");
        assert_eq!(loaded.definition.workloads.unwrap().graph.len(), 1);
    }

    #[test]
    fn test_load_stack_surfaces_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.kdl");
        fs::write(&path, r#"stack "x" { concurrency 0 }"#).unwrap();

        let err = load_stack(&path).unwrap_err();
        assert!(err.is_configuration_error());
    }
}
