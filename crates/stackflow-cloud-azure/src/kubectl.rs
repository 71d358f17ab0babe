//! kubectl wrapper
//!
//! Every call is pinned to one kubeconfig file and context so concurrent
//! workload passes never touch the user's current context.

use crate::error::{AzureError, Result, classify};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Field manager recorded on server-side applies
pub const FIELD_MANAGER: &str = "stackflow";

/// kubectl CLI wrapper
#[derive(Debug, Clone)]
pub struct Kubectl {
    kubeconfig: PathBuf,
    context: Option<String>,
}

/// `kind/name` plus the namespace flag when the object is namespaced
pub fn object_args(kind: &str, name: &str, namespace: Option<&str>) -> Vec<String> {
    let mut args = vec![format!("{}/{}", kind.to_lowercase(), name)];
    if let Some(ns) = namespace {
        args.push("--namespace".to_string());
        args.push(ns.to_string());
    }
    args
}

impl Kubectl {
    pub fn new(kubeconfig: impl Into<PathBuf>, context: Option<String>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            context,
        }
    }

    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }

    /// Server version, which also proves the credentials work
    pub async fn server_version(&self) -> Result<String> {
        let output = self.run_command(&["version", "--output", "json"], None).await?;
        let version: Value = serde_json::from_str(&output)?;
        Ok(version
            .pointer("/serverVersion/gitVersion")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    /// Live object, `None` when it does not exist
    pub async fn get(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<Option<Value>> {
        let mut args = vec!["get".to_string()];
        args.extend(object_args(kind, name, namespace));
        args.extend(["--output".to_string(), "json".to_string()]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        match self.run_command(&args, None).await {
            Ok(output) => Ok(Some(serde_json::from_str(&output)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Server-side apply of one object, returning the object as stored
    pub async fn apply(&self, manifest: &Value) -> Result<Value> {
        let input = serde_json::to_string(manifest)?;
        let output = self
            .run_command(
                &[
                    "apply",
                    "--server-side",
                    "--field-manager",
                    FIELD_MANAGER,
                    "--force-conflicts",
                    "--output",
                    "json",
                    "--filename",
                    "-",
                ],
                Some(&input),
            )
            .await?;
        Ok(serde_json::from_str(&output)?)
    }

    pub async fn delete(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<()> {
        let mut args = vec!["delete".to_string()];
        args.extend(object_args(kind, name, namespace));
        args.extend(["--ignore-not-found".to_string(), "--wait=true".to_string()]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        self.run_command(&args, None).await?;
        Ok(())
    }

    /// Run a kubectl command and return stdout
    async fn run_command(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut cmd = Command::new("kubectl");
        cmd.arg("--kubeconfig").arg(&self.kubeconfig);
        if let Some(context) = &self.context {
            cmd.arg("--context").arg(context);
        }
        cmd.args(args);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("Running: kubectl {}", args.join(" "));

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AzureError::ToolNotFound("kubectl"),
            _ => AzureError::IoError(e),
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify("kubectl", &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_args() {
        assert_eq!(
            object_args("Deployment", "backend", Some("microservices-demo")),
            vec!["deployment/backend", "--namespace", "microservices-demo"]
        );
        assert_eq!(object_args("Namespace", "demo", None), vec!["namespace/demo"]);
    }
}
