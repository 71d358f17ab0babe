//! Azure CLI wrapper
//!
//! Resource operations go through `az rest` against Azure Resource Manager;
//! the CLI supplies the login and subscription.

use crate::error::{AzureError, Result, classify};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::OnceCell;

const ARM_ENDPOINT: &str = "https://management.azure.com";

/// Account reported by `az account show`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzAccount {
    /// Subscription id
    pub id: String,
    pub name: String,
    #[serde(rename = "tenantId", default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub user: Option<AzUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzUser {
    pub name: String,
    #[serde(rename = "type")]
    pub user_type: String,
}

/// HTTP method for `az rest`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Put => "put",
            Method::Post => "post",
            Method::Delete => "delete",
        }
    }
}

/// Azure CLI wrapper
pub struct AzCli {
    subscription: Option<String>,
    account: OnceCell<AzAccount>,
}

impl AzCli {
    /// Use the CLI's default subscription unless one is given
    pub fn new(subscription: Option<String>) -> Self {
        Self {
            subscription,
            account: OnceCell::new(),
        }
    }

    /// Check that az is installed and logged in
    pub async fn check_auth(&self) -> Result<AzAccount> {
        let which = Command::new("which").arg("az").output().await?;
        if !which.status.success() {
            return Err(AzureError::ToolNotFound("az"));
        }
        self.account().await.cloned()
    }

    /// Account of the active (or configured) subscription, looked up once
    pub async fn account(&self) -> Result<&AzAccount> {
        self.account
            .get_or_try_init(|| async {
                let mut args = vec!["account", "show", "--output", "json"];
                if let Some(subscription) = &self.subscription {
                    args.push("--subscription");
                    args.push(subscription.as_str());
                }
                let output = self.run_command(&args).await?;
                let account: AzAccount = serde_json::from_str(&output)?;
                Ok::<_, AzureError>(account)
            })
            .await
    }

    pub async fn subscription_id(&self) -> Result<String> {
        Ok(self.account().await?.id.clone())
    }

    /// Call Resource Manager. `path` is an ARM id, optionally followed by an
    /// action segment; an empty response body yields `None`
    pub async fn rest(
        &self,
        method: Method,
        path: &str,
        api_version: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        let url = format!("{}{}?api-version={}", ARM_ENDPOINT, path, api_version);

        // bodies can hold registry passwords and never reach argv
        let body_file = match body {
            Some(body) => {
                let mut file = tempfile::NamedTempFile::new()?;
                file.write_all(serde_json::to_string(body)?.as_bytes())?;
                file.flush()?;
                Some(file)
            }
            None => None,
        };
        let body_arg = body_file
            .as_ref()
            .map(|f| format!("@{}", f.path().display()));

        let mut args = vec![
            "rest",
            "--method",
            method.as_str(),
            "--url",
            url.as_str(),
            "--output",
            "json",
        ];
        if let Some(body_arg) = &body_arg {
            args.push("--body");
            args.push(body_arg.as_str());
            args.push("--headers");
            args.push("Content-Type=application/json");
        }

        let output = self.run_command(&args).await?;
        if output.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&output)?))
    }

    /// GET an ARM resource, `None` when it does not exist
    pub async fn get(&self, path: &str, api_version: &str) -> Result<Option<Value>> {
        match self.rest(Method::Get, path, api_version, None).await {
            Ok(body) => Ok(body),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Admin login of a container registry (`az acr credential show`)
    pub async fn acr_credentials(&self, name: &str, resource_group: &str) -> Result<Value> {
        let output = self
            .run_command(&[
                "acr",
                "credential",
                "show",
                "--name",
                name,
                "--resource-group",
                resource_group,
                "--output",
                "json",
            ])
            .await?;
        Ok(serde_json::from_str(&output)?)
    }

    /// Run an az command and return stdout
    async fn run_command(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("az");
        cmd.args(args);
        cmd.arg("--only-show-errors");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("Running: az {}", args.join(" "));

        let output = cmd.output().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AzureError::ToolNotFound("az"),
            _ => AzureError::IoError(e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify("az", &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
