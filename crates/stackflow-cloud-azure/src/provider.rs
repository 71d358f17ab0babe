//! Azure provider implementation

use crate::arm::{self, ArmResource};
use crate::az::{AzCli, Method};
use crate::error::{AzureError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use stackflow_cloud::{
    ActualState, AuthStatus, CloudProvider, CredentialSource, CredentialTarget,
    ResolvedResource, ResourceKey,
};
use stackflow_core::model::{CredentialScope, ResourceType};
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Azure provider driving Resource Manager through the az CLI
pub struct AzureProvider {
    az: AzCli,
    poll_interval: Duration,
}

impl AzureProvider {
    pub fn new(subscription: Option<String>) -> Self {
        Self {
            az: AzCli::new(subscription),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn cli(&self) -> &AzCli {
        &self.az
    }

    async fn locate(&self, key: &ResourceKey) -> Result<ArmResource> {
        let subscription = self.az.subscription_id().await?;
        Ok(arm::locate(&subscription, key)?)
    }

    /// Read a resource and, for web apps, the configuration the site
    /// document omits
    async fn read_document(&self, key: &ResourceKey, target: &ArmResource) -> Result<Option<ActualState>> {
        let Some(document) = self.az.get(&target.id, target.api_version).await? else {
            return Ok(None);
        };
        let mut state = arm::actual_state(key, &document);

        if key.resource_type == ResourceType::WebApp {
            let web = self
                .az
                .get(&target.child("config/web"), target.api_version)
                .await?;
            let settings = self
                .az
                .rest(
                    Method::Post,
                    &target.child("config/appsettings/list"),
                    target.api_version,
                    None,
                )
                .await?;
            arm::merge_site_config(&mut state, web.as_ref(), settings.as_ref());
        }
        Ok(Some(state))
    }

    /// PUT the declared document and wait for provisioning to finish
    async fn put(&self, resource: &ResolvedResource) -> Result<ActualState> {
        let key = &resource.key;
        let subscription = self.az.subscription_id().await?;
        let target = arm::locate(&subscription, key)?;
        let body = arm::request_body(&subscription, key, &resource.properties);

        let response = self
            .az
            .rest(Method::Put, &target.id, target.api_version, Some(&body))
            .await?;

        let settled = response
            .as_ref()
            .and_then(arm::provisioning_state)
            .is_none_or(|state| state.eq_ignore_ascii_case("Succeeded"));
        if !settled {
            self.wait_provisioned(key, &target).await?;
        }

        self.read_document(key, &target)
            .await?
            .ok_or_else(|| AzureError::UnexpectedResponse(format!("{} vanished after PUT", key)))
    }

    async fn wait_provisioned(&self, key: &ResourceKey, target: &ArmResource) -> Result<()> {
        loop {
            let document = self.az.get(&target.id, target.api_version).await?;
            match document.as_ref().and_then(arm::provisioning_state) {
                Some(state) if arm::is_terminal(state) => {
                    if state.eq_ignore_ascii_case("Succeeded") {
                        return Ok(());
                    }
                    return Err(AzureError::UnexpectedResponse(format!(
                        "{} provisioning ended in state {}",
                        key, state
                    )));
                }
                Some(state) => {
                    tracing::debug!("{} is {}", key, state);
                }
                None if document.is_some() => return Ok(()),
                None => tracing::debug!("{} not visible yet", key),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_deleted(&self, key: &ResourceKey, target: &ArmResource) -> Result<()> {
        while self.az.get(&target.id, target.api_version).await?.is_some() {
            tracing::debug!("Waiting for {} to be deleted", key);
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(())
    }

    async fn cluster_credentials(&self, key: &ResourceKey, scope: CredentialScope) -> Result<Vec<String>> {
        let target = self.locate(key).await?;
        let action = match scope {
            CredentialScope::Admin => "listClusterAdminCredential",
            CredentialScope::User => "listClusterUserCredential",
        };
        let response = self
            .az
            .rest(Method::Post, &target.child(action), target.api_version, None)
            .await?;

        // kubeconfig values come back base64-encoded already
        Ok(response
            .as_ref()
            .and_then(|r| r.get("kubeconfigs"))
            .and_then(|k| k.as_array())
            .map(|configs| {
                configs
                    .iter()
                    .filter_map(|c| c.get("value").and_then(|v| v.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn registry_credentials(&self, key: &ResourceKey) -> Result<Vec<String>> {
        let group = key.scope.as_deref().ok_or_else(|| {
            AzureError::UnexpectedResponse(format!("{} has no resource group", key))
        })?;
        let response = match self.az.acr_credentials(&key.name, group).await {
            Ok(response) => response,
            Err(AzureError::Validation(msg)) | Err(AzureError::CommandFailed { message: msg, .. })
                if is_admin_disabled(&msg) =>
            {
                tracing::debug!("{} has no admin user", key);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        Ok(registry_payloads(Some(&response)))
    }
}

fn is_admin_disabled(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("admin user is disabled") || lower.contains("--admin-enabled")
}

/// `username:password` payloads, one per registry password
fn registry_payloads(response: Option<&Value>) -> Vec<String> {
    let Some(response) = response else {
        return Vec::new();
    };
    let Some(username) = response.get("username").and_then(|u| u.as_str()) else {
        return Vec::new();
    };
    response
        .get("passwords")
        .and_then(|p| p.as_array())
        .into_iter()
        .flatten()
        .filter_map(|p| p.get("value").and_then(|v| v.as_str()))
        .map(|password| STANDARD.encode(format!("{}:{}", username, password)))
        .collect()
}

#[async_trait]
impl CloudProvider for AzureProvider {
    fn name(&self) -> &str {
        "azure"
    }

    fn display_name(&self) -> &str {
        "Microsoft Azure"
    }

    async fn check_auth(&self) -> stackflow_cloud::Result<AuthStatus> {
        match self.az.check_auth().await {
            Ok(account) => {
                let user = account
                    .user
                    .as_ref()
                    .map(|u| u.name.as_str())
                    .unwrap_or("unknown user");
                Ok(AuthStatus::ok(format!("{} ({}) as {}", account.name, account.id, user)))
            }
            Err(AzureError::ToolNotFound(_)) => Ok(AuthStatus::failed(
                "az is not installed. See https://learn.microsoft.com/cli/azure/install-azure-cli",
            )),
            Err(e) => Ok(AuthStatus::failed(e.to_string())),
        }
    }

    async fn read(&self, key: &ResourceKey) -> stackflow_cloud::Result<Option<ActualState>> {
        let target = self.locate(key).await?;
        Ok(self.read_document(key, &target).await?)
    }

    async fn create(&self, resource: &ResolvedResource) -> stackflow_cloud::Result<ActualState> {
        tracing::info!("Creating {}", resource.key);
        Ok(self.put(resource).await?)
    }

    async fn update(
        &self,
        resource: &ResolvedResource,
        _actual: &ActualState,
    ) -> stackflow_cloud::Result<ActualState> {
        tracing::info!("Updating {}", resource.key);
        Ok(self.put(resource).await?)
    }

    async fn delete(&self, key: &ResourceKey) -> stackflow_cloud::Result<()> {
        let target = self.locate(key).await?;
        tracing::info!("Deleting {}", key);
        match self
            .az
            .rest(Method::Delete, &target.id, target.api_version, None)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        Ok(self.wait_deleted(key, &target).await?)
    }
}

#[async_trait]
impl CredentialSource for AzureProvider {
    async fn fetch(&self, target: &CredentialTarget) -> stackflow_cloud::Result<Vec<String>> {
        let payloads = match target {
            CredentialTarget::Cluster { key, scope } => self.cluster_credentials(key, *scope).await?,
            CredentialTarget::Registry { key } => self.registry_credentials(key).await?,
        };
        Ok(payloads)
    }
}
