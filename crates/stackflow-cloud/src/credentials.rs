//! Credential/secret resolution
//!
//! When a cluster settles, its access credentials are fetched in the
//! background; when a registry with an admin user settles, its admin login
//! is fetched. Consumers call [`CredentialResolver::get`], which returns the
//! cached bundle, joins a fetch already in flight, or starts one. Each
//! bundle sits in a single-resolution cell until it is invalidated.

use crate::deferred::DeferredCell;
use crate::error::{CloudError, Result};
use crate::events::StackEvent;
use crate::provider::{CredentialSource, CredentialTarget};
use crate::retry::{RetryConfig, retry_with_backoff};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde_yaml::Value as Yaml;
use stackflow_core::model::{CredentialField, CredentialScope, ResourceType};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Connection details of a cluster, decoded from its kubeconfig
#[derive(Clone, PartialEq, Eq)]
pub struct KubeConnection {
    pub server: String,
    pub cluster: String,
    pub context: String,
    pub user: String,
    pub namespace: Option<String>,
    /// Decoded kubeconfig document
    pub kubeconfig: String,
}

impl fmt::Debug for KubeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeConnection")
            .field("server", &self.server)
            .field("cluster", &self.cluster)
            .field("context", &self.context)
            .field("user", &self.user)
            .field("namespace", &self.namespace)
            .field("kubeconfig", &"<redacted>")
            .finish()
    }
}

/// Registry admin login
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryLogin {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryLogin")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionDescriptor {
    Cluster(KubeConnection),
    Registry(RegistryLogin),
}

/// Resolved credentials of one resource
#[derive(Clone)]
pub struct CredentialBundle {
    pub resource_id: String,
    /// Encoded payload as returned by the credential endpoint
    pub raw: String,
    pub descriptor: ConnectionDescriptor,
    pub resolved_at: DateTime<Utc>,
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("resource_id", &self.resource_id)
            .field("raw", &"<redacted>")
            .field("descriptor", &self.descriptor)
            .field("resolved_at", &self.resolved_at)
            .finish()
    }
}

impl CredentialBundle {
    /// Value of a credential field, if this kind of bundle carries it
    pub fn field(&self, field: CredentialField) -> Option<String> {
        match (&self.descriptor, field) {
            (ConnectionDescriptor::Registry(login), CredentialField::Username) => {
                Some(login.username.clone())
            }
            (ConnectionDescriptor::Registry(login), CredentialField::Password) => {
                Some(login.password.clone())
            }
            (ConnectionDescriptor::Cluster(conn), CredentialField::Kubeconfig) => {
                Some(conn.kubeconfig.clone())
            }
            _ => None,
        }
    }

    pub fn kube(&self) -> Option<&KubeConnection> {
        match &self.descriptor {
            ConnectionDescriptor::Cluster(conn) => Some(conn),
            ConnectionDescriptor::Registry(_) => None,
        }
    }
}

/// Decode a base64 payload for `target` into a connection descriptor
pub fn decode_payload(
    resource_id: &str,
    target: &CredentialTarget,
    payload: &str,
) -> Result<ConnectionDescriptor> {
    let decode_err = |message: String| CloudError::CredentialDecode {
        resource: resource_id.to_string(),
        message,
    };

    let payload = payload.trim();
    if payload.is_empty() {
        return Err(decode_err("empty payload".to_string()));
    }
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| decode_err(format!("invalid base64: {}", e)))?;
    let text = String::from_utf8(bytes).map_err(|e| decode_err(format!("not UTF-8: {}", e)))?;

    match target {
        CredentialTarget::Cluster { .. } => parse_kubeconfig(&text)
            .map(ConnectionDescriptor::Cluster)
            .map_err(decode_err),
        CredentialTarget::Registry { .. } => {
            let (username, password) = text
                .split_once(':')
                .filter(|(u, p)| !u.is_empty() && !p.is_empty())
                .ok_or_else(|| decode_err("expected username:password".to_string()))?;
            Ok(ConnectionDescriptor::Registry(RegistryLogin {
                username: username.to_string(),
                password: password.to_string(),
            }))
        }
    }
}

fn named<'a>(list: Option<&'a Yaml>, name: &str) -> Option<&'a Yaml> {
    list?
        .as_sequence()?
        .iter()
        .find(|entry| entry.get("name").and_then(|n| n.as_str()) == Some(name))
}

fn parse_kubeconfig(text: &str) -> std::result::Result<KubeConnection, String> {
    let doc: Yaml = serde_yaml::from_str(text).map_err(|e| format!("invalid kubeconfig: {}", e))?;

    let contexts = doc.get("contexts");
    let context_entry = match doc.get("current-context").and_then(|c| c.as_str()) {
        Some(current) => named(contexts, current),
        None => contexts.and_then(|c| c.as_sequence()).and_then(|s| s.first()),
    }
    .ok_or_else(|| "kubeconfig has no usable context".to_string())?;

    let context = context_entry
        .get("name")
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string();
    let body = context_entry
        .get("context")
        .ok_or_else(|| format!("context '{}' has no body", context))?;
    let cluster = body
        .get("cluster")
        .and_then(|c| c.as_str())
        .ok_or_else(|| format!("context '{}' names no cluster", context))?
        .to_string();
    let user = body
        .get("user")
        .and_then(|u| u.as_str())
        .unwrap_or_default()
        .to_string();
    let namespace = body
        .get("namespace")
        .and_then(|n| n.as_str())
        .map(|s| s.to_string());

    let server = named(doc.get("clusters"), &cluster)
        .and_then(|c| c.get("cluster"))
        .and_then(|c| c.get("server"))
        .and_then(|s| s.as_str())
        .ok_or_else(|| format!("cluster '{}' has no server", cluster))?
        .to_string();

    Ok(KubeConnection {
        server,
        cluster,
        context,
        user,
        namespace,
        kubeconfig: text.to_string(),
    })
}

type Slot = Arc<DeferredCell<std::result::Result<Arc<CredentialBundle>, CloudError>>>;

/// Fetches, decodes and caches credential bundles per resource id
pub struct CredentialResolver {
    source: Arc<dyn CredentialSource>,
    scope: CredentialScope,
    retry: RetryConfig,
    cancel: CancellationToken,
    targets: Mutex<HashMap<String, CredentialTarget>>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl fmt::Debug for CredentialResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialResolver")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl CredentialResolver {
    pub fn new(source: Arc<dyn CredentialSource>, scope: CredentialScope) -> Self {
        Self {
            source,
            scope,
            retry: RetryConfig::default(),
            cancel: CancellationToken::new(),
            targets: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Abandon background fetches once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn scope(&self) -> CredentialScope {
        self.scope
    }

    /// Make credentials of `resource_id` fetchable without a settlement event
    pub fn register(&self, resource_id: impl Into<String>, target: CredentialTarget) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.insert(resource_id.into(), target);
        }
    }

    /// React to a settlement: register the target and start the fetch
    pub fn observe(self: &Arc<Self>, event: &StackEvent) {
        let StackEvent::Settled {
            id,
            resource_type,
            key,
            properties,
            ..
        } = event
        else {
            return;
        };

        let target = match resource_type {
            ResourceType::ManagedCluster => CredentialTarget::Cluster {
                key: key.clone(),
                scope: self.scope,
            },
            ResourceType::ContainerRegistry
                if properties.get("adminUserEnabled").and_then(|v| v.as_bool()) == Some(true) =>
            {
                CredentialTarget::Registry { key: key.clone() }
            }
            _ => return,
        };

        debug!(resource = %id, "Credential-bearing resource settled, prefetching");
        self.register(id.clone(), target);
        if let Err(e) = self.slot(id) {
            warn!(resource = %id, error = %e, "Could not start credential fetch");
        }
    }

    /// Resolved bundle for `resource_id`, fetching it if needed
    #[instrument(skip(self))]
    pub async fn get(self: &Arc<Self>, resource_id: &str) -> Result<Arc<CredentialBundle>> {
        let slot = self.slot(resource_id)?;
        slot.wait().await
    }

    /// Bundle already resolved for `resource_id`, without fetching
    pub fn cached(&self, resource_id: &str) -> Option<Arc<CredentialBundle>> {
        let slots = self.slots.lock().ok()?;
        slots.get(resource_id)?.get()?.ok()
    }

    /// Drop the cached bundle; the next `get` fetches again
    pub fn invalidate(&self, resource_id: &str) {
        if let Ok(mut slots) = self.slots.lock()
            && slots.remove(resource_id).is_some()
        {
            debug!(resource = %resource_id, "Invalidated credentials");
        }
    }

    fn slot(self: &Arc<Self>, resource_id: &str) -> Result<Slot> {
        let target = self
            .targets
            .lock()
            .map_err(|_| CloudError::StateError("credential targets poisoned".to_string()))?
            .get(resource_id)
            .cloned()
            .ok_or_else(|| {
                CloudError::ResourceNotFound(format!(
                    "{} has not settled or does not expose credentials",
                    resource_id
                ))
            })?;

        let mut slots = self
            .slots
            .lock()
            .map_err(|_| CloudError::StateError("credential cache poisoned".to_string()))?;
        if let Some(slot) = slots.get(resource_id) {
            return Ok(slot.clone());
        }

        let slot: Slot = Arc::new(DeferredCell::new());
        slots.insert(resource_id.to_string(), slot.clone());
        drop(slots);

        let resolver = Arc::clone(self);
        let resource_id = resource_id.to_string();
        let fetch_slot = slot.clone();
        // fetches run outside the engine's semaphore: one per credential-bearing resource
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = resolver.cancel.cancelled() => Err(CloudError::Cancelled),
                result = resolver.fetch(&resource_id, &target) => result.map(Arc::new),
            };
            if result.is_err() {
                // keep failures out of the cache so a later `get` retries
                if let Ok(mut slots) = resolver.slots.lock()
                    && slots
                        .get(&resource_id)
                        .is_some_and(|s| Arc::ptr_eq(s, &fetch_slot))
                {
                    slots.remove(&resource_id);
                }
            }
            fetch_slot.resolve(result);
        });

        Ok(slot)
    }

    async fn fetch(&self, resource_id: &str, target: &CredentialTarget) -> Result<CredentialBundle> {
        let payloads = retry_with_backoff(
            &self.retry,
            "fetch_credentials",
            CloudError::is_transient,
            || self.source.fetch(target),
        )
        .await?;

        let raw = payloads
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::NoCredentialsReturned(resource_id.to_string()))?;
        let descriptor = decode_payload(resource_id, target, &raw)?;

        info!(resource = %resource_id, key = %target.key(), "Resolved credentials");
        Ok(CredentialBundle {
            resource_id: resource_id.to_string(),
            raw,
            descriptor,
            resolved_at: Utc::now(),
        })
    }
}
