//! Per-resource exclusive operation leases

use crate::provider::ResourceKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held while a resource is being read and written
pub type Lease = OwnedMutexGuard<()>;

/// One async mutex per `(type, scope, name)`
#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    leases: Arc<Mutex<HashMap<ResourceKey, Arc<AsyncMutex<()>>>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `key`
    pub async fn acquire(&self, key: &ResourceKey) -> Lease {
        let lock = {
            let mut leases = match self.leases.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            leases
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackflow_core::model::ResourceType;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_exclusive() {
        let table = LeaseTable::new();
        let key = ResourceKey::new(ResourceType::WebApp, Some("rg".into()), "api");

        let first = table.acquire(&key).await;
        let waiter = {
            let table = table.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _lease = table.acquire(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());
        drop(first);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let table = LeaseTable::new();
        let a = ResourceKey::new(ResourceType::WebApp, Some("rg".into()), "api");
        let b = ResourceKey::new(ResourceType::WebApp, Some("rg".into()), "web");

        let _a = table.acquire(&a).await;
        let _b = table.acquire(&b).await;
    }
}
