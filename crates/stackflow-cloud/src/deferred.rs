//! Single-resolution cells
//!
//! A [`DeferredCell`] starts empty and is resolved at most once. Readers
//! suspend until the value exists and every reader sees the same value.

use tokio::sync::watch;

#[derive(Debug)]
pub struct DeferredCell<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> DeferredCell<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Cell that is already resolved
    pub fn resolved(value: T) -> Self {
        let (tx, _rx) = watch::channel(Some(value));
        Self { tx }
    }

    /// Store `value` unless the cell already holds one.
    ///
    /// Returns whether this call resolved the cell.
    pub fn resolve(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = value.take();
                true
            } else {
                false
            }
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Current value without waiting
    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    /// Wait until the cell is resolved
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().as_ref() {
                return value.clone();
            }
            // the sender lives as long as `self`, so this only returns Ok
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl<T: Clone> Default for DeferredCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_resolves_once() {
        let cell = DeferredCell::new();
        assert!(!cell.is_resolved());
        assert!(cell.resolve(1));
        assert!(!cell.resolve(2));
        assert_eq!(cell.get(), Some(1));
        assert_eq!(cell.wait().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_suspend_until_resolved() {
        let cell = Arc::new(DeferredCell::<String>::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                tokio::spawn(async move { cell.wait().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()));

        cell.resolve("ready".to_string());
        cell.resolve("late".to_string());

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), "ready");
        }
    }

    #[tokio::test]
    async fn test_pre_resolved() {
        let cell = DeferredCell::resolved(7u32);
        assert!(cell.is_resolved());
        assert_eq!(cell.wait().await, 7);
    }
}
