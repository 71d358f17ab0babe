//! Settlement events
//!
//! The engine publishes one event per resource state change. The credential
//! resolver and the CLI progress output subscribe to them.

use crate::provider::{Outputs, ResourceKey};
use crate::report::Change;
use serde_json::Value;
use stackflow_core::model::ResourceType;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum StackEvent {
    /// The resource left `Pending` and is resolving its inputs
    Started { id: String },
    /// Terminal success; outputs are readable
    Settled {
        id: String,
        resource_type: ResourceType,
        key: ResourceKey,
        change: Change,
        /// Resolved desired properties
        properties: Value,
        outputs: Arc<Outputs>,
    },
    Failed { id: String, error: String },
    Blocked {
        id: String,
        blocked_by: Option<String>,
    },
    Deleted { id: String },
}

impl StackEvent {
    pub fn id(&self) -> &str {
        match self {
            StackEvent::Started { id }
            | StackEvent::Settled { id, .. }
            | StackEvent::Failed { id, .. }
            | StackEvent::Blocked { id, .. }
            | StackEvent::Deleted { id } => id,
        }
    }
}

/// Fan-out channel for [`StackEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StackEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StackEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscriber is fine
    pub fn publish(&self, event: StackEvent) {
        trace!(resource = %event.id(), "Publishing event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
