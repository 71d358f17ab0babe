//! StackFlow Cloud Infrastructure
//!
//! Provider abstraction and the convergence engine that drives a stack's
//! resource graph to its desired state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 StackFlow CLI                    │
//! │          (stackflow up/plan/destroy)             │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               stackflow-cloud                    │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │          Convergence Engine               │   │
//! │  │  tasks per resource, deferred cells       │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────────────┐     │
//! │  │  Credential  │  │  Workload Binding    │     │
//! │  │  Resolver    │  │  (nested pass)       │     │
//! │  └──────────────┘  └──────────────────────┘     │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │     azure     │ │  kubernetes   │
//! │   provider    │ │    target     │
//! └───────────────┘ └───────────────┘
//! ```

pub mod action;
pub mod binding;
pub mod credentials;
pub mod deferred;
pub mod engine;
pub mod error;
pub mod events;
pub mod lease;
pub mod memory;
pub mod outputs;
pub mod provider;
pub mod report;
pub mod retry;
pub mod state;

// Re-exports
pub use action::{Action, ActionType, Plan, PlanSummary};
pub use binding::WorkloadBinder;
pub use credentials::{
    ConnectionDescriptor, CredentialBundle, CredentialResolver, KubeConnection, RegistryLogin,
    decode_payload,
};
pub use deferred::DeferredCell;
pub use engine::{ConvergenceEngine, EngineConfig, Externals};
pub use error::{CloudError, Result};
pub use events::{EventBus, StackEvent};
pub use memory::{MemoryProvider, MemoryTarget};
pub use outputs::{StackOutput, resolve_outputs};
pub use provider::{
    ActualState, AuthStatus, CloudProvider, CredentialSource, CredentialTarget, Outputs,
    ResolvedResource, ResourceKey, WorkloadTarget,
};
pub use report::{ApplyReport, Change, FailureChain, Operation, Phase, ReportSummary, ResourceOutcome};
pub use retry::{RetryConfig, retry_with_backoff};
pub use state::{ResourceRecord, StackState, StateLock, StateManager};
