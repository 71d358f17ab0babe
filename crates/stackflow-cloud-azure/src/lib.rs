//! Azure and Kubernetes providers for StackFlow
//!
//! This crate implements the CloudProvider trait for Azure Resource Manager
//! and for the Kubernetes API of a freshly provisioned cluster.
//!
//! # Features
//!
//! - Resource groups, container registries, AKS clusters, role assignments
//! - App Service plans and container web apps
//! - Cluster kubeconfig and registry admin credential endpoints
//! - Server-side apply of workload manifests through kubectl
//!
//! # Requirements
//!
//! - `az` CLI must be installed and logged in (`az login`)
//! - `kubectl` must be installed for stacks that deploy workloads
//!
//! # Example
//!
//! ```ignore
//! use stackflow_cloud::{CloudProvider, ConvergenceEngine, CredentialResolver, EngineConfig};
//! use stackflow_cloud_azure::{AzureProvider, KubeTarget};
//!
//! let azure = Arc::new(AzureProvider::new(None));
//!
//! let auth = azure.check_auth().await?;
//! if !auth.authenticated {
//!     panic!("Not authenticated: {:?}", auth.error);
//! }
//!
//! let resolver = Arc::new(CredentialResolver::new(azure.clone(), CredentialScope::User));
//! let engine = ConvergenceEngine::new(azure, EngineConfig::default())
//!     .with_credentials(resolver);
//! let report = engine.apply(&definition.graph).await?;
//! ```

pub mod arm;
pub mod az;
pub mod error;
pub mod kube;
pub mod kubectl;
pub mod provider;

pub use az::{AzAccount, AzCli, Method};
pub use error::{AzureError, Result};
pub use kube::{KubeProvider, KubeTarget};
pub use kubectl::Kubectl;
pub use provider::AzureProvider;
