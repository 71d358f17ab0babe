//! StackFlow core
//!
//! Stack configuration model, KDL parser, resource graph and the stack
//! builder shared by the engine and the CLI.

pub mod builder;
pub mod error;
pub mod graph;
pub mod loader;
pub mod manifest;
pub mod model;
pub mod parser;

pub use builder::{OutputSpec, StackDefinition, WorkloadSet, build_stack};
pub use error::{Result, StackError};
pub use graph::{ConvergencePlan, DependencyEdge, ResourceGraph};
pub use loader::{LoadedStack, load_stack, load_stack_with_config};
pub use manifest::{demo_manifests, ingress_service, load_manifest_files};
pub use model::*;
pub use parser::{parse_duration, parse_stack_file, parse_stack_string};
