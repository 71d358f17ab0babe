//! Data model
//!
//! Resource declarations, deferred property values and the stack
//! configuration that selects which resources get declared.

mod resource;
mod stack;
mod value;

// Re-exports
pub use resource::*;
pub use stack::*;
pub use value::*;
