//! Built-in service implementations
//!
//! Site-specific integrations are registered next to these at startup; the
//! orchestrator only ever sees the `LabService` trait.

use std::sync::Arc;

use lab_orchestrator::{ServiceRegistry, TagAllocator};

pub mod script;

pub use script::{reserve_recorded_tags, ScriptService};

/// Register every built-in service.
pub fn register_builtin(registry: &ServiceRegistry, allocator: Arc<TagAllocator>) {
    registry.register(Arc::new(ScriptService::new(allocator)));
}
