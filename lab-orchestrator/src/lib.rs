//! Lab provisioning and cleanup orchestration.
//!
//! The [`LabManager`] drives one [`ProvisioningPipeline`] run per lab,
//! tracks progress for polling clients, and routes every teardown through
//! the [`CleanupOrchestrator`] so that only services a lab actually used are
//! cleaned up.

pub mod admin;
pub mod allocator;
pub mod cleanup;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod manager;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod repository;
pub mod service;
pub mod sweeper;
pub mod templates;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use admin::{AdminCleanupOutcome, AdminCleanupReport, AdminCleanupRequest};
pub use allocator::TagAllocator;
pub use cleanup::{CleanupOrchestrator, CleanupReport, CleanupTarget};
pub use dispatch::{BoundService, ServiceDispatcher};
pub use error::{CleanupFailures, OrchestratorError, Result, ServiceError, ServiceFailure};
pub use handle::{LabHandle, LabHandles};
pub use manager::{CreateLabRequest, LabManager, OrchestratorSettings, TeardownReport};
pub use pipeline::{PipelineOutcome, ProvisioningPipeline, FAILED_SERVICE_KEY};
pub use progress::{LabProgress, ProgressStep, ProgressTracker, ServiceProgress, StepStatus};
pub use registry::ServiceRegistry;
pub use repository::{InMemoryLabRepository, LabRepository, SqliteLabRepository};
pub use service::{CleanupContext, LabService, SetupContext, StepReporter};
pub use sweeper::{start_sweeper_task, SweepReport};
pub use templates::TemplateCatalog;
