/*
[INPUT]:  Public API exports for the docuflow-tracker crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod channel;
pub mod config;
pub mod lifecycle;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod restore;
pub mod store;

// Re-export main types for convenience
pub use channel::{NotificationSource, SharedPushChannel};
pub use config::TrackerConfig;
pub use orchestrator::{BatchContext, TaskInfo, TaskOutcome, TaskTracker};
pub use registry::{ProgressRegistry, TaskStatus, TrackedTask};
pub use restore::{RestoredBatch, restore_pending_tasks};
pub use store::{DurableTaskStore, TaskHandle};
