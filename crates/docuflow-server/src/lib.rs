/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public docuflow server crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod gateway;
pub mod job;
pub mod recovery;
pub mod store;

// Re-export commonly used types
pub use gateway::PushGateway;
pub use job::{JobRecord, JobStage, JobStatus};
pub use recovery::{RecoveryReport, recover_stuck_jobs};
pub use store::JobStore;
