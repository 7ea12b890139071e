//! Job records backing client-visible tasks, one per processed document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline position of a job.
///
/// The wire numbering jumps from Finalize (5) to Done (7); 6 is unassigned
/// in the pipeline's numbering and deliberately kept that way here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Extract,
    Classify,
    Embed,
    Save,
    Finalize,
    Done,
}

impl JobStage {
    /// Stage number carried in step notifications
    pub fn step(&self) -> u8 {
        match self {
            JobStage::Extract => 1,
            JobStage::Classify => 2,
            JobStage::Embed => 3,
            JobStage::Save => 4,
            JobStage::Finalize => 5,
            JobStage::Done => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

/// One background job as persisted in the job store.
///
/// A job still `Processing` when a server process starts is by definition
/// orphaned: its owning worker died with the previous process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: String,
    pub document_id: Option<String>,
    pub file_name: String,
    pub stage: JobStage,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(document_id: Option<String>, file_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            document_id,
            file_name: file_name.into(),
            stage: JobStage::Extract,
            status: JobStatus::Processing,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
