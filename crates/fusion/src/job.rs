use std::path::PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a fusion job.
///
/// `Processing` is the only non-terminal state; a job moves to exactly
/// one of `Completed` or `Failed` and never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A single fusion job: one source image applied onto the configured
/// target video through two tool passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    /// Input image; owned by the job until the pipeline consumes and
    /// deletes it on success
    pub source_image: PathBuf,
    /// Final video location (remote URL, or local path if the upload
    /// failed after the job itself succeeded); set only on Completed
    pub output_artifact: Option<String>,
    /// Diagnostic detail; set only on Failed
    pub error: Option<String>,
    /// Audit trail of the tool invocations performed
    pub command_trace: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub recipient_email: Option<String>,
    pub recipient_name: Option<String>,
}

impl Job {
    /// Create a new job in Processing with a fresh UUID
    pub fn new(source_image: PathBuf) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), source_image)
    }

    /// Create a new job in Processing with a caller-supplied identifier
    pub fn with_id(id: String, source_image: PathBuf) -> Self {
        Self {
            id,
            status: JobStatus::Processing,
            source_image,
            output_artifact: None,
            error: None,
            command_trace: None,
            started_at: Some(Utc::now()),
            ended_at: None,
            recipient_email: None,
            recipient_name: None,
        }
    }
}
