use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use thiserror::Error;

use crate::job::{Job, JobStatus};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job already exists: {0}")]
    DuplicateId(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {0} is terminal and cannot return to processing")]
    TerminalJob(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Field-level update applied to a stored job. Unset fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub output_artifact: Option<String>,
    pub error: Option<String>,
    pub command_trace: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobPatch {
    /// Terminal patch for a successful job
    pub fn completed(artifact: String, trace: String) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            output_artifact: Some(artifact),
            command_trace: Some(trace),
            ended_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Terminal patch for a failed job
    pub fn failed(error: String, trace: Option<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error),
            command_trace: trace,
            ended_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    fn apply(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(artifact) = &self.output_artifact {
            job.output_artifact = Some(artifact.clone());
        }
        if let Some(error) = &self.error {
            job.error = Some(error.clone());
        }
        if let Some(trace) = &self.command_trace {
            job.command_trace = Some(trace.clone());
        }
        if let Some(ended) = self.ended_at {
            job.ended_at = Some(ended);
        }
    }

    /// A terminal job may receive further field updates (trace, artifact)
    /// but never a status change away from its terminal state.
    fn guard(&self, job: &Job) -> Result<(), RegistryError> {
        if let Some(next) = self.status {
            if job.status.is_terminal() && next != job.status {
                return Err(RegistryError::TerminalJob(job.id.clone()));
            }
        }
        Ok(())
    }
}

/// Authoritative store for job records. The pipeline is the sole
/// writer for a given id; backends only need whatever consistency
/// their medium already offers.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    async fn create(&self, job: Job) -> Result<(), RegistryError>;
    async fn get(&self, id: &str) -> Result<Job, RegistryError>;
    async fn update(&self, id: &str, patch: JobPatch) -> Result<(), RegistryError>;
}

/// In-memory registry backed by a mutex-guarded map
#[derive(Default)]
pub struct MemoryRegistry {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRegistry for MemoryRegistry {
    async fn create(&self, job: Job) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(RegistryError::DuplicateId(job.id));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Job, RegistryError> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    async fn update(&self, id: &str, patch: JobPatch) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        patch.guard(job)?;
        patch.apply(job);
        Ok(())
    }
}

/// Durable registry keeping one `<id>.json` file per job under a
/// state directory
pub struct FileRegistry {
    state_dir: PathBuf,
}

impl FileRegistry {
    pub fn new(state_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self { state_dir })
    }

    fn job_path(&self, id: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", id))
    }

    fn read_job(&self, id: &str) -> Result<Job, RegistryError> {
        let path = self.job_path(id);
        if !path.exists() {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_job(&self, job: &Job) -> Result<(), RegistryError> {
        let path = self.job_path(&job.id);
        let content = serde_json::to_string_pretty(job)?;
        std::fs::write(&path, content)?;
        debug!("Saved job {} ({})", job.id, job.status);
        Ok(())
    }

    /// Load every job record in the state directory. Unparseable files
    /// are skipped so one corrupt record cannot wedge startup recovery.
    pub fn load_all(&self) -> Result<Vec<Job>, RegistryError> {
        let mut jobs = Vec::new();
        for entry in std::fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Job>(&content) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    log::warn!("Skipping unreadable job file {}: {}", path.display(), e);
                }
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobRegistry for FileRegistry {
    async fn create(&self, job: Job) -> Result<(), RegistryError> {
        if self.job_path(&job.id).exists() {
            return Err(RegistryError::DuplicateId(job.id));
        }
        self.write_job(&job)
    }

    async fn get(&self, id: &str) -> Result<Job, RegistryError> {
        self.read_job(id)
    }

    async fn update(&self, id: &str, patch: JobPatch) -> Result<(), RegistryError> {
        let mut job = self.read_job(id)?;
        patch.guard(&job)?;
        patch.apply(&mut job);
        self.write_job(&job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_job(id: &str) -> Job {
        Job::with_id(id.to_string(), PathBuf::from("face.png"))
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let reg = MemoryRegistry::new();
        reg.create(sample_job("a")).await.unwrap();
        let job = reg.get("a").await.unwrap();
        assert_eq!(job.id, "a");
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let reg = MemoryRegistry::new();
        reg.create(sample_job("a")).await.unwrap();
        let err = reg.create(sample_job("a")).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let reg = MemoryRegistry::new();
        let err = reg.get("missing").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let reg = MemoryRegistry::new();
        reg.create(sample_job("a")).await.unwrap();
        reg.update(
            "a",
            JobPatch {
                command_trace: Some("cmd1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let job = reg.get("a").await.unwrap();
        assert_eq!(job.command_trace.as_deref(), Some("cmd1"));
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_terminal_job_cannot_resurrect() {
        let reg = MemoryRegistry::new();
        reg.create(sample_job("a")).await.unwrap();
        reg.update("a", JobPatch::failed("boom".to_string(), None))
            .await
            .unwrap();

        let err = reg
            .update(
                "a",
                JobPatch {
                    status: Some(JobStatus::Processing),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::TerminalJob(_)));

        let job = reg.get("a").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_reads_are_idempotent_after_terminal() {
        let reg = MemoryRegistry::new();
        reg.create(sample_job("a")).await.unwrap();
        reg.update(
            "a",
            JobPatch::completed("https://cdn.example/a.mp4".to_string(), "cmd".to_string()),
        )
        .await
        .unwrap();

        let first = reg.get("a").await.unwrap();
        let second = reg.get("a").await.unwrap();
        assert_eq!(serde_json::to_string(&first).unwrap(), serde_json::to_string(&second).unwrap());
    }

    #[tokio::test]
    async fn test_file_registry_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reg = FileRegistry::new(dir.path()).unwrap();
            reg.create(sample_job("a")).await.unwrap();
            reg.update(
                "a",
                JobPatch::completed("https://cdn.example/a.mp4".to_string(), "cmd".to_string()),
            )
            .await
            .unwrap();
        }

        let reg = FileRegistry::new(dir.path()).unwrap();
        let job = reg.get("a").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output_artifact.as_deref(), Some("https://cdn.example/a.mp4"));

        let all = reg.load_all().unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_file_registry_update_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let reg = FileRegistry::new(dir.path()).unwrap();
        let err = reg
            .update("nope", JobPatch::failed("x".to_string(), None))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    fn arb_status() -> impl Strategy<Value = Option<JobStatus>> {
        prop_oneof![
            Just(None),
            Just(Some(JobStatus::Processing)),
            Just(Some(JobStatus::Completed)),
            Just(Some(JobStatus::Failed)),
        ]
    }

    proptest! {
        /// Once a job reaches a terminal status, no sequence of patches
        /// may change that status again.
        #[test]
        fn prop_status_is_monotonic(statuses in proptest::collection::vec(arb_status(), 1..12)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let reg = MemoryRegistry::new();
                reg.create(sample_job("p")).await.unwrap();

                let mut terminal: Option<JobStatus> = None;
                for status in statuses {
                    let patch = JobPatch { status, ..Default::default() };
                    let _ = reg.update("p", patch).await;

                    let job = reg.get("p").await.unwrap();
                    if let Some(t) = terminal {
                        prop_assert_eq!(job.status, t);
                    } else if job.status.is_terminal() {
                        terminal = Some(job.status);
                    }
                }
                Ok(())
            })?;
        }
    }
}
