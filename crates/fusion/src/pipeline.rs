use std::path::Path;
use std::sync::Arc;
use log::{error, info, warn};
use thiserror::Error;

use crate::config::FusionConfig;
use crate::exec::{ExecError, ToolOutput, ToolRunner};
use crate::notify::{Notifier, Outcome};
use crate::registry::{JobPatch, JobRegistry, RegistryError};
use crate::storage::{sanitize_key, ArtifactStore};

/// Stage 2 re-applies the source onto the stage-1 output, whose face
/// position no longer matches the original target, so it always uses
/// this fixed reference pair instead of the configured one.
pub const STAGE2_REFERENCE_FACE_POSITION: u32 = 0;
pub const STAGE2_REFERENCE_FRAME_NUMBER: u32 = 229;

/// Source image extensions the pipeline accepts
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    First,
    Second,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::First => write!(f, "stage 1"),
            Stage::Second => write!(f, "stage 2"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{stage} failed: {detail}")]
    Stage { stage: Stage, detail: String },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Drives one job through the two-pass fusion: validate, stage 1 onto
/// the target video, stage 2 onto the stage-1 output, cleanup, upload,
/// notify. Every fault inside a run is converted into a terminal
/// `Failed` record; nothing escapes to the caller.
pub struct FusionPipeline {
    cfg: FusionConfig,
    runner: Arc<dyn ToolRunner>,
    registry: Arc<dyn JobRegistry>,
    store: Option<Arc<dyn ArtifactStore>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl FusionPipeline {
    pub fn new(
        cfg: FusionConfig,
        runner: Arc<dyn ToolRunner>,
        registry: Arc<dyn JobRegistry>,
        store: Option<Arc<dyn ArtifactStore>>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            cfg,
            runner,
            registry,
            store,
            notifier,
        }
    }

    /// Run the pipeline for a job already registered as Processing.
    /// Commits the terminal status before firing the notification hook.
    pub async fn run(&self, job_id: &str) {
        let job = match self.registry.get(job_id).await {
            Ok(job) => job,
            Err(e) => {
                error!("Job {}: cannot start pipeline: {}", job_id, e);
                return;
            }
        };
        if job.status.is_terminal() {
            warn!("Job {}: already {}, nothing to do", job_id, job.status);
            return;
        }

        let mut trace: Vec<String> = Vec::new();
        match self.execute(job_id, &mut trace).await {
            Ok(artifact) => {
                info!("Job {}: ✅ completed, artifact at {}", job_id, artifact);
                let patch = JobPatch::completed(artifact.clone(), trace.join("\n"));
                if let Err(e) = self.registry.update(job_id, patch).await {
                    error!("Job {}: failed to record completion: {}", job_id, e);
                }
                self.send_notification(job_id, Outcome::Success { url: artifact }).await;
            }
            Err(e) => {
                error!("Job {}: ❌ {}", job_id, e);
                let message = e.to_string();
                let trace = if trace.is_empty() { None } else { Some(trace.join("\n")) };
                if let Err(ue) = self
                    .registry
                    .update(job_id, JobPatch::failed(message.clone(), trace))
                    .await
                {
                    error!("Job {}: failed to record failure: {}", job_id, ue);
                }
                self.send_notification(job_id, Outcome::Failure { message }).await;
            }
        }
    }

    async fn execute(&self, job_id: &str, trace: &mut Vec<String>) -> Result<String, PipelineError> {
        let job = self.registry.get(job_id).await?;
        let source = job.source_image.clone();

        // Step 1: preconditions. No process is launched if these fail.
        if !source.exists() {
            return Err(PipelineError::Validation(format!(
                "source image not found: {}",
                source.display()
            )));
        }
        let ext = source
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase())
            .unwrap_or_default();
        if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return Err(PipelineError::Validation(format!(
                "source has unsupported extension: {}",
                source.display()
            )));
        }
        if !self.cfg.target_video.exists() {
            return Err(PipelineError::Validation(format!(
                "target video not found: {}",
                self.cfg.target_video.display()
            )));
        }

        let stage1_out = self.cfg.output_dir.join(format!("stage1_{}.mp4", job.id));
        let final_out = self.cfg.output_dir.join(format!("final_{}.mp4", job.id));

        // The shared target is read-only; work on a private copy so the
        // tool can never mutate or lock the original.
        let target = if self.cfg.copy_target_per_job {
            let copy = self.cfg.output_dir.join(format!("target_{}.mp4", job.id));
            tokio::fs::copy(&self.cfg.target_video, &copy).await?;
            copy
        } else {
            self.cfg.target_video.clone()
        };

        // Step 2: first pass onto the target video
        info!("Job {}: starting stage 1 ({} onto {})", job.id, source.display(), target.display());
        let args = self.build_stage_args(
            &source,
            &target,
            &stage1_out,
            self.cfg.reference_face_position,
            self.cfg.reference_frame_number,
        );
        trace.push(render_command(&self.cfg.fusion_bin, &args));
        let output = self.runner.run(&args).await?;
        self.check_stage(Stage::First, &output, &stage1_out)?;
        info!("Job {}: stage 1 complete", job.id);

        // Step 3: second pass, chaining onto the stage-1 output
        info!("Job {}: starting stage 2 (onto {})", job.id, stage1_out.display());
        let args = self.build_stage_args(
            &source,
            &stage1_out,
            &final_out,
            STAGE2_REFERENCE_FACE_POSITION,
            STAGE2_REFERENCE_FRAME_NUMBER,
        );
        trace.push(render_command(&self.cfg.fusion_bin, &args));
        let output = self.runner.run(&args).await?;
        self.check_stage(Stage::Second, &output, &final_out)?;
        info!("Job {}: stage 2 complete", job.id);

        // Step 4: cleanup of consumed inputs. The final output stays.
        tokio::fs::remove_file(&source).await?;
        tokio::fs::remove_file(&stage1_out).await?;
        if self.cfg.copy_target_per_job {
            if let Err(e) = tokio::fs::remove_file(&target).await {
                warn!("Job {}: could not remove target copy {}: {}", job.id, target.display(), e);
            }
        }
        info!("Job {}: 🗑️  cleaned up source image and intermediate output", job.id);

        // Upload for a durable URL. A storage fault downgrades the
        // artifact to the local path but never fails the job.
        let artifact = match &self.store {
            Some(store) => {
                let key = sanitize_key(&format!("final_{}.mp4", job.id));
                match store.upload(&final_out, &key).await {
                    Ok(url) => url,
                    Err(e) => {
                        error!("Job {}: upload failed, keeping local artifact: {}", job.id, e);
                        final_out.display().to_string()
                    }
                }
            }
            None => final_out.display().to_string(),
        };

        Ok(artifact)
    }

    /// A stage succeeded only if the tool exited zero AND the expected
    /// output file exists. Failed-stage intermediates are left on disk
    /// for diagnosis.
    fn check_stage(
        &self,
        stage: Stage,
        output: &ToolOutput,
        expected: &Path,
    ) -> Result<(), PipelineError> {
        if !output.success() {
            return Err(PipelineError::Stage {
                stage,
                detail: format!(
                    "exit code {}\nstdout: {}\nstderr: {}",
                    output.exit_code, output.stdout, output.stderr
                ),
            });
        }
        if !expected.exists() {
            return Err(PipelineError::Stage {
                stage,
                detail: format!("expected output missing: {}", expected.display()),
            });
        }
        Ok(())
    }

    fn build_stage_args(
        &self,
        source: &Path,
        target: &Path,
        output: &Path,
        reference_face_position: u32,
        reference_frame_number: u32,
    ) -> Vec<String> {
        let mut args = vec![
            "--headless".to_string(),
            "--frame-processors".to_string(),
            "face_swapper".to_string(),
            "--source".to_string(),
            source.to_string_lossy().to_string(),
            "--target".to_string(),
            target.to_string_lossy().to_string(),
            "--output".to_string(),
            output.to_string_lossy().to_string(),
            "--reference-face-position".to_string(),
            reference_face_position.to_string(),
            "--reference-frame-number".to_string(),
            reference_frame_number.to_string(),
            "--output-video-preset".to_string(),
            self.cfg.output_video_preset.clone(),
            "--output-video-quality".to_string(),
            self.cfg.output_video_quality.to_string(),
            "--face-detector-score".to_string(),
            self.cfg.face_detector_score.to_string(),
            "--face-swapper-model".to_string(),
            self.cfg.face_swapper_model.clone(),
        ];

        if let Some(provider) = &self.cfg.execution_provider {
            args.push("--execution-providers".to_string());
            args.push(provider.clone());
        }
        if let Some(device) = self.cfg.execution_device_id {
            args.push("--execution-device-id".to_string());
            args.push(device.to_string());
        }
        if let Some(threads) = self.cfg.execution_thread_count {
            args.push("--execution-thread-count".to_string());
            args.push(threads.to_string());
        }
        if let Some(queue) = self.cfg.execution_queue_count {
            args.push("--execution-queue-count".to_string());
            args.push(queue.to_string());
        }

        args
    }

    /// Post-commit hook: notifier faults are logged and swallowed, the
    /// job's terminal status is already on record.
    async fn send_notification(&self, job_id: &str, outcome: Outcome) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let job = match self.registry.get(job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!("Job {}: cannot load recipient for notification: {}", job_id, e);
                return;
            }
        };
        let Some(email) = job.recipient_email else {
            return;
        };
        let name = job.recipient_name.unwrap_or_else(|| "there".to_string());
        match notifier.notify(&email, &name, &outcome).await {
            Ok(()) => info!("Job {}: 📧 notification sent to {}", job_id, email),
            Err(e) => error!("Job {}: notification failed (status unchanged): {}", job_id, e),
        }
    }
}

fn render_command(program: &Path, args: &[String]) -> String {
    format!("{} {}", program.display(), args.join(" "))
}
