use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use clap::Parser;
use fusion::{
    config::FusionConfig,
    exec::FusionRunner,
    job::{Job, JobStatus},
    notify::{MailApiNotifier, Notifier},
    pipeline::FusionPipeline,
    profile::ProfileClient,
    registry::{FileRegistry, JobPatch, JobRegistry},
    storage::{ArtifactStore, S3ArtifactStore},
};
use log::{debug, error, info, warn};
use serde::Deserialize;

/// Face-fusion job daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// A submission dropped into the spool directory. Either a local
/// source image or a profile URL to resolve into one.
#[derive(Debug, Deserialize)]
struct SubmitRequest {
    source_image: Option<PathBuf>,
    profile_url: Option<String>,
    email: Option<String>,
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger - use RUST_LOG env var or default to info level
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let cfg = FusionConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    info!("Fusion daemon starting");
    info!("Configuration loaded:");
    info!("  Tool binary: {}", cfg.fusion_bin.display());
    info!("  Target video: {}", cfg.target_video.display());
    info!("  Upload dir: {}", cfg.upload_dir.display());
    info!("  Output dir: {}", cfg.output_dir.display());
    info!("  Job state dir: {}", cfg.job_state_dir.display());
    info!("  Submit dir: {}", cfg.submit_dir.display());
    info!("  Poll interval: {}s", cfg.poll_interval_secs);

    if !cfg.target_video.exists() {
        warn!("Target video does not exist yet: {}", cfg.target_video.display());
    }

    for dir in [&cfg.upload_dir, &cfg.output_dir, &cfg.submit_dir] {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let registry = Arc::new(
        FileRegistry::new(&cfg.job_state_dir)
            .with_context(|| format!("Failed to open job state dir: {}", cfg.job_state_dir.display()))?,
    );

    // Recovery on startup: no job may sit in Processing forever after a
    // daemon restart, and half-finished work files get swept
    info!("🔄 Starting recovery checks...");
    let recovered = recover_interrupted_jobs(&registry).await
        .context("Failed to recover interrupted jobs on startup")?;
    let cleaned = cleanup_orphaned_work_files(&cfg, &registry)
        .context("Failed to clean orphaned work files on startup")?;
    if recovered > 0 || cleaned > 0 {
        info!("✅ Startup recovery complete: {} job(s) failed over, {} work file(s) removed", recovered, cleaned);
    } else {
        info!("✅ Startup recovery complete: nothing to do");
    }

    let store = Arc::new(S3ArtifactStore::new(cfg.s3.clone()));
    store.check_connection().await;
    if let Err(e) = store.apply_lifecycle_rule().await {
        warn!("Could not install bucket lifecycle rule: {}", e);
    }

    let notifier = Arc::new(MailApiNotifier::new(cfg.mail.clone()));
    let profiles = ProfileClient::new(cfg.profile.clone());
    let runner = Arc::new(FusionRunner::new(cfg.fusion_bin.clone(), cfg.stage_timeout_secs));

    let pipeline = Arc::new(FusionPipeline::new(
        cfg.clone(),
        runner,
        registry.clone(),
        Some(store as Arc<dyn ArtifactStore>),
        Some(notifier as Arc<dyn Notifier>),
    ));

    // Main daemon loop: poll the spool directory for submissions
    loop {
        match process_submissions(&cfg, &registry, &profiles, &pipeline).await {
            Ok(0) => debug!("No new submissions"),
            Ok(n) => info!("Accepted {} submission(s)", n),
            Err(e) => error!("Failed to process submissions: {}", e),
        }

        tokio::time::sleep(tokio::time::Duration::from_secs(cfg.poll_interval_secs)).await;
    }
}

/// Read submission files from the spool directory, create a job for
/// each, and hand them to the pipeline as independent tasks
async fn process_submissions(
    cfg: &FusionConfig,
    registry: &Arc<FileRegistry>,
    profiles: &ProfileClient,
    pipeline: &Arc<FusionPipeline>,
) -> Result<usize> {
    let mut accepted = 0;

    let entries = fs::read_dir(&cfg.submit_dir)
        .with_context(|| format!("Failed to read submit directory: {}", cfg.submit_dir.display()))?;

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read submission file {}: {}", path.display(), e);
                continue;
            }
        };

        let request: SubmitRequest = match serde_json::from_str(&content) {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to parse submission file {}: {}", path.display(), e);
                fs::remove_file(&path).ok();
                continue;
            }
        };

        // The file is consumed whatever happens next; the job record is
        // the authoritative trace from here on
        fs::remove_file(&path)
            .with_context(|| format!("Failed to delete submission file: {}", path.display()))?;

        let job_id = accept_submission(cfg, registry, profiles, request).await?;
        info!("Created job {} from submission {}", job_id, path.display());
        accepted += 1;

        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline.run(&job_id).await;
        });
    }

    Ok(accepted)
}

/// Turn one submission into a registered job. Submissions that cannot
/// be resolved still get a job record, immediately failed, so callers
/// polling by id always find a terminal answer.
async fn accept_submission(
    cfg: &FusionConfig,
    registry: &Arc<FileRegistry>,
    profiles: &ProfileClient,
    request: SubmitRequest,
) -> Result<String> {
    let mut display_name = request.name.clone();

    let resolved: std::result::Result<PathBuf, String> = match (&request.source_image, &request.profile_url) {
        (Some(image), _) => Ok(image.clone()),
        (None, Some(url)) => match profiles.lookup(url).await {
            Ok(info) => {
                if display_name.is_none() {
                    display_name = info.display_name.clone();
                }
                profiles
                    .fetch_image(&info, &cfg.upload_dir)
                    .await
                    .map_err(|e| format!("profile image fetch failed: {}", e))
            }
            Err(e) => Err(format!("profile lookup failed: {}", e)),
        },
        (None, None) => Err("submission has neither source_image nor profile_url".to_string()),
    };

    let source = match &resolved {
        Ok(path) => path.clone(),
        Err(_) => cfg.upload_dir.join("unresolved"),
    };

    let mut job = Job::new(source);
    job.recipient_email = request.email;
    job.recipient_name = display_name;
    let job_id = job.id.clone();
    registry.create(job).await
        .with_context(|| format!("Failed to register job {}", job_id))?;

    if let Err(reason) = resolved {
        error!("Job {}: ❌ {}", job_id, reason);
        registry
            .update(&job_id, JobPatch::failed(reason, None))
            .await
            .with_context(|| format!("Failed to record failure for job {}", job_id))?;
    }

    Ok(job_id)
}

/// A job still Processing at startup was interrupted by a daemon
/// restart; only this process ever runs the pipeline, so it cannot be
/// live. Fail it rather than leave it in limbo.
async fn recover_interrupted_jobs(registry: &Arc<FileRegistry>) -> Result<usize> {
    let mut recovered = 0;

    for job in registry.load_all().context("Failed to load jobs for recovery")? {
        if job.status != JobStatus::Processing {
            continue;
        }
        warn!("Job {}: ⚠️  found in processing after restart, marking failed", job.id);
        registry
            .update(
                &job.id,
                JobPatch::failed("daemon restarted mid-job".to_string(), None),
            )
            .await
            .with_context(|| format!("Failed to fail over job {}", job.id))?;
        recovered += 1;
    }

    Ok(recovered)
}

/// Delete per-job work files in the output directory whose job record
/// no longer exists. Files belonging to known jobs stay: failed jobs
/// keep their stage-1 output for diagnosis, completed jobs may still
/// reference a local final output.
fn cleanup_orphaned_work_files(cfg: &FusionConfig, registry: &Arc<FileRegistry>) -> Result<usize> {
    let known: std::collections::HashSet<String> = registry
        .load_all()
        .context("Failed to load jobs for cleanup")?
        .into_iter()
        .map(|j| j.id)
        .collect();

    let mut cleaned = 0;

    for entry in fs::read_dir(&cfg.output_dir)
        .with_context(|| format!("Failed to read output directory: {}", cfg.output_dir.display()))?
    {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        // Work files are named <kind>_<job id> with kind one of
        // stage1, target, final
        let Some((kind, job_id)) = stem.split_once('_') else {
            continue;
        };
        if !matches!(kind, "stage1" | "target" | "final") {
            continue;
        }

        if !known.contains(job_id) {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to delete orphaned work file: {}", path.display()))?;
            info!("🗑️  Deleted orphaned work file: {}", path.display());
            cleaned += 1;
        }
    }

    Ok(cleaned)
}
