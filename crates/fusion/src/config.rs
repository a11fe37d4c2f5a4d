use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the face-fusion daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Path to the face-fusion executable
    pub fusion_bin: PathBuf,
    /// The fixed target video every job composites onto
    pub target_video: PathBuf,
    /// Directory where uploaded/fetched source images land
    pub upload_dir: PathBuf,
    /// Directory for stage outputs and per-job target copies
    pub output_dir: PathBuf,
    /// Directory where job state JSON files are stored
    pub job_state_dir: PathBuf,
    /// Directory polled for submission request files
    pub submit_dir: PathBuf,
    /// Interval in seconds between spool directory polls
    pub poll_interval_secs: u64,
    /// Optional deadline in seconds for each tool invocation
    pub stage_timeout_secs: Option<u64>,
    /// Make a private per-job copy of the target video before stage 1
    pub copy_target_per_job: bool,

    /// Which detected face stage 1 treats as canonical
    pub reference_face_position: u32,
    /// Which frame stage 1 treats as canonical
    pub reference_frame_number: u32,
    /// Encoder preset passed through to the tool
    pub output_video_preset: String,
    /// Output quality 0-100 passed through to the tool
    pub output_video_quality: u32,
    /// Face detector score threshold
    pub face_detector_score: f64,
    /// Swapper model name
    pub face_swapper_model: String,
    /// Execution provider (e.g. "cuda"), omitted when None
    pub execution_provider: Option<String>,
    pub execution_device_id: Option<u32>,
    pub execution_thread_count: Option<u32>,
    pub execution_queue_count: Option<u32>,

    pub s3: S3Config,
    pub mail: MailConfig,
    pub profile: ProfileConfig,
}

/// Object storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Key prefix for uploaded artifacts (also the lifecycle rule filter)
    pub prefix: String,
    /// Days after which uploaded artifacts expire, None disables the rule
    pub expire_days: Option<i32>,
}

/// Outbound mail API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// HTTP mail API endpoint the notifier posts to
    pub endpoint: String,
    pub api_key: String,
    pub from: String,
    pub subject: String,
}

/// Remote profile lookup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub endpoint: String,
    pub api_key: String,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl FusionConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            fusion_bin: PathBuf::from("facefusion"),
            target_video: PathBuf::from("target_video/base.mp4"),
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("output"),
            job_state_dir: PathBuf::from("/tmp/fusiond-jobs"),
            submit_dir: PathBuf::from("/tmp/fusiond-submit"),
            poll_interval_secs: 5,
            stage_timeout_secs: None,
            copy_target_per_job: true,
            reference_face_position: 0,
            reference_frame_number: 107,
            output_video_preset: "ultrafast".to_string(),
            output_video_quality: 100,
            face_detector_score: 0.3,
            face_swapper_model: "inswapper_128_fp16".to_string(),
            execution_provider: None,
            execution_device_id: None,
            execution_thread_count: None,
            execution_queue_count: None,
            s3: S3Config {
                bucket: "fusion-artifacts".to_string(),
                region: "us-east-1".to_string(),
                prefix: "videos/".to_string(),
                expire_days: Some(25),
            },
            mail: MailConfig {
                endpoint: "https://mail.example.com/v1/send".to_string(),
                api_key: String::new(),
                from: "noreply@example.com".to_string(),
                subject: "Your customized advert".to_string(),
            },
            profile: ProfileConfig {
                endpoint: "https://nubela.co/proxycurl/api/v2/linkedin".to_string(),
                api_key: String::new(),
            },
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: FusionConfig = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                    config = file_config;
                } else {
                    let file_config: FusionConfig = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                    config = file_config;
                }
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = FusionConfig::default_config();
        assert_eq!(cfg.reference_face_position, 0);
        assert_eq!(cfg.reference_frame_number, 107);
        assert_eq!(cfg.output_video_preset, "ultrafast");
        assert_eq!(cfg.output_video_quality, 100);
        assert_eq!(cfg.face_swapper_model, "inswapper_128_fp16");
        assert!(cfg.copy_target_per_job);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let cfg = FusionConfig::load_config(Some(Path::new("/nonexistent/fusiond.toml"))).unwrap();
        assert_eq!(cfg.fusion_bin, PathBuf::from("facefusion"));
    }

    #[test]
    fn test_load_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = FusionConfig::default_config();
        cfg.reference_frame_number = 42;
        cfg.s3.bucket = "my-bucket".to_string();
        std::fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();

        let loaded = FusionConfig::load_config(Some(&path)).unwrap();
        assert_eq!(loaded.reference_frame_number, 42);
        assert_eq!(loaded.s3.bucket, "my-bucket");
    }

    #[test]
    fn test_load_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = FusionConfig::default_config();
        std::fs::write(&path, toml::to_string(&cfg).unwrap()).unwrap();

        let loaded = FusionConfig::load_config(Some(&path)).unwrap();
        assert_eq!(loaded.output_video_quality, 100);
    }
}
