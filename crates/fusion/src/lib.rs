pub mod config;
pub mod exec;
pub mod job;
pub mod notify;
pub mod pipeline;
pub mod profile;
pub mod registry;
pub mod storage;

pub use config::FusionConfig;
pub use job::{Job, JobStatus};
pub use pipeline::FusionPipeline;
pub use registry::{FileRegistry, JobRegistry, MemoryRegistry};
