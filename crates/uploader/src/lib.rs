pub mod config;
pub mod job;
pub mod layout;
pub mod ownership;
pub mod pipeline;
pub mod pool;
pub mod probe;
pub mod recovery;
pub mod sidecar;
pub mod transcode;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ServiceConfig;
pub use job::{Job, JobStatus, Rotation};
pub use layout::Layout;
pub use ownership::{OwnershipError, OwnershipStore};
pub use pipeline::{PipelineError, TranscodePipeline};
pub use pool::WorkerPool;
pub use recovery::{recover_pending, RecoveryReport};
pub use transcode::{FfmpegTool, MediaTool, ToolError};
