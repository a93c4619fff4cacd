//! # lipsync-engine
//!
//! Everything between a validated request and its result:
//!
//! - [`staging`]: job-scoped input files and their removal
//! - [`preprocess`]: input normalization hook
//! - [`descriptor`]: job descriptors and the control artifact
//! - [`runner`]: the external job behind [`JobRunner`], with time limit and
//!   result checks in [`JobRunnerAdapter`]
//! - [`progress`]: per-request relay from the job to the session
//! - [`pipeline`]: the sequence tying them together

#![deny(unsafe_code)]

pub mod descriptor;
pub mod error;
pub mod pipeline;
pub mod preprocess;
pub mod progress;
pub mod runner;
pub mod staging;

pub use descriptor::{ArtifactStore, CommittedDescriptor, DescriptorBuilder, DescriptorError, JobDescriptor};
pub use error::EngineError;
pub use pipeline::{JobPipeline, PipelineConfig, PipelineOutput, PipelineStage, StageObserver};
pub use preprocess::{PassthroughPreprocessor, Preprocessor};
pub use progress::{ProgressDrain, ProgressPublisher, ProgressSink};
pub use runner::{
    BlockingJobRunner, JobError, JobExit, JobInvocation, JobRunner, JobRunnerAdapter, Offloaded,
    ProcessJobRunner, ResultHandle,
};
pub use staging::{ResourceStaging, StagedInputs, StagingError};
