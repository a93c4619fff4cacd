use lipsync_core::{Frame, ProtocolError};

use crate::descriptor::DescriptorError;
use crate::runner::JobError;
use crate::staging::StagingError;

/// Everything that can end a single request without ending the session.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(#[from] ProtocolError),

    #[error("staging failed: {0}")]
    Staging(#[from] StagingError),

    #[error("job descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("a request is already in progress and {0} more are queued")]
    Busy(usize),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short classification string, sent as the frame `code` and used as a
    /// metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Staging(_) => "staging_error",
            Self::Descriptor(_) => "descriptor_error",
            Self::Job(job) => job.code(),
            Self::Busy(_) => "busy",
            Self::Internal(_) => "internal_error",
        }
    }

    /// The `error` frame reported to the client.
    pub fn to_frame(&self) -> Frame {
        Frame::error(self.code(), self.to_string())
    }
}
