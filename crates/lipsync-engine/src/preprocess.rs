//! Input normalization between staging and descriptor construction.

use async_trait::async_trait;

use crate::staging::{StagedInputs, StagingError};

/// Brings staged inputs into the shape the generation job accepts
/// (re-encoding, resizing). Works in place on the staged paths.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    /// Normalize `staged`. Failures are reported as staging errors.
    async fn normalize(&self, staged: &StagedInputs) -> Result<(), StagingError>;
}

/// Accepts inputs as staged. Only checks the files are still there.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughPreprocessor;

#[async_trait]
impl Preprocessor for PassthroughPreprocessor {
    async fn normalize(&self, staged: &StagedInputs) -> Result<(), StagingError> {
        for path in [staged.image_path(), staged.audio_path()] {
            let _ = tokio::fs::metadata(path).await.map_err(|source| StagingError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}
