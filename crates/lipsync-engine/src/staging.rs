//! Writes decoded request payloads to job-scoped files and removes them again.
//!
//! Layout: `<work_root>/<job>/inputs/{image,audio}.<ext>`. The extension is
//! derived from the payload's magic bytes. Payloads are opaque otherwise:
//! anything unrecognised (raw PCM, TIFF, HEIC) is staged under the kind's
//! default extension and left for the preprocessor or job to decode.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use lipsync_core::{JobId, RequestPayloads};
use tracing::{debug, warn};

/// Which input a payload is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    /// Reference portrait.
    Image,
    /// Driving speech track.
    Audio,
}

impl MediaKind {
    fn stem(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
        }
    }

    /// Extension used when the payload matches no known container.
    pub fn default_extension(self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Audio => "wav",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stem())
    }
}

/// File extension for `bytes`, or `None` if the container isn't recognised.
pub fn sniff_extension(kind: MediaKind, bytes: &[u8]) -> Option<&'static str> {
    match kind {
        MediaKind::Image => {
            if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
                Some("jpg")
            } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
                Some("png")
            } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
                Some("gif")
            } else if bytes.starts_with(b"BM") {
                Some("bmp")
            } else if is_riff(bytes, b"WEBP") {
                Some("webp")
            } else {
                None
            }
        }
        MediaKind::Audio => {
            if is_riff(bytes, b"WAVE") {
                Some("wav")
            } else if bytes.starts_with(b"fLaC") {
                Some("flac")
            } else if bytes.starts_with(b"OggS") {
                Some("ogg")
            } else if bytes.starts_with(b"ID3") || is_mpeg_frame_sync(bytes) {
                Some("mp3")
            } else {
                None
            }
        }
    }
}

fn is_riff(bytes: &[u8], form: &[u8; 4]) -> bool {
    bytes.len() >= 12 && bytes.starts_with(b"RIFF") && &bytes[8..12] == form
}

fn is_mpeg_frame_sync(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0
}

/// Staging failures.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    /// Zero-length payload.
    #[error("{kind} payload is empty")]
    Empty {
        /// Which input.
        kind: MediaKind,
    },

    /// The filesystem refused.
    #[error("failed to stage {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl StagingError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The two staged input files of a job.
///
/// Dropping without calling [`StagedInputs::release`] removes the files
/// synchronously as a last resort.
#[derive(Debug)]
pub struct StagedInputs {
    image_path: PathBuf,
    audio_path: PathBuf,
    released: bool,
}

impl StagedInputs {
    /// Take ownership of two existing files.
    pub fn new(image_path: PathBuf, audio_path: PathBuf) -> Self {
        Self {
            image_path,
            audio_path,
            released: false,
        }
    }

    /// Staged portrait.
    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    /// Staged speech track.
    pub fn audio_path(&self) -> &Path {
        &self.audio_path
    }

    /// Remove both files. Already-missing files are not an error.
    pub async fn release(mut self) -> Result<(), StagingError> {
        self.released = true;
        let image = release(&self.image_path).await;
        let audio = release(&self.audio_path).await;
        image.and(audio)
    }
}

impl Drop for StagedInputs {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        for path in [&self.image_path, &self.audio_path] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "released staged input on drop"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to release staged input"),
            }
        }
    }
}

/// Remove a staged file. Idempotent.
pub async fn release(path: &Path) -> Result<(), StagingError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StagingError::io(path, e)),
    }
}

/// Owns the work root under which every job gets its own directory.
#[derive(Clone, Debug)]
pub struct ResourceStaging {
    root: PathBuf,
}

impl ResourceStaging {
    /// Stage under `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Work root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<job>`; everything a job writes lives below it.
    pub fn job_dir(&self, job: &JobId) -> PathBuf {
        self.root.join(job.as_str())
    }

    /// Write one payload as `<root>/<job>/inputs/<kind>.<ext>`.
    pub async fn stage(
        &self,
        job: &JobId,
        payload: &[u8],
        kind: MediaKind,
    ) -> Result<PathBuf, StagingError> {
        if payload.is_empty() {
            return Err(StagingError::Empty { kind });
        }
        let ext = sniff_extension(kind, payload).unwrap_or_else(|| kind.default_extension());

        let dir = self.job_dir(job).join("inputs");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StagingError::io(&dir, e))?;

        let path = dir.join(format!("{}.{ext}", kind.stem()));
        tokio::fs::write(&path, payload)
            .await
            .map_err(|e| StagingError::io(&path, e))?;
        debug!(job = %job, kind = %kind, bytes = payload.len(), path = %path.display(), "staged");
        Ok(path)
    }

    /// Stage both payloads. If the audio fails, the already-written image is
    /// removed before the error is returned.
    pub async fn stage_inputs(
        &self,
        job: &JobId,
        payloads: &RequestPayloads,
    ) -> Result<StagedInputs, StagingError> {
        let image_path = self.stage(job, &payloads.image, MediaKind::Image).await?;
        match self.stage(job, &payloads.audio, MediaKind::Audio).await {
            Ok(audio_path) => Ok(StagedInputs::new(image_path, audio_path)),
            Err(e) => {
                if let Err(cleanup) = release(&image_path).await {
                    warn!(job = %job, error = %cleanup, "failed to roll back staged image");
                }
                Err(e)
            }
        }
    }

    /// Remove the whole job directory. Idempotent.
    pub async fn release_scope(&self, job: &JobId) -> Result<(), StagingError> {
        let dir = self.job_dir(job);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagingError::io(&dir, e)),
        }
    }
}
