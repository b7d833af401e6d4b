//! Failure taxonomy for a single ingestion request.
//!
//! "Not found" is never represented here: a missing record, file or directory
//! is ordinary state that drives the reconciliation branches.

use std::path::PathBuf;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The channel metadata API rejected the id, ran out of quota or returned
    /// something unusable.
    #[error("channel metadata unavailable for {channel_id}")]
    MetadataUnavailable {
        channel_id: String,
        #[source]
        source: BoxError,
    },

    /// Media or thumbnail retrieval failed.
    #[error("media unavailable for {video_id}")]
    MediaUnavailable {
        video_id: String,
        #[source]
        source: BoxError,
    },

    #[error("metadata store unavailable")]
    StoreUnavailable {
        #[source]
        source: BoxError,
    },

    /// A local write (logo, directory) failed.
    #[error("filesystem operation failed on {}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

impl IngestError {
    pub fn metadata(channel_id: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::MetadataUnavailable {
            channel_id: channel_id.into(),
            source: source.into(),
        }
    }

    pub fn media(video_id: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::MediaUnavailable {
            video_id: video_id.into(),
            source: source.into(),
        }
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        Self::Filesystem {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn store(source: impl Into<BoxError>) -> Self {
        Self::StoreUnavailable {
            source: source.into(),
        }
    }
}
