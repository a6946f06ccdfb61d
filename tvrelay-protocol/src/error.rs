//! Error types shared by the tvrelay engine and its HTTP layer.

use thiserror::Error;

/// Fatal errors for a single upstream stream.
///
/// A stream records at most one of these; every viewer attached to the
/// stream observes the same value, so the type is `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The transcoder could not be started or its segment folder could not be
    /// prepared.
    #[error("Failed to start transcoder: {0}")]
    StartupFailed(String),

    /// No complete segment was produced within the first-byte timeout.
    #[error("No data received within {0}s")]
    FirstByteTimeout(u64),

    /// Reading the transcoder output failed.
    #[error("Failed to read transcoder output: {0}")]
    ReadFailed(String),

    /// Writing into the segment store failed.
    #[error("Failed to write segment: {0}")]
    WriteFailed(String),

    /// The transcoder closed its output (process exit or upstream disconnect).
    #[error("Transcoder output ended: {0}")]
    FeedEnded(String),

    /// The stream or its segment folder disappeared while a viewer was reading.
    #[error("Stream is no longer available")]
    Gone,
}

/// Errors returned by admission control.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The playlist already uses all of its tuners on other URLs.
    #[error("Tuner limit reached for playlist {playlist_id} ({limit} in use)")]
    TunerLimitReached { playlist_id: String, limit: usize },

    /// The provider directory does not know the playlist.
    #[error("Unknown playlist: {0}")]
    UnknownPlaylist(String),
}

/// Outcome of a viewer request that produced no stream at all.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServeError {
    /// Every target was refused by admission control.
    #[error("No tuner available")]
    NoTunerAvailable,

    /// The last attempted stream failed before any byte reached the viewer.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Admission failed for a reason other than the tuner limit.
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

impl AdmissionError {
    /// Returns true if the refusal is caused by the tuner limit.
    pub fn is_tuner_limit(&self) -> bool {
        matches!(self, AdmissionError::TunerLimitReached { .. })
    }
}
