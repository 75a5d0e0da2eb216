use std::io;

use songbird::error::JoinError;
use songbird::tracks::TrackError;
use thiserror::Error;

/// A search or a stream re-fetch that produced nothing playable.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("no results found for `{0}`")]
    NotFound(String),

    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("could not open a stream for `{title}`: {reason}")]
    Stream { title: String, reason: String },
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("not connected to a voice channel")]
    NotConnected,

    #[error(transparent)]
    Track(#[from] TrackError),

    #[error("playback interrupted: {0}")]
    Interrupted(String),
}

/// Everything a command can fail with. The `Display` text is shown to users.
#[derive(Debug, Error)]
pub enum MusicError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("No channel to join. Please either specify a valid channel or join one.")]
    InvalidChannel,

    #[error("I am not currently connected to voice!")]
    NotConnected,

    #[error("I am not currently playing anything!")]
    NotPlaying,

    #[error("There is no track at position {position}, the queue has {len}.")]
    IndexOutOfRange { position: usize, len: usize },

    #[error("There is no page {page}, the queue has {pages}.")]
    PageOutOfRange { page: usize, pages: usize },

    #[error("Volume should be between 1 and 100, not {0}")]
    VolumeOutOfRange(f32),

    #[error("Usage: `{0}`")]
    Usage(&'static str),

    #[error("Could not join the voice channel: {0}")]
    Join(#[from] JoinError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error("The music player is not ready yet")]
    Unavailable,
}

impl MusicError {
    /// Mistakes on the user's side, as opposed to something breaking.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            MusicError::Resolution(ResolutionError::Spawn { .. } | ResolutionError::Extraction(_))
                | MusicError::Join(_)
                | MusicError::Playback(_)
                | MusicError::Unavailable
        )
    }
}
