use std::time::Duration;

use super::{PlaybackState, PlayerBackend, PlayerTarget, SourceError};
use crate::track::TrackSnapshot;

/// Fallback for operating systems without a player integration.
pub struct UnsupportedBackend;

impl UnsupportedBackend {
    pub fn new(_target: PlayerTarget, _timeout: Duration) -> Result<Self, SourceError> {
        Err(SourceError::Unsupported)
    }
}

impl PlayerBackend for UnsupportedBackend {
    fn connect(&mut self) -> Result<(), SourceError> {
        Err(SourceError::Unsupported)
    }

    fn playback_state(&mut self) -> Result<PlaybackState, SourceError> {
        Err(SourceError::Unsupported)
    }

    fn current_track(&mut self) -> Result<Option<TrackSnapshot>, SourceError> {
        Err(SourceError::Unsupported)
    }

    fn disconnect(&mut self) {}
}
