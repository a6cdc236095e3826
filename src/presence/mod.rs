use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::track::TrackSnapshot;

mod discord;
pub mod ipc;

pub use discord::{Connector, DiscordSink, PresenceSettings};

/// The external status display kept in sync with the current track.
///
/// Construction and [`initialize`](PresenceSink::initialize) are separate: a
/// sink whose initialization failed stays inert, and `update` / `clear` on it
/// return `Ok(())` without doing anything. Errors that do come back are for
/// logging only; the monitor never stops because of them.
pub trait PresenceSink: Send {
    fn initialize(&mut self) -> Result<(), PresenceError>;

    fn update(&mut self, track: &TrackSnapshot) -> Result<(), PresenceError>;

    fn clear(&mut self) -> Result<(), PresenceError>;

    /// Clears the status, then closes the connection.
    fn shutdown(&mut self) -> Result<(), PresenceError>;
}

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("no presence service reachable (tried {0} endpoints)")]
    NotFound(usize),

    #[error("presence connection failed: {0}")]
    Io(#[from] io::Error),

    #[error("presence protocol error: {0}")]
    Protocol(String),

    #[error("presence service did not answer within {0:?}")]
    Timeout(Duration),

    #[error("presence update rejected: {0}")]
    Rejected(String),

    #[error("could not encode presence payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Sink used when presence is switched off.
#[derive(Debug, Default)]
pub struct NullSink;

impl PresenceSink for NullSink {
    fn initialize(&mut self) -> Result<(), PresenceError> {
        tracing::info!("[Presence] Disabled in settings");
        Ok(())
    }

    fn update(&mut self, _track: &TrackSnapshot) -> Result<(), PresenceError> {
        Ok(())
    }

    fn clear(&mut self) -> Result<(), PresenceError> {
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), PresenceError> {
        Ok(())
    }
}
