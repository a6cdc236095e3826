use super::{PlaybackState, PlayerBackend, PlayerSource, SourceError};
use crate::track::TrackSnapshot;

/// Adapts a fallible [`PlayerBackend`] to the never-failing [`PlayerSource`]
/// contract.
///
/// - connects lazily on the first query, and again on every query while
///   disconnected
/// - only asks for track data while the player reports `Playing`
/// - any backend error drops the connection; the next query reconnects
pub struct ManagedSource<B: PlayerBackend> {
    label: String,
    backend: B,
    connected: bool,

    /// Consecutive failed queries/connects. Only the first of a streak is
    /// logged as a warning, so a closed player doesn't flood the log.
    failures: u32,
}

impl<B: PlayerBackend> ManagedSource<B> {
    pub fn new(label: impl Into<String>, backend: B) -> Self {
        Self {
            label: label.into(),
            backend,
            connected: false,
            failures: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn ensure_connected(&mut self) -> bool {
        if self.connected {
            return true;
        }

        match self.backend.connect() {
            Ok(()) => {
                tracing::info!("[Source] {} connected", self.label);
                self.connected = true;
                true
            }
            Err(e) => {
                self.note_failure("connect", &e);
                false
            }
        }
    }

    fn poll(&mut self) -> Result<Option<TrackSnapshot>, SourceError> {
        match self.backend.playback_state()? {
            PlaybackState::Playing => self.backend.current_track(),
            state => {
                tracing::trace!("[Source] {} not playing ({:?})", self.label, state);
                Ok(None)
            }
        }
    }

    fn note_failure(&mut self, what: &str, error: &SourceError) {
        if self.failures == 0 {
            tracing::warn!("[Source] {} {} failed: {}", self.label, what, error);
        } else {
            tracing::debug!("[Source] {} {} failed again (x{}): {}", self.label, what, self.failures + 1, error);
        }
        self.failures = self.failures.saturating_add(1);
    }
}

impl<B: PlayerBackend> PlayerSource for ManagedSource<B> {
    fn name(&self) -> &str {
        &self.label
    }

    fn query(&mut self) -> Option<TrackSnapshot> {
        if !self.ensure_connected() {
            return None;
        }

        match self.poll() {
            Ok(track) => {
                if self.failures > 0 {
                    tracing::info!("[Source] {} recovered after {} failed attempt(s)", self.label, self.failures);
                    self.failures = 0;
                }
                track
            }
            Err(e) => {
                self.note_failure("query", &e);
                self.backend.disconnect();
                self.connected = false;
                None
            }
        }
    }

    fn release(&mut self) {
        if self.connected {
            self.backend.disconnect();
            self.connected = false;
            tracing::info!("[Source] {} released", self.label);
        }
    }
}

impl<B: PlayerBackend> Drop for ManagedSource<B> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Backend driven by a queue of scripted answers.
    #[derive(Default)]
    struct ScriptedBackend {
        connects: VecDeque<Result<(), SourceError>>,
        states: VecDeque<Result<PlaybackState, SourceError>>,
        tracks: VecDeque<Result<Option<TrackSnapshot>, SourceError>>,
        connect_calls: u32,
        track_calls: u32,
        disconnects: u32,
    }

    impl PlayerBackend for ScriptedBackend {
        fn connect(&mut self) -> Result<(), SourceError> {
            self.connect_calls += 1;
            self.connects.pop_front().unwrap_or(Ok(()))
        }
        fn playback_state(&mut self) -> Result<PlaybackState, SourceError> {
            self.states.pop_front().unwrap_or(Ok(PlaybackState::NotRunning))
        }
        fn current_track(&mut self) -> Result<Option<TrackSnapshot>, SourceError> {
            self.track_calls += 1;
            self.tracks.pop_front().unwrap_or(Ok(None))
        }
        fn disconnect(&mut self) {
            self.disconnects += 1;
        }
    }

    fn song() -> TrackSnapshot {
        TrackSnapshot::new("Song A", "Artist X", "Album Y").with_track_number(1, 10)
    }

    #[test]
    fn test_connects_lazily_and_retries() {
        let mut backend = ScriptedBackend::default();
        backend.connects.push_back(Err(SourceError::Connect("no bus".into())));
        backend.connects.push_back(Ok(()));
        backend.states.push_back(Ok(PlaybackState::Playing));
        backend.tracks.push_back(Ok(Some(song())));

        let mut source = ManagedSource::new("test", backend);
        assert!(!source.is_connected());
        assert_eq!(source.backend.connect_calls, 0);

        // First tick: connect fails, empty result
        assert!(source.query().is_none());
        assert!(!source.is_connected());

        // Second tick: connect retried and succeeds
        assert_eq!(source.query().unwrap().title, "Song A");
        assert!(source.is_connected());
        assert_eq!(source.backend.connect_calls, 2);
    }

    #[test]
    fn test_only_playing_reaches_track_query() {
        let mut backend = ScriptedBackend::default();
        backend.states.push_back(Ok(PlaybackState::Paused));
        backend.states.push_back(Ok(PlaybackState::Stopped));
        backend.states.push_back(Ok(PlaybackState::NotRunning));

        let mut source = ManagedSource::new("test", backend);
        for _ in 0..3 {
            assert!(source.query().is_none());
        }
        assert_eq!(source.backend.track_calls, 0);
        // Not playing is not a failure: the connection is kept
        assert!(source.is_connected());
        assert_eq!(source.backend.disconnects, 0);
    }

    #[test]
    fn test_query_error_maps_to_empty_and_reconnects() {
        let mut backend = ScriptedBackend::default();
        backend.states.push_back(Ok(PlaybackState::Playing));
        backend.tracks.push_back(Err(SourceError::Query("pipe closed".into())));
        backend.states.push_back(Ok(PlaybackState::Playing));
        backend.tracks.push_back(Ok(Some(song())));

        let mut source = ManagedSource::new("test", backend);
        assert!(source.query().is_none());
        assert!(!source.is_connected());
        assert_eq!(source.backend.disconnects, 1);
        assert_eq!(source.failures, 1);

        assert!(source.query().is_some());
        assert_eq!(source.backend.connect_calls, 2);
        assert_eq!(source.failures, 0);
    }

    #[test]
    fn test_always_failing_backend_stays_empty() {
        let mut backend = ScriptedBackend::default();
        for _ in 0..50 {
            backend.connects.push_back(Err(SourceError::Timeout(std::time::Duration::from_secs(2))));
        }

        let mut source = ManagedSource::new("test", backend);
        for _ in 0..50 {
            assert!(source.query().is_none());
        }
        assert_eq!(source.failures, 50);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut source = ManagedSource::new("test", ScriptedBackend::default());

        // Never connected: nothing to tear down
        source.release();
        source.release();
        assert_eq!(source.backend.disconnects, 0);

        source.query();
        assert!(source.is_connected());
        source.release();
        source.release();
        assert_eq!(source.backend.disconnects, 1);
        assert!(!source.is_connected());
    }
}
