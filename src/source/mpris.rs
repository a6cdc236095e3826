use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use mpris::{FindingError, PlaybackStatus, Player, PlayerFinder};

use super::{PlaybackState, PlayerBackend, PlayerTarget, SourceError};
use crate::track::TrackSnapshot;

/// MPRIS (D-Bus) backend for Linux players.
///
/// The session-bus connection lives in the `PlayerFinder`; it is the
/// expensive handle that gets dropped on error and rebuilt lazily.
pub struct MprisBackend {
    target: PlayerTarget,
    timeout: Duration,
    finder: Option<PlayerFinder>,

    /// Player resolved by the last `playback_state` call
    player: Option<Player>,

    /// Artwork of the last art URL we read, so it is loaded once per track
    art_cache: Option<(String, Option<Vec<u8>>)>,
}

impl MprisBackend {
    pub fn new(target: PlayerTarget, timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            target,
            timeout,
            finder: None,
            player: None,
            art_cache: None,
        })
    }

    fn find_player(&self) -> Result<Option<Player>, SourceError> {
        let finder = self
            .finder
            .as_ref()
            .ok_or_else(|| SourceError::Connect("not connected to the session bus".into()))?;

        let found = match &self.target {
            PlayerTarget::App(name) => finder.find_by_name(name),
            PlayerTarget::AnyActive => finder.find_active(),
        };

        match found {
            Ok(player) => Ok(Some(player)),
            Err(FindingError::NoPlayerFound) => Ok(None),
            Err(FindingError::DBusError(e)) => Err(SourceError::Query(e.to_string())),
        }
    }

    fn artwork_for(&mut self, art_url: Option<&str>) -> Option<Vec<u8>> {
        let url = art_url?;
        if let Some((cached_url, art)) = &self.art_cache {
            if cached_url == url {
                return art.clone();
            }
        }

        let art = load_art_from_url(url);
        self.art_cache = Some((url.to_string(), art.clone()));
        art
    }
}

impl PlayerBackend for MprisBackend {
    fn connect(&mut self) -> Result<(), SourceError> {
        let mut finder = PlayerFinder::new().map_err(|e| SourceError::Connect(e.to_string()))?;
        let timeout_ms = i32::try_from(self.timeout.as_millis()).unwrap_or(i32::MAX);
        finder.set_player_timeout_ms(timeout_ms);
        self.finder = Some(finder);
        Ok(())
    }

    fn playback_state(&mut self) -> Result<PlaybackState, SourceError> {
        self.player = None;

        let Some(player) = self.find_player()? else {
            return Ok(PlaybackState::NotRunning);
        };

        let status = player
            .get_playback_status()
            .map_err(|e| SourceError::Query(e.to_string()))?;

        let state = match status {
            PlaybackStatus::Playing => PlaybackState::Playing,
            PlaybackStatus::Paused => PlaybackState::Paused,
            PlaybackStatus::Stopped => PlaybackState::Stopped,
        };
        self.player = Some(player);
        Ok(state)
    }

    fn current_track(&mut self) -> Result<Option<TrackSnapshot>, SourceError> {
        let Some(player) = self.player.take() else {
            return Ok(None);
        };

        let meta = player
            .get_metadata()
            .map_err(|e| SourceError::Query(e.to_string()))?;

        let title = meta.title().unwrap_or_default().to_string();
        if title.is_empty() {
            return Ok(None);
        }

        let artist = meta.artists().map(|a| a.join(", ")).unwrap_or_default();
        let album = meta.album_name().unwrap_or_default().to_string();
        let track_number = meta.track_number().map(|n| n.max(0) as u32).unwrap_or(0);
        let duration = meta.length().unwrap_or_default();
        // Not every player implements Position
        let position = player.get_position().unwrap_or_default();
        let art_url = meta.art_url().map(str::to_string);
        let artwork = self.artwork_for(art_url.as_deref());

        // MPRIS has no album track count
        Ok(Some(
            TrackSnapshot::new(title, artist, album)
                .with_track_number(track_number, 0)
                .with_duration(duration)
                .with_position(position)
                .with_artwork(artwork)
                .with_source(player.identity()),
        ))
    }

    fn disconnect(&mut self) {
        self.player = None;
        self.finder = None;
        self.art_cache = None;
    }
}

/// Helper function to load album art from a file:// URL
fn load_art_from_url(art_url: &str) -> Option<Vec<u8>> {
    // Most linux players return "file:///path/to/image.jpg"
    let path_str = art_url.strip_prefix("file://")?;
    let path = PathBuf::from(url_decode(path_str));

    if path.exists() {
        return fs::read(path).ok();
    }
    None
}

/// Minimal percent-decoder for file paths (spaces, non-ASCII names)
fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                output.push(byte);
                i += 3;
                continue;
            }
        }
        output.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&output).into_owned()
}
