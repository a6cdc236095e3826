use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// One observation of the track a player is currently playing.
///
/// Built fresh by a player source on every successful query and never mutated
/// afterwards. "Nothing playing" is not a snapshot: it is `None` wherever a
/// snapshot is expected.
///
/// Equality is *track identity*: title, artist, album and track number.
/// Duration, playback position, total tracks, artwork and the source label are
/// left out so metadata jitter from the player (duration rounding, artwork arriving a
/// tick late) never reads as a track change.
#[derive(Clone, Debug, Default)]
pub struct TrackSnapshot {
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Whole seconds, rounded down.
    pub duration_secs: u64,
    /// Playback position when observed, whole seconds. 0 when the player
    /// does not report one.
    pub position_secs: u64,
    /// 0 = unknown
    pub track_number: u32,
    /// 0 = unknown
    pub total_tracks: u32,
    /// Encoded image bytes as handed over by the player
    pub artwork: Option<Vec<u8>>,
    /// Display name of the application the snapshot came from
    pub source_app: String,
}

impl TrackSnapshot {
    pub fn new(title: impl Into<String>, artist: impl Into<String>, album: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            album: album.into(),
            ..Default::default()
        }
    }

    pub fn with_track_number(mut self, track_number: u32, total_tracks: u32) -> Self {
        self.track_number = track_number;
        self.total_tracks = total_tracks;
        self
    }

    /// Sub-second precision is dropped here, never rounded up.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_secs = duration.as_secs();
        self
    }

    pub fn with_duration_secs(mut self, secs: u64) -> Self {
        self.duration_secs = secs;
        self
    }

    pub fn with_position(mut self, position: Duration) -> Self {
        self.position_secs = position.as_secs();
        self
    }

    pub fn with_position_secs(mut self, secs: u64) -> Self {
        self.position_secs = secs;
        self
    }

    pub fn with_artwork(mut self, artwork: Option<Vec<u8>>) -> Self {
        self.artwork = artwork;
        self
    }

    pub fn with_source(mut self, source_app: impl Into<String>) -> Self {
        self.source_app = source_app.into();
        self
    }

    /// Identity comparison (title, artist, album, track number).
    pub fn is_same_track(&self, other: &TrackSnapshot) -> bool {
        self.track_number == other.track_number
            && self.title == other.title
            && self.artist == other.artist
            && self.album == other.album
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Position clamped to the duration when the duration is known.
    pub fn elapsed_secs(&self) -> u64 {
        if self.duration_secs == 0 {
            self.position_secs
        } else {
            self.position_secs.min(self.duration_secs)
        }
    }

    /// "3:05", or "1:02:03" once past the hour. Unknown duration renders as "-".
    pub fn formatted_duration(&self) -> String {
        if self.duration_secs == 0 {
            return "-".to_string();
        }
        format_clock(self.duration_secs)
    }

    /// "3/12", or "-" when either side is unknown.
    pub fn track_position(&self) -> String {
        if self.track_number == 0 || self.total_tracks == 0 {
            return "-".to_string();
        }
        format!("{}/{}", self.track_number, self.total_tracks)
    }
}

impl PartialEq for TrackSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.is_same_track(other)
    }
}

impl Eq for TrackSnapshot {}

impl Hash for TrackSnapshot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.title.hash(state);
        self.artist.hash(state);
        self.album.hash(state);
        self.track_number.hash(state);
    }
}

impl fmt::Display for TrackSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.artist, self.title)?;
        if !self.album.is_empty() {
            write!(f, " [{}]", self.album)?;
        }
        Ok(())
    }
}

/// Did the observation change between two ticks?
///
/// `None` vs `Some` always counts as a change; two snapshots only when their
/// identity differs.
pub fn observation_changed(previous: Option<&TrackSnapshot>, current: Option<&TrackSnapshot>) -> bool {
    match (previous, current) {
        (None, None) => false,
        (Some(a), Some(b)) => !a.is_same_track(b),
        _ => true,
    }
}

/// Seconds to "m:ss" / "h:mm:ss"
pub fn format_clock(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

/// Parses "m:ss" or "h:mm:ss" (as reported by some players) into seconds.
pub fn parse_clock(text: &str) -> Option<u64> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let mut total = 0u64;
    for (i, part) in parts.iter().enumerate() {
        let value: u64 = part.parse().ok()?;
        // Minutes and seconds after the leading field are bounded
        if i > 0 && value >= 60 {
            return None;
        }
        total = total.checked_mul(60)?.checked_add(value)?;
    }
    Some(total)
}
