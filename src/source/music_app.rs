use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

// We need base64 decoding to handle the image data from JXA
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;

use super::{PlaybackState, PlayerBackend, PlayerTarget, SourceError};
use crate::track::{parse_clock, TrackSnapshot};

const OSASCRIPT: &str = "/usr/bin/osascript";
const WAIT_STEP: Duration = Duration::from_millis(20);

/// Apps tried in order when the target is "any active player"
const CANDIDATE_APPS: &[&str] = &["Music", "iTunes", "Spotify"];

/// macOS backend: asks the Music app (or another scriptable player) for its
/// state through `osascript`.
///
/// There is no long-lived handle here; "connected" only means osascript is
/// available. Each query is a child process, killed when it overruns the
/// timeout.
pub struct MusicAppBackend {
    target: PlayerTarget,
    timeout: Duration,

    /// Reply fetched by the last `playback_state` call
    last_reply: Option<JxaReply>,

    // "title|artist|album" of the track whose artwork we hold
    cached_key: String,
    cached_art: Option<Vec<u8>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JxaReply {
    running: bool,
    #[serde(default)]
    app: String,
    #[serde(default)]
    state: String,
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    /// Seconds, fractional
    duration: Option<f64>,
    /// "m:ss" clock string, used when `duration` is missing
    time: Option<String>,
    /// Seconds into the track, fractional
    position: Option<f64>,
    track_number: Option<i64>,
    track_count: Option<i64>,
    /// Base64 artwork, only sent when the track differs from `argv[1]`
    art: Option<String>,
}

const JXA_SCRIPT: &str = r#"
function run(argv) {
    var names = argv[0].split(",");
    var knownKey = argv[1] || "";

    function toBase64(data) {
        if (!data) return null;
        try {
            var nsData = ObjC.unwrap(data);
            var base64Str = nsData.base64EncodedStringWithOptions(0);
            return ObjC.unwrap(base64Str);
        } catch (e) { return null; }
    }

    var app = null;
    for (var i = 0; i < names.length; i++) {
        try {
            if (Application(names[i]).running()) {
                app = Application(names[i]);
                break;
            }
        } catch (e) {}
    }
    if (!app) return JSON.stringify({ running: false });

    var out = { running: true, app: app.name(), state: "stopped" };
    try { out.state = String(app.playerState()); } catch (e) {}
    if (out.state !== "playing") return JSON.stringify(out);
    try { out.position = app.playerPosition(); } catch (e) {}

    try {
        var track = app.currentTrack;
        out.title = track.name();
        out.artist = track.artist();
        out.album = track.album();
        try { out.duration = track.duration(); } catch (e) {}
        try { out.time = track.time(); } catch (e) {}
        try { out.trackNumber = track.trackNumber(); } catch (e) {}
        try { out.trackCount = track.trackCount(); } catch (e) {}

        var key = out.title + "|" + out.artist + "|" + out.album;
        if (key !== knownKey) {
            try {
                var artworks = track.artworks();
                if (artworks.length > 0) out.art = toBase64(artworks[0].rawData());
            } catch (e) {}
        }
    } catch (e) {}

    return JSON.stringify(out);
}
"#;

impl MusicAppBackend {
    pub fn new(target: PlayerTarget, timeout: Duration) -> Result<Self, SourceError> {
        Ok(Self {
            target,
            timeout,
            last_reply: None,
            cached_key: String::new(),
            cached_art: None,
        })
    }

    fn run_script(&self) -> Result<JxaReply, SourceError> {
        let wanted = match &self.target {
            PlayerTarget::App(name) => name.clone(),
            PlayerTarget::AnyActive => CANDIDATE_APPS.join(","),
        };

        let mut child = Command::new(OSASCRIPT)
            .args(["-l", "JavaScript", "-e", JXA_SCRIPT, wanted.as_str(), self.cached_key.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SourceError::Connect(e.to_string()))?;

        // Drain stdout on the side so a large artwork payload can't fill the pipe
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Query("osascript stdout unavailable".into()))?;
        let reader = thread::spawn(move || {
            let mut text = String::new();
            stdout.read_to_string(&mut text).map(|_| text)
        });

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SourceError::Timeout(self.timeout));
                }
                Ok(None) => thread::sleep(WAIT_STEP),
                Err(e) => return Err(SourceError::Query(e.to_string())),
            }
        };

        let text = reader
            .join()
            .map_err(|_| SourceError::Query("stdout reader panicked".into()))?
            .map_err(|e| SourceError::Query(e.to_string()))?;

        if !status.success() {
            return Err(SourceError::Query(format!("osascript exited with {}", status)));
        }
        parse_reply(&text)
    }
}

fn parse_reply(text: &str) -> Result<JxaReply, SourceError> {
    serde_json::from_str(text.trim()).map_err(|e| SourceError::Malformed(e.to_string()))
}

fn map_state(reply: &JxaReply) -> PlaybackState {
    if !reply.running {
        return PlaybackState::NotRunning;
    }
    match reply.state.as_str() {
        "playing" => PlaybackState::Playing,
        "paused" => PlaybackState::Paused,
        // "stopped", "fast forwarding", "rewinding"
        _ => PlaybackState::Stopped,
    }
}

fn track_key(title: &str, artist: &str, album: &str) -> String {
    format!("{}|{}|{}", title, artist, album)
}

/// Builds a snapshot from a "playing" reply. Artwork is handled by the caller.
fn snapshot_from_reply(reply: &JxaReply) -> Option<TrackSnapshot> {
    let title = reply.title.clone().unwrap_or_default();
    if title.is_empty() {
        return None;
    }

    let duration_secs = match reply.duration {
        Some(secs) if secs.is_finite() && secs > 0.0 => secs.floor() as u64,
        _ => reply.time.as_deref().and_then(parse_clock).unwrap_or(0),
    };
    let position_secs = match reply.position {
        Some(secs) if secs.is_finite() && secs > 0.0 => secs.floor() as u64,
        _ => 0,
    };
    let to_count = |n: Option<i64>| n.map(|v| v.clamp(0, u32::MAX as i64) as u32).unwrap_or(0);

    Some(
        TrackSnapshot::new(
            title,
            reply.artist.clone().unwrap_or_default(),
            reply.album.clone().unwrap_or_default(),
        )
        .with_track_number(to_count(reply.track_number), to_count(reply.track_count))
        .with_duration_secs(duration_secs)
        .with_position_secs(position_secs)
        .with_source(reply.app.clone()),
    )
}

impl PlayerBackend for MusicAppBackend {
    fn connect(&mut self) -> Result<(), SourceError> {
        if !Path::new(OSASCRIPT).exists() {
            return Err(SourceError::Connect(format!("{} not found", OSASCRIPT)));
        }
        tracing::debug!("[Source/MacOS] osascript available, target: {}", self.target.label());
        Ok(())
    }

    fn playback_state(&mut self) -> Result<PlaybackState, SourceError> {
        self.last_reply = None;
        let reply = self.run_script()?;
        let state = map_state(&reply);
        self.last_reply = Some(reply);
        Ok(state)
    }

    fn current_track(&mut self) -> Result<Option<TrackSnapshot>, SourceError> {
        let Some(reply) = self.last_reply.take() else {
            return Ok(None);
        };
        let Some(track) = snapshot_from_reply(&reply) else {
            return Ok(None);
        };

        let key = track_key(&track.title, &track.artist, &track.album);
        if key != self.cached_key {
            // New track: the script sent artwork (or there is none)
            self.cached_art = reply
                .art
                .as_deref()
                .and_then(|b64| general_purpose::STANDARD.decode(b64).ok());
            self.cached_key = key;
        }

        Ok(Some(track.with_artwork(self.cached_art.clone())))
    }

    fn disconnect(&mut self) {
        self.last_reply = None;
        self.cached_key.clear();
        self.cached_art = None;
    }
}
