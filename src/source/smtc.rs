use std::future::Future;
use std::time::Duration;

use tokio::runtime::Runtime;
use windows::Media::Control::{
    GlobalSystemMediaTransportControlsSession, GlobalSystemMediaTransportControlsSessionManager,
    GlobalSystemMediaTransportControlsSessionMediaProperties,
    GlobalSystemMediaTransportControlsSessionPlaybackStatus as Status,
};
use windows::Storage::Streams::DataReader;

use super::{PlaybackState, PlayerBackend, PlayerTarget, SourceError};
use crate::track::TrackSnapshot;

/// TimeSpan ticks are 100ns
const TICKS_PER_SECOND: i64 = 10_000_000;

/// Windows System Media Transport Controls backend (iTunes, Apple Music,
/// anything that publishes a media session).
///
/// The session manager is the expensive IPC handle: it is requested once and
/// reused until a call on it fails.
pub struct SmtcBackend {
    target: PlayerTarget,
    timeout: Duration,
    runtime: Runtime,
    manager: Option<GlobalSystemMediaTransportControlsSessionManager>,

    /// Session resolved by the last `playback_state` call
    session: Option<GlobalSystemMediaTransportControlsSession>,

    // --- LAZY LOADING STATE ---
    // (Title, Artist, Album) as a composite key to detect track changes
    cached_key: Option<(String, String, String)>,
    cached_art: Option<Vec<u8>>,
}

impl From<windows::core::Error> for SourceError {
    fn from(e: windows::core::Error) -> Self {
        SourceError::Query(e.message().to_string())
    }
}

impl SmtcBackend {
    pub fn new(target: PlayerTarget, timeout: Duration) -> Result<Self, SourceError> {
        // WinRT async calls are driven on a private current-thread runtime
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| SourceError::Connect(format!("could not start runtime: {}", e)))?;

        Ok(Self {
            target,
            timeout,
            runtime,
            manager: None,
            session: None,
            cached_key: None,
            cached_art: None,
        })
    }

    /// Runs one WinRT async operation to completion, bounded by the query timeout.
    fn block_on<T, F>(&self, op: F) -> Result<T, SourceError>
    where
        F: Future<Output = windows::core::Result<T>>,
    {
        let timeout = self.timeout;
        self.runtime.block_on(async move {
            match tokio::time::timeout(timeout, op).await {
                Ok(result) => result.map_err(SourceError::from),
                Err(_) => Err(SourceError::Timeout(timeout)),
            }
        })
    }

    fn find_session(&self) -> Result<Option<GlobalSystemMediaTransportControlsSession>, SourceError> {
        let manager = self
            .manager
            .as_ref()
            .ok_or_else(|| SourceError::Connect("session manager not acquired".into()))?;

        match &self.target {
            // No current session is reported as an error by WinRT
            PlayerTarget::AnyActive => Ok(manager.GetCurrentSession().ok()),
            PlayerTarget::App(name) => {
                let wanted = name.to_lowercase();
                let sessions = manager.GetSessions()?;
                for i in 0..sessions.Size()? {
                    let session = sessions.GetAt(i)?;
                    let app_id = session.SourceAppUserModelId()?.to_string().to_lowercase();
                    if app_id.contains(&wanted) {
                        return Ok(Some(session));
                    }
                }
                Ok(None)
            }
        }
    }

    fn read_artwork(&self, props: &GlobalSystemMediaTransportControlsSessionMediaProperties) -> Option<Vec<u8>> {
        let thumb_ref = props.Thumbnail().ok()?;
        let stream = self.block_on(thumb_ref.OpenReadAsync().ok()?).ok()?;
        let size = stream.Size().ok()?;
        if size == 0 {
            return None;
        }

        let reader = DataReader::CreateDataReader(&stream).ok()?;
        let size = u32::try_from(size).ok()?;
        self.block_on(reader.LoadAsync(size).ok()?).ok()?;

        let mut bytes = vec![0u8; size as usize];
        reader.ReadBytes(&mut bytes).ok()?;
        Some(bytes)
    }
}

/// Helper function to clean up Windows App Ids
///
/// "iTunes.exe" -> "iTunes", "AppleInc.AppleMusicWin_nzyj5cx40ttqa!App" -> "AppleMusicWin"
fn clean_app_name(raw_id: &str) -> String {
    if let Some((family, _)) = raw_id.split_once('!') {
        // UWP: Publisher.Name_hash!EntryPoint
        let name = family.split('_').next().unwrap_or(family);
        return name.rsplit('.').next().unwrap_or(name).to_string();
    }

    let cut = raw_id.len().saturating_sub(4);
    match raw_id.get(cut..) {
        Some(ext) if ext.eq_ignore_ascii_case(".exe") => raw_id[..cut].to_string(),
        _ => raw_id.to_string(),
    }
}

fn map_status(status: Status) -> PlaybackState {
    if status == Status::Playing {
        PlaybackState::Playing
    } else if status == Status::Paused {
        PlaybackState::Paused
    } else {
        // Closed / Opened / Changing / Stopped
        PlaybackState::Stopped
    }
}

impl PlayerBackend for SmtcBackend {
    fn connect(&mut self) -> Result<(), SourceError> {
        let op = GlobalSystemMediaTransportControlsSessionManager::RequestAsync()
            .map_err(|e| SourceError::Connect(e.message().to_string()))?;
        let manager = self.block_on(op)?;
        self.manager = Some(manager);
        Ok(())
    }

    fn playback_state(&mut self) -> Result<PlaybackState, SourceError> {
        self.session = None;

        let Some(session) = self.find_session()? else {
            return Ok(PlaybackState::NotRunning);
        };

        let status = session.GetPlaybackInfo()?.PlaybackStatus()?;
        self.session = Some(session);
        Ok(map_status(status))
    }

    fn current_track(&mut self) -> Result<Option<TrackSnapshot>, SourceError> {
        let Some(session) = self.session.take() else {
            return Ok(None);
        };

        let app_id = session.SourceAppUserModelId().map(|h| h.to_string()).unwrap_or_default();
        let props = self.block_on(session.TryGetMediaPropertiesAsync()?)?;

        let title = props.Title().map(|h| h.to_string()).unwrap_or_default();
        if title.is_empty() {
            return Ok(None);
        }
        let artist = props.Artist().map(|h| h.to_string()).unwrap_or_default();
        let album = props.AlbumTitle().map(|h| h.to_string()).unwrap_or_default();
        let track_number = props.TrackNumber().unwrap_or(0).max(0) as u32;
        let total_tracks = props.AlbumTrackCount().unwrap_or(0).max(0) as u32;

        let (duration_secs, position_secs) = session
            .GetTimelineProperties()
            .and_then(|t| {
                Ok((
                    t.StartTime()?.Duration,
                    t.EndTime()?.Duration,
                    t.Position()?.Duration,
                ))
            })
            .map(|(start, end, position)| {
                (
                    ((end - start).max(0) / TICKS_PER_SECOND) as u64,
                    ((position - start).max(0) / TICKS_PER_SECOND) as u64,
                )
            })
            .unwrap_or((0, 0));

        // --- LAZY LOAD LOGIC ---
        let key = (title.clone(), artist.clone(), album.clone());
        let artwork = if self.cached_key.as_ref() == Some(&key) {
            self.cached_art.clone()
        } else {
            let art = self.read_artwork(&props);
            self.cached_key = Some(key);
            self.cached_art = art.clone();
            art
        };

        Ok(Some(
            TrackSnapshot::new(title, artist, album)
                .with_track_number(track_number, total_tracks)
                .with_duration_secs(duration_secs)
                .with_position_secs(position_secs)
                .with_artwork(artwork)
                .with_source(clean_app_name(&app_id)),
        ))
    }

    fn disconnect(&mut self) {
        self.session = None;
        self.manager = None;
        self.cached_key = None;
        self.cached_art = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_app_name_standard_exe() {
        assert_eq!(clean_app_name("iTunes.exe"), "iTunes");
        assert_eq!(clean_app_name("Spotify.EXE"), "Spotify");
        assert_eq!(clean_app_name("firefox"), "firefox");
        assert_eq!(clean_app_name(""), "");
    }

    #[test]
    fn test_clean_app_name_uwp() {
        assert_eq!(clean_app_name("AppleInc.AppleMusicWin_nzyj5cx40ttqa!App"), "AppleMusicWin");
        assert_eq!(clean_app_name("Microsoft.ZuneMusic_8wekyb3d8bbwe!Microsoft.ZuneMusic"), "ZuneMusic");
    }

    #[test]
    fn test_map_status() {
        assert_eq!(map_status(Status::Playing), PlaybackState::Playing);
        assert_eq!(map_status(Status::Paused), PlaybackState::Paused);
        assert_eq!(map_status(Status::Stopped), PlaybackState::Stopped);
        assert_eq!(map_status(Status::Changing), PlaybackState::Stopped);
    }
}
