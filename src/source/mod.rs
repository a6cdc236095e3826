use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::track::TrackSnapshot;

mod disabled;
mod managed;

pub use disabled::DisabledSource;
pub use managed::ManagedSource;

/// Something that can tell us what a media player is playing right now.
///
/// `query` never fails: "player closed", "nothing playing" and "the connection
/// just broke" all come back as `None`. Implementations are expected to return
/// within their configured query timeout.
pub trait PlayerSource {
    /// Label used in logs
    fn name(&self) -> &str;

    fn query(&mut self) -> Option<TrackSnapshot>;

    /// Drops any connection to the player. Safe to call repeatedly, and on a
    /// source that never connected.
    fn release(&mut self);
}

/// The fallible, per-platform half of a player source.
///
/// [`ManagedSource`] wraps one of these and turns every error into an empty
/// result plus a lazy reconnect.
pub trait PlayerBackend {
    fn connect(&mut self) -> Result<(), SourceError>;

    fn playback_state(&mut self) -> Result<PlaybackState, SourceError>;

    /// Only called right after `playback_state` reported `Playing`.
    fn current_track(&mut self) -> Result<Option<TrackSnapshot>, SourceError>;

    fn disconnect(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    NotRunning,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("player backend is not available on this platform")]
    Unsupported,

    #[error("could not connect to player: {0}")]
    Connect(String),

    #[error("player query failed: {0}")]
    Query(String),

    #[error("player did not answer within {0:?}")]
    Timeout(Duration),

    #[error("player returned malformed data: {0}")]
    Malformed(String),
}

/// Priority slot of a source. The configured list order is the query order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    Primary,
    Secondary,
}

/// Which application a backend should look at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerTarget {
    /// A specific application, matched by name / app id (case-insensitive)
    App(String),
    /// Whatever session the OS currently considers active
    AnyActive,
}

impl PlayerTarget {
    pub fn label(&self) -> &str {
        match self {
            PlayerTarget::App(name) => name,
            PlayerTarget::AnyActive => "active player",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub role: SourceRole,
    pub target: PlayerTarget,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceConfig {
    pub fn new(role: SourceRole, target: PlayerTarget) -> Self {
        Self { role, target, enabled: true }
    }
}

/// Queries sources in order and returns the first snapshot. Later sources are
/// not touched once one answers.
pub fn query_in_order(sources: &mut [Box<dyn PlayerSource>]) -> Option<TrackSnapshot> {
    sources.iter_mut().find_map(|source| source.query())
}

pub fn release_all(sources: &mut [Box<dyn PlayerSource>]) {
    for source in sources.iter_mut() {
        source.release();
    }
}

/// Builds the enabled sources in configured order.
pub fn build_sources(configs: &[SourceConfig], timeout: Duration) -> Vec<Box<dyn PlayerSource>> {
    configs
        .iter()
        .filter(|c| c.enabled)
        .map(|c| build_source(c, timeout))
        .collect()
}

fn build_source(config: &SourceConfig, timeout: Duration) -> Box<dyn PlayerSource> {
    let label = format!("{:?}/{}", config.role, config.target.label());

    if let PlayerTarget::App(name) = &config.target {
        if name.trim().is_empty() {
            return Box::new(DisabledSource::new(label, "empty application name"));
        }
    }

    match PlatformBackend::new(config.target.clone(), timeout) {
        Ok(backend) => Box::new(ManagedSource::new(label, backend)),
        Err(e) => {
            tracing::error!("[Source] Could not construct {}: {}", label, e);
            Box::new(DisabledSource::new(label, e.to_string()))
        }
    }
}

// ==============================================================
// OS SELECTION FACTORY
// ==============================================================

#[cfg(target_os = "windows")]
mod smtc;
#[cfg(target_os = "windows")]
pub type PlatformBackend = smtc::SmtcBackend;

#[cfg(target_os = "linux")]
mod mpris;
#[cfg(target_os = "linux")]
pub type PlatformBackend = mpris::MprisBackend;

#[cfg(target_os = "macos")]
mod music_app;
#[cfg(target_os = "macos")]
pub type PlatformBackend = music_app::MusicAppBackend;

#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
mod unsupported;
#[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
pub type PlatformBackend = unsupported::UnsupportedBackend;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Canned {
        name: String,
        answer: Option<TrackSnapshot>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl PlayerSource for Canned {
        fn name(&self) -> &str {
            &self.name
        }
        fn query(&mut self) -> Option<TrackSnapshot> {
            self.calls.lock().unwrap().push(self.name.clone());
            self.answer.clone()
        }
        fn release(&mut self) {}
    }

    fn canned(name: &str, answer: Option<TrackSnapshot>, calls: &Arc<Mutex<Vec<String>>>) -> Box<dyn PlayerSource> {
        Box::new(Canned { name: name.into(), answer, calls: calls.clone() })
    }

    #[test]
    fn test_primary_answer_skips_secondary() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut sources = vec![
            canned("primary", Some(TrackSnapshot::new("A", "X", "Y")), &calls),
            canned("secondary", Some(TrackSnapshot::new("B", "Z", "W")), &calls),
        ];

        let result = query_in_order(&mut sources).unwrap();
        assert_eq!(result.title, "A");
        assert_eq!(*calls.lock().unwrap(), vec!["primary"]);
    }

    #[test]
    fn test_falls_through_to_secondary() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut sources = vec![
            canned("primary", None, &calls),
            canned("secondary", Some(TrackSnapshot::new("B", "Z", "W")), &calls),
        ];

        assert_eq!(query_in_order(&mut sources).unwrap().title, "B");
        assert_eq!(*calls.lock().unwrap(), vec!["primary", "secondary"]);

        let mut nothing: Vec<Box<dyn PlayerSource>> = vec![canned("primary", None, &calls)];
        assert!(query_in_order(&mut nothing).is_none());
        assert!(query_in_order(&mut []).is_none());
    }

    #[test]
    fn test_build_skips_disabled_and_blank_targets() {
        let mut off = SourceConfig::new(SourceRole::Secondary, PlayerTarget::AnyActive);
        off.enabled = false;
        let configs = vec![
            SourceConfig::new(SourceRole::Primary, PlayerTarget::App("  ".into())),
            off,
        ];

        let mut sources = build_sources(&configs, Duration::from_secs(1));
        assert_eq!(sources.len(), 1);
        // A blank target is degraded to a permanently empty source
        assert!(sources[0].query().is_none());
        sources[0].release();
    }

    #[test]
    fn test_source_config_json_shape() {
        let config = SourceConfig::new(SourceRole::Primary, PlayerTarget::App("iTunes".into()));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"role":"primary","target":{"app":"iTunes"},"enabled":true}"#);

        let parsed: SourceConfig =
            serde_json::from_str(r#"{"role":"secondary","target":"any_active"}"#).unwrap();
        assert_eq!(parsed.role, SourceRole::Secondary);
        assert_eq!(parsed.target, PlayerTarget::AnyActive);
        assert!(parsed.enabled);
    }
}
