//! TuneSync: watches a local media player and mirrors the current track to
//! Discord rich presence.
//!
//! [`monitor::TrackMonitor`] polls the configured [`source::PlayerSource`]s
//! on a background thread, detects track changes by identity and drives a
//! [`presence::PresenceSink`] plus a listener.

pub mod config;
pub mod display;
pub mod logging;
pub mod monitor;
pub mod platform;
pub mod presence;
pub mod source;
pub mod track;
pub mod update_check;

pub use monitor::{MonitorSettings, Poller, TickOutcome, TrackListener, TrackMonitor};
pub use track::TrackSnapshot;
