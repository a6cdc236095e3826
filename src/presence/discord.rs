use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::ipc::{self, IpcStream, Opcode};
use super::{PresenceError, PresenceSink};
use crate::track::TrackSnapshot;

/// Discord rejects shorter strings in activity text fields
const MIN_TEXT_CHARS: usize = 2;
const MAX_TEXT_CHARS: usize = 128;

/// Minimum wait between reconnect attempts after a mid-session loss
const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Longest a caller waits on the connection thread
const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// Frames skipped while waiting for the reply to our own command
const MAX_UNRELATED_FRAMES: usize = 8;

/// Activity type "Listening to"
const ACTIVITY_LISTENING: u8 = 2;

const SMALL_IMAGE_KEY: &str = "play_icon";

/// Large image used when the track comes from Apple's players
const APPLE_MUSIC_IMAGE_KEY: &str = "apple_music_logo";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    pub enabled: bool,
    /// Discord application id
    pub client_id: String,
    /// Asset key uploaded to the Discord application
    pub large_image_key: String,
    /// Show elapsed / remaining time
    pub show_timestamps: bool,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            client_id: "1369005012486852649".to_string(),
            large_image_key: "itunes_logo".to_string(),
            show_timestamps: true,
        }
    }
}

/// Opens a raw stream to the Discord client.
pub type Connector = Box<dyn Fn() -> Result<Box<dyn IpcStream>, PresenceError> + Send>;

// ============================================================================
// ACTIVITY PAYLOAD
// ============================================================================

#[derive(Clone, Debug, Serialize)]
struct Activity {
    details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(rename = "type")]
    kind: u8,
    assets: Assets,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamps: Option<Timestamps>,
}

#[derive(Clone, Debug, Serialize)]
struct Assets {
    large_image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    large_text: Option<String>,
    small_image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    small_text: Option<String>,
}

/// Unix milliseconds
#[derive(Clone, Debug, Serialize)]
struct Timestamps {
    start: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<u64>,
}

/// Clips to the field limit and pads to the minimum Discord accepts.
fn fit_text(text: &str) -> String {
    let mut out: String = if text.chars().count() > MAX_TEXT_CHARS {
        let mut clipped: String = text.chars().take(MAX_TEXT_CHARS - 3).collect();
        clipped.push_str("...");
        clipped
    } else {
        text.to_string()
    };

    while out.chars().count() < MIN_TEXT_CHARS {
        out.push('\u{2800}');
    }
    out
}

fn optional_text(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(fit_text(text))
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn large_image_for(track: &TrackSnapshot, settings: &PresenceSettings) -> String {
    if track.source_app.to_ascii_lowercase().contains("apple") {
        APPLE_MUSIC_IMAGE_KEY.to_string()
    } else {
        settings.large_image_key.clone()
    }
}

/// `now_ms` is when the snapshot was taken; the start is backdated by the
/// player position so Discord shows the real elapsed time.
fn build_activity(track: &TrackSnapshot, settings: &PresenceSettings, now_ms: u64) -> Activity {
    let timestamps = settings.show_timestamps.then(|| {
        let start = now_ms.saturating_sub(track.elapsed_secs() * 1000);
        Timestamps {
            start,
            end: (track.duration_secs > 0).then(|| start + track.duration_secs * 1000),
        }
    });

    Activity {
        details: fit_text(&track.title),
        state: optional_text(&track.artist).map(|artist| fit_text(&format!("by {}", artist))),
        kind: ACTIVITY_LISTENING,
        assets: Assets {
            large_image: large_image_for(track, settings),
            large_text: optional_text(&track.album),
            small_image: SMALL_IMAGE_KEY.to_string(),
            small_text: optional_text(&track.source_app).map(|app| fit_text(&format!("Via {}", app))),
        },
        timestamps,
    }
}

// ============================================================================
// CONNECTION THREAD: owns the socket, reconnects on its own timer
// ============================================================================

type Reply = Sender<Result<(), PresenceError>>;

enum Command {
    /// `None` clears the activity
    Show(Option<Activity>, Reply),
    Shutdown(Reply),
}

enum Link {
    Connected(Box<dyn IpcStream>),
    Lost { since: Instant },
}

/// Connects and performs the handshake.
fn open(connector: &Connector, client_id: &str) -> Result<Box<dyn IpcStream>, PresenceError> {
    let mut stream = connector()?;
    let hello = json!({ "v": 1, "client_id": client_id });
    ipc::write_frame(stream.as_mut(), Opcode::Handshake, &hello)?;

    let (op, reply) = ipc::read_frame(stream.as_mut())?;
    match op {
        Opcode::Frame if reply["evt"] == "READY" => {
            let user = reply["data"]["user"]["username"].as_str().unwrap_or("?");
            tracing::info!("[Presence/Discord] Ready (user: {})", user);
            Ok(stream)
        }
        Opcode::Close => Err(PresenceError::Rejected(
            reply["message"].as_str().unwrap_or("handshake refused").to_string(),
        )),
        _ => Err(PresenceError::Protocol(format!("unexpected handshake reply: {:?}", op))),
    }
}

/// Sends one command frame and waits for its reply, answering pings on the way.
fn exchange(stream: &mut dyn IpcStream, payload: &Value) -> Result<(), PresenceError> {
    ipc::write_frame(stream, Opcode::Frame, payload)?;

    for _ in 0..MAX_UNRELATED_FRAMES {
        let (op, reply) = ipc::read_frame(stream)?;
        match op {
            Opcode::Frame => {
                if reply["evt"] == "ERROR" {
                    let message = reply["data"]["message"].as_str().unwrap_or("unknown error");
                    return Err(PresenceError::Rejected(message.to_string()));
                }
                if reply["nonce"] == payload["nonce"] {
                    return Ok(());
                }
            }
            Opcode::Ping => ipc::write_frame(stream, Opcode::Pong, &reply)?,
            Opcode::Close => {
                let message = reply["message"].as_str().unwrap_or("closed by peer");
                return Err(PresenceError::Protocol(message.to_string()));
            }
            Opcode::Handshake | Opcode::Pong => {}
        }
    }
    Err(PresenceError::Protocol("no reply to SET_ACTIVITY".into()))
}

struct Connection {
    client_id: String,
    connector: Connector,
    link: Link,
    nonce: u64,
    reconnect_interval: Duration,
    /// What Discord should be showing; kept across reconnects
    desired: Option<Activity>,
    connected: Arc<AtomicBool>,
}

impl Connection {
    fn run(mut self, commands: Receiver<Command>) {
        loop {
            let wait = self.until_reconnect().unwrap_or(self.reconnect_interval);
            let next = commands.recv_timeout(wait);

            match next {
                Ok(Command::Show(activity, reply)) => {
                    let _ = reply.send(self.show(activity));
                }
                Ok(Command::Shutdown(reply)) => {
                    let _ = reply.send(self.close());
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = self.refresh() {
                        tracing::debug!("[Presence/Discord] Refresh failed: {}", e);
                    }
                }
                // Sink dropped without shutdown: closing the socket is enough
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        tracing::debug!("[Presence/Discord] Connection thread finished");
    }

    /// `None` while connected; otherwise the wait before the next attempt.
    fn until_reconnect(&self) -> Option<Duration> {
        match &self.link {
            Link::Connected(_) => None,
            Link::Lost { since } => Some(self.reconnect_interval.saturating_sub(since.elapsed())),
        }
    }

    fn show(&mut self, activity: Option<Activity>) -> Result<(), PresenceError> {
        self.desired = activity;
        match self.until_reconnect() {
            None => self.send_desired(),
            Some(wait) if wait.is_zero() => self.reconnect(),
            Some(_) => {
                tracing::debug!("[Presence/Discord] Link lost, update kept for the next reconnect");
                Ok(())
            }
        }
    }

    /// Timer tick: reconnects a lost link, or sends the stored activity
    /// again so a Discord restart is noticed while the same track plays.
    fn refresh(&mut self) -> Result<(), PresenceError> {
        if matches!(self.link, Link::Lost { .. }) {
            self.reconnect()
        } else if self.desired.is_some() {
            self.send_desired()
        } else {
            Ok(())
        }
    }

    /// Opens a new link and shows the stored activity on it.
    fn reconnect(&mut self) -> Result<(), PresenceError> {
        let stream = match open(&self.connector, &self.client_id) {
            Ok(stream) => stream,
            Err(e) => {
                self.link = Link::Lost { since: Instant::now() };
                return Err(e);
            }
        };

        tracing::info!("[Presence/Discord] Reconnected");
        self.link = Link::Connected(stream);
        self.connected.store(true, Ordering::SeqCst);
        if self.desired.is_some() {
            self.send_desired()
        } else {
            Ok(())
        }
    }

    fn send_desired(&mut self) -> Result<(), PresenceError> {
        self.nonce += 1;
        let payload = json!({
            "cmd": "SET_ACTIVITY",
            "args": { "pid": std::process::id(), "activity": self.desired },
            "nonce": self.nonce.to_string(),
        });

        let Link::Connected(stream) = &mut self.link else {
            return Ok(());
        };
        let result = exchange(stream.as_mut(), &payload);
        if let Err(e) = &result {
            if matches!(e, PresenceError::Io(_) | PresenceError::Protocol(_)) {
                tracing::warn!("[Presence/Discord] Connection lost: {}", e);
                self.link = Link::Lost { since: Instant::now() };
                self.connected.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    /// Clears the activity, then sends Close.
    fn close(&mut self) -> Result<(), PresenceError> {
        self.desired = None;
        let result = self.send_desired();
        if let Link::Connected(stream) = &mut self.link {
            let _ = ipc::write_frame(stream.as_mut(), Opcode::Close, &json!({}));
            tracing::info!("[Presence/Discord] Closed");
        }
        self.link = Link::Lost { since: Instant::now() };
        result
    }
}

// ============================================================================
// SINK
// ============================================================================

/// Rich presence over Discord's local RPC socket.
///
/// The socket lives on a connection thread started by `initialize`. Calls
/// from the monitor wait at most the reply timeout, so a Discord client that
/// stops answering cannot hold up a tick or a stop. A lost link is retried
/// every reconnect interval and the last requested activity is sent again
/// once it is back. While connected, the same interval resends the activity.
pub struct DiscordSink {
    settings: PresenceSettings,
    /// Taken by `initialize`
    connector: Option<Connector>,
    /// `None` before initialize, after a failed initialize and after shutdown
    commands: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    reconnect_interval: Duration,
    reply_timeout: Duration,
}

impl DiscordSink {
    pub fn new(settings: PresenceSettings) -> Self {
        Self::with_connector(settings, Box::new(ipc::connect))
    }

    pub fn with_connector(settings: PresenceSettings, connector: Connector) -> Self {
        Self {
            settings,
            connector: Some(connector),
            commands: None,
            worker: None,
            connected: Arc::new(AtomicBool::new(false)),
            reconnect_interval: RECONNECT_INTERVAL,
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Hands a command to the connection thread and waits for its answer.
    /// Inert sinks answer `Ok(())` without doing anything.
    fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<(), PresenceError> {
        let Some(commands) = &self.commands else {
            return Ok(());
        };

        let (reply_tx, reply_rx) = bounded(1);
        if commands.send(command(reply_tx)).is_err() {
            return Ok(());
        }
        match reply_rx.recv_timeout(self.reply_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PresenceError::Timeout(self.reply_timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(PresenceError::Protocol("connection thread stopped".into()))
            }
        }
    }
}

impl PresenceSink for DiscordSink {
    fn initialize(&mut self) -> Result<(), PresenceError> {
        let Some(connector) = self.connector.take() else {
            return Ok(());
        };

        let (ready_tx, ready_rx) = bounded(1);
        let (command_tx, command_rx) = unbounded();
        let client_id = self.settings.client_id.clone();
        let connected = self.connected.clone();
        let reconnect_interval = self.reconnect_interval;

        let spawned = thread::Builder::new().name("discord-rpc".into()).spawn(move || {
            let stream = match open(&connector, &client_id) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            connected.store(true, Ordering::SeqCst);
            let _ = ready_tx.send(Ok(()));

            Connection {
                client_id,
                connector,
                link: Link::Connected(stream),
                nonce: 0,
                reconnect_interval,
                desired: None,
                connected,
            }
            .run(command_rx);
        });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("[Presence/Discord] Could not start connection thread: {}", e);
                return Err(PresenceError::Io(e));
            }
        };

        match ready_rx.recv_timeout(self.reply_timeout) {
            Ok(Ok(())) => {
                self.commands = Some(command_tx);
                self.worker = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!("[Presence/Discord] Unavailable for this session: {}", e);
                let _ = handle.join();
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                // Keep the thread: if the handshake completes later, updates go through
                tracing::warn!("[Presence/Discord] Handshake still pending after {:?}", self.reply_timeout);
                self.commands = Some(command_tx);
                self.worker = Some(handle);
                Err(PresenceError::Timeout(self.reply_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("[Presence/Discord] Connection thread exited during handshake");
                Err(PresenceError::Protocol("connection thread stopped".into()))
            }
        }
    }

    fn update(&mut self, track: &TrackSnapshot) -> Result<(), PresenceError> {
        let activity = build_activity(track, &self.settings, unix_millis());
        self.request(|reply| Command::Show(Some(activity), reply))
    }

    fn clear(&mut self) -> Result<(), PresenceError> {
        self.request(|reply| Command::Show(None, reply))
    }

    fn shutdown(&mut self) -> Result<(), PresenceError> {
        let result = self.request(Command::Shutdown);
        self.commands = None;
        if let Some(handle) = self.worker.take() {
            if matches!(result, Err(PresenceError::Timeout(_))) {
                // Stuck on the socket; it exits once the queued shutdown is read
                tracing::warn!("[Presence/Discord] Connection thread did not answer, leaving it behind");
            } else {
                let _ = handle.join();
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{Poller, TickOutcome};
    use crate::source::PlayerSource;
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// In-memory Discord client: records frames we send, queues its replies.
    #[derive(Default)]
    struct FakeDiscord {
        received: Vec<(Opcode, Value)>,
        pending: Vec<u8>,
        replies: VecDeque<u8>,
        reject_next: bool,
        broken: bool,
        /// Reads block until cleared
        stalled: bool,
    }

    impl FakeDiscord {
        fn respond(&mut self, op: Opcode, payload: &Value) {
            let mut frame = Vec::new();
            ipc::write_frame(&mut frame, op, payload).unwrap();
            self.replies.extend(frame);
        }

        fn handle(&mut self, op: Opcode, payload: Value) {
            match op {
                Opcode::Handshake => self.respond(
                    Opcode::Frame,
                    &json!({"cmd": "DISPATCH", "evt": "READY", "data": {"user": {"username": "tester"}}}),
                ),
                Opcode::Frame if self.reject_next => {
                    self.reject_next = false;
                    let nonce = payload["nonce"].clone();
                    self.respond(
                        Opcode::Frame,
                        &json!({"cmd": "SET_ACTIVITY", "evt": "ERROR", "data": {"message": "bad activity"}, "nonce": nonce}),
                    );
                }
                Opcode::Frame => {
                    let nonce = payload["nonce"].clone();
                    self.respond(Opcode::Frame, &json!({"cmd": "SET_ACTIVITY", "evt": null, "data": {}, "nonce": nonce}));
                }
                _ => {}
            }
            self.received.push((op, payload));
        }
    }

    struct FakeStream(Arc<Mutex<FakeDiscord>>);

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut fake = self.0.lock().unwrap();
            if fake.broken {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
            }
            fake.pending.extend_from_slice(buf);

            while fake.pending.len() >= 8 {
                let len = u32::from_le_bytes([fake.pending[4], fake.pending[5], fake.pending[6], fake.pending[7]]) as usize;
                if fake.pending.len() < 8 + len {
                    break;
                }
                let frame: Vec<u8> = fake.pending.drain(..8 + len).collect();
                let (op, payload) = ipc::read_frame(&mut frame.as_slice()).unwrap();
                fake.handle(op, payload);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            while self.0.lock().unwrap().stalled {
                thread::sleep(Duration::from_millis(5));
            }
            let mut fake = self.0.lock().unwrap();
            if fake.broken {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            let n = buf.len().min(fake.replies.len());
            for (slot, byte) in buf.iter_mut().zip(fake.replies.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    fn fake_sink() -> (DiscordSink, Arc<Mutex<FakeDiscord>>, Arc<AtomicUsize>) {
        let fake = Arc::new(Mutex::new(FakeDiscord::default()));
        let connects = Arc::new(AtomicUsize::new(0));
        let (f, c) = (fake.clone(), connects.clone());
        let sink = DiscordSink::with_connector(
            PresenceSettings::default(),
            Box::new(move || -> Result<Box<dyn IpcStream>, PresenceError> {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(FakeStream(f.clone())))
            }),
        );
        (sink, fake, connects)
    }

    fn song_a() -> TrackSnapshot {
        TrackSnapshot::new("Song A", "Artist X", "Album Y")
            .with_track_number(1, 12)
            .with_duration_secs(180)
            .with_source("iTunes")
    }

    fn song_b() -> TrackSnapshot {
        TrackSnapshot::new("Song B", "Artist X", "Album Y")
            .with_track_number(2, 12)
            .with_duration_secs(200)
            .with_source("iTunes")
    }

    fn activities(fake: &Arc<Mutex<FakeDiscord>>) -> Vec<Value> {
        fake.lock()
            .unwrap()
            .received
            .iter()
            .filter(|(op, _)| *op == Opcode::Frame)
            .map(|(_, payload)| payload["args"]["activity"].clone())
            .collect()
    }

    fn last_details(fake: &Arc<Mutex<FakeDiscord>>) -> Value {
        activities(fake).last().map(|a| a["details"].clone()).unwrap_or(Value::Null)
    }

    /// Polls `condition` for up to two seconds.
    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_handshake_and_update() {
        let (mut sink, fake, _) = fake_sink();
        sink.initialize().unwrap();
        assert!(sink.is_connected());

        {
            let fake = fake.lock().unwrap();
            let (op, hello) = &fake.received[0];
            assert_eq!(*op, Opcode::Handshake);
            assert_eq!(hello["v"], 1);
            assert_eq!(hello["client_id"], "1369005012486852649");
        }

        sink.update(&song_a()).unwrap();
        let sent = activities(&fake);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["details"], "Song A");
        assert_eq!(sent[0]["state"], "by Artist X");
        assert_eq!(sent[0]["type"], 2);
        assert_eq!(sent[0]["assets"]["large_image"], "itunes_logo");
        assert_eq!(sent[0]["assets"]["large_text"], "Album Y");
        assert_eq!(sent[0]["assets"]["small_text"], "Via iTunes");

        let start = sent[0]["timestamps"]["start"].as_u64().unwrap();
        let end = sent[0]["timestamps"]["end"].as_u64().unwrap();
        assert_eq!(end - start, 180_000);
    }

    #[test]
    fn test_clear_sends_null_activity() {
        let (mut sink, fake, _) = fake_sink();
        sink.initialize().unwrap();
        sink.clear().unwrap();
        assert_eq!(activities(&fake), vec![Value::Null]);
    }

    #[test]
    fn test_init_failure_leaves_sink_inert() {
        let connects = Arc::new(AtomicUsize::new(0));
        let c = connects.clone();
        let mut sink = DiscordSink::with_connector(
            PresenceSettings::default(),
            Box::new(move || -> Result<Box<dyn IpcStream>, PresenceError> {
                c.fetch_add(1, Ordering::SeqCst);
                Err(PresenceError::NotFound(10))
            }),
        )
        .with_reconnect_interval(Duration::ZERO);

        assert!(matches!(sink.initialize(), Err(PresenceError::NotFound(10))));
        assert!(!sink.is_connected());
        assert!(sink.update(&song_a()).is_ok());
        assert!(sink.clear().is_ok());
        assert!(sink.shutdown().is_ok());
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_clears_then_closes() {
        let (mut sink, fake, _) = fake_sink();
        sink.initialize().unwrap();
        sink.update(&song_a()).unwrap();
        sink.shutdown().unwrap();

        {
            let fake = fake.lock().unwrap();
            let ops: Vec<Opcode> = fake.received.iter().map(|(op, _)| *op).collect();
            assert_eq!(ops, vec![Opcode::Handshake, Opcode::Frame, Opcode::Frame, Opcode::Close]);
            assert_eq!(fake.received[2].1["args"]["activity"], Value::Null);
        }

        // Inert afterwards
        assert!(!sink.is_connected());
        sink.update(&song_a()).unwrap();
        assert_eq!(activities(&fake).len(), 2);
    }

    #[test]
    fn test_rejection_keeps_connection() {
        let (mut sink, fake, _) = fake_sink();
        sink.initialize().unwrap();

        fake.lock().unwrap().reject_next = true;
        assert!(matches!(sink.update(&song_a()), Err(PresenceError::Rejected(m)) if m == "bad activity"));
        assert!(sink.is_connected());
        assert!(sink.update(&song_a()).is_ok());
    }

    #[test]
    fn test_lost_link_reconnects_and_resends_on_its_own() {
        let (sink, fake, connects) = fake_sink();
        let mut sink = sink.with_reconnect_interval(Duration::from_millis(20));
        sink.initialize().unwrap();
        sink.update(&song_a()).unwrap();

        fake.lock().unwrap().broken = true;
        assert!(matches!(sink.update(&song_b()), Err(PresenceError::Io(_))));
        assert!(!sink.is_connected());

        // No further calls: the connection thread brings Song B back by itself
        fake.lock().unwrap().broken = false;
        assert!(wait_until(|| last_details(&fake) == "Song B"));
        assert!(sink.is_connected());
        assert!(connects.load(Ordering::SeqCst) >= 2);

        let handshakes = fake.lock().unwrap().received.iter().filter(|(op, _)| *op == Opcode::Handshake).count();
        assert_eq!(handshakes, 2);
        sink.shutdown().unwrap();
    }

    #[test]
    fn test_idle_link_resends_activity_on_timer() {
        let (sink, fake, _) = fake_sink();
        let mut sink = sink.with_reconnect_interval(Duration::from_millis(20));
        sink.initialize().unwrap();
        sink.update(&song_a()).unwrap();

        assert!(wait_until(|| activities(&fake).len() >= 3));
        assert!(activities(&fake).iter().all(|a| a["details"] == "Song A"));

        // Nothing is repeated once cleared
        sink.clear().unwrap();
        let cleared = activities(&fake).len();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(activities(&fake).len(), cleared);
        sink.shutdown().unwrap();
    }

    #[test]
    fn test_lost_link_waits_for_interval() {
        let (mut sink, fake, connects) = fake_sink();
        sink.initialize().unwrap();

        fake.lock().unwrap().broken = true;
        assert!(sink.update(&song_a()).is_err());
        fake.lock().unwrap().broken = false;

        // Within the 30 s window nothing is attempted
        assert!(sink.update(&song_a()).is_ok());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert!(!sink.is_connected());
    }

    #[test]
    fn test_unanswered_update_times_out() {
        let (sink, fake, _) = fake_sink();
        let mut sink = sink.with_reply_timeout(Duration::from_millis(50));
        sink.initialize().unwrap();

        fake.lock().unwrap().stalled = true;
        let started = Instant::now();
        assert!(matches!(sink.update(&song_a()), Err(PresenceError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(1));

        // Clear also returns promptly while the thread is stuck
        assert!(matches!(sink.clear(), Err(PresenceError::Timeout(_))));

        fake.lock().unwrap().stalled = false;
        let _ = sink.shutdown();
    }

    /// Reports whatever the test put in `playing`.
    struct SharedSource {
        playing: Arc<Mutex<Option<TrackSnapshot>>>,
    }

    impl PlayerSource for SharedSource {
        fn name(&self) -> &str {
            "shared"
        }

        fn query(&mut self) -> Option<TrackSnapshot> {
            self.playing.lock().unwrap().clone()
        }

        fn release(&mut self) {}
    }

    #[test]
    fn test_presence_recovers_while_same_track_plays() {
        let (sink, fake, connects) = fake_sink();
        let mut sink = sink.with_reconnect_interval(Duration::from_millis(20));
        sink.initialize().unwrap();

        let playing = Arc::new(Mutex::new(Some(song_a())));
        let sources: Vec<Box<dyn PlayerSource>> = vec![Box::new(SharedSource { playing: playing.clone() })];
        let mut poller = Poller::new(
            sources,
            Box::new(sink),
            Box::new(|_: Option<&TrackSnapshot>| {}),
        );

        assert_eq!(poller.tick(), TickOutcome::Started);
        assert_eq!(last_details(&fake), "Song A");

        // Discord goes away just as the track changes
        fake.lock().unwrap().broken = true;
        *playing.lock().unwrap() = Some(song_b());
        assert_eq!(poller.tick(), TickOutcome::Changed);

        // Discord comes back while Song B keeps playing
        fake.lock().unwrap().broken = false;
        for _ in 0..20 {
            assert_eq!(poller.tick(), TickOutcome::Unchanged);
            thread::sleep(Duration::from_millis(5));
        }

        assert!(wait_until(|| last_details(&fake) == "Song B"));
        assert!(connects.load(Ordering::SeqCst) >= 2);

        let (mut sink, _) = poller.finish();
        assert_eq!(activities(&fake).last(), Some(&Value::Null));
        sink.shutdown().unwrap();
    }

    #[test]
    fn test_timestamps_backdate_by_position() {
        let settings = PresenceSettings::default();
        let track = song_a().with_position_secs(60);
        let value = serde_json::to_value(build_activity(&track, &settings, 1_000_000)).unwrap();
        assert_eq!(value["timestamps"]["start"], 940_000);
        assert_eq!(value["timestamps"]["end"], 1_120_000);

        // A position past the end is clamped to the duration
        let track = song_a().with_position_secs(500);
        let value = serde_json::to_value(build_activity(&track, &settings, 1_000_000)).unwrap();
        assert_eq!(value["timestamps"]["start"], 820_000);
        assert_eq!(value["timestamps"]["end"], 1_000_000);

        // Unknown duration: start only
        let track = TrackSnapshot::new("Stream", "", "").with_position_secs(30);
        let value = serde_json::to_value(build_activity(&track, &settings, 1_000_000)).unwrap();
        assert_eq!(value["timestamps"]["start"], 970_000);
        assert!(value["timestamps"].get("end").is_none());
    }

    #[test]
    fn test_apple_sources_use_apple_image() {
        let settings = PresenceSettings::default();
        for app in ["Apple Music", "APPLE MUSIC", "com.apple.Music"] {
            let activity = build_activity(&song_a().with_source(app), &settings, 0);
            assert_eq!(activity.assets.large_image, "apple_music_logo", "{}", app);
        }

        let activity = build_activity(&song_a(), &settings, 0);
        assert_eq!(activity.assets.large_image, "itunes_logo");
        let activity = build_activity(&song_a().with_source("Spotify"), &settings, 0);
        assert_eq!(activity.assets.large_image, "itunes_logo");
    }

    #[test]
    fn test_fit_text() {
        assert_eq!(fit_text("Song"), "Song");
        assert_eq!(fit_text("A").chars().count(), 2);

        let long = "x".repeat(200);
        let clipped = fit_text(&long);
        assert_eq!(clipped.chars().count(), 128);
        assert!(clipped.ends_with("..."));
    }

    #[test]
    fn test_activity_omits_empty_fields() {
        let mut settings = PresenceSettings::default();
        settings.show_timestamps = false;
        let track = TrackSnapshot::new("Untitled", "", "");
        let value = serde_json::to_value(build_activity(&track, &settings, 1_000)).unwrap();

        assert!(value.get("state").is_none());
        assert!(value.get("timestamps").is_none());
        assert!(value["assets"].get("large_text").is_none());
        assert!(value["assets"].get("small_text").is_none());
    }
}
