use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::presence::PresenceSink;
use crate::source::{query_in_order, release_all, PlayerSource};
use crate::track::{observation_changed, TrackSnapshot};

/// Receives one call per detected transition, never for a tick that saw the
/// same track again. Called from the monitor's worker thread.
pub trait TrackListener: Send {
    fn on_track_change(&mut self, track: Option<&TrackSnapshot>);
}

impl<F> TrackListener for F
where
    F: FnMut(Option<&TrackSnapshot>) + Send,
{
    fn on_track_change(&mut self, track: Option<&TrackSnapshot>) {
        self(track)
    }
}

/// Forwards changes to another thread (a UI loop, the console renderer).
impl TrackListener for Sender<Option<TrackSnapshot>> {
    fn on_track_change(&mut self, track: Option<&TrackSnapshot>) {
        if self.send(track.cloned()).is_err() {
            tracing::debug!("[Monitor] Listener channel closed, change dropped");
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Same observation as last tick, nothing was sent
    Unchanged,
    /// Nothing playing -> a track
    Started,
    /// One track -> a different track
    Changed,
    /// A track -> nothing playing
    Stopped,
}

#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

// ============================================================================
// POLLER: one serialized poll -> diff -> notify step
// ============================================================================

/// The single-threaded half of the monitor. Owns the sources for one run and
/// the last observation; every mutation of that observation happens in
/// [`tick`](Poller::tick).
pub struct Poller {
    sources: Vec<Box<dyn PlayerSource>>,
    sink: Box<dyn PresenceSink>,
    listener: Box<dyn TrackListener>,
    last: Option<TrackSnapshot>,
    /// Copy of `last` for readers on other threads
    shared: Arc<Mutex<Option<TrackSnapshot>>>,
}

impl Poller {
    pub fn new(
        sources: Vec<Box<dyn PlayerSource>>,
        sink: Box<dyn PresenceSink>,
        listener: Box<dyn TrackListener>,
    ) -> Self {
        Self::with_shared(sources, sink, listener, Arc::new(Mutex::new(None)))
    }

    fn with_shared(
        sources: Vec<Box<dyn PlayerSource>>,
        sink: Box<dyn PresenceSink>,
        listener: Box<dyn TrackListener>,
        shared: Arc<Mutex<Option<TrackSnapshot>>>,
    ) -> Self {
        Self {
            sources,
            sink,
            listener,
            last: None,
            shared,
        }
    }

    pub fn last(&self) -> Option<&TrackSnapshot> {
        self.last.as_ref()
    }

    pub fn tick(&mut self) -> TickOutcome {
        let current = self.observe();
        if !observation_changed(self.last.as_ref(), current.as_ref()) {
            return TickOutcome::Unchanged;
        }

        let outcome = match (&self.last, &current) {
            (None, Some(_)) => TickOutcome::Started,
            (Some(_), Some(_)) => TickOutcome::Changed,
            (_, None) => TickOutcome::Stopped,
        };
        match &current {
            Some(track) => tracing::info!("[Monitor] Now playing: {}", track),
            None => tracing::info!("[Monitor] Nothing playing"),
        }

        self.last = current;
        *lock(&self.shared) = self.last.clone();
        self.publish();
        outcome
    }

    /// Clears presence, then releases every source. Consumes the poller so no
    /// tick can follow.
    pub fn finish(mut self) -> (Box<dyn PresenceSink>, Box<dyn TrackListener>) {
        let sink = &mut self.sink;
        match panic::catch_unwind(AssertUnwindSafe(|| sink.clear())) {
            Ok(Err(e)) => tracing::warn!("[Monitor] Could not clear presence: {}", e),
            Err(payload) => tracing::error!("[Monitor] Presence clear panicked: {}", panic_message(&*payload)),
            Ok(Ok(())) => {}
        }

        let sources = &mut self.sources;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| release_all(sources))) {
            tracing::error!("[Monitor] Source release panicked: {}", panic_message(&*payload));
        }

        self.last = None;
        *lock(&self.shared) = None;
        (self.sink, self.listener)
    }

    fn observe(&mut self) -> Option<TrackSnapshot> {
        let sources = &mut self.sources;
        match panic::catch_unwind(AssertUnwindSafe(|| query_in_order(sources))) {
            Ok(found) => found,
            Err(payload) => {
                tracing::error!("[Monitor] Player query panicked: {}", panic_message(&*payload));
                None
            }
        }
    }

    fn publish(&mut self) {
        let last = self.last.as_ref();

        let sink = &mut self.sink;
        let pushed = panic::catch_unwind(AssertUnwindSafe(|| match last {
            Some(track) => sink.update(track),
            None => sink.clear(),
        }));
        match pushed {
            Ok(Err(e)) => tracing::warn!("[Monitor] Presence update failed: {}", e),
            Err(payload) => tracing::error!("[Monitor] Presence sink panicked: {}", panic_message(&*payload)),
            Ok(Ok(())) => {}
        }

        let listener = &mut self.listener;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener.on_track_change(last))) {
            tracing::error!("[Monitor] Track listener panicked: {}", panic_message(&*payload));
        }
    }
}

// ============================================================================
// TRACK MONITOR: start / stop around a background worker
// ============================================================================

/// What survives between runs of the worker thread.
struct Parts {
    sink: Box<dyn PresenceSink>,
    listener: Box<dyn TrackListener>,
    sink_initialized: bool,
}

enum Worker {
    /// `None` only if a worker thread died and took the parts with it
    Idle(Option<Parts>),
    Running {
        handle: JoinHandle<Parts>,
        stop_tx: Sender<()>,
    },
}

type SourceFactory = Arc<dyn Fn() -> Vec<Box<dyn PlayerSource>> + Send + Sync>;

/// Polls player sources on a background thread and keeps the presence sink
/// and listener in sync with what is playing.
///
/// Sources are built by `source_factory` on the worker thread each time the
/// monitor starts and released when it stops.
pub struct TrackMonitor {
    settings: MonitorSettings,
    source_factory: SourceFactory,
    running: AtomicBool,
    worker: Mutex<Worker>,
    current: Arc<Mutex<Option<TrackSnapshot>>>,
}

impl TrackMonitor {
    pub fn new<F>(
        settings: MonitorSettings,
        source_factory: F,
        sink: Box<dyn PresenceSink>,
        listener: Box<dyn TrackListener>,
    ) -> Self
    where
        F: Fn() -> Vec<Box<dyn PlayerSource>> + Send + Sync + 'static,
    {
        Self {
            settings,
            source_factory: Arc::new(source_factory),
            running: AtomicBool::new(false),
            worker: Mutex::new(Worker::Idle(Some(Parts {
                sink,
                listener,
                sink_initialized: false,
            }))),
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Last observed track, `None` when nothing is playing or the monitor is stopped.
    pub fn current(&self) -> Option<TrackSnapshot> {
        lock(&self.current).clone()
    }

    /// Starts polling. No-op when already running.
    pub fn start(&self) {
        let mut worker = lock(&self.worker);
        if self.running.load(Ordering::SeqCst) {
            return;
        }

        let parts = match std::mem::replace(&mut *worker, Worker::Idle(None)) {
            Worker::Idle(Some(parts)) => parts,
            other => {
                *worker = other;
                tracing::error!("[Monitor] Cannot start: presence sink and listener were lost");
                return;
            }
        };

        let (stop_tx, stop_rx) = bounded(1);
        let factory = Arc::clone(&self.source_factory);
        let current = Arc::clone(&self.current);
        let interval = self.settings.poll_interval;

        let spawned = thread::Builder::new()
            .name("track-monitor".into())
            .spawn(move || run_worker(factory, parts, current, interval, stop_rx));

        match spawned {
            Ok(handle) => {
                *worker = Worker::Running { handle, stop_tx };
                self.running.store(true, Ordering::SeqCst);
            }
            Err(e) => tracing::error!("[Monitor] Could not spawn worker thread: {}", e),
        }
    }

    /// Stops polling and waits for the in-flight tick. Presence is cleared
    /// before the sources are released. No-op when not running.
    pub fn stop(&self) {
        let mut worker = lock(&self.worker);
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Worker::Running { handle, stop_tx } = std::mem::replace(&mut *worker, Worker::Idle(None)) {
            let _ = stop_tx.send(());
            match handle.join() {
                Ok(parts) => *worker = Worker::Idle(Some(parts)),
                Err(_) => tracing::error!("[Monitor] Worker thread panicked"),
            }
        }
        *lock(&self.current) = None;
    }

    /// Stops, then shuts the presence sink down for good.
    pub fn shutdown(self) {
        self.stop();

        let mut worker = lock(&self.worker);
        if let Worker::Idle(Some(parts)) = &mut *worker {
            if let Err(e) = parts.sink.shutdown() {
                tracing::warn!("[Monitor] Presence shutdown failed: {}", e);
            }
        }
        *worker = Worker::Idle(None);
    }
}

impl Drop for TrackMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    factory: SourceFactory,
    parts: Parts,
    current: Arc<Mutex<Option<TrackSnapshot>>>,
    interval: Duration,
    stop_rx: Receiver<()>,
) -> Parts {
    let Parts {
        mut sink,
        listener,
        sink_initialized,
    } = parts;

    if !sink_initialized {
        match panic::catch_unwind(AssertUnwindSafe(|| sink.initialize())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("[Monitor] Presence unavailable: {}", e),
            Err(payload) => tracing::error!("[Monitor] Presence init panicked: {}", panic_message(&*payload)),
        }
    }

    let sources = match panic::catch_unwind(AssertUnwindSafe(|| factory())) {
        Ok(sources) => sources,
        Err(payload) => {
            tracing::error!("[Monitor] Building sources panicked: {}", panic_message(&*payload));
            Vec::new()
        }
    };
    let names: Vec<&str> = sources.iter().map(|s| s.name()).collect();
    tracing::info!("[Monitor] Started, polling every {:?}: [{}]", interval, names.join(", "));

    let mut poller = Poller::with_shared(sources, sink, listener, current);
    loop {
        poller.tick();
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let (sink, listener) = poller.finish();
    tracing::info!("[Monitor] Stopped");
    Parts {
        sink,
        listener,
        sink_initialized: true,
    }
}
