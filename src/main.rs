use std::io::{self, BufRead, Write};
use std::thread;

use anyhow::Result;
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, Sender};

use tunesync::config::{AppConfig, ConfigPaths};
use tunesync::presence::{DiscordSink, NullSink, PresenceSink};
use tunesync::{display, logging, platform, source, update_check, TrackMonitor, TrackSnapshot};

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Info,
    Toggle,
    OpenUpdate,
    Quit,
    Empty,
    Unknown(String),
}

fn parse_command(line: &str) -> Command {
    match line.trim().to_ascii_lowercase().as_str() {
        "i" | "info" => Command::Info,
        "s" | "stop" | "start" => Command::Toggle,
        "u" | "update" => Command::OpenUpdate,
        "q" | "quit" | "exit" => Command::Quit,
        "" => Command::Empty,
        other => Command::Unknown(other.to_string()),
    }
}

enum Event {
    Track(Option<TrackSnapshot>),
    UpdateFound(String),
    UpdateChannelDone,
    Input(String),
    InputClosed,
    Quit,
}

fn print_help() {
    println!("========================================");
    println!("   TuneSync v{}", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!("Commands:");
    println!("  [i] info         Show current track info");
    println!("  [s] stop/start   Pause or resume monitoring");
    println!("  [u] update       Open the release page (when an update exists)");
    println!("  [q] quit         Exit");
    println!("----------------------------------------");
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

/// Forwards lines until the reader ends, fails, or the receiver is gone.
/// Returns how many lines were delivered.
fn forward_lines<R: BufRead>(reader: R, tx: &Sender<String>) -> usize {
    let mut sent = 0;
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if tx.send(line).is_err() {
                    break;
                }
                sent += 1;
            }
            Err(_) => break,
        }
    }
    sent
}

/// Lines typed on stdin. The channel closes when stdin does.
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    let spawned = thread::Builder::new().name("stdin".into()).spawn(move || {
        forward_lines(io::stdin().lock(), &tx);
    });
    if let Err(e) = spawned {
        tracing::warn!("[Main] Console input unavailable: {}", e);
    }
    rx
}

#[cfg(unix)]
fn spawn_signal_listener() -> Receiver<i32> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            tracing::warn!("[Main] Could not register signal handlers: {}", e);
            return never();
        }
    };

    let (tx, rx) = bounded(1);
    let spawned = thread::Builder::new().name("signals".into()).spawn(move || {
        for signal in signals.forever() {
            if tx.send(signal).is_err() {
                break;
            }
        }
    });
    match spawned {
        Ok(_) => rx,
        Err(e) => {
            tracing::warn!("[Main] Could not start signal thread: {}", e);
            never()
        }
    }
}

// Ctrl+C ends the process directly on other platforms
#[cfg(not(unix))]
fn spawn_signal_listener() -> Receiver<i32> {
    never()
}

/// Runs the update check in the background; sends the release page URL if
/// there is a newer version.
fn spawn_update_check(enabled: bool) -> Receiver<String> {
    let (tx, rx) = bounded(1);
    if !enabled {
        tracing::debug!("[Update] Disabled in settings");
        return rx;
    }

    let spawned = thread::Builder::new().name("update-check".into()).spawn(move || {
        match update_check::check_for_updates() {
            Ok(Some(url)) => {
                let _ = tx.send(url);
            }
            Ok(None) => tracing::info!("[Update] Up to date"),
            Err(e) => tracing::warn!("[Update] Check failed: {:#}", e),
        }
    });
    if let Err(e) = spawned {
        tracing::warn!("[Update] Could not start update check: {}", e);
    }
    rx
}

fn build_sink(config: &AppConfig) -> Box<dyn PresenceSink> {
    if config.presence.enabled {
        Box::new(DiscordSink::new(config.presence.clone()))
    } else {
        Box::new(NullSink)
    }
}

fn main() -> Result<()> {
    let paths = ConfigPaths::new()?;
    let (config, config_problem) = AppConfig::load_or_default(&paths.config_file);

    // Held until exit so the file writer flushes
    let _log_guard = match logging::init(&config.log_level, &paths.log_dir) {
        Ok(guard) => Some(guard),
        Err(e) => {
            logging::init_console(&config.log_level)?;
            tracing::warn!("[Main] File logging disabled: {:#}", e);
            None
        }
    };

    tracing::info!("[Main] TuneSync v{} starting", env!("CARGO_PKG_VERSION"));
    match config_problem {
        Some(problem) => tracing::warn!("[Config] {}; using defaults", problem),
        None => tracing::info!("[Config] Loaded {}", paths.config_file.display()),
    }
    if platform::is_elevated() {
        tracing::warn!("[Main] Running with administrator rights; this is not needed");
    }

    let mut update_rx = spawn_update_check(config.check_for_updates);
    let mut update_url: Option<String> = None;

    let (track_tx, track_rx) = unbounded::<Option<TrackSnapshot>>();
    let source_configs = config.sources.clone();
    let query_timeout = config.query_timeout();
    let monitor = TrackMonitor::new(
        config.monitor_settings(),
        move || source::build_sources(&source_configs, query_timeout),
        build_sink(&config),
        Box::new(track_tx),
    );

    print_help();
    monitor.start();

    let mut input_rx = spawn_stdin_reader();
    let signal_rx = spawn_signal_listener();

    loop {
        let event = select! {
            recv(track_rx) -> msg => match msg {
                Ok(track) => Event::Track(track),
                Err(_) => Event::Quit,
            },
            recv(update_rx) -> msg => match msg {
                Ok(url) => Event::UpdateFound(url),
                Err(_) => Event::UpdateChannelDone,
            },
            recv(input_rx) -> msg => match msg {
                Ok(line) => Event::Input(line),
                Err(_) => Event::InputClosed,
            },
            recv(signal_rx) -> msg => {
                if let Ok(signal) = msg {
                    tracing::info!("[Main] Received signal {}", signal);
                }
                Event::Quit
            },
        };

        match event {
            Event::Track(track) => {
                display::print_track(track.as_ref());
                prompt();
            }
            Event::UpdateFound(url) => {
                println!("\n[Update] A new version is available. Press [u] to open {}", url);
                update_url = Some(url);
                prompt();
            }
            Event::UpdateChannelDone => update_rx = never(),
            // Running without a console: keep going until a signal arrives
            Event::InputClosed => input_rx = never(),
            Event::Quit => break,
            Event::Input(line) => match parse_command(&line) {
                Command::Info => {
                    display::print_track(monitor.current().as_ref());
                    println!(
                        "   Monitor:  {}",
                        if monitor.is_running() { "running" } else { "paused" }
                    );
                    prompt();
                }
                Command::Toggle => {
                    if monitor.is_running() {
                        monitor.stop();
                        println!("[CMD] Monitoring paused, presence cleared");
                    } else {
                        monitor.start();
                        println!("[CMD] Monitoring resumed");
                    }
                    prompt();
                }
                Command::OpenUpdate => {
                    match &update_url {
                        Some(url) => {
                            if let Err(e) = open::that(url) {
                                tracing::warn!("[Update] Could not open browser: {}", e);
                            }
                        }
                        None => println!("[INFO] No update available."),
                    }
                    prompt();
                }
                Command::Quit => {
                    println!("[CMD] Quitting");
                    break;
                }
                Command::Empty => prompt(),
                Command::Unknown(cmd) => {
                    println!("Unknown command '{}'. Use i, s, u, or q.", cmd);
                    prompt();
                }
            },
        }
    }

    tracing::info!("[Main] Shutting down...");
    monitor.shutdown();
    tracing::info!("[Main] ✓ Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("i"), Command::Info);
        assert_eq!(parse_command(" INFO \n"), Command::Info);
        assert_eq!(parse_command("s"), Command::Toggle);
        assert_eq!(parse_command("u"), Command::OpenUpdate);
        assert_eq!(parse_command("quit"), Command::Quit);
        assert_eq!(parse_command(""), Command::Empty);
        assert_eq!(parse_command("x"), Command::Unknown("x".into()));
    }

    #[test]
    fn test_forward_lines_until_eof() {
        let (tx, rx) = unbounded();
        let sent = forward_lines(io::Cursor::new("i\ns\r\nq\n"), &tx);
        drop(tx);
        assert_eq!(sent, 3);
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec!["i", "s", "q"]);
    }

    #[test]
    fn test_forward_lines_stops_when_receiver_dropped() {
        let (tx, rx) = unbounded::<String>();
        drop(rx);
        assert_eq!(forward_lines(io::Cursor::new("i\ns\n"), &tx), 0);
    }

    #[test]
    fn test_forward_lines_stops_on_read_error() {
        let (tx, rx) = unbounded();
        // Invalid UTF-8 on the second line ends the stream
        let input: &[u8] = b"i\n\xff\xfe\nq\n";
        assert_eq!(forward_lines(io::Cursor::new(input), &tx), 1);
        drop(tx);
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec!["i"]);
    }
}
