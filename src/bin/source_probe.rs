//! Polls the configured player sources directly, without presence, and prints
//! what each one reports. `--once` prints a single round and exits.

use std::io::{self, BufRead};
use std::thread;

use anyhow::Result;
use crossbeam_channel::{unbounded, RecvTimeoutError};

use tunesync::config::{AppConfig, ConfigPaths};
use tunesync::source::{self, PlayerSource};
use tunesync::track::observation_changed;
use tunesync::{display, logging, TrackSnapshot};

/// Queries every source (not just until the first hit) and prints the ones
/// whose observation changed since the last round.
fn probe_round(sources: &mut [Box<dyn PlayerSource>], last: &mut [Option<TrackSnapshot>], verbose: bool) {
    for (source, previous) in sources.iter_mut().zip(last.iter_mut()) {
        let current = source.query();
        if verbose || observation_changed(previous.as_ref(), current.as_ref()) {
            println!("\n[{}]", source.name());
            display::print_track(current.as_ref());
        }
        *previous = current;
    }
}

fn main() -> Result<()> {
    let once = std::env::args().any(|arg| arg == "--once");

    let paths = ConfigPaths::new()?;
    let (config, problem) = AppConfig::load_or_default(&paths.config_file);
    logging::init_console(&config.log_level)?;
    if let Some(problem) = problem {
        tracing::warn!("[Probe] {}; using defaults", problem);
    }

    println!("========================================");
    println!("   TuneSync source probe");
    println!("========================================");
    for (i, c) in config.sources.iter().enumerate() {
        println!(
            "  {}. {:?} -> {}{}",
            i + 1,
            c.role,
            c.target.label(),
            if c.enabled { "" } else { " (disabled)" }
        );
    }
    println!("  Poll every {:?}, query timeout {:?}", config.poll_interval(), config.query_timeout());
    println!("  Press Enter to quit");
    println!("----------------------------------------");

    let mut sources = source::build_sources(&config.sources, config.query_timeout());
    let mut last: Vec<Option<TrackSnapshot>> = vec![None; sources.len()];

    if once {
        probe_round(&mut sources, &mut last, true);
        source::release_all(&mut sources);
        return Ok(());
    }

    let (quit_tx, quit_rx) = unbounded::<()>();
    thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().lock().read_line(&mut line);
        let _ = quit_tx.send(());
    });

    let mut first = true;
    loop {
        probe_round(&mut sources, &mut last, first);
        first = false;

        match quit_rx.recv_timeout(config.poll_interval()) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    source::release_all(&mut sources);
    println!("[Probe] Done");
    Ok(())
}
