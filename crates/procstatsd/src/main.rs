//! procstatsd - process/package runtime statistics accumulator daemon.
//!
//! Owns the in-memory `GlobalState`, restores it from the on-disk snapshot
//! at startup, and periodically re-persists it. Everything that actually
//! drives state changes (process lifecycle transitions, PSS samples,
//! service mode flips, mem-factor changes) arrives over the control socket
//! in `control` — the host process that would normally call the
//! programmatic API in-proc is out of core scope (`spec.md` §1), so this
//! daemon's control socket stands in for it.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// Releases unused memory back to the operating system after a write.
fn release_memory_to_os() {
    // SAFETY: arena.0.purge is a well-defined jemalloc mallctl with no
    // arguments or outputs.
    unsafe {
        tikv_jemalloc_sys::mallctl(
            c"arena.0.purge".as_ptr().cast(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            0,
        );
    }
}

mod control;
mod monotonic;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use procstats_core::{GlobalState, Persistor};

/// Process/package runtime statistics accumulator daemon.
#[derive(Parser)]
#[command(name = "procstatsd", about = "Process/package runtime statistics accumulator daemon", version)]
struct Args {
    /// Directory holding the on-disk snapshot and the control socket.
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// How often the collection loop checks whether a write is due.
    #[arg(long, default_value = "30")]
    tick_interval_secs: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("procstatsd={}", level).parse().unwrap())
        .add_directive(format!("procstats_core={}", level).parse().unwrap());

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn snapshot_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("current.bin")
}

fn control_socket_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join("control.sock")
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("procstatsd {} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        error!("failed to create data directory {}: {e}", args.data_dir.display());
        std::process::exit(1);
    }

    let snapshot_path = snapshot_path(&args.data_dir);
    let now = monotonic::now_ms();

    let initial = match Persistor::load(&snapshot_path) {
        Ok(gs) => {
            info!("restored snapshot from {}", snapshot_path.display());
            gs
        }
        Err(e) => {
            warn!("no usable snapshot at {} ({e}); starting fresh", snapshot_path.display());
            GlobalState::new(now)
        }
    };

    let state = Arc::new(Mutex::new(initial));
    let persistor = Arc::new(Persistor::new(&snapshot_path));
    let running = Arc::new(AtomicBool::new(true));

    let socket_path = control_socket_path(&args.data_dir);
    if let Err(e) = control::spawn(&socket_path, Arc::clone(&state), Arc::clone(&persistor), Arc::clone(&running)) {
        error!("failed to start control socket at {}: {e}", socket_path.display());
        std::process::exit(1);
    }
    info!("control socket listening at {}", socket_path.display());

    let r = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("failed to set Ctrl-C handler: {e}");
    }

    let tick = Duration::from_secs(args.tick_interval_secs.max(1));
    info!("starting collection loop (tick={}s)", tick.as_secs());

    while running.load(Ordering::SeqCst) {
        let now = monotonic::now_ms();
        if persistor.should_write_now(now) {
            let mut gs = state.lock().unwrap();
            match persistor.commit_async(&mut gs, now) {
                Ok(()) => debug!("scheduled background snapshot write"),
                Err(e) => error!("failed to schedule snapshot write: {e}"),
            }
            drop(gs);
            release_memory_to_os();
        }

        let sleep_step = Duration::from_millis(100);
        let mut remaining = tick;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let step = remaining.min(sleep_step);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }

    info!("shutting down...");
    persistor.shutdown();

    let now = monotonic::now_ms();
    let mut gs = state.lock().unwrap();
    match persistor.write_sync(&mut gs, now) {
        Ok(()) => info!("final snapshot written to {}", snapshot_path.display()),
        Err(e) => error!("final snapshot write failed: {e}"),
    }

    info!("shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_socket_paths_are_siblings_under_the_data_dir() {
        let dir = PathBuf::from("/tmp/procstatsd-test");
        assert_eq!(snapshot_path(&dir), PathBuf::from("/tmp/procstatsd-test/current.bin"));
        assert_eq!(control_socket_path(&dir), PathBuf::from("/tmp/procstatsd-test/control.sock"));
    }
}
