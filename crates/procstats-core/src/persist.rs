//! `Persistor` — atomic on-disk persistence for a `GlobalState` snapshot.
//!
//! Mirrors the write-to-temp-then-`fsync`-then-`rename` pattern used by
//! `storage::manager::flush_chunk_with_time` and `storage::chunk::write_chunk`
//! in the wider rpglot ecosystem this crate grew out of, but drops the
//! WAL: a stats accumulator can tolerate losing at most one flush interval
//! of data on an unclean shutdown, so there's no journal to replay, only a
//! single destination file.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec;
use crate::global::GlobalState;

/// Minimum gap between writes that `should_write_now` will recommend,
/// absent an explicit force — 30 minutes (`spec.md` §5).
pub const WRITE_INTERVAL_MS: i64 = 30 * 60 * 1000;

pub struct Persistor {
    path: PathBuf,
    /// The most recently serialized snapshot awaiting a background write.
    /// A second `commit_async` before the first drains simply replaces this
    /// slot — there is never more than one write in flight or queued.
    pending: Mutex<Option<Vec<u8>>>,
    /// Held only while actual file I/O is in progress, so a synchronous
    /// `write_sync` and a background `commit_async` never interleave their
    /// writes to the same path.
    serializer: Mutex<()>,
    shutdown: AtomicBool,
    last_write_time: AtomicI64,
}

impl Persistor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pending: Mutex::new(None),
            serializer: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            last_write_time: AtomicI64::new(0),
        }
    }

    /// True once `WRITE_INTERVAL_MS` have elapsed since the last completed
    /// write. Callers combine this with their own "dirty" tracking; this
    /// method only knows about time.
    pub fn should_write_now(&self, now: i64) -> bool {
        now > self.last_write_time.load(Ordering::Relaxed) + WRITE_INTERVAL_MS
    }

    pub fn last_write_time(&self) -> i64 {
        self.last_write_time.load(Ordering::Relaxed)
    }

    /// Encodes and writes `state` to disk on the calling thread, blocking
    /// until the write and rename land. Calls `GlobalState::commit_all`
    /// first so whatever is currently running is folded into the snapshot
    /// (`spec.md` §4.7).
    pub fn write_sync(&self, state: &mut GlobalState, now: i64) -> io::Result<()> {
        state.extend_time_period(now);
        state.commit_all(now);
        let mut buf = Vec::new();
        codec::encode(state, &mut buf)?;
        let _guard = self.serializer.lock().unwrap();
        Self::atomic_write(&self.path, &buf)?;
        self.last_write_time.store(now, Ordering::Relaxed);
        Ok(())
    }

    /// Encodes `state` immediately (cheap relative to the I/O it replaces)
    /// and hands the bytes to a background thread for the actual write.
    /// Returns as soon as the encode is done; does not block on I/O.
    pub fn commit_async(self: &Arc<Self>, state: &mut GlobalState, now: i64) -> io::Result<()> {
        state.extend_time_period(now);
        state.commit_all(now);
        let mut buf = Vec::new();
        codec::encode(state, &mut buf)?;
        *self.pending.lock().unwrap() = Some(buf);

        let this = Arc::clone(self);
        std::thread::spawn(move || this.drain_pending(now));
        Ok(())
    }

    fn drain_pending(&self, now: i64) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let buf = match self.pending.lock().unwrap().take() {
            Some(buf) => buf,
            // Another background write already claimed it.
            None => return,
        };
        let _guard = self.serializer.lock().unwrap();
        match Self::atomic_write(&self.path, &buf) {
            Ok(()) => self.last_write_time.store(now, Ordering::Relaxed),
            Err(err) => tracing::warn!(path = %self.path.display(), %err, "failed to persist process stats snapshot"),
        }
    }

    /// Marks the persistor as shutting down: any background write not yet
    /// started is abandoned. A write already past this check completes
    /// normally, since it has already claimed the pending buffer.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn load(path: &Path) -> io::Result<GlobalState> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        codec::decode(&mut &buf[..])
    }

    fn atomic_write(path: &Path, buf: &[u8]) -> io::Result<()> {
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_state() -> GlobalState {
        let mut gs = GlobalState::new(0);
        gs.set_mem_factor(0, 0);
        gs.get_process("p1", 1000, "com.x", 0);
        gs.set_process_state("p1", 1000, "com.x", Some(1), 10);
        gs.extend_time_period(10);
        gs
    }

    #[test]
    fn write_sync_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procstats.bin");
        let persistor = Persistor::new(&path);
        let mut state = sample_state();

        persistor.write_sync(&mut state, 10).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists(), "temp file must be renamed away");

        let loaded = Persistor::load(&path).unwrap();
        assert_eq!(loaded.time_period_end, state.time_period_end);
        assert_eq!(persistor.last_write_time(), 10);
    }

    #[test]
    fn should_write_now_respects_the_interval() {
        let persistor = Persistor::new("/nonexistent/path.bin");
        assert!(persistor.should_write_now(WRITE_INTERVAL_MS + 1));
        assert!(!persistor.should_write_now(WRITE_INTERVAL_MS - 1));
    }

    #[test]
    fn commit_async_eventually_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procstats.bin");
        let persistor = Arc::new(Persistor::new(&path));
        let mut state = sample_state();

        persistor.commit_async(&mut state, 10).unwrap();

        let mut waited = Duration::ZERO;
        while !path.exists() && waited < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(20));
            waited += Duration::from_millis(20);
        }
        assert!(path.exists(), "background write never landed");
        assert_eq!(persistor.last_write_time(), 10);
    }

    #[test]
    fn a_second_commit_before_the_first_drains_replaces_the_pending_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procstats.bin");
        let persistor = Arc::new(Persistor::new(&path));

        let mut first = sample_state();
        first.set_process_state("p1", 1000, "com.x", Some(2), 20);
        let mut second = sample_state();
        second.set_process_state("p1", 1000, "com.x", Some(3), 20);

        {
            first.commit_all(20);
            let mut buf = Vec::new();
            codec::encode(&first, &mut buf).unwrap();
            *persistor.pending.lock().unwrap() = Some(buf);
        }
        persistor.commit_async(&mut second, 20).unwrap();

        let mut waited = Duration::ZERO;
        while !path.exists() && waited < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(20));
            waited += Duration::from_millis(20);
        }
        let loaded = Persistor::load(&path).unwrap();
        assert_eq!(loaded.time_period_end, second.time_period_end);
    }
}
