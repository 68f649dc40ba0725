//! Monotonic millisecond clock. `spec.md` §5 requires every timestamp fed
//! into `GlobalState` to come from a monotonic source, since accumulated
//! durations must never go negative if the wall clock steps backwards (NTP
//! correction, timezone change). `Instant` is monotonic but has no fixed
//! epoch, so this pins one wall-clock reading at startup and reports
//! `Instant::elapsed()` against it — the result is monotonic for the life of
//! the process and still close enough to wall-clock time to be readable in
//! logs and `time_period_start`/`time_period_end`.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static ORIGIN: OnceLock<(Instant, i64)> = OnceLock::new();

fn wall_clock_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as i64
}

pub fn now_ms() -> i64 {
    let &(origin_instant, origin_epoch_ms) = ORIGIN.get_or_init(|| (Instant::now(), wall_clock_epoch_ms()));
    origin_epoch_ms + origin_instant.elapsed().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_never_goes_backwards() {
        let a = now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_ms();
        assert!(b >= a);
    }
}
