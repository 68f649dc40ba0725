//! `ProcessRecord` — the lifecycle state machine and accumulators for one
//! process (either the canonical "common" record, or a per-package clone).

use crate::pool::LongPool;
use crate::registry::ProcessHandle;
use crate::sparse::SparseStateTable;
use crate::state::PSS_COUNT;

/// Arena index into `GlobalState`'s process storage. A common record's own
/// index is stored in its own `common` field (self-reference).
pub type ProcessId = usize;

const DURATION_SLOTS: u16 = 1;
const PSS_SLOTS: u16 = PSS_COUNT;

/// How long the last PSS sample must have been taken in the same state
/// before a forced-off `add_pss` is allowed to record a new one.
const PSS_THROTTLE_MS: i64 = 30_000;

#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub package: String,
    pub uid: u32,
    pub name: String,
    /// Index of the canonical record for this `(name, uid)`. Equal to this
    /// record's own arena index iff this *is* the common record.
    pub common: ProcessId,
    pub multi_package: bool,
    pub cur_state: Option<u8>,
    pub start_time: i64,
    pub durations: SparseStateTable,
    pub pss: SparseStateTable,
    pub last_pss_state: Option<u8>,
    pub last_pss_time: i64,
    pub excessive_wake_count: u32,
    pub excessive_cpu_count: u32,
    /// Every package-owned handle (alias or clone) ever created for this
    /// name/uid, kept only on the common record. `GlobalState` walks this to
    /// fan a lifecycle-state change out to every package sharing the
    /// process, refreshing each entry through `pull_fixed` first.
    pub pkg_list: Vec<ProcessHandle>,
}

impl ProcessRecord {
    pub fn new_common(package: String, uid: u32, name: String, common: ProcessId, now: i64) -> Self {
        Self {
            package,
            uid,
            name,
            common,
            multi_package: false,
            cur_state: None,
            start_time: now,
            durations: SparseStateTable::new(),
            pss: SparseStateTable::new(),
            last_pss_state: None,
            last_pss_time: 0,
            excessive_wake_count: 0,
            excessive_cpu_count: 0,
            pkg_list: Vec::new(),
        }
    }

    /// Folds the running interval into the duration table for `cur_state`
    /// (if any), then unconditionally rebases `start_time` to `now`. The
    /// sole point at which durations accumulate (`spec.md` §4.3).
    pub fn commit_state_time(&mut self, pool: &mut LongPool, now: i64) {
        if let Some(cur) = self.cur_state {
            let dur = now - self.start_time;
            let off = self.durations.get_or_insert(pool, cur, DURATION_SLOTS);
            let accumulated = pool.get(off, 0);
            pool.set(off, 0, accumulated + dur);
        }
        self.start_time = now;
    }

    /// Applies a new composite bucket to this single record. Fan-out across
    /// per-package clones is the caller's (GlobalState's) job.
    pub fn set_state(&mut self, pool: &mut LongPool, new_bucket: Option<u8>, now: i64) {
        self.commit_state_time(pool, now);
        self.cur_state = new_bucket;
    }

    /// Folds one PSS sample into the table for `cur_state`, throttling
    /// repeat samples in the same state within 30s unless `force` is set.
    /// Returns `false` if the sample was discarded (throttled, or the
    /// process isn't in a tracked state at all).
    pub fn add_pss(&mut self, pool: &mut LongPool, pss_kb: i64, now: i64, force: bool) -> bool {
        let Some(state) = self.cur_state else {
            return false;
        };

        if !force
            && self.last_pss_state == Some(state)
            && now - self.last_pss_time < PSS_THROTTLE_MS
        {
            return false;
        }

        let off = self.pss.get_or_insert(pool, state, PSS_SLOTS);
        let count = pool.get(off, 0);
        if count == 0 {
            pool.set(off, 0, 1);
            pool.set(off, 1, pss_kb);
            pool.set(off, 2, pss_kb);
            pool.set(off, 3, pss_kb);
        } else {
            let min = pool.get(off, 1).min(pss_kb);
            let max = pool.get(off, 3).max(pss_kb);
            let avg = pool.get(off, 2);
            let new_avg = ((avg as f64 * count as f64 + pss_kb as f64) / (count as f64 + 1.0)).floor() as i64;
            pool.set(off, 0, count + 1);
            pool.set(off, 1, min);
            pool.set(off, 2, new_avg);
            pool.set(off, 3, max);
        }

        self.last_pss_state = Some(state);
        self.last_pss_time = now;
        true
    }

    pub fn report_excessive_wake(&mut self) {
        self.excessive_wake_count += 1;
    }

    pub fn report_excessive_cpu(&mut self) {
        self.excessive_cpu_count += 1;
    }

    /// Produces a per-package clone: duration slots are deep-copied into
    /// fresh pool entries, PSS is left empty (high-frequency, low value
    /// across package splits — see `spec.md` §9 open question), excessive
    /// counters are copied as-is, and `cur_state` is inherited with
    /// `start_time` rebased to `now`. Clones within the same `LongPool` that
    /// backs the record being cloned; `GlobalState` owns exactly one pool.
    pub fn clone_for(&self, pool: &mut LongPool, new_pkg: String, now: i64) -> Self {
        Self {
            package: new_pkg,
            uid: self.uid,
            name: self.name.clone(),
            common: self.common,
            multi_package: false,
            cur_state: self.cur_state,
            start_time: now,
            durations: self.durations.deep_clone_into(pool, DURATION_SLOTS),
            pss: SparseStateTable::new(),
            last_pss_state: None,
            last_pss_time: 0,
            excessive_wake_count: self.excessive_wake_count,
            excessive_cpu_count: self.excessive_cpu_count,
            // pkg_list lives only on the common record; clones are leaves.
            pkg_list: Vec::new(),
        }
    }

    /// Stored duration for `bucket`, plus the currently-running delta if
    /// `cur_state == Some(bucket)`.
    pub fn get_duration(&self, pool: &LongPool, bucket: u8, now: i64) -> i64 {
        let stored = self.durations.get(bucket).map(|off| pool.get(off, 0)).unwrap_or(0);
        let running = if self.cur_state == Some(bucket) { now - self.start_time } else { 0 };
        stored + running
    }

    pub fn is_common(&self, own_id: ProcessId) -> bool {
        self.common == own_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(now: i64) -> ProcessRecord {
        ProcessRecord::new_common("com.x".into(), 1000, "com.x".into(), 0, now)
    }

    #[test]
    fn s1_single_process_duration_accounting() {
        let mut pool = LongPool::new();
        let mut p = rec(0);
        p.set_state(&mut pool, Some(1), 100);
        p.set_state(&mut pool, Some(9), 1100);
        assert_eq!(p.get_duration(&pool, 1, 1100), 1000);
        assert_eq!(p.get_duration(&pool, 9, 1200), 100);
    }

    #[test]
    fn s3_pss_running_mean_matches_spec_formula() {
        let mut pool = LongPool::new();
        let mut p = rec(0);
        p.set_state(&mut pool, Some(1), 0);
        assert!(p.add_pss(&mut pool, 100, 0, true));
        assert!(p.add_pss(&mut pool, 400, 0, true));
        assert!(p.add_pss(&mut pool, 100, 0, true));

        let off = p.pss.get(1).unwrap();
        assert_eq!(pool.get(off, 0), 3); // count
        assert_eq!(pool.get(off, 1), 100); // min
        assert_eq!(pool.get(off, 2), 200); // avg
        assert_eq!(pool.get(off, 3), 400); // max
    }

    #[test]
    fn pss_throttles_repeat_samples_within_30s() {
        let mut pool = LongPool::new();
        let mut p = rec(0);
        p.set_state(&mut pool, Some(1), 0);
        assert!(p.add_pss(&mut pool, 100, 0, false));
        assert!(!p.add_pss(&mut pool, 200, 10_000, false));
        let off = p.pss.get(1).unwrap();
        assert_eq!(pool.get(off, 0), 1);
        assert_eq!(pool.get(off, 2), 100);
    }

    #[test]
    fn pss_not_throttled_across_30s_boundary() {
        let mut pool = LongPool::new();
        let mut p = rec(0);
        p.set_state(&mut pool, Some(1), 0);
        assert!(p.add_pss(&mut pool, 100, 0, false));
        assert!(p.add_pss(&mut pool, 200, 30_001, false));
        let off = p.pss.get(1).unwrap();
        assert_eq!(pool.get(off, 0), 2);
    }

    #[test]
    fn clone_deep_copies_durations_but_not_pss() {
        let mut pool = LongPool::new();
        let mut common = rec(0);
        common.set_state(&mut pool, Some(1), 0);
        common.set_state(&mut pool, Some(9), 1000);
        common.add_pss(&mut pool, 555, 1000, true);
        common.report_excessive_wake();

        let clone = common.clone_for(&mut pool, "other.pkg".into(), 2000);

        assert_eq!(clone.get_duration(&pool, 1, 2000), 1000);
        assert!(clone.pss.is_empty());
        assert_eq!(clone.excessive_wake_count, 1);
        assert_eq!(clone.cur_state, Some(9));
        assert_eq!(clone.start_time, 2000);
    }
}
