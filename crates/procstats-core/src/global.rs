//! `GlobalState` — the single owner of the `LongPool` and both registries,
//! and the only thing that knows how to fan a lifecycle-state or mem-factor
//! change out across every package sharing a common process record.

use crate::pool::LongPool;
use crate::process::{ProcessId, ProcessRecord};
use crate::registry::PackageRegistry;
use crate::service::ServiceRecord;
use crate::state::{composite_bucket, ADJ_COUNT};

pub struct GlobalState {
    pub(crate) arena: Vec<ProcessRecord>,
    pub(crate) pool: LongPool,
    pub(crate) registry: PackageRegistry,
    /// Adjusted (mem factor + screen) bucket, 0..8, or `None` before the
    /// first `set_mem_factor` call.
    pub(crate) mem_factor: Option<u8>,
    pub(crate) mem_factor_start: i64,
    pub(crate) mem_factor_durations: [i64; ADJ_COUNT],
    pub time_period_start: i64,
    pub time_period_end: i64,
}

impl GlobalState {
    pub fn new(now: i64) -> Self {
        Self {
            arena: Vec::new(),
            pool: LongPool::new(),
            registry: PackageRegistry::new(),
            mem_factor: None,
            mem_factor_start: now,
            mem_factor_durations: [0; ADJ_COUNT],
            time_period_start: now,
            time_period_end: now,
        }
    }

    /// Drops all accumulated process, package and mem-factor data and begins
    /// a fresh accounting period at `now`. Used at startup when no prior
    /// snapshot can be loaded, and by `Codec::decode` on structural failure.
    pub fn reset(&mut self, now: i64) {
        self.arena.clear();
        self.pool.reset();
        self.registry.reset();
        self.mem_factor = None;
        self.mem_factor_start = now;
        self.mem_factor_durations = [0; ADJ_COUNT];
        self.time_period_start = now;
        self.time_period_end = now;
    }

    pub fn pool(&self) -> &LongPool {
        &self.pool
    }

    pub fn arena(&self) -> &[ProcessRecord] {
        &self.arena
    }

    pub fn registry(&self) -> &PackageRegistry {
        &self.registry
    }

    pub fn mem_factor_durations(&self) -> [i64; ADJ_COUNT] {
        self.mem_factor_durations
    }

    pub fn current_mem_factor(&self) -> Option<u8> {
        self.mem_factor
    }

    /// Resolves (creating if necessary) the process id a caller in `pkg`
    /// should use for `proc_name`/`uid`. Applies no state of its own.
    pub fn get_process(&mut self, pkg: &str, uid: u32, proc_name: &str, now: i64) -> ProcessId {
        self.registry.get_process(&mut self.arena, &mut self.pool, pkg, uid, proc_name, now)
    }

    pub fn get_service(&mut self, pkg: &str, uid: u32, svc_name: &str) -> &mut ServiceRecord {
        self.registry.get_service(pkg, uid, svc_name)
    }

    /// Moves `proc_name`/`uid` into `proc_state` (or out of all tracked
    /// states, for `None`) under the *current* mem factor. Always applies to
    /// the common record; additionally fans the same composite state out to
    /// every package-owned clone of the process if and only if the common
    /// record is `multi_package` (`spec.md` §4.3/§4.5). `proc_state` is
    /// `None` for `STATE_NOTHING`.
    pub fn set_process_state(&mut self, pkg: &str, uid: u32, proc_name: &str, proc_state: Option<u8>, now: i64) {
        self.registry.get_process(&mut self.arena, &mut self.pool, pkg, uid, proc_name, now);
        let common_id = *self
            .registry
            .common_processes
            .get(&(proc_name.to_string(), uid))
            .expect("get_process above always creates the common record");

        let bucket = match (proc_state, self.mem_factor) {
            (Some(ps), Some(mf)) => composite_bucket(ps, mf),
            _ => None,
        };

        self.arena[common_id].set_state(&mut self.pool, bucket, now);

        if self.arena[common_id].multi_package {
            let n = self.arena[common_id].pkg_list.len();
            for i in 0..n {
                self.registry.pull_fixed(&mut self.arena[common_id].pkg_list, i, uid, proc_name);
                let id = self.arena[common_id].pkg_list[i].id;
                self.arena[id].set_state(&mut self.pool, bucket, now);
            }
        }
    }

    pub fn add_pss(&mut self, pkg: &str, uid: u32, proc_name: &str, pss_kb: i64, now: i64, force: bool) {
        let id = self.registry.get_process(&mut self.arena, &mut self.pool, pkg, uid, proc_name, now);
        self.arena[id].add_pss(&mut self.pool, pss_kb, now, force);
    }

    /// Increments the common record's excessive-wake counter; if
    /// `multi_package`, also fans out to every per-package clone in
    /// `pkg_list` via `pull_fixed` (`spec.md` §4.3).
    pub fn report_excessive_wake(&mut self, pkg: &str, uid: u32, proc_name: &str, now: i64) {
        self.fan_out_excessive(pkg, uid, proc_name, now, |p| p.report_excessive_wake());
    }

    /// Same fan-out as [`Self::report_excessive_wake`], for CPU events.
    pub fn report_excessive_cpu(&mut self, pkg: &str, uid: u32, proc_name: &str, now: i64) {
        self.fan_out_excessive(pkg, uid, proc_name, now, |p| p.report_excessive_cpu());
    }

    fn fan_out_excessive(&mut self, pkg: &str, uid: u32, proc_name: &str, now: i64, apply: impl Fn(&mut ProcessRecord)) {
        self.registry.get_process(&mut self.arena, &mut self.pool, pkg, uid, proc_name, now);
        let common_id = *self
            .registry
            .common_processes
            .get(&(proc_name.to_string(), uid))
            .expect("get_process above always creates the common record");

        apply(&mut self.arena[common_id]);

        if self.arena[common_id].multi_package {
            let n = self.arena[common_id].pkg_list.len();
            for i in 0..n {
                self.registry.pull_fixed(&mut self.arena[common_id].pkg_list, i, uid, proc_name);
                let id = self.arena[common_id].pkg_list[i].id;
                apply(&mut self.arena[id]);
            }
        }
    }

    /// Device-wide mem-factor transition. Commits elapsed time into the
    /// outgoing bucket of `mem_factor_durations`, then re-arms every
    /// `started`/`bound` `ServiceMode` currently active onto the new
    /// bucket — explicitly *not* `executing`, and explicitly *not* process
    /// records, which pick up the new factor only on their next
    /// `set_process_state` call (`spec.md` §4.6). A no-op transition (the new
    /// factor equal to the current one) returns `false` without mutating
    /// anything; otherwise returns `true` (`spec.md` §4.6/§6).
    pub fn set_mem_factor(&mut self, new_factor: u8, now: i64) -> bool {
        if self.mem_factor == Some(new_factor) {
            return false;
        }
        if let Some(cur) = self.mem_factor {
            self.mem_factor_durations[cur as usize] += now - self.mem_factor_start;
        }
        self.mem_factor = Some(new_factor);
        self.mem_factor_start = now;

        for pkg in self.registry.packages.values_mut() {
            for svc in pkg.services.values_mut() {
                svc.rearm_active_modes(new_factor, now);
            }
        }
        true
    }

    pub fn extend_time_period(&mut self, now: i64) {
        if now > self.time_period_end {
            self.time_period_end = now;
        }
    }

    /// Folds every currently-running interval (process durations, service
    /// durations, the mem-factor duration table) into its accumulator as of
    /// `now`, without changing any `cur_state`. `Codec::encode` only writes
    /// accumulated totals, never live bookkeeping, so this must run
    /// immediately before every snapshot (`spec.md` §4.7: "Before writing
    /// process bodies, commit_state_time(now) must be invoked on every
    /// process"; the same rule extends to services and the mem-factor
    /// table). `Persistor::write_sync`/`commit_async` call this for the
    /// caller; it's exposed so tests can assert on it directly.
    pub fn commit_all(&mut self, now: i64) {
        for id in 0..self.arena.len() {
            self.arena[id].commit_state_time(&mut self.pool, now);
        }
        for pkg in self.registry.packages.values_mut() {
            for svc in pkg.services.values_mut() {
                svc.commit_running(now);
            }
        }
        if let Some(cur) = self.mem_factor {
            self.mem_factor_durations[cur as usize] += now - self.mem_factor_start;
            self.mem_factor_start = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s5_state_change_fans_out_to_every_package_clone() {
        let mut gs = GlobalState::new(0);
        gs.set_mem_factor(0, 0);
        gs.get_process("p1", 1000, "com.x", 0);
        gs.set_process_state("p1", 1000, "com.x", Some(1), 10);

        // Second package forces the multi_package upgrade.
        gs.get_process("p2", 1000, "com.x", 20);
        gs.set_process_state("p2", 1000, "com.x", Some(2), 30);

        // The state change from p2 must also have landed on p1's clone,
        // since both packages share the same underlying OS process.
        let p1_id = gs.registry().packages[&("p1".to_string(), 1000)].processes["com.x"].id();
        assert_eq!(gs.arena()[p1_id].cur_state, composite_bucket(2, 0));
    }

    #[test]
    fn mem_factor_flip_commits_duration_and_rearms_services() {
        let mut gs = GlobalState::new(0);
        assert!(gs.set_mem_factor(0, 0));
        gs.get_service("p1", 1000, "MyService").set_bound(true, 0, 0);

        assert!(gs.set_mem_factor(3, 500));
        assert_eq!(gs.mem_factor_durations()[0], 500);

        let svc = gs.get_service("p1", 1000, "MyService");
        assert_eq!(svc.bound.cur_state, Some(3));
        assert_eq!(svc.bound.durations[0], 500);
    }

    #[test]
    fn mem_factor_noop_returns_false_and_does_not_mutate() {
        let mut gs = GlobalState::new(0);
        assert!(gs.set_mem_factor(2, 0));
        gs.get_service("p1", 1000, "MyService").set_bound(true, 2, 0);

        assert!(!gs.set_mem_factor(2, 500), "same factor must short-circuit as a no-op");
        assert_eq!(gs.mem_factor_durations()[2], 0, "no-op must not commit any elapsed time");
        assert_eq!(gs.current_mem_factor(), Some(2));

        let svc = gs.get_service("p1", 1000, "MyService");
        assert_eq!(svc.bound.durations[2], 0, "no-op must not re-arm services either");
    }

    #[test]
    fn commit_all_folds_every_running_interval_without_switching_state() {
        let mut gs = GlobalState::new(0);
        gs.set_mem_factor(1, 0);
        gs.get_process("p1", 1000, "com.x", 0);
        gs.set_process_state("p1", 1000, "com.x", Some(1), 0);
        gs.get_service("p1", 1000, "Svc").set_bound(true, 1, 0);

        gs.commit_all(700);

        let p1_id = gs.registry().packages[&("p1".to_string(), 1000)].processes["com.x"].id();
        assert_eq!(gs.arena()[p1_id].get_duration(gs.pool(), composite_bucket(1, 1).unwrap(), 700), 700);
        assert_eq!(gs.arena()[p1_id].cur_state, composite_bucket(1, 1), "commit must not clear cur_state");
        assert_eq!(gs.mem_factor_durations()[1], 700);
        assert_eq!(gs.get_service("p1", 1000, "Svc").bound.durations[1], 700);
    }

    #[test]
    fn reset_clears_everything() {
        let mut gs = GlobalState::new(0);
        gs.set_mem_factor(0, 0);
        gs.get_process("p1", 1000, "com.x", 0);
        gs.reset(100);
        assert!(gs.arena().is_empty());
        assert_eq!(gs.current_mem_factor(), None);
        assert_eq!(gs.time_period_start, 100);
    }
}
