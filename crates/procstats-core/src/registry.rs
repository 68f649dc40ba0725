//! `PackageRegistry` — indexes process and package records by `(name, uid)`
//! and mediates the common-vs-per-package ownership transition described in
//! `spec.md` §3 ("Ownership and lifecycle") and §4.5.

use std::collections::HashMap;

use crate::pool::LongPool;
use crate::process::{ProcessId, ProcessRecord};
use crate::service::ServiceRecord;

/// How a package's process map entry relates to the arena: either an alias
/// of the still-single-owner common record, or an owned per-package clone.
/// Mirrors `spec.md` §9's "Design Notes" suggestion of a tagged variant
/// instead of a boolean-guarded pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSlot {
    Alias(ProcessId),
    Own(ProcessId),
}

impl ProcessSlot {
    pub fn id(self) -> ProcessId {
        match self {
            ProcessSlot::Alias(id) | ProcessSlot::Own(id) => id,
        }
    }
}

#[derive(Debug, Default)]
pub struct PackageRecord {
    pub uid: u32,
    pub processes: HashMap<String, ProcessSlot>,
    pub services: HashMap<String, ServiceRecord>,
}

/// One entry in a fan-out list: the package a common state-change should be
/// mirrored into, plus the last-resolved record id (refreshed in place by
/// [`PackageRegistry::pull_fixed`] if stale).
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pkg: String,
    pub id: ProcessId,
}

#[derive(Debug, Default)]
pub struct PackageRegistry {
    pub common_processes: HashMap<(String, u32), ProcessId>,
    pub packages: HashMap<(String, u32), PackageRecord>,
}

impl PackageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.common_processes.clear();
        self.packages.clear();
    }

    fn ensure_package(&mut self, pkg: &str, uid: u32) -> &mut PackageRecord {
        self.packages
            .entry((pkg.to_string(), uid))
            .or_insert_with(|| PackageRecord { uid, ..Default::default() })
    }

    /// Resolves `(pkg, uid, proc_name)` to a process id, creating records as
    /// needed and performing the common→multi_package upgrade the first
    /// time a second package asks for the same process name. See
    /// `spec.md` §4.5 for the five-step algorithm this implements.
    pub fn get_process(
        &mut self,
        arena: &mut Vec<ProcessRecord>,
        pool: &mut LongPool,
        pkg: &str,
        uid: u32,
        proc_name: &str,
        now: i64,
    ) -> ProcessId {
        if let Some(slot) = self.ensure_package(pkg, uid).processes.get(proc_name) {
            return slot.id();
        }

        let common_id = match self.common_processes.get(&(proc_name.to_string(), uid)) {
            Some(&id) => id,
            None => {
                let id = arena.len();
                arena.push(ProcessRecord::new_common(pkg.to_string(), uid, proc_name.to_string(), id, now));
                self.common_processes.insert((proc_name.to_string(), uid), id);
                self.ensure_package(pkg, uid)
                    .processes
                    .insert(proc_name.to_string(), ProcessSlot::Alias(id));
                register_pkg_handle(arena, id, pkg, id);
                return id;
            }
        };

        if !arena[common_id].multi_package {
            let common_owner_pkg = arena[common_id].package.clone();
            if common_owner_pkg == pkg {
                self.ensure_package(pkg, uid)
                    .processes
                    .insert(proc_name.to_string(), ProcessSlot::Alias(common_id));
                register_pkg_handle(arena, common_id, pkg, common_id);
                return common_id;
            }

            // Upgrade: the common record now serves more than one package.
            // Cloning copies only what's already committed to the common
            // record's own duration table — the interval since its last
            // `commit_state_time` is neither committed nor copied here, it
            // keeps accruing on the common record itself (its `start_time`
            // is untouched by this branch) and lands in the clone's table
            // only once a future `set_state` commits it (`spec.md` §4.3/§8
            // S2: a fresh clone's bucket duration is 0 at clone time).
            arena[common_id].multi_package = true;

            let owner_clone = arena[common_id].clone_for(pool, common_owner_pkg.clone(), now);
            let owner_id = arena.len();
            arena.push(owner_clone);
            self.ensure_package(&common_owner_pkg, uid)
                .processes
                .insert(proc_name.to_string(), ProcessSlot::Own(owner_id));
            register_pkg_handle(arena, common_id, &common_owner_pkg, owner_id);

            let caller_clone = arena[common_id].clone_for(pool, pkg.to_string(), now);
            let caller_id = arena.len();
            arena.push(caller_clone);
            self.ensure_package(pkg, uid)
                .processes
                .insert(proc_name.to_string(), ProcessSlot::Own(caller_id));
            register_pkg_handle(arena, common_id, pkg, caller_id);
            return caller_id;
        }

        let clone = arena[common_id].clone_for(pool, pkg.to_string(), now);
        let id = arena.len();
        arena.push(clone);
        self.ensure_package(pkg, uid)
            .processes
            .insert(proc_name.to_string(), ProcessSlot::Own(id));
        register_pkg_handle(arena, common_id, pkg, id);
        id
    }

    pub fn get_service<'a>(&'a mut self, pkg: &str, uid: u32, svc_name: &str) -> &'a mut ServiceRecord {
        self.ensure_package(pkg, uid)
            .services
            .entry(svc_name.to_string())
            .or_insert_with(ServiceRecord::new)
    }

    /// Re-reads `pkg_list[i]`'s package map to refresh a possibly-stale
    /// `ProcessId` (the common record it used to point at may have been
    /// upgraded to `multi_package` since the handle was captured). Panics —
    /// a hard programming-invariant failure per `spec.md` §4.5/§7 — if the
    /// expected per-package clone is missing.
    pub fn pull_fixed(&self, pkg_list: &mut [ProcessHandle], i: usize, uid: u32, proc_name: &str) {
        let pkg_name = pkg_list[i].pkg.clone();
        let slot = self
            .packages
            .get(&(pkg_name.clone(), uid))
            .and_then(|p| p.processes.get(proc_name))
            .unwrap_or_else(|| {
                panic!(
                    "pull_fixed: package {pkg_name:?} has no per-package clone of process {proc_name:?} (uid {uid}); it should have been created during get_process"
                )
            });
        pkg_list[i].id = slot.id();
    }
}

/// Records that `pkg` currently resolves to `id` for the common record at
/// `common_id`, replacing any stale entry for the same package name rather
/// than accumulating duplicates across repeated upgrades.
pub(crate) fn register_pkg_handle(arena: &mut [ProcessRecord], common_id: ProcessId, pkg: &str, id: ProcessId) {
    let list = &mut arena[common_id].pkg_list;
    match list.iter_mut().find(|h| h.pkg == pkg) {
        Some(h) => h.id = id,
        None => list.push(ProcessHandle { pkg: pkg.to_string(), id }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Vec<ProcessRecord>, LongPool, PackageRegistry) {
        (Vec::new(), LongPool::new(), PackageRegistry::new())
    }

    #[test]
    fn s2_second_package_triggers_multi_package_upgrade() {
        let (mut arena, mut pool, mut reg) = setup();
        let id1 = reg.get_process(&mut arena, &mut pool, "p1", 1000, "com.x", 0);
        arena[id1].set_state(&mut pool, Some(1), 50);

        let id2 = reg.get_process(&mut arena, &mut pool, "p2", 1000, "com.x", 60);

        assert!(arena[id1].multi_package);
        assert_ne!(id1, id2, "second package must get a distinct clone");

        let p1_slot = reg.packages[&("p1".to_string(), 1000)].processes["com.x"];
        assert_ne!(p1_slot.id(), id1, "original owner must also get its own clone, not keep aliasing common");

        let clone_id = p1_slot.id();
        assert_eq!(
            arena[clone_id].get_duration(&pool, 1, 60),
            0,
            "spec.md §8 S2: a fresh clone's bucket duration is 0 at clone time, since only what \
             was already committed to the common record is copied"
        );
        assert_eq!(arena[clone_id].cur_state, Some(1));
        assert_eq!(arena[clone_id].start_time, 60);

        // The common record itself keeps accruing uninterrupted: its
        // `start_time` was never rebased by the clone split, so the full
        // interval since the original `set_state(TOP, 50)` is still live.
        assert_eq!(arena[id1].start_time, 50);
        assert_eq!(arena[id1].get_duration(&pool, 1, 60), 10);
    }

    #[test]
    fn same_package_requery_returns_same_alias() {
        let (mut arena, mut pool, mut reg) = setup();
        let id1 = reg.get_process(&mut arena, &mut pool, "p1", 1000, "com.x", 0);
        let id2 = reg.get_process(&mut arena, &mut pool, "p1", 1000, "com.x", 10);
        assert_eq!(id1, id2);
    }

    #[test]
    fn pull_fixed_refreshes_stale_handle_after_upgrade() {
        let (mut arena, mut pool, mut reg) = setup();
        let common_id = reg.get_process(&mut arena, &mut pool, "p1", 1000, "com.x", 0);
        let mut pkg_list = vec![ProcessHandle { pkg: "p1".to_string(), id: common_id }];

        reg.get_process(&mut arena, &mut pool, "p2", 1000, "com.x", 60);

        reg.pull_fixed(&mut pkg_list, 0, 1000, "com.x");
        assert_ne!(pkg_list[0].id, common_id);
    }

    #[test]
    #[should_panic(expected = "pull_fixed")]
    fn pull_fixed_panics_on_missing_clone() {
        let (mut arena, mut pool, mut reg) = setup();
        let common_id = reg.get_process(&mut arena, &mut pool, "p1", 1000, "com.x", 0);
        let mut pkg_list = vec![ProcessHandle { pkg: "ghost".to_string(), id: common_id }];
        reg.pull_fixed(&mut pkg_list, 0, 1000, "com.x");
    }
}
