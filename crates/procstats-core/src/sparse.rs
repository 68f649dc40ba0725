//! `SparseStateTable` — a per-owner sorted vector of packed offsets, keyed
//! by the 8-bit composite state tag. Each process/service record owns one
//! of these per accumulator (durations, PSS samples).

use crate::pool::{LongPool, PackedOffset};

#[derive(Debug, Clone, Default)]
pub struct SparseStateTable {
    /// Sorted ascending by `PackedOffset::type_tag`. Each tag appears at
    /// most once.
    entries: Vec<PackedOffset>,
}

impl SparseStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classic binary search on the type-tag byte: `Ok(idx)` on a hit,
    /// `Err(insert_idx)` on a miss.
    pub fn find(&self, state: u8) -> Result<usize, usize> {
        self.entries.binary_search_by_key(&state, |o| o.type_tag())
    }

    pub fn get(&self, state: u8) -> Option<PackedOffset> {
        self.find(state).ok().map(|i| self.entries[i])
    }

    /// Returns the offset for `state`, allocating `slots` fresh longs from
    /// `pool` and splicing the result into sorted position on a miss.
    pub fn get_or_insert(&mut self, pool: &mut LongPool, state: u8, slots: u16) -> PackedOffset {
        match self.find(state) {
            Ok(idx) => self.entries[idx],
            Err(insert_at) => {
                let off = pool.alloc(slots).with_tag(state);
                self.entries.insert(insert_at, off);
                off
            }
        }
    }

    /// Deep-copies every entry into fresh slots of `slots_per_entry` width
    /// within the same `pool`, preserving values. Used by
    /// `ProcessRecord::clone_for`. Reads each old entry's values before
    /// allocating its replacement, since `alloc` may append a new backing
    /// array to `pool` (existing arrays stay put, so the old offset remains
    /// valid, but a single simultaneous `&mut`/`&` borrow of `pool` is not).
    pub fn deep_clone_into(&self, pool: &mut LongPool, slots_per_entry: u16) -> Self {
        let mut entries = Vec::with_capacity(self.entries.len());
        for &old in &self.entries {
            let mut values = [0i64; 8];
            for i in 0..slots_per_entry {
                values[i as usize] = pool.get(old, i);
            }
            let new_off = pool.alloc(slots_per_entry).with_tag(old.type_tag());
            for i in 0..slots_per_entry {
                pool.set(new_off, i, values[i as usize]);
            }
            entries.push(new_off);
        }
        Self { entries }
    }

    pub fn enumerate(&self) -> impl Iterator<Item = (u8, PackedOffset)> + '_ {
        self.entries.iter().map(|&o| (o.type_tag(), o))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuilds a table directly from a list of packed offsets read off the
    /// wire. Does not re-sort: callers must reject tables whose tags are not
    /// strictly ascending (see `Codec`'s structural validation).
    pub fn from_raw_offsets(entries: Vec<PackedOffset>) -> Self {
        Self { entries }
    }

    pub fn raw_offsets(&self) -> &[PackedOffset] {
        &self.entries
    }

    /// True if tags are strictly ascending, per `spec.md` §8 invariant 3.
    pub fn is_sorted_by_tag(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].type_tag() < w[1].type_tag())
    }
}
