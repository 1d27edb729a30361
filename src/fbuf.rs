//! The metadata cache: a fixed number of slots holding forward-map index
//! blocks, replaced second-chance, with indirect (pinned) lists holding
//! nodes whose children are resident.
//!
//! This module owns only the cache's bookkeeping (which slot holds what,
//! who's pinned, who's next to evict). The I/O-carrying operations --
//! descending the tree on a miss, flushing a dirty node, detaching a
//! victim from its parent -- live in `core` since they also touch the
//! device and the cold segment stream.

use crate::prelude::*;
use crate::types::{MetaAddr, SectorAddr, SECTOR_NULL, SECTOR_SIZE};
use hashbrown::HashMap;
use std::collections::VecDeque;

pub struct FbufSlot {
    pub ma: Option<MetaAddr>,
    pub data: Vec<u8>,
    /// The SA this slot's content currently lives at on disk (`SECTOR_NULL`
    /// if it has never been flushed).
    pub sa: SectorAddr,
    pub parent: Option<MetaAddr>,
    pub accessed: bool,
    pub modified: bool,
    /// Number of cached children currently pinning this slot (only
    /// meaningful for depth 0/1 nodes).
    pub ref_cnt: u32,
}

impl FbufSlot {
    fn empty() -> Self {
        Self {
            ma: None,
            data: vec![0u8; SECTOR_SIZE],
            sa: SECTOR_NULL,
            parent: None,
            accessed: false,
            modified: false,
            ref_cnt: 0,
        }
    }
}

/// Exactly one of `on-circular` / `on-indirect` holds for every occupied
/// slot; an empty slot is always treated as circular (candidate for reuse).
pub struct FbufCache {
    slots: Vec<FbufSlot>,
    index: HashMap<MetaAddr, usize>,
    circular: VecDeque<usize>,
    /// Pinned slots by depth (only depths 0 and 1 are ever parents).
    indirect: [Vec<usize>; 3],
}

impl FbufCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "fbuf cache needs at least one slot");
        let slots = (0..capacity).map(|_| FbufSlot::empty()).collect();
        let circular = (0..capacity).collect();
        Self {
            slots,
            index: HashMap::new(),
            circular,
            indirect: [Vec::new(), Vec::new(), Vec::new()],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Hash lookup. On hit, marks the slot accessed and returns its index.
    pub fn lookup(&mut self, ma: MetaAddr) -> Option<usize> {
        let idx = *self.index.get(&ma)?;
        self.slots[idx].accessed = true;
        Some(idx)
    }

    /// Hash lookup without side effects, for resolving a known-resident
    /// parent's slot index.
    pub fn slot_index(&self, ma: MetaAddr) -> Option<usize> {
        self.index.get(&ma).copied()
    }

    pub fn slot(&self, idx: usize) -> &FbufSlot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut FbufSlot {
        &mut self.slots[idx]
    }

    /// Second-chance scan: sweep the circular list clearing `accessed`
    /// until an unaccessed (or empty) slot is found, and return it without
    /// requeuing it. The caller is responsible for re-enqueuing the slot
    /// (via [`FbufCache::install`]) once it holds new content.
    pub fn pick_victim(&mut self) -> usize {
        loop {
            let idx = self
                .circular
                .pop_front()
                .expect("circular list exhausted: fbuf cache has no reusable slots");
            let slot = &mut self.slots[idx];
            if slot.ma.is_some() && slot.accessed {
                slot.accessed = false;
                self.circular.push_back(idx);
                continue;
            }
            return idx;
        }
    }

    /// Remove `idx`'s current tenant (if any) from the hash index. Returns
    /// the evicted MA so the caller can decide whether/how to flush it.
    pub fn evict_index(&mut self, idx: usize) -> Option<MetaAddr> {
        let ma = self.slots[idx].ma.take();
        if let Some(ma) = ma {
            self.index.remove(&ma);
        }
        ma
    }

    /// Place fresh content into a slot just returned by [`Self::pick_victim`]
    /// and enqueue it at the tail of the circular list.
    pub fn install(&mut self, idx: usize, ma: MetaAddr, data: Vec<u8>, sa: SectorAddr, parent: Option<MetaAddr>) {
        let slot = &mut self.slots[idx];
        slot.ma = Some(ma);
        slot.data = data;
        slot.sa = sa;
        slot.parent = parent;
        slot.accessed = true;
        slot.modified = false;
        slot.ref_cnt = 0;
        self.index.insert(ma, idx);
        self.circular.push_back(idx);
    }

    /// Pin `parent_idx` because one of its children was just loaded: move
    /// it from the circular list to its depth's indirect list the first
    /// time, and bump its pin count.
    pub fn pin(&mut self, parent_idx: usize) {
        let slot = &mut self.slots[parent_idx];
        if slot.ref_cnt == 0 {
            let depth = slot.ma.expect("pinned slot must be occupied").depth as usize;
            if let Some(pos) = self.circular.iter().position(|&i| i == parent_idx) {
                self.circular.remove(pos);
            }
            self.indirect[depth].push(parent_idx);
        }
        slot.ref_cnt += 1;
    }

    /// Unpin `parent_idx` because one of its children was evicted. When the
    /// pin count reaches zero, demote it back to the tail of the circular
    /// list with `accessed = false`.
    pub fn unpin(&mut self, parent_idx: usize) {
        let slot = &mut self.slots[parent_idx];
        debug_assert!(slot.ref_cnt > 0, "unpin called on a slot with no pins");
        slot.ref_cnt -= 1;
        if slot.ref_cnt == 0 {
            let depth = slot.ma.expect("unpinned slot must be occupied").depth as usize;
            if let Some(pos) = self.indirect[depth].iter().position(|&i| i == parent_idx) {
                self.indirect[depth].swap_remove(pos);
            }
            slot.accessed = false;
            self.circular.push_back(parent_idx);
        }
    }

    /// All occupied slot indices currently on the circular list (leaves and
    /// orphans): the first flush pass in `mod_flush`.
    pub fn circular_occupied(&self) -> Vec<usize> {
        self.circular
            .iter()
            .copied()
            .filter(|&i| self.slots[i].ma.is_some())
            .collect()
    }

    /// Pinned slot indices at `depth`, deepest-first overall via the
    /// caller iterating `depth` from 1 down to 0: the second flush pass.
    pub fn indirect_at(&self, depth: u8) -> &[usize] {
        &self.indirect[depth as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fd;

    #[test]
    fn fresh_slots_are_immediately_reusable() {
        let mut cache = FbufCache::new(4);
        let idx = cache.pick_victim();
        assert!(cache.slot(idx).ma.is_none());
    }

    #[test]
    fn hit_sets_accessed_and_avoids_eviction() {
        let mut cache = FbufCache::new(2);
        let ma = MetaAddr::new(Fd::Active, 2, 0);
        let idx = cache.pick_victim();
        cache.install(idx, ma, vec![0; SECTOR_SIZE], 10, None);
        assert_eq!(cache.lookup(ma), Some(idx));
        assert!(cache.slot(idx).accessed);
    }

    #[test]
    fn accessed_slot_survives_one_sweep() {
        let mut cache = FbufCache::new(1);
        let ma = MetaAddr::new(Fd::Active, 2, 0);
        let idx = cache.pick_victim();
        cache.install(idx, ma, vec![0; SECTOR_SIZE], 10, None);
        // `install` marks accessed; with only one slot the sweep must
        // clear `accessed` and loop back around to it.
        let victim = cache.pick_victim();
        assert_eq!(victim, idx);
        assert!(!cache.slot(idx).accessed);
    }

    #[test]
    fn pin_moves_off_circular_and_unpin_returns_it() {
        let mut cache = FbufCache::new(3);
        let parent_ma = MetaAddr::new(Fd::Active, 0, 0);
        let parent_idx = cache.pick_victim();
        cache.install(parent_idx, parent_ma, vec![0; SECTOR_SIZE], 10, None);

        cache.pin(parent_idx);
        assert_eq!(cache.slot(parent_idx).ref_cnt, 1);
        assert_eq!(cache.indirect_at(0), &[parent_idx]);

        cache.unpin(parent_idx);
        assert_eq!(cache.slot(parent_idx).ref_cnt, 0);
        assert!(cache.indirect_at(0).is_empty());
        // Back on the circular list, so pick_victim can reach it again.
        assert!(!cache.slot(parent_idx).accessed);
    }

    #[test]
    fn evict_index_clears_hash_lookup() {
        let mut cache = FbufCache::new(2);
        let ma = MetaAddr::new(Fd::Active, 2, 0);
        let idx = cache.pick_victim();
        cache.install(idx, ma, vec![0; SECTOR_SIZE], 10, None);
        assert_eq!(cache.evict_index(idx), Some(ma));
        assert_eq!(cache.lookup(ma), None);
    }
}
