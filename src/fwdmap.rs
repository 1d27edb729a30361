//! Forward-map operations: resolving and updating `(fd, BA) -> SA` through
//! the fbuf cache, and the ranged-read coalescing path.

use crate::core::Core;
use crate::prelude::*;
use crate::types::{
    leaf_addr, leaf_coords, read_u32_le, write_u32_le, BlockAddr, Fd, MetaAddr, SectorAddr,
    SECTOR_DELETE, SECTOR_NULL, SECTOR_SIZE,
};

impl Core {
    /// Resolve the current SA mapped to `ba` in the `active` forward map.
    pub(crate) fn fwd_get(&mut self, ba: BlockAddr) -> Result<SectorAddr> {
        let leaf_ma = leaf_addr(Fd::Active, ba);
        let idx = self.ensure_loaded(leaf_ma)?;
        let (_, offset) = leaf_coords(ba);
        let slot = self.cache.slot(idx);
        Ok(read_u32_le(&slot.data, offset as usize * 4))
    }

    /// Store `sa` as the mapping for `ba`, marking the owning leaf dirty.
    pub(crate) fn fwd_put(&mut self, ba: BlockAddr, sa: SectorAddr) -> Result<()> {
        let leaf_ma = leaf_addr(Fd::Active, ba);
        let idx = self.ensure_loaded(leaf_ma)?;
        let (_, offset) = leaf_coords(ba);
        let slot = self.cache.slot_mut(idx);
        write_u32_le(&mut slot.data, offset as usize * 4, sa);
        slot.modified = true;
        slot.accessed = true;
        Ok(())
    }

    /// Read `n` sectors starting at `ba`: resolve each entry, coalesce
    /// contiguous physical runs into a single device read, and zero-fill
    /// holes (`SECTOR_NULL`/`SECTOR_DELETE`).
    pub(crate) fn fwd_read_range(&mut self, ba: BlockAddr, n: u32) -> Result<Vec<u8>> {
        let mut sas = Vec::with_capacity(n as usize);
        for i in 0..n {
            sas.push(self.fwd_get(ba + i)?);
        }
        let mut out = vec![0u8; n as usize * SECTOR_SIZE];
        let mut i = 0usize;
        while i < sas.len() {
            let sa = sas[i];
            if sa == SECTOR_NULL || sa == SECTOR_DELETE {
                i += 1;
                continue;
            }
            let mut j = i + 1;
            while j < sas.len() && sas[j] == sa + (j - i) as u32 {
                j += 1;
            }
            let run_len = j - i;
            let mut buf = vec![0u8; run_len * SECTOR_SIZE];
            self.device.read(sa, &mut buf)?;
            out[i * SECTOR_SIZE..j * SECTOR_SIZE].copy_from_slice(&buf);
            i = j;
        }
        Ok(out)
    }

    /// Resolve an MA to its current SA, the way the cleaner checks
    /// liveness: depth 0 lives in the superblock root table, depth 1/2
    /// are read out of their parent's data block.
    pub(crate) fn resolve_ma(&mut self, ma: MetaAddr) -> Result<SectorAddr> {
        if ma.depth == 0 {
            return Ok(self.superblock.ftab[ma.fd as usize]);
        }
        let parent_ma = ma.parent();
        let parent_idx = self.ensure_loaded(parent_ma)?;
        let offset = ma.offset_in_parent();
        let slot = self.cache.slot(parent_idx);
        Ok(read_u32_le(&slot.data, offset as usize * 4))
    }

    /// Get `target`'s cache slot, loading it (and pinning its ancestry) on
    /// a miss. The parent pin always precedes the child's load so the
    /// replacement routine can never pick the parent as its own child's
    /// victim.
    pub(crate) fn ensure_loaded(&mut self, target: MetaAddr) -> Result<usize> {
        if let Some(idx) = self.cache.lookup(target) {
            return Ok(idx);
        }
        if target.depth == 0 {
            let sa = self.superblock.ftab[target.fd as usize];
            return self.load_node(target, sa, None);
        }
        let parent_ma = target.parent();
        let parent_idx = self.ensure_loaded(parent_ma)?;
        self.cache.pin(parent_idx);
        let offset = target.offset_in_parent();
        let sa = {
            let parent_slot = self.cache.slot(parent_idx);
            read_u32_le(&parent_slot.data, offset as usize * 4)
        };
        self.load_node(target, sa, Some(parent_ma))
    }

    /// Acquire a slot for `ma` via the replacement routine and populate it
    /// (zero-initialized for a not-yet-created node, or read from `sa`).
    fn load_node(&mut self, ma: MetaAddr, sa: SectorAddr, parent: Option<MetaAddr>) -> Result<usize> {
        let idx = self.fbuf_alloc()?;
        let data = if sa == SECTOR_NULL {
            vec![0u8; SECTOR_SIZE]
        } else {
            let mut buf = vec![0u8; SECTOR_SIZE];
            self.device.read(sa, &mut buf)?;
            buf
        };
        self.cache.install(idx, ma, data, sa, parent);
        Ok(idx)
    }

    /// Second-chance replacement: pick a victim slot, flushing it if dirty
    /// and detaching it from its parent's pin count.
    fn fbuf_alloc(&mut self) -> Result<usize> {
        let idx = self.cache.pick_victim();
        if self.cache.slot(idx).ma.is_some() {
            if self.cache.slot(idx).modified {
                self.flush_node(idx)?;
            }
            let old_parent = self.cache.slot(idx).parent;
            self.cache.evict_index(idx);
            if let Some(old_parent_ma) = old_parent {
                if let Some(parent_idx) = self.cache.slot_index(old_parent_ma) {
                    self.cache.unpin(parent_idx);
                }
            }
        }
        Ok(idx)
    }

    /// Append a dirty node to the cold stream and propagate its new SA
    /// into its parent (or the superblock root table for a depth-0 node).
    pub(crate) fn flush_node(&mut self, idx: usize) -> Result<()> {
        let (ma, data, parent) = {
            let slot = self.cache.slot(idx);
            let ma = slot.ma.expect("flush_node called on an empty slot");
            (ma, slot.data.clone(), slot.parent)
        };
        let sa = self.append_cold(ma.encode(), &data)?;
        if ma.depth == 0 {
            self.superblock.ftab[ma.fd as usize] = sa;
            self.sb_dirty = true;
        } else {
            let parent_ma = parent.expect("a non-root node must have a parent");
            let parent_idx = self
                .cache
                .slot_index(parent_ma)
                .expect("parent must be resident while its child is pinned");
            let offset = ma.offset_in_parent();
            let parent_slot = self.cache.slot_mut(parent_idx);
            write_u32_le(&mut parent_slot.data, offset as usize * 4, sa);
            parent_slot.modified = true;
        }
        let slot = self.cache.slot_mut(idx);
        slot.sa = sa;
        slot.modified = false;
        Ok(())
    }

    /// Flush every dirty node, child before parent: first the circular
    /// list (leaves and unpinned orphans), then the pinned lists from
    /// depth 1 down to depth 0.
    pub(crate) fn mod_flush(&mut self) -> Result<()> {
        for idx in self.cache.circular_occupied() {
            if self.cache.slot(idx).modified {
                self.flush_node(idx)?;
            }
        }
        for depth in (0..=1u8).rev() {
            let pinned: Vec<usize> = self.cache.indirect_at(depth).to_vec();
            for idx in pinned {
                if self.cache.slot(idx).modified {
                    self.flush_node(idx)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::MemDevice;
    use crate::types::SEG_SIZE;
    use std::sync::Arc;

    #[test]
    fn fresh_map_entry_is_null() {
        let dev = Arc::new(MemDevice::create(SEG_SIZE * 8));
        let mut core = Core::create(dev, Config::default()).unwrap();
        assert_eq!(core.fwd_get(0).unwrap(), SECTOR_NULL);
    }

    #[test]
    fn put_then_get_round_trips_without_flush() {
        let dev = Arc::new(MemDevice::create(SEG_SIZE * 8));
        let mut core = Core::create(dev, Config::default()).unwrap();
        core.fwd_put(42, 999).unwrap();
        assert_eq!(core.fwd_get(42).unwrap(), 999);
    }

    #[test]
    fn entries_across_leaves_are_independent() {
        let dev = Arc::new(MemDevice::create(SEG_SIZE * 8));
        let mut core = Core::create(dev, Config::default()).unwrap();
        core.fwd_put(0, 111).unwrap();
        core.fwd_put(2000, 222).unwrap();
        assert_eq!(core.fwd_get(0).unwrap(), 111);
        assert_eq!(core.fwd_get(2000).unwrap(), 222);
    }

    #[test]
    fn mod_flush_persists_root_table() {
        let dev = Arc::new(MemDevice::create(SEG_SIZE * 8));
        let mut core = Core::create(dev, Config::default()).unwrap();
        core.fwd_put(7, 123).unwrap();
        assert_eq!(core.superblock.ftab[Fd::Active as usize], SECTOR_NULL);
        core.mod_flush().unwrap();
        assert_ne!(core.superblock.ftab[Fd::Active as usize], SECTOR_NULL);
    }
}
