//! The block-device adapter boundary.
//!
//! The core only requires fixed-size sector I/O; everything else (the
//! physical transport, raw-device ioctls, file-backed storage) is an
//! external collaborator per the purpose & scope. `BlockDevice` is the
//! trait the core is generic over, playing the role the teacher crate
//! gives to its own `BlockSet` trait.

use crate::prelude::*;
use crate::types::{SectorAddr, SECTOR_SIZE};

/// Fixed-size sector I/O consumed by the core.
///
/// Implementations are expected to be synchronous with respect to the
/// caller: once `write` returns `Ok`, the data has been issued to the
/// transport (not necessarily fsynced -- the core does not require
/// durability of an individual write, only of a flushed segment summary).
pub trait BlockDevice: Send + Sync {
    /// Read `buf.len() / SECTOR_SIZE` consecutive sectors starting at `sa`.
    fn read(&self, sa: SectorAddr, buf: &mut [u8]) -> Result<()>;

    /// Write `buf.len() / SECTOR_SIZE` consecutive sectors starting at `sa`.
    fn write(&self, sa: SectorAddr, buf: &[u8]) -> Result<()>;

    /// Total number of sectors available on the device.
    fn nsectors(&self) -> u32;
}

/// An in-memory [`BlockDevice`], used throughout the test suite the way the
/// teacher crate uses `MemDisk`.
pub struct MemDevice {
    sectors: spin::Mutex<Vec<u8>>,
    nsectors: u32,
}

impl MemDevice {
    pub fn create(nsectors: u32) -> Self {
        Self {
            sectors: spin::Mutex::new(vec![0u8; nsectors as usize * SECTOR_SIZE]),
            nsectors,
        }
    }
}

impl BlockDevice for MemDevice {
    fn read(&self, sa: SectorAddr, buf: &mut [u8]) -> Result<()> {
        check_bounds(sa, buf.len(), self.nsectors)?;
        let sectors = self.sectors.lock();
        let off = sa as usize * SECTOR_SIZE;
        buf.copy_from_slice(&sectors[off..off + buf.len()]);
        Ok(())
    }

    fn write(&self, sa: SectorAddr, buf: &[u8]) -> Result<()> {
        check_bounds(sa, buf.len(), self.nsectors)?;
        let mut sectors = self.sectors.lock();
        let off = sa as usize * SECTOR_SIZE;
        sectors[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn nsectors(&self) -> u32 {
        self.nsectors
    }
}

fn check_bounds(sa: SectorAddr, len: usize, nsectors: u32) -> Result<()> {
    if len % SECTOR_SIZE != 0 {
        return_errno_with_msg!(InvalidArgument, "buffer length is not sector-aligned");
    }
    let n = (len / SECTOR_SIZE) as u32;
    if sa.checked_add(n).map_or(true, |end| end > nsectors) {
        return_errno_with_msg!(InvalidArgument, "sector range out of device bounds");
    }
    Ok(())
}
