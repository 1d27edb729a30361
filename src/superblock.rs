//! The superblock ring: generation-numbered rotation of the root state
//! across the first segment, for atomic-enough root commit and crash
//! recovery.

use crate::device::BlockDevice;
use crate::prelude::*;
use crate::types::{SectorAddr, SECTOR_SIZE, SEG_DATA_START, SEG_SIZE, FD_COUNT};

const MAGIC: u32 = 0x4C4F_4753; // "LOGS"
const MAJOR: u8 = 1;
const MINOR: u8 = 0;
/// Fixed-size header preceding the trailing `seg_age` byte array:
/// magic(4) + major(1) + minor(1) + generation(2) + max_block_cnt(4)
/// + seg_cnt(4) + seg_free_cnt(4) + seg_alloc_p(4) + seg_reclaim_p(4)
/// + ftab(4 * FD_COUNT).
const HEADER_LEN: usize = 4 + 1 + 1 + 2 + 4 + 4 + 4 + 4 + 4 + 4 * FD_COUNT;

/// The root state of the log, persisted as one sector and rotated through
/// a ring of `SEG_SIZE` candidate slots in segment 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub generation: u16,
    pub max_block_cnt: u32,
    pub seg_cnt: i32,
    pub seg_free_cnt: i32,
    pub seg_alloc_p: i32,
    pub seg_reclaim_p: i32,
    /// Per-fd forward-map root SA (`base`, `active`, `delta`).
    pub ftab: [SectorAddr; FD_COUNT],
    pub seg_age: Vec<u8>,
    /// The sector this copy was read from / will be written to. In-memory only.
    pub sb_sa: SectorAddr,
}

impl Superblock {
    /// Build a fresh superblock for a device of `nsectors` sectors.
    pub fn format(nsectors: u32, generation: u16) -> Result<Self> {
        if nsectors < SEG_SIZE * 2 {
            return_errno_with_msg!(
                InvalidArgument,
                "device too small: need at least two segments"
            );
        }
        let seg_cnt = (nsectors / SEG_SIZE) as i32;
        if HEADER_LEN + seg_cnt as usize > SECTOR_SIZE {
            return_errno_with_msg!(InvalidArgument, "too many segments to fit seg_age in one sector");
        }
        let payload_sectors = (seg_cnt as u32 - SEG_DATA_START) as u64 * (SEG_SIZE - 1) as u64;
        // Cap by the forward-map tree's addressable range (index is 20 bits,
        // ENTRIES_PER_BLOCK entries per leaf).
        let tree_limit = (1u64 << 20) * crate::types::ENTRIES_PER_BLOCK as u64;
        let max_block_cnt = payload_sectors.min(tree_limit).max(1) as u32;

        Ok(Self {
            generation,
            max_block_cnt,
            seg_cnt,
            seg_free_cnt: seg_cnt - SEG_DATA_START as i32,
            seg_alloc_p: SEG_DATA_START as i32,
            seg_reclaim_p: SEG_DATA_START as i32,
            ftab: [crate::types::SECTOR_NULL; FD_COUNT],
            seg_age: vec![0u8; seg_cnt as usize],
            sb_sa: 0,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SECTOR_SIZE];
        let mut off = 0;
        buf[off..off + 4].copy_from_slice(&MAGIC.to_le_bytes());
        off += 4;
        buf[off] = MAJOR;
        off += 1;
        buf[off] = MINOR;
        off += 1;
        buf[off..off + 2].copy_from_slice(&self.generation.to_le_bytes());
        off += 2;
        buf[off..off + 4].copy_from_slice(&self.max_block_cnt.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.seg_cnt.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.seg_free_cnt.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.seg_alloc_p.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.seg_reclaim_p.to_le_bytes());
        off += 4;
        for sa in &self.ftab {
            buf[off..off + 4].copy_from_slice(&sa.to_le_bytes());
            off += 4;
        }
        debug_assert_eq!(off, HEADER_LEN);
        buf[off..off + self.seg_age.len()].copy_from_slice(&self.seg_age);
        buf
    }

    pub fn from_bytes(sb_sa: SectorAddr, buf: &[u8]) -> Result<Self> {
        if buf.len() != SECTOR_SIZE {
            return_errno_with_msg!(InvalidArgument, "superblock must be one sector");
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return_errno_with_msg!(FormatError, "bad superblock magic");
        }
        let major = buf[4];
        if major != MAJOR {
            return_errno_with_msg!(FormatError, "unsupported superblock major version");
        }
        let mut off = 6;
        let generation = u16::from_le_bytes(buf[off..off + 2].try_into().unwrap());
        off += 2;
        let max_block_cnt = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let seg_cnt = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let seg_free_cnt = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let seg_alloc_p = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let seg_reclaim_p = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let mut ftab = [0u32; FD_COUNT];
        for sa in ftab.iter_mut() {
            *sa = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
            off += 4;
        }
        debug_assert_eq!(off, HEADER_LEN);

        if seg_cnt < (SEG_DATA_START as i32 + 2)
            || HEADER_LEN + seg_cnt as usize > SECTOR_SIZE
            || seg_free_cnt < 0
            || seg_free_cnt > seg_cnt
            || seg_alloc_p < SEG_DATA_START as i32
            || seg_alloc_p >= seg_cnt
            || seg_reclaim_p < SEG_DATA_START as i32
            || seg_reclaim_p >= seg_cnt
        {
            return_errno_with_msg!(FormatError, "superblock fields out of range");
        }
        let seg_age = buf[off..off + seg_cnt as usize].to_vec();

        Ok(Self {
            generation,
            max_block_cnt,
            seg_cnt,
            seg_free_cnt,
            seg_alloc_p,
            seg_reclaim_p,
            ftab,
            seg_age,
            sb_sa,
        })
    }

    /// Scan the ring (sectors `[0, SEG_SIZE)`) for the most recent valid
    /// copy: read sequentially until the signature breaks or the
    /// generation isn't exactly `prev + 1` (mod 2^16); the last valid slot
    /// read is current.
    pub fn open(dev: &dyn BlockDevice) -> Result<Self> {
        let mut buf = vec![0u8; SECTOR_SIZE];
        let mut current: Option<Superblock> = None;
        for sa in 0..SEG_SIZE {
            dev.read(sa, &mut buf)?;
            let candidate = match Superblock::from_bytes(sa, &buf) {
                Ok(sb) => sb,
                Err(_) => break,
            };
            if let Some(prev) = &current {
                if candidate.generation != prev.generation.wrapping_add(1) {
                    break;
                }
            }
            current = Some(candidate);
        }
        current.ok_or_else(|| Error::with_msg(FormatError, "no valid superblock found"))
    }

    /// Write this superblock to the next ring slot with an incremented
    /// generation, and return the updated copy (the in-memory state the
    /// caller should keep using).
    pub fn persist(&self, dev: &dyn BlockDevice) -> Result<Superblock> {
        let next_sa = (self.sb_sa + 1) % SEG_SIZE;
        let mut next = self.clone();
        next.sb_sa = next_sa;
        next.generation = self.generation.wrapping_add(1);
        dev.write(next_sa, &next.to_bytes())?;
        Ok(next)
    }
}
