//! Tunable knobs, threaded explicitly through `Core::open`/`Core::create`
//! rather than held in process-wide mutable state.

/// Size of the cleaner's sliding window of reclaim candidates.
pub const CLEAN_WINDOW: usize = 6;
/// A segment this old (in skipped reclaim passes) is force-cleaned instead
/// of being scored by liveness.
pub const CLEAN_AGE_LIMIT: u8 = 4;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Multiplier over the minimum fbuf slot count (`max_block_cnt / (S/4)`).
    pub cache_ratio: u32,
    /// Cleaner kicks in once `seg_free_cnt <= clean_low_water`.
    pub clean_low_water: i32,
    /// Cleaner runs to completion once `seg_free_cnt > clean_high_water`.
    pub clean_high_water: i32,
}

impl Default for Config {
    fn default() -> Self {
        let w = CLEAN_WINDOW as i32;
        Self {
            cache_ratio: 1,
            clean_low_water: 2 * w,
            clean_high_water: 4 * w,
        }
    }
}
