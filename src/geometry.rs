//! Descriptions of the cache hierarchy consumed by the engine.
//!
//! Detecting these values (CPUID leaves, latency calibration) happens
//! elsewhere. The engine only reads them.
use crate::{HUGE_PAGE_SHIFT, HUGE_PAGE_SIZE, PAGE_SHIFT, PAGE_SIZE};
use log::warn;

pub const CACHE_LINE_SIZE: usize = 64;

/// Ways of the Skylake-SP snoop filter. Ice Lake-SP has 16.
pub const SF_WAYS: usize = 12;

/// How much of a virtual address the allocator controls.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PageKind {
    #[default]
    Base,
    Huge,
}

impl PageKind {
    pub fn shift(self) -> u32 {
        match self {
            PageKind::Base => PAGE_SHIFT,
            PageKind::Huge => HUGE_PAGE_SHIFT,
        }
    }

    pub fn size(self) -> usize {
        match self {
            PageKind::Base => PAGE_SIZE,
            PageKind::Huge => HUGE_PAGE_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheGeometry {
    pub level: u32,
    pub line_size: usize,
    pub n_ways: usize,
    /// Sets per slice.
    pub n_sets: usize,
    pub n_slices: usize,
}

impl CacheGeometry {
    pub fn new(level: u32, line_size: usize, n_ways: usize, n_sets: usize) -> Self {
        if !line_size.is_power_of_two() {
            warn!("Cache line size: {} is not a power of 2", line_size);
        }
        if line_size != CACHE_LINE_SIZE {
            warn!(
                "Level {} cache has a line size of {}B while the default is {}B",
                level, line_size, CACHE_LINE_SIZE
            );
        }

        Self {
            level,
            line_size,
            n_ways,
            n_sets,
            n_slices: 1,
        }
    }

    /// Splits the sets of a sliced cache evenly among `n_slices` slices.
    pub fn with_slices(mut self, n_slices: usize) -> Self {
        let n_slices = n_slices.max(1);
        if self.n_sets % n_slices != 0 {
            warn!(
                "{} sets cannot be divided by {} slices, please double check the number of slices",
                self.n_sets, n_slices
            );
        }

        self.n_sets /= n_slices;
        self.n_slices = n_slices;
        if !self.n_sets.is_power_of_two() {
            warn!("Number of sets: {} is not a power of 2", self.n_sets);
        }
        self
    }

    pub fn num_cl_bits(&self) -> u32 {
        log2_ceil(self.line_size)
    }

    pub fn num_set_idx_bits(&self) -> u32 {
        log2_ceil(self.n_sets)
    }

    /// Total capacity in bytes.
    pub fn size(&self) -> usize {
        self.line_size * self.n_sets * self.n_slices * self.n_ways
    }

    /// Number of distinct (slice, set) pairs a line at a fixed page offset
    /// may map to.
    pub fn uncertainty(&self, page: PageKind) -> usize {
        let set_bits_under_ctrl = page.shift().saturating_sub(self.num_cl_bits());
        let set_idx_bits = self.num_set_idx_bits();
        if set_bits_under_ctrl >= set_idx_bits {
            self.n_slices
        } else {
            (1usize << (set_idx_bits - set_bits_under_ctrl)) * self.n_slices
        }
    }

    /// Distance between two addresses that always share a set index.
    pub fn congruent_stride(&self) -> usize {
        1usize << (self.num_set_idx_bits() + self.num_cl_bits())
    }
}

pub fn log2_ceil(value: usize) -> u32 {
    if value <= 1 {
        0
    } else {
        usize::BITS - (value - 1).leading_zeros()
    }
}

/// Measured load latencies (in timer units) and the thresholds derived from
/// them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CacheLatencies {
    pub l1d: u64,
    pub l2: u64,
    pub l3: u64,
    pub dram: u64,
    pub l1d_thresh: u64,
    pub l2_thresh: u64,
    pub l3_thresh: u64,
    /// Anything slower than this was disturbed by an interrupt.
    pub interrupt_thresh: u64,
}

impl CacheLatencies {
    pub fn from_levels(l1d: u64, l2: u64, l3: u64, dram: u64, interrupt_thresh: u64) -> Self {
        Self {
            l1d,
            l2,
            l3,
            dram,
            l1d_thresh: hit_threshold(l1d, l2),
            l2_thresh: hit_threshold(l2, l3),
            l3_thresh: hit_threshold(l3, dram),
            interrupt_thresh,
        }
    }

    /// Checks that every level is slower than the one above it and that the
    /// interrupt threshold sits above DRAM.
    pub fn sanity_check(&self) -> bool {
        self.l1d < self.l2
            && self.l2 < self.l3
            && self.l3 < self.dram
            && self.dram < self.interrupt_thresh
            && self.l1d_thresh < self.l2_thresh
            && self.l2_thresh < self.l3_thresh
    }
}

pub fn hit_threshold(hit: u64, miss: u64) -> u64 {
    (3 * hit + 2 * miss) / 5
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn skx_l2() -> CacheGeometry {
        CacheGeometry::new(2, 64, 16, 1024)
    }

    #[test]
    fn l1d_is_fully_controlled() {
        let l1d = CacheGeometry::new(1, 64, 8, 64);
        assert_eq!(l1d.uncertainty(PageKind::Base), 1);
        assert_eq!(l1d.congruent_stride(), PAGE_SIZE);
    }

    #[test]
    fn l2_uncertainty() {
        let l2 = skx_l2();
        assert_eq!(l2.num_set_idx_bits(), 10);
        assert_eq!(l2.uncertainty(PageKind::Base), 16);
        assert_eq!(l2.uncertainty(PageKind::Huge), 1);
        assert_eq!(l2.congruent_stride(), 64 * 1024);
    }

    #[test]
    fn sliced_llc_uncertainty() {
        let l3 = CacheGeometry::new(3, 64, 11, 2048 * 28).with_slices(28);
        assert_eq!(l3.n_sets, 2048);
        assert_eq!(l3.uncertainty(PageKind::Base), 32 * 28);
        assert_eq!(l3.uncertainty(PageKind::Huge), 28);
    }

    #[test]
    fn thresholds_sit_between_levels() {
        let lats = CacheLatencies::from_levels(4, 14, 50, 200, 1000);
        assert!(lats.sanity_check());
        assert!(lats.l1d_thresh > lats.l1d && lats.l1d_thresh < lats.l2);
        assert!(lats.l3_thresh > lats.l3 && lats.l3_thresh < lats.dram);
    }

    proptest! {
        #[test]
        fn uncertainty_times_stride(set_bits in 0u32..14, slices in 1usize..32) {
            let geometry = CacheGeometry::new(2, 64, 8, 1 << set_bits);
            let geometry = CacheGeometry { n_slices: slices, ..geometry };
            let per_slice = geometry.uncertainty(PageKind::Base) / slices;
            // Every page-sized step covers one uncontrolled set index.
            prop_assert_eq!(per_slice * PAGE_SIZE.min(geometry.congruent_stride()),
                            geometry.congruent_stride());
        }
    }
}
