//! The cache line is the smallest unit of granularity at which cache attacks
//! operate. This module provides [`CacheLine`], a copyable handle on the
//! address of one line that the search algorithms shuffle around while
//! partitioning candidate pools.
use crate::{PAGE_SHIFT, PAGE_SIZE};
use std::fmt;

/// A handle on a single cache line.
///
/// The handle only stores the address. Lines handed out by a
/// [`CandidatePool`](crate::CandidatePool) point into an
/// [`EvictionBuffer`](crate::EvictionBuffer) that is kept alive by the pool
/// and by every eviction set built from it. Lines created through
/// [`CacheLine::new`] must stay readable for as long as a hardware timer
/// probes them.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheLine(*mut u8);

// A line is just an address. Only the timers dereference it, and they only
// ever read through it.
unsafe impl Send for CacheLine {}
unsafe impl Sync for CacheLine {}

impl CacheLine {
    pub fn new(ptr: *mut u8) -> Self {
        Self(ptr)
    }

    /// Wraps a raw address. Useful for simulated timers that never touch
    /// memory.
    pub fn from_addr(addr: usize) -> Self {
        Self(addr as *mut u8)
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut u8 {
        self.0
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    /// The base address of the page containing this line.
    #[inline]
    pub fn page(self) -> usize {
        self.addr() & !((1usize << PAGE_SHIFT) - 1)
    }

    #[inline]
    pub fn page_offset(self) -> usize {
        self.addr() & (PAGE_SIZE - 1)
    }

    /// The same page at a different page offset.
    #[inline]
    pub fn with_page_offset(self, offset: usize) -> Self {
        Self::from_addr(self.page() + (offset & (PAGE_SIZE - 1)))
    }

    /// A line half a page away from this one. Loading it warms up the TLB
    /// entry of the page without touching the cache set of this line.
    #[inline]
    pub fn tlb_buddy(self) -> Self {
        self.with_page_offset(self.page_offset() + PAGE_SIZE / 2)
    }
}

impl fmt::Debug for CacheLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

impl fmt::Pointer for CacheLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}
