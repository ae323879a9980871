use crate::cache_line::CacheLine;
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::geometry::{CacheGeometry, PageKind};
use crate::{HUGE_PAGE_SIZE, PAGE_SIZE};
use log::debug;
use mmap_rs::{MmapMut, MmapOptions};
use std::fmt;
use std::sync::Arc;

enum Mapping {
    Base(MmapMut),
    #[cfg(target_os = "linux")]
    Huge(HugeMapping),
}

#[cfg(target_os = "linux")]
struct HugeMapping {
    ptr: *mut u8,
    len: usize,
}

#[cfg(target_os = "linux")]
impl HugeMapping {
    fn new(len: usize) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }
}

#[cfg(target_os = "linux")]
impl Drop for HugeMapping {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
    }
}

/// One large mapping that candidate lines are carved from.
///
/// Buffers are handed around as `Arc<EvictionBuffer>`: every pool and every
/// eviction set derived from a buffer holds a reference, and the mapping is
/// released when the last of them is dropped.
pub struct EvictionBuffer {
    base: *mut u8,
    n_pages: usize,
    page: PageKind,
    _mapping: Mapping,
}

// The buffer is only ever read through `CacheLine`s after population.
unsafe impl Send for EvictionBuffer {}
unsafe impl Sync for EvictionBuffer {}

/// Pages of `page` kind needed to hold `scaling` times as many candidates as
/// an eviction set for `geometry` could possibly need.
pub fn pages_needed(geometry: &CacheGeometry, scaling: f64, page: PageKind) -> usize {
    let n_cands = (geometry.uncertainty(page) * geometry.n_ways) as f64 * scaling;
    let n_cands = (n_cands as usize).max(1);
    match page {
        PageKind::Base => n_cands,
        PageKind::Huge => {
            let per_page = HUGE_PAGE_SIZE / unit_stride(geometry, page);
            (n_cands + per_page - 1) / per_page
        }
    }
}

fn unit_stride(geometry: &CacheGeometry, page: PageKind) -> usize {
    match page {
        PageKind::Base => PAGE_SIZE,
        PageKind::Huge => geometry.congruent_stride().clamp(PAGE_SIZE, HUGE_PAGE_SIZE),
    }
}

impl EvictionBuffer {
    pub fn allocate(n_pages: usize, page: PageKind) -> Result<Arc<Self>> {
        let len = n_pages.max(1) * page.size();
        let (base, mapping) = match page {
            PageKind::Base => {
                let mut map = MmapOptions::new(len)?.map_mut()?;
                (map.as_mut_ptr(), Mapping::Base(map))
            }
            #[cfg(target_os = "linux")]
            PageKind::Huge => {
                let map = HugeMapping::new(len)?;
                (map.ptr, Mapping::Huge(map))
            }
            #[cfg(not(target_os = "linux"))]
            PageKind::Huge => return Err(Error::InvalidConfig("huge pages need Linux")),
        };
        debug!("Mapped {} {:?} pages at {:p}", n_pages.max(1), page, base);

        Ok(Arc::new(Self {
            base,
            n_pages: n_pages.max(1),
            page,
            _mapping: mapping,
        }))
    }

    /// Allocates a buffer sized for building eviction sets of `geometry`.
    pub fn for_geometry(geometry: &CacheGeometry, config: &PoolConfig) -> Result<Arc<Self>> {
        if config.scaling <= 0.0 {
            return Err(Error::InvalidConfig("pool scaling must be positive"));
        }
        Self::allocate(pages_needed(geometry, config.scaling, config.page), config.page)
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn n_pages(&self) -> usize {
        self.n_pages
    }

    pub fn page_kind(&self) -> PageKind {
        self.page
    }

    pub fn len(&self) -> usize {
        self.n_pages * self.page.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, line: CacheLine) -> bool {
        let base = self.base as usize;
        line.addr() >= base && line.addr() < base + self.len()
    }
}

impl fmt::Debug for EvictionBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictionBuffer")
            .field("base", &self.base)
            .field("n_pages", &self.n_pages)
            .field("page", &self.page)
            .finish()
    }
}

/// Candidate lines at one page offset, drawn from a shared buffer.
///
/// The pool is the arena the search algorithms partition in place: they
/// only ever swap entries of [`CandidatePool::lines_mut`].
#[derive(Clone, Debug)]
pub struct CandidatePool {
    lines: Vec<CacheLine>,
    buffer: Arc<EvictionBuffer>,
    geometry: CacheGeometry,
}

impl CandidatePool {
    /// Lays one line at `offset` into every page (base pages) or every
    /// congruent stride (huge pages) of `buffer`, touching each of them so
    /// the OS backs the memory.
    pub fn populate(buffer: Arc<EvictionBuffer>, geometry: &CacheGeometry, offset: usize) -> Self {
        let offset = offset % PAGE_SIZE;
        let stride = unit_stride(geometry, buffer.page_kind());
        let n_units = buffer.len() / stride;

        let mut lines = Vec::with_capacity(n_units);
        for n in 0..n_units {
            let ptr = unsafe { buffer.base().add(n * stride + offset) };
            unsafe { ptr.write_volatile(n as u8) };
            lines.push(CacheLine::new(ptr));
        }

        Self {
            lines,
            buffer,
            geometry: geometry.clone(),
        }
    }

    /// The same pages at a different page offset.
    pub fn shift(&self, offset: usize) -> Self {
        Self {
            lines: self
                .lines
                .iter()
                .map(|line| line.with_page_offset(offset))
                .collect(),
            buffer: self.buffer.clone(),
            geometry: self.geometry.clone(),
        }
    }

    pub fn lines(&self) -> &[CacheLine] {
        &self.lines
    }

    pub fn lines_mut(&mut self) -> &mut [CacheLine] {
        &mut self.lines
    }

    pub fn truncate(&mut self, len: usize) {
        self.lines.truncate(len);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn buffer(&self) -> &Arc<EvictionBuffer> {
        &self.buffer
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    pub fn page_kind(&self) -> PageKind {
        self.buffer.page_kind()
    }

    pub fn uncertainty(&self) -> usize {
        self.geometry.uncertainty(self.page_kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l2() -> CacheGeometry {
        CacheGeometry::new(2, 64, 16, 1024)
    }

    #[test]
    fn buffer_is_sized_from_uncertainty() {
        assert_eq!(pages_needed(&l2(), 3.0, PageKind::Base), 16 * 16 * 3);
        // 48 candidates with a 64 KiB stride, 32 units per huge page.
        assert_eq!(pages_needed(&l2(), 3.0, PageKind::Huge), 2);

        // 44 candidates with a 128 KiB stride, 16 units per huge page.
        let llc = CacheGeometry::new(3, 64, 11, 2048 * 4).with_slices(4);
        assert_eq!(pages_needed(&llc, 1.0, PageKind::Huge), 3);
    }

    #[test]
    fn populate_one_line_per_page() {
        let buffer = EvictionBuffer::allocate(32, PageKind::Base).unwrap();
        let pool = CandidatePool::populate(buffer.clone(), &l2(), 0x140);

        assert_eq!(pool.len(), 32);
        assert_eq!(pool.uncertainty(), 16);
        for (i, line) in pool.lines().iter().enumerate() {
            assert_eq!(line.page_offset(), 0x140);
            assert_eq!(line.page(), buffer.base() as usize + i * PAGE_SIZE);
            assert!(buffer.contains(*line));
        }
    }

    #[test]
    fn shifted_pool_shares_the_buffer() {
        let buffer = EvictionBuffer::allocate(8, PageKind::Base).unwrap();
        let pool = CandidatePool::populate(buffer.clone(), &l2(), 0);
        let shifted = pool.shift(0x7c0);

        assert_eq!(Arc::strong_count(&buffer), 3);
        for (a, b) in pool.lines().iter().zip(shifted.lines()) {
            assert_eq!(a.page(), b.page());
            assert_eq!(b.addr() - a.addr(), 0x7c0);
        }

        drop(pool);
        drop(shifted);
        assert_eq!(Arc::strong_count(&buffer), 1);
    }

    #[test]
    fn non_positive_scaling_is_rejected() {
        let config = PoolConfig {
            scaling: 0.0,
            ..PoolConfig::default()
        };
        assert!(matches!(
            EvictionBuffer::for_geometry(&l2(), &config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
