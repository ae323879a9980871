use crate::allocator::EvictionBuffer;
use crate::cache_line::CacheLine;
use crate::config::BuildConfig;
use crate::geometry::CacheGeometry;
use std::sync::Arc;

/// Lines that, accessed together, evict some target from one cache level.
///
/// A set keeps the buffer its lines live in alive and carries a private copy
/// of the configuration it was built with, so callers can tune it without
/// touching the defaults.
#[derive(Clone, Debug)]
pub struct EvictionSet {
    lines: Vec<CacheLine>,
    cap: usize,
    buffer: Arc<EvictionBuffer>,
    geometry: CacheGeometry,
    config: BuildConfig,
}

impl EvictionSet {
    pub fn new(config: BuildConfig, geometry: CacheGeometry, buffer: Arc<EvictionBuffer>) -> Self {
        let cap = config.algo.cap_scaling * geometry.n_ways;
        Self {
            lines: Vec::with_capacity(cap),
            cap,
            buffer,
            geometry,
            config,
        }
    }

    /// The same set with every line moved to `offset` within its page.
    pub fn shift(&self, offset: usize) -> Self {
        Self {
            lines: self
                .lines
                .iter()
                .map(|line| line.with_page_offset(offset))
                .collect(),
            ..self.clone()
        }
    }

    pub fn lines(&self) -> &[CacheLine] {
        &self.lines
    }

    pub(crate) fn lines_mut(&mut self) -> &mut [CacheLine] {
        &mut self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn is_full(&self) -> bool {
        self.lines.len() >= self.cap
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut BuildConfig {
        &mut self.config
    }

    pub fn buffer(&self) -> &Arc<EvictionBuffer> {
        &self.buffer
    }

    pub(crate) fn set_lines(&mut self, lines: &[CacheLine]) {
        self.lines.clear();
        self.lines.extend_from_slice(&lines[..lines.len().min(self.cap)]);
    }

    pub(crate) fn push(&mut self, line: CacheLine) {
        if !self.is_full() {
            self.lines.push(line);
        }
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        self.lines.truncate(len);
    }

    /// Stores `target` as the first line, moving the old first line to the
    /// end.
    pub(crate) fn insert_front(&mut self, target: CacheLine) {
        if self.is_full() {
            return;
        }
        match self.lines.first().copied() {
            Some(first) => {
                self.lines.push(first);
                self.lines[0] = target;
            }
            None => self.lines.push(target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlgoConfig;
    use crate::geometry::PageKind;
    use crate::PAGE_SIZE;
    use proptest::prelude::*;

    fn set_of(n: usize, cap_scaling: usize) -> EvictionSet {
        let buffer = EvictionBuffer::allocate(n, PageKind::Base).unwrap();
        let config = BuildConfig {
            algo: AlgoConfig {
                cap_scaling,
                ..AlgoConfig::default()
            },
            ..BuildConfig::default()
        };
        let lines: Vec<_> = (0..n)
            .map(|i| CacheLine::from_addr(buffer.base() as usize + i * PAGE_SIZE))
            .collect();
        let mut set = EvictionSet::new(config, CacheGeometry::new(1, 64, 4, 64), buffer);
        set.set_lines(&lines);
        set
    }

    #[test]
    fn capacity_bounds_the_lines() {
        let set = set_of(12, 2);
        assert_eq!(set.capacity(), 8);
        assert_eq!(set.len(), 8);
        assert!(set.is_full());
    }

    #[test]
    fn target_goes_first() {
        let mut set = set_of(3, 2);
        let first = set.lines()[0];
        let target = CacheLine::from_addr(0x1234_0000);
        set.insert_front(target);
        assert_eq!(set.lines()[0], target);
        assert_eq!(set.lines()[3], first);
    }

    proptest! {
        #[test]
        fn shift_moves_every_line_within_its_page(offset in 0usize..PAGE_SIZE) {
            let set = set_of(4, 1);
            let shifted = set.shift(offset);
            prop_assert_eq!(shifted.len(), set.len());
            for (a, b) in set.lines().iter().zip(shifted.lines()) {
                prop_assert_eq!(a.page(), b.page());
                prop_assert_eq!(b.page_offset(), offset);
                prop_assert_eq!((b.addr() - a.addr()) % PAGE_SIZE, offset % PAGE_SIZE);
            }
        }
    }
}
