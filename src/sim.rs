//! A software model of a cache hierarchy that implements [`Timer`].
//!
//! Each level is a set-associative cache with LRU replacement. A load walks
//! the levels from the top, promotes the line in the first level that holds
//! it and fills every level above. Levels below are not touched, so an L1 hit
//! does not refresh the line's age in L2 or L3.
//!
//! The model is deterministic unless noise is configured, which makes it the
//! backend for testing the search algorithms. It also answers which
//! `(slice, set)` a line maps to, the way a physical-address oracle would on
//! real hardware.
use crate::cache_line::CacheLine;
use crate::geometry::{CacheGeometry, CacheLatencies};
use crate::timer::{Timer, Timing};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

// Per-slice-bit masks, applied to the address bits right above the set index.
const SLICE_MASKS: [usize; 4] = [0x6d5b, 0x3ab7, 0x5cd9, 0x1e6b];

const INTERRUPT_LATENCY: u64 = 50_000;

#[derive(Clone, Debug)]
pub struct SimConfig {
    levels: Vec<(CacheGeometry, u64)>,
    dram: u64,
    interrupt_thresh: u64,
    silent_probes: bool,
    interrupt_every: Option<u64>,
    migrate_every: Option<u64>,
    flip_rate: f64,
    seed: u64,
}

impl Default for SimConfig {
    /// A small three-level hierarchy: 32 KiB 8-way L1D, 256 KiB 16-way L2
    /// and a 1.5 MiB 24-way L3 split into two slices. Every level has more
    /// ways than the one above, so sweeping a minimal set for one level
    /// always misses in the levels above it.
    fn default() -> Self {
        Self::new(200)
            .level(CacheGeometry::new(1, 64, 8, 64), 4)
            .level(CacheGeometry::new(2, 64, 16, 256), 14)
            .level(CacheGeometry::new(3, 64, 24, 1024).with_slices(2), 40)
    }
}

impl SimConfig {
    pub fn new(dram: u64) -> Self {
        Self {
            levels: vec![],
            dram,
            interrupt_thresh: 1000,
            silent_probes: false,
            interrupt_every: None,
            migrate_every: None,
            flip_rate: 0.0,
            seed: 0,
        }
    }

    /// Adds a level below the existing ones.
    pub fn level(mut self, geometry: CacheGeometry, latency: u64) -> Self {
        self.levels.push((geometry, latency));
        self
    }

    /// Timed loads that hit leave the replacement state untouched, like a
    /// probe served by a private cache that the measured level never sees.
    pub fn silent_probes(mut self, silent: bool) -> Self {
        self.silent_probes = silent;
        self
    }

    /// Every `n`-th timed load reports an interrupt-sized latency.
    pub fn interrupt_every(mut self, n: u64) -> Self {
        self.interrupt_every = Some(n.max(1));
        self
    }

    /// Every `n`-th timed load retires on a different core.
    pub fn migrate_every(mut self, n: u64) -> Self {
        self.migrate_every = Some(n.max(1));
        self
    }

    /// Reports the opposite hit/miss class for a fraction of timed loads.
    pub fn flip_rate(mut self, rate: f64, seed: u64) -> Self {
        self.flip_rate = rate.clamp(0.0, 1.0);
        self.seed = seed;
        self
    }

    pub fn geometry(&self, level: usize) -> Option<&CacheGeometry> {
        self.levels.get(level).map(|(geometry, _)| geometry)
    }

    /// Latencies and thresholds matching this hierarchy.
    pub fn latencies(&self) -> CacheLatencies {
        let lat = |i: usize| self.levels.get(i).map(|(_, lat)| *lat);
        let l1d = lat(0).unwrap_or(1);
        let l2 = lat(1).unwrap_or(self.dram);
        let l3 = lat(2).unwrap_or(self.dram);
        CacheLatencies::from_levels(l1d, l2, l3, self.dram, self.interrupt_thresh)
    }
}

struct Level {
    geometry: CacheGeometry,
    latency: u64,
    sets: Vec<VecDeque<usize>>,
}

impl Level {
    fn new(geometry: CacheGeometry, latency: u64) -> Self {
        let n_sets = geometry.n_sets * geometry.n_slices;
        Self {
            geometry,
            latency,
            sets: vec![VecDeque::new(); n_sets],
        }
    }

    fn locate(&self, addr: usize) -> (usize, usize) {
        let cl_bits = self.geometry.num_cl_bits();
        let set_bits = self.geometry.num_set_idx_bits();
        let set = (addr >> cl_bits) & (self.geometry.n_sets - 1);

        let upper = addr >> (cl_bits + set_bits);
        let mut slice = 0;
        let slice_bits = crate::geometry::log2_ceil(self.geometry.n_slices) as usize;
        for (bit, mask) in SLICE_MASKS.iter().enumerate().take(slice_bits) {
            slice |= (((upper & mask).count_ones() & 1) as usize) << bit;
        }

        (slice % self.geometry.n_slices, set)
    }

    fn set_mut(&mut self, addr: usize) -> &mut VecDeque<usize> {
        let (slice, set) = self.locate(addr);
        let index = slice * self.geometry.n_sets + set;
        &mut self.sets[index]
    }

    fn tag(&self, addr: usize) -> usize {
        addr >> self.geometry.num_cl_bits()
    }

    fn contains(&self, addr: usize) -> bool {
        let (slice, set) = self.locate(addr);
        let tag = self.tag(addr);
        self.sets[slice * self.geometry.n_sets + set].contains(&tag)
    }

    fn touch(&mut self, addr: usize) -> bool {
        let tag = self.tag(addr);
        let set = self.set_mut(addr);
        match set.iter().position(|&t| t == tag) {
            Some(pos) => {
                set.remove(pos);
                set.push_front(tag);
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, addr: usize) {
        let tag = self.tag(addr);
        let n_ways = self.geometry.n_ways;
        let set = self.set_mut(addr);
        set.push_front(tag);
        set.truncate(n_ways);
    }

    fn remove(&mut self, addr: usize) {
        let tag = self.tag(addr);
        self.set_mut(addr).retain(|&t| t != tag);
    }
}

struct State {
    levels: Vec<Level>,
    core: u32,
    timed: u64,
    loads: u64,
    rng: StdRng,
}

impl State {
    fn load(&mut self, addr: usize, dram: u64) -> u64 {
        self.loads += 1;
        let hit = self
            .levels
            .iter_mut()
            .position(|level| level.touch(addr));

        let fill_upto = hit.unwrap_or(self.levels.len());
        for level in &mut self.levels[..fill_upto] {
            level.insert(addr);
        }

        match hit {
            Some(i) => self.levels[i].latency,
            None => dram,
        }
    }

    fn peek(&self, addr: usize) -> Option<u64> {
        self.levels
            .iter()
            .find(|level| level.contains(addr))
            .map(|level| level.latency)
    }
}

pub struct SimulatedCache {
    config: SimConfig,
    state: Mutex<State>,
}

impl SimulatedCache {
    pub fn new(config: SimConfig) -> Self {
        let levels = config
            .levels
            .iter()
            .map(|(geometry, latency)| Level::new(geometry.clone(), *latency))
            .collect();

        let state = State {
            levels,
            core: 0,
            timed: 0,
            loads: 0,
            rng: StdRng::seed_from_u64(config.seed),
        };

        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn latencies(&self) -> CacheLatencies {
        self.config.latencies()
    }

    /// The `(slice, set)` a line maps to at `level` (0 is the top level).
    pub fn locate(&self, level: usize, line: CacheLine) -> Option<(usize, usize)> {
        self.state()
            .levels
            .get(level)
            .map(|level| level.locate(line.addr()))
    }

    /// Whether two lines compete for the same set at `level`.
    pub fn congruent(&self, level: usize, a: CacheLine, b: CacheLine) -> bool {
        match (self.locate(level, a), self.locate(level, b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Whether `line` currently resides anywhere in the hierarchy.
    pub fn is_cached(&self, line: CacheLine) -> bool {
        self.state().peek(line.addr()).is_some()
    }

    /// Total number of loads served so far, timed or not.
    pub fn loads(&self) -> u64 {
        self.state().loads
    }
}

impl Timer for SimulatedCache {
    fn load(&self, line: CacheLine) {
        let dram = self.config.dram;
        self.state().load(line.addr(), dram);
    }

    fn flush(&self, line: CacheLine) {
        for level in self.state().levels.iter_mut() {
            level.remove(line.addr());
        }
    }

    fn fence(&self) {}

    fn core_tag(&self) -> u32 {
        self.state().core
    }

    fn time_load(&self, line: CacheLine) -> Timing {
        let dram = self.config.dram;
        let mut state = self.state();
        state.timed += 1;
        let timed = state.timed;

        let cached = state.peek(line.addr());
        let mut cycles = match cached {
            Some(latency) if self.config.silent_probes => {
                state.loads += 1;
                latency
            }
            _ => state.load(line.addr(), dram),
        };

        if self.config.flip_rate > 0.0 && state.rng.gen_bool(self.config.flip_rate) {
            let slowest_hit = state.levels.last().map(|l| l.latency).unwrap_or(dram);
            cycles = if cycles >= dram {
                state.levels.first().map(|l| l.latency).unwrap_or(0)
            } else if cycles <= slowest_hit {
                dram
            } else {
                cycles
            };
        }

        if matches!(self.config.interrupt_every, Some(n) if timed % n == 0) {
            cycles = INTERRUPT_LATENCY;
        }

        if matches!(self.config.migrate_every, Some(n) if timed % n == 0) {
            state.core ^= 1;
        }

        Timing {
            cycles,
            core: state.core,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    fn line(addr: usize) -> CacheLine {
        CacheLine::from_addr(addr)
    }

    #[test]
    fn hit_latency_follows_the_level() {
        let sim = SimulatedCache::new(SimConfig::default());
        let target = line(0x100_0040);

        assert_eq!(sim.time_load(target).cycles, 200);
        assert_eq!(sim.time_load(target).cycles, 4);

        sim.flush(target);
        assert!(!sim.is_cached(target));
        assert_eq!(sim.time_load(target).cycles, 200);
    }

    #[test]
    fn lru_evicts_after_ways_congruent_loads() {
        let sim = SimulatedCache::new(SimConfig::new(200).level(CacheGeometry::new(1, 64, 4, 64), 4));
        let target = line(0x10_0000);
        sim.load(target);

        for i in 1..4 {
            sim.load(line(0x10_0000 + i * PAGE_SIZE));
        }
        assert!(sim.is_cached(target));

        sim.load(line(0x10_0000 + 4 * PAGE_SIZE));
        assert!(!sim.is_cached(target));
    }

    #[test]
    fn l1_hits_do_not_refresh_l2() {
        let sim = SimulatedCache::new(
            SimConfig::new(200)
                .level(CacheGeometry::new(1, 64, 2, 64), 4)
                .level(CacheGeometry::new(2, 64, 2, 64), 14),
        );
        let a = line(0x20_0000);
        let b = line(0x20_0000 + PAGE_SIZE);
        let c = line(0x20_0000 + 2 * PAGE_SIZE);

        sim.load(a);
        sim.load(b);
        // L1 hit on `a`; the L2 still considers it the oldest line.
        sim.load(a);
        sim.load(c);

        let state = sim.state();
        assert!(state.levels[0].contains(a.addr()));
        assert!(!state.levels[1].contains(a.addr()));
    }

    #[test]
    fn silent_probes_keep_age() {
        let sim = SimulatedCache::new(
            SimConfig::new(200)
                .level(CacheGeometry::new(1, 64, 2, 64), 4)
                .silent_probes(true),
        );
        let a = line(0x30_0000);
        sim.load(a);
        sim.load(line(0x30_0000 + PAGE_SIZE));
        assert_eq!(sim.time_load(a).cycles, 4);

        sim.load(line(0x30_0000 + 2 * PAGE_SIZE));
        assert!(!sim.is_cached(a));
    }

    #[test]
    fn slices_split_congruent_pages() {
        let sim = SimulatedCache::new(SimConfig::default());
        let slices: std::collections::HashSet<_> = (0..64)
            .map(|i| sim.locate(2, line(0x4000_0000 + i * 0x8000)).map(|(slice, _)| slice))
            .collect();
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn noise_is_injected_on_schedule() {
        let sim = SimulatedCache::new(SimConfig::default().interrupt_every(3).migrate_every(2));
        let target = line(0x50_0000);
        let before = sim.core_tag();

        let t1 = sim.time_load(target);
        let t2 = sim.time_load(target);
        let t3 = sim.time_load(target);

        assert_eq!(t1.core, before);
        assert_ne!(t2.core, before);
        assert_eq!(t3.cycles, INTERRUPT_LATENCY);
    }
}
