#![allow(dead_code)]

use evset_rs::{
    BuildConfig, CacheGeometry, CacheLine, Engine, EvictionBuffer, PageKind, SimConfig,
    SimulatedCache, PAGE_SIZE,
};
use std::sync::Arc;

pub const OFFSET: usize = 0x40;

pub fn sim_engine(config: SimConfig) -> (Arc<SimulatedCache>, Engine<SimulatedCache>) {
    let sim = Arc::new(SimulatedCache::new(config));
    let engine = Engine::new(sim.clone(), sim.latencies());
    (sim, engine)
}

pub fn geometry(sim: &SimulatedCache, level: usize) -> CacheGeometry {
    sim.config().geometry(level).cloned().unwrap()
}

/// `n` target lines at `offset` on consecutive pages of their own buffer.
pub fn targets(n: usize, offset: usize) -> (Arc<EvictionBuffer>, Vec<CacheLine>) {
    let buffer = EvictionBuffer::allocate(n, PageKind::Base).unwrap();
    let lines = (0..n)
        .map(|i| CacheLine::from_addr(buffer.base() as usize + i * PAGE_SIZE + offset))
        .collect();
    (buffer, lines)
}

/// The L2 preset without a wall-clock budget and with room to retry.
pub fn l2_config(sim: &SimulatedCache) -> BuildConfig {
    let mut config = BuildConfig::l2(&sim.latencies());
    config.algo.retry_timeout = 0;
    config.algo.verify_retry = 10;
    config.algo.max_backtrack = 50;
    config
}
