mod common;

use common::{geometry, l2_config, sim_engine, targets, OFFSET};
use evset_rs::{BuildConfig, Error, PageKind, PoolConfig, SimConfig, Verdict};
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn l3_pool_is_filtered_through_an_l2_set() {
    let (sim, mut engine) = sim_engine(SimConfig::default());
    let l2 = geometry(&sim, 1);
    let l3 = geometry(&sim, 2);
    let (_buf, t) = targets(1, OFFSET);

    let l2_set = Arc::new(engine.build(t[0], &l2_config(&sim), &l2, None).unwrap());
    let config = PoolConfig {
        scaling: 3.0,
        page: PageKind::Base,
        filter: Some(l2_set),
    };
    let pool = engine.candidate_pool(&l3, &config, None, OFFSET).unwrap();

    let unfiltered = l3.uncertainty(PageKind::Base) * l3.n_ways * 3;
    assert_eq!(pool.len(), unfiltered / l2.uncertainty(PageKind::Base));
    for line in pool.lines() {
        assert!(sim.congruent(1, t[0], *line));
    }
    assert!(engine.stats().snapshot().counters.population_ns > 0);
}

#[test]
fn filter_at_another_offset_leaves_nothing() {
    let (sim, mut engine) = sim_engine(SimConfig::default());
    let l2 = geometry(&sim, 1);
    let l3 = geometry(&sim, 2);
    let (_buf, t) = targets(1, OFFSET);

    let l2_set = Arc::new(engine.build(t[0], &l2_config(&sim), &l2, None).unwrap());
    let config = PoolConfig {
        scaling: 1.0,
        page: PageKind::Base,
        filter: Some(l2_set),
    };
    let res = engine.candidate_pool(&l3, &config, None, OFFSET + 0x400);
    assert!(matches!(res, Err(Error::NoCandidates)));
}

#[test]
fn l3_sets_are_built_from_a_filtered_pool() {
    let (sim, mut engine) = sim_engine(SimConfig::default());
    let lats = sim.latencies();
    let l2 = geometry(&sim, 1);
    let l3 = geometry(&sim, 2);
    let (_buf, t) = targets(1, OFFSET);

    let l2_set = Arc::new(engine.build(t[0], &l2_config(&sim), &l2, None).unwrap());
    let mut config = l2_config(&sim);
    config.pool.filter = Some(l2_set);
    config.test.lat_thresh = lats.l3_thresh;
    config.test_alt.lat_thresh = lats.l3_thresh;

    let mut pool = engine.candidate_pool(&l3, &config.pool, None, OFFSET).unwrap();
    let sets = engine
        .build_many_at(OFFSET, &config, &l3, Some(&mut pool), &[])
        .unwrap();
    assert_eq!(sets.len(), 4);

    let mut seen = HashSet::new();
    for set in &sets {
        let target = set.lines()[0];
        assert!(set.lines().iter().all(|l| sim.congruent(2, target, *l)));
        assert_eq!(engine.test_set(target, set).unwrap(), Verdict::Pos);
        assert!(seen.insert(sim.locate(2, target)));
    }
}

#[test]
fn shifted_pool_keeps_pages_and_buffer() {
    let (sim, engine) = sim_engine(SimConfig::default());
    let l2 = geometry(&sim, 1);
    let pool = engine
        .candidate_pool(&l2, &BuildConfig::l2(&sim.latencies()).pool, None, OFFSET)
        .unwrap();
    let shifted = pool.shift(0x100);

    assert_eq!(shifted.len(), pool.len());
    assert!(Arc::ptr_eq(shifted.buffer(), pool.buffer()));
    for (a, b) in pool.lines().iter().zip(shifted.lines()) {
        assert_eq!(a.page(), b.page());
        assert_eq!(b.page_offset(), 0x100);
    }
}
