//! Search strategies that carve an eviction set out of a candidate pool.
//!
//! Every strategy partitions the candidates in place and leaves the lines it
//! accepted at the front: on return, `cands[..size]` is the eviction set.
pub mod group_test;
pub mod last_straw;
pub mod last_straw_alt;
pub mod naive;
pub mod prime_scope;

use crate::cache_line::CacheLine;
use crate::config::{Algorithm, AlgoConfig, TestConfig};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::oracle::Verdict;
use crate::timer::Timer;
use std::time::Instant;

/// What a single run of a strategy produced.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub size: usize,
    pub backtracks: usize,
}

/// Everything a strategy needs for one run.
pub struct Search<'a, T: Timer + 'static> {
    pub engine: &'a Engine<T>,
    pub target: CacheLine,
    pub cands: &'a mut [CacheLine],
    pub test: &'a TestConfig,
    pub algo: &'a AlgoConfig,
    pub n_ways: usize,
    pub cap: usize,
    /// Uncertainty left after filtering, which sizes the migration step.
    pub uncertainty: usize,
}

impl<T: Timer + 'static> Search<'_, T> {
    fn test(&self, range: std::ops::Range<usize>) -> Result<Verdict> {
        self.engine
            .test_eviction(self.target, &self.cands[range], self.test)
    }

    fn prune(&mut self, size: usize) -> Result<usize> {
        prune(self.engine, self.target, &mut self.cands[..size], self.test)
    }

    fn expected_size(&self) -> usize {
        self.n_ways + self.algo.extra_cong
    }

    fn migration_step(&self) -> usize {
        self.algo.migration_step(self.uncertainty)
    }

    /// Counts one search step over `len` lines while `size` are accepted.
    fn count_step(&self, len: usize, size: usize) {
        let stats = &self.engine.stats;
        if size < self.n_ways {
            stats.add(&stats.counters.pure_tests2, 1);
            stats.add(&stats.counters.pure_mem_acc2, len as u64);
        }
        stats.add(&stats.counters.pure_tests, 1);
        stats.add(&stats.counters.pure_mem_acc, len as u64);
    }

    fn check_pool(&self) -> Result<()> {
        if self.cands.len() <= 1 {
            return Err(Error::DegeneratePool {
                size: self.cands.len(),
            });
        }
        Ok(())
    }

    pub fn run(&mut self, algorithm: Algorithm) -> Result<Outcome> {
        self.check_pool()?;
        match algorithm {
            Algorithm::Naive => naive::run(self),
            Algorithm::GroupTest => group_test::run(self, true, false),
            Algorithm::GroupTestNoEarly => group_test::run(self, false, false),
            Algorithm::GroupTestRandom => group_test::run(self, true, true),
            Algorithm::LastStraw => last_straw::run(self),
            Algorithm::LastStrawAlt => last_straw_alt::run(self),
            Algorithm::PrimeScope => prime_scope::run(self, false),
            Algorithm::PrimeScopeMigrate => prime_scope::run(self, true),
        }
    }
}

/// Drops lines that do not share the target's set. A line stays only if the
/// others, with the target in its place, evict it. Returns the new size; kept
/// lines stay at the front.
pub fn prune<T: Timer + 'static>(
    engine: &Engine<T>,
    mut target: CacheLine,
    lines: &mut [CacheLine],
    tc: &TestConfig,
) -> Result<usize> {
    let start = Instant::now();
    let mut cnt = lines.len();
    let mut i = 0;
    while i < cnt {
        std::mem::swap(&mut target, &mut lines[i]);
        let verdict = engine.test_eviction(target, &lines[..cnt], tc);
        std::mem::swap(&mut target, &mut lines[i]);
        if !verdict?.is_positive() {
            cnt -= 1;
            lines.swap(i, cnt);
        } else {
            i += 1;
        }
    }
    engine
        .stats
        .add_duration(&engine.stats.counters.pruning_ns, start.elapsed());
    Ok(cnt)
}
