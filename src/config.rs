//! Build, test and search parameters, with presets per cache level.
use crate::error::{Error, Result};
use crate::eviction_set::EvictionSet;
use crate::geometry::{CacheGeometry, CacheLatencies, PageKind};
use std::sync::Arc;

/// How a candidate set is walked while it tries to evict a target.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Traversal {
    /// `ev_repeat` backward sweeps over the whole set.
    #[default]
    Backward,
    /// Sliding-window prime pattern, run twice, with the lower set traversed
    /// in between when the window is small.
    SfPrime,
    /// The prime pattern run by the helper thread and the caller at once.
    SfPrimeShared,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Algorithm {
    Naive,
    GroupTest,
    GroupTestRandom,
    GroupTestNoEarly,
    #[default]
    LastStraw,
    LastStrawAlt,
    PrimeScope,
    PrimeScopeMigrate,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Candidates per expected congruent line.
    pub scaling: f64,
    pub page: PageKind,
    /// Only keep candidates this lower-level set can evict.
    pub filter: Option<Arc<EvictionSet>>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            scaling: 1.0,
            page: PageKind::Base,
            filter: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TestConfig {
    /// Loads at or above this latency count as misses.
    pub lat_thresh: u64,
    pub trials: u32,
    pub low_bnd: u32,
    pub upp_bnd: u32,
    pub unsure_retry: u32,
    /// Multiplies trials and both bounds.
    pub test_scale: u32,
    pub ev_repeat: usize,
    pub access_cnt: usize,
    pub stride: usize,
    pub block: usize,
    /// Traversed between target accesses to push the target out of the
    /// levels above the one under test.
    pub lower: Option<Arc<EvictionSet>>,
    pub need_helper: bool,
    pub flush_cands: bool,
    /// Let the helper thread traverse the candidates.
    pub foreign_evictor: bool,
    pub traversal: Traversal,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            lat_thresh: 0,
            trials: 10,
            low_bnd: 3,
            upp_bnd: 7,
            unsure_retry: 5,
            test_scale: 1,
            ev_repeat: 4,
            access_cnt: 3,
            stride: 1,
            block: 1,
            lower: None,
            need_helper: false,
            flush_cands: false,
            foreign_evictor: false,
            traversal: Traversal::Backward,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AlgoConfig {
    pub cap_scaling: usize,
    pub verify_retry: u32,
    /// Milliseconds. Zero disables the timeout.
    pub retry_timeout: u64,
    pub max_backtrack: usize,
    /// Accepted lines that may fall out of a window once it slides.
    pub slack: usize,
    /// Lines needed beyond the associativity.
    pub extra_cong: usize,
    pub ret_partial: bool,
    pub prelim_test: bool,
    pub need_sf_ext: bool,
    /// The migration step is `migration_num * uncertainty / migration_den`.
    pub migration_num: usize,
    pub migration_den: usize,
    /// Weight of the lower bound in the weighted midpoint.
    pub midpoint_bias: usize,
    pub max_upper_hist: usize,
    pub prime_scope_max_iters: usize,
    pub prime_scope_local_iters: usize,
}

impl Default for AlgoConfig {
    fn default() -> Self {
        Self {
            cap_scaling: 1,
            verify_retry: 1,
            retry_timeout: 10,
            max_backtrack: 10,
            slack: 0,
            extra_cong: 0,
            ret_partial: false,
            prelim_test: false,
            need_sf_ext: false,
            migration_num: 3,
            migration_den: 2,
            midpoint_bias: 1,
            max_upper_hist: 50,
            prime_scope_max_iters: 10_000,
            prime_scope_local_iters: 5,
        }
    }
}

impl AlgoConfig {
    pub fn migration_step(&self, uncertainty: usize) -> usize {
        self.migration_num * uncertainty / self.migration_den.max(1)
    }
}

#[derive(Clone, Debug, Default)]
pub struct BuildConfig {
    pub pool: PoolConfig,
    pub test: TestConfig,
    /// A second opinion used by [`Engine::test_set_alt`](crate::Engine::test_set_alt).
    pub test_alt: TestConfig,
    pub algo: AlgoConfig,
    pub algorithm: Algorithm,
}

impl BuildConfig {
    pub fn l1d(lats: &CacheLatencies) -> Self {
        let test = TestConfig {
            lat_thresh: lats.l1d_thresh,
            ..TestConfig::default()
        };

        Self {
            pool: PoolConfig::default(),
            test_alt: test.clone(),
            test,
            algo: AlgoConfig::default(),
            algorithm: Algorithm::default(),
        }
    }

    pub fn l2(lats: &CacheLatencies) -> Self {
        let test = TestConfig {
            lat_thresh: lats.l2_thresh,
            ..TestConfig::default()
        };

        Self {
            pool: PoolConfig {
                scaling: 3.0,
                ..PoolConfig::default()
            },
            test_alt: test.clone(),
            test,
            algo: AlgoConfig {
                cap_scaling: 2,
                verify_retry: 5,
                retry_timeout: 20,
                max_backtrack: 20,
                ..AlgoConfig::default()
            },
            algorithm: Algorithm::default(),
        }
    }

    /// Snoop-filter sets, filtered through and tested against an L2 set.
    pub fn snoop_filter(
        lats: &CacheLatencies,
        l3: &CacheGeometry,
        sf_ways: usize,
        l2_set: Arc<EvictionSet>,
    ) -> Self {
        Self {
            pool: PoolConfig {
                scaling: 3.0,
                page: PageKind::Base,
                filter: Some(l2_set.clone()),
            },
            test: TestConfig {
                lat_thresh: lats.l3_thresh,
                trials: 4,
                low_bnd: 2,
                upp_bnd: 2,
                unsure_retry: 3,
                test_scale: 1,
                ev_repeat: 1,
                access_cnt: 1,
                stride: 12,
                block: 24,
                lower: Some(l2_set),
                need_helper: true,
                flush_cands: false,
                foreign_evictor: false,
                traversal: Traversal::SfPrimeShared,
            },
            test_alt: TestConfig {
                lat_thresh: lats.l2_thresh,
                trials: 5,
                low_bnd: 2,
                upp_bnd: 3,
                unsure_retry: 5,
                ev_repeat: 10,
                access_cnt: 1,
                flush_cands: true,
                ..TestConfig::default()
            },
            algo: AlgoConfig {
                cap_scaling: 2,
                verify_retry: 10,
                retry_timeout: 1000,
                max_backtrack: 20,
                slack: 2,
                extra_cong: sf_ways.saturating_sub(l3.n_ways),
                ..AlgoConfig::default()
            },
            algorithm: Algorithm::default(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for test in [&self.test, &self.test_alt] {
            if test.trials == 0 {
                return Err(Error::InvalidConfig("trials must be positive"));
            }
            if test.low_bnd > test.upp_bnd {
                return Err(Error::InvalidConfig("low_bnd exceeds upp_bnd"));
            }
            if test.traversal == Traversal::SfPrimeShared && !test.need_helper {
                return Err(Error::InvalidConfig("shared prime traversal needs the helper"));
            }
        }
        if self.algo.cap_scaling == 0 {
            return Err(Error::InvalidConfig("cap_scaling must be positive"));
        }
        if self.algo.verify_retry == 0 {
            return Err(Error::InvalidConfig("verify_retry must be positive"));
        }
        if self.algo.migration_den == 0 {
            return Err(Error::InvalidConfig("migration_den must be positive"));
        }
        if self.algo.max_upper_hist < 2 {
            return Err(Error::InvalidConfig("max_upper_hist must be at least 2"));
        }
        if self.pool.scaling <= 0.0 {
            return Err(Error::InvalidConfig("pool scaling must be positive"));
        }
        Ok(())
    }
}
