//! Timing-based eviction tests.
//!
//! A test repeats the same experiment: give the target a fresh insertion
//! age, walk the candidates and time a reload of the target. Each reload
//! slower than the configured threshold is one vote for "evicted". The vote
//! count is compared against a lower and an upper bound, and the test only
//! spends more trials while the count sits between them.
use crate::access;
use crate::cache_line::CacheLine;
use crate::config::{TestConfig, Traversal};
use crate::engine::Engine;
use crate::error::Result;
use crate::eviction_set::EvictionSet;
use crate::helper::Task;
use crate::timer::Timer;
use log::trace;

/// Discarded trials tolerated per counted trial before a round gives up.
const MAX_DISCARDS_PER_TRIAL: u32 = 16;

/// Windows smaller than this get the lower set traversed in between primes.
const SF_PRIME_SMALL_WINDOW: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verdict {
    Neg,
    NegUnsure,
    PosUnsure,
    Pos,
}

impl Verdict {
    pub fn is_positive(self) -> bool {
        matches!(self, Verdict::Pos | Verdict::PosUnsure)
    }

    pub fn is_sure(self) -> bool {
        matches!(self, Verdict::Pos | Verdict::Neg)
    }
}

impl<T: Timer + 'static> Engine<T> {
    /// Whether accessing `lines` evicts `target`.
    pub fn test_eviction(
        &self,
        target: CacheLine,
        lines: &[CacheLine],
        tc: &TestConfig,
    ) -> Result<Verdict> {
        let timer = &*self.timer;
        let counters = &self.stats.counters;
        let tlb = target.tlb_buddy();
        let scale = tc.test_scale.max(1);
        let (trials, low_bnd, upp_bnd) = (
            tc.trials.saturating_mul(scale),
            tc.low_bnd.saturating_mul(scale),
            tc.upp_bnd.saturating_mul(scale),
        );
        let max_discards = trials.saturating_mul(MAX_DISCARDS_PER_TRIAL);

        let mut otc = 0;
        for _ in 0..tc.unsure_retry.max(1) {
            self.stats.add(&counters.cands_tests, 1);
            self.stats.add(&counters.mem_accs, lines.len() as u64);

            otc = 0;
            let mut i = 0;
            let mut discards = 0;
            while i < trials && discards < max_discards {
                let core = timer.core_tag();

                timer.flush(target);
                if tc.flush_cands {
                    access::flush_all(timer, lines);
                }
                timer.fence();

                for _ in 0..tc.access_cnt {
                    if let Some(lower) = &tc.lower {
                        self.traverse_set(lower)?;
                    }
                    timer.fence();
                    timer.load(target);
                    if tc.need_helper {
                        self.helper()?.read_single(target);
                        timer.load(target);
                    }
                }

                timer.fence();
                if tc.foreign_evictor {
                    self.helper()?.run(self.helper_task(lines, tc));
                } else {
                    self.traverse(lines, tc)?;
                }
                timer.fence();

                timer.load(tlb);
                let timing = timer.time_load(target);
                if timing.core == core && timing.cycles < self.lats.interrupt_thresh {
                    otc += (timing.cycles >= tc.lat_thresh) as u32;
                    i += 1;
                    if otc > upp_bnd {
                        return Ok(Verdict::Pos);
                    }
                } else {
                    trace!("Discarded trial: {} cycles on core {}", timing.cycles, timing.core);
                    self.stats.add(&counters.discarded, 1);
                    discards += 1;
                }
            }

            if otc > upp_bnd {
                return Ok(Verdict::Pos);
            } else if otc < low_bnd && i == trials {
                return Ok(Verdict::Neg);
            }
        }

        if otc >= low_bnd + upp_bnd.saturating_sub(low_bnd) / 2 {
            self.stats.add(&counters.pos_unsure, 1);
            Ok(Verdict::PosUnsure)
        } else {
            self.stats.add(&counters.neg_unsure, 1);
            Ok(Verdict::NegUnsure)
        }
    }

    fn helper_task<'a>(&self, lines: &'a [CacheLine], tc: &TestConfig) -> Task<'a> {
        match tc.traversal {
            Traversal::Backward => Task::Traverse {
                lines,
                repeat: tc.ev_repeat,
            },
            Traversal::SfPrime | Traversal::SfPrimeShared => Task::Prime {
                lines,
                repeat: tc.ev_repeat,
                stride: tc.stride,
                block: tc.block,
                backward: true,
            },
        }
    }

    /// Walks `lines` the way `tc` asks for.
    pub fn traverse(&self, lines: &[CacheLine], tc: &TestConfig) -> Result<()> {
        let timer = &*self.timer;
        match tc.traversal {
            Traversal::Backward => access::traverse(timer, lines, tc.ev_repeat),
            Traversal::SfPrime => {
                for _ in 0..2 {
                    access::prime(timer, lines, tc.ev_repeat, tc.stride, tc.block);
                    timer.fence();
                    if lines.len() < SF_PRIME_SMALL_WINDOW {
                        if let Some(lower) = &tc.lower {
                            self.traverse_set(lower)?;
                            timer.fence();
                        }
                    }
                }
            }
            Traversal::SfPrimeShared => {
                let helper = self.helper()?;
                let (_, walked) = helper.concurrently(self.helper_task(lines, tc), || -> Result<()> {
                    access::prime(timer, lines, tc.ev_repeat, tc.stride, tc.block);
                    if let Some(lower) = &tc.lower {
                        if lines.len() < lower.geometry().n_ways {
                            self.traverse_set(lower)?;
                            timer.fence();
                            access::access_bwd(timer, lines);
                        }
                    }
                    Ok(())
                });
                walked?;
            }
        }
        Ok(())
    }

    /// Walks a set with its own test configuration.
    pub fn traverse_set(&self, set: &EvictionSet) -> Result<()> {
        self.traverse(set.lines(), &set.config().test)
    }

    pub fn test_set(&self, target: CacheLine, set: &EvictionSet) -> Result<Verdict> {
        self.test_eviction(target, set.lines(), &set.config().test)
    }

    /// [`Engine::test_set`] with twice the trials and bounds.
    pub fn precise_test(&self, target: CacheLine, set: &EvictionSet) -> Result<Verdict> {
        let mut tc = set.config().test.clone();
        tc.test_scale = 2;
        self.test_eviction(target, set.lines(), &tc)
    }

    pub fn test_set_alt(&self, target: CacheLine, set: &EvictionSet) -> Result<Verdict> {
        self.test_eviction(target, set.lines(), &set.config().test_alt)
    }

    /// Tests with the prime pattern on the calling thread only.
    pub fn test_set_single_threaded(&self, target: CacheLine, set: &EvictionSet) -> Result<Verdict> {
        let mut tc = set.config().test.clone();
        tc.traversal = Traversal::SfPrime;
        tc.need_helper = false;
        self.test_eviction(target, set.lines(), &tc)
    }

    /// Uses the first line as the target and the rest as the evictor.
    pub fn self_test(&self, set: &EvictionSet) -> Result<Verdict> {
        match set.lines().split_first() {
            Some((target, rest)) if !rest.is_empty() => {
                self.test_eviction(*target, rest, &set.config().test)
            }
            _ => Ok(Verdict::Neg),
        }
    }

    pub fn self_precise_test(&self, set: &EvictionSet) -> Result<Verdict> {
        match set.lines().split_first() {
            Some((target, rest)) if !rest.is_empty() => {
                let mut tc = set.config().test.clone();
                tc.test_scale = 2;
                self.test_eviction(*target, rest, &tc)
            }
            _ => Ok(Verdict::Neg),
        }
    }

    /// Tests many targets against one set at once, moving the ones the set
    /// evicts to the front. Returns how many it evicts.
    pub fn test_batch(&self, targets: &mut [CacheLine], set: &EvictionSet) -> Result<usize> {
        let timer = &*self.timer;
        let tc = &set.config().test;
        let n_ways = set.geometry().n_ways.max(1);
        let batch = if n_ways > 2 { n_ways - 1 } else { n_ways };

        let mut otcs = vec![0u32; batch];
        let mut n_pos = 0;
        for s in (0..targets.len()).step_by(batch) {
            let cur = batch.min(targets.len() - s);
            otcs[..cur].fill(0);
            for _ in 0..tc.trials {
                access::access_fwd(timer, &targets[s..s + cur]);
                timer.fence();
                self.traverse_set(set)?;
                timer.fence();
                for (i, otc) in otcs[..cur].iter_mut().enumerate() {
                    let timing = timer.time_load(targets[s + i]);
                    *otc += (timing.cycles > tc.lat_thresh) as u32;
                }
            }

            for i in 0..cur {
                if otcs[i] > tc.upp_bnd {
                    targets.swap(n_pos, s + i);
                    n_pos += 1;
                }
            }
        }
        Ok(n_pos)
    }
}
