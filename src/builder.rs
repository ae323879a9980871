//! Eviction set construction: candidate pools, the retry loop around the
//! search strategies and batch builds over every set at one page offset.
use crate::algo::{self, Search};
use crate::allocator::{CandidatePool, EvictionBuffer};
use crate::cache_line::CacheLine;
use crate::config::{BuildConfig, PoolConfig};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::eviction_set::EvictionSet;
use crate::geometry::CacheGeometry;
use crate::oracle::Verdict;
use crate::timer::Timer;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

impl<T: Timer + 'static> Engine<T> {
    /// Allocates (or reuses) a buffer, lays candidates at `offset` into it
    /// and filters them through `config.filter` when one is set.
    pub fn candidate_pool(
        &self,
        geometry: &CacheGeometry,
        config: &PoolConfig,
        buffer: Option<Arc<EvictionBuffer>>,
        offset: usize,
    ) -> Result<CandidatePool> {
        let start = Instant::now();
        let buffer = match buffer {
            Some(buffer) => buffer,
            None => EvictionBuffer::for_geometry(geometry, config)?,
        };
        self.stats
            .add_duration(&self.stats.counters.alloc_ns, start.elapsed());

        let mut pool = CandidatePool::populate(buffer, geometry, offset);
        if let Some(filter) = &config.filter {
            self.filter_pool(&mut pool, filter)?;
        }
        if pool.is_empty() {
            return Err(Error::NoCandidates);
        }
        Ok(pool)
    }

    /// Keeps only the candidates `filter` evicts. Does nothing when the
    /// filter's level leaves no uncertainty to cut. Returns the new size.
    pub fn filter_pool(&self, pool: &mut CandidatePool, filter: &EvictionSet) -> Result<usize> {
        if filter.geometry().uncertainty(filter.buffer().page_kind()) == 1 {
            return Ok(pool.len());
        }

        let start = Instant::now();
        let before = pool.len();
        let n_cands = self.test_batch(pool.lines_mut(), filter)?;
        if n_cands == 0 {
            warn!("Failed to filter out candidate lines");
            return Err(Error::NoCandidates);
        }
        pool.truncate(n_cands);
        info!("Filtered {} lines to {} candidates", before, n_cands);
        self.stats
            .add_duration(&self.stats.counters.population_ns, start.elapsed());
        Ok(n_cands)
    }

    /// Builds an eviction set for `target` at the level described by
    /// `geometry`.
    ///
    /// Without a `pool`, a fresh one is allocated at the target's page
    /// offset and dropped afterwards; the set keeps its buffer alive. The
    /// helper thread is started if the test configuration needs it and
    /// stopped again before returning, unless it was already running.
    pub fn build(
        &mut self,
        target: CacheLine,
        config: &BuildConfig,
        geometry: &CacheGeometry,
        pool: Option<&mut CandidatePool>,
    ) -> Result<EvictionSet> {
        config.validate()?;
        let mut fresh;
        let pool = match pool {
            Some(pool) => pool,
            None => {
                fresh = self.candidate_pool(geometry, &config.pool, None, target.page_offset())?;
                &mut fresh
            }
        };
        let buffer = pool.buffer().clone();
        self.build_with_helper(target, config, geometry, buffer, pool.lines_mut())
    }

    fn build_with_helper(
        &mut self,
        target: CacheLine,
        config: &BuildConfig,
        geometry: &CacheGeometry,
        buffer: Arc<EvictionBuffer>,
        cands: &mut [CacheLine],
    ) -> Result<EvictionSet> {
        let start_helper = config.test.need_helper && !self.helper_running();
        if start_helper {
            self.start_helper()?;
        }
        let res = self.build_in(target, config, geometry, buffer, cands);
        if start_helper {
            self.stop_helper();
        }
        res
    }

    fn build_in(
        &self,
        target: CacheLine,
        config: &BuildConfig,
        geometry: &CacheGeometry,
        buffer: Arc<EvictionBuffer>,
        cands: &mut [CacheLine],
    ) -> Result<EvictionSet> {
        let page = buffer.page_kind();
        let mut set = EvictionSet::new(config.clone(), geometry.clone(), buffer);

        let level_unc = geometry.uncertainty(page);
        if level_unc == 1 {
            let n = geometry.n_ways.min(cands.len());
            set.set_lines(&cands[..n]);
            return Ok(set);
        }

        if config.algo.prelim_test && !self.test_eviction(target, cands, &config.test)?.is_positive() {
            self.stats.add(&self.stats.counters.ooc, 1);
            return Err(Error::PrelimTestFailed);
        }

        if config.algo.extra_cong > 0 {
            set.config_mut().algo.need_sf_ext = true;
        }
        let config = set.config().clone();
        let need_sf_ext = config.algo.need_sf_ext;

        let filter_unc = config
            .pool
            .filter
            .as_ref()
            .map_or(1, |filter| filter.geometry().uncertainty(page).max(1));
        let uncertainty = (level_unc / filter_unc).max(1);

        let stats = &self.stats;
        let counters = &stats.counters;
        let timeout = Duration::from_millis(config.algo.retry_timeout);
        let start = Instant::now();
        let mut retry_start = None;
        let mut retries = 0;
        let mut can_evict = false;
        let mut timed_out = false;

        for r in 0..config.algo.verify_retry {
            let iter_start = Instant::now();
            let outcome = Search {
                engine: self,
                target,
                cands: &mut *cands,
                test: &config.test,
                algo: &config.algo,
                n_ways: geometry.n_ways,
                cap: set.capacity(),
                uncertainty,
            }
            .run(config.algorithm)?;
            set.set_lines(&cands[..outcome.size.min(cands.len())]);

            let backtracks = outcome.backtracks as u64;
            stats.add(&counters.backtracks, backtracks);
            stats.backtrack_dist.record(backtracks, iter_start.elapsed());

            if self.test_set(target, &set)? == Verdict::Pos {
                if need_sf_ext {
                    self.extend_sf(&mut set, cands)?;
                    self.prune(target, &mut set)?;
                    self.extend_sf(&mut set, cands)?;
                }
                if !need_sf_ext || self.test_set(target, &set)? == Verdict::Pos {
                    can_evict = true;
                    stats
                        .backtrack_dist
                        .record_useful(backtracks, iter_start.elapsed());
                    break;
                }
            }

            if !timeout.is_zero() && start.elapsed() > timeout {
                stats.add(&counters.timeout, 1);
                warn!(
                    "Timeout! Target level: {}; cands: {}",
                    geometry.level,
                    cands.len()
                );
                timed_out = true;
                break;
            }
            if r == 0 {
                retry_start = Some(Instant::now());
            }
            retries += 1;
            stats.add(&counters.retries, 1);
            debug!("Retrying, {} lines found", set.len());
        }

        let elapsed = start.elapsed();
        stats.add_duration(&counters.build_ns, elapsed);
        if let Some(retry_start) = retry_start {
            stats.add_duration(&counters.retry_ns, retry_start.elapsed());
        }
        stats.retry_dist.record(retries as u64, elapsed);
        if can_evict {
            stats.retry_dist.record_useful(retries as u64, elapsed);
        }

        if can_evict || config.algo.ret_partial {
            debug!(
                "Built a level {} set of {} lines after {} retries in {:?}",
                geometry.level,
                set.len(),
                retries,
                elapsed
            );
            Ok(set)
        } else if timed_out {
            Err(Error::Timeout { elapsed, retries })
        } else {
            Err(Error::NotConverged {
                retries,
                size: set.len(),
            })
        }
    }

    /// Drops the lines of `set` that do not share the target's set.
    pub fn prune(&self, target: CacheLine, set: &mut EvictionSet) -> Result<usize> {
        let tc = set.config().test.clone();
        let cnt = algo::prune(self, target, set.lines_mut(), &tc)?;
        set.truncate(cnt);
        Ok(cnt)
    }

    /// Grows `set` towards `n_ways + extra_cong` lines with candidates from
    /// the back of `cands` that the set already evicts.
    pub fn extend_sf(&self, set: &mut EvictionSet, cands: &mut [CacheLine]) -> Result<()> {
        let start = Instant::now();
        let expected = set.geometry().n_ways + set.config().algo.extra_cong;
        if set.is_full() || set.len() >= expected {
            return Ok(());
        }

        for i in (0..cands.len()).rev() {
            if set.is_full() {
                break;
            }
            let line = cands[i];
            if set.lines().contains(&line) {
                continue;
            }
            if self.test_set(line, set)? == Verdict::Pos {
                if set.len() < i {
                    cands.swap(set.len(), i);
                }
                set.push(line);
                if set.len() >= expected {
                    break;
                }
            }
        }
        self.stats
            .add_duration(&self.stats.counters.extension_ns, start.elapsed());
        Ok(())
    }

    /// Builds one set per set index reachable from `offset`.
    ///
    /// Targets are drawn from the pool itself: each next target is a
    /// candidate that none of the sets built so far evicts. Lines of a built
    /// set leave the pool window. With `lower_sets`, each target gets the
    /// first of them that evicts it as the lower set of its test
    /// configuration, and targets no lower set evicts are skipped.
    pub fn build_many_at(
        &mut self,
        offset: usize,
        config: &BuildConfig,
        geometry: &CacheGeometry,
        pool: Option<&mut CandidatePool>,
        lower_sets: &[Arc<EvictionSet>],
    ) -> Result<Vec<EvictionSet>> {
        config.validate()?;
        let mut fresh;
        let pool = match pool {
            Some(pool) => pool,
            None => {
                fresh = self.candidate_pool(geometry, &config.pool, None, offset)?;
                &mut fresh
            }
        };
        if pool.is_empty() {
            return Err(Error::NoCandidates);
        }

        let page = pool.page_kind();
        let mut n_sets = geometry.uncertainty(page);
        if let Some(filter) = &config.pool.filter {
            n_sets /= filter.geometry().uncertainty(page).max(1);
        }
        let n_sets = n_sets.max(1);

        let buffer = pool.buffer().clone();
        let lines = pool.lines_mut();
        let (mut head, mut end) = (0, lines.len() - 1);
        let mut target = lines[end];

        let start_helper = config.test.need_helper && !self.helper_running();
        if start_helper {
            self.start_helper()?;
        }

        let mut sets = Vec::with_capacity(n_sets);
        let mut built: Vec<CacheLine> = vec![];
        let mut lower_skipped = 0;
        let mut res = Ok(());

        for i in 0..n_sets {
            if head >= end {
                break;
            }

            let mut conf = config.clone();
            let lower_ok = if lower_sets.is_empty() {
                true
            } else {
                let mut lower = None;
                for set in lower_sets {
                    match self.test_set(target, set) {
                        Ok(v) if v.is_positive() => {
                            lower = Some(set.clone());
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            res = Err(e);
                            break;
                        }
                    }
                }
                conf.test.lower = lower;
                conf.test.lower.is_some()
            };
            if res.is_err() {
                break;
            }

            if lower_ok {
                match self.build_in(target, &conf, geometry, buffer.clone(), &mut lines[head..end]) {
                    Ok(mut set) => {
                        gather_front(&mut lines[head..end], set.lines());
                        head += set.len();
                        set.insert_front(target);
                        built.extend_from_slice(set.lines());
                        sets.push(set);
                    }
                    Err(Error::NotConverged { .. } | Error::Timeout { .. } | Error::PrelimTestFailed) => {
                        debug!("No set for target {:?}", target);
                    }
                    Err(e) => {
                        res = Err(e);
                        break;
                    }
                }
            } else {
                lower_skipped += 1;
            }

            if i == n_sets - 1 || head >= end {
                break;
            }

            if built.is_empty() {
                end -= 1;
                target = lines[end];
                continue;
            }

            let mut next = None;
            for j in head..end {
                match self.test_eviction(lines[j], &built, &conf.test) {
                    Ok(Verdict::Neg) => {
                        next = Some(j);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        res = Err(e);
                        break;
                    }
                }
            }
            if res.is_err() {
                break;
            }
            match next {
                Some(j) => {
                    lines.swap(j, end - 1);
                    end -= 1;
                    target = lines[end];
                }
                None => {
                    warn!(
                        "Cannot find the next target: {} candidates; {} lines built",
                        end - head,
                        built.len()
                    );
                    self.stats
                        .add(&self.stats.counters.no_next, (n_sets - (i + 1)) as u64);
                    break;
                }
            }
        }

        if start_helper {
            self.stop_helper();
        }
        if lower_skipped > 0 {
            info!("Skipped {} targets without a lower set", lower_skipped);
        }
        res?;
        info!("Built {} of {} sets at offset {:#x}", sets.len(), n_sets, offset);
        Ok(sets)
    }
}

/// Moves every line of `set` found in `window` to the front, in order.
fn gather_front(window: &mut [CacheLine], set: &[CacheLine]) {
    let mut front = 0;
    for line in set {
        if let Some(pos) = window[front..].iter().position(|l| l == line) {
            window.swap(front, front + pos);
            front += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::gather_front;
    use crate::cache_line::CacheLine;

    #[test]
    fn gathers_set_lines_in_order() {
        let mut window: Vec<_> = (1..=6).map(|i| CacheLine::from_addr(i << 12)).collect();
        let set = [window[4], window[1], CacheLine::from_addr(99 << 12)];
        gather_front(&mut window, &set);
        assert_eq!(window[0], set[0]);
        assert_eq!(window[1], set[1]);
        assert_eq!(window.len(), 6);
    }
}
