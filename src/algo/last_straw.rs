//! Finds congruent lines one at a time by bisecting for the shortest prefix
//! of the pool that still evicts the target. The last line of that prefix
//! is the "last straw" and must be congruent.
//!
//! `[0, size)` holds accepted lines. `lower` is the longest prefix known not
//! to evict, `upper` the shortest one known to; the search keeps
//! `lower < upper` and stops when they are adjacent. Lines past `migrated`
//! are swapped into the search window whenever it needs fresh candidates.
use super::{Outcome, Search};
use crate::error::Result;
use crate::oracle::Verdict;
use crate::timer::Timer;
use log::{error, trace};

/// Midpoint pulled towards `upper` while few lines have been accepted: with
/// `rem` congruent lines still missing, the boundary tends to sit close to
/// the top of the window.
pub(crate) fn weighted_midpoint(lower: usize, upper: usize, rem: usize, bias: usize) -> usize {
    let cnt = (upper * rem + lower * bias) / (rem + bias);
    if cnt == upper {
        cnt - 1
    } else {
        cnt
    }
}

pub(crate) fn run<T: Timer + 'static>(s: &mut Search<'_, T>) -> Result<Outcome> {
    let n = s.cands.len();
    let n_ways = s.n_ways;
    let expected = s.expected_size();
    let carried = n_ways.saturating_sub(s.algo.slack);
    let step = s.migration_step();
    let engine = s.engine;
    let stats = &engine.stats;

    let mut migrated = n - 1;
    let (mut lower, mut upper) = (0, n);
    let mut size = 0;
    let mut backtracks = 0;
    let mut is_reset = false;

    while size < s.cap && backtracks < s.algo.max_backtrack {
        let offset = if s.algo.slack > 0 && size > carried {
            size - carried
        } else {
            0
        };

        let mut cnt = if size > 0 && !is_reset && size < n_ways {
            weighted_midpoint(lower, upper, n_ways - size, s.algo.midpoint_bias.max(1))
        } else {
            (upper + lower) / 2
        };
        is_reset = false;

        let (mut has_pos, mut has_neg) = (false, false);
        while upper - lower > 1 {
            s.count_step(cnt - offset, size);
            if s.test(offset..cnt)?.is_positive() {
                upper = cnt;
                has_pos = true;
            } else {
                lower = cnt;
                has_neg = true;
            }
            cnt = (upper + lower) / 2;
        }
        trace!(
            "upper: {}; lower: {}; pos: {}; neg: {}; offset: {}; size: {}",
            upper, lower, has_pos, has_neg, offset, size
        );

        // Without a positive step `upper` is still the old bound, so check
        // that it evicts at all.
        if !has_pos && !s.test(offset..upper)?.is_positive() {
            backtracks += 1;
            is_reset = true;
            trace!("backtrack");
        } else {
            s.cands.swap(size, upper - 1);
            size += 1;
        }

        if size >= expected && s.test(0..size)? == Verdict::Pos {
            size = s.prune(size)?;
            if size >= expected {
                break;
            }
            backtracks += 1;
        }

        lower = size;

        if is_reset || (s.algo.slack > 0 && size > carried) {
            if upper >= migrated {
                migrated = n - 1;
                stats.add(&stats.counters.meet, 1);
            }
            let mut i = 0;
            while i < step && upper < migrated {
                s.cands.swap(upper, migrated);
                upper += 1;
                migrated -= 1;
                i += 1;
            }
        }

        if upper <= lower {
            // The accepted lines alone no longer evict the target.
            upper = lower + 1;
            if upper > n {
                error!("Ran out of candidates: lower {} of {}", lower, n);
                stats.add(&stats.counters.ooc, 1);
                break;
            }
        }
    }

    Ok(Outcome { size, backtracks })
}

#[cfg(test)]
mod tests {
    use super::weighted_midpoint;

    #[test]
    fn midpoint_leans_to_upper() {
        assert_eq!(weighted_midpoint(0, 100, 1, 1), 50);
        assert_eq!(weighted_midpoint(0, 100, 7, 1), 87);
        assert_eq!(weighted_midpoint(10, 11, 5, 1), 10);
    }

    #[test]
    fn midpoint_stays_below_upper() {
        for lower in 0..20 {
            for rem in 1..16 {
                let cnt = weighted_midpoint(lower, lower + 2, rem, 1);
                assert!(cnt > lower && cnt < lower + 2);
            }
        }
    }
}
