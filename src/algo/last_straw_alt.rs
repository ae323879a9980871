//! Last-straw search that backtracks to an earlier boundary instead of
//! resetting. Every accepted boundary is kept in a ring; when the accepted
//! lines turn out not to evict anymore (an overprune), `upper` jumps back to
//! a recorded boundary. When a step finds no boundary at all, the window is
//! recharged with fresh candidates from the tail.
use super::last_straw::weighted_midpoint;
use super::{Outcome, Search};
use crate::error::Result;
use crate::oracle::Verdict;
use crate::timer::Timer;
use log::{error, trace};

pub(crate) fn run<T: Timer + 'static>(s: &mut Search<'_, T>) -> Result<Outcome> {
    let n = s.cands.len();
    let n_ways = s.n_ways;
    let expected = s.expected_size();
    let step = s.migration_step();
    let max_hist = s.algo.max_upper_hist.max(2);
    let engine = s.engine;
    let stats = &engine.stats;

    let mut upper_hist = vec![0usize; max_hist];
    let mut uh = 0;

    let mut migrated = n - 1;
    let (mut lower, mut upper) = (0, n);
    let mut size = 0;
    let mut backtracks = 0;
    let mut offset = 0;
    let (mut only_recharge, mut double_backtrack) = (false, false);

    while size < s.cap && backtracks < s.algo.max_backtrack {
        let mut cnt = if size > 0 && size < n_ways {
            weighted_midpoint(lower, upper, n_ways - size, s.algo.midpoint_bias.max(1))
        } else {
            (upper + lower) / 2
        };

        let (mut overprune, mut recharge) = (false, false);
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

        if !has_pos && !s.test(offset..upper)?.is_positive() {
            if only_recharge {
                recharge = true;
            } else {
                overprune = true;
            }
        } else if !has_neg {
            recharge = true;
        } else {
            s.cands.swap(size, upper - 1);
            size += 1;
            upper_hist[uh] = upper;
            uh = (uh + 1) % max_hist;
        }
        trace!(
            "upper: {}; pos: {}; neg: {}; offset: {}; overprune: {}; recharge: {}; size: {}",
            upper, has_pos, has_neg, offset, overprune, recharge, size
        );

        if size >= expected && s.test(0..size)? == Verdict::Pos {
            size = s.prune(size)?;
            only_recharge = true;
            if size >= expected {
                break;
            }
            let kept = n_ways.saturating_sub(s.algo.slack);
            offset = size.saturating_sub(kept);
        }

        lower = size;

        if overprune {
            backtracks += 1;
            uh = if double_backtrack {
                (uh + max_hist - 1) % max_hist
            } else {
                (uh + max_hist - 2) % max_hist
            };
            double_backtrack = true;
            if upper_hist[uh] != 0 {
                upper = upper_hist[uh];
                upper_hist[uh] = 0;
            } else {
                stats.add(&stats.counters.ooh, 1);
                upper = n;
            }
        } else {
            double_backtrack = false;
        }

        if recharge {
            only_recharge = true;
            backtracks += 1;
            if size > offset + 2 && !has_neg {
                offset += 1;
            }
            if upper >= migrated {
                migrated = n - 1;
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
