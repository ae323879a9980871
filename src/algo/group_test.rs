//! Group testing: split the pool into `n_ways + 1` groups and drop any
//! group without which the rest still evicts the target. At least one group
//! holds no congruent line, so every round shrinks the pool by a constant
//! factor until only `n_ways` lines remain.
use super::{Outcome, Search};
use crate::error::Result;
use crate::timer::Timer;
use log::debug;
use rand::seq::SliceRandom;

/// Removed group sizes worth remembering for backtracking: one and a half
/// times the rounds needed to shrink `n` lines to `n_ways`.
pub(crate) fn history_len(n_ways: usize, n: usize) -> usize {
    let ratio = n_ways as f64 / n as f64;
    let rate = n_ways as f64 / (n_ways + 1) as f64;
    let len = 1.5 * ratio.ln() / rate.ln();
    if len.is_finite() && len >= 1.0 {
        len as usize
    } else {
        1
    }
}

pub(crate) fn run<T: Timer + 'static>(
    s: &mut Search<'_, T>,
    early_terminate: bool,
    random: bool,
) -> Result<Outcome> {
    let n_ways = s.n_ways;
    let n_groups = n_ways + 1;
    let mut n = s.cands.len();
    let engine = s.engine;
    let stats = &engine.stats;
    let mut rng = rand::thread_rng();

    let n_backup = history_len(n_ways, n);
    let mut backup = vec![0usize; n_backup];
    let mut bt = 0;
    let mut backtracks = 0;
    let mut out_of_history = false;

    while n > n_ways && backtracks < s.algo.max_backtrack && !out_of_history {
        let (base, rem) = (n / n_groups, n % n_groups);
        let n_tests = if base > 0 { n_groups } else { n };
        let mut start = 0;
        let mut has_remove = false;

        for t in 0..n_tests {
            let group = base + (t < rem) as usize;
            let is_last = t == n_tests - 1;

            // The group under test goes to the back of the pool.
            if random {
                s.cands[..n].shuffle(&mut rng);
            } else if !is_last {
                for i in 0..group {
                    s.cands.swap(start + i, n - 1 - i);
                }
            }

            s.count_step(n - group, 0);
            if s.test(0..n - group)?.is_positive() {
                n -= group;
                has_remove = true;
                backup[bt] = group;
                bt = (bt + 1) % n_backup;
                if early_terminate {
                    break;
                }
            } else {
                if is_last && !has_remove {
                    backtracks += 1;
                    bt = (bt + n_backup - 1) % n_backup;
                    if backup[bt] == 0 {
                        debug!("Out of history at {} lines", n);
                        out_of_history = true;
                        stats.add(&stats.counters.ooh, 1);
                    } else {
                        n += backup[bt];
                        backup[bt] = 0;
                    }
                    break;
                }

                if !random && !is_last {
                    for i in 0..group {
                        s.cands.swap(start + i, n - 1 - i);
                    }
                }
                start += group;
            }
        }
    }

    Ok(Outcome {
        size: n.min(s.cap),
        backtracks,
    })
}

#[cfg(test)]
mod tests {
    use super::history_len;

    #[test]
    fn history_covers_the_expected_rounds() {
        // ln(16 / 768) / ln(16 / 17) is about 63.8 rounds.
        assert_eq!(history_len(16, 768), 95);
        assert_eq!(history_len(8, 8), 1);
        assert_eq!(history_len(8, 4), 1);
    }
}
