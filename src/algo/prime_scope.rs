//! Prime+Scope search for structures whose replacement is too irregular to
//! bisect over. The target is loaded once, then candidates are accessed one
//! by one and the target is re-timed after each; the candidate that pushes
//! the target out is taken.
use super::{Outcome, Search};
use crate::error::Result;
use crate::oracle::Verdict;
use crate::timer::Timer;
use log::{error, trace};

pub(crate) fn run<T: Timer + 'static>(s: &mut Search<'_, T>, migrate: bool) -> Result<Outcome> {
    let n = s.cands.len();
    let n_ways = s.n_ways;
    let expected = s.expected_size();
    let max_old = n_ways.saturating_sub(s.algo.slack);
    let step = s.migration_step();
    let engine = s.engine;
    let stats = &engine.stats;
    let timer = &*engine.timer;
    let interrupt = engine.lats.interrupt_thresh;
    let helper = if s.test.need_helper {
        Some(engine.helper()?)
    } else {
        None
    };
    let tlb = s.target.tlb_buddy();

    let (mut migrated_lb, mut migrated_ub) = (0, n - 1);
    let mut last_idx = 0;
    let mut iters = 0;
    let mut size = 0;

    while size < s.cap.min(n) && iters < s.algo.prime_scope_max_iters {
        let init = if s.algo.slack > 0 && size > max_old {
            size - max_old
        } else {
            0
        };
        if init > 0 && migrate {
            migrated_lb = last_idx.max(size);
            let mut i = 0;
            while i < step && migrated_lb < migrated_ub {
                s.cands.swap(migrated_lb, migrated_ub);
                migrated_lb += 1;
                migrated_ub -= 1;
                i += 1;
            }
        }

        stats.add(&stats.counters.pure_tests, 1);
        if size < n_ways {
            stats.add(&stats.counters.pure_tests2, 1);
        }

        timer.load(s.target);
        if let Some(helper) = helper {
            helper.read_single(s.target);
        }

        let mut found = false;
        let mut local = 0;
        while !found && iters < s.algo.prime_scope_max_iters && local < s.algo.prime_scope_local_iters {
            for idx in init..n {
                let line = s.cands[idx];
                timer.load(line);
                if let Some(helper) = helper {
                    helper.read_single(line);
                }
                timer.fence();
                timer.load(tlb);
                let cycles = timer.time_load(s.target).cycles;
                if cycles > s.test.lat_thresh && cycles < interrupt {
                    trace!("Line {} evicted the target after {} cycles", idx, cycles);
                    found = true;
                    last_idx = idx;
                    s.cands.swap(size, idx);
                    size += 1;
                    break;
                }
                stats.add(&stats.counters.pure_mem_acc, 1);
                if size < n_ways {
                    stats.add(&stats.counters.pure_mem_acc2, 1);
                }
            }
            iters += 1;
            local += 1;
        }

        if size >= n && size < expected {
            error!("Ran out of candidates: {} accepted of {}", size, n);
            stats.add(&stats.counters.ooc, 1);
            break;
        }

        if size >= expected && s.test(0..size)? == Verdict::Pos {
            size = s.prune(size)?;
            if size >= expected {
                break;
            }
        }
    }

    Ok(Outcome {
        size,
        backtracks: 0,
    })
}
