//! One pass over the pool: a candidate is dropped whenever the pool still
//! evicts the target without it.
use super::{Outcome, Search};
use crate::error::Result;
use crate::oracle::Verdict;
use crate::timer::Timer;

pub(crate) fn run<T: Timer + 'static>(s: &mut Search<'_, T>) -> Result<Outcome> {
    let mut n = s.cands.len();
    let mut size = 0;

    while size < s.cap && n > size {
        s.cands.swap(size, n - 1);
        if s.test(0..n - 1)?.is_positive() {
            n -= 1;
        } else {
            s.cands.swap(size, n - 1);
            size += 1;
        }

        if size >= s.n_ways && s.test(0..size)? == Verdict::Pos {
            break;
        }
    }

    Ok(Outcome {
        size,
        backtracks: 0,
    })
}
