//! Counters describing what the engine did. They are diagnostic only and
//! never influence a build.
use log::info;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const MAX_RETRY_REC: usize = 22;
pub const MAX_BACKTRACK_REC: usize = 102;

/// A histogram of how many retries (or backtracks) builds needed, once for
/// every build and once for builds that ended with a working eviction set.
pub struct Histogram<const N: usize> {
    total: [AtomicU64; N],
    useful: [AtomicU64; N],
    total_ns: [AtomicU64; N],
    useful_ns: [AtomicU64; N],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub total: Vec<u64>,
    pub useful: Vec<u64>,
    pub total_ns: Vec<u64>,
    pub useful_ns: Vec<u64>,
}

impl<const N: usize> Histogram<N> {
    fn new() -> Self {
        Self {
            total: std::array::from_fn(|_| AtomicU64::new(0)),
            useful: std::array::from_fn(|_| AtomicU64::new(0)),
            total_ns: std::array::from_fn(|_| AtomicU64::new(0)),
            useful_ns: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    fn bucket(count: u64) -> usize {
        (count as usize).min(N - 1)
    }

    pub fn record(&self, count: u64, duration: Duration) {
        let b = Self::bucket(count);
        self.total[b].fetch_add(1, Ordering::Relaxed);
        self.total_ns[b].fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_useful(&self, count: u64, duration: Duration) {
        let b = Self::bucket(count);
        self.useful[b].fetch_add(1, Ordering::Relaxed);
        self.useful_ns[b].fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    fn reset(&self) {
        for cell in self
            .total
            .iter()
            .chain(&self.useful)
            .chain(&self.total_ns)
            .chain(&self.useful_ns)
        {
            cell.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let load = |cells: &[AtomicU64; N]| cells.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        HistogramSnapshot {
            total: load(&self.total),
            useful: load(&self.useful),
            total_ns: load(&self.total_ns),
            useful_ns: load(&self.useful_ns),
        }
    }
}

impl HistogramSnapshot {
    fn fmt_named(&self, f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
        write!(f, "{}:", name)?;
        let last = self.total.len().saturating_sub(1);
        for i in 1..self.total.len() {
            if self.total[i] == 0 && self.useful[i] == 0 {
                continue;
            }
            if i == last {
                write!(f, " >={}:", i)?;
            } else {
                write!(f, " {}:", i)?;
            }
            write!(
                f,
                " {}/{}-{}/{}ms;",
                self.useful[i],
                self.total[i],
                self.useful_ns[i] / 1_000_000,
                self.total_ns[i] / 1_000_000
            )?;
        }
        Ok(())
    }
}

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        /// Scalar counters. Durations are in nanoseconds.
        #[derive(Default)]
        pub struct Counters {
            $(pub $name: AtomicU64,)*
        }

        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        pub struct CountersSnapshot {
            $(pub $name: u64,)*
        }

        impl Counters {
            fn reset(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)*
            }

            fn snapshot(&self) -> CountersSnapshot {
                CountersSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    alloc_ns,
    population_ns,
    build_ns,
    pruning_ns,
    extension_ns,
    retry_ns,
    retries,
    backtracks,
    cands_tests,
    mem_accs,
    pure_mem_acc,
    pure_tests,
    pure_mem_acc2,
    pure_tests2,
    pos_unsure,
    neg_unsure,
    discarded,
    ooh,
    ooc,
    no_next,
    timeout,
    meet,
}

/// Statistics shared by everything an [`Engine`](crate::Engine) runs.
///
/// Hand the same `Arc<EvictionSetStats>` to several engines to aggregate, or
/// give each test its own to keep runs apart.
pub struct EvictionSetStats {
    pub counters: Counters,
    pub retry_dist: Histogram<MAX_RETRY_REC>,
    pub backtrack_dist: Histogram<MAX_BACKTRACK_REC>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub counters: CountersSnapshot,
    pub retry_dist: HistogramSnapshot,
    pub backtrack_dist: HistogramSnapshot,
}

impl Default for EvictionSetStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EvictionSetStats {
    pub fn new() -> Self {
        Self {
            counters: Counters::default(),
            retry_dist: Histogram::new(),
            backtrack_dist: Histogram::new(),
        }
    }

    #[inline]
    pub(crate) fn add(&self, counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_duration(&self, counter: &AtomicU64, duration: Duration) {
        counter.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.counters.reset();
        self.retry_dist.reset();
        self.backtrack_dist.reset();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            counters: self.counters.snapshot(),
            retry_dist: self.retry_dist.snapshot(),
            backtrack_dist: self.backtrack_dist.snapshot(),
        }
    }

    pub fn log_summary(&self) {
        for line in self.snapshot().to_string().lines() {
            info!("{}", line);
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counters;
        writeln!(
            f,
            "Alloc: {}us; Population: {}us; Build: {}us; Pruning: {}us; Extension: {}us;",
            c.alloc_ns / 1000,
            c.population_ns / 1000,
            c.build_ns / 1000,
            c.pruning_ns / 1000,
            c.extension_ns / 1000
        )?;
        writeln!(
            f,
            "Retries: {}; Backtracks: {}; Tests: {}; Mem Acc.: {};",
            c.retries, c.backtracks, c.cands_tests, c.mem_accs
        )?;
        writeln!(
            f,
            "Pos unsure: {}; Neg unsure: {}; Discarded: {}; OOH: {}; OOC: {}; NoNext: {}; Timeout: {}",
            c.pos_unsure, c.neg_unsure, c.discarded, c.ooh, c.ooc, c.no_next, c.timeout
        )?;
        writeln!(
            f,
            "Pure acc: {}; Pure tests: {}; Pure acc 2: {}; Pure tests 2: {}",
            c.pure_mem_acc, c.pure_tests, c.pure_mem_acc2, c.pure_tests2
        )?;
        self.retry_dist.fmt_named(f, "Retry dist")?;
        writeln!(f)?;
        self.backtrack_dist.fmt_named(f, "Backtrack dist")?;
        writeln!(f)?;
        write!(f, "Meet: {}; Retry: {}us", c.meet, c.retry_ns / 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_clamps_to_last_bucket() {
        let stats = EvictionSetStats::new();
        stats.retry_dist.record(3, Duration::from_millis(2));
        stats.retry_dist.record(500, Duration::from_millis(1));
        stats.retry_dist.record_useful(3, Duration::from_millis(2));

        let snap = stats.snapshot().retry_dist;
        assert_eq!(snap.total[3], 1);
        assert_eq!(snap.useful[3], 1);
        assert_eq!(snap.total[MAX_RETRY_REC - 1], 1);
        assert_eq!(snap.total_ns[3], 2_000_000);
    }

    #[test]
    fn reset_clears_everything() {
        let stats = EvictionSetStats::new();
        stats.add(&stats.counters.retries, 4);
        stats.backtrack_dist.record(1, Duration::from_micros(5));
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot {
            counters: CountersSnapshot::default(),
            retry_dist: HistogramSnapshot {
                total: vec![0; MAX_RETRY_REC],
                useful: vec![0; MAX_RETRY_REC],
                total_ns: vec![0; MAX_RETRY_REC],
                useful_ns: vec![0; MAX_RETRY_REC],
            },
            backtrack_dist: HistogramSnapshot {
                total: vec![0; MAX_BACKTRACK_REC],
                useful: vec![0; MAX_BACKTRACK_REC],
                total_ns: vec![0; MAX_BACKTRACK_REC],
                useful_ns: vec![0; MAX_BACKTRACK_REC],
            },
        });
    }

    #[test]
    fn display_lists_nonempty_buckets() {
        let stats = EvictionSetStats::new();
        stats.retry_dist.record(2, Duration::from_millis(3));
        let text = stats.snapshot().to_string();
        assert!(text.contains("Retry dist: 2: 0/1-0/3ms;"));
    }
}
