pub mod access;
pub mod algo;
pub mod allocator;
pub mod builder;
pub mod cache_line;
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod eviction_set;
pub mod geometry;
pub mod helper;
pub mod oracle;
pub mod sim;
pub mod stats;
pub mod timer;

#[cfg(target_arch = "aarch64")]
pub mod counter;
#[cfg(target_arch = "x86_64")]
pub mod rdtscp;

pub use allocator::{CandidatePool, EvictionBuffer};
pub use cache_line::CacheLine;
pub use chain::Chain;
pub use config::{Algorithm, AlgoConfig, BuildConfig, PoolConfig, TestConfig, Traversal};
pub use engine::Engine;
pub use error::{Error, Result};
pub use eviction_set::EvictionSet;
pub use geometry::{CacheGeometry, CacheLatencies, PageKind};
pub use helper::{HelperThread, Task};
pub use oracle::Verdict;
pub use sim::{SimConfig, SimulatedCache};
pub use stats::{EvictionSetStats, StatsSnapshot};
pub use timer::{Timer, Timing};

#[cfg(target_arch = "aarch64")]
pub use counter::CounterTimer;
#[cfg(target_arch = "x86_64")]
pub use rdtscp::Rdtscp;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const HUGE_PAGE_SHIFT: u32 = 21;
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_SHIFT;
