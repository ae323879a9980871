use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Mmap(#[from] mmap_rs::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no candidate survived filtering")]
    NoCandidates,
    #[error("candidate pool of {size} lines is too small to search")]
    DegeneratePool { size: usize },
    #[error("no eviction set after {retries} retries (last size {size})")]
    NotConverged { retries: u32, size: usize },
    #[error("timed out after {elapsed:?} and {retries} retries")]
    Timeout { elapsed: Duration, retries: u32 },
    #[error("the candidate pool cannot evict the target")]
    PrelimTestFailed,
    #[error("the helper thread is not running")]
    HelperNotRunning,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
