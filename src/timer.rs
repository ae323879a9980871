use crate::cache_line::CacheLine;

/// One timed load.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timing {
    pub cycles: u64,
    /// Tag of the core the load retired on, read together with the clock.
    pub core: u32,
}

/// Everything the engine needs from the machine: loading, flushing and
/// timing loads of individual cache lines.
///
/// Implementations are shared with the helper thread, hence `Send + Sync`.
pub trait Timer: Send + Sync {
    fn load(&self, line: CacheLine);

    fn flush(&self, line: CacheLine);

    /// Orders the preceding loads before the following ones.
    fn fence(&self);

    /// Tag of the core the caller currently runs on.
    fn core_tag(&self) -> u32;

    fn time_load(&self, line: CacheLine) -> Timing;
}
