use crate::error::{Error, Result};
use crate::geometry::CacheLatencies;
use crate::helper::HelperThread;
use crate::stats::EvictionSetStats;
use crate::timer::Timer;
use std::sync::Arc;

/// Builds and tests eviction sets through one timer.
///
/// The engine owns the optional helper thread and reports into an injected
/// [`EvictionSetStats`]. Oracle calls live in [`crate::oracle`], builds in
/// [`crate::builder`].
pub struct Engine<T: Timer + 'static> {
    pub(crate) timer: Arc<T>,
    pub(crate) lats: CacheLatencies,
    pub(crate) stats: Arc<EvictionSetStats>,
    helper: Option<HelperThread>,
    helper_core: Option<usize>,
}

impl<T: Timer + 'static> Engine<T> {
    pub fn new(timer: Arc<T>, lats: CacheLatencies) -> Self {
        Self {
            timer,
            lats,
            stats: Arc::new(EvictionSetStats::new()),
            helper: None,
            helper_core: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<EvictionSetStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Pins helper threads started from now on to `core`.
    pub fn with_helper_core(mut self, core: usize) -> Self {
        self.helper_core = Some(core);
        self
    }

    pub fn timer(&self) -> &Arc<T> {
        &self.timer
    }

    pub fn latencies(&self) -> &CacheLatencies {
        &self.lats
    }

    pub fn stats(&self) -> &Arc<EvictionSetStats> {
        &self.stats
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    pub fn start_helper(&mut self) -> Result<()> {
        if self.helper.is_none() {
            self.helper = Some(HelperThread::start(self.timer.clone(), self.helper_core)?);
        }
        Ok(())
    }

    pub fn stop_helper(&mut self) {
        if let Some(helper) = self.helper.take() {
            helper.stop();
        }
    }

    pub fn helper_running(&self) -> bool {
        self.helper.is_some()
    }

    pub(crate) fn helper(&self) -> Result<&HelperThread> {
        self.helper.as_ref().ok_or(Error::HelperNotRunning)
    }
}
