//! Counter-thread timer for aarch64, where user space has no fine-grained
//! cycle counter.
use crate::cache_line::CacheLine;
use crate::timer::{Timer, Timing};
use core::arch::asm;
use core::ptr::read_volatile;
use log::warn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Ticks as fast as the counter thread can store. Samples are only ordered
/// against loads after a barrier.
static CTR: AtomicU64 = AtomicU64::new(0);

pub struct CounterTimer;

fn counter_thread(core: Option<usize>) {
    if let Some(core) = core {
        if let Err(err) = affinity::set_thread_affinity([core]) {
            warn!("Failed to pin the counter thread to core {}: {}", core, err);
        }
    }
    unsafe {
        asm! {
            "eor x0, x0, x0",
            "1:",
            "str x0, [{cnt_addr}]",
            "add x0, x0, 1",
            "b 1b",
            cnt_addr = in(reg) CTR.as_ptr() as u64,
            options(noreturn),
        }
    }
}

impl CounterTimer {
    /// Spawns the counter thread, optionally pinned to `core`, and waits
    /// until it starts ticking.
    pub fn new(core: Option<usize>) -> Self {
        thread::spawn(move || counter_thread(core));
        while CTR.load(Ordering::Relaxed) == 0 {
            std::hint::spin_loop();
        }
        Self
    }

    #[inline(always)]
    fn read_counter(&self) -> u64 {
        CTR.load(Ordering::Relaxed)
    }

    #[inline(always)]
    fn barrier(&self) {
        unsafe { asm!("dsb ish") };
        unsafe { asm!("isb sy") };
    }
}

impl Timer for CounterTimer {
    #[inline(always)]
    fn load(&self, line: CacheLine) {
        unsafe { read_volatile(line.as_ptr()) };
    }

    #[inline(always)]
    fn flush(&self, line: CacheLine) {
        unsafe { asm!("dc civac, {0}", in(reg) line.as_ptr()) };
    }

    #[inline(always)]
    fn fence(&self) {
        self.barrier();
    }

    fn core_tag(&self) -> u32 {
        #[cfg(target_os = "linux")]
        {
            unsafe { libc::sched_getcpu() as u32 }
        }
        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }

    fn time_load(&self, line: CacheLine) -> Timing {
        let t0 = self.read_counter();
        self.barrier();
        unsafe { read_volatile(line.as_ptr()) };
        self.barrier();
        let t1 = self.read_counter();
        Timing {
            cycles: t1.wrapping_sub(t0),
            core: self.core_tag(),
        }
    }
}
