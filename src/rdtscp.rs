//! Time stamp counter based timer for x86-64.
use crate::cache_line::CacheLine;
use crate::timer::{Timer, Timing};
use core::arch::x86_64::{__rdtscp, _mm_clflush, _mm_lfence, _mm_mfence};
use core::ptr::read_volatile;

/// Times loads with `rdtscp`. The `IA32_TSC_AUX` value returned alongside
/// the counter identifies the core, which lets the oracle drop trials that
/// migrated in the middle of a measurement.
#[derive(Copy, Clone, Debug, Default)]
pub struct Rdtscp;

impl Rdtscp {
    pub fn new() -> Self {
        Self
    }
}

impl Timer for Rdtscp {
    #[inline(always)]
    fn load(&self, line: CacheLine) {
        unsafe { read_volatile(line.as_ptr()) };
    }

    #[inline(always)]
    fn flush(&self, line: CacheLine) {
        unsafe { _mm_clflush(line.as_ptr()) };
    }

    #[inline(always)]
    fn fence(&self) {
        unsafe { _mm_lfence() };
    }

    #[inline(always)]
    fn core_tag(&self) -> u32 {
        let mut aux = 0;
        unsafe { __rdtscp(&mut aux) };
        aux
    }

    #[inline(always)]
    fn time_load(&self, line: CacheLine) -> Timing {
        let mut aux = 0;
        unsafe {
            _mm_mfence();
            _mm_lfence();
            let t0 = __rdtscp(&mut aux);
            _mm_lfence();
            read_volatile(line.as_ptr());
            let t1 = __rdtscp(&mut aux);
            _mm_lfence();
            Timing {
                cycles: t1.wrapping_sub(t0),
                core: aux,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushed_line_is_slower() {
        let timer = Rdtscp::new();
        let mut page = vec![1u8; crate::PAGE_SIZE];
        let line = CacheLine::new(page.as_mut_ptr());

        let mut cached = Vec::new();
        let mut flushed = Vec::new();
        for _ in 0..1000 {
            timer.load(line);
            cached.push(timer.time_load(line).cycles);
            timer.flush(line);
            flushed.push(timer.time_load(line).cycles);
        }
        cached.sort();
        flushed.sort();

        assert!(cached[cached.len() / 2] < flushed[flushed.len() / 2]);
    }
}
