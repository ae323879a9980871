//! Access sequences over arrays of lines.
use crate::cache_line::CacheLine;
use crate::timer::Timer;

/// Backward so that speculation cannot run ahead of the sweep.
#[inline]
pub fn access_bwd<T: Timer + ?Sized>(timer: &T, lines: &[CacheLine]) {
    for line in lines.iter().rev() {
        timer.load(*line);
    }
}

#[inline]
pub fn access_fwd<T: Timer + ?Sized>(timer: &T, lines: &[CacheLine]) {
    for line in lines {
        timer.load(*line);
    }
}

pub fn flush_all<T: Timer + ?Sized>(timer: &T, lines: &[CacheLine]) {
    for line in lines {
        timer.flush(*line);
    }
}

/// `repeat` backward sweeps.
pub fn traverse<T: Timer + ?Sized>(timer: &T, lines: &[CacheLine], repeat: usize) {
    for _ in 0..repeat {
        access_bwd(timer, lines);
    }
}

/// Slides a window of `block` lines over `lines` in steps of `stride`,
/// sweeping each window backward `repeat` times. Windows running past the
/// end wrap around to the start.
pub fn prime<T: Timer + ?Sized>(
    timer: &T,
    lines: &[CacheLine],
    repeat: usize,
    stride: usize,
    block: usize,
) {
    prime_with(timer, lines, repeat, stride, block, access_bwd);
}

/// [`prime`] with every window swept front to back.
pub fn prime_fwd<T: Timer + ?Sized>(
    timer: &T,
    lines: &[CacheLine],
    repeat: usize,
    stride: usize,
    block: usize,
) {
    prime_with(timer, lines, repeat, stride, block, access_fwd);
}

fn prime_with<T: Timer + ?Sized>(
    timer: &T,
    lines: &[CacheLine],
    repeat: usize,
    stride: usize,
    block: usize,
    sweep: fn(&T, &[CacheLine]),
) {
    let cnt = lines.len();
    let block = block.min(cnt);
    for s in (0..cnt).step_by(stride.max(1)) {
        for _ in 0..repeat {
            if cnt >= block + s {
                sweep(timer, &lines[s..s + block]);
            } else {
                let rem = cnt - s;
                sweep(timer, &lines[s..]);
                sweep(timer, &lines[..block - rem]);
            }
        }
    }
}
