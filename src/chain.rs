//! Eviction sets threaded into a circular doubly linked list that lives in
//! the lines themselves.
//!
//! The first word of every line points to the next line and the second to
//! the previous one. Walking the chain makes each load depend on the one
//! before it, so the lines are touched strictly in list order.
use crate::allocator::EvictionBuffer;
use crate::cache_line::CacheLine;
use crate::eviction_set::EvictionSet;
use crate::timer::Timer;
use log::warn;
use std::mem::size_of;
use std::sync::Arc;

const NEXT: usize = 0;
const PREV: usize = 1;

pub struct Chain {
    head: CacheLine,
    len: usize,
    buffer: Arc<EvictionBuffer>,
}

impl Chain {
    /// Links `lines` in order. Returns `None` when there are no lines or
    /// one of them cannot hold the links inside `buffer`.
    pub fn link(lines: &[CacheLine], buffer: Arc<EvictionBuffer>) -> Option<Self> {
        let head = *lines.first()?;
        if let Some(line) = lines.iter().find(|line| !holds_links(&buffer, **line)) {
            warn!("Line {:?} cannot hold chain links", line);
            return None;
        }

        let n = lines.len();
        for (i, line) in lines.iter().enumerate() {
            let next = lines[(i + 1) % n];
            let prev = lines[(i + n - 1) % n];
            unsafe {
                write_link(*line, NEXT, next);
                write_link(*line, PREV, prev);
            }
        }

        Some(Self { head, len: n, buffer })
    }

    pub fn head(&self) -> CacheLine {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn next(&self, line: CacheLine) -> Option<CacheLine> {
        self.follow(line, NEXT)
    }

    pub fn prev(&self, line: CacheLine) -> Option<CacheLine> {
        self.follow(line, PREV)
    }

    /// Loads every line once, following the next links from the head.
    /// Returns how many lines were loaded; a walk stops early at a link
    /// that points outside the buffer.
    pub fn walk_fwd<T: Timer + ?Sized>(&self, timer: &T) -> usize {
        self.walk(timer, self.head, NEXT)
    }

    /// Loads every line once, following the prev links from the line
    /// before the head.
    pub fn walk_bwd<T: Timer + ?Sized>(&self, timer: &T) -> usize {
        match self.prev(self.head) {
            Some(last) => self.walk(timer, last, PREV),
            None => 0,
        }
    }

    /// `repeat` rounds of a forward walk followed by a backward one.
    pub fn traverse<T: Timer + ?Sized>(&self, timer: &T, repeat: usize) -> usize {
        (0..repeat)
            .map(|_| self.walk_fwd(timer) + self.walk_bwd(timer))
            .sum()
    }

    fn walk<T: Timer + ?Sized>(&self, timer: &T, start: CacheLine, link: usize) -> usize {
        let mut line = start;
        for walked in 0..self.len {
            timer.load(line);
            match self.follow(line, link) {
                Some(next) => line = next,
                None => return walked + 1,
            }
        }
        self.len
    }

    fn follow(&self, line: CacheLine, link: usize) -> Option<CacheLine> {
        if !holds_links(&self.buffer, line) {
            return None;
        }
        let addr = unsafe { (line.as_ptr() as *const usize).add(link).read_volatile() };
        let next = CacheLine::from_addr(addr);
        holds_links(&self.buffer, next).then_some(next)
    }
}

impl EvictionSet {
    /// Threads the lines of the set into a [`Chain`], overwriting the first
    /// two words of each line.
    pub fn chain(&self) -> Option<Chain> {
        Chain::link(self.lines(), self.buffer().clone())
    }
}

fn holds_links(buffer: &EvictionBuffer, line: CacheLine) -> bool {
    let end = buffer.base() as usize + buffer.len();
    buffer.contains(line)
        && line.addr() % size_of::<usize>() == 0
        && line.addr() + 2 * size_of::<usize>() <= end
}

unsafe fn write_link(line: CacheLine, link: usize, to: CacheLine) {
    (line.as_ptr() as *mut usize).add(link).write_volatile(to.addr());
}
