//! A second thread that loads, times and traverses lines on request.
//!
//! The caller and the helper meet in a single-slot [`Handoff`]: the caller
//! posts one action, the helper runs it and replies, and only then may the
//! caller post the next one. Both sides spin instead of parking because the
//! actions take well under a microsecond and a wake-up would dominate the
//! timings they are part of.
use crate::access;
use crate::cache_line::CacheLine;
use crate::error::Result;
use crate::timer::Timer;
use crossbeam_utils::CachePadded;
use log::{debug, warn};
use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const BOOT: u8 = 0;
const IDLE: u8 = 1;
const POSTED: u8 = 2;
const DONE: u8 = 3;

/// Strictly alternating rendezvous between one caller and one worker.
///
/// ```text
/// caller writes msg, Release-stores POSTED  ->  worker Acquire-loads POSTED, reads msg
/// worker writes reply, Release-stores DONE  ->  caller Acquire-loads DONE, reads reply
/// ```
pub(crate) struct Handoff<M, R> {
    state: CachePadded<AtomicU8>,
    msg: UnsafeCell<Option<M>>,
    reply: UnsafeCell<R>,
}

// Each cell is owned by exactly one side in each state.
unsafe impl<M: Send, R: Send> Sync for Handoff<M, R> {}
unsafe impl<M: Send, R: Send> Send for Handoff<M, R> {}

impl<M, R: Default> Handoff<M, R> {
    pub(crate) fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicU8::new(BOOT)),
            msg: UnsafeCell::new(None),
            reply: UnsafeCell::new(R::default()),
        }
    }

    fn spin_until(&self, state: u8) {
        while self.state.load(Ordering::Acquire) != state {
            spin_loop();
        }
    }

    /// Worker side: ready for the first message.
    pub(crate) fn ready(&self) {
        self.state.store(IDLE, Ordering::Release);
    }

    pub(crate) fn wait_ready(&self) {
        while self.state.load(Ordering::Acquire) == BOOT {
            spin_loop();
        }
    }

    /// Caller side. Must alternate with [`Handoff::wait`].
    pub(crate) fn post(&self, msg: M) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), IDLE);
        unsafe { *self.msg.get() = Some(msg) };
        self.state.store(POSTED, Ordering::Release);
    }

    /// Caller side: blocks until the worker replied.
    pub(crate) fn wait(&self) -> R {
        self.spin_until(DONE);
        let reply = unsafe { std::mem::take(&mut *self.reply.get()) };
        self.state.store(IDLE, Ordering::Relaxed);
        reply
    }

    /// Worker side: blocks until a message is posted.
    pub(crate) fn recv(&self) -> Option<M> {
        self.spin_until(POSTED);
        unsafe { (*self.msg.get()).take() }
    }

    /// Worker side: publishes the reply to the last message.
    pub(crate) fn reply(&self, reply: R) {
        unsafe { *self.reply.get() = reply };
        self.state.store(DONE, Ordering::Release);
    }
}

/// Work for the helper thread.
#[derive(Copy, Clone, Debug)]
pub enum Task<'a> {
    ReadSingle(CacheLine),
    /// Replies with the latency of the load.
    TimeSingle(CacheLine),
    /// The sliding-window prime pattern of [`access::prime`], sweeping each
    /// window backward or forward.
    Prime {
        lines: &'a [CacheLine],
        repeat: usize,
        stride: usize,
        block: usize,
        backward: bool,
    },
    /// `repeat` backward sweeps.
    Traverse { lines: &'a [CacheLine], repeat: usize },
}

struct RawLines {
    ptr: *const CacheLine,
    len: usize,
}

unsafe impl Send for RawLines {}

impl RawLines {
    fn new(lines: &[CacheLine]) -> Self {
        Self {
            ptr: lines.as_ptr(),
            len: lines.len(),
        }
    }

    /// The borrow the lines came from must outlive the action.
    unsafe fn get<'a>(&self) -> &'a [CacheLine] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

enum Action {
    Stop,
    ReadSingle(CacheLine),
    TimeSingle(CacheLine),
    Prime {
        lines: RawLines,
        repeat: usize,
        stride: usize,
        block: usize,
        backward: bool,
    },
    Traverse {
        lines: RawLines,
        repeat: usize,
    },
}

impl From<Task<'_>> for Action {
    fn from(task: Task<'_>) -> Self {
        match task {
            Task::ReadSingle(line) => Action::ReadSingle(line),
            Task::TimeSingle(line) => Action::TimeSingle(line),
            Task::Prime {
                lines,
                repeat,
                stride,
                block,
                backward,
            } => Action::Prime {
                lines: RawLines::new(lines),
                repeat,
                stride,
                block,
                backward,
            },
            Task::Traverse { lines, repeat } => Action::Traverse {
                lines: RawLines::new(lines),
                repeat,
            },
        }
    }
}

fn serve<T: Timer>(timer: Arc<T>, handoff: Arc<Handoff<Action, u64>>, core: Option<usize>) {
    if let Some(core) = core {
        if let Err(err) = affinity::set_thread_affinity([core]) {
            warn!("Failed to pin the helper thread to core {}: {}", core, err);
        }
    }
    handoff.ready();

    loop {
        let Some(action) = handoff.recv() else {
            handoff.reply(0);
            continue;
        };

        let reply = match action {
            Action::Stop => {
                handoff.reply(0);
                return;
            }
            Action::ReadSingle(line) => {
                timer.load(line);
                0
            }
            Action::TimeSingle(line) => timer.time_load(line).cycles,
            Action::Prime {
                lines,
                repeat,
                stride,
                block,
                backward,
            } => {
                let lines = unsafe { lines.get() };
                if backward {
                    access::prime(&*timer, lines, repeat, stride, block);
                } else {
                    access::prime_fwd(&*timer, lines, repeat, stride, block);
                }
                0
            }
            Action::Traverse { lines, repeat } => {
                access::traverse(&*timer, unsafe { lines.get() }, repeat);
                0
            }
        };
        handoff.reply(reply);
    }
}

/// Waits for an outstanding action even when the caller's closure unwinds,
/// so the helper never reads lines whose borrow has ended.
struct Pending<'h> {
    handoff: &'h Handoff<Action, u64>,
    done: bool,
}

impl Pending<'_> {
    fn finish(mut self) -> u64 {
        self.done = true;
        self.handoff.wait()
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.handoff.wait();
        }
    }
}

/// Handle on a running helper thread. Dropping it stops the thread.
///
/// The handoff has a single slot, so only one thread may post to it. The
/// handle can be moved to another thread but not shared between threads:
///
/// ```compile_fail
/// fn shared<T: Sync>() {}
/// shared::<evset_rs::HelperThread>();
/// ```
pub struct HelperThread {
    handoff: Arc<Handoff<Action, u64>>,
    handle: Option<JoinHandle<()>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl HelperThread {
    /// Spawns the helper, optionally pinned to `core`, and waits until it
    /// polls for work.
    pub fn start<T: Timer + 'static>(timer: Arc<T>, core: Option<usize>) -> Result<Self> {
        let handoff = Arc::new(Handoff::new());
        let worker = handoff.clone();
        let handle = thread::Builder::new()
            .name("evset-helper".into())
            .spawn(move || serve(timer, worker, core))?;
        handoff.wait_ready();
        debug!("Helper thread started (core {:?})", core);

        Ok(Self {
            handoff,
            handle: Some(handle),
            _not_sync: PhantomData,
        })
    }

    /// Runs `task` on the helper and `f` on the calling thread at the same
    /// time. Returns once both are done.
    pub fn concurrently<R>(&self, task: Task<'_>, f: impl FnOnce() -> R) -> (u64, R) {
        self.handoff.post(task.into());
        let pending = Pending {
            handoff: &self.handoff,
            done: false,
        };
        let result = f();
        (pending.finish(), result)
    }

    pub fn run(&self, task: Task<'_>) -> u64 {
        self.concurrently(task, || ()).0
    }

    pub fn read_single(&self, line: CacheLine) {
        self.run(Task::ReadSingle(line));
    }

    pub fn time_single(&self, line: CacheLine) -> u64 {
        self.run(Task::TimeSingle(line))
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.handoff.post(Action::Stop);
            self.handoff.wait();
            if handle.join().is_err() {
                warn!("Helper thread panicked");
            }
            debug!("Helper thread stopped");
        }
    }
}

impl Drop for HelperThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimulatedCache};

    fn sim() -> Arc<SimulatedCache> {
        Arc::new(SimulatedCache::new(SimConfig::default()))
    }

    #[test]
    fn handoff_alternates() {
        let handoff = Arc::new(Handoff::<u64, u64>::new());
        let worker = handoff.clone();
        let handle = thread::spawn(move || {
            worker.ready();
            for _ in 0..100 {
                let msg = worker.recv().unwrap_or(0);
                worker.reply(msg * 2);
            }
        });

        handoff.wait_ready();
        for i in 0..100 {
            handoff.post(i);
            assert_eq!(handoff.wait(), i * 2);
        }
        handle.join().unwrap();
    }

    #[test]
    fn helper_loads_are_visible() {
        let sim = sim();
        let helper = HelperThread::start(sim.clone(), None).unwrap();
        let line = CacheLine::from_addr(0x40_0000);

        helper.read_single(line);
        assert!(sim.is_cached(line));
        assert_eq!(helper.time_single(line), 4);
        helper.stop();
    }

    #[test]
    fn concurrently_runs_both_sides() {
        let sim = sim();
        let helper = HelperThread::start(sim.clone(), None).unwrap();
        let lines: Vec<_> = (0..8)
            .map(|i| CacheLine::from_addr(0x80_0000 + i * crate::PAGE_SIZE))
            .collect();

        let before = sim.loads();
        let (_, local) = helper.concurrently(
            Task::Traverse {
                lines: &lines,
                repeat: 2,
            },
            || {
                access::access_bwd(&*sim, &lines);
                7
            },
        );

        assert_eq!(local, 7);
        assert_eq!(sim.loads() - before, 24);
    }

    #[test]
    fn prime_runs_in_either_direction() {
        let sim = sim();
        let helper = HelperThread::start(sim.clone(), None).unwrap();
        let lines: Vec<_> = (0..6)
            .map(|i| CacheLine::from_addr(0xc0_0000 + i * crate::PAGE_SIZE))
            .collect();

        for backward in [true, false] {
            let before = sim.loads();
            helper.run(Task::Prime {
                lines: &lines,
                repeat: 2,
                stride: 3,
                block: 3,
                backward,
            });
            assert_eq!(sim.loads() - before, 12, "backward: {}", backward);
        }
        helper.stop();
    }

    #[test]
    fn handle_moves_to_another_thread() {
        fn moves<T: Send>() {}
        moves::<HelperThread>();

        let sim = sim();
        let helper = HelperThread::start(sim.clone(), None).unwrap();
        let line = CacheLine::from_addr(0x40_0000);
        let cycles = thread::spawn(move || {
            helper.read_single(line);
            helper.time_single(line)
        })
        .join()
        .unwrap();
        assert_eq!(cycles, 4);
    }

    #[test]
    fn drop_stops_the_thread() {
        let sim = sim();
        let helper = HelperThread::start(sim.clone(), None).unwrap();
        drop(helper);
        assert_eq!(Arc::strong_count(&sim), 1);
    }
}
