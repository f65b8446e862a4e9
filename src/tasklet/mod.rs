//! Tasklets: deferred work that never runs concurrently with itself.
//!
//! * Scheduling an already scheduled tasklet that has not started yet is a
//!   no-op; it still runs once.
//! * Scheduling a running tasklet, from its own body or from elsewhere, owes
//!   exactly one more run after the current one returns.
//! * Different tasklets run in parallel on any worker, in no particular order.
//! * While the disable count is positive a scheduled tasklet stays owed and
//!   keeps being re-queued instead of running.

pub mod scheduler;
pub mod state;

pub use scheduler::{SchedulerStats, TaskletScheduler};

use self::{
    scheduler::RunQueue,
    state::{AtomicTaskletState, Effect, Event, TaskletState},
};
use crossbeam::utils::Backoff;
use log::{error, trace, warn};
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

pub type TaskletFn = dyn Fn() + Send + Sync;

pub struct Tasklet {
    state: AtomicTaskletState,
    count: AtomicU32,
    func: Box<TaskletFn>,
    queue: Arc<RunQueue>,
}

impl Tasklet {
    pub(crate) fn new(queue: Arc<RunQueue>, func: Box<TaskletFn>, disabled: bool) -> Arc<Tasklet> {
        Arc::new(Tasklet {
            state: AtomicTaskletState::new(),
            count: AtomicU32::new(u32::from(disabled)),
            func,
            queue,
        })
    }

    /// Marks the tasklet SCHEDULED and queues it if that was a fresh
    /// transition. Returns whether this call queued a run.
    ///
    /// Once the scheduler has stopped nothing is queued anymore.
    pub fn schedule(self: &Arc<Self>) -> bool {
        match self.state.apply(Event::Schedule) {
            Effect::Enqueue => {
                if !self.queue.push(self.clone()) {
                    return false;
                }
                trace!("Tasklet: {:p} queued", Arc::as_ptr(self));
                true
            }
            _ => false,
        }
    }

    pub fn disable(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn enable(&self) {
        let dec = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        if dec.is_err() {
            warn!("Tasklet: {:p} enabled more often than disabled", self);
        }
    }

    pub fn disable_count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TaskletState {
        self.state.load()
    }

    pub fn is_scheduled(&self) -> bool {
        self.state().is_scheduled()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_killed(&self) -> bool {
        matches!(self.state(), TaskletState::Dying | TaskletState::Dead)
    }

    /// Busy-polls until no worker is running the tasklet.
    ///
    /// Backs off to `yield_now` after spinning but never sleeps.
    pub fn unlock_wait(&self) {
        let backoff = Backoff::new();
        while self.state().is_running() {
            backoff.snooze();
        }
    }

    /// Stops the tasklet for good. A pending run is dropped; a run already in
    /// progress is waited out. Nothing starts after this returns.
    ///
    /// Must not be called from the tasklet's own body, and the caller must
    /// make sure nobody schedules it anymore.
    pub fn kill(&self) {
        self.state.apply(Event::Kill);
        self.unlock_wait();
        trace!("Tasklet: {:p} killed", self);
    }

    /// Worker side: takes RUNNING and calls the body if the state allows.
    ///
    /// A panicking body is logged and counts as a finished run; the worker
    /// keeps going.
    pub(crate) fn try_run(&self) -> Effect {
        let effect = self.state.apply(Event::Lock);
        if effect == Effect::Run {
            let _unlock = RunGuard(&self.state);
            if panic::catch_unwind(AssertUnwindSafe(|| (self.func)())).is_err() {
                error!("Tasklet: {:p} panicked", self);
            }
        }
        effect
    }
}

impl fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tasklet")
            .field("state", &self.state())
            .field("count", &self.disable_count())
            .finish()
    }
}

// Releases RUNNING on every way out of the body.
struct RunGuard<'a>(&'a AtomicTaskletState);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.apply(Event::Unlock);
    }
}

#[cfg(test)]
mod tests {
    use super::{scheduler::RunQueue, state::Effect, state::TaskletState, Tasklet};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn counting(queue: &Arc<RunQueue>, hits: &Arc<AtomicUsize>) -> Arc<Tasklet> {
        let hits = hits.clone();
        Tasklet::new(
            queue.clone(),
            Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        )
    }

    #[test]
    fn test_schedule_enqueues_once() {
        let queue = Arc::new(RunQueue::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let t = counting(&queue, &hits);
        assert!(t.schedule());
        assert!(!t.schedule());
        assert!(!t.schedule());
        assert_eq!(1, queue.len());
        assert!(t.is_scheduled());
    }

    #[test]
    fn test_try_run_clears_flags() {
        let queue = Arc::new(RunQueue::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let t = counting(&queue, &hits);
        t.schedule();
        assert_eq!(Effect::Run, t.try_run());
        assert_eq!(1, hits.load(Ordering::SeqCst));
        assert_eq!(TaskletState::Idle, t.state());
    }

    #[test]
    fn test_disable_count() {
        let queue = Arc::new(RunQueue::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let t = counting(&queue, &hits);
        t.disable();
        t.disable();
        assert_eq!(2, t.disable_count());
        t.enable();
        t.enable();
        t.enable();
        assert_eq!(0, t.disable_count());
    }

    #[test]
    fn test_kill_idle_and_scheduled() {
        let queue = Arc::new(RunQueue::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let t = counting(&queue, &hits);
        t.schedule();
        t.kill();
        assert!(t.is_killed());
        assert_eq!(Effect::Discard, t.try_run());
        assert!(!t.schedule());
        assert_eq!(0, hits.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_body_releases_running() {
        let queue = Arc::new(RunQueue::new());
        let t = Tasklet::new(
            queue,
            Box::new(|| {
                panic!("tasklet body");
            }),
            false,
        );
        t.schedule();
        assert_eq!(Effect::Run, t.try_run());
        assert_eq!(TaskletState::Idle, t.state());
        assert!(t.schedule());
        t.kill();
    }
}
