//! Tasklet state machine.
//!
//! SCHEDULED and RUNNING live in one atomic byte together with the terminal
//! states entered by `kill`, so every transition is a single compare-exchange
//! driven by [`TaskletState::on`].

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskletState {
    Idle = 0,
    /// SCHEDULED: one run is owed and a queue entry carries it.
    Scheduled = 1,
    /// RUNNING: a worker holds the tasklet.
    Running = 2,
    /// RUNNING | SCHEDULED: rescheduled while running, e.g. from its own body.
    RunningScheduled = 3,
    /// Killed while running; becomes `Dead` when that run returns.
    Dying = 4,
    Dead = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Schedule,
    /// A worker dequeued the tasklet and tries to take RUNNING.
    Lock,
    Unlock,
    Kill,
}

/// What the caller must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    NoOp,
    /// Push the tasklet onto the run queue.
    Enqueue,
    /// RUNNING acquired and SCHEDULED cleared: call the body.
    Run,
    /// Held elsewhere: push the tasklet back.
    Requeue,
    /// The queue entry no longer carries a run: drop it.
    Discard,
}

impl TaskletState {
    pub const fn on(self, event: Event) -> (TaskletState, Effect) {
        use Effect::*;
        use TaskletState::*;
        match (self, event) {
            (Idle, Event::Schedule) => (Scheduled, Enqueue),
            (Running, Event::Schedule) => (RunningScheduled, Enqueue),
            (state, Event::Schedule) => (state, NoOp),

            (Scheduled, Event::Lock) => (Running, Run),
            (RunningScheduled, Event::Lock) => (RunningScheduled, Requeue),
            (state, Event::Lock) => (state, Discard),

            (Running, Event::Unlock) => (Idle, NoOp),
            (RunningScheduled, Event::Unlock) => (Scheduled, NoOp),
            (Dying, Event::Unlock) => (Dead, NoOp),
            (state, Event::Unlock) => (state, NoOp),

            (Running | RunningScheduled | Dying, Event::Kill) => (Dying, NoOp),
            (_, Event::Kill) => (Dead, NoOp),
        }
    }

    const fn from_u8(v: u8) -> TaskletState {
        match v {
            0 => TaskletState::Idle,
            1 => TaskletState::Scheduled,
            2 => TaskletState::Running,
            3 => TaskletState::RunningScheduled,
            4 => TaskletState::Dying,
            _ => TaskletState::Dead,
        }
    }

    pub fn is_scheduled(self) -> bool {
        matches!(self, TaskletState::Scheduled | TaskletState::RunningScheduled)
    }

    pub fn is_running(self) -> bool {
        matches!(
            self,
            TaskletState::Running | TaskletState::RunningScheduled | TaskletState::Dying
        )
    }
}

#[derive(Debug)]
pub struct AtomicTaskletState(AtomicU8);

impl AtomicTaskletState {
    pub const fn new() -> AtomicTaskletState {
        AtomicTaskletState(AtomicU8::new(TaskletState::Idle as u8))
    }

    pub fn load(&self) -> TaskletState {
        TaskletState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Applies `event` atomically and returns the effect of the transition
    /// that took place.
    ///
    /// Always a read-modify-write, even when the state does not change, so a
    /// coalesced schedule still orders the caller's writes before the run
    /// that absorbs it. Acquire on the way in pairs with the release of the
    /// previous `Unlock`.
    pub fn apply(&self, event: Event) -> Effect {
        let mut current = self.load();
        loop {
            let (next, effect) = current.on(event);
            match self.0.compare_exchange_weak(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return effect,
                Err(actual) => current = TaskletState::from_u8(actual),
            }
        }
    }
}

impl Default for AtomicTaskletState {
    fn default() -> Self {
        Self::new()
    }
}
