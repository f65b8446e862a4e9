use super::{state::Effect, Tasklet};
use crossbeam::{queue::SegQueue, utils::Backoff};
use log::{error, info, trace, warn};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    thread::{self, JoinHandle, Thread},
    time::Duration,
};

// Only an idle worker with an empty queue parks; anything waiting on a
// tasklet (re-queue, kill) spins with backoff instead.
const IDLE_PARK: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub executions: u64,
    pub requeues: u64,
}

/// Pending tasklets, shared by every tasklet and worker of one scheduler.
pub(crate) struct RunQueue {
    pending: SegQueue<Arc<Tasklet>>,
    workers: OnceLock<Vec<Thread>>,
    next_wake: AtomicUsize,
    running: AtomicBool,
    executions: AtomicU64,
    requeues: AtomicU64,
}

impl RunQueue {
    pub(crate) fn new() -> RunQueue {
        RunQueue {
            pending: SegQueue::new(),
            workers: OnceLock::new(),
            next_wake: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            executions: AtomicU64::new(0),
            requeues: AtomicU64::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Queues `t` for the workers. Returns false, dropping the entry, once
    /// the workers have been told to stop.
    pub(crate) fn push(&self, t: Arc<Tasklet>) -> bool {
        if !self.running.load(Ordering::Acquire) {
            warn!(
                "Tasklet: {:p} scheduled after the workers stopped, dropped",
                Arc::as_ptr(&t)
            );
            return false;
        }
        self.pending.push(t);
        self.wake_one();
        true
    }

    fn requeue(&self, t: Arc<Tasklet>) {
        self.requeues.fetch_add(1, Ordering::Relaxed);
        self.pending.push(t);
    }

    fn wake_one(&self) {
        if let Some(workers) = self.workers.get() {
            if !workers.is_empty() {
                let i = self.next_wake.fetch_add(1, Ordering::Relaxed) % workers.len();
                workers[i].unpark();
            }
        }
    }

    /// Handles one dequeued tasklet. Returns false when it had to go back
    /// onto the queue.
    fn process(&self, t: Arc<Tasklet>) -> bool {
        if t.is_killed() {
            trace!("Tasklet: dropping queue entry of killed {:p}", Arc::as_ptr(&t));
            return true;
        }
        if t.disable_count() > 0 {
            self.requeue(t);
            return false;
        }
        match t.try_run() {
            Effect::Run => {
                self.executions.fetch_add(1, Ordering::Relaxed);
                true
            }
            Effect::Requeue => {
                self.requeue(t);
                false
            }
            _ => true,
        }
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            executions: self.executions.load(Ordering::Relaxed),
            requeues: self.requeues.load(Ordering::Relaxed),
        }
    }
}

fn worker_loop(queue: Arc<RunQueue>) {
    let backoff = Backoff::new();
    while queue.running.load(Ordering::Acquire) {
        match queue.pending.pop() {
            Some(t) => {
                if queue.process(t) {
                    backoff.reset();
                } else {
                    backoff.snooze();
                }
            }
            None if backoff.is_completed() => {
                thread::park_timeout(IDLE_PARK);
                backoff.reset();
            }
            None => backoff.snooze(),
        }
    }
}

/// Pool of worker threads draining one run queue.
///
/// Any number of workers gives the same guarantees; more workers only add
/// parallelism across different tasklets.
pub struct TaskletScheduler {
    queue: Arc<RunQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskletScheduler {
    pub fn new(workers: usize) -> io::Result<TaskletScheduler> {
        let workers = workers.max(1);
        let queue = Arc::new(RunQueue::new());
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let worker_queue = queue.clone();
            let handle = thread::Builder::new()
                .name(format!("tasklet/{i}"))
                .spawn(move || worker_loop(worker_queue));
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    queue.running.store(false, Ordering::Release);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }
        let _ = queue
            .workers
            .set(handles.iter().map(|h| h.thread().clone()).collect());
        info!("Tasklet: started {workers} worker(s)");
        Ok(TaskletScheduler { queue, handles })
    }

    /// Creates a tasklet whose runs go through this scheduler.
    pub fn tasklet<F>(&self, func: F) -> Arc<Tasklet>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Tasklet::new(self.queue.clone(), Box::new(func), false)
    }

    /// Like [`tasklet`](Self::tasklet), but starts with a disable count of 1.
    pub fn tasklet_disabled<F>(&self, func: F) -> Arc<Tasklet>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Tasklet::new(self.queue.clone(), Box::new(func), true)
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Queue entries not yet picked up, deferred ones included.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.queue.stats()
    }

    /// Stops and joins the workers. Runs still owed are dropped.
    pub fn shutdown(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.queue.running.store(false, Ordering::Release);
        for handle in self.handles.drain(..) {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("Tasklet: a worker panicked");
            }
        }
        let mut dropped = 0;
        while self.queue.pending.pop().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Tasklet: {dropped} pending run(s) dropped at shutdown");
        }
        let stats = self.queue.stats();
        info!(
            "Tasklet: workers stopped after {} execution(s), {} requeue(s)",
            stats.executions, stats.requeues
        );
    }
}

impl Drop for TaskletScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
