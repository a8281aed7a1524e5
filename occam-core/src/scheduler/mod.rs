use crate::config::Config;
use crate::task::RawTask;
use crate::threadpool::ThreadPool;
use occam_queue::Deque;
use once_cell::sync::Lazy;
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};

pub(crate) mod current;

static SCHEDULER: Lazy<Scheduler> = Lazy::new(Scheduler::new);

/// A task reference queued on a worker deque. Compared by identity so a
/// joiner can pull a specific task back out of its own deque.
pub(crate) struct ScheduledTask(pub(crate) Arc<RawTask>);

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// One work-stealing worker: a deque plus the flags the coordinator
/// steers it with.
pub(crate) struct Worker {
    pub(crate) deque: Deque<ScheduledTask>,
    scheduler: Weak<SchedulerInner>,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    /// Depth of nested suspension points currently parking this worker.
    pub(crate) blocked: AtomicUsize,
}

impl Worker {
    fn new(scheduler: &Arc<SchedulerInner>) -> Self {
        Worker {
            deque: Deque::new(Config::get_instance().get_deque_capacity()),
            scheduler: Arc::downgrade(scheduler),
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            blocked: AtomicUsize::new(0),
        }
    }
}

struct SchedulerInner {
    workers: Mutex<Vec<Arc<Worker>>>,
    /// Overflow queue for tasks submitted outside any worker and for
    /// work drained from retiring workers.
    global: Deque<ScheduledTask>,
    /// Serializes owner-side operations on the global deque, which has
    /// no single owner thread.
    global_owner: Mutex<()>,
    shutdown: Mutex<bool>,
    wake: Condvar,
}

impl SchedulerInner {
    fn global_is_empty(&self) -> bool {
        let _owner = self
            .global_owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.global.is_empty()
    }

    fn push_global(&self, task: ScheduledTask) {
        {
            let _owner = self
                .global_owner
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.global.push(task);
        }
        // taking the shutdown lock orders the notify after a parked
        // coordinator's emptiness check, so the wakeup cannot be lost
        let _parked = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_all();
    }

    /// Coordinator loop: one long-lived control thread, pinned away
    /// from the workers, that rebalances the ring every poll interval.
    fn coordinate(self: &Arc<Self>) {
        if let Some(core) = core_affinity::get_core_ids().and_then(|ids| ids.first().copied()) {
            _ = core_affinity::set_for_current(core);
        }
        loop {
            {
                let stop = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
                if *stop {
                    break;
                }
            }
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.balance())) {
                crate::error!("coordinator pass failed:{:?}", payload);
            }
            let stop = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
            if *stop {
                break;
            }
            let idle = self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
                && self.global_is_empty();
            if idle {
                // nothing to steer; park until a submit or shutdown
                drop(
                    self.wake
                        .wait(stop)
                        .unwrap_or_else(PoisonError::into_inner),
                );
            } else {
                drop(
                    self.wake
                        .wait_timeout(stop, Config::get_instance().get_poll_interval())
                        .unwrap_or_else(PoisonError::into_inner),
                );
            }
        }
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for worker in workers {
            worker.stop_requested.store(true, Ordering::SeqCst);
        }
    }

    /// One rebalancing pass: drop retired workers, stop the surplus,
    /// spawn replacements while work is queued and cores are idle.
    fn balance(self: &Arc<Self>) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        workers.retain(|worker| !worker.stopped.load(Ordering::SeqCst));
        let cores = Config::get_instance().get_core_count();
        let stopping = workers
            .iter()
            .filter(|worker| worker.stop_requested.load(Ordering::SeqCst))
            .count();
        let blocked = workers
            .iter()
            .filter(|worker| {
                worker.blocked.load(Ordering::SeqCst) > 0
                    && !worker.stop_requested.load(Ordering::SeqCst)
            })
            .count();
        let mut active = workers.len().saturating_sub(stopping + blocked);
        if active > cores {
            for worker in workers.iter() {
                if active <= cores {
                    break;
                }
                if !worker.stop_requested.load(Ordering::SeqCst)
                    && worker.blocked.load(Ordering::SeqCst) == 0
                {
                    worker.stop_requested.store(true, Ordering::SeqCst);
                    active -= 1;
                }
            }
        }
        let work_queued =
            !self.global_is_empty() || workers.iter().any(|worker| !worker.deque.is_empty());
        if work_queued && active < cores {
            let missing = cores - active;
            for _ in 0..missing {
                let worker = Arc::new(Worker::new(self));
                workers.push(worker.clone());
                let inner = self.clone();
                ThreadPool::get_instance().submit(move || inner.run_worker(&worker));
            }
            drop(workers);
            crate::info!("scheduler spawned {} worker(s)", missing);
        }
    }

    /// Worker loop: local pop first, then steal in ring order, then a
    /// deque swap with the global queue, then retire.
    fn run_worker(self: &Arc<Self>, worker: &Arc<Worker>) {
        current::init_current(worker);
        loop {
            if worker.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            if let Some(task) = worker.deque.pop() {
                task.0.run();
                continue;
            }
            if self.steal_for(worker) {
                continue;
            }
            {
                let _owner = self
                    .global_owner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                self.global.swap(&worker.deque);
            }
            if worker.deque.is_empty() {
                break;
            }
        }
        // hand leftovers back so a successor can pick them up
        {
            let _owner = self
                .global_owner
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            while let Some(task) = worker.deque.pop() {
                self.global.push(task);
            }
        }
        current::clean_current();
        worker.stopped.store(true, Ordering::SeqCst);
    }

    fn steal_for(self: &Arc<Self>, worker: &Arc<Worker>) -> bool {
        let peers = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if peers.is_empty() {
            return false;
        }
        let position = peers
            .iter()
            .position(|peer| Arc::ptr_eq(peer, worker))
            .unwrap_or(0);
        for step in 1..peers.len() {
            let peer = &peers[(position + step) % peers.len()];
            if let Some(task) = peer.deque.steal() {
                worker.deque.push(task);
                return true;
            }
        }
        false
    }
}

/// The work-stealing task scheduler.
///
/// Most programs use the process-wide instance behind
/// [`get_instance`]; tests may construct isolated instances. Worker
/// threads are leased from the [`ThreadPool`] and steered by a single
/// coordinator thread that detects parked workers and compensates with
/// replacements, so tasks may block inside channel operations without
/// starving the cores.
///
/// [`get_instance`]: Scheduler::get_instance
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn get_instance() -> &'static Scheduler {
        &SCHEDULER
    }

    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(SchedulerInner {
            workers: Mutex::new(Vec::new()),
            global: Deque::new(Config::get_instance().get_deque_capacity()),
            global_owner: Mutex::new(()),
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });
        let coordinator = inner.clone();
        _ = std::thread::Builder::new()
            .name("occam-coordinator".to_string())
            .spawn(move || coordinator.coordinate())
            .expect("failed to spawn coordinator thread");
        Scheduler { inner }
    }

    /// Queue a task for execution: onto the calling worker's own deque
    /// when called from a worker of this scheduler, else onto the
    /// global overflow queue.
    pub(crate) fn submit(&self, task: Arc<RawTask>) {
        if let Some(worker) = current::current() {
            if worker.scheduler.ptr_eq(&Arc::downgrade(&self.inner))
                && !worker.stop_requested.load(Ordering::SeqCst)
            {
                worker.deque.push(ScheduledTask(task));
                return;
            }
        }
        self.inner.push_global(ScheduledTask(task));
    }

    /// Stop the coordinator and request every worker to stop. Queued
    /// tasks that never ran stay queued; their joiners observe nothing.
    pub fn shutdown(&self) {
        {
            let mut stop = self
                .inner
                .shutdown
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *stop = true;
        }
        self.inner.wake.notify_all();
    }

    /// Number of live workers, parked ones included.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::task::{Async, Task};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn runs_submitted_tasks() {
        let finished = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let finished = finished.clone();
                let task = Async::new(move |_| {
                    _ = finished.fetch_add(1, Ordering::SeqCst);
                });
                task.start().unwrap();
                task
            })
            .collect();
        for task in &tasks {
            task.wait().unwrap();
        }
        assert_eq!(finished.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn tasks_spawned_inside_tasks_complete() {
        // divide-and-conquer shape: each level waits on its children
        fn fanout(depth: usize, counter: &Arc<AtomicUsize>) {
            _ = counter.fetch_add(1, Ordering::SeqCst);
            if depth == 0 {
                return;
            }
            let children: Vec<_> = (0..2)
                .map(|_| {
                    let counter = counter.clone();
                    let child = Async::new(move |_: &Task| fanout(depth - 1, &counter));
                    child.start().unwrap();
                    child
                })
                .collect();
            for child in children {
                child.wait().unwrap();
            }
        }
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let root = Async::new(move |_| fanout(4, &seen));
        root.start().unwrap();
        root.wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 31);
    }

    #[test]
    fn stays_live_when_tasks_block() {
        // more sleepers than cores; compensation must keep one more
        // independent task from starving
        let cores = crate::config::Config::get_instance().get_core_count();
        let sleepers: Vec<_> = (0..cores * 2)
            .map(|_| {
                let task = Async::new(|_| crate::timer::sleep(Duration::from_millis(300)));
                task.start().unwrap();
                task
            })
            .collect();
        let late = Async::new(|_| {});
        late.start().unwrap();
        let begin = Instant::now();
        late.wait().unwrap();
        assert!(begin.elapsed() < Duration::from_secs(5));
        for sleeper in sleepers {
            sleeper.wait().unwrap();
        }
    }
}
