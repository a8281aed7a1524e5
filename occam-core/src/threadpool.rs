use crate::config::Config;
use once_cell::sync::Lazy;
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

static POOL: Lazy<ThreadPool> = Lazy::new(ThreadPool::new);

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Directive {
    Run(Job),
    Exit,
}

/// A parked pooled thread waiting for its next directive.
#[derive(Default)]
struct Slot {
    directive: Mutex<Option<Directive>>,
    cond: Condvar,
}

impl Slot {
    fn deposit(&self, directive: Directive) {
        let mut guard = self
            .directive
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(directive);
        self.cond.notify_one();
    }

    fn collect(&self) -> Directive {
        let mut guard = self
            .directive
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(directive) = guard.take() {
                return directive;
            }
            guard = self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Leases OS threads for worker loops and detached tasks.
///
/// A thread that finishes its work parks itself instead of exiting, so
/// the next [`submit`] reuses it without paying thread creation again.
/// Idle threads live until [`terminate_free_threads`] is called.
///
/// [`submit`]: ThreadPool::submit
/// [`terminate_free_threads`]: ThreadPool::terminate_free_threads
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    idle: Mutex<Vec<Arc<Slot>>>,
}

impl ThreadPool {
    pub fn get_instance() -> &'static ThreadPool {
        &POOL
    }

    #[must_use]
    pub fn new() -> Self {
        ThreadPool {
            inner: Arc::new(PoolInner::default()),
        }
    }

    /// Run `work` on a pooled thread, reusing an idle one when possible.
    pub fn submit(&self, work: impl FnOnce() + Send + 'static) {
        let job: Job = Box::new(work);
        let recycled = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        if let Some(slot) = recycled {
            slot.deposit(Directive::Run(job));
            return;
        }
        let inner = self.inner.clone();
        let name = format!("occam-pool-{}", uuid::Uuid::new_v4());
        _ = std::thread::Builder::new()
            .name(name)
            .stack_size(Config::get_instance().get_stack_size())
            .spawn(move || Self::thread_main(&inner, job))
            .expect("failed to spawn pooled thread");
    }

    fn thread_main(inner: &Arc<PoolInner>, first: Job) {
        let mut job = Some(first);
        loop {
            if let Some(work) = job.take() {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(work)) {
                    crate::error!("pooled thread job failed:{:?}", payload);
                }
            }
            let slot = Arc::new(Slot::default());
            inner
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(slot.clone());
            match slot.collect() {
                Directive::Run(next) => job = Some(next),
                Directive::Exit => break,
            }
        }
    }

    /// Number of currently parked threads.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// End every currently idle pooled thread. Busy threads are
    /// unaffected and will park again once their work completes.
    pub fn terminate_free_threads(&self) {
        let drained = std::mem::take(
            &mut *self
                .inner
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for slot in drained {
            slot.deposit(Directive::Exit);
        }
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ThreadPool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("idle", &self.idle_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn reuses_parked_threads() {
        let pool = ThreadPool::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let ran = ran.clone();
            pool.submit(move || {
                _ = ran.fetch_add(1, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 4);
        // sequential submissions should have settled on a single thread
        assert_eq!(pool.idle_count(), 1);
        pool.terminate_free_threads();
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn survives_panicking_jobs() {
        let pool = ThreadPool::new();
        pool.submit(|| panic!("doomed job"));
        std::thread::sleep(Duration::from_millis(50));
        let ran = Arc::new(AtomicUsize::new(0));
        let observed = ran.clone();
        pool.submit(move || {
            _ = observed.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        pool.terminate_free_threads();
    }
}
