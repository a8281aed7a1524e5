use super::Worker;
use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

thread_local! {
    // Written only by the thread running the worker loop.
    static CURRENT_WORKER: RefCell<Option<Arc<Worker>>> = RefCell::new(None);
}

pub(crate) fn init_current(worker: &Arc<Worker>) {
    CURRENT_WORKER.with(|cell| *cell.borrow_mut() = Some(worker.clone()));
}

pub(crate) fn clean_current() {
    CURRENT_WORKER.with(|cell| *cell.borrow_mut() = None);
}

/// The worker whose loop is running on this thread, if any.
pub(crate) fn current() -> Option<Arc<Worker>> {
    CURRENT_WORKER.with(|cell| cell.borrow().clone())
}

/// Marks the current worker blocked for the lifetime of the guard.
///
/// Every suspension point (task wait, channel read/write, choice block,
/// mailbox receive, timer sleep) holds one of these while parked, so the
/// coordinator can count parked workers and compensate with fresh ones.
/// Guards nest; the worker counts as blocked while any guard is alive.
pub(crate) struct BlockedGuard {
    worker: Option<Arc<Worker>>,
}

impl BlockedGuard {
    pub(crate) fn new() -> Self {
        let worker = current();
        if let Some(ref worker) = worker {
            _ = worker.blocked.fetch_add(1, Ordering::SeqCst);
        }
        BlockedGuard { worker }
    }
}

impl Drop for BlockedGuard {
    fn drop(&mut self) {
        if let Some(ref worker) = self.worker {
            _ = worker.blocked.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
