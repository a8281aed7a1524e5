use crate::choice::{ChoiceInner, Enabled, Selectable};
use crate::scheduler::current::BlockedGuard;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

static SERVICE: Lazy<TimerService> = Lazy::new(TimerService::start);

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Deadline-ordered one-shot callbacks, fired by a single service
/// thread.
struct TimerService {
    shared: Arc<TimerShared>,
}

struct TimerShared {
    entries: Mutex<BTreeMap<Instant, Vec<Callback>>>,
    changed: Condvar,
}

impl TimerService {
    fn start() -> Self {
        let shared = Arc::new(TimerShared {
            entries: Mutex::new(BTreeMap::new()),
            changed: Condvar::new(),
        });
        let worker = shared.clone();
        _ = std::thread::Builder::new()
            .name("occam-timer".to_string())
            .spawn(move || Self::run(&worker))
            .expect("failed to spawn timer thread");
        TimerService { shared }
    }

    fn run(shared: &Arc<TimerShared>) {
        let mut entries = shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            let now = Instant::now();
            if let Some((&deadline, _)) = entries.first_key_value() {
                if deadline <= now {
                    let due = entries.remove(&deadline).unwrap_or_default();
                    drop(entries);
                    for callback in due {
                        if let Err(payload) = std::panic::catch_unwind(
                            std::panic::AssertUnwindSafe(callback),
                        ) {
                            crate::error!("timer callback failed:{:?}", payload);
                        }
                    }
                    entries = shared
                        .entries
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                } else {
                    entries = shared
                        .changed
                        .wait_timeout(entries, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            } else {
                entries = shared
                    .changed
                    .wait(entries)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    fn arm(&self, delay: Duration, callback: Callback) {
        let deadline = Instant::now() + delay;
        let mut entries = self
            .shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        entries.entry(deadline).or_default().push(callback);
        self.shared.changed.notify_all();
    }
}

/// Schedule `callback` to run once on the timer thread after `delay`.
/// Non-blocking; the callback must not block the timer thread for long.
pub fn arm(delay: Duration, callback: impl FnOnce() + Send + 'static) {
    SERVICE.arm(delay, Box::new(callback));
}

/// Block the calling thread for `delay`, counting as a suspension point
/// for the scheduler's blocked-worker detection.
pub fn sleep(delay: Duration) {
    let _blocked = BlockedGuard::new();
    std::thread::sleep(delay);
}

struct TimerCell {
    pending: bool,
    /// Bumped on every re-arm so a stale fire from an earlier arm
    /// cannot set `pending`.
    generation: u64,
    observer: Option<(Weak<ChoiceInner>, usize)>,
}

pub(crate) struct TimerCore {
    cell: Mutex<TimerCell>,
}

impl TimerCore {
    fn fire(&self, generation: u64) {
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if cell.generation != generation {
            return;
        }
        cell.pending = true;
        if let Some((observer, index)) = cell.observer.take() {
            if let Some(choice) = observer.upgrade() {
                // a timer expiry cannot be reserved, so the selector
                // identity the choice hands back is deliberately unused
                _ = choice.signal(index);
            }
        }
    }
}

impl Selectable for TimerCore {
    fn mark(&self) {}

    fn enable(
        &self,
        choice: &Arc<ChoiceInner>,
        index: usize,
        _selector: std::thread::ThreadId,
    ) -> Enabled {
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if cell.pending {
            if choice.claim_scan(index) {
                return Enabled::Ready;
            }
            return Enabled::Resolved;
        }
        cell.observer = Some((Arc::downgrade(choice), index));
        Enabled::Registered
    }

    fn disable(&self, choice: &Arc<ChoiceInner>) {
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((ref observer, _)) = cell.observer {
            if observer.ptr_eq(&Arc::downgrade(choice)) {
                cell.observer = None;
            }
        }
    }

    fn on_selected(&self) {
        // expiry is consumed by selection; the timer reads not-pending
        // until the next arm
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        cell.pending = false;
    }
}

/// A re-armable one-shot timeout usable as a choice alternative.
///
/// [`arm`](Timer::arm) schedules the next expiry and clears any earlier
/// pending one. When the expiry fires while a choice is waiting on this
/// timer, the choice is signalled directly; selection consumes the
/// expiry. A timer should participate in one choice at a time.
pub struct Timer {
    pub(crate) core: Arc<TimerCore>,
}

impl Timer {
    #[must_use]
    pub fn new() -> Self {
        Timer {
            core: Arc::new(TimerCore {
                cell: Mutex::new(TimerCell {
                    pending: false,
                    generation: 0,
                    observer: None,
                }),
            }),
        }
    }

    /// Schedule the next expiry `delay` from now, superseding any
    /// earlier arm that has not fired yet.
    pub fn arm(&self, delay: Duration) {
        let generation = {
            let mut cell = self
                .core
                .cell
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            cell.pending = false;
            cell.generation += 1;
            cell.generation
        };
        let core = self.core.clone();
        arm(delay, move || core.fire(generation));
    }

    /// Whether an expiry has fired and not yet been consumed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.core
            .cell
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Timer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("pending", &self.is_pending())
            .finish()
    }
}
