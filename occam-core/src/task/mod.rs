use crate::error::{Error, Result};
use crate::scheduler::current::BlockedGuard;
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::threadpool::ThreadPool;
use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};

pub use mailbox::Address;

pub(crate) mod current;

pub mod mailbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    NotStarted,
    Running,
    Done,
}

type Body = Box<dyn FnOnce(&Task) + Send + 'static>;

pub(crate) struct RawTask {
    name: String,
    status: Mutex<Status>,
    done: Condvar,
    started: AtomicBool,
    cancelled: AtomicBool,
    cause: Mutex<Option<Arc<str>>>,
    parent: Mutex<Weak<RawTask>>,
    children: Mutex<Vec<Arc<RawTask>>>,
    pub(crate) mailbox: mailbox::Mailbox,
    body: Mutex<Option<Body>>,
}

impl RawTask {
    fn new(body: Body) -> Arc<Self> {
        Arc::new(RawTask {
            name: format!("occam-task-{}", uuid::Uuid::new_v4()),
            status: Mutex::new(Status::NotStarted),
            done: Condvar::new(),
            started: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cause: Mutex::new(None),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            mailbox: mailbox::Mailbox::new(),
            body: Mutex::new(Some(body)),
        })
    }

    fn cancelled_error(&self) -> Error {
        Error::Cancelled {
            cause: self
                .cause
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// One-shot start reservation plus adoption under the current task.
    ///
    /// `Ok(true)` means the caller won the reservation and must arrange
    /// execution. `Ok(false)` means someone already did. `Err` means the
    /// task is cancelled, or its would-be parent already is; in that
    /// case the task is finished on the spot so joiners never park on a
    /// body that will never run.
    fn reserve(self: &Arc<Self>) -> Result<bool> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(self.cancelled_error());
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }
        if let Some(parent) = current::current() {
            *self.parent.lock().unwrap_or_else(PoisonError::into_inner) =
                Arc::downgrade(&parent);
            parent
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(self.clone());
            // the parent may have been cancelled before we registered;
            // re-checking after the push means no child is lost
            if parent.cancelled.load(Ordering::SeqCst) {
                let cause = parent
                    .cause
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                self.cancel_with_cause(cause);
                self.finish();
                return Err(self.cancelled_error());
            }
        }
        if self.cancelled.load(Ordering::SeqCst) {
            self.finish();
            return Err(self.cancelled_error());
        }
        Ok(true)
    }

    /// Execute the body on the calling thread. Requires a won
    /// reservation; called by workers, pooled threads and inline joins.
    pub(crate) fn run(self: &Arc<Self>) {
        if !self.cancelled.load(Ordering::SeqCst) {
            {
                let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
                *status = Status::Running;
            }
            let body = self
                .body
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(body) = body {
                let task = Task { raw: self.clone() };
                let _scope = current::TaskScope::enter(self);
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| body(&task))) {
                    let cause = panic_cause(payload.as_ref());
                    crate::error!("task {} failed: {}", self.name, cause);
                    self.cancel_with_cause(Some(cause));
                }
            }
        }
        self.finish();
    }

    fn finish(self: &Arc<Self>) {
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            *status = Status::Done;
            self.done.notify_all();
        }
        // drop the owning edge from the parent so the subtree can free
        if let Some(parent) = self
            .parent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
        {
            parent
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|child| !Arc::ptr_eq(child, self));
        }
    }

    fn cancel_with_cause(&self, cause: Option<Arc<str>>) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.cause.lock().unwrap_or_else(PoisonError::into_inner) = cause.clone();
        self.mailbox.cancel();
        let children = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for child in children {
            child.cancel_with_cause(cause.clone());
        }
    }

    /// Blocking join, helping where possible instead of parking.
    fn await_done(self: &Arc<Self>) -> Result<()> {
        let done = *self.status.lock().unwrap_or_else(PoisonError::into_inner) == Status::Done;
        if !done {
            match self.reserve() {
                // never scheduled; run it right here
                Ok(true) => self.run(),
                Ok(false) => {
                    if !self.swipe_and_run() {
                        let mut status =
                            self.status.lock().unwrap_or_else(PoisonError::into_inner);
                        if *status != Status::Done {
                            let _blocked = BlockedGuard::new();
                            while *status != Status::Done {
                                status = self
                                    .done
                                    .wait(status)
                                    .unwrap_or_else(PoisonError::into_inner);
                            }
                        }
                    }
                }
                Err(error) => return Err(error),
            }
        }
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(self.cancelled_error());
        }
        Ok(())
    }

    /// Pull the task out of the calling worker's own deque and run it
    /// inline. Fails when this thread is no worker, or the task has
    /// been stolen or queued elsewhere.
    fn swipe_and_run(self: &Arc<Self>) -> bool {
        if let Some(worker) = crate::scheduler::current::current() {
            if worker.deque.remove(&ScheduledTask(self.clone())) {
                self.run();
                return true;
            }
        }
        false
    }
}

fn panic_cause(payload: &(dyn Any + Send)) -> Arc<str> {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        Arc::from(*message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        Arc::from(message.as_str())
    } else {
        Arc::from("task body panicked")
    }
}

/// Shared handle to one unit of schedulable work.
///
/// Handles are cheap to clone; all clones observe the same lifecycle.
/// Task bodies receive a `&Task` for self-inspection and messaging.
pub struct Task {
    raw: Arc<RawTask>,
}

impl Task {
    /// The task whose body is currently executing on this thread.
    #[must_use]
    pub fn current() -> Option<Task> {
        current::current().map(|raw| Task { raw })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.raw.name
    }

    /// Block until this task has finished.
    ///
    /// A not-yet-started task is executed inline on the calling thread;
    /// a task queued on the calling worker's own deque is pulled out and
    /// executed inline as well. Otherwise the caller parks until the
    /// running task completes.
    ///
    /// # Errors
    /// `Error::Cancelled` if the task was cancelled, carrying the panic
    /// message when cancellation came from a failed body.
    pub fn wait(&self) -> Result<()> {
        self.raw.await_done()
    }

    /// Request cancellation: idempotent, cooperative, and transitive to
    /// every child task registered before or during the call. Unblocks
    /// a pending mailbox receive inside the task.
    pub fn cancel(&self) {
        self.raw.cancel_with_cause(None);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.raw.cancelled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        *self
            .raw
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Status::Done
    }

    /// Address other tasks can send messages to.
    #[must_use]
    pub fn address(&self) -> Address {
        self.raw.mailbox.address()
    }

    /// Take the first arrived message of type `M`, blocking until one
    /// is delivered.
    ///
    /// # Errors
    /// `Error::Cancelled` if this task is cancelled while blocked.
    pub fn receive<M: Send + 'static>(&self) -> Result<M> {
        self.raw
            .mailbox
            .receive::<M>()
            .map_err(|_| self.raw.cancelled_error())
    }

    /// Like [`receive`], considering only messages sent from `from`.
    ///
    /// # Errors
    /// `Error::Cancelled` if this task is cancelled while blocked.
    ///
    /// [`receive`]: Task::receive
    pub fn receive_from<M: Send + 'static>(&self, from: &Address) -> Result<M> {
        self.raw
            .mailbox
            .receive_from::<M>(from)
            .map_err(|_| self.raw.cancelled_error())
    }
}

impl Clone for Task {
    fn clone(&self) -> Self {
        Task {
            raw: self.raw.clone(),
        }
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.raw.name)
            .field("status", &*self.raw.status.lock().unwrap_or_else(PoisonError::into_inner))
            .field("cancelled", &self.raw.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}

/// A fire-and-forget task producing no value.
#[derive(Debug)]
pub struct Async {
    task: Task,
}

impl Async {
    pub fn new(f: impl FnOnce(&Task) + Send + 'static) -> Self {
        Async {
            task: Task {
                raw: RawTask::new(Box::new(f)),
            },
        }
    }

    /// Enqueue this task on the scheduler. Only the first start (or a
    /// concurrent `wait`) actually schedules; later calls are no-ops.
    ///
    /// # Errors
    /// `Error::Cancelled` if this task, or the task starting it, has
    /// already been cancelled.
    pub fn start(&self) -> Result<()> {
        if self.task.raw.reserve()? {
            Scheduler::get_instance().submit(self.task.raw.clone());
        }
        Ok(())
    }

    /// Run this task on a dedicated pooled thread, bypassing the
    /// scheduler. Meant for long-running or blocking bodies that would
    /// otherwise occupy a worker.
    ///
    /// # Errors
    /// `Error::Cancelled` if this task, or the task starting it, has
    /// already been cancelled.
    pub fn start_detached(&self) -> Result<()> {
        if self.task.raw.reserve()? {
            let raw = self.task.raw.clone();
            ThreadPool::get_instance().submit(move || raw.run());
        }
        Ok(())
    }

    /// See [`Task::wait`].
    ///
    /// # Errors
    /// `Error::Cancelled` if the task was cancelled.
    pub fn wait(&self) -> Result<()> {
        self.task.wait()
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }

    #[must_use]
    pub fn task(&self) -> &Task {
        &self.task
    }
}

/// A task producing a value of type `T`, stored before completion and
/// collected with [`result`].
///
/// [`result`]: Future::result
#[derive(Debug)]
pub struct Future<T> {
    task: Task,
    slot: Arc<Mutex<Option<T>>>,
}

impl<T: Send + 'static> Future<T> {
    pub fn new(f: impl FnOnce(&Task) -> T + Send + 'static) -> Self {
        let slot = Arc::new(Mutex::new(None));
        let written = slot.clone();
        let task = Task {
            raw: RawTask::new(Box::new(move |task: &Task| {
                let value = f(task);
                *written.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
            })),
        };
        Future { task, slot }
    }

    /// See [`Async::start`].
    ///
    /// # Errors
    /// `Error::Cancelled` if this task, or the task starting it, has
    /// already been cancelled.
    pub fn start(&self) -> Result<()> {
        if self.task.raw.reserve()? {
            Scheduler::get_instance().submit(self.task.raw.clone());
        }
        Ok(())
    }

    /// See [`Async::start_detached`].
    ///
    /// # Errors
    /// `Error::Cancelled` if this task, or the task starting it, has
    /// already been cancelled.
    pub fn start_detached(&self) -> Result<()> {
        if self.task.raw.reserve()? {
            let raw = self.task.raw.clone();
            ThreadPool::get_instance().submit(move || raw.run());
        }
        Ok(())
    }

    /// See [`Task::wait`].
    ///
    /// # Errors
    /// `Error::Cancelled` if the task was cancelled.
    pub fn wait(&self) -> Result<()> {
        self.task.wait()
    }

    /// Join the task and take its value. A never-started future is
    /// executed inline, like `wait`.
    ///
    /// # Errors
    /// `Error::Cancelled` if the task was cancelled before the value
    /// was produced.
    pub fn result(self) -> Result<T> {
        self.task.wait()?;
        let value = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(value.unwrap_or_else(|| unreachable!("completed future holds a value")))
    }

    pub fn cancel(&self) {
        self.task.cancel();
    }

    #[must_use]
    pub fn task(&self) -> &Task {
        &self.task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn future_produces_result() {
        let future = Future::new(|_| 6 * 7);
        future.start().unwrap();
        assert_eq!(future.result().unwrap(), 42);
    }

    #[test]
    fn wait_runs_unstarted_task_inline() {
        let ran_on = Arc::new(Mutex::new(None));
        let observed = ran_on.clone();
        let task = Async::new(move |_| {
            *observed.lock().unwrap() = Some(std::thread::current().id());
        });
        // never started, so the join executes the body right here
        task.wait().unwrap();
        assert!(task.task().is_done());
        assert_eq!(
            ran_on.lock().unwrap().take(),
            Some(std::thread::current().id())
        );
    }

    #[test]
    fn start_is_one_shot() {
        let counter = Arc::new(AtomicUsize::new(0));
        let observed = counter.clone();
        let task = Async::new(move |_| {
            _ = observed.fetch_add(1, Ordering::SeqCst);
        });
        task.start().unwrap();
        task.start().unwrap();
        task.wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_becomes_cancellation_with_cause() {
        let task = Async::new(|_| panic!("boom"));
        task.start().unwrap();
        match task.wait() {
            Err(Error::Cancelled { cause }) => {
                assert_eq!(cause.as_deref(), Some("boom"));
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(task.task().is_cancelled());
    }

    #[test]
    fn start_on_cancelled_task_fails() {
        let task = Async::new(|_| {});
        task.cancel();
        assert!(matches!(task.start(), Err(Error::Cancelled { .. })));
        // joiners must not park on a task that will never run
        assert!(matches!(task.wait(), Err(Error::Cancelled { .. })));
    }

    #[test]
    fn cancellation_reaches_all_children() {
        let children = Arc::new(Mutex::new(Vec::new()));
        let registered = children.clone();
        let ready = Arc::new(AtomicUsize::new(0));
        let announce = ready.clone();
        let parent = Async::new(move |_| {
            for _ in 0..3 {
                // each child parks on its mailbox until cancelled
                let child = Async::new(|task: &Task| {
                    _ = task.receive::<i32>();
                });
                child.start().unwrap();
                registered.lock().unwrap().push(child);
            }
            _ = announce.fetch_add(1, Ordering::SeqCst);
            // park until cancellation unblocks the mailbox
            _ = Task::current().unwrap().receive::<i32>();
        });
        parent.start().unwrap();
        while ready.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
        parent.cancel();
        assert!(matches!(parent.wait(), Err(Error::Cancelled { .. })));
        let children = children.lock().unwrap();
        assert_eq!(children.len(), 3);
        for child in children.iter() {
            assert!(matches!(child.wait(), Err(Error::Cancelled { .. })));
            assert!(child.task().is_cancelled());
        }
    }

    #[test]
    fn mailbox_roundtrip_between_tasks() {
        let replies = crate::channel::Channel::rendezvous();
        let reply_writer = replies.writer();
        let echo = Async::new(move |task: &Task| {
            let text: &str = task.receive().unwrap();
            reply_writer.write(text.len()).unwrap();
        });
        echo.start().unwrap();
        echo.task().address().send("four");
        assert_eq!(replies.reader().read().unwrap(), 4);
        echo.wait().unwrap();
    }
}
