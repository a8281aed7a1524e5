use super::RawTask;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    // A stack, not a cell: waiting on a not-yet-started task runs it
    // inline, nesting one task's body inside another on this thread.
    // Written only by the thread executing the bodies.
    static CURRENT_TASK: RefCell<Vec<Arc<RawTask>>> = RefCell::new(Vec::new());
}

/// The task whose body is innermost on this thread, if any.
pub(crate) fn current() -> Option<Arc<RawTask>> {
    CURRENT_TASK.with(|cell| cell.borrow().last().cloned())
}

/// Scopes the current-task stack around one body execution.
#[derive(Debug)]
pub(crate) struct TaskScope;

impl TaskScope {
    pub(crate) fn enter(task: &Arc<RawTask>) -> Self {
        CURRENT_TASK.with(|cell| cell.borrow_mut().push(task.clone()));
        TaskScope
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        CURRENT_TASK.with(|cell| {
            _ = cell.borrow_mut().pop();
        });
    }
}
