use crate::error::{Error, Result};
use crate::scheduler::current::BlockedGuard;
use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};

/// Where messages for one task get delivered.
///
/// Cloneable and freely shareable; obtained from [`Task::address`].
/// Sending never blocks. Messages sent to a cancelled task are dropped
/// unread.
///
/// [`Task::address`]: crate::task::Task::address
#[derive(Clone)]
pub struct Address {
    pub(crate) inner: Arc<MailboxInner>,
}

impl Address {
    /// Deliver `message` to the owning task's mailbox.
    ///
    /// The sender recorded on the envelope is the task currently running
    /// on this thread, or anonymous when called outside any task.
    pub fn send<M: Send + 'static>(&self, message: M) {
        let from = super::current::current().map(|task| Arc::downgrade(&task.mailbox.inner));
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.cancelled {
            return;
        }
        state.messages.push(Envelope {
            from,
            payload: Box::new(message),
        });
        self.inner.arrived.notify_all();
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Address")
            .field("mailbox", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

struct Envelope {
    from: Option<Weak<MailboxInner>>,
    payload: Box<dyn Any + Send>,
}

pub(crate) struct MailboxInner {
    state: Mutex<MailState>,
    arrived: Condvar,
}

#[derive(Default)]
struct MailState {
    messages: Vec<Envelope>,
    cancelled: bool,
}

/// Typed point-to-point message store owned by one task.
///
/// Receivers scan arrived messages in delivery order and take the first
/// whose payload type (and, for filtered receives, sender) matches,
/// blocking until one arrives. Cancelling the owning task unblocks any
/// pending receive with a cancellation error.
pub(crate) struct Mailbox {
    pub(crate) inner: Arc<MailboxInner>,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Mailbox {
            inner: Arc::new(MailboxInner {
                state: Mutex::new(MailState::default()),
                arrived: Condvar::new(),
            }),
        }
    }

    pub(crate) fn address(&self) -> Address {
        Address {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn cancel(&self) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.cancelled = true;
        self.inner.arrived.notify_all();
    }

    pub(crate) fn receive<M: Send + 'static>(&self) -> Result<M> {
        self.receive_matching::<M>(None)
    }

    pub(crate) fn receive_from<M: Send + 'static>(&self, from: &Address) -> Result<M> {
        self.receive_matching::<M>(Some(Arc::downgrade(&from.inner)))
    }

    fn receive_matching<M: Send + 'static>(
        &self,
        from: Option<Weak<MailboxInner>>,
    ) -> Result<M> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            let matched = state.messages.iter().position(|envelope| {
                if !envelope.payload.is::<M>() {
                    return false;
                }
                match from.as_ref() {
                    Some(wanted) => envelope
                        .from
                        .as_ref()
                        .is_some_and(|sender| sender.ptr_eq(wanted)),
                    None => true,
                }
            });
            if let Some(position) = matched {
                let envelope = state.messages.remove(position);
                let payload = envelope
                    .payload
                    .downcast::<M>()
                    .unwrap_or_else(|_| unreachable!("scan matched on payload type"));
                return Ok(*payload);
            }
            if state.cancelled {
                return Err(Error::Cancelled { cause: None });
            }
            let _blocked = BlockedGuard::new();
            state = self
                .inner
                .arrived
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Debug for Mailbox {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("mailbox", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn receives_by_payload_type() {
        let mailbox = Mailbox::new();
        mailbox.address().send("text");
        mailbox.address().send(7_i32);
        // the i32 receive skips past the earlier &str envelope
        assert_eq!(mailbox.receive::<i32>().unwrap(), 7);
        assert_eq!(mailbox.receive::<&str>().unwrap(), "text");
    }

    #[test]
    fn blocks_until_delivery() {
        let mailbox = Mailbox::new();
        let address = mailbox.address();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            address.send(42_u64);
        });
        assert_eq!(mailbox.receive::<u64>().unwrap(), 42);
        sender.join().unwrap();
    }

    #[test]
    fn sends_to_a_cancelled_mailbox_are_dropped() {
        let mailbox = Mailbox::new();
        mailbox.cancel();
        mailbox.address().send(1_i32);
        assert!(mailbox.inner.state.lock().unwrap().messages.is_empty());
        assert_eq!(
            mailbox.receive::<i32>(),
            Err(Error::Cancelled { cause: None })
        );
    }

    #[test]
    fn cancel_unblocks_receiver() {
        let mailbox = Arc::new(Mailbox::new());
        let receiver = {
            let mailbox = mailbox.clone();
            std::thread::spawn(move || mailbox.receive::<i32>())
        };
        std::thread::sleep(Duration::from_millis(50));
        mailbox.cancel();
        assert_eq!(
            receiver.join().unwrap(),
            Err(Error::Cancelled { cause: None })
        );
    }
}
