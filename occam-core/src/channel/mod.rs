use crate::choice::{ChoiceInner, Enabled, Selectable};
use crate::error::Result;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

pub mod buffer;
mod buffered;
mod unbuffered;

pub use buffer::{BufferKind, BufferState};

use buffered::Buffered;
use unbuffered::Rendezvous;

/// Permanent choice role of a channel, set by the first marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Input,
    Output,
}

/// A choice waiting on one of this channel's ends.
pub(crate) struct Observer {
    pub(crate) choice: Weak<ChoiceInner>,
    pub(crate) index: usize,
}

/// Offer the pending event to queued observers in FIFO order until one
/// accepts. Dead and declining observers are dropped; a declining
/// choice is mid-scan and will see the readiness itself, or re-register.
pub(crate) fn offer(observers: &mut VecDeque<Observer>) -> Option<ThreadId> {
    while let Some(observer) = observers.pop_front() {
        if let Some(choice) = observer.choice.upgrade() {
            if let Some(selector) = choice.signal(observer.index) {
                return Some(selector);
            }
        }
    }
    None
}

pub(crate) fn withdraw(observers: &mut VecDeque<Observer>, choice: &Arc<ChoiceInner>) {
    let target = Arc::downgrade(choice);
    observers.retain(|observer| !observer.choice.ptr_eq(&target));
}

enum Core<T> {
    Rendezvous(Arc<Rendezvous<T>>),
    Buffered(Arc<Buffered<T>>),
}

impl<T> Clone for Core<T> {
    fn clone(&self) -> Self {
        match self {
            Core::Rendezvous(inner) => Core::Rendezvous(inner.clone()),
            Core::Buffered(inner) => Core::Buffered(inner.clone()),
        }
    }
}

impl<T: Send> Core<T> {
    fn write(&self, value: T) -> Result<()> {
        match self {
            Core::Rendezvous(inner) => inner.write(value),
            Core::Buffered(inner) => inner.write(value),
        }
    }

    fn read(&self) -> Result<T> {
        match self {
            Core::Rendezvous(inner) => inner.read(),
            Core::Buffered(inner) => inner.read(),
        }
    }

    fn poison(&self) {
        match self {
            Core::Rendezvous(inner) => inner.poison(),
            Core::Buffered(inner) => inner.poison(),
        }
    }

    fn is_poisoned(&self) -> bool {
        match self {
            Core::Rendezvous(inner) => inner.is_poisoned(),
            Core::Buffered(inner) => inner.is_poisoned(),
        }
    }

    fn mark(&self, role: Role) {
        match self {
            Core::Rendezvous(inner) => inner.mark(role),
            Core::Buffered(inner) => inner.mark(role),
        }
    }

    fn enable_read(&self, choice: &Arc<ChoiceInner>, index: usize, selector: ThreadId) -> Enabled {
        match self {
            Core::Rendezvous(inner) => inner.enable_read(choice, index, selector),
            Core::Buffered(inner) => inner.enable_read(choice, index, selector),
        }
    }

    fn enable_write(&self, choice: &Arc<ChoiceInner>, index: usize, selector: ThreadId) -> Enabled {
        match self {
            Core::Rendezvous(inner) => inner.enable_write(choice, index, selector),
            Core::Buffered(inner) => inner.enable_write(choice, index, selector),
        }
    }

    fn disable_read(&self, choice: &Arc<ChoiceInner>) {
        match self {
            Core::Rendezvous(inner) => inner.disable_read(choice),
            Core::Buffered(inner) => inner.disable_read(choice),
        }
    }

    fn disable_write(&self, choice: &Arc<ChoiceInner>) {
        match self {
            Core::Rendezvous(inner) => inner.disable_write(choice),
            Core::Buffered(inner) => inner.disable_write(choice),
        }
    }
}

/// Default capacity of [`Channel::buffered_default`].
pub const DEFAULT_CAPACITY: usize = 10;

/// A typed channel between tasks.
///
/// The channel itself is a handle factory; communication goes through
/// [`ChannelReader`] and [`ChannelWriter`] ends, which share the same
/// core and may be cloned and moved across tasks freely. A rendezvous
/// channel completes a `write` only when a reader takes the value; a
/// buffered channel decouples the two sides up to its capacity.
pub struct Channel<T> {
    core: Core<T>,
}

impl<T: Send> Channel<T> {
    /// An unbuffered channel; every write is a rendezvous with a read.
    #[must_use]
    pub fn rendezvous() -> Self {
        Channel {
            core: Core::Rendezvous(Arc::new(Rendezvous::new())),
        }
    }

    /// A bounded buffered channel with the given ordering discipline.
    ///
    /// # Panics
    /// if `capacity` is 0; use [`Channel::rendezvous`] for unbuffered
    /// hand-off.
    #[must_use]
    pub fn buffered(kind: BufferKind, capacity: usize) -> Self {
        Channel {
            core: Core::Buffered(Arc::new(Buffered::bounded(kind, capacity))),
        }
    }

    /// A bounded buffered channel with [`DEFAULT_CAPACITY`] slots.
    #[must_use]
    pub fn buffered_default(kind: BufferKind) -> Self {
        Self::buffered(kind, DEFAULT_CAPACITY)
    }

    /// A FIFO buffered channel whose writes never block.
    #[must_use]
    pub fn unbounded() -> Self {
        Channel {
            core: Core::Buffered(Arc::new(Buffered::unbounded())),
        }
    }

    #[must_use]
    pub fn reader(&self) -> ChannelReader<T> {
        ChannelReader {
            core: self.core.clone(),
        }
    }

    #[must_use]
    pub fn writer(&self) -> ChannelWriter<T> {
        ChannelWriter {
            core: self.core.clone(),
        }
    }

    /// Permanently shut the channel down. Blocked parties wake with
    /// [`Error::Poisoned`](crate::error::Error::Poisoned); a buffered
    /// channel still lets readers drain values written before the
    /// poison.
    pub fn poison(&self) {
        self.core.poison();
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.core.is_poisoned()
    }
}

impl<T> Debug for Channel<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match self.core {
            Core::Rendezvous(_) => "rendezvous",
            Core::Buffered(_) => "buffered",
        };
        f.debug_struct("Channel").field("kind", &kind).finish()
    }
}

/// Reading end of a [`Channel`].
pub struct ChannelReader<T> {
    core: Core<T>,
}

impl<T: Send + 'static> ChannelReader<T> {
    /// Take the next value, blocking until one arrives.
    ///
    /// # Errors
    /// `Error::Poisoned` once the channel is poisoned and, for a
    /// buffered channel, drained.
    pub fn read(&self) -> Result<T> {
        self.core.read()
    }

    pub fn poison(&self) {
        self.core.poison();
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.core.is_poisoned()
    }

    pub(crate) fn selectable(&self) -> Arc<dyn Selectable> {
        Arc::new(ReadEnd {
            core: self.core.clone(),
        })
    }
}

impl<T> Clone for ChannelReader<T> {
    fn clone(&self) -> Self {
        ChannelReader {
            core: self.core.clone(),
        }
    }
}

impl<T> Debug for ChannelReader<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReader").finish_non_exhaustive()
    }
}

/// Writing end of a [`Channel`].
pub struct ChannelWriter<T> {
    core: Core<T>,
}

impl<T: Send + 'static> ChannelWriter<T> {
    /// Deliver a value. On a rendezvous channel this returns only after
    /// a reader took it; on a buffered channel it blocks only while the
    /// buffer is full.
    ///
    /// # Errors
    /// `Error::Poisoned` if the channel is poisoned; the value is lost.
    pub fn write(&self, value: T) -> Result<()> {
        self.core.write(value)
    }

    pub fn poison(&self) {
        self.core.poison();
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.core.is_poisoned()
    }

    pub(crate) fn selectable(&self) -> Arc<dyn Selectable> {
        Arc::new(WriteEnd {
            core: self.core.clone(),
        })
    }
}

impl<T> Clone for ChannelWriter<T> {
    fn clone(&self) -> Self {
        ChannelWriter {
            core: self.core.clone(),
        }
    }
}

impl<T> Debug for ChannelWriter<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter").finish_non_exhaustive()
    }
}

struct ReadEnd<T> {
    core: Core<T>,
}

impl<T: Send> Selectable for ReadEnd<T> {
    fn mark(&self) {
        self.core.mark(Role::Input);
    }

    fn enable(&self, choice: &Arc<ChoiceInner>, index: usize, selector: ThreadId) -> Enabled {
        self.core.enable_read(choice, index, selector)
    }

    fn disable(&self, choice: &Arc<ChoiceInner>) {
        self.core.disable_read(choice);
    }

    fn on_selected(&self) {
        // the reservation stands until the selector's read consumes it
    }
}

struct WriteEnd<T> {
    core: Core<T>,
}

impl<T: Send> Selectable for WriteEnd<T> {
    fn mark(&self) {
        self.core.mark(Role::Output);
    }

    fn enable(&self, choice: &Arc<ChoiceInner>, index: usize, selector: ThreadId) -> Enabled {
        self.core.enable_write(choice, index, selector)
    }

    fn disable(&self, choice: &Arc<ChoiceInner>) {
        self.core.disable_write(choice);
    }

    fn on_selected(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;

    #[test]
    fn ends_share_one_core() {
        let channel = Channel::buffered(BufferKind::Fifo, 2);
        let reader = channel.reader();
        let writer = channel.writer();
        let second_writer = writer.clone();
        writer.write(1).unwrap();
        second_writer.write(2).unwrap();
        assert_eq!(reader.read(), Ok(1));
        assert_eq!(reader.read(), Ok(2));
    }

    #[test]
    fn poison_reaches_every_end() {
        let channel: Channel<i32> = Channel::rendezvous();
        let reader = channel.reader();
        let writer = channel.writer();
        writer.poison();
        assert!(channel.is_poisoned());
        assert!(reader.is_poisoned());
        assert_eq!(reader.read(), Err(Error::Poisoned));
        assert_eq!(writer.write(1), Err(Error::Poisoned));
    }

    #[test]
    fn rendezvous_hands_off_across_threads() {
        let channel = Channel::rendezvous();
        let writer = channel.writer();
        let producer = std::thread::spawn(move || {
            for i in 0..10 {
                writer.write(i).unwrap();
            }
        });
        let reader = channel.reader();
        std::thread::sleep(Duration::from_millis(20));
        for i in 0..10 {
            assert_eq!(reader.read(), Ok(i));
        }
        producer.join().unwrap();
    }

    #[test]
    fn unbounded_accepts_without_a_reader() {
        let channel = Channel::unbounded();
        let writer = channel.writer();
        for i in 0..1000 {
            writer.write(i).unwrap();
        }
        let reader = channel.reader();
        for i in 0..1000 {
            assert_eq!(reader.read(), Ok(i));
        }
    }
}
