use super::buffer::{Buffer, BufferKind};
use super::{offer, withdraw, Observer, Role};
use crate::choice::{ChoiceInner, Enabled};
use crate::error::{Error, Result};
use crate::scheduler::current::BlockedGuard;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::ThreadId;

struct Shared<T> {
    buffer: Buffer<T>,
    poisoned: bool,
    readers_waiting: usize,
    writers_waiting: usize,
    /// Buffered items claimed by accepted read selectors; they are
    /// invisible to everyone else until the claimant reads.
    read_reserved: HashSet<ThreadId>,
    /// Free slots claimed by accepted write selectors.
    write_reserved: HashSet<ThreadId>,
    role: Option<Role>,
    read_observers: VecDeque<Observer>,
    write_observers: VecDeque<Observer>,
}

impl<T> Shared<T> {
    /// Items a non-reserved reader may take.
    fn readable(&self) -> usize {
        self.buffer.len().saturating_sub(self.read_reserved.len())
    }

    /// Slots a non-reserved writer may fill. Unbounded buffers always
    /// have room.
    fn writable(&self) -> usize {
        match self.buffer.capacity() {
            Some(capacity) => capacity
                .saturating_sub(self.buffer.len())
                .saturating_sub(self.write_reserved.len()),
            None => usize::MAX,
        }
    }
}

/// Buffered channel: `write` returns as soon as the value lands in the
/// buffer, blocking only when a bounded buffer is full. `read` drains
/// buffered values even after poisoning and errors only once the buffer
/// runs dry.
pub(crate) struct Buffered<T> {
    modifying: Mutex<Shared<T>>,
    data_ready: Condvar,
    space_ready: Condvar,
}

impl<T: Send> Buffered<T> {
    pub(crate) fn bounded(kind: BufferKind, capacity: usize) -> Self {
        Self::with_buffer(Buffer::bounded(kind, capacity))
    }

    pub(crate) fn unbounded() -> Self {
        Self::with_buffer(Buffer::unbounded())
    }

    fn with_buffer(buffer: Buffer<T>) -> Self {
        Buffered {
            modifying: Mutex::new(Shared {
                buffer,
                poisoned: false,
                readers_waiting: 0,
                writers_waiting: 0,
                read_reserved: HashSet::new(),
                write_reserved: HashSet::new(),
                role: None,
                read_observers: VecDeque::new(),
                write_observers: VecDeque::new(),
            }),
            data_ready: Condvar::new(),
            space_ready: Condvar::new(),
        }
    }

    pub(crate) fn write(&self, value: T) -> Result<()> {
        let me = std::thread::current().id();
        let mut shared = self
            .modifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if shared.poisoned {
                return Err(Error::Poisoned);
            }
            if shared.write_reserved.remove(&me) || shared.writable() > 0 {
                shared.buffer.put(value);
                if shared.readers_waiting > 0 {
                    self.data_ready.notify_all();
                } else if let Some(selector) = offer(&mut shared.read_observers) {
                    _ = shared.read_reserved.insert(selector);
                }
                return Ok(());
            }
            shared.writers_waiting += 1;
            let _blocked = BlockedGuard::new();
            shared = self
                .space_ready
                .wait(shared)
                .unwrap_or_else(PoisonError::into_inner);
            shared.writers_waiting -= 1;
        }
    }

    pub(crate) fn read(&self) -> Result<T> {
        let me = std::thread::current().id();
        let mut shared = self
            .modifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if shared.read_reserved.remove(&me) || shared.readable() > 0 {
                let value = shared
                    .buffer
                    .get()
                    .unwrap_or_else(|| unreachable!("readable buffer was empty"));
                if shared.writers_waiting > 0 {
                    self.space_ready.notify_all();
                } else if shared.writable() > 0 {
                    if let Some(selector) = offer(&mut shared.write_observers) {
                        _ = shared.write_reserved.insert(selector);
                    }
                }
                return Ok(value);
            }
            // drain before reporting the poison
            if shared.poisoned {
                return Err(Error::Poisoned);
            }
            shared.readers_waiting += 1;
            let _blocked = BlockedGuard::new();
            shared = self
                .data_ready
                .wait(shared)
                .unwrap_or_else(PoisonError::into_inner);
            shared.readers_waiting -= 1;
        }
    }

    pub(crate) fn poison(&self) {
        let mut shared = self
            .modifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if shared.poisoned {
            return;
        }
        shared.poisoned = true;
        shared.read_reserved.clear();
        shared.write_reserved.clear();
        let mut observers: Vec<Observer> = shared.read_observers.drain(..).collect();
        observers.extend(shared.write_observers.drain(..));
        for observer in observers {
            if let Some(choice) = observer.choice.upgrade() {
                choice.poison_signal();
            }
        }
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.modifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .poisoned
    }

    pub(crate) fn mark(&self, role: Role) {
        let mut shared = self
            .modifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        assert!(
            shared.role.is_none(),
            "channel is already attached to a choice as {:?}",
            shared.role
        );
        shared.role = Some(role);
    }

    pub(crate) fn enable_read(
        &self,
        choice: &Arc<ChoiceInner>,
        index: usize,
        selector: ThreadId,
    ) -> Enabled {
        let mut shared = self
            .modifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if shared.poisoned {
            return Enabled::Poisoned;
        }
        if shared.readable() > 0 {
            if choice.claim_scan(index) {
                _ = shared.read_reserved.insert(selector);
                return Enabled::Ready;
            }
            return Enabled::Resolved;
        }
        withdraw(&mut shared.read_observers, choice);
        shared.read_observers.push_back(Observer {
            choice: Arc::downgrade(choice),
            index,
        });
        Enabled::Registered
    }

    pub(crate) fn enable_write(
        &self,
        choice: &Arc<ChoiceInner>,
        index: usize,
        selector: ThreadId,
    ) -> Enabled {
        let mut shared = self
            .modifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if shared.poisoned {
            return Enabled::Poisoned;
        }
        if shared.writable() > 0 {
            if choice.claim_scan(index) {
                _ = shared.write_reserved.insert(selector);
                return Enabled::Ready;
            }
            return Enabled::Resolved;
        }
        withdraw(&mut shared.write_observers, choice);
        shared.write_observers.push_back(Observer {
            choice: Arc::downgrade(choice),
            index,
        });
        Enabled::Registered
    }

    pub(crate) fn disable_read(&self, choice: &Arc<ChoiceInner>) {
        let mut shared = self
            .modifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        withdraw(&mut shared.read_observers, choice);
    }

    pub(crate) fn disable_write(&self, choice: &Arc<ChoiceInner>) {
        let mut shared = self
            .modifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        withdraw(&mut shared.write_observers, choice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn capacity_one_gives_backpressure() {
        let channel = Arc::new(Buffered::bounded(BufferKind::Fifo, 1));
        channel.write("a").unwrap();
        let (sender, receiver) = mpsc::channel();
        let writer = {
            let channel = channel.clone();
            std::thread::spawn(move || {
                channel.write("b").unwrap();
                sender.send(()).unwrap();
            })
        };
        assert!(receiver
            .recv_timeout(Duration::from_millis(100))
            .is_err());
        assert_eq!(channel.read().unwrap(), "a");
        receiver.recv().unwrap();
        writer.join().unwrap();
        assert_eq!(channel.read().unwrap(), "b");
    }

    #[test]
    fn poison_lets_readers_drain_first() {
        let channel = Buffered::bounded(BufferKind::Fifo, 4);
        channel.write(1).unwrap();
        channel.write(2).unwrap();
        channel.poison();
        assert_eq!(channel.write(3), Err(Error::Poisoned));
        assert_eq!(channel.read(), Ok(1));
        assert_eq!(channel.read(), Ok(2));
        assert_eq!(channel.read(), Err(Error::Poisoned));
    }

    #[test]
    fn lifo_reads_newest_first() {
        let channel = Buffered::bounded(BufferKind::Lifo, 3);
        for i in 0..3 {
            channel.write(i).unwrap();
        }
        assert_eq!(channel.read(), Ok(2));
        assert_eq!(channel.read(), Ok(1));
        assert_eq!(channel.read(), Ok(0));
    }

    #[test]
    fn unbounded_writes_never_block() {
        let channel = Buffered::unbounded();
        for i in 0..10_000 {
            channel.write(i).unwrap();
        }
        for i in 0..10_000 {
            assert_eq!(channel.read(), Ok(i));
        }
    }

    #[test]
    fn poison_wakes_a_blocked_writer() {
        let channel = Arc::new(Buffered::bounded(BufferKind::Fifo, 1));
        channel.write(1).unwrap();
        let writer = {
            let channel = channel.clone();
            std::thread::spawn(move || channel.write(2))
        };
        std::thread::sleep(Duration::from_millis(50));
        channel.poison();
        assert_eq!(writer.join().unwrap(), Err(Error::Poisoned));
    }
}
