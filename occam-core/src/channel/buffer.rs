use std::collections::VecDeque;

/// Ordering discipline of a bounded buffered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// First in, first out.
    Fifo,
    /// Last in, first out.
    Lifo,
}

/// Occupancy summary of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Empty,
    NonEmpty,
    Full,
}

/// Storage behind a buffered channel. Capacity gating lives in the
/// channel; a `put` on a full bounded buffer is an invariant violation.
#[derive(Debug)]
pub(crate) enum Buffer<T> {
    Fifo {
        items: VecDeque<T>,
        capacity: usize,
    },
    Lifo {
        items: Vec<T>,
        capacity: usize,
    },
    Unbounded {
        items: VecDeque<T>,
    },
}

impl<T> Buffer<T> {
    pub(crate) fn bounded(kind: BufferKind, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be greater than 0");
        match kind {
            BufferKind::Fifo => Buffer::Fifo {
                items: VecDeque::with_capacity(capacity),
                capacity,
            },
            BufferKind::Lifo => Buffer::Lifo {
                items: Vec::with_capacity(capacity),
                capacity,
            },
        }
    }

    pub(crate) fn unbounded() -> Self {
        Buffer::Unbounded {
            items: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Buffer::Fifo { items, .. } | Buffer::Unbounded { items } => items.len(),
            Buffer::Lifo { items, .. } => items.len(),
        }
    }

    /// `None` for an unbounded buffer.
    pub(crate) fn capacity(&self) -> Option<usize> {
        match self {
            Buffer::Fifo { capacity, .. } | Buffer::Lifo { capacity, .. } => Some(*capacity),
            Buffer::Unbounded { .. } => None,
        }
    }

    pub(crate) fn state(&self) -> BufferState {
        if self.len() == 0 {
            BufferState::Empty
        } else if self.capacity() == Some(self.len()) {
            BufferState::Full
        } else {
            BufferState::NonEmpty
        }
    }

    pub(crate) fn put(&mut self, value: T) {
        assert!(
            self.state() != BufferState::Full,
            "put on a full buffer"
        );
        match self {
            Buffer::Fifo { items, .. } | Buffer::Unbounded { items } => items.push_back(value),
            Buffer::Lifo { items, .. } => items.push(value),
        }
    }

    pub(crate) fn get(&mut self) -> Option<T> {
        match self {
            Buffer::Fifo { items, .. } | Buffer::Unbounded { items } => items.pop_front(),
            Buffer::Lifo { items, .. } => items.pop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_preserves_insertion_order() {
        let mut buffer = Buffer::bounded(BufferKind::Fifo, 3);
        assert_eq!(buffer.state(), BufferState::Empty);
        for i in 0..3 {
            buffer.put(i);
        }
        assert_eq!(buffer.state(), BufferState::Full);
        assert_eq!(buffer.get(), Some(0));
        assert_eq!(buffer.state(), BufferState::NonEmpty);
        assert_eq!(buffer.get(), Some(1));
        assert_eq!(buffer.get(), Some(2));
        assert_eq!(buffer.get(), None);
    }

    #[test]
    fn lifo_returns_newest_first() {
        let mut buffer = Buffer::bounded(BufferKind::Lifo, 3);
        for i in 0..3 {
            buffer.put(i);
        }
        assert_eq!(buffer.get(), Some(2));
        assert_eq!(buffer.get(), Some(1));
        assert_eq!(buffer.get(), Some(0));
    }

    #[test]
    fn unbounded_never_fills() {
        let mut buffer = Buffer::unbounded();
        for i in 0..1000 {
            buffer.put(i);
        }
        assert_eq!(buffer.state(), BufferState::NonEmpty);
        assert_eq!(buffer.capacity(), None);
        assert_eq!(buffer.len(), 1000);
    }
}
