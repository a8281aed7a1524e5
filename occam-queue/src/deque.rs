use crate::raw::RawDeque;
use std::sync::{Arc, Mutex};

/// A growable work-stealing deque.
///
/// Thin wrapper around [`RawDeque`] that replaces the backing deque
/// with a larger one when [`push`] overflows. The mutex guards only the
/// backing-deque handle, never an element operation, so thieves stay
/// lock-free once they hold a handle; a thief left stealing from a
/// retired backing deque during migration simply takes work early,
/// which is benign.
///
/// As with [`RawDeque`], `push`/`pop`/`remove` are owner-only and
/// [`steal`] may be called from any thread.
///
/// [`push`]: Deque::push
/// [`steal`]: Deque::steal
#[repr(C)]
#[derive(Debug)]
pub struct Deque<T> {
    handle: Mutex<Arc<RawDeque<T>>>,
}

impl<T> Deque<T> {
    /// Create a deque with the given initial capacity.
    #[must_use]
    pub fn new(initial_capacity: usize) -> Self {
        Deque {
            handle: Mutex::new(Arc::new(RawDeque::new(initial_capacity))),
        }
    }

    fn raw(&self) -> Arc<RawDeque<T>> {
        self.handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Get the capacity of the current backing deque.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.raw().capacity()
    }

    /// Get the number of elements in this deque.
    ///
    /// Only accurate when called from the owner thread.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw().len()
    }

    /// Returns `true` if this deque is empty.
    ///
    /// Only accurate when called from the owner thread.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw().is_empty()
    }

    /// Push an element onto the bottom end, growing on overflow.
    ///
    /// Only the owner thread may call this. On overflow the backing
    /// deque is replaced (double capacity when more than half full,
    /// same capacity otherwise) and the old elements are migrated by
    /// repeated stealing, which is safe against concurrent thieves.
    pub fn push(&self, value: T) {
        let old = self.raw();
        if let Err(value) = old.push(value) {
            let mut new_capacity = old.capacity();
            if old.len() > new_capacity / 2 {
                new_capacity *= 2;
            }
            let new = Arc::new(RawDeque::new(new_capacity));
            *self
                .handle
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = new.clone();
            while let Some(moved) = old.steal() {
                assert!(new.push(moved).is_ok(), "migration overflowed new deque");
            }
            assert!(new.push(value).is_ok(), "migration overflowed new deque");
        }
    }

    /// Pop an element from the bottom end.
    ///
    /// Only the owner thread may call this.
    pub fn pop(&self) -> Option<T> {
        self.raw().pop()
    }

    /// Remove `item` from the deque ("swipe").
    ///
    /// Only the owner thread may call this. Returns `true` iff `item`
    /// was present and has been removed rather than stolen.
    pub fn remove(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        self.raw().remove(item)
    }

    /// Steal an element from the top end. May be called from any thread.
    pub fn steal(&self) -> Option<T> {
        self.raw().steal()
    }

    /// Swap the backing deques of `self` and `other`.
    ///
    /// Both deques must be quiescent on their owner side (the scheduler
    /// calls this under its global-queue lock when handing a retired or
    /// freshly filled queue to a worker).
    pub fn swap(&self, other: &Self) {
        // lock in address order so concurrent swaps cannot deadlock
        let (first, second) = if std::ptr::from_ref(self) < std::ptr::from_ref(other) {
            (&self.handle, &other.handle)
        } else {
            (&other.handle, &self.handle)
        };
        let mut a = first
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut b = second
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::swap(&mut *a, &mut *b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn grows_on_overflow() {
        let deque = Deque::new(2);
        for i in 0..9 {
            deque.push(i);
        }
        assert!(deque.capacity() >= 9);
        assert_eq!(deque.len(), 9);
        // migration preserved the element set
        let mut drained = Vec::new();
        while let Some(v) = deque.pop() {
            drained.push(v);
        }
        drained.sort_unstable();
        assert_eq!(drained, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn keeps_capacity_when_half_empty() {
        let deque = Deque::new(8);
        for i in 0..8 {
            deque.push(i);
        }
        for _ in 0..6 {
            _ = deque.steal();
        }
        // 2 of 8 left, the overflow compacts instead of growing
        for i in 8..13 {
            deque.push(i);
        }
        assert_eq!(deque.capacity(), 8);
        assert_eq!(deque.len(), 7);
    }

    #[test]
    fn swap_exchanges_contents() {
        let a = Deque::new(4);
        let b = Deque::new(4);
        a.push(1);
        a.push(2);
        a.swap(&b);
        assert!(a.is_empty());
        assert_eq!(b.len(), 2);
    }

    /// One owner thread interleaving push/pop/remove with many thieves:
    /// every pushed item must be drained exactly once by exactly one of
    /// pop, steal or remove.
    #[test]
    fn exactly_once_under_contention() {
        const ITEMS: usize = 20_000;
        const THIEVES: usize = 4;

        let deque = Arc::new(Deque::new(64));
        let stolen_sum = Arc::new(AtomicUsize::new(0));
        let stolen_count = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let thieves: Vec<_> = (0..THIEVES)
            .map(|_| {
                let deque = deque.clone();
                let sum = stolen_sum.clone();
                let count = stolen_count.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    while done.load(Ordering::Acquire) == 0 {
                        if let Some(v) = deque.steal() {
                            _ = sum.fetch_add(v, Ordering::Relaxed);
                            _ = count.fetch_add(1, Ordering::Relaxed);
                        } else {
                            std::thread::yield_now();
                        }
                    }
                    // drain whatever the owner left behind
                    while let Some(v) = deque.steal() {
                        _ = sum.fetch_add(v, Ordering::Relaxed);
                        _ = count.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        let mut owner_sum = 0_usize;
        let mut owner_count = 0_usize;
        for i in 1..=ITEMS {
            deque.push(i);
            if i % 3 == 0 {
                if let Some(v) = deque.pop() {
                    owner_sum += v;
                    owner_count += 1;
                }
            }
            if i % 97 == 0 && deque.remove(&i) {
                owner_sum += i;
                owner_count += 1;
            }
        }
        done.store(1, Ordering::Release);
        for thief in thieves {
            thief.join().unwrap();
        }
        while let Some(v) = deque.pop() {
            owner_sum += v;
            owner_count += 1;
        }

        let total_count = owner_count + stolen_count.load(Ordering::Acquire);
        let total_sum = owner_sum + stolen_sum.load(Ordering::Acquire);
        assert_eq!(total_count, ITEMS);
        assert_eq!(total_sum, ITEMS * (ITEMS + 1) / 2);
    }
}
