#![allow(clippy::cast_possible_truncation)]

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// A fixed-capacity lock-free work-stealing deque.
///
/// The thread that owns the deque may call [`push`], [`pop`] and
/// [`remove`]; any thread may call [`steal`]. The owner works on the
/// bottom end, thieves take from the top end.
///
/// The top index and a generation tag are packed into one atomic word
/// (`tag << 32 | top`) so a single compare-and-swap resolves the race
/// between a thief and the owner on the last element, and the tag bump
/// invalidates stale thieves after the owner rewinds the deque (ABA
/// protection).
///
/// [`push`]: RawDeque::push
/// [`pop`]: RawDeque::pop
/// [`remove`]: RawDeque::remove
/// [`steal`]: RawDeque::steal
#[repr(C)]
#[derive(Debug)]
pub struct RawDeque<T> {
    /// Slots hold heap pointers; a null slot below `bottom` is a hole
    /// left behind by `remove`.
    slots: Box<[AtomicPtr<T>]>,
    /// Mutated only by the owner thread.
    bottom: AtomicUsize,
    /// Packed `(tag, top)` word, CASed by thieves and by the owner when
    /// it detects the empty race.
    age: AtomicU64,
    /// Number of holes currently between `top` and `bottom`.
    swiped: AtomicIsize,
    phantom: PhantomData<T>,
}

#[allow(unsafe_code)]
unsafe impl<T: Send> Send for RawDeque<T> {}

#[allow(unsafe_code)]
unsafe impl<T: Send> Sync for RawDeque<T> {}

impl<T> RawDeque<T> {
    /// Create a deque with room for `capacity` elements.
    ///
    /// # Panics
    /// if `capacity` is 0 or does not fit the packed index word.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than 0");
        assert!(
            u32::try_from(capacity).is_ok(),
            "capacity must fit in the packed index word"
        );
        RawDeque {
            slots: (0..capacity).map(|_| AtomicPtr::default()).collect(),
            bottom: AtomicUsize::new(0),
            age: AtomicU64::new(0),
            swiped: AtomicIsize::new(0),
            phantom: PhantomData,
        }
    }

    /// Get the capacity of this deque.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Get the number of elements in this deque.
    ///
    /// Only accurate when called from the owner thread; thieves may
    /// observe a stale count.
    #[must_use]
    pub fn len(&self) -> usize {
        let bottom = self.bottom.load(Ordering::SeqCst);
        let top = unpack_top(self.age.load(Ordering::SeqCst)) as usize;
        let swiped = self.swiped.load(Ordering::SeqCst);
        bottom
            .saturating_sub(top)
            .saturating_sub(usize::try_from(swiped).unwrap_or(0))
    }

    /// Returns `true` if this deque is empty.
    ///
    /// Only accurate when called from the owner thread.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push an element onto the bottom end.
    ///
    /// Only the owner thread may call this. Returns the element back
    /// when the deque is full.
    #[allow(unsafe_code)]
    pub fn push(&self, value: T) -> Result<(), T> {
        let bottom = self.bottom.load(Ordering::SeqCst);
        if bottom == self.slots.len() {
            return Err(value);
        }
        let ptr = Box::into_raw(Box::new(value));
        self.slots[bottom].store(ptr, Ordering::SeqCst);
        self.bottom.store(bottom + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Pop an element from the bottom end.
    ///
    /// Only the owner thread may call this. Returns `None` when the
    /// deque is empty or a thief won the race for the last element; in
    /// the latter case `bottom` is rewound to 0 and the tag is bumped so
    /// stale thieves fail their CAS.
    #[allow(unsafe_code)]
    pub fn pop(&self) -> Option<T> {
        loop {
            let mut bottom = self.bottom.load(Ordering::SeqCst);
            if bottom == 0 {
                return None;
            }
            bottom -= 1;
            self.bottom.store(bottom, Ordering::SeqCst);
            let ptr = self.slots[bottom].load(Ordering::SeqCst);

            let old_age = self.age.load(Ordering::SeqCst);
            let top = unpack_top(old_age) as usize;
            if bottom > top {
                if !ptr.is_null() {
                    return Some(unsafe { *Box::from_raw(ptr) });
                }
                // a hole left by remove, consume it and retry
                _ = self.swiped.fetch_sub(1, Ordering::SeqCst);
                continue;
            }

            // bottom <= top, the deque holds at most one element
            self.bottom.store(0, Ordering::SeqCst);
            let new_age = pack(unpack_tag(old_age).wrapping_add(1), 0);
            if bottom == top {
                if self
                    .age
                    .compare_exchange(old_age, new_age, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if !ptr.is_null() {
                        return Some(unsafe { *Box::from_raw(ptr) });
                    }
                    _ = self.swiped.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
            }

            // a thief took the last element, the deque is now empty and
            // no thief can succeed against the rewound word
            self.age.store(new_age, Ordering::SeqCst);
            return None;
        }
    }

    /// Steal an element from the top end.
    ///
    /// May be called from any thread. Returns `None` when the deque is
    /// observed empty.
    #[allow(unsafe_code)]
    pub fn steal(&self) -> Option<T> {
        loop {
            let old_age = self.age.load(Ordering::SeqCst);
            let bottom = self.bottom.load(Ordering::SeqCst);
            let top = unpack_top(old_age) as usize;
            let tag = unpack_tag(old_age);

            if bottom <= top {
                return None;
            }

            let ptr = self.slots[top].load(Ordering::SeqCst);
            let new_age = pack(tag, (top as u32) + 1);
            if self
                .age
                .compare_exchange(old_age, new_age, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if !ptr.is_null() {
                    return Some(unsafe { *Box::from_raw(ptr) });
                }
                // stole a hole, retry
                _ = self.swiped.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Remove `item` from the deque without disturbing the bottom end.
    ///
    /// Only the owner thread may call this. Returns `true` iff `item`
    /// was present and has been removed; `false` means a thief got
    /// there first (stolen, not swiped) or the item was never queued.
    ///
    /// A middle element is removed by temporarily moving `top` up to
    /// `bottom` so the deque appears empty (parking all thieves),
    /// nulling the slot, then restoring `top` with a bumped tag. A
    /// thief that already advanced past the slot invalidates the
    /// removal.
    #[allow(unsafe_code)]
    pub fn remove(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        let bottom = self.bottom.load(Ordering::SeqCst);
        if bottom > 0 {
            let ptr = self.slots[bottom - 1].load(Ordering::SeqCst);
            if !ptr.is_null() && unsafe { &*ptr } == item {
                // the bottom element, a plain pop removes it
                return self.pop().is_some();
            }
        }
        let top = unpack_top(self.age.load(Ordering::SeqCst)) as usize;
        for i in top..bottom {
            let ptr = self.slots[i].load(Ordering::SeqCst);
            if ptr.is_null() || unsafe { &*ptr } != item {
                continue;
            }
            loop {
                let old_age = self.age.load(Ordering::SeqCst);
                let old_top = unpack_top(old_age);
                let old_tag = unpack_tag(old_age);
                if old_top as usize > i {
                    // element has been stolen
                    return false;
                }
                let empty_age = pack(old_tag, bottom as u32);
                if self
                    .age
                    .compare_exchange(old_age, empty_age, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    continue;
                }
                // the deque now seems empty, null out the slot and
                // restore the word; blind write, no one steals from an
                // empty deque
                let removed = self.slots[i].swap(std::ptr::null_mut(), Ordering::SeqCst);
                drop(unsafe { Box::from_raw(removed) });
                self.age
                    .store(pack(old_tag.wrapping_add(1), old_top), Ordering::SeqCst);
                _ = self.swiped.fetch_add(1, Ordering::SeqCst);
                return true;
            }
        }
        false
    }
}

impl<T> Drop for RawDeque<T> {
    fn drop(&mut self) {
        while self.steal().is_some() {}
    }
}

fn unpack_top(age: u64) -> u32 {
    (age & 0xFFFF_FFFF) as u32
}

fn unpack_tag(age: u64) -> u32 {
    (age >> 32_u32) as u32
}

fn pack(tag: u32, top: u32) -> u64 {
    (u64::from(tag) << 32_u32) | u64::from(top)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_lifo() {
        let deque = RawDeque::new(8);
        for i in 0..8 {
            assert!(deque.push(i).is_ok());
        }
        assert_eq!(deque.push(8), Err(8));
        for i in (0..8).rev() {
            assert_eq!(deque.pop(), Some(i));
        }
        assert_eq!(deque.pop(), None);
        assert!(deque.is_empty());
    }

    #[test]
    fn steal_fifo() {
        let deque = RawDeque::new(8);
        for i in 0..4 {
            assert!(deque.push(i).is_ok());
        }
        for i in 0..4 {
            assert_eq!(deque.steal(), Some(i));
        }
        assert_eq!(deque.steal(), None);
    }

    #[test]
    fn remove_middle_and_bottom() {
        let deque = RawDeque::new(8);
        for i in 0..4 {
            assert!(deque.push(i).is_ok());
        }
        // middle element
        assert!(deque.remove(&1));
        assert!(!deque.remove(&1));
        assert_eq!(deque.len(), 3);
        // bottom element
        assert!(deque.remove(&3));
        assert_eq!(deque.len(), 2);
        assert_eq!(deque.steal(), Some(0));
        assert_eq!(deque.pop(), Some(2));
        assert_eq!(deque.pop(), None);
    }

    #[test]
    fn remove_stolen_fails() {
        let deque = RawDeque::new(8);
        assert!(deque.push(7).is_ok());
        assert_eq!(deque.steal(), Some(7));
        assert!(!deque.remove(&7));
    }

    #[test]
    fn pop_after_holes() {
        let deque = RawDeque::new(8);
        for i in 0..5 {
            assert!(deque.push(i).is_ok());
        }
        assert!(deque.remove(&2));
        assert!(deque.remove(&3));
        assert_eq!(deque.pop(), Some(4));
        assert_eq!(deque.pop(), Some(1));
        assert_eq!(deque.pop(), Some(0));
        assert_eq!(deque.pop(), None);
    }
}
