use crate::channel::{ChannelReader, ChannelWriter};
use crate::error::{Error, Result};
use crate::scheduler::current::BlockedGuard;
use crate::timer::Timer;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::ThreadId;

/// What a choice alternative waits for. The set is closed: channel
/// reading ends, channel writing ends and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlternativeKind {
    /// A value becoming readable on a channel.
    Read,
    /// A reader becoming available, or buffer space freeing, on a
    /// channel.
    Write,
    /// A timer expiry.
    Timer,
}

/// Outcome of enabling one alternative during a selection scan.
pub(crate) enum Enabled {
    /// The alternative claimed the selection; for channels a
    /// reservation for the selector has been recorded.
    Ready,
    /// Not ready; the alternative queued itself for later signalling.
    Registered,
    /// Another alternative resolved the selection first.
    Resolved,
    /// The alternative's channel is poisoned.
    Poisoned,
}

/// Capability set every alternative target implements. Crate-private:
/// the alternative set is closed.
pub(crate) trait Selectable: Send + Sync {
    /// Record the permanent choice role on the target. Panics on a
    /// conflicting or repeated marking.
    fn mark(&self);
    /// Scan step: claim readiness through `choice` (reserving for
    /// `selector` where reservation applies) or register an observer.
    fn enable(&self, choice: &Arc<ChoiceInner>, index: usize, selector: ThreadId) -> Enabled;
    /// Withdraw an observer registered for `choice`, if still queued.
    fn disable(&self, choice: &Arc<ChoiceInner>);
    /// Selection completed on this alternative.
    fn on_selected(&self);
}

/// One event source inside a [`Choice`].
pub struct Alternative {
    kind: AlternativeKind,
    target: Arc<dyn Selectable>,
}

impl Alternative {
    /// Wait for `reader`'s channel to have a readable value.
    #[must_use]
    pub fn read<T: Send + 'static>(reader: &ChannelReader<T>) -> Self {
        Alternative {
            kind: AlternativeKind::Read,
            target: reader.selectable(),
        }
    }

    /// Wait for `writer`'s channel to accept a value without blocking.
    #[must_use]
    pub fn write<T: Send + 'static>(writer: &ChannelWriter<T>) -> Self {
        Alternative {
            kind: AlternativeKind::Write,
            target: writer.selectable(),
        }
    }

    /// Wait for `timer` to expire.
    #[must_use]
    pub fn timer(timer: &Timer) -> Self {
        Alternative {
            kind: AlternativeKind::Timer,
            target: timer.core.clone(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> AlternativeKind {
        self.kind
    }
}

impl Debug for Alternative {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Alternative")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Inactive,
    InProgress,
    Waiting,
}

#[derive(Debug)]
struct ChoiceState {
    phase: Phase,
    selected: Option<usize>,
    poisoned: bool,
    selector: Option<ThreadId>,
    /// First index of the current scan.
    scan_start: usize,
    /// How many alternatives the current scan has passed; a signal for
    /// an index at or before this step must be accepted, the scan will
    /// not revisit it.
    scan_pos: usize,
    /// Fair selection resumes one past the last selected index.
    fair_cursor: usize,
}

/// Selection state shared between the selecting thread and the
/// channels/timers signalling it.
pub(crate) struct ChoiceInner {
    state: Mutex<ChoiceState>,
    resolved: Condvar,
    alternative_count: usize,
}

impl ChoiceInner {
    fn new(alternative_count: usize) -> Self {
        ChoiceInner {
            state: Mutex::new(ChoiceState {
                phase: Phase::Inactive,
                selected: None,
                poisoned: false,
                selector: None,
                scan_start: 0,
                scan_pos: 0,
                fair_cursor: 0,
            }),
            resolved: Condvar::new(),
            alternative_count,
        }
    }

    /// Claim the selection from inside an `enable` call, under the
    /// alternative's own lock. Fails when a signal got here first or
    /// the choice is poisoned.
    pub(crate) fn claim_scan(&self, index: usize) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.poisoned || state.selected.is_some() {
            return false;
        }
        state.selected = Some(index);
        true
    }

    /// Offer an event for alternative `index`. Returns the selector's
    /// thread id when the offer is accepted (the caller records its
    /// reservation under its own lock), or `None` to decline.
    pub(crate) fn signal(&self, index: usize) -> Option<ThreadId> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.poisoned || state.selected.is_some() {
            return None;
        }
        match state.phase {
            Phase::Inactive => None,
            Phase::InProgress => {
                let count = self.alternative_count;
                let offset = (index + count - state.scan_start) % count;
                // inclusive window: the alternative at scan_pos has
                // already registered its observer inside `enable`, but
                // the scan records the step only after `enable` returns;
                // declining in that gap would drop the event for good
                if offset <= state.scan_pos {
                    state.selected = Some(index);
                    state.selector
                } else {
                    // not yet enabled in this scan, no observer can
                    // exist for it; the scan will observe the readiness
                    None
                }
            }
            Phase::Waiting => {
                state.selected = Some(index);
                self.resolved.notify_all();
                state.selector
            }
        }
    }

    /// A channel this choice observes has been poisoned.
    pub(crate) fn poison_signal(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.poisoned = true;
        self.resolved.notify_all();
    }
}

impl Debug for ChoiceInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChoiceInner")
            .field("alternatives", &self.alternative_count)
            .finish_non_exhaustive()
    }
}

/// Multi-way selection over channel ends and timers.
///
/// Construction permanently marks every channel end with its role; a
/// channel end can belong to at most one choice, ever, and a channel
/// cannot serve one choice as input and another as output. Violations
/// panic immediately: they form a deadlock class, not a runtime
/// condition.
///
/// Selection reports an index; the caller then performs the matching
/// channel operation, which the reservation protocol guarantees will
/// succeed without contention from other channel users. A choice is
/// used by one task at a time.
pub struct Choice {
    alternatives: Vec<Alternative>,
    inner: Arc<ChoiceInner>,
}

impl Choice {
    /// # Panics
    /// if `alternatives` is empty, or marking a channel end conflicts
    /// with an earlier choice attachment.
    #[must_use]
    pub fn new(alternatives: Vec<Alternative>) -> Self {
        assert!(
            !alternatives.is_empty(),
            "a choice needs at least one alternative"
        );
        for alternative in &alternatives {
            alternative.target.mark();
        }
        let inner = Arc::new(ChoiceInner::new(alternatives.len()));
        Choice {
            alternatives,
            inner,
        }
    }

    /// Block until some alternative is ready; lowest index wins when
    /// several are.
    ///
    /// # Errors
    /// `Error::Poisoned` if any observed channel is poisoned.
    pub fn select_priority(&self) -> Result<usize> {
        match self.select(false, true)? {
            Some(index) => Ok(index),
            None => unreachable!("blocking selection resolved without an index"),
        }
    }

    /// Block until some alternative is ready, scanning from a rotating
    /// cursor so every persistently ready alternative is selected
    /// within one full rotation.
    ///
    /// # Errors
    /// `Error::Poisoned` if any observed channel is poisoned.
    pub fn select_fair(&self) -> Result<usize> {
        match self.select(true, true)? {
            Some(index) => Ok(index),
            None => unreachable!("blocking selection resolved without an index"),
        }
    }

    /// One priority scan without blocking; `None` when nothing is
    /// ready.
    ///
    /// # Errors
    /// `Error::Poisoned` if any observed channel is poisoned.
    pub fn try_select_priority(&self) -> Result<Option<usize>> {
        self.select(false, false)
    }

    /// One fair scan without blocking; `None` when nothing is ready.
    ///
    /// # Errors
    /// `Error::Poisoned` if any observed channel is poisoned.
    pub fn try_select_fair(&self) -> Result<Option<usize>> {
        self.select(true, false)
    }

    fn select(&self, fair: bool, block: bool) -> Result<Option<usize>> {
        let count = self.alternatives.len();
        let me = std::thread::current().id();
        let start = {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            assert!(
                state.phase == Phase::Inactive,
                "choice is already selecting on another thread"
            );
            if state.poisoned {
                return Err(Error::Poisoned);
            }
            let start = if fair { state.fair_cursor } else { 0 };
            state.phase = Phase::InProgress;
            state.selector = Some(me);
            state.selected = None;
            state.scan_start = start;
            state.scan_pos = 0;
            start
        };

        let mut registered = vec![false; count];
        for step in 0..count {
            let index = (start + step) % count;
            match self.alternatives[index].target.enable(&self.inner, index, me) {
                Enabled::Ready | Enabled::Resolved => break,
                Enabled::Poisoned => {
                    self.inner.poison_signal();
                    break;
                }
                Enabled::Registered => {
                    registered[index] = true;
                    let mut state = self
                        .inner
                        .state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    state.scan_pos = step + 1;
                    if state.selected.is_some() || state.poisoned {
                        break;
                    }
                }
            }
        }

        let (chosen, poisoned) = {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if block && state.selected.is_none() && !state.poisoned {
                state.phase = Phase::Waiting;
                let _blocked = BlockedGuard::new();
                while state.selected.is_none() && !state.poisoned {
                    state = self
                        .inner
                        .resolved
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
            let chosen = state.selected.take();
            let poisoned = state.poisoned;
            state.phase = Phase::Inactive;
            state.selector = None;
            if fair {
                if let Some(index) = chosen {
                    state.fair_cursor = (index + 1) % count;
                }
            }
            (chosen, poisoned)
        };

        for (index, was_registered) in registered.iter().enumerate() {
            if *was_registered {
                self.alternatives[index].target.disable(&self.inner);
            }
        }
        if poisoned {
            return Err(Error::Poisoned);
        }
        if let Some(index) = chosen {
            self.alternatives[index].target.on_selected();
        }
        Ok(chosen)
    }

    #[must_use]
    pub fn alternative_count(&self) -> usize {
        self.alternatives.len()
    }
}

impl Debug for Choice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.alternatives.iter().map(Alternative::kind))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{BufferKind, Channel};
    use std::time::Duration;

    #[test]
    fn priority_prefers_the_lowest_ready_index() {
        let idle = Channel::buffered(BufferKind::Fifo, 2);
        let first = Channel::buffered(BufferKind::Fifo, 2);
        let second = Channel::buffered(BufferKind::Fifo, 2);
        first.writer().write(10).unwrap();
        second.writer().write(20).unwrap();
        let readers = [idle.reader(), first.reader(), second.reader()];
        let choice = Choice::new(readers.iter().map(Alternative::read).collect());
        for _ in 0..2 {
            // index 1 and 2 both ready; 1 must win every time
            assert_eq!(choice.select_priority().unwrap(), 1);
            assert_eq!(readers[1].read().unwrap(), 10);
            first.writer().write(10).unwrap();
        }
    }

    #[test]
    fn fair_selection_rotates_over_ready_alternatives() {
        let channels: Vec<_> = (0..3)
            .map(|i| {
                let channel = Channel::buffered(BufferKind::Fifo, 1);
                channel.writer().write(i).unwrap();
                channel
            })
            .collect();
        let readers: Vec<_> = channels.iter().map(Channel::reader).collect();
        let choice = Choice::new(readers.iter().map(Alternative::read).collect());
        let mut seen = Vec::new();
        for _ in 0..3 {
            let index = choice.select_fair().unwrap();
            // keep every alternative persistently ready
            let value = readers[index].read().unwrap();
            channels[index].writer().write(value).unwrap();
            seen.push(index);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn try_select_reports_nothing_ready() {
        let channel: Channel<i32> = Channel::buffered(BufferKind::Fifo, 1);
        let reader = channel.reader();
        let choice = Choice::new(vec![Alternative::read(&reader)]);
        assert_eq!(choice.try_select_priority().unwrap(), None);
        channel.writer().write(5).unwrap();
        assert_eq!(choice.try_select_priority().unwrap(), Some(0));
        assert_eq!(reader.read().unwrap(), 5);
    }

    #[test]
    fn blocking_select_wakes_on_late_write() {
        let channel = Channel::rendezvous();
        let reader = channel.reader();
        let writer = channel.writer();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            writer.write(9_i32).unwrap();
        });
        let choice = Choice::new(vec![Alternative::read(&reader)]);
        assert_eq!(choice.select_priority().unwrap(), 0);
        // the reservation guarantees this read cannot block
        assert_eq!(reader.read().unwrap(), 9);
        producer.join().unwrap();
    }

    #[test]
    fn write_alternative_fires_when_space_frees() {
        let channel = Channel::buffered(BufferKind::Fifo, 1);
        let writer = channel.writer();
        writer.write(1).unwrap();
        let choice = Choice::new(vec![Alternative::write(&writer)]);
        assert_eq!(choice.try_select_priority().unwrap(), None);
        let reader = channel.reader();
        let consumer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            reader.read().unwrap()
        });
        assert_eq!(choice.select_priority().unwrap(), 0);
        writer.write(2).unwrap();
        assert_eq!(consumer.join().unwrap(), 1);
    }

    #[test]
    fn timer_alternative_selects_on_expiry() {
        let channel: Channel<i32> = Channel::buffered(BufferKind::Fifo, 1);
        let reader = channel.reader();
        let timer = Timer::new();
        let choice = Choice::new(vec![Alternative::read(&reader), Alternative::timer(&timer)]);
        timer.arm(Duration::from_millis(50));
        assert_eq!(choice.select_priority().unwrap(), 1);
        // selection consumed the expiry
        assert!(!timer.is_pending());
    }

    #[test]
    fn poisoned_channel_poisons_the_choice() {
        let channel: Channel<i32> = Channel::buffered(BufferKind::Fifo, 1);
        let reader = channel.reader();
        let choice = Choice::new(vec![Alternative::read(&reader)]);
        channel.poison();
        assert_eq!(choice.select_priority(), Err(Error::Poisoned));
        // poisoning is sticky on the choice as well
        assert_eq!(choice.try_select_priority(), Err(Error::Poisoned));
    }

    #[test]
    fn poison_wakes_a_waiting_selector() {
        let channel: Channel<i32> = Channel::rendezvous();
        let reader = channel.reader();
        let choice = Choice::new(vec![Alternative::read(&reader)]);
        let poisoner = {
            let channel = channel.writer();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                channel.poison();
            })
        };
        assert_eq!(choice.select_priority(), Err(Error::Poisoned));
        poisoner.join().unwrap();
    }

    #[test]
    fn write_racing_the_scan_registration_is_accepted() {
        let channel = Channel::rendezvous();
        let reader = channel.reader();
        let writer = channel.writer();
        let me = std::thread::current().id();
        let inner = Arc::new(ChoiceInner::new(1));
        {
            let mut state = inner.state.lock().unwrap();
            state.phase = Phase::InProgress;
            state.selector = Some(me);
        }
        // the scan has registered the observer inside `enable` but has
        // not recorded the step yet
        let target = reader.selectable();
        assert!(matches!(target.enable(&inner, 0, me), Enabled::Registered));
        let delivery = std::thread::spawn(move || writer.write(7_i32));
        // the offer lands inside the registration gap and must still be
        // accepted, otherwise the selector parks forever
        loop {
            if inner.state.lock().unwrap().selected == Some(0) {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        // the reservation makes this read non-blocking
        assert_eq!(reader.read().unwrap(), 7);
        delivery.join().unwrap().unwrap();
    }

    #[test]
    fn write_selection_delivers_each_value_once() {
        const READERS: usize = 50;
        let channel = Channel::rendezvous();
        let writer = channel.writer();
        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let reader = channel.reader();
                std::thread::spawn(move || reader.read().unwrap())
            })
            .collect();
        let choice = Choice::new(vec![Alternative::write(&writer)]);
        for i in 0..READERS {
            // selection reserves the hand-off, so the write cannot race
            // the direct readers for a reader someone else consumes
            assert_eq!(choice.select_priority().unwrap(), 0);
            writer.write(i).unwrap();
        }
        let mut delivered: Vec<usize> = readers
            .into_iter()
            .map(|reader| reader.join().unwrap())
            .collect();
        delivered.sort_unstable();
        assert_eq!(delivered, (0..READERS).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "already attached to a choice")]
    fn conflicting_role_marking_panics() {
        let channel: Channel<i32> = Channel::buffered(BufferKind::Fifo, 1);
        let reader = channel.reader();
        let writer = channel.writer();
        let _input = Choice::new(vec![Alternative::read(&reader)]);
        // the same channel cannot also serve a choice as output
        let _conflict = Choice::new(vec![Alternative::write(&writer)]);
    }
}
