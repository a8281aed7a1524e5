use super::{offer, withdraw, Observer, Role};
use crate::choice::{ChoiceInner, Enabled};
use crate::error::{Error, Result};
use crate::scheduler::current::BlockedGuard;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::ThreadId;

struct Shared<T> {
    /// The single pending value, present from publish to hand-off.
    slot: Option<T>,
    /// Completed hand-offs; a writer's publish was consumed when this
    /// has advanced past its publish-time snapshot.
    takes: u64,
    readers_waiting: usize,
    read_reserved: Option<ThreadId>,
    write_reserved: Option<ThreadId>,
    poisoned: bool,
    role: Option<Role>,
    read_observers: VecDeque<Observer>,
    write_observers: VecDeque<Observer>,
}

/// Rendezvous channel: `write` publishes into the single slot and only
/// returns after a reader has taken the value.
///
/// All state sits behind one mutex; readers park on `data_ready`,
/// writers park on `data_taken` both for a free slot and for the
/// hand-off. Reservations name the one thread entitled to complete the
/// next take (or publish) after a choice selection; everyone else keeps
/// waiting behind the reservation.
pub(crate) struct Rendezvous<T> {
    modifying: Mutex<Shared<T>>,
    data_ready: Condvar,
    data_taken: Condvar,
}

impl<T: Send> Rendezvous<T> {
    pub(crate) fn new() -> Self {
        Rendezvous {
            modifying: Mutex::new(Shared {
                slot: None,
                takes: 0,
                readers_waiting: 0,
                read_reserved: None,
                write_reserved: None,
                poisoned: false,
                role: None,
                read_observers: VecDeque::new(),
                write_observers: VecDeque::new(),
            }),
            data_ready: Condvar::new(),
            data_taken: Condvar::new(),
        }
    }

    pub(crate) fn write(&self, value: T) -> Result<()> {
        let me = std::thread::current().id();
        let may_publish = |shared: &Shared<T>| {
            shared.slot.is_none()
                && (shared.write_reserved.is_none() || shared.write_reserved == Some(me))
        };
        let mut shared = self
            .modifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if shared.poisoned {
            return Err(Error::Poisoned);
        }
        if !may_publish(&shared) {
            let _blocked = BlockedGuard::new();
            loop {
                shared = self
                    .data_taken
                    .wait(shared)
                    .unwrap_or_else(PoisonError::into_inner);
                if shared.poisoned {
                    return Err(Error::Poisoned);
                }
                if may_publish(&shared) {
                    break;
                }
            }
        }
        if shared.write_reserved == Some(me) {
            shared.write_reserved = None;
        }
        shared.slot = Some(value);
        let handed_off = shared.takes + 1;
        if shared.readers_waiting > 0 {
            self.data_ready.notify_all();
        } else if shared.read_reserved.is_none() {
            if let Some(selector) = offer(&mut shared.read_observers) {
                shared.read_reserved = Some(selector);
            }
        }
        // rendezvous: block until the value is actually taken
        if shared.takes < handed_off {
            let _blocked = BlockedGuard::new();
            loop {
                shared = self
                    .data_taken
                    .wait(shared)
                    .unwrap_or_else(PoisonError::into_inner);
                if shared.takes >= handed_off {
                    break;
                }
                if shared.poisoned {
                    return Err(Error::Poisoned);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn read(&self) -> Result<T> {
        let me = std::thread::current().id();
        let mut shared = self
            .modifying
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            let may_take = shared.slot.is_some()
                && (shared.read_reserved.is_none() || shared.read_reserved == Some(me));
            if may_take {
                shared.read_reserved = None;
                let value = shared
                    .slot
                    .take()
                    .unwrap_or_else(|| unreachable!("takeable slot was empty"));
                shared.takes += 1;
                self.data_taken.notify_all();
                return Ok(value);
            }
            if shared.poisoned {
                return Err(Error::Poisoned);
            }
            shared.readers_waiting += 1;
            // no writer in sight; a choice waiting to write may supply one
            if shared.slot.is_none() && shared.write_reserved.is_none() {
                if let Some(selector) = offer(&mut shared.write_observers) {
                    shared.write_reserved = Some(selector);
                }
            }
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
        // an unconsumed publish is lost; its writer gets the error
        shared.slot = None;
        shared.read_reserved = None;
        shared.write_reserved = None;
        let mut observers: Vec<Observer> = shared.read_observers.drain(..).collect();
        observers.extend(shared.write_observers.drain(..));
        for observer in observers {
            if let Some(choice) = observer.choice.upgrade() {
                choice.poison_signal();
            }
        }
        self.data_ready.notify_all();
        self.data_taken.notify_all();
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
        if shared.slot.is_some() && shared.read_reserved.is_none() {
            if choice.claim_scan(index) {
                shared.read_reserved = Some(selector);
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
        if shared.readers_waiting > 0 && shared.slot.is_none() && shared.write_reserved.is_none() {
            if choice.claim_scan(index) {
                shared.write_reserved = Some(selector);
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
