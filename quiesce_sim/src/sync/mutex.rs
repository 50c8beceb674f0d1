//! Async mutex with FIFO hand-off.
//!
//! Unlocking passes ownership straight to the longest waiting locker, so a
//! task that releases and immediately re-locks cannot starve the queue.

use crate::runtime::Sim;
use quiesce_env::BlockReason;
use std::cell::{RefCell, RefMut};
use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

#[derive(Default)]
struct LockState {
    locked: bool,
    next_ticket: u64,
    queue: VecDeque<(u64, Waker)>,
    /// Ticket the lock was handed to but that has not been polled yet
    handed: Option<u64>,
}

impl LockState {
    fn release(&mut self) {
        match self.queue.pop_front() {
            Some((ticket, waker)) => {
                self.handed = Some(ticket);
                waker.wake();
            }
            None => self.locked = false,
        }
    }
}

/// Mutual exclusion for data shared between tasks of one run.
pub struct Mutex<T> {
    sim: Sim,
    state: RefCell<LockState>,
    value: RefCell<T>,
}

impl<T> Mutex<T> {
    pub fn new(sim: &Sim, value: T) -> Self {
        Self {
            sim: sim.clone(),
            state: RefCell::new(LockState::default()),
            value: RefCell::new(value),
        }
    }

    /// Acquires the lock, waiting behind earlier lockers.
    pub fn lock(&self) -> Lock<'_, T> {
        Lock {
            mutex: self,
            ticket: None,
        }
    }

    /// Acquires the lock only if it is free and nobody is queued.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.state.borrow_mut();
        if state.locked {
            return None;
        }
        state.locked = true;
        drop(state);
        Some(self.guard())
    }

    pub fn is_locked(&self) -> bool {
        self.state.borrow().locked
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    fn guard(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            mutex: self,
            value: self.value.borrow_mut(),
        }
    }
}

/// Future returned by [`Mutex::lock`].
pub struct Lock<'a, T> {
    mutex: &'a Mutex<T>,
    ticket: Option<u64>,
}

impl<'a, T> Future for Lock<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<MutexGuard<'a, T>> {
        let this = self.get_mut();
        let mutex = this.mutex;
        let mut state = mutex.state.borrow_mut();

        match this.ticket {
            Some(ticket) if state.handed == Some(ticket) => {
                state.handed = None;
                this.ticket = None;
                drop(state);
                return Poll::Ready(mutex.guard());
            }
            Some(ticket) => {
                if let Some(entry) = state.queue.iter_mut().find(|(t, _)| *t == ticket) {
                    entry.1 = cx.waker().clone();
                }
            }
            None if !state.locked => {
                state.locked = true;
                drop(state);
                return Poll::Ready(mutex.guard());
            }
            None => {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                state.queue.push_back((ticket, cx.waker().clone()));
                this.ticket = Some(ticket);
            }
        }

        drop(state);
        mutex.sim.note_block(BlockReason::Lock);
        Poll::Pending
    }
}

impl<T> Drop for Lock<'_, T> {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        let mut state = self.mutex.state.borrow_mut();
        if state.handed == Some(ticket) {
            // Handed over but never taken: pass it on.
            state.handed = None;
            state.release();
        } else {
            state.queue.retain(|(t, _)| *t != ticket);
        }
    }
}

/// Held lock; releases on drop.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    value: RefMut<'a, T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // The next owner is only woken here; it runs after this guard's
        // borrow of the value is gone.
        self.mutex.state.borrow_mut().release();
    }
}
