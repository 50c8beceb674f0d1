//! Quiescence detection: the `wait()` primitive.
//!
//! A caller of [`Wait`] is released once every other live task is durably
//! blocked. When that already holds at the first poll the future completes
//! immediately; otherwise the caller parks here and the scheduler releases it
//! as soon as the run queue drains, before it is allowed to advance the
//! virtual clock.

use crate::runtime::Sim;
use quiesce_env::{BlockReason, TaskId};
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use tracing::trace;

struct Waiter {
    task: TaskId,
    released: Rc<Cell<bool>>,
    waker: Waker,
}

/// Registry of tasks parked in `wait()`.
#[derive(Default)]
pub struct QuiescenceDetector {
    waiters: Vec<Waiter>,
}

impl QuiescenceDetector {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, task: TaskId, released: Rc<Cell<bool>>, waker: &Waker) {
        if let Some(existing) = self.waiters.iter_mut().find(|w| Rc::ptr_eq(&w.released, &released)) {
            existing.waker = waker.clone();
            return;
        }
        self.waiters.push(Waiter {
            task,
            released,
            waker: waker.clone(),
        });
    }

    fn remove(&mut self, released: &Rc<Cell<bool>>) {
        self.waiters.retain(|w| !Rc::ptr_eq(&w.released, released));
    }

    /// Releases every parked waiter and returns the wakers to fire plus the
    /// released task ids.
    pub fn release_all(&mut self) -> Vec<(TaskId, Waker)> {
        self.waiters
            .drain(..)
            .map(|w| {
                w.released.set(true);
                (w.task, w.waker)
            })
            .collect()
    }

    /// Forgets all waiters (run teardown).
    pub fn clear(&mut self) {
        self.waiters.clear();
    }
}

/// Future returned by [`Sim::wait`].
pub struct Wait {
    sim: Sim,
    released: Option<Rc<Cell<bool>>>,
}

impl Wait {
    pub(crate) fn new(sim: Sim) -> Self {
        Self {
            sim,
            released: None,
        }
    }
}

impl Future for Wait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        if let Some(released) = &this.released {
            if released.get() {
                this.released = None;
                return Poll::Ready(());
            }
        } else if this.sim.shared().is_quiescent_for_caller() {
            trace!(task = ?this.sim.current_task(), "wait satisfied immediately");
            return Poll::Ready(());
        }

        let released = this
            .released
            .get_or_insert_with(|| Rc::new(Cell::new(false)))
            .clone();
        let task = this.sim.current_task().unwrap_or(TaskId::ROOT);
        this.sim
            .shared()
            .quiescence
            .borrow_mut()
            .register(task, released, cx.waker());
        this.sim.note_block(BlockReason::Wait);
        Poll::Pending
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        if let Some(released) = self.released.take() {
            self.sim.shared().quiescence.borrow_mut().remove(&released);
        }
    }
}
