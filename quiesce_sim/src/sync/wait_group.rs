//! Counter that tasks wait on until it drops to zero.

use crate::runtime::Sim;
use quiesce_env::BlockReason;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

struct Inner {
    sim: Sim,
    count: Cell<usize>,
    waiters: RefCell<Vec<Waker>>,
}

/// Clonable handle to a shared counter.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Rc<Inner>,
}

impl WaitGroup {
    pub fn new(sim: &Sim) -> Self {
        Self {
            inner: Rc::new(Inner {
                sim: sim.clone(),
                count: Cell::new(0),
                waiters: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Adds `n` outstanding units of work.
    pub fn add(&self, n: usize) {
        self.inner.count.set(self.inner.count.get() + n);
    }

    /// Marks one unit done, releasing waiters when the count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if called more often than `add` allowed.
    pub fn done(&self) {
        let count = self.inner.count.get();
        assert!(count > 0, "negative WaitGroup counter");
        self.inner.count.set(count - 1);
        if count == 1 {
            for waker in self.inner.waiters.borrow_mut().drain(..) {
                waker.wake();
            }
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.get()
    }

    /// Waits until the count is zero.
    pub fn wait(&self) -> WaitGroupWait {
        WaitGroupWait {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// Future returned by [`WaitGroup::wait`].
pub struct WaitGroupWait {
    inner: Rc<Inner>,
}

impl Future for WaitGroupWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.inner.count.get() == 0 {
            return Poll::Ready(());
        }
        self.inner.waiters.borrow_mut().push(cx.waker().clone());
        self.inner.sim.note_block(BlockReason::WaitGroup);
        Poll::Pending
    }
}
