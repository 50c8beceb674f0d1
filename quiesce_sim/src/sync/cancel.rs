//! Cancellation contexts with deadlines and cancel callbacks.
//!
//! A [`CancelContext`] forms a tree: cancelling a context cancels all of its
//! descendants with the same error. Deadlines are harness timers rather
//! than tasks, so a context that never expires cannot leak.

use crate::clock::TimerKey;
use crate::runtime::Sim;
use quiesce_env::{BlockReason, EnvError};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tracing::trace;

type Callback = Box<dyn FnOnce()>;

struct CtxInner {
    sim: Sim,
    err: RefCell<Option<EnvError>>,
    deadline: Option<Duration>,
    waiters: RefCell<Vec<Waker>>,
    children: RefCell<Vec<Weak<CtxInner>>>,
    callbacks: RefCell<Vec<(u64, Callback)>>,
    next_callback: Cell<u64>,
    timer: Cell<Option<TimerKey>>,
}

impl CtxInner {
    fn new(sim: &Sim, deadline: Option<Duration>) -> Rc<Self> {
        Rc::new(Self {
            sim: sim.clone(),
            err: RefCell::new(None),
            deadline,
            waiters: RefCell::new(Vec::new()),
            children: RefCell::new(Vec::new()),
            callbacks: RefCell::new(Vec::new()),
            next_callback: Cell::new(0),
            timer: Cell::new(None),
        })
    }

    fn cancel(&self, err: EnvError) {
        {
            let mut slot = self.err.borrow_mut();
            if slot.is_some() {
                return;
            }
            *slot = Some(err.clone());
        }
        trace!(%err, now = ?self.sim.now(), "context cancelled");

        if let Some(key) = self.timer.take() {
            self.sim.cancel_timer(key);
        }
        for waker in self.waiters.take() {
            waker.wake();
        }
        for child in self.children.take() {
            if let Some(child) = child.upgrade() {
                child.cancel(err.clone());
            }
        }
        for (_, callback) in self.callbacks.take() {
            callback();
        }
    }
}

/// Cancellation signal shared by a tree of tasks.
#[derive(Clone)]
pub struct CancelContext {
    inner: Rc<CtxInner>,
}

impl CancelContext {
    /// Root context: never cancelled, no deadline.
    pub fn background(sim: &Sim) -> Self {
        Self {
            inner: CtxInner::new(sim, None),
        }
    }

    /// Derives a context cancelled by the returned handle or by this one.
    pub fn with_cancel(&self) -> (CancelContext, CancelHandle) {
        self.derive(self.inner.deadline)
    }

    /// Derives a context that is also cancelled with
    /// [`EnvError::DeadlineExceeded`] once virtual time reaches `deadline`.
    pub fn with_deadline(&self, deadline: Duration) -> (CancelContext, CancelHandle) {
        let effective = match self.inner.deadline {
            Some(parent) if parent <= deadline => parent,
            _ => deadline,
        };
        let (ctx, handle) = self.derive(Some(effective));
        if effective == deadline && ctx.err().is_none() {
            ctx.arm_deadline(deadline);
        }
        (ctx, handle)
    }

    /// Like [`with_deadline`](Self::with_deadline), relative to now.
    pub fn with_timeout(&self, timeout: Duration) -> (CancelContext, CancelHandle) {
        let deadline = self.inner.sim.now().saturating_add(timeout);
        self.with_deadline(deadline)
    }

    fn derive(&self, deadline: Option<Duration>) -> (CancelContext, CancelHandle) {
        let child = CtxInner::new(&self.inner.sim, deadline);
        let parent_err = self.inner.err.borrow().clone();
        match parent_err {
            Some(err) => child.cancel(err),
            None => {
                let mut children = self.inner.children.borrow_mut();
                children.retain(|c| c.strong_count() > 0);
                children.push(Rc::downgrade(&child));
            }
        }
        (
            CancelContext {
                inner: Rc::clone(&child),
            },
            CancelHandle { inner: child },
        )
    }

    fn arm_deadline(&self, deadline: Duration) {
        if deadline <= self.inner.sim.now() {
            self.inner.cancel(EnvError::DeadlineExceeded);
            return;
        }
        let weak = Rc::downgrade(&self.inner);
        let key = self.inner.sim.call_at(
            deadline,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.timer.set(None);
                    inner.cancel(EnvError::DeadlineExceeded);
                }
            }),
        );
        self.inner.timer.set(Some(key));
    }

    /// Why the context ended, or `None` while it is live.
    pub fn err(&self) -> Option<EnvError> {
        self.inner.err.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.inner.err.borrow().is_some()
    }

    /// Virtual deadline, if any ancestor set one.
    pub fn deadline(&self) -> Option<Duration> {
        self.inner.deadline
    }

    /// Resolves with the context's error once it is cancelled.
    pub fn done(&self) -> Done {
        Done {
            inner: Rc::clone(&self.inner),
        }
    }

    /// Arranges for `f` to run in its own task when the context is
    /// cancelled. Runs it right away if the context already is.
    pub fn after_func<F>(&self, f: F) -> AfterFunc
    where
        F: FnOnce() + 'static,
    {
        let sim = self.inner.sim.clone();
        let spawn = move || {
            drop(sim.spawn_named("after_func", async move { f() }));
        };

        if self.is_done() {
            spawn();
            return AfterFunc {
                inner: Weak::new(),
                id: 0,
            };
        }

        let id = self.inner.next_callback.get();
        self.inner.next_callback.set(id + 1);
        self.inner.callbacks.borrow_mut().push((id, Box::new(spawn)));
        AfterFunc {
            inner: Rc::downgrade(&self.inner),
            id,
        }
    }
}

impl std::fmt::Debug for CancelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelContext")
            .field("err", &self.err())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

/// Cancels the context it was created with.
pub struct CancelHandle {
    inner: Rc<CtxInner>,
}

impl CancelHandle {
    /// Cancels with [`EnvError::Canceled`]. Later calls do nothing.
    pub fn cancel(&self) {
        self.inner.cancel(EnvError::Canceled);
    }
}

/// Registration returned by [`CancelContext::after_func`].
pub struct AfterFunc {
    inner: Weak<CtxInner>,
    id: u64,
}

impl AfterFunc {
    /// Unregisters the callback. Returns true if this prevented it from
    /// running.
    pub fn stop(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut callbacks = inner.callbacks.borrow_mut();
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != self.id);
        callbacks.len() != before
    }
}

/// Future returned by [`CancelContext::done`].
pub struct Done {
    inner: Rc<CtxInner>,
}

impl Future for Done {
    type Output = EnvError;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<EnvError> {
        if let Some(err) = self.inner.err.borrow().clone() {
            return Poll::Ready(err);
        }
        let mut waiters = self.inner.waiters.borrow_mut();
        if !waiters.iter().any(|w| w.will_wake(cx.waker())) {
            waiters.push(cx.waker().clone());
        }
        drop(waiters);
        self.inner.sim.note_block(BlockReason::Cancellation);
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::run;
    use crate::HarnessError;

    #[test]
    fn test_after_func_runs_only_after_cancel() {
        run(|sim| async move {
            let (ctx, cancel) = CancelContext::background(&sim).with_cancel();
            let fired = Rc::new(Cell::new(false));
            let f = fired.clone();
            ctx.after_func(move || f.set(true));

            sim.wait().await;
            assert!(!fired.get());

            cancel.cancel();
            sim.wait().await;
            assert!(fired.get());
        })
        .unwrap();
    }

    #[test]
    fn test_stopped_after_func_never_runs() {
        run(|sim| async move {
            let (ctx, cancel) = CancelContext::background(&sim).with_cancel();
            let fired = Rc::new(Cell::new(false));
            let f = fired.clone();
            let registration = ctx.after_func(move || f.set(true));

            assert!(registration.stop());
            assert!(!registration.stop());
            cancel.cancel();
            sim.wait().await;
            assert!(!fired.get());
        })
        .unwrap();
    }

    #[test]
    fn test_timeout_expires_exactly_at_deadline() {
        run(|sim| async move {
            let (ctx, _cancel) = CancelContext::background(&sim).with_timeout(Duration::from_secs(5));
            assert_eq!(ctx.deadline(), Some(Duration::from_secs(5)));

            sim.sleep(Duration::from_secs(5) - Duration::from_nanos(1)).await;
            sim.wait().await;
            assert_eq!(ctx.err(), None);

            sim.sleep(Duration::from_nanos(1)).await;
            sim.wait().await;
            assert_eq!(ctx.err(), Some(EnvError::DeadlineExceeded));
        })
        .unwrap();
    }

    #[test]
    fn test_cancel_propagates_to_children_and_wakes_done() {
        run(|sim| async move {
            let (parent, cancel) = CancelContext::background(&sim).with_cancel();
            let (child, _child_cancel) = parent.with_timeout(Duration::from_secs(60));
            let waiter = sim.spawn(async move { child.done().await });

            sim.wait().await;
            cancel.cancel();
            cancel.cancel();
            assert_eq!(waiter.await, EnvError::Canceled);
            assert_eq!(parent.err(), Some(EnvError::Canceled));
            // Cancelling removed the child's deadline timer.
            assert_eq!(sim.now(), Duration::ZERO);
        })
        .unwrap();
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        run(|sim| async move {
            let (parent, cancel) = CancelContext::background(&sim).with_cancel();
            cancel.cancel();
            let (child, _) = parent.with_cancel();
            assert_eq!(child.err(), Some(EnvError::Canceled));
            assert_eq!(child.done().await, EnvError::Canceled);
        })
        .unwrap();
    }

    #[test]
    fn test_past_deadline_cancels_immediately() {
        run(|sim| async move {
            sim.sleep(Duration::from_secs(1)).await;
            let (ctx, _) = CancelContext::background(&sim).with_deadline(Duration::from_millis(500));
            assert_eq!(ctx.err(), Some(EnvError::DeadlineExceeded));
        })
        .unwrap();
    }

    #[test]
    fn test_parent_deadline_bounds_child() {
        run(|sim| async move {
            let (parent, _) = CancelContext::background(&sim).with_timeout(Duration::from_secs(1));
            let (child, _) = parent.with_timeout(Duration::from_secs(10));
            assert_eq!(child.deadline(), Some(Duration::from_secs(1)));

            assert_eq!(child.done().await, EnvError::DeadlineExceeded);
            assert_eq!(sim.now(), Duration::from_secs(1));
        })
        .unwrap();
    }

    #[test]
    fn test_uncancelled_done_is_a_deadlock() {
        let err = run(|sim| async move {
            let (ctx, _cancel) = CancelContext::background(&sim).with_cancel();
            ctx.done().await;
        })
        .unwrap_err();
        match err {
            HarnessError::Deadlock { blocked } => {
                assert_eq!(blocked[0].reason, Some(BlockReason::Cancellation));
            }
            other => panic!("expected deadlock, got {other:?}"),
        }
    }
}
