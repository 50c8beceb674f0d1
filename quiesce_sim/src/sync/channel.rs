//! Bounded multi-producer, single-consumer channel.

use crate::runtime::Sim;
use quiesce_env::{BlockReason, EnvError};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use thiserror::Error;

struct Chan<T> {
    buf: VecDeque<T>,
    capacity: usize,
    senders: usize,
    receiver_alive: bool,
    recv_waker: Option<Waker>,
    send_wakers: Vec<Waker>,
}

impl<T> Chan<T> {
    fn wake_senders(&mut self) {
        for waker in self.send_wakers.drain(..) {
            waker.wake();
        }
    }

    fn wake_receiver(&mut self) {
        if let Some(waker) = self.recv_waker.take() {
            waker.wake();
        }
    }
}

/// Error returned by [`Sender::try_send`]; hands the value back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrySendError<T> {
    #[error("channel full")]
    Full(T),

    #[error("channel closed")]
    Closed(T),
}

/// Creates a channel holding at most `capacity` buffered values.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel<T>(sim: &Sim, capacity: usize) -> (Sender<T>, Receiver<T>) {
    assert!(capacity > 0, "channel capacity must be at least 1");
    let chan = Rc::new(RefCell::new(Chan {
        buf: VecDeque::with_capacity(capacity),
        capacity,
        senders: 1,
        receiver_alive: true,
        recv_waker: None,
        send_wakers: Vec::new(),
    }));
    (
        Sender {
            sim: sim.clone(),
            chan: Rc::clone(&chan),
        },
        Receiver {
            sim: sim.clone(),
            chan,
        },
    )
}

/// Sending half. Clone it for more producers; the channel closes for the
/// receiver when the last sender is dropped.
pub struct Sender<T> {
    sim: Sim,
    chan: Rc<RefCell<Chan<T>>>,
}

impl<T> Sender<T> {
    /// Sends `value`, waiting while the buffer is full.
    ///
    /// Fails with [`EnvError::ChannelClosed`] if the receiver is gone.
    pub fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture {
            sender: self,
            value: Some(value),
        }
    }

    /// Sends without waiting.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let mut chan = self.chan.borrow_mut();
        if !chan.receiver_alive {
            return Err(TrySendError::Closed(value));
        }
        if chan.buf.len() >= chan.capacity {
            return Err(TrySendError::Full(value));
        }
        chan.buf.push_back(value);
        chan.wake_receiver();
        Ok(())
    }

    /// True once the receiver has been dropped or closed.
    pub fn is_closed(&self) -> bool {
        !self.chan.borrow().receiver_alive
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.chan.borrow_mut().senders += 1;
        Self {
            sim: self.sim.clone(),
            chan: Rc::clone(&self.chan),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut chan = self.chan.borrow_mut();
        chan.senders -= 1;
        if chan.senders == 0 {
            chan.wake_receiver();
        }
    }
}

/// Future returned by [`Sender::send`].
pub struct SendFuture<'a, T> {
    sender: &'a Sender<T>,
    value: Option<T>,
}

impl<T> Unpin for SendFuture<'_, T> {}

impl<T> Future for SendFuture<'_, T> {
    type Output = Result<(), EnvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(value) = this.value.take() else {
            return Poll::Ready(Ok(()));
        };

        let mut chan = this.sender.chan.borrow_mut();
        if !chan.receiver_alive {
            return Poll::Ready(Err(EnvError::ChannelClosed));
        }
        if chan.buf.len() < chan.capacity {
            chan.buf.push_back(value);
            chan.wake_receiver();
            return Poll::Ready(Ok(()));
        }

        this.value = Some(value);
        chan.send_wakers.push(cx.waker().clone());
        drop(chan);
        this.sender.sim.note_block(BlockReason::ChannelSend);
        Poll::Pending
    }
}

/// Receiving half.
pub struct Receiver<T> {
    sim: Sim,
    chan: Rc<RefCell<Chan<T>>>,
}

impl<T> Receiver<T> {
    /// Receives the next value, waiting while the buffer is empty.
    ///
    /// Returns `None` once the buffer is drained and every sender is gone.
    pub fn recv(&mut self) -> Recv<'_, T> {
        Recv { receiver: self }
    }

    /// Receives without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        let mut chan = self.chan.borrow_mut();
        let value = chan.buf.pop_front();
        if value.is_some() {
            chan.wake_senders();
        }
        value
    }

    /// Closes the channel for senders. Buffered values can still be read.
    pub fn close(&mut self) {
        let mut chan = self.chan.borrow_mut();
        chan.receiver_alive = false;
        chan.wake_senders();
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.chan.borrow().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Future returned by [`Receiver::recv`].
pub struct Recv<'a, T> {
    receiver: &'a mut Receiver<T>,
}

impl<T> Future for Recv<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let mut chan = this.receiver.chan.borrow_mut();
        if let Some(value) = chan.buf.pop_front() {
            chan.wake_senders();
            return Poll::Ready(Some(value));
        }
        if chan.senders == 0 {
            return Poll::Ready(None);
        }

        chan.recv_waker = Some(cx.waker().clone());
        drop(chan);
        this.receiver.sim.note_block(BlockReason::ChannelRecv);
        Poll::Pending
    }
}
