//! Harness-aware synchronization primitives.
//!
//! Every blocking transition of these primitives is reported to the run's
//! scheduler, so a task parked on one of them counts as durably blocked for
//! `wait()`, leak and deadlock detection. They are single-run, `!Send`
//! types built on `Rc`/`RefCell`; a run never crosses threads.

mod cancel;
mod channel;
mod mutex;
mod once;
mod wait_group;

pub use cancel::{AfterFunc, CancelContext, CancelHandle, Done};
pub use channel::{channel, Receiver, Recv, SendFuture, Sender, TrySendError};
pub use mutex::{Lock, Mutex, MutexGuard};
pub use once::Once;
pub use wait_group::{WaitGroup, WaitGroupWait};
