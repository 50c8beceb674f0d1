//! quiesce Environment Abstraction Layer
//!
//! This crate provides the abstraction allowing concurrent code to run in
//! both **Production** (tokio) and under the **deterministic harness**
//! (`quiesce_sim`).
//!
//! # Core Concept
//!
//! For deterministic concurrency testing, we intercept every source of
//! scheduling non-determinism:
//! - Time (`now()`, `sleep()`)
//! - Task creation (`spawn()`)
//! - Voluntary preemption (`yield_now()`)
//!
//! Code written against [`QuiesceContext`] can be exercised by the harness,
//! which decides which task runs next and when virtual time moves.
//!
//! # Example
//!
//! ```ignore
//! use quiesce_env::QuiesceContext;
//!
//! async fn heartbeat<Ctx: QuiesceContext>(ctx: &Ctx, beats: &Cell<u32>) {
//!     loop {
//!         ctx.sleep(Duration::from_secs(1)).await;
//!         beats.set(beats.get() + 1);
//!     }
//! }
//! ```

mod context;
mod types;
mod error;
mod tokio_impl;

pub use context::QuiesceContext;
pub use types::{BlockReason, RunId, TaskId, TaskState};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
