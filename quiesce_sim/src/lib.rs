//! quiesce Deterministic Concurrency Test Harness
//!
//! This crate runs concurrent test bodies on a controlled, single-threaded
//! executor so that their interleavings are reproducible and their
//! structural failures (leaks, deadlocks) are caught instead of hanging.
//!
//! # Core Principle: Quiescence
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advances only when every task is blocked
//! - **Scheduling**: One task runs at a time, switching only at await points
//! - **Randomness**: All entropy derived from a single 64-bit seed
//!
//! `Sim::wait()` is the rendezvous point: it returns once every other task
//! is durably blocked, so a test can assert on effects without sleeping or
//! polling.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Harness                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ runtime::Shared (one run)                            │   │
//! │  │  VirtualClock · TaskTracker · QuiescenceDetector     │   │
//! │  │  Scheduler (Fifo | Random | Replay)                  │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       ▲                        ▲                            │
//! │  ┌────┴────┐              ┌────┴────┐                       │
//! │  │  root   │◄────────────►│  task   │     ...               │
//! │  │  task   │  sync::*     │   #1    │                       │
//! │  └─────────┘  channels    └─────────┘                       │
//! │               locks, ctx                                    │
//! └─────────────────────────────────────────────────────────────┘
//!          ▲
//!     Explorer: re-runs the body under every schedule prefix
//! ```
//!
//! # Usage
//!
//! ```
//! use quiesce_sim::run;
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! run(|sim| async move {
//!     let flag = Rc::new(Cell::new(false));
//!     let f = flag.clone();
//!     sim.spawn(async move { f.set(true) });
//!
//!     sim.wait().await;
//!     assert!(flag.get());
//! })
//! .unwrap();
//! ```

mod clock;
mod context;
mod error;
mod explore;
mod exporter;
mod harness;
mod quiescence;
mod runner;
mod runtime;
mod scheduler;
mod tracker;
pub mod scenarios;
pub mod sync;

pub use clock::{TimerKey, VirtualClock};
pub use error::{BlockedTask, HarnessError};
pub use explore::{explore, ExplorationResult, ExplorationSummary, ExploreConfig, Explorer};
pub use exporter::{ExportSummary, ReportExport};
pub use harness::{run, Harness, HarnessConfig, RunReport};
pub use quiescence::{QuiescenceDetector, Wait};
pub use runner::{RunMode, ScenarioResult, ScenarioRunner};
pub use runtime::{JoinHandle, RunEvent, Sim, Sleep, Timeout, YieldNow};
pub use scheduler::{Decision, Schedule, SchedulePolicy, Scheduler};
pub use tracker::TaskTracker;

pub use quiesce_env::{BlockReason, EnvError, QuiesceContext, RunId, TaskId, TaskState};
