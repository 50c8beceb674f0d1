//! Built-in scenarios exercising the harness end to end.
//!
//! Each scenario is an ordinary test body (`async fn(Sim)`) that asserts
//! with `assert!`. Some are expected to fail: the race scenario under
//! exploration, the leak and deadlock scenarios as harness faults.

use crate::runtime::Sim;
use crate::sync::{channel, CancelContext, Mutex, Once, WaitGroup};
use quiesce_env::EnvError;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// Cancellation callback is observed only after cancel + wait
    AfterFunc,

    /// Context deadline expires exactly at its virtual deadline
    WithTimeout,

    /// Request body is withheld until the "100 Continue" reply
    ExpectContinue,

    /// `Once` runs its closure a single time
    OnceDo,

    /// Lock, set, unlock from a spawned task
    MutexLockUnlock,

    /// Three workers increment and signal a WaitGroup
    WaitGroup,

    /// Buffered send followed by receive
    ChannelBuffer,

    /// Two timers observed in deadline order
    TimerOrder,

    // ═══════════════════════════════════════════════════
    // EXPECTED FAILURES - the harness must catch these
    // ═══════════════════════════════════════════════════
    /// Unsynchronized read-modify-write; loses an update on some schedule
    RacyCounter,

    /// Same counter guarded by a mutex
    LockedCounter,

    /// A task outlives the root task
    Leak,

    /// Root joins a task waiting on a lock the root holds
    Deadlock,
}

/// What a scenario is expected to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Passes every run and every explored schedule
    Pass,

    /// Passes the default FIFO schedule; exploration must find a failure
    RaceDetected,

    /// Fails with the harness fault of the given kind
    HarnessFault(&'static str),
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::AfterFunc,
            ScenarioId::WithTimeout,
            ScenarioId::ExpectContinue,
            ScenarioId::OnceDo,
            ScenarioId::MutexLockUnlock,
            ScenarioId::WaitGroup,
            ScenarioId::ChannelBuffer,
            ScenarioId::TimerOrder,
            ScenarioId::RacyCounter,
            ScenarioId::LockedCounter,
            ScenarioId::Leak,
            ScenarioId::Deadlock,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::AfterFunc => "after_func",
            ScenarioId::WithTimeout => "with_timeout",
            ScenarioId::ExpectContinue => "expect_continue",
            ScenarioId::OnceDo => "once_do",
            ScenarioId::MutexLockUnlock => "mutex_lock_unlock",
            ScenarioId::WaitGroup => "wait_group",
            ScenarioId::ChannelBuffer => "channel_buffer",
            ScenarioId::TimerOrder => "timer_order",
            ScenarioId::RacyCounter => "racy_counter",
            ScenarioId::LockedCounter => "locked_counter",
            ScenarioId::Leak => "leak",
            ScenarioId::Deadlock => "deadlock",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::AfterFunc => "after_func callback fires only after cancel, seen at wait()",
            ScenarioId::WithTimeout => "5s context: live at 5s-1ns, DeadlineExceeded at 5s",
            ScenarioId::ExpectContinue => "request body held back until 100 Continue is sent",
            ScenarioId::OnceDo => "four tasks race on Once, closure runs once",
            ScenarioId::MutexLockUnlock => "spawned task locks, sets flag, unlocks",
            ScenarioId::WaitGroup => "three workers increment then done(), counter == 3",
            ScenarioId::ChannelBuffer => "buffered send then receive returns the value",
            ScenarioId::TimerOrder => "timers at 1s and 2s fire in order, state seen between",
            ScenarioId::RacyCounter => "lost update on a shared counter (exploration must fail)",
            ScenarioId::LockedCounter => "mutex-guarded counter (exploration must pass)",
            ScenarioId::Leak => "task blocked on a WaitGroup outlives the root (leak fault)",
            ScenarioId::Deadlock => "root joins a task waiting on root's lock (deadlock fault)",
        }
    }

    /// Returns the expected outcome.
    pub fn expectation(&self) -> Expectation {
        match self {
            ScenarioId::RacyCounter => Expectation::RaceDetected,
            ScenarioId::Leak => Expectation::HarnessFault("leak"),
            ScenarioId::Deadlock => Expectation::HarnessFault("deadlock"),
            _ => Expectation::Pass,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_lowercase().replace('-', "_");
        ScenarioId::all()
            .into_iter()
            .find(|id| id.name() == wanted || id.name().replace('_', "") == wanted)
            .ok_or_else(|| format!("Unknown scenario: {}", s))
    }
}

/// Cancellable context with an `after_func` callback.
pub async fn after_func(sim: Sim) {
    let (ctx, cancel) = CancelContext::background(&sim).with_cancel();
    let fired = Rc::new(Cell::new(false));
    let f = fired.clone();
    ctx.after_func(move || f.set(true));

    sim.wait().await;
    assert!(!fired.get(), "after_func ran before cancel");

    cancel.cancel();
    sim.wait().await;
    assert!(fired.get(), "after_func did not run after cancel");
}

/// Context timeout observed one nanosecond early and exactly on time.
pub async fn with_timeout(sim: Sim) {
    const TIMEOUT: Duration = Duration::from_secs(5);
    let (ctx, _cancel) = CancelContext::background(&sim).with_timeout(TIMEOUT);

    sim.sleep(TIMEOUT - Duration::from_nanos(1)).await;
    sim.wait().await;
    assert_eq!(ctx.err(), None, "context expired before its deadline");

    sim.sleep(Duration::from_nanos(1)).await;
    sim.wait().await;
    assert_eq!(ctx.err(), Some(EnvError::DeadlineExceeded));
}

/// `Expect: 100-continue` handshake between a client task and the root.
///
/// The client sends headers, then holds the body back until the server
/// replies "100 Continue" (or 5s pass). The server checks at quiescence
/// points that nothing arrived early.
pub async fn expect_continue(sim: Sim) {
    const BODY: &str = "request body";

    let (header_tx, mut header_rx) = channel::<String>(&sim, 1);
    let (response_tx, mut response_rx) = channel::<&'static str>(&sim, 1);
    let (body_tx, mut body_rx) = channel::<String>(&sim, 1);

    let s = sim.clone();
    let client = sim.spawn_named("client", async move {
        header_tx
            .send("POST /upload HTTP/1.1\r\nExpect: 100-continue".to_string())
            .await
            .unwrap();
        let interim = s.timeout(Duration::from_secs(5), response_rx.recv()).await;
        if let Ok(Some("100 Continue")) = interim {
            body_tx.send(BODY.to_string()).await.unwrap();
        }
        drop(body_tx);
        response_rx.recv().await
    });

    let headers = header_rx.recv().await.unwrap_or_default();
    assert!(headers.contains("Expect: 100-continue"));

    let received = Rc::new(RefCell::new(String::new()));
    let sink = received.clone();
    let reader = sim.spawn_named("body_reader", async move {
        while let Some(chunk) = body_rx.recv().await {
            sink.borrow_mut().push_str(&chunk);
        }
    });

    sim.wait().await;
    assert!(received.borrow().is_empty(), "body sent before 100 Continue");

    response_tx.send("100 Continue").await.unwrap();
    sim.wait().await;
    assert_eq!(received.borrow().as_str(), BODY);

    response_tx.send("200 OK").await.unwrap();
    assert_eq!(client.await, Some("200 OK"));
    reader.await;
    assert_eq!(sim.now(), Duration::ZERO, "handshake must not wait for the timeout");
}

/// Several tasks call the same `Once`.
pub async fn once_do(sim: Sim) {
    let once = Rc::new(Once::new());
    let calls = Rc::new(Cell::new(0u32));
    for _ in 0..4 {
        let (once, calls, s) = (once.clone(), calls.clone(), sim.clone());
        sim.spawn(async move {
            s.yield_now().await;
            once.call_once(|| calls.set(calls.get() + 1));
        });
    }
    sim.wait().await;
    assert_eq!(calls.get(), 1);
}

/// Spawned task locks, sets a flag and unlocks.
pub async fn mutex_lock_unlock(sim: Sim) {
    let mutex = Rc::new(Mutex::new(&sim, false));
    let m = mutex.clone();
    sim.spawn(async move {
        let mut flag = m.lock().await;
        *flag = true;
    });

    sim.wait().await;
    assert!(!mutex.is_locked(), "lock still held after the task finished");
    let flag = mutex.try_lock().map(|guard| *guard);
    assert_eq!(flag, Some(true));
}

/// Three workers increment a counter and signal completion.
pub async fn wait_group(sim: Sim) {
    let counter = Rc::new(Cell::new(0u32));
    let wg = WaitGroup::new(&sim);
    for _ in 0..3 {
        wg.add(1);
        let (wg, counter, s) = (wg.clone(), counter.clone(), sim.clone());
        sim.spawn(async move {
            s.yield_now().await;
            counter.set(counter.get() + 1);
            wg.done();
        });
    }
    sim.wait().await;
    wg.wait().await;
    assert_eq!(counter.get(), 3);
}

/// Buffered send then receive.
pub async fn channel_buffer(sim: Sim) {
    let (tx, mut rx) = channel(&sim, 1);
    tx.send(42u32).await.unwrap();
    assert_eq!(rx.recv().await, Some(42));
}

/// Timers at T1 < T2 fire in order; state between them shows only T1.
pub async fn timer_order(sim: Sim) {
    let log = Rc::new(RefCell::new(Vec::new()));
    for (label, secs) in [("t2", 2), ("t1", 1)] {
        let (s, log) = (sim.clone(), log.clone());
        sim.spawn_named(label, async move {
            s.sleep(Duration::from_secs(secs)).await;
            log.borrow_mut().push(label);
        });
    }

    sim.sleep(Duration::from_millis(1500)).await;
    sim.wait().await;
    assert_eq!(*log.borrow(), vec!["t1"]);

    sim.sleep(Duration::from_secs(1)).await;
    sim.wait().await;
    assert_eq!(*log.borrow(), vec!["t1", "t2"]);
}

/// One writer increments in a single step, the other reads, yields and
/// writes back. FIFO runs the atomic writer first and passes; running the
/// yielding writer first loses an update.
pub async fn racy_counter(sim: Sim) {
    let counter = Rc::new(Cell::new(0u32));

    let c = counter.clone();
    sim.spawn_named("incrementer", async move {
        c.set(c.get() + 1);
    });

    let (c, s) = (counter.clone(), sim.clone());
    sim.spawn_named("read_modify_write", async move {
        let seen = c.get();
        s.yield_now().await;
        c.set(seen + 1);
    });

    sim.wait().await;
    let value = counter.get();
    assert_eq!(value, 2, "expected 2, got {}", value);
}

/// [`racy_counter`] with the read-modify-write done under a mutex.
pub async fn locked_counter(sim: Sim) {
    let counter = Rc::new(Mutex::new(&sim, 0u32));

    let c = counter.clone();
    sim.spawn_named("incrementer", async move {
        *c.lock().await += 1;
    });

    let (c, s) = (counter.clone(), sim.clone());
    sim.spawn_named("read_modify_write", async move {
        let mut guard = c.lock().await;
        let seen = *guard;
        s.yield_now().await;
        *guard = seen + 1;
    });

    sim.wait().await;
    let value = *counter.lock().await;
    assert_eq!(value, 2, "expected 2, got {}", value);
}

/// A worker waits on a WaitGroup nobody marks done.
pub async fn leak(sim: Sim) {
    let wg = WaitGroup::new(&sim);
    wg.add(1);
    let w = wg.clone();
    sim.spawn_named("stuck_worker", async move {
        w.wait().await;
    });
    sim.wait().await;
}

/// Root holds a lock and joins a task that needs it.
pub async fn deadlock(sim: Sim) {
    let mutex = Rc::new(Mutex::new(&sim, ()));
    let _held = mutex.lock().await;
    let m = mutex.clone();
    sim.spawn_named("locker", async move {
        let _guard = m.lock().await;
    })
    .await;
}
