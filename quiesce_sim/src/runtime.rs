//! Cooperative single-threaded executor behind every harness run.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Shared (one run)                   │
//! │  VirtualClock ── timers ──┐                               │
//! │  TaskTracker  ◄── poll ───┼── Scheduler (run queue)       │
//! │  QuiescenceDetector ◄─────┘        ▲                      │
//! │                                    │ absorb_wakes         │
//! │                            WakeQueue (Arc<Mutex<..>>)     │
//! └───────────────────────────────────────────────────────────┘
//!              ▲ Sim handles (Rc) held by task futures
//! ```
//!
//! One task is polled at a time. A task that returns `Pending` without
//! waking itself is Blocked with the reason its last harness primitive
//! recorded. When the run queue drains the loop releases `wait()` callers,
//! otherwise advances the clock to the next timer, otherwise reports a
//! deadlock.

use crate::clock::{TimerAction, TimerKey, VirtualClock};
use crate::error::HarnessError;
use crate::quiescence::{QuiescenceDetector, Wait};
use crate::scheduler::{SchedulePolicy, Scheduler};
use crate::tracker::TaskTracker;
use quiesce_env::{BlockReason, EnvError, RunId, TaskId, TaskState};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, trace};

type BoxFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Ids of tasks woken since the scheduler last looked.
///
/// This is the only piece of run state behind a real lock, because
/// `Waker` must be `Send + Sync`.
#[derive(Default)]
struct WakeQueue {
    woken: Mutex<Vec<TaskId>>,
}

impl WakeQueue {
    fn push(&self, id: TaskId) {
        self.woken
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
    }

    fn drain(&self) -> Vec<TaskId> {
        std::mem::take(&mut *self.woken.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

struct TaskWaker {
    id: TaskId,
    queue: Arc<WakeQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.queue.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.push(self.id);
    }
}

struct TaskSlot {
    name: String,
    future: BoxFuture,
    waker: Waker,
}

/// Observable harness transitions, recorded when the event log is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Spawned { task: TaskId, name: String },
    Polled { task: TaskId },
    Blocked { task: TaskId, reason: BlockReason },
    Completed { task: TaskId },
    WaitReleased { task: TaskId },
    ClockAdvanced { now: Duration },
}

/// Bounds on a single run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunLimits {
    pub max_steps: u64,
    pub wall_clock_timeout: Option<Duration>,
}

/// State of one harness run. Owned by the run, reached through [`Sim`].
pub(crate) struct Shared {
    run_id: RunId,
    seed: u64,
    pub(crate) clock: RefCell<VirtualClock>,
    pub(crate) tracker: RefCell<TaskTracker>,
    pub(crate) scheduler: RefCell<Scheduler>,
    pub(crate) quiescence: RefCell<QuiescenceDetector>,
    tasks: RefCell<HashMap<TaskId, TaskSlot>>,
    wakes: Arc<WakeQueue>,
    current: Cell<Option<TaskId>>,
    rewoken: Cell<bool>,
    pending_reason: Cell<Option<BlockReason>>,
    next_id: Cell<u64>,
    steps: Cell<u64>,
    closed: Cell<bool>,
    rng: RefCell<ChaCha8Rng>,
    events: RefCell<Option<Vec<RunEvent>>>,
}

impl Shared {
    fn record(&self, event: impl FnOnce() -> RunEvent) {
        if let Some(events) = self.events.borrow_mut().as_mut() {
            events.push(event());
        }
    }

    fn insert_task(&self, name: &str, future: BoxFuture) -> Option<TaskId> {
        if self.closed.get() {
            debug!(name, "spawn after run teardown ignored");
            return None;
        }
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            queue: Arc::clone(&self.wakes),
        }));
        self.tracker.borrow_mut().register(id, name);
        self.tasks.borrow_mut().insert(
            id,
            TaskSlot {
                name: name.to_string(),
                future,
                waker,
            },
        );
        self.scheduler.borrow_mut().enqueue(id);
        self.record(|| RunEvent::Spawned {
            task: id,
            name: name.to_string(),
        });
        trace!(task = %id, name, "spawned");
        Some(id)
    }

    /// Moves woken tasks from the wake queue into the run queue.
    fn absorb_wakes(&self) {
        for id in self.wakes.drain() {
            if self.current.get() == Some(id) {
                self.rewoken.set(true);
                continue;
            }
            if self.tracker.borrow_mut().mark_runnable(id) {
                self.scheduler.borrow_mut().enqueue(id);
                trace!(task = %id, "woken");
            }
        }
    }

    /// True iff every live task other than the one being polled is blocked.
    pub(crate) fn is_quiescent_for_caller(&self) -> bool {
        self.absorb_wakes();
        self.scheduler.borrow().is_idle()
            && self.tracker.borrow().all_blocked_except(self.current.get())
    }

    fn poll_task(&self, id: TaskId) -> Result<(), HarnessError> {
        let slot = self.tasks.borrow_mut().remove(&id);
        let Some(mut slot) = slot else {
            return Ok(());
        };

        self.steps.set(self.steps.get() + 1);
        self.current.set(Some(id));
        self.rewoken.set(false);
        self.pending_reason.set(None);
        self.record(|| RunEvent::Polled { task: id });
        trace!(task = %id, name = %slot.name, "poll");

        let waker = slot.waker.clone();
        let mut cx = Context::from_waker(&waker);
        let result = panic::catch_unwind(AssertUnwindSafe(|| slot.future.as_mut().poll(&mut cx)));

        self.absorb_wakes();
        self.current.set(None);

        match result {
            Err(payload) => {
                let name = slot.name.clone();
                drop(slot);
                Err(HarnessError::TaskPanicked {
                    task: id,
                    name,
                    message: panic_message(payload.as_ref()),
                })
            }
            Ok(Poll::Ready(())) => {
                self.tracker.borrow_mut().mark_done(id);
                self.record(|| RunEvent::Completed { task: id });
                trace!(task = %id, "completed");
                drop(slot);
                Ok(())
            }
            Ok(Poll::Pending) => {
                self.tasks.borrow_mut().insert(id, slot);
                if self.rewoken.get() {
                    self.scheduler.borrow_mut().enqueue(id);
                } else {
                    let reason = self.pending_reason.take().unwrap_or(BlockReason::Unknown);
                    self.tracker.borrow_mut().mark_blocked(id, reason);
                    self.record(|| RunEvent::Blocked { task: id, reason });
                }
                Ok(())
            }
        }
    }

    fn release_waiters(&self) -> bool {
        let released = self.quiescence.borrow_mut().release_all();
        if released.is_empty() {
            return false;
        }
        for (task, waker) in released {
            debug!(task = %task, now = ?self.clock.borrow().now(), "wait released at quiescence");
            self.record(|| RunEvent::WaitReleased { task });
            waker.wake();
        }
        true
    }

    fn fire_timers(&self) -> Result<bool, HarnessError> {
        let next = self.clock.borrow().next_deadline();
        let Some(deadline) = next else {
            return Ok(false);
        };

        let due = {
            let mut clock = self.clock.borrow_mut();
            clock.advance_to(deadline)?;
            clock.take_due()
        };
        debug!(now = ?deadline, timers = due.len(), "virtual clock advanced");
        self.record(|| RunEvent::ClockAdvanced { now: deadline });

        for timer in due {
            trace!(owner = %timer.owner, "timer fired");
            match timer.action {
                TimerAction::Wake(waker) => waker.wake(),
                TimerAction::Call(callback) => callback(),
            }
        }
        Ok(true)
    }

    fn check_limits(&self, limits: &RunLimits, started: Instant) -> Result<(), HarnessError> {
        let steps = self.steps.get();
        if steps >= limits.max_steps {
            return Err(HarnessError::StepLimitExceeded { steps });
        }
        if let Some(limit) = limits.wall_clock_timeout {
            let elapsed = started.elapsed();
            if elapsed > limit {
                return Err(HarnessError::WallClockTimeout { elapsed });
            }
        }
        Ok(())
    }

    /// Drives the run until the root task finishes, then checks for leaks.
    pub(crate) fn drive(&self, limits: &RunLimits) -> Result<(), HarnessError> {
        let started = Instant::now();

        loop {
            self.check_limits(limits, started)?;
            self.absorb_wakes();
            if self.tracker.borrow().state(TaskId::ROOT) == TaskState::Done {
                break;
            }

            let next = self.scheduler.borrow_mut().next();
            if let Some(id) = next {
                self.poll_task(id)?;
                continue;
            }
            if self.release_waiters() {
                continue;
            }
            if self.fire_timers()? {
                continue;
            }

            let blocked = self.tracker.borrow().snapshot(None);
            debug!(tasks = blocked.len(), "deadlock detected");
            return Err(HarnessError::Deadlock { blocked });
        }

        // Root is done: let already-runnable tasks settle without moving time.
        loop {
            self.check_limits(limits, started)?;
            self.absorb_wakes();
            let next = self.scheduler.borrow_mut().next();
            if let Some(id) = next {
                self.poll_task(id)?;
                continue;
            }
            if !self.release_waiters() {
                break;
            }
        }

        let leaked = self.tracker.borrow().snapshot(None);
        if !leaked.is_empty() {
            debug!(tasks = leaked.len(), "tasks outlived the root task");
            return Err(HarnessError::Leak { leaked });
        }
        Ok(())
    }

    /// Drops every remaining future and timer. Must run at the end of every
    /// run: task futures hold `Sim` handles, so the run state would otherwise
    /// keep itself alive.
    pub(crate) fn teardown(&self) {
        self.closed.set(true);
        let tasks = std::mem::take(&mut *self.tasks.borrow_mut());
        let timers = self.clock.borrow_mut().clear();
        self.quiescence.borrow_mut().clear();
        self.scheduler.borrow_mut().clear();
        drop(timers);
        drop(tasks);
        self.tracker.borrow_mut().clear();
        self.wakes.drain();
    }

    pub(crate) fn steps(&self) -> u64 {
        self.steps.get()
    }

    pub(crate) fn take_events(&self) -> Vec<RunEvent> {
        self.events.borrow_mut().take().unwrap_or_default()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to a harness run, given to the test body and cloned into tasks.
///
/// All time and scheduling inside a run goes through this handle. It is
/// deliberately `!Send`: one run lives on one thread, and separate runs never
/// share state.
#[derive(Clone)]
pub struct Sim {
    shared: Rc<Shared>,
}

impl Sim {
    pub(crate) fn new(run_id: RunId, seed: u64, policy: &SchedulePolicy, record_events: bool) -> Self {
        let shared = Shared {
            run_id,
            seed,
            clock: RefCell::new(VirtualClock::new()),
            tracker: RefCell::new(TaskTracker::new()),
            scheduler: RefCell::new(Scheduler::new(policy)),
            quiescence: RefCell::new(QuiescenceDetector::new()),
            tasks: RefCell::new(HashMap::new()),
            wakes: Arc::new(WakeQueue::default()),
            current: Cell::new(None),
            rewoken: Cell::new(false),
            pending_reason: Cell::new(None),
            next_id: Cell::new(0),
            steps: Cell::new(0),
            closed: Cell::new(false),
            rng: RefCell::new(ChaCha8Rng::seed_from_u64(seed.wrapping_mul(0x9e3779b97f4a7c15))),
            events: RefCell::new(record_events.then(Vec::new)),
        };
        Self {
            shared: Rc::new(shared),
        }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Spawns a task and returns a handle to its output.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.spawn_named("task", future)
    }

    /// Spawns a task with a name that shows up in leak and deadlock reports.
    pub fn spawn_named<F>(&self, name: &str, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let state = Rc::new(RefCell::new(JoinState {
            output: None,
            finished: false,
            waiter: None,
        }));
        let task_state = Rc::clone(&state);
        let task = async move {
            let output = future.await;
            let waiter = {
                let mut s = task_state.borrow_mut();
                s.output = Some(output);
                s.finished = true;
                s.waiter.take()
            };
            if let Some(waiter) = waiter {
                waiter.wake();
            }
        };
        let id = self.shared.insert_task(name, Box::pin(task));
        JoinHandle {
            sim: self.clone(),
            id,
            state,
        }
    }

    /// Sleeps for `duration` of virtual time.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        self.sleep_until(self.now().saturating_add(duration))
    }

    /// Sleeps until the virtual clock reaches `deadline`.
    pub fn sleep_until(&self, deadline: Duration) -> Sleep {
        Sleep {
            sim: self.clone(),
            deadline,
            key: None,
        }
    }

    /// Runs `future`, failing with [`EnvError::Timeout`] if it is still
    /// pending after `duration` of virtual time.
    pub fn timeout<F: Future>(&self, duration: Duration, future: F) -> Timeout<F> {
        Timeout {
            future: Box::pin(future),
            sleep: self.sleep(duration),
            after: duration,
        }
    }

    /// Yields to other runnable tasks.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow { yielded: false }
    }

    /// Blocks until every other task in the run is durably blocked.
    pub fn wait(&self) -> Wait {
        Wait::new(self.clone())
    }

    /// Current virtual time since run start.
    pub fn now(&self) -> Duration {
        self.shared.clock.borrow().now()
    }

    /// Virtual time mapped onto a fixed epoch.
    pub fn system_time(&self) -> SystemTime {
        self.shared.clock.borrow().system_time()
    }

    /// Seed of this run.
    pub fn seed(&self) -> u64 {
        self.shared.seed
    }

    /// Identifier of this run.
    pub fn run_id(&self) -> RunId {
        self.shared.run_id
    }

    /// Next value from the run's seeded RNG.
    pub fn rng_u64(&self) -> u64 {
        self.shared.rng.borrow_mut().next_u64()
    }

    /// The task currently being polled, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        self.shared.current.get()
    }

    /// Records why the current task is about to return `Pending`.
    pub(crate) fn note_block(&self, reason: BlockReason) {
        self.shared.pending_reason.set(Some(reason));
    }

    pub(crate) fn pending_reason(&self) -> Option<BlockReason> {
        self.shared.pending_reason.get()
    }

    /// Schedules a harness-side callback at a virtual deadline.
    pub(crate) fn call_at(&self, deadline: Duration, callback: Box<dyn FnOnce()>) -> TimerKey {
        let owner = self.current_task().unwrap_or(TaskId::ROOT);
        self.shared
            .clock
            .borrow_mut()
            .register(deadline, owner, TimerAction::Call(callback))
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) -> bool {
        self.shared.clock.borrow_mut().cancel(key)
    }
}

impl std::fmt::Debug for Sim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sim")
            .field("run_id", &self.shared.run_id)
            .field("seed", &self.shared.seed)
            .field("now", &self.now())
            .finish()
    }
}

struct JoinState<T> {
    output: Option<T>,
    finished: bool,
    waiter: Option<Waker>,
}

/// Awaitable handle to a spawned task's output.
///
/// Dropping the handle detaches the task; it still has to finish before
/// the run ends.
pub struct JoinHandle<T> {
    sim: Sim,
    id: Option<TaskId>,
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> JoinHandle<T> {
    /// Id of the spawned task (`None` if spawned after teardown).
    pub fn id(&self) -> Option<TaskId> {
        self.id
    }

    /// True once the task has returned.
    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.borrow_mut();
        if let Some(output) = state.output.take() {
            return Poll::Ready(output);
        }
        assert!(!state.finished, "JoinHandle polled after completion");
        state.waiter = Some(cx.waker().clone());
        drop(state);
        self.sim.note_block(BlockReason::Join);
        Poll::Pending
    }
}

/// Future returned by [`Sim::sleep`] and [`Sim::sleep_until`].
pub struct Sleep {
    sim: Sim,
    deadline: Duration,
    key: Option<TimerKey>,
}

impl Sleep {
    /// Virtual deadline of this sleep.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.sim.now() >= this.deadline {
            if let Some(key) = this.key.take() {
                this.sim.cancel_timer(key);
            }
            return Poll::Ready(());
        }

        let owner = this.sim.current_task().unwrap_or(TaskId::ROOT);
        {
            let mut clock = this.sim.shared.clock.borrow_mut();
            let registered = matches!(this.key, Some(key) if clock.update_waker(key, cx.waker()));
            if !registered {
                this.key = Some(clock.register(
                    this.deadline,
                    owner,
                    TimerAction::Wake(cx.waker().clone()),
                ));
            }
        }
        this.sim.note_block(BlockReason::Sleep {
            deadline: this.deadline,
        });
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.sim.cancel_timer(key);
        }
    }
}

/// Future returned by [`Sim::timeout`].
pub struct Timeout<F: Future> {
    future: Pin<Box<F>>,
    sleep: Sleep,
    after: Duration,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, EnvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Poll::Ready(output) = this.future.as_mut().poll(cx) {
            return Poll::Ready(Ok(output));
        }
        let inner_reason = this.sleep.sim.pending_reason();
        if Pin::new(&mut this.sleep).poll(cx).is_ready() {
            return Poll::Ready(Err(EnvError::timeout(this.after)));
        }
        // Report what the wrapped future is blocked on, not the deadline.
        if let Some(reason) = inner_reason {
            this.sleep.sim.note_block(reason);
        }
        Poll::Pending
    }
}

/// Future returned by [`Sim::yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
