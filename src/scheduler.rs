// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Staged task scheduler
//!
//! A pipeline of stages runs on a dedicated driver thread. A stage is either
//! one task or a cluster of tasks fanned out on a rayon work-stealing pool and
//! joined before the next stage starts. A timer thread re-runs the pipeline
//! at a fixed rate when asked to.

use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, warn};

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::config::SchedulerConfig;
use crate::error::{InfernoError, Result};
use crate::time::{FixedRate, FrameClock};

static NEXT_SCHEDULER: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the scheduler whose driver or worker runs on this thread, 0 otherwise
    static OWNER: Cell<usize> = const { Cell::new(0) };
}

/// A unit of pipeline work
pub type Task = Box<dyn Fn(&TaskContext) + Send + Sync>;

/// Box a closure as a [`Task`]
pub fn task<F>(f: F) -> Task
where
    F: Fn(&TaskContext) + Send + Sync + 'static,
{
    Box::new(f)
}

/// Identity of a task added to a scheduler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct TaskEntry {
    id: TaskId,
    enabled: AtomicBool,
    run: Task,
}

impl TaskEntry {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Panics stop at this boundary
    fn run(&self, context: &TaskContext) -> bool {
        match catch_unwind(AssertUnwindSafe(|| (self.run)(context))) {
            Ok(()) => true,
            Err(payload) => {
                error!(task = self.id.0, reason = panic_message(&*payload), "task panicked");
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[derive(Clone)]
enum Stage {
    Single(Arc<TaskEntry>),
    Cluster(Vec<Arc<TaskEntry>>),
}

/// Handed to every running task
///
/// Only exists on driver and worker threads, so its fork/join helpers need no
/// caller check.
pub struct TaskContext {
    pool: Arc<ThreadPool>,
    delta: f64,
    scheduler: usize,
}

impl TaskContext {
    /// Seconds between the start of this pass and the previous one
    pub fn delta_seconds(&self) -> f64 {
        self.delta
    }

    pub fn scheduler_id(&self) -> usize {
        self.scheduler
    }

    /// Run `f` on the work-stealing pool and wait for it
    pub fn fork_join<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }

    /// Run every task on the work-stealing pool and collect results in order
    pub fn fork_join_all<R, F>(&self, tasks: Vec<F>) -> Vec<R>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool
            .install(|| tasks.into_par_iter().map(|task| task()).collect())
    }
}

/// Lifecycle of a scheduler's pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// No stages
    Idle,
    /// Has stages, no pass in flight
    Scheduled,
    /// A pass is in flight
    Running,
}

enum DriverCommand {
    Pass(Sender<bool>),
    Shutdown,
}

enum TimerCommand {
    Rate(Option<FixedRate>, Sender<()>),
    Shutdown,
}

struct Shared {
    id: usize,
    timeout: Duration,
    pipeline: RwLock<Vec<Stage>>,
    tasks: RwLock<AHashMap<TaskId, Arc<TaskEntry>>>,
    next_task: AtomicU64,
    pool: RwLock<Option<Arc<ThreadPool>>>,
    clock: Mutex<FrameClock>,
    pass_lock: Mutex<()>,
    running: AtomicBool,
    closed: AtomicBool,
    workers_alive: Arc<AtomicUsize>,
}

impl Shared {
    fn execute_pass(&self) -> bool {
        let Some(pool) = self.pool.read().clone() else {
            return false;
        };
        #[cfg(feature = "profiling")]
        let _span = info_span!("scheduler.pass", scheduler = self.id).entered();

        self.running.store(true, Ordering::Release);
        let delta = self.clock.lock().begin_pass();
        let stages = self.pipeline.read().clone();
        let context = TaskContext {
            pool: Arc::clone(&pool),
            delta,
            scheduler: self.id,
        };

        let mut ok = true;
        for stage in &stages {
            ok &= match stage {
                Stage::Single(task) => !task.is_enabled() || task.run(&context),
                Stage::Cluster(tasks) => pool.install(|| {
                    tasks
                        .par_iter()
                        .filter(|task| task.is_enabled())
                        .map(|task| task.run(&context))
                        .reduce(|| true, |a, b| a && b)
                }),
            };
        }

        self.clock.lock().end_pass();
        self.running.store(false, Ordering::Release);
        ok
    }
}

/// Send one pass to the driver and wait for it, bounded by the timeout
fn dispatch_pass(shared: &Shared, driver: &Sender<DriverCommand>) -> Result<bool> {
    if shared.closed.load(Ordering::Acquire) {
        return Err(InfernoError::SchedulerShutdown);
    }
    let Some(_pass) = shared.pass_lock.try_lock_for(shared.timeout) else {
        return Err(InfernoError::Timeout("the previous pass".into()));
    };
    let (reply, result) = channel::bounded(1);
    driver
        .send(DriverCommand::Pass(reply))
        .map_err(|_| InfernoError::SchedulerShutdown)?;
    match result.recv_timeout(shared.timeout) {
        Ok(ok) => Ok(ok),
        Err(RecvTimeoutError::Timeout) => Err(InfernoError::Timeout("a pipeline pass".into())),
        Err(RecvTimeoutError::Disconnected) => Err(InfernoError::SchedulerShutdown),
    }
}

/// Run a pass, logging failures
fn run_pass(shared: &Shared, driver: &Sender<DriverCommand>) -> bool {
    match dispatch_pass(shared, driver) {
        Ok(ok) => ok,
        Err(InfernoError::SchedulerShutdown) => false,
        Err(err) => {
            error!(scheduler = shared.id, timeout = ?shared.timeout, "{err}");
            false
        }
    }
}

fn drive(shared: Arc<Shared>, commands: Receiver<DriverCommand>) {
    OWNER.with(|owner| owner.set(shared.id));
    for command in commands {
        match command {
            DriverCommand::Pass(reply) => {
                let ok = shared.execute_pass();
                let _ = reply.send(ok);
            }
            DriverCommand::Shutdown => break,
        }
    }
    debug!(scheduler = shared.id, "driver stopped");
}

fn tick(shared: Arc<Shared>, driver: Sender<DriverCommand>, commands: Receiver<TimerCommand>) {
    let mut rate: Option<FixedRate> = None;
    let mut next_tick = Instant::now();
    loop {
        let command = match rate {
            Some(_) => commands.recv_deadline(next_tick),
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match command {
            Ok(TimerCommand::Rate(new_rate, ack)) => {
                rate = new_rate;
                next_tick = Instant::now();
                let _ = ack.send(());
            }
            Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let Some(rate) = rate else {
                    continue;
                };
                run_pass(&shared, &driver);
                // Missed ticks are skipped, not replayed
                next_tick = (next_tick + rate.period()).max(Instant::now());
            }
        }
    }
    debug!(scheduler = shared.id, "timer stopped");
}

/// Ordered pipeline of stages with single-run and fixed-rate execution
pub struct Scheduler {
    shared: Arc<Shared>,
    driver: Sender<DriverCommand>,
    timer: Sender<TimerCommand>,
    threads: Mutex<Threads>,
    rate: Mutex<Option<FixedRate>>,
}

struct Threads {
    driver: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

/// Join `handle` if it finishes before `deadline`
fn join_before(handle: Option<JoinHandle<()>>, deadline: Instant) -> bool {
    let Some(handle) = handle else {
        return true;
    };
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    if !handle.is_finished() {
        warn!(thread = ?handle.thread().name(), "thread did not stop in time");
        return false;
    }
    handle.join().is_ok()
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let id = NEXT_SCHEDULER.fetch_add(1, Ordering::Relaxed);
        let workers = config.resolved_workers();
        let workers_alive = Arc::new(AtomicUsize::new(workers));
        let exited = Arc::clone(&workers_alive);

        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |index| format!("inferno-worker-{id}-{index}"))
            .start_handler(move |_| OWNER.with(|owner| owner.set(id)))
            .exit_handler(move |_| {
                exited.fetch_sub(1, Ordering::AcqRel);
            })
            .build()
            .map_err(|err| InfernoError::ThreadSpawn(err.to_string()))?;

        let shared = Arc::new(Shared {
            id,
            timeout: config.timeout,
            pipeline: RwLock::new(Vec::new()),
            tasks: RwLock::new(AHashMap::new()),
            next_task: AtomicU64::new(1),
            pool: RwLock::new(Some(Arc::new(pool))),
            clock: Mutex::new(FrameClock::new()),
            pass_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            workers_alive,
        });

        let (driver, driver_commands) = channel::unbounded();
        let (timer, timer_commands) = channel::unbounded();

        let driver_handle = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("inferno-driver-{id}"))
                .spawn(move || drive(shared, driver_commands))?
        };
        let timer_handle = {
            let shared = Arc::clone(&shared);
            let driver = driver.clone();
            thread::Builder::new()
                .name(format!("inferno-timer-{id}"))
                .spawn(move || tick(shared, driver, timer_commands))?
        };
        debug!(scheduler = id, workers, "scheduler started");

        Ok(Self {
            shared,
            driver,
            timer,
            threads: Mutex::new(Threads {
                driver: Some(driver_handle),
                timer: Some(timer_handle),
            }),
            rate: Mutex::new(None),
        })
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    fn register(&self, run: Task) -> Arc<TaskEntry> {
        let id = TaskId(self.shared.next_task.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(TaskEntry {
            id,
            enabled: AtomicBool::new(true),
            run,
        });
        self.shared.tasks.write().insert(id, Arc::clone(&entry));
        entry
    }

    /// Append a sequential stage
    pub fn add_stage<F>(&self, f: F) -> TaskId
    where
        F: Fn(&TaskContext) + Send + Sync + 'static,
    {
        let entry = self.register(Box::new(f));
        let id = entry.id;
        self.shared.pipeline.write().push(Stage::Single(entry));
        debug!(scheduler = self.shared.id, task = id.0, "stage added");
        id
    }

    /// Append a stage whose tasks run concurrently and are joined before the next stage
    pub fn add_parallel_stage<I>(&self, tasks: I) -> Vec<TaskId>
    where
        I: IntoIterator<Item = Task>,
    {
        let entries: Vec<_> = tasks.into_iter().map(|run| self.register(run)).collect();
        if entries.is_empty() {
            return Vec::new();
        }
        let ids: Vec<TaskId> = entries.iter().map(|entry| entry.id).collect();
        debug!(scheduler = self.shared.id, tasks = ids.len(), "parallel stage added");
        self.shared.pipeline.write().push(Stage::Cluster(entries));
        ids
    }

    fn set_task_enabled(&self, id: TaskId, enabled: bool) -> bool {
        match self.shared.tasks.read().get(&id) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Skip a task on later passes without removing it. False if unknown.
    pub fn disable(&self, id: TaskId) -> bool {
        self.set_task_enabled(id, false)
    }

    pub fn enable(&self, id: TaskId) -> bool {
        self.set_task_enabled(id, true)
    }

    pub fn is_enabled(&self, id: TaskId) -> Option<bool> {
        self.shared.tasks.read().get(&id).map(|entry| entry.is_enabled())
    }

    pub fn stage_count(&self) -> usize {
        self.shared.pipeline.read().len()
    }

    /// Run the pipeline once on the driver thread and wait for it.
    ///
    /// False on timeout, task panic, or after shutdown. A timed-out pass is
    /// not cancelled: it stays queued on the driver and still runs.
    pub fn run_once(&self) -> bool {
        run_pass(&self.shared, &self.driver)
    }

    fn send_rate(&self, rate: Option<FixedRate>) -> bool {
        let (ack, acked) = channel::bounded(1);
        if self.timer.send(TimerCommand::Rate(rate, ack)).is_err() {
            return false;
        }
        match acked.recv_timeout(self.shared.timeout) {
            Ok(()) => true,
            Err(_) => {
                error!(scheduler = self.shared.id, timeout = ?self.shared.timeout, "timed out changing the fixed-rate schedule");
                false
            }
        }
    }

    /// Run the pipeline `ups` times per second. 0 stops ticking.
    ///
    /// A running schedule is cancelled first; the in-flight tick is waited for.
    pub fn run_at_rate(&self, ups: u32) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        let requested = FixedRate::new(ups);
        let mut rate = self.rate.lock();
        if *rate == requested {
            return true;
        }
        if rate.take().is_some() && !self.send_rate(None) {
            return false;
        }
        if requested.is_some() {
            if !self.send_rate(requested) {
                return false;
            }
            *rate = requested;
        }
        debug!(scheduler = self.shared.id, ups, "rate changed");
        true
    }

    pub fn is_ticking(&self) -> bool {
        self.rate.lock().is_some()
    }

    pub fn state(&self) -> SchedulerState {
        if self.shared.running.load(Ordering::Acquire) {
            SchedulerState::Running
        } else if self.stage_count() > 0 {
            SchedulerState::Scheduled
        } else {
            SchedulerState::Idle
        }
    }

    /// Delta of the most recent pass, in seconds
    pub fn delta_seconds(&self) -> f64 {
        self.shared.clock.lock().delta_seconds()
    }

    pub fn last_pass_duration(&self) -> Duration {
        self.shared.clock.lock().last_pass_duration()
    }

    /// Completed passes
    pub fn frame_count(&self) -> u64 {
        self.shared.clock.lock().frame_count()
    }

    /// True on this scheduler's driver and worker threads
    pub fn is_scheduler_thread(&self) -> bool {
        OWNER.with(|owner| owner.get()) == self.shared.id
    }

    fn pool(&self) -> Result<Arc<ThreadPool>> {
        if !self.is_scheduler_thread() {
            return Err(InfernoError::IllegalCaller);
        }
        self.shared
            .pool
            .read()
            .clone()
            .ok_or(InfernoError::SchedulerShutdown)
    }

    /// Fork `f` onto the pool from a driver or worker thread
    pub fn fork_join<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        Ok(self.pool()?.install(f))
    }

    pub fn fork_join_all<R, F>(&self, tasks: Vec<F>) -> Result<Vec<R>>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        Ok(self
            .pool()?
            .install(|| tasks.into_par_iter().map(|task| task()).collect()))
    }

    /// Stop the timer, the driver and the pool, waiting up to the timeout.
    ///
    /// True if every thread terminated in time.
    pub fn shutdown(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return true;
        }
        let deadline = Instant::now() + self.shared.timeout;
        *self.rate.lock() = None;

        // The timer goes first so it cannot queue a pass behind the driver's exit
        let mut threads = self.threads.lock();
        let _ = self.timer.send(TimerCommand::Shutdown);
        let mut ok = join_before(threads.timer.take(), deadline);
        let _ = self.driver.send(DriverCommand::Shutdown);
        ok &= join_before(threads.driver.take(), deadline);
        drop(threads);

        // Workers exit once the last handle to the pool is gone
        drop(self.shared.pool.write().take());
        while self.shared.workers_alive.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        let alive = self.shared.workers_alive.load(Ordering::Acquire);
        if alive > 0 {
            warn!(scheduler = self.shared.id, alive, "workers did not stop in time");
            ok = false;
        }
        debug!(scheduler = self.shared.id, ok, "scheduler shut down");
        ok
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
