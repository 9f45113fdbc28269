//! Periodic task scheduler.
//!
//! # Responsibilities
//! - Hold the task table (name, interval, task function)
//! - Run each task every `interval` from a single coordinator
//! - Skip a tick when the previous run of that task is still in flight
//! - Trigger immediate runs on request (`run_now`, or a [`TaskTrigger`] handle)
//!
//! # Design Decisions
//! - Runs are spawned into a `JoinSet`; the coordinator never awaits a task body
//! - A panicking run is logged and counted as a failure; the task stays scheduled
//! - Missed ticks are not replayed; the next tick is one interval after now
//! - An interval past the clock's range never comes due; `run_now` still works
//! - Shutdown waits for in-flight runs to finish

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal};
use crate::observability::metrics;

pub type TaskError = Box<dyn std::error::Error + Send + Sync>;
type TaskFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;
type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

const COMMAND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("task '{0}' has a zero interval")]
    ZeroInterval(String),

    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("scheduler is not running")]
    NotRunning,

    #[error("unknown task '{0}'")]
    UnknownTask(String),
}

struct ScheduledTask {
    name: String,
    interval: Duration,
    task: TaskFn,
    running: AtomicBool,
    runs: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
}

impl ScheduledTask {
    fn stats(&self) -> TaskStats {
        TaskStats {
            name: self.name.clone(),
            interval_ms: self.interval.as_millis() as u64,
            running: self.running.load(Ordering::SeqCst),
            runs: self.runs.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Clears the running flag even if the task body panics.
struct RunningGuard(Arc<ScheduledTask>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.failures.fetch_add(1, Ordering::Relaxed);
            metrics::record_scheduler_run(&self.0.name, "panicked");
        }
        self.0.running.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskStats {
    pub name: String,
    pub interval_ms: u64,
    pub running: bool,
    pub runs: u64,
    pub skipped: u64,
    pub failures: u64,
}

enum Command {
    RunNow(usize),
}

/// Command queue of the live coordinator. `None` while stopped.
type CommandSlot = Arc<Mutex<Option<mpsc::Sender<Command>>>>;

struct Running {
    shutdown: Shutdown,
    coordinator: JoinHandle<()>,
}

/// Cloneable handle that requests an immediate run of one task.
#[derive(Clone)]
pub struct TaskTrigger {
    index: usize,
    commands: CommandSlot,
}

impl TaskTrigger {
    /// Request a run. Returns `false` if the scheduler is stopped or its queue is full.
    pub fn fire(&self) -> bool {
        match self.commands.lock().as_ref() {
            Some(tx) => tx.try_send(Command::RunNow(self.index)).is_ok(),
            None => false,
        }
    }
}

/// Task table plus its coordinator.
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<Vec<Arc<ScheduledTask>>>,
    commands: CommandSlot,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` to run every `interval`. Must be called before [`start`](Self::start).
    pub fn every<F, Fut>(&self, name: impl Into<String>, interval: Duration, task: F) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let name = name.into();
        if self.running.lock().is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(name));
        }

        let mut tasks = self.tasks.lock();
        if tasks.iter().any(|t| t.name == name) {
            return Err(SchedulerError::DuplicateTask(name));
        }

        tracing::debug!(task = %name, interval = ?interval, "Task registered");
        tasks.push(Arc::new(ScheduledTask {
            name,
            interval,
            task: Arc::new(move || Box::pin(task()) as TaskFuture),
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }));
        Ok(())
    }

    /// Spawn the coordinator. The first run of each task is one interval from now.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let tasks = self.tasks.lock().clone();
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let shutdown = Shutdown::new();

        tracing::info!(tasks = tasks.len(), "Scheduler started");
        let coordinator = tokio::spawn(coordinate(tasks, rx, shutdown.subscribe()));
        *self.commands.lock() = Some(tx);

        *running = Some(Running { shutdown, coordinator });
        Ok(())
    }

    /// Run `name` now, unless a run is already in flight.
    pub fn run_now(&self, name: &str) -> Result<(), SchedulerError> {
        let index = self.index_of(name)?;
        let commands = self.commands.lock();
        let tx = commands.as_ref().ok_or(SchedulerError::NotRunning)?;
        tx.try_send(Command::RunNow(index))
            .map_err(|_| SchedulerError::NotRunning)
    }

    /// Handle for firing `name` from outside the scheduler, e.g. on a size threshold.
    ///
    /// Valid across restarts; fires are ignored while the scheduler is stopped.
    pub fn trigger(&self, name: &str) -> Result<TaskTrigger, SchedulerError> {
        Ok(TaskTrigger {
            index: self.index_of(name)?,
            commands: Arc::clone(&self.commands),
        })
    }

    fn index_of(&self, name: &str) -> Result<usize, SchedulerError> {
        self.tasks
            .lock()
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))
    }

    pub fn stats(&self) -> Vec<TaskStats> {
        self.tasks.lock().iter().map(|t| t.stats()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Stop the coordinator and wait for in-flight runs.
    pub async fn shutdown(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        self.commands.lock().take();
        running.shutdown.trigger();
        if let Err(e) = running.coordinator.await {
            tracing::error!(error = %e, "Scheduler coordinator failed");
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn coordinate(tasks: Vec<Arc<ScheduledTask>>, mut commands: mpsc::Receiver<Command>, mut shutdown: ShutdownSignal) {
    let start = Instant::now();
    let mut due: Vec<Option<Instant>> = tasks.iter().map(|t| start.checked_add(t.interval)).collect();
    let mut runs = JoinSet::new();

    loop {
        let next_due = due.iter().flatten().min().copied();

        tokio::select! {
            _ = shutdown.recv() => break,
            Some(Command::RunNow(index)) = commands.recv() => {
                if let Some(task) = tasks.get(index) {
                    dispatch(task, &mut runs);
                }
            }
            _ = sleep_until_due(next_due) => {
                let now = Instant::now();
                for (task, due_at) in tasks.iter().zip(due.iter_mut()) {
                    if due_at.is_some_and(|at| at <= now) {
                        dispatch(task, &mut runs);
                        *due_at = now.checked_add(task.interval);
                    }
                }
            }
            Some(joined) = runs.join_next(), if !runs.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Scheduled run aborted");
                }
            }
        }
    }

    while let Some(joined) = runs.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Scheduled run aborted");
        }
    }
}

async fn sleep_until_due(next_due: Option<Instant>) {
    match next_due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn dispatch(task: &Arc<ScheduledTask>, runs: &mut JoinSet<()>) {
    if task.running.swap(true, Ordering::SeqCst) {
        task.skipped.fetch_add(1, Ordering::Relaxed);
        metrics::record_scheduler_run(&task.name, "skipped");
        tracing::debug!(task = %task.name, "Previous run still in flight, skipping tick");
        return;
    }

    let task = Arc::clone(task);
    runs.spawn(async move {
        let guard = RunningGuard(Arc::clone(&task));
        let started = Instant::now();
        task.runs.fetch_add(1, Ordering::Relaxed);

        match (task.task)().await {
            Ok(()) => {
                metrics::record_scheduler_run(&task.name, "ok");
                tracing::trace!(task = %task.name, elapsed = ?started.elapsed(), "Scheduled run completed");
            }
            Err(e) => {
                task.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_scheduler_run(&task.name, "error");
                tracing::warn!(task = %task.name, error = %e, "Scheduled run failed");
            }
        }
        drop(guard);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_interval() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler
            .every("tick", Duration::from_millis(100), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        scheduler.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.stats()[0].runs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_tick_while_running() {
        let scheduler = Scheduler::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let (f, m) = (in_flight.clone(), max_in_flight.clone());

        scheduler
            .every("slow", Duration::from_millis(100), move || {
                let (f, m) = (f.clone(), m.clone());
                async move {
                    let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                    m.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    f.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        scheduler.shutdown().await;

        let stats = &scheduler.stats()[0];
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert!(stats.skipped > 0, "stats: {:?}", stats);
        assert!(stats.runs < 10);
        assert!(!stats.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_and_panic_keep_task_scheduled() {
        let scheduler = Scheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        scheduler
            .every("flaky", Duration::from_millis(100), move || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => Err(TaskError::from("store offline")),
                        1 => panic!("boom"),
                        _ => Ok(()),
                    }
                }
            })
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        scheduler.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stats = &scheduler.stats()[0];
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.runs, 3);
        assert!(!stats.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler
            .every("cleanup", Duration::from_secs(3600), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        assert_eq!(scheduler.run_now("cleanup"), Err(SchedulerError::NotRunning));
        scheduler.start().unwrap();
        assert_eq!(
            scheduler.run_now("missing"),
            Err(SchedulerError::UnknownTask("missing".into()))
        );

        scheduler.run_now("cleanup").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_interval_never_comes_due() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler
            .every("yearly", Duration::MAX, move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();
        scheduler
            .every("tick", Duration::from_millis(100), || async { Ok(()) })
            .unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_running());

        scheduler.run_now("yearly").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        let stats = scheduler.stats();
        assert_eq!(stats[1].runs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_handle_fires_only_while_running() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler
            .every("flush", Duration::from_secs(3600), move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        assert!(scheduler.trigger("missing").is_err());
        let trigger = scheduler.trigger("flush").unwrap();
        assert!(!trigger.fire());

        scheduler.start().unwrap();
        assert!(trigger.fire());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        assert!(!trigger.fire());
    }

    #[tokio::test]
    async fn test_registration_rules() {
        let scheduler = Scheduler::new();
        let noop = || async { Ok::<(), TaskError>(()) };
        scheduler.every("a", Duration::from_secs(1), noop).unwrap();
        assert_eq!(
            scheduler.every("a", Duration::from_secs(1), noop),
            Err(SchedulerError::DuplicateTask("a".into()))
        );
        assert_eq!(
            scheduler.every("b", Duration::ZERO, noop),
            Err(SchedulerError::ZeroInterval("b".into()))
        );

        scheduler.start().unwrap();
        assert_eq!(scheduler.start(), Err(SchedulerError::AlreadyStarted));
        assert_eq!(
            scheduler.every("c", Duration::from_secs(1), noop),
            Err(SchedulerError::AlreadyStarted)
        );
        scheduler.shutdown().await;
        assert!(!scheduler.is_running());
    }
}
