//! Worker threads that call tasklets.
//!
//! Cooperative tasklets are spread round-robin over a fixed pool of
//! worker threads. Each worker calls its tasklets one after the other
//! in a loop and parks for a growing, bounded time when a whole round
//! made no progress. Non-cooperative tasklets get a thread of their
//! own since they may block.
//!
//! All tasklets handed over together form one execution. Its
//! [`CompletionFuture`] completes once every tasklet is done, with
//! the first failure if any tasklet failed. A failure or cancellation
//! makes every other tasklet of the execution leave its worker before
//! its next call.

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::thread::Thread;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::config::InstanceConfig;
use crate::errors::panic_err;
use crate::errors::ExecutionError;

use super::completion::CompletionFuture;
use super::Tasklet;

/// Shared state of the tasklets of one execution.
struct ExecutionTracker {
    name: String,
    remaining: AtomicUsize,
    cancelled: AtomicBool,
    failure: Mutex<Option<ExecutionError>>,
    future: CompletionFuture,
    workers: Vec<Thread>,
}

impl ExecutionTracker {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            tracing::debug!("Cancelling tasklets of {}", self.name);
            self.workers.iter().for_each(Thread::unpark);
        }
    }

    /// Remember the first failure and stop all other tasklets.
    fn fail(&self, err: ExecutionError) {
        {
            let mut failure = self.failure.lock().unwrap_or_else(|err| err.into_inner());
            if failure.is_none() {
                tracing::error!("Tasklet of {} failed: {err}", self.name);
                *failure = Some(err);
            }
        }
        self.cancel();
        self.tasklet_finished();
    }

    fn tasklet_finished(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let failure = self
                .failure
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .take();
            let result = match failure {
                Some(err) => Err(err),
                None if self.is_cancelled() => Err(ExecutionError::Cancelled),
                None => Ok(()),
            };
            tracing::debug!("All tasklets of {} finished: {result:?}", self.name);
            self.future.complete(result);
        }
    }
}

struct TrackedTasklet {
    tasklet: Box<dyn Tasklet>,
    tracker: Arc<ExecutionTracker>,
    initialized: bool,
}

impl TrackedTasklet {
    /// Returns whether the tasklet needs to be called again.
    fn run_once(&mut self, made_progress: &mut bool) -> bool {
        if self.tracker.is_cancelled() {
            self.tracker.tasklet_finished();
            return false;
        }
        let res = catch_unwind(AssertUnwindSafe(|| {
            if !self.initialized {
                self.tasklet.init()?;
                self.initialized = true;
            }
            self.tasklet.call()
        }))
        .unwrap_or_else(|payload| {
            Err(panic_err(
                format!("tasklet {} panicked", self.tasklet.name()),
                payload,
            ))
        });
        match res {
            Ok(state) => {
                *made_progress |= state.made_progress;
                if state.is_done {
                    tracing::trace!("Tasklet {} is done", self.tasklet.name());
                    self.tracker.tasklet_finished();
                }
                !state.is_done
            }
            Err(err) => {
                self.tracker.fail(err);
                false
            }
        }
    }

    /// Leave because the node shuts down.
    fn abort(self) {
        self.tracker.fail(ExecutionError::InstanceNotActive);
    }
}

/// Grows the park time while there is nothing to do.
struct Backoff {
    idle_rounds: u32,
    max: Duration,
}

impl Backoff {
    fn new(max: Duration) -> Self {
        Self { idle_rounds: 0, max }
    }

    fn reset(&mut self) {
        self.idle_rounds = 0;
    }

    fn idle(&mut self) {
        self.idle_rounds = self.idle_rounds.saturating_add(1);
        // Spin a few rounds before parking at all.
        if self.idle_rounds > 3 {
            let micros = 1u64 << (self.idle_rounds - 3).min(16);
            std::thread::park_timeout(Duration::from_micros(micros).min(self.max));
        }
    }
}

struct Worker {
    inject: mpsc::UnboundedSender<TrackedTasklet>,
    thread: Thread,
}

/// Runs the tasklets of all executions on this node.
pub struct TaskletExecutionService {
    workers: Vec<Worker>,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
    next_worker: AtomicUsize,
    is_shutdown: Arc<AtomicBool>,
    max_park: Duration,
}

impl TaskletExecutionService {
    pub fn new(config: &InstanceConfig) -> Result<Self, ExecutionError> {
        config.validate()?;
        let is_shutdown = Arc::new(AtomicBool::new(false));
        let max_park = Duration::from_micros(config.max_park_micros);
        let mut workers = Vec::new();
        let mut join_handles = Vec::new();
        for index in 0..config.cooperative_thread_count {
            let (inject, incoming) = mpsc::unbounded_channel();
            let is_shutdown = is_shutdown.clone();
            let handle = std::thread::Builder::new()
                .name(format!("flowcore-worker-{index}"))
                .spawn(move || worker_loop(incoming, is_shutdown, max_park))
                .map_err(|err| {
                    ExecutionError::Config(format!("unable to start worker thread: {err}"))
                })?;
            workers.push(Worker {
                inject,
                thread: handle.thread().clone(),
            });
            join_handles.push(handle);
        }
        tracing::info!("Started {} cooperative worker threads", workers.len());
        Ok(Self {
            workers,
            join_handles: Mutex::new(join_handles),
            next_worker: AtomicUsize::new(0),
            is_shutdown,
            max_park,
        })
    }

    /// Start calling `tasklets`. The returned handle completes once
    /// all of them are done.
    pub fn begin_execute(
        &self,
        name: impl Into<String>,
        tasklets: Vec<Box<dyn Tasklet>>,
    ) -> Result<ExecutionHandle, ExecutionError> {
        if self.is_shutdown.load(Ordering::Acquire) {
            return Err(ExecutionError::InstanceNotActive);
        }
        let tracker = Arc::new(ExecutionTracker {
            name: name.into(),
            remaining: AtomicUsize::new(tasklets.len()),
            cancelled: AtomicBool::new(false),
            failure: Mutex::new(None),
            future: CompletionFuture::new(),
            workers: self.workers.iter().map(|w| w.thread.clone()).collect(),
        });
        if tasklets.is_empty() {
            tracker.future.complete(Ok(()));
        }
        tracing::debug!(
            "Executing {} tasklets for {}",
            tasklets.len(),
            tracker.name
        );

        for tasklet in tasklets {
            let tracked = TrackedTasklet {
                tasklet,
                tracker: tracker.clone(),
                initialized: false,
            };
            if tracked.tasklet.is_cooperative() {
                self.submit_cooperative(tracked);
            } else {
                self.spawn_dedicated(tracked);
            }
        }
        Ok(ExecutionHandle { tracker })
    }

    fn submit_cooperative(&self, tracked: TrackedTasklet) {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[index];
        match worker.inject.send(tracked) {
            Ok(()) => worker.thread.unpark(),
            // The worker only exits on shutdown.
            Err(mpsc::error::SendError(tracked)) => tracked.abort(),
        }
    }

    fn spawn_dedicated(&self, tracked: TrackedTasklet) {
        self.spawn_dedicated_with(tracked, |name, body| {
            std::thread::Builder::new().name(name).spawn(body)
        });
    }

    fn spawn_dedicated_with<S>(&self, mut tracked: TrackedTasklet, spawn: S)
    where
        S: FnOnce(String, Box<dyn FnOnce() + Send>) -> std::io::Result<JoinHandle<()>>,
    {
        let is_shutdown = self.is_shutdown.clone();
        let max_park = self.max_park;
        let tracker = tracked.tracker.clone();
        let name = format!("flowcore-blocking-{}", tracked.tasklet.name());
        let spawned = spawn(
            name,
            Box::new(move || {
                let mut backoff = Backoff::new(max_park);
                loop {
                    if is_shutdown.load(Ordering::Acquire) {
                        tracked.abort();
                        return;
                    }
                    let mut made_progress = false;
                    if !tracked.run_once(&mut made_progress) {
                        return;
                    }
                    if made_progress {
                        backoff.reset();
                    } else {
                        backoff.idle();
                    }
                }
            }),
        );
        match spawned {
            Ok(handle) => self
                .join_handles
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .push(handle),
            // The tasklet went down with the closure and counts as failed.
            Err(err) => tracker.fail(ExecutionError::Config(format!(
                "unable to start a thread for a blocking tasklet: {err}"
            ))),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    /// Abort all tasklets with [`ExecutionError::InstanceNotActive`]
    /// and wait for all threads to exit.
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("Shutting down tasklet execution service");
        for worker in &self.workers {
            worker.thread.unpark();
        }
        let handles = std::mem::take(
            &mut *self
                .join_handles
                .lock()
                .unwrap_or_else(|err| err.into_inner()),
        );
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for TaskletExecutionService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    mut incoming: mpsc::UnboundedReceiver<TrackedTasklet>,
    is_shutdown: Arc<AtomicBool>,
    max_park: Duration,
) {
    let mut tasklets: Vec<TrackedTasklet> = Vec::new();
    let mut backoff = Backoff::new(max_park);
    loop {
        loop {
            match incoming.try_recv() {
                Ok(tracked) => tasklets.push(tracked),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if tasklets.is_empty() {
                        return;
                    }
                    break;
                }
            }
        }
        if is_shutdown.load(Ordering::Acquire) {
            incoming.close();
            while let Ok(tracked) = incoming.try_recv() {
                tasklets.push(tracked);
            }
            tasklets.into_iter().for_each(TrackedTasklet::abort);
            return;
        }

        let mut made_progress = false;
        tasklets.retain_mut(|tracked| tracked.run_once(&mut made_progress));
        if made_progress {
            backoff.reset();
        } else {
            backoff.idle();
        }
    }
}

/// Control over the tasklets of one execution.
#[derive(Clone)]
pub struct ExecutionHandle {
    tracker: Arc<ExecutionTracker>,
}

impl ExecutionHandle {
    pub fn future(&self) -> &CompletionFuture {
        &self.tracker.future
    }

    /// Tasklets leave their worker before their next call.
    pub fn cancel(&self) {
        self.tracker.cancel();
    }

    /// Like [`ExecutionHandle::cancel`], completing with `reason`
    /// unless a tasklet already failed.
    pub fn cancel_with(&self, reason: ExecutionError) {
        self.tracker
            .failure
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .get_or_insert(reason);
        self.tracker.cancel();
    }
}

#[cfg(test)]
struct CountDown {
    left: usize,
    cooperative: bool,
}

#[cfg(test)]
impl Tasklet for CountDown {
    fn call(&mut self) -> Result<super::ProgressState, ExecutionError> {
        if self.left == 0 {
            return Ok(super::ProgressState::DONE);
        }
        self.left -= 1;
        Ok(super::ProgressState::MADE_PROGRESS)
    }

    fn is_cooperative(&self) -> bool {
        self.cooperative
    }

    fn name(&self) -> String {
        format!("count-down-{}", self.left)
    }
}

#[cfg(test)]
struct Forever;

#[cfg(test)]
impl Tasklet for Forever {
    fn call(&mut self) -> Result<super::ProgressState, ExecutionError> {
        Ok(super::ProgressState::NO_PROGRESS)
    }

    fn name(&self) -> String {
        "forever".into()
    }
}

#[cfg(test)]
fn test_service() -> TaskletExecutionService {
    TaskletExecutionService::new(&InstanceConfig {
        cooperative_thread_count: 2,
        ..InstanceConfig::default()
    })
    .unwrap()
}

#[test]
fn completes_when_all_tasklets_are_done() {
    let service = test_service();
    let tasklets: Vec<Box<dyn Tasklet>> = vec![
        Box::new(CountDown {
            left: 10,
            cooperative: true,
        }),
        Box::new(CountDown {
            left: 100,
            cooperative: true,
        }),
        Box::new(CountDown {
            left: 5,
            cooperative: false,
        }),
    ];
    let handle = service.begin_execute("test", tasklets).unwrap();
    assert!(handle.future().join().is_ok());
}

#[test]
fn cancel_stops_endless_tasklets() {
    let service = test_service();
    let handle = service
        .begin_execute("test", vec![Box::new(Forever), Box::new(Forever)])
        .unwrap();
    assert!(handle
        .future()
        .join_timeout(Duration::from_millis(20))
        .is_none());
    handle.cancel();
    assert!(matches!(
        handle.future().join(),
        Err(ExecutionError::Cancelled)
    ));
}

#[test]
fn failure_is_reported_and_stops_others() {
    struct Fails;
    impl Tasklet for Fails {
        fn call(&mut self) -> Result<super::ProgressState, ExecutionError> {
            Err(ExecutionError::ProtocolViolation("broken".into()))
        }
        fn name(&self) -> String {
            "fails".into()
        }
    }

    let service = test_service();
    let handle = service
        .begin_execute("test", vec![Box::new(Forever), Box::new(Fails)])
        .unwrap();
    assert!(matches!(
        handle.future().join(),
        Err(ExecutionError::ProtocolViolation(_))
    ));
}

#[test]
fn shutdown_aborts_running_executions() {
    let service = test_service();
    let handle = service
        .begin_execute("test", vec![Box::new(Forever)])
        .unwrap();
    service.shutdown();
    assert!(matches!(
        handle.future().join(),
        Err(ExecutionError::InstanceNotActive)
    ));
    assert!(matches!(
        service.begin_execute("late", Vec::new()),
        Err(ExecutionError::InstanceNotActive)
    ));
}

#[test]
fn failed_thread_spawn_fails_the_execution() {
    let service = test_service();
    let handle = service
        .begin_execute("test", vec![Box::new(Forever)])
        .unwrap();
    let tracked = TrackedTasklet {
        tasklet: Box::new(CountDown {
            left: 3,
            cooperative: false,
        }),
        tracker: handle.tracker.clone(),
        initialized: false,
    };
    handle.tracker.remaining.fetch_add(1, Ordering::AcqRel);
    service.spawn_dedicated_with(tracked, |_, _| {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "no threads left"))
    });
    assert!(matches!(
        handle.future().join(),
        Err(ExecutionError::Config(_))
    ));
}
