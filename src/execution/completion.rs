//! Single-assignment completion signal shared between the scheduler,
//! the execution context and whoever waits for an execution.

use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

use crate::errors::ExecutionError;

pub type CompletionResult = Result<(), ExecutionError>;

type Callback = Box<dyn FnOnce(&CompletionResult) + Send>;

struct Inner {
    outcome: watch::Sender<Option<CompletionResult>>,
    /// Held while the outcome is set, so no callback is missed.
    callbacks: Mutex<Vec<Callback>>,
}

/// Completes at most once with `Ok(())` or an [`ExecutionError`].
///
/// Clones share the same outcome. Callbacks registered before
/// completion run on the completing thread, callbacks registered after
/// run immediately on the registering thread.
#[derive(Clone)]
pub struct CompletionFuture {
    inner: Arc<Inner>,
}

impl Default for CompletionFuture {
    fn default() -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                outcome,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl CompletionFuture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Already completed with `result`.
    pub fn completed(result: CompletionResult) -> Self {
        let future = Self::new();
        future.complete(result);
        future
    }

    /// Set the outcome. Returns `false` if it was already set, in
    /// which case `result` is dropped.
    pub fn complete(&self, result: CompletionResult) -> bool {
        let callbacks = {
            let mut callbacks = self.callbacks();
            let set = self.inner.outcome.send_if_modified(|outcome| {
                if outcome.is_some() {
                    return false;
                }
                *outcome = Some(result.clone());
                true
            });
            if !set {
                return false;
            }
            std::mem::take(&mut *callbacks)
        };
        for callback in callbacks {
            callback(&result);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    /// Outcome, if already completed.
    pub fn result(&self) -> Option<CompletionResult> {
        self.inner.outcome.borrow().clone()
    }

    pub fn when_complete<F>(&self, callback: F)
    where
        F: FnOnce(&CompletionResult) + Send + 'static,
    {
        let result = {
            let mut callbacks = self.callbacks();
            match self.result() {
                Some(result) => result,
                None => {
                    callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&result);
    }

    /// Block the current thread until completed.
    ///
    /// Not for async code, use [`CompletionFuture::wait`] there.
    pub fn join(&self) -> CompletionResult {
        self.block_on_outcome(None).unwrap_or(Err(ExecutionError::Cancelled))
    }

    /// Like [`CompletionFuture::join`], `None` on timeout.
    pub fn join_timeout(&self, timeout: Duration) -> Option<CompletionResult> {
        self.block_on_outcome(Some(timeout))
    }

    /// Wait without blocking a runtime thread.
    pub async fn wait(&self) -> CompletionResult {
        let mut outcome = self.inner.outcome.subscribe();
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        result.unwrap_or(Err(ExecutionError::Cancelled))
    }

    fn block_on_outcome(&self, timeout: Option<Duration>) -> Option<CompletionResult> {
        if let Some(result) = self.result() {
            return Some(result);
        }
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(err) => {
                return Some(Err(ExecutionError::Config(format!(
                    "unable to wait for completion: {err}"
                ))));
            }
        };
        rt.block_on(async {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.wait()).await.ok(),
                None => Some(self.wait().await),
            }
        })
    }

    fn callbacks(&self) -> std::sync::MutexGuard<'_, Vec<Callback>> {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }
}

impl fmt::Debug for CompletionFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionFuture")
            .field("result", &self.result())
            .finish()
    }
}

/// Completes once all of `futures` completed: with the first error
/// in order, or `Ok(())`.
pub fn all_of(futures: Vec<CompletionFuture>) -> CompletionFuture {
    let combined = CompletionFuture::new();
    if futures.is_empty() {
        combined.complete(Ok(()));
        return combined;
    }
    let remaining = Arc::new(AtomicUsize::new(futures.len()));
    for future in &futures {
        let combined = combined.clone();
        let remaining = remaining.clone();
        let all = futures.clone();
        future.when_complete(move |_| {
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                let result = all
                    .iter()
                    .filter_map(CompletionFuture::result)
                    .find(Result::is_err)
                    .unwrap_or(Ok(()));
                combined.complete(result);
            }
        });
    }
    combined
}

#[test]
fn completes_once() {
    let future = CompletionFuture::new();
    assert!(!future.is_done());
    assert!(future.complete(Err(ExecutionError::Cancelled)));
    assert!(!future.complete(Ok(())));
    assert!(matches!(future.join(), Err(ExecutionError::Cancelled)));
}

#[test]
fn callbacks_run_before_and_after_completion() {
    let calls = Arc::new(AtomicUsize::new(0));
    let future = CompletionFuture::new();
    let before = calls.clone();
    future.when_complete(move |result| {
        assert!(result.is_ok());
        before.fetch_add(1, Ordering::SeqCst);
    });
    future.complete(Ok(()));
    let after = calls.clone();
    future.when_complete(move |_| {
        after.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn join_wakes_up_on_other_thread() {
    let future = CompletionFuture::new();
    assert!(future.join_timeout(Duration::from_millis(1)).is_none());
    let completer = future.clone();
    let handle = std::thread::spawn(move || completer.complete(Ok(())));
    assert!(future.join().is_ok());
    assert!(handle.join().unwrap());
}

#[test]
fn async_wait() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let future = CompletionFuture::new();
    let completer = future.clone();
    std::thread::spawn(move || completer.complete(Ok(())));
    assert!(rt.block_on(future.wait()).is_ok());
}

#[test]
fn all_of_reports_first_failure() {
    let futures = vec![CompletionFuture::new(), CompletionFuture::new()];
    let combined = all_of(futures.clone());
    futures[1].complete(Err(ExecutionError::Retryable("x".into())));
    assert!(!combined.is_done());
    futures[0].complete(Ok(()));
    assert!(matches!(combined.join(), Err(ExecutionError::Retryable(_))));
    assert!(all_of(Vec::new()).join().is_ok());
}

#[test]
fn join_timeout_sees_late_completion() {
    let future = CompletionFuture::new();
    let completer = future.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(5));
        completer.complete(Err(ExecutionError::Cancelled));
    });
    let result = future.join_timeout(Duration::from_secs(10));
    assert!(matches!(result, Some(Err(ExecutionError::Cancelled))));
}
