//! Error taxonomy of the execution core and helpers to add context
//! to errors coming out of user code.
//!
//! Processor hooks return [`HookResult`], which can carry any error
//! type. The runtime converts those into [`ExecutionError::Hook`]
//! with [`ResultExt::reraise`], which records where the error was
//! re-raised so the message points at the failing step.

use std::any::Any;
use std::error::Error;
use std::panic::Location;
use std::sync::Arc;

use crate::cluster::Address;
use crate::execution::ExecutionId;
use crate::execution::JobId;

/// Error payload of unconstrained shape produced by user code.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Result of every user-implemented processor hook.
pub type HookResult<T> = Result<T, BoxError>;

/// Everything that can go wrong while coordinating or running a job
/// execution on a node.
///
/// Backpressure is not represented here: a full outbox is signalled
/// with a `false` return value and is never an error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    /// The caller is not the master this node knows about.
    #[error("coordinator {coordinator} is not the current master ({master:?})")]
    IllegalCoordinator {
        coordinator: Address,
        master: Option<Address>,
    },
    /// The coordinator should retry once its state converged.
    #[error("retryable: {0}")]
    Retryable(String),
    /// A participant or the coordinator left the cluster view.
    #[error("topology changed: {0}")]
    TopologyChanged(String),
    /// The same execution id was initialized twice.
    #[error("execution {0} already exists")]
    AlreadyExists(ExecutionId),
    #[error("execution {0} not found")]
    NotFound(ExecutionId),
    /// Registered context disagrees with the request.
    #[error("execution {execution_id} was not initialized for job {job_id} by {coordinator}")]
    IdentityMismatch {
        execution_id: ExecutionId,
        job_id: JobId,
        coordinator: Address,
    },
    /// The local node is shutting down.
    #[error("instance is not active")]
    InstanceNotActive,
    #[error("execution cancelled")]
    Cancelled,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// User code failed inside a processor hook or panicked.
    #[error("{context}\nCaused by => {source}")]
    Hook {
        context: String,
        source: Arc<dyn Error + Send + Sync>,
    },
    #[error("snapshot store error: {0}")]
    Store(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl ExecutionError {
    /// Should the coordinator try the same request again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Does this error mean the job has to be restarted with a new
    /// cluster view.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            Self::TopologyChanged(_) | Self::InstanceNotActive | Self::Retryable(_)
        )
    }

    pub(crate) fn not_implemented(hook: &str) -> Self {
        Self::ProtocolViolation(format!("`{hook}` is not implemented by this processor"))
    }
}

impl From<rusqlite::Error> for ExecutionError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<rusqlite_migration::Error> for ExecutionError {
    fn from(err: rusqlite_migration::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for ExecutionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Add context to anything that can be turned into a
/// [`HookResult`].
pub trait ResultExt<T> {
    /// Only this needs to be implemented.
    fn into_hook_result(self) -> HookResult<T>;

    /// Wrap the error with a message prefixed by the caller's
    /// location.
    ///
    /// An [`ExecutionError`] that is already part of the taxonomy is
    /// passed through unchanged.
    ///
    /// Example:
    ///     processor.complete(outbox).reraise("error completing step")?;
    #[track_caller]
    fn reraise(self, msg: &str) -> Result<T, ExecutionError>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_hook_result()
            .map_err(|err| wrap_error(prepend_caller(caller, msg), err))
    }

    /// Like [`ResultExt::reraise`], but only builds the message on
    /// error.
    #[track_caller]
    fn reraise_with(self, msg: impl FnOnce() -> String) -> Result<T, ExecutionError>
    where
        Self: Sized,
    {
        let caller = Location::caller();
        self.into_hook_result()
            .map_err(|err| wrap_error(prepend_caller(caller, &msg()), err))
    }
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn into_hook_result(self) -> HookResult<T> {
        self.map_err(Into::into)
    }
}

fn wrap_error(context: String, err: BoxError) -> ExecutionError {
    match err.downcast::<ExecutionError>() {
        Ok(err) => match *err {
            ExecutionError::Hook { source, .. } => ExecutionError::Hook { context, source },
            err => err,
        },
        Err(err) => ExecutionError::Hook {
            context,
            source: Arc::from(err),
        },
    }
}

/// Use this function to create a protocol violation with location
/// tracking.
#[track_caller]
pub(crate) fn tracked_err(msg: &str) -> ExecutionError {
    let caller = Location::caller();
    ExecutionError::ProtocolViolation(prepend_caller(caller, msg))
}

/// Turn a caught panic into a hook error.
pub(crate) fn panic_err(context: String, payload: Box<dyn Any + Send>) -> ExecutionError {
    let msg = if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic with a non-string payload".to_string()
    };
    let source: BoxError = prepend_tname(msg).into();
    ExecutionError::Hook {
        context,
        source: Arc::from(source),
    }
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

#[test]
fn reraise_wraps_user_errors() {
    let res: Result<(), std::io::Error> = Err(std::io::Error::new(
        std::io::ErrorKind::Other,
        "disk on fire",
    ));
    let err = res.reraise("error saving").unwrap_err();
    match err {
        ExecutionError::Hook { context, source } => {
            assert!(context.contains("errors.rs"));
            assert!(context.ends_with("error saving"));
            assert_eq!(source.to_string(), "disk on fire");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn reraise_keeps_taxonomy() {
    let res: HookResult<()> = Err(ExecutionError::not_implemented("try_process").into());
    let err = res.reraise("error processing").unwrap_err();
    assert!(matches!(err, ExecutionError::ProtocolViolation(_)));
}

#[test]
fn retryable_classification() {
    assert!(ExecutionError::Retryable("race".into()).is_retryable());
    assert!(!ExecutionError::TopologyChanged("gone".into()).is_retryable());
    assert!(ExecutionError::TopologyChanged("gone".into()).is_restartable());
    assert!(!ExecutionError::Cancelled.is_restartable());
}
