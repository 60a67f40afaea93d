//! Fixed-size worker pool with request/response correlation.
//!
//! A pool owns a set of worker contexts. Each worker builds its handler once,
//! reports ready, then serves any number of concurrent tasks. Replies are
//! matched to callers by task id, never by arrival order.

pub mod pool;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use pool::{run_pool, PoolOptions, TaskPool};

/// Unique identifier for a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Workers spawned, handshake not finished.
    Initializing,
    Ready,
    Dispatching,
    Draining,
    Terminated,
}

/// What a worker is told about itself when it starts.
#[derive(Debug)]
pub struct WorkerContext<C> {
    /// 1-based position in the pool.
    pub index: usize,
    /// Tag of the pool the worker belongs to.
    pub action_id: String,
    pub config: Arc<C>,
}

impl<C> Clone for WorkerContext<C> {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            action_id: self.action_id.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

/// Per-worker message handler produced by a pool's setup closure.
///
/// A worker may run several `handle` calls at once, so implementations must
/// not rely on being called one at a time.
pub trait TaskHandler<P, R>: Send + Sync + 'static {
    fn handle(&self, payload: P) -> impl Future<Output = R> + Send;
}

/// A unit of work on its way to a worker.
#[derive(Debug)]
pub(crate) struct TaskEnvelope<P> {
    pub task_id: TaskId,
    pub worker_index: usize,
    pub action_id: String,
    pub payload: P,
}

/// Messages flowing from workers back to the pool.
#[derive(Debug)]
pub(crate) enum WorkerEvent<R> {
    Ready {
        worker: usize,
    },
    SetupFailed {
        worker: usize,
        reason: String,
    },
    Reply {
        task_id: TaskId,
        worker: usize,
        /// `Err` carries the panic message of a crashed handler.
        result: Result<R, String>,
    },
    /// The envelope was tagged for another action and was not handled.
    Refused {
        task_id: TaskId,
        worker: usize,
        action_id: String,
    },
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool needs at least one worker")]
    NoWorkers,
    #[error("worker {worker} failed to start: {reason}")]
    Startup { worker: usize, reason: String },
    #[error("pool is still waiting for its workers")]
    NotReady,
    #[error("worker {worker} is no longer running")]
    WorkerGone { worker: usize },
    #[error("worker {worker} crashed while running {task}: {reason}")]
    WorkerFault {
        worker: usize,
        task: TaskId,
        reason: String,
    },
    #[error("worker {worker} refused {task}: tagged for action {action_id}")]
    WrongAction {
        worker: usize,
        task: TaskId,
        action_id: String,
    },
    #[error("{task} did not answer within {after:?}")]
    TimedOut { task: TaskId, after: Duration },
    #[error("{task} was abandoned when the pool shut down")]
    Abandoned { task: TaskId },
}
