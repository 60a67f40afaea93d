//! Worker pool: startup handshake, round-robin dispatch, reply routing and teardown.

use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn, Instrument};

use super::{PoolError, PoolState, TaskEnvelope, TaskHandler, TaskId, WorkerContext, WorkerEvent};
use crate::batch::panic_message;

type Waiter<R> = oneshot::Sender<Result<R, PoolError>>;
type PendingTable<R> = Arc<Mutex<HashMap<TaskId, Waiter<R>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub workers: usize,
    /// Fail a dispatch whose reply takes longer than this.
    pub task_timeout: Option<Duration>,
}

impl PoolOptions {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            task_timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }
}

struct WorkerSlot<P> {
    index: usize,
    inbox: mpsc::UnboundedSender<TaskEnvelope<P>>,
    handle: JoinHandle<()>,
}

/// A running pool of workers sharing one handler type.
pub struct TaskPool<P, R> {
    action_id: String,
    workers: Vec<WorkerSlot<P>>,
    cursor: AtomicUsize,
    pending: PendingTable<R>,
    /// Held until the handshake finishes, then moved into the router.
    events: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent<R>>>>,
    router: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<PoolState>,
    task_timeout: Option<Duration>,
}

impl<P, R> TaskPool<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Spawn the workers and wait until every one of them has reported ready.
    pub async fn start<C, H, S, Fut>(
        action_id: &str,
        config: Arc<C>,
        options: PoolOptions,
        setup: S,
    ) -> Result<Self, PoolError>
    where
        C: Send + Sync + 'static,
        H: TaskHandler<P, R>,
        S: Fn(WorkerContext<C>) -> Fut,
        Fut: Future<Output = anyhow::Result<H>> + Send + 'static,
    {
        let pool = Self::spawn(action_id, config, options, setup)?;
        pool.wait_ready().await?;
        Ok(pool)
    }

    /// Spawn the workers without waiting for them. The pool stays
    /// `Initializing` until [`TaskPool::wait_ready`] succeeds.
    pub fn spawn<C, H, S, Fut>(
        action_id: &str,
        config: Arc<C>,
        options: PoolOptions,
        setup: S,
    ) -> Result<Self, PoolError>
    where
        C: Send + Sync + 'static,
        H: TaskHandler<P, R>,
        S: Fn(WorkerContext<C>) -> Fut,
        Fut: Future<Output = anyhow::Result<H>> + Send + 'static,
    {
        if options.workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        debug!(action = action_id, workers = options.workers, "setting up workers");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(options.workers);

        for index in 1..=options.workers {
            let ctx = WorkerContext {
                index,
                action_id: action_id.to_string(),
                config: Arc::clone(&config),
            };
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            let span = tracing::info_span!("worker", action = action_id, worker = index);
            let setup_fut = setup(ctx.clone());
            let handle = tokio::spawn(
                worker_main(ctx, setup_fut, inbox_rx, events_tx.clone()).instrument(span),
            );

            workers.push(WorkerSlot {
                index,
                inbox: inbox_tx,
                handle,
            });
        }

        Ok(Self {
            action_id: action_id.to_string(),
            workers,
            cursor: AtomicUsize::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            events: tokio::sync::Mutex::new(Some(events_rx)),
            router: Mutex::new(None),
            state: Mutex::new(PoolState::Initializing),
            task_timeout: options.task_timeout,
        })
    }

    /// Wait for every worker's ready signal, then start routing replies.
    ///
    /// A setup failure aborts all workers and terminates the pool. Calling
    /// this again after success is a no-op.
    pub async fn wait_ready(&self) -> Result<(), PoolError> {
        let mut guard = self.events.lock().await;
        let Some(mut events_rx) = guard.take() else {
            return match self.state() {
                PoolState::Initializing | PoolState::Draining | PoolState::Terminated => {
                    Err(PoolError::NotReady)
                }
                PoolState::Ready | PoolState::Dispatching => Ok(()),
            };
        };

        let action_id = self.action_id.as_str();
        debug!(action = action_id, "waiting for worker initialization");
        let mut ready = 0;
        while ready < self.workers.len() {
            let failure = match events_rx.recv().await {
                Some(WorkerEvent::Ready { worker }) => {
                    trace!(action = action_id, worker, "worker ready");
                    ready += 1;
                    continue;
                }
                Some(WorkerEvent::SetupFailed { worker, reason }) => {
                    error!(action = action_id, worker, %reason, "worker setup failed");
                    PoolError::Startup { worker, reason }
                }
                Some(WorkerEvent::Reply { task_id, .. } | WorkerEvent::Refused { task_id, .. }) => {
                    warn!(action = action_id, %task_id, "reply received before any dispatch");
                    continue;
                }
                None => PoolError::Startup {
                    worker: 0,
                    reason: "workers exited before reporting ready".to_string(),
                },
            };
            abort_all(&self.workers);
            *lock(&self.state) = PoolState::Terminated;
            return Err(failure);
        }

        let router = tokio::spawn(route_replies(events_rx, Arc::clone(&self.pending)));
        *lock(&self.router) = Some(router);
        *lock(&self.state) = PoolState::Ready;

        info!(action = action_id, workers = self.workers.len(), "all workers ready");
        Ok(())
    }

    /// Send `payload` to the next worker in turn and wait for its reply.
    pub async fn dispatch(&self, payload: P) -> Result<R, PoolError> {
        {
            let mut state = lock(&self.state);
            match *state {
                PoolState::Ready => *state = PoolState::Dispatching,
                PoolState::Dispatching => {}
                PoolState::Initializing => return Err(PoolError::NotReady),
                PoolState::Draining | PoolState::Terminated => {
                    let task = TaskId::new();
                    return Err(PoolError::Abandoned { task });
                }
            }
        }

        let position = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let slot = &self.workers[position];
        let task_id = TaskId::new();

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(task_id, tx);

        let envelope = TaskEnvelope {
            task_id,
            worker_index: slot.index,
            action_id: self.action_id.clone(),
            payload,
        };

        if slot.inbox.send(envelope).is_err() {
            lock(&self.pending).remove(&task_id);
            return Err(PoolError::WorkerGone { worker: slot.index });
        }
        trace!(action = %self.action_id, %task_id, worker = slot.index, "task sent");

        let reply = match self.task_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    lock(&self.pending).remove(&task_id);
                    warn!(action = %self.action_id, %task_id, worker = slot.index, "task timed out");
                    return Err(PoolError::TimedOut {
                        task: task_id,
                        after: limit,
                    });
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(result) => {
                trace!(action = %self.action_id, %task_id, "task completed");
                result
            }
            Err(_) => Err(PoolError::Abandoned { task: task_id }),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    pub fn state(&self) -> PoolState {
        *lock(&self.state)
    }

    /// Stop every worker and fail whatever is still waiting for a reply.
    pub fn shutdown(&self) {
        {
            let mut state = lock(&self.state);
            if *state == PoolState::Terminated {
                return;
            }
            *state = PoolState::Draining;
        }

        abort_all(&self.workers);
        if let Some(router) = lock(&self.router).take() {
            router.abort();
        }

        let abandoned: Vec<(TaskId, Waiter<R>)> = lock(&self.pending).drain().collect();
        if !abandoned.is_empty() {
            warn!(action = %self.action_id, count = abandoned.len(), "abandoning unfinished tasks");
        }
        for (task, waiter) in abandoned {
            let _ = waiter.send(Err(PoolError::Abandoned { task }));
        }

        *lock(&self.state) = PoolState::Terminated;
        debug!(action = %self.action_id, "all workers closed");
    }
}

impl<P, R> Drop for TaskPool<P, R> {
    fn drop(&mut self) {
        abort_all(&self.workers);
        if let Some(router) = lock(&self.router).take() {
            router.abort();
        }
    }
}

fn abort_all<P>(workers: &[WorkerSlot<P>]) {
    for worker in workers {
        worker.handle.abort();
    }
}

async fn worker_main<C, P, R, H, Fut>(
    ctx: WorkerContext<C>,
    setup: Fut,
    mut inbox: mpsc::UnboundedReceiver<TaskEnvelope<P>>,
    events: mpsc::UnboundedSender<WorkerEvent<R>>,
) where
    P: Send + 'static,
    R: Send + 'static,
    H: TaskHandler<P, R>,
    Fut: Future<Output = anyhow::Result<H>> + Send + 'static,
{
    let handler = match AssertUnwindSafe(setup).catch_unwind().await {
        Ok(Ok(handler)) => Arc::new(handler),
        Ok(Err(e)) => {
            let _ = events.send(WorkerEvent::SetupFailed {
                worker: ctx.index,
                reason: format!("{:#}", e),
            });
            return;
        }
        Err(panic) => {
            let _ = events.send(WorkerEvent::SetupFailed {
                worker: ctx.index,
                reason: format!("setup panicked: {}", panic_message(&panic)),
            });
            return;
        }
    };

    if events.send(WorkerEvent::Ready { worker: ctx.index }).is_err() {
        return;
    }

    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            envelope = inbox.recv() => {
                let Some(envelope) = envelope else { break };

                if envelope.action_id != ctx.action_id {
                    debug!(expected = %ctx.action_id, got = %envelope.action_id, "skipping task for another action");
                    let _ = events.send(WorkerEvent::Refused {
                        task_id: envelope.task_id,
                        worker: ctx.index,
                        action_id: envelope.action_id,
                    });
                    continue;
                }

                let handler = Arc::clone(&handler);
                let events = events.clone();
                let worker = ctx.index;
                in_flight.spawn(
                    async move {
                        trace!(task_id = %envelope.task_id, worker = envelope.worker_index, "task started");
                        let result = AssertUnwindSafe(handler.handle(envelope.payload))
                            .catch_unwind()
                            .await
                            .map_err(|panic| panic_message(&panic));
                        if let Err(reason) = &result {
                            error!(task_id = %envelope.task_id, %reason, "task handler panicked");
                        }
                        let _ = events.send(WorkerEvent::Reply {
                            task_id: envelope.task_id,
                            worker,
                            result,
                        });
                    }
                    .in_current_span(),
                );
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    while in_flight.join_next().await.is_some() {}
}

async fn route_replies<R>(
    mut events: mpsc::UnboundedReceiver<WorkerEvent<R>>,
    pending: PendingTable<R>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Reply {
                task_id,
                worker,
                result,
            } => {
                let waiter = lock(&pending).remove(&task_id);
                match waiter {
                    Some(waiter) => {
                        let result = result.map_err(|reason| PoolError::WorkerFault {
                            worker,
                            task: task_id,
                            reason,
                        });
                        let _ = waiter.send(result);
                    }
                    None => debug!(%task_id, worker, "reply for a task nobody is waiting on"),
                }
            }
            WorkerEvent::Refused {
                task_id,
                worker,
                action_id,
            } => {
                if let Some(waiter) = lock(&pending).remove(&task_id) {
                    let _ = waiter.send(Err(PoolError::WrongAction {
                        worker,
                        task: task_id,
                        action_id,
                    }));
                }
            }
            WorkerEvent::Ready { worker } => debug!(worker, "late ready signal"),
            WorkerEvent::SetupFailed { worker, reason } => {
                error!(worker, %reason, "late setup failure")
            }
        }
    }
}

/// Start a pool, hand it to `controller`, and tear it down once the controller returns.
///
/// Tasks still in flight when the controller finishes are abandoned.
pub async fn run_pool<C, P, R, H, S, SetupFut, M, ControllerFut, T>(
    action_id: &str,
    config: Arc<C>,
    options: PoolOptions,
    setup: S,
    controller: M,
) -> Result<T, PoolError>
where
    C: Send + Sync + 'static,
    P: Send + 'static,
    R: Send + 'static,
    H: TaskHandler<P, R>,
    S: Fn(WorkerContext<C>) -> SetupFut,
    SetupFut: Future<Output = anyhow::Result<H>> + Send + 'static,
    M: FnOnce(Arc<TaskPool<P, R>>) -> ControllerFut,
    ControllerFut: Future<Output = T>,
{
    let pool = Arc::new(TaskPool::start(action_id, config, options, setup).await?);

    let output = controller(Arc::clone(&pool)).await;

    info!(action = action_id, "controller has exited, closing workers");
    pool.shutdown();

    Ok(output)
}
