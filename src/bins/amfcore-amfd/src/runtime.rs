//! Actor runtime
//!
//! A fixed set of named tasks, each owning a bounded inbound queue and
//! processing one message at a time to completion. Tasks talk to each other
//! only through typed messages sent over [`TaskHandle`]s.
//!
//! The module also hosts the two shared facilities every task uses:
//! - [`TimerService`]: delivers a message into a task queue after a delay,
//!   cancellable by [`TimerId`]
//! - [`PromiseTable`]: single-assignment futures keyed by a correlation id,
//!   used to wait on peer network function replies with a bound

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::types::{IdGenerators, PromiseId};

/// Inbound queue capacity of every task
pub const TASK_QUEUE_CAPACITY: usize = 1024;

// ============================================================================
// Errors
// ============================================================================

/// Runtime errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The target task is gone or its queue is full
    #[error("queue of task {0} unavailable")]
    QueueUnavailable(TaskId),
}

// ============================================================================
// Task identity and envelope
// ============================================================================

/// AMF task identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskId {
    /// Application task: establishment, configuration, event subscriptions
    App,
    /// NAS procedure engine
    N1,
    /// NGAP session manager
    N2,
    /// Peer network function client
    N11,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::App => write!(f, "TASK_AMF_APP"),
            TaskId::N1 => write!(f, "TASK_AMF_N1"),
            TaskId::N2 => write!(f, "TASK_AMF_N2"),
            TaskId::N11 => write!(f, "TASK_AMF_N11"),
        }
    }
}

/// Task message envelope with a shutdown signal
#[derive(Debug)]
pub enum TaskMessage<T> {
    Message(T),
    Shutdown,
}

/// Sending side of a task queue
pub struct TaskHandle<T> {
    id: TaskId,
    tx: mpsc::Sender<TaskMessage<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Enqueue a message without waiting
    pub fn send(&self, msg: T) -> Result<(), RuntimeError> {
        self.tx.try_send(TaskMessage::Message(msg)).map_err(|e| {
            log::error!("send to {} failed: {}", self.id, e);
            RuntimeError::QueueUnavailable(self.id)
        })
    }

    /// Ask the task to stop after the messages already queued
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.tx
            .send(TaskMessage::Shutdown)
            .await
            .map_err(|_| RuntimeError::QueueUnavailable(self.id))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create a task queue
pub fn channel<T>(id: TaskId) -> (TaskHandle<T>, mpsc::Receiver<TaskMessage<T>>) {
    let (tx, rx) = mpsc::channel(TASK_QUEUE_CAPACITY);
    (TaskHandle { id, tx }, rx)
}

/// A run-to-completion actor
#[async_trait::async_trait]
pub trait Task: Send + 'static {
    type Message: Send + 'static;

    fn id(&self) -> TaskId;

    /// Handle one message; the next message is not dequeued before this returns
    async fn handle(&mut self, msg: Self::Message);
}

/// Drive a task until shutdown or until every sender is dropped
pub async fn run_task<T: Task>(mut task: T, mut rx: mpsc::Receiver<TaskMessage<T::Message>>) {
    log::info!("{} started", task.id());
    while let Some(envelope) = rx.recv().await {
        match envelope {
            TaskMessage::Message(msg) => task.handle(msg).await,
            TaskMessage::Shutdown => break,
        }
    }
    log::info!("{} stopped", task.id());
}

/// Spawn a task onto the tokio runtime
pub fn spawn<T: Task>(
    task: T,
    rx: mpsc::Receiver<TaskMessage<T::Message>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_task(task, rx))
}

// ============================================================================
// Timer service
// ============================================================================

/// Timer identifier, unique per process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivers timeout messages into task queues
#[derive(Debug, Default)]
pub struct TimerService {
    next: AtomicU64,
    armed: Arc<Mutex<HashMap<TimerId, oneshot::Sender<()>>>>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `msg` into `target` after `delay`
    pub fn start<T: Send + 'static>(
        &self,
        target: &TaskHandle<T>,
        delay: Duration,
        msg: T,
    ) -> TimerId {
        let id = TimerId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        if let Ok(mut armed) = self.armed.lock() {
            armed.insert(id, cancel_tx);
        }

        let armed = Arc::clone(&self.armed);
        let target = target.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    // Whoever removes the entry first wins against cancel().
                    let fired = armed
                        .lock()
                        .map(|mut armed| armed.remove(&id).is_some())
                        .unwrap_or(false);
                    if fired {
                        log::debug!("timer {} expired for {}", id, target.id());
                        let _ = target.send(msg);
                    }
                }
                _ = cancel_rx => {}
            }
        });
        id
    }

    /// Cancel an armed timer; false if it already fired or is unknown
    pub fn cancel(&self, id: TimerId) -> bool {
        let entry = match self.armed.lock() {
            Ok(mut armed) => armed.remove(&id),
            Err(_) => None,
        };
        match entry {
            Some(cancel) => {
                let _ = cancel.send(());
                true
            }
            None => false,
        }
    }

    /// Number of armed timers
    pub fn armed(&self) -> usize {
        self.armed.lock().map(|armed| armed.len()).unwrap_or(0)
    }
}

// ============================================================================
// Promises
// ============================================================================

/// Receiving side of a registered promise
#[derive(Debug)]
pub struct Promise<T> {
    pub id: PromiseId,
    rx: oneshot::Receiver<T>,
}

/// Single-assignment futures keyed by correlation id
#[derive(Debug)]
pub struct PromiseTable<T> {
    pending: Mutex<HashMap<PromiseId, oneshot::Sender<T>>>,
}

impl<T> Default for PromiseTable<T> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> PromiseTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new promise
    pub fn register(&self, ids: &IdGenerators) -> Promise<T> {
        let id = ids.next_promise_id();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        Promise { id, rx }
    }

    /// Resolve a promise; false if it is unknown, already resolved or dropped
    pub fn fulfill(&self, id: PromiseId, value: T) -> bool {
        let tx = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&id),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(value).is_ok(),
            None => {
                log::warn!("promise {} not pending", id);
                false
            }
        }
    }

    /// Wait for a promise with a bound; the promise is dropped on timeout
    pub async fn wait(&self, promise: Promise<T>, timeout: Duration) -> Option<T> {
        let Promise { id, rx } = promise;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) => None,
            Err(_) => {
                log::warn!("promise {} timed out after {:?}", id, timeout);
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&id);
                }
                None
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        out: mpsc::UnboundedSender<u32>,
    }

    #[async_trait::async_trait]
    impl Task for Echo {
        type Message = u32;

        fn id(&self) -> TaskId {
            TaskId::App
        }

        async fn handle(&mut self, msg: u32) {
            let _ = self.out.send(msg);
        }
    }

    #[tokio::test]
    async fn test_task_processes_in_order_until_shutdown() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (handle, rx) = channel(TaskId::App);
        let join = spawn(Echo { out: out_tx }, rx);

        handle.send(1).unwrap();
        handle.send(2).unwrap();
        handle.shutdown().await.unwrap();
        join.await.unwrap();

        assert_eq!(out_rx.recv().await, Some(1));
        assert_eq!(out_rx.recv().await, Some(2));
        assert_eq!(handle.send(3), Err(RuntimeError::QueueUnavailable(TaskId::App)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let timers = TimerService::new();
        let (handle, mut rx) = channel::<&'static str>(TaskId::N1);
        timers.start(&handle, Duration::from_secs(5), "expired");

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        match rx.recv().await {
            Some(TaskMessage::Message(m)) => assert_eq!(m, "expired"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(timers.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let timers = TimerService::new();
        let (handle, mut rx) = channel::<u8>(TaskId::N1);
        let id = timers.start(&handle, Duration::from_secs(1), 1);
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_expiry_returns_false() {
        let timers = TimerService::new();
        let (handle, _rx) = channel::<u8>(TaskId::N1);
        let id = timers.start(&handle, Duration::from_millis(10), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!timers.cancel(id));
    }

    #[tokio::test]
    async fn test_promise_fulfilled() {
        let ids = IdGenerators::new();
        let table = PromiseTable::<u32>::new();
        let promise = table.register(&ids);
        assert!(table.fulfill(promise.id, 7));
        assert_eq!(table.wait(promise, Duration::from_secs(1)).await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_promise_timeout_drops_entry() {
        let ids = IdGenerators::new();
        let table = PromiseTable::<u32>::new();
        let promise = table.register(&ids);
        let id = promise.id;
        assert_eq!(table.wait(promise, Duration::from_millis(100)).await, None);
        assert_eq!(table.pending(), 0);
        assert!(!table.fulfill(id, 1));
    }
}
