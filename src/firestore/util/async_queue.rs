use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::firestore::util::backoff::{BackoffSettings, ExponentialBackoff};
use crate::platform::runtime;

/// Identifies the kind of a delayed operation so tests can fast-forward them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Matches every timer in [`AsyncQueue::run_all_delayed_operations_until`].
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    ClientMetadataRefresh,
    LruGarbageCollection,
    AsyncQueueRetry,
    TransactionRetry,
}

type Job = BoxFuture<'static, ()>;
type RetryableOp = Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>;

/// Serial executor for everything that touches client state.
///
/// Operations run one at a time in the order they were enqueued. An operation
/// may await I/O, but it must never await another operation of the same
/// queue.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    sender: async_channel::Sender<Job>,
    state: StdMutex<QueueState>,
}

struct QueueState {
    restricted: bool,
    next_delayed_id: u64,
    delayed: Vec<Arc<DelayedEntry>>,
    retryable: VecDeque<RetryableOp>,
    retry_backoff: ExponentialBackoff,
}

impl AsyncQueue {
    pub fn new() -> Self {
        Self::with_backoff(BackoffSettings::default())
    }

    pub fn with_backoff(settings: BackoffSettings) -> Self {
        let (sender, receiver) = async_channel::unbounded::<Job>();
        runtime::spawn_detached(async move {
            while let Ok(job) = receiver.recv().await {
                job.await;
            }
        });
        Self {
            inner: Arc::new(QueueInner {
                sender,
                state: StdMutex::new(QueueState {
                    restricted: false,
                    next_delayed_id: 0,
                    delayed: Vec::new(),
                    retryable: VecDeque::new(),
                    retry_backoff: ExponentialBackoff::new(settings),
                }),
            }),
        }
    }

    /// Schedules `op` and returns a future for its result.
    ///
    /// Once the queue is shut down the returned future fails with `cancelled`
    /// and `op` never runs.
    pub fn enqueue<T, F, Fut>(&self, op: F) -> BoxFuture<'static, FirestoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
    {
        if self.is_shutting_down() {
            return future::ready(Err(cancelled("The client has already been shut down"))).boxed();
        }
        self.enqueue_even_while_restricted(op)
    }

    pub fn enqueue_even_while_restricted<T, F, Fut>(
        &self,
        op: F,
    ) -> BoxFuture<'static, FirestoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = async move {
            let _ = tx.send(op().await);
        }
        .boxed();
        if self.inner.sender.try_send(job).is_err() {
            return future::ready(Err(cancelled("AsyncQueue worker has stopped"))).boxed();
        }
        async move {
            rx.await
                .unwrap_or_else(|_| Err(cancelled("AsyncQueue operation was dropped")))
        }
        .boxed()
    }

    /// Schedules `op` without waiting for it. Failures are logged.
    pub fn enqueue_and_forget<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let _ = self.enqueue(move || async move {
            if let Err(err) = op().await {
                log::warn!("AsyncQueue operation failed: {err}");
            }
            Ok(())
        });
    }

    /// Schedules `op` to run on the queue after `delay`.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        op: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = async move {
            let _ = tx.send(op().await);
        }
        .boxed();
        let completion = async move {
            rx.await
                .unwrap_or_else(|_| Err(cancelled("Operation cancelled")))
        }
        .boxed()
        .shared();

        let entry = {
            let mut state = self.inner.state.lock().unwrap();
            state.next_delayed_id += 1;
            let entry = Arc::new(DelayedEntry {
                id: state.next_delayed_id,
                timer_id,
                target_time: Instant::now() + delay,
                job: StdMutex::new(None),
            });
            if !state.restricted {
                *entry.job.lock().unwrap() = Some(job);
                state.delayed.push(Arc::clone(&entry));
            }
            entry
        };

        let weak = Arc::downgrade(&self.inner);
        let timer_entry = Arc::clone(&entry);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                QueueInner::fire(&inner, &timer_entry);
            }
        });

        DelayedOperation {
            entry,
            queue: Arc::downgrade(&self.inner),
            completion,
        }
    }

    /// Runs `op` now and keeps re-running it with backoff while it fails
    /// with a storage transaction error.
    ///
    /// Retryable operations run strictly one after another: a later one only
    /// starts once every earlier one has succeeded or been dropped.
    pub fn enqueue_retryable<F, Fut>(&self, op: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let op: RetryableOp = Arc::new(move || op().boxed());
        let start = {
            let mut state = self.inner.state.lock().unwrap();
            if state.restricted {
                return;
            }
            state.retryable.push_back(op);
            state.retryable.len() == 1
        };
        if start {
            self.retry_next_op();
        }
    }

    fn retry_next_op(&self) {
        let queue = self.clone();
        self.enqueue_and_forget(move || async move {
            let op = queue.inner.state.lock().unwrap().retryable.front().cloned();
            let Some(op) = op else {
                return Ok(());
            };
            match op().await {
                Err(err) if err.is_storage_transaction() => {
                    let delay = queue.inner.state.lock().unwrap().retry_backoff.next_delay();
                    log::debug!("Retrying operation after storage failure: {err}");
                    let retry_queue = queue.clone();
                    queue.enqueue_after_delay(TimerId::AsyncQueueRetry, delay, move || async move {
                        retry_queue.retry_next_op();
                        Ok(())
                    });
                }
                outcome => {
                    if let Err(err) = outcome {
                        log::warn!("Dropping retryable operation after non-retryable error: {err}");
                    }
                    let more = {
                        let mut state = queue.inner.state.lock().unwrap();
                        state.retry_backoff.reset();
                        state.retryable.pop_front();
                        !state.retryable.is_empty()
                    };
                    if more {
                        queue.retry_next_op();
                    }
                }
            }
            Ok(())
        });
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .delayed
            .iter()
            .any(|entry| entry.timer_id == timer_id)
    }

    /// Fires pending delayed operations in target-time order, stopping after
    /// the first one with `last_timer_id`, then waits for them to finish.
    pub async fn run_all_delayed_operations_until(
        &self,
        last_timer_id: TimerId,
    ) -> FirestoreResult<()> {
        self.enqueue(|| async { Ok(()) }).await?;
        let mut entries = self.inner.state.lock().unwrap().delayed.clone();
        entries.sort_by_key(|entry| (entry.target_time, entry.id));
        for entry in entries {
            QueueInner::fire(&self.inner, &entry);
            if last_timer_id != TimerId::All && entry.timer_id == last_timer_id {
                break;
            }
        }
        self.enqueue(|| async { Ok(()) }).await
    }

    /// Stops accepting new operations. Already queued operations still run.
    pub fn enter_restricted_mode(&self) {
        self.inner.state.lock().unwrap().restricted = true;
    }

    /// Enters restricted mode and cancels every delayed operation.
    pub fn shutdown(&self) {
        let entries = {
            let mut state = self.inner.state.lock().unwrap();
            state.restricted = true;
            state.retryable.clear();
            std::mem::take(&mut state.delayed)
        };
        for entry in entries {
            entry.take_job();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().unwrap().restricted
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("AsyncQueue")
            .field("restricted", &state.restricted)
            .field("delayed", &state.delayed.len())
            .field("retryable", &state.retryable.len())
            .finish()
    }
}

impl QueueInner {
    /// Moves a delayed entry onto the queue. The job is taken only when the
    /// queue reaches it, so a cancel issued before then still wins.
    fn fire(inner: &Arc<QueueInner>, entry: &Arc<DelayedEntry>) {
        let weak: Weak<QueueInner> = Arc::downgrade(inner);
        let entry = Arc::clone(entry);
        let job: Job = async move {
            let job = entry.take_job();
            if let Some(inner) = weak.upgrade() {
                inner.remove_delayed(entry.id);
            }
            if let Some(job) = job {
                job.await;
            }
        }
        .boxed();
        let _ = inner.sender.try_send(job);
    }

    fn remove_delayed(&self, id: u64) {
        self.state
            .lock()
            .unwrap()
            .delayed
            .retain(|entry| entry.id != id);
    }
}

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    job: StdMutex<Option<Job>>,
}

impl DelayedEntry {
    fn take_job(&self) -> Option<Job> {
        self.job.lock().unwrap().take()
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone)]
pub struct DelayedOperation {
    entry: Arc<DelayedEntry>,
    queue: Weak<QueueInner>,
    completion: Shared<BoxFuture<'static, FirestoreResult<()>>>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.entry.timer_id
    }

    /// Runs the operation as soon as the queue gets to it.
    pub fn skip_delay(&self) {
        if let Some(inner) = self.queue.upgrade() {
            QueueInner::fire(&inner, &self.entry);
        }
    }

    /// Cancels the operation if it has not started. Its completion then fails
    /// with `cancelled` and the operation never runs.
    pub fn cancel(&self) {
        if self.entry.take_job().is_some() {
            if let Some(inner) = self.queue.upgrade() {
                inner.remove_delayed(self.entry.id);
            }
        }
    }

    /// Resolves with the operation's result, or `cancelled`.
    pub fn completion(&self) -> Shared<BoxFuture<'static, FirestoreResult<()>>> {
        self.completion.clone()
    }
}

impl fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("timer_id", &self.entry.timer_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{internal_error, storage_transaction};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_operations_in_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut pending = Vec::new();
        for i in 0..5 {
            let log = Arc::clone(&log);
            pending.push(queue.enqueue(move || async move {
                runtime::sleep(Duration::from_millis((5 - i) as u64)).await;
                log.lock().unwrap().push(i);
                Ok(i)
            }));
        }
        let results = futures::future::join_all(pending).await;
        assert_eq!(results.last().cloned().unwrap().unwrap(), 4);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn cancelled_delayed_operation_never_runs() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let op = queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_secs(60), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        op.cancel();
        op.skip_delay();
        let err = op.completion().await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/cancelled");
        queue.enqueue(|| async { Ok(()) }).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
    }

    #[tokio::test]
    async fn skip_delay_runs_immediately() {
        let queue = AsyncQueue::new();
        let op = queue.enqueue_after_delay(TimerId::LruGarbageCollection, Duration::from_secs(300), || async {
            Err(internal_error("boom"))
        });
        op.skip_delay();
        let err = op.completion().await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");
    }

    #[tokio::test]
    async fn run_all_delayed_operations_until_stops_at_timer() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(StdMutex::new(Vec::new()));
        for (timer, secs) in [
            (TimerId::ListenStreamIdle, 1),
            (TimerId::ClientMetadataRefresh, 2),
            (TimerId::LruGarbageCollection, 3),
        ] {
            let ran = Arc::clone(&ran);
            queue.enqueue_after_delay(timer, Duration::from_secs(secs), move || async move {
                ran.lock().unwrap().push(timer);
                Ok(())
            });
        }
        queue
            .run_all_delayed_operations_until(TimerId::ClientMetadataRefresh)
            .await
            .unwrap();
        assert_eq!(
            *ran.lock().unwrap(),
            vec![TimerId::ListenStreamIdle, TimerId::ClientMetadataRefresh]
        );
        assert!(queue.contains_delayed_operation(TimerId::LruGarbageCollection));
    }

    #[tokio::test]
    async fn retryable_operation_retries_storage_failures() {
        let queue = AsyncQueue::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(StdMutex::new(Some(tx)));
        let counter = Arc::clone(&attempts);
        queue.enqueue_retryable(move || {
            let counter = Arc::clone(&counter);
            let tx = Arc::clone(&tx);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(storage_transaction("busy"));
                }
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
                Ok(())
            }
        });
        rx.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_operations() {
        let queue = AsyncQueue::new();
        queue.shutdown();
        let err = queue.enqueue(|| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/cancelled");
        let forced = queue
            .enqueue_even_while_restricted(|| async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(forced, 7);
    }
}
