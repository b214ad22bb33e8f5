//! Worker pool executing deferred SDK work.
//!
//! # Purpose
//! All deferred work in the SDK — delivery callbacks, metadata lookups,
//! resubscribe delays — runs as [`Job`]s on one small fixed [`WorkerPool`]
//! shared through the SDK context. Jobs are ordered by due-time, so a
//! delayed resubscribe never ties up a worker with a sleep.
//!
//! # Design notes
//! A job is a flag-carrying value (`delay`, `recurring`, `cancelled`), not
//! a trait hierarchy: the pool treats every job uniformly and the flags
//! decide re-enqueueing. Panics escaping a job action are caught and
//! logged so a worker task never dies.

use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

type JobAction = Box<dyn FnMut() -> BoxFuture<'static, ()> + Send>;

/// One unit of deferred work.
///
/// A job is due when it has no delay or its due-time has passed. Recurring
/// jobs are re-enqueued after each run until cancelled; cancellation is a
/// cooperative flag checked before each run.
pub struct Job {
    action: tokio::sync::Mutex<JobAction>,
    delay: Option<Duration>,
    recurring: bool,
    cancelled: AtomicBool,
    // Held for the whole action run; wait_for_termination() parks on it
    // instead of polling a completion flag.
    exec_lock: tokio::sync::Mutex<()>,
}

impl Job {
    fn build(action: JobAction, delay: Option<Duration>, recurring: bool) -> Arc<Self> {
        Arc::new(Self {
            action: tokio::sync::Mutex::new(action),
            delay,
            recurring,
            cancelled: AtomicBool::new(false),
            exec_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// One-shot job, due immediately.
    pub fn new<F, Fut>(action: F) -> Arc<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = Some(action);
        Self::build(
            Box::new(move || match slot.take() {
                Some(action) => action().boxed(),
                None => std::future::ready(()).boxed(),
            }),
            None,
            false,
        )
    }

    /// One-shot job, due after `delay`.
    pub fn delayed<F, Fut>(delay: Duration, action: F) -> Arc<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = Some(action);
        Self::build(
            Box::new(move || match slot.take() {
                Some(action) => action().boxed(),
                None => std::future::ready(()).boxed(),
            }),
            Some(delay),
            false,
        )
    }

    /// Job re-enqueued after every run until [`Job::cancel`] is called.
    pub fn recurring<F, Fut>(action: F) -> Arc<Self>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut action = action;
        Self::build(Box::new(move || action().boxed()), None, true)
    }

    /// Recurring job with a fixed delay before each run.
    pub fn recurring_every<F, Fut>(interval: Duration, action: F) -> Arc<Self>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut action = action;
        Self::build(
            Box::new(move || action().boxed()),
            Some(interval),
            true,
        )
    }

    /// Cooperatively cancel the job: it will neither run nor re-enqueue.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    /// Blocks the calling task until the currently running action (if any)
    /// finishes. Returns immediately if the job is not executing.
    pub async fn wait_for_termination(&self) {
        let _guard = self.exec_lock.lock().await;
    }

    async fn run(&self) {
        let _guard = self.exec_lock.lock().await;
        if self.is_cancelled() {
            return;
        }
        let fut = {
            let mut action = self.action.lock().await;
            action()
        };
        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            tracing::error!("job action panicked; worker continues");
        }
    }
}

struct QueuedJob {
    due: Instant,
    seq: u64,
    job: Arc<Job>,
}

// BinaryHeap is a max-heap; invert the ordering so the soonest due job
// (ties broken by enqueue sequence) is popped first.
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

struct PoolInner {
    queue: Mutex<BinaryHeap<QueuedJob>>,
    notify: Notify,
    running_tx: watch::Sender<bool>,
    seq: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

/// Fixed-size pool of worker tasks draining the due-time-ordered queue.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Spawn `worker_count` worker tasks on the current tokio runtime.
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (running_tx, running_rx) = watch::channel(true);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            running_tx,
            seq: AtomicU64::new(0),
            workers: Mutex::new(Vec::with_capacity(worker_count)),
            worker_count,
        });
        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let inner = Arc::clone(&inner);
            let running_rx = running_rx.clone();
            handles.push(tokio::spawn(worker_loop(inner, running_rx, index)));
        }
        *inner.workers.lock().expect("pool worker list lock") = handles;
        Self { inner }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    pub fn is_running(&self) -> bool {
        *self.inner.running_tx.borrow()
    }

    /// Insert the job by soonest due-time and wake one worker.
    pub fn enqueue(&self, job: Arc<Job>) {
        if !self.is_running() {
            tracing::warn!("job enqueued on stopped pool; dropping");
            return;
        }
        let due = Instant::now() + job.delay.unwrap_or_default();
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        self.inner
            .queue
            .lock()
            .expect("pool queue lock")
            .push(QueuedJob { due, seq, job });
        self.inner.notify.notify_one();
    }

    /// Stop accepting work, drain the queue, and join every worker. A job
    /// already executing finishes naturally before its worker observes the
    /// stop.
    pub async fn shutdown(&self) {
        if self.inner.running_tx.send(false).is_err() {
            return;
        }
        self.inner.queue.lock().expect("pool queue lock").clear();
        let handles = std::mem::take(&mut *self.inner.workers.lock().expect("pool worker list lock"));
        for handle in handles {
            let _ = handle.await;
        }
        tracing::debug!("worker pool shut down");
    }
}

enum Next {
    Run(Arc<Job>),
    Until(Instant),
    Park,
}

async fn worker_loop(inner: Arc<PoolInner>, mut running_rx: watch::Receiver<bool>, index: usize) {
    loop {
        let notified = inner.notify.notified();
        tokio::pin!(notified);

        if !*running_rx.borrow() {
            break;
        }

        let next = {
            let mut queue = inner.queue.lock().expect("pool queue lock");
            let now = Instant::now();
            match queue.pop() {
                Some(entry) if entry.due <= now => Next::Run(entry.job),
                Some(entry) => {
                    let due = entry.due;
                    queue.push(entry);
                    Next::Until(due)
                }
                None => Next::Park,
            }
        };

        match next {
            Next::Run(job) => {
                if job.is_cancelled() {
                    continue;
                }
                job.run().await;
                if job.recurring && !job.is_cancelled() && *running_rx.borrow() {
                    let due = Instant::now() + job.delay.unwrap_or_default();
                    let seq = inner.seq.fetch_add(1, Ordering::Relaxed);
                    inner
                        .queue
                        .lock()
                        .expect("pool queue lock")
                        .push(QueuedJob { due, seq, job });
                    inner.notify.notify_one();
                }
            }
            Next::Until(due) => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = sleep_until(due) => {}
                    _ = running_rx.changed() => {}
                }
            }
            Next::Park => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = running_rx.changed() => {}
                }
            }
        }
    }
    tracing::debug!(worker = index, "pool worker exited");
}
