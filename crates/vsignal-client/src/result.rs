//! Single-delivery results and multi-delivery subscriptions.
//!
//! # Purpose
//! [`AsyncResult`] carries the single outcome of one broker call;
//! [`AsyncSubscription`] carries the ordered item sequence of one streaming
//! subscription. Both are consumable either by awaiting or by registering
//! callbacks — never both on the same object. The mutual exclusion is a
//! deliberate API contract, enforced at runtime as [`SdkError::Usage`].
//!
//! # Design notes
//! Settling is exactly-once: later fulfill/fail calls are no-ops. Callbacks
//! registered before settlement are delivered as worker-pool jobs;
//! registration after settlement invokes the callback immediately on the
//! registering task. Panicking user callbacks are caught and logged so they
//! cannot take down a pool worker.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use vsignal_transport::Status;

use crate::error::SdkError;
use crate::pool::{Job, WorkerPool};

type ValueCallback<T> = Box<dyn FnOnce(T) + Send>;
type ErrorCallback = Box<dyn FnOnce(Status) + Send>;

fn invoke_isolated(run: impl FnOnce() + std::panic::UnwindSafe) {
    if std::panic::catch_unwind(run).is_err() {
        tracing::error!("user callback panicked; delivery isolated");
    }
}

struct ResultState<T> {
    settled: bool,
    // Outcome parked here only while no matching callback is registered.
    outcome: Option<Result<T, Status>>,
    on_value: Option<ValueCallback<T>>,
    on_error: Option<ErrorCallback>,
    awaiting: bool,
}

struct ResultCore<T> {
    state: Mutex<ResultState<T>>,
    notify: Notify,
    pool: WorkerPool,
}

/// Single result of an asynchronous broker operation.
///
/// Consume with [`AsyncResult::await_value`] *or* register
/// [`AsyncResult::on_value`] / [`AsyncResult::on_error`] callbacks.
pub struct AsyncResult<T> {
    core: Arc<ResultCore<T>>,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + 'static> AsyncResult<T> {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            core: Arc::new(ResultCore {
                state: Mutex::new(ResultState {
                    settled: false,
                    outcome: None,
                    on_value: None,
                    on_error: None,
                    awaiting: false,
                }),
                notify: Notify::new(),
                pool,
            }),
        }
    }

    /// Settle with a value. No-op if already settled.
    pub fn fulfill(&self, value: T) {
        let callback = {
            let mut state = self.core.state.lock().expect("result state lock");
            if state.settled {
                return;
            }
            state.settled = true;
            match state.on_value.take() {
                Some(callback) => Some(callback),
                None => {
                    state.outcome = Some(Ok(value));
                    self.core.notify.notify_one();
                    return;
                }
            }
        };
        if let Some(callback) = callback {
            dispatch_value(&self.core.pool, callback, value);
        }
    }

    /// Settle with a failure. No-op if already settled.
    pub fn fail(&self, status: Status) {
        let callback = {
            let mut state = self.core.state.lock().expect("result state lock");
            if state.settled {
                return;
            }
            state.settled = true;
            match state.on_error.take() {
                Some(callback) => callback,
                None => {
                    state.outcome = Some(Err(status));
                    self.core.notify.notify_one();
                    return;
                }
            }
        };
        dispatch_error(&self.core.pool, callback, status);
    }

    /// Await the outcome. Blocks only the calling task.
    ///
    /// Illegal once any callback is registered: a registered callback owns
    /// the delivery, and an awaiter would park forever.
    pub async fn await_value(&self) -> Result<T, SdkError> {
        {
            let mut state = self.core.state.lock().expect("result state lock");
            if state.on_value.is_some() || state.on_error.is_some() {
                return Err(SdkError::Usage(
                    "either await a result or register callbacks, not both",
                ));
            }
            state.awaiting = true;
        }
        loop {
            let notified = self.core.notify.notified();
            {
                let mut state = self.core.state.lock().expect("result state lock");
                if let Some(outcome) = state.outcome.take() {
                    state.awaiting = false;
                    return outcome.map_err(SdkError::from_status);
                }
            }
            notified.await;
        }
    }

    /// Register a delivery callback for the value.
    ///
    /// Invoked immediately on this task if the result is already fulfilled,
    /// otherwise later as a worker-pool job. Illegal while another consumer
    /// awaits the result.
    pub fn on_value(&self, callback: impl FnOnce(T) + Send + 'static) -> Result<(), SdkError> {
        let value = {
            let mut state = self.core.state.lock().expect("result state lock");
            if state.awaiting {
                return Err(SdkError::Usage(
                    "either await a result or register callbacks, not both",
                ));
            }
            if state.on_value.is_some() {
                return Err(SdkError::Usage("on_value callback already registered"));
            }
            match state.outcome {
                Some(Ok(_)) => match state.outcome.take() {
                    Some(Ok(value)) => Some(value),
                    _ => None,
                },
                _ => {
                    state.on_value = Some(Box::new(callback));
                    return Ok(());
                }
            }
        };
        if let Some(value) = value {
            invoke_isolated(AssertUnwindSafe(move || callback(value)));
        }
        Ok(())
    }

    /// Register a delivery callback for a failure; same rules as
    /// [`AsyncResult::on_value`].
    pub fn on_error(&self, callback: impl FnOnce(Status) + Send + 'static) -> Result<(), SdkError> {
        let status = {
            let mut state = self.core.state.lock().expect("result state lock");
            if state.awaiting {
                return Err(SdkError::Usage(
                    "either await a result or register callbacks, not both",
                ));
            }
            if state.on_error.is_some() {
                return Err(SdkError::Usage("on_error callback already registered"));
            }
            match state.outcome {
                Some(Err(_)) => match state.outcome.take() {
                    Some(Err(status)) => Some(status),
                    _ => None,
                },
                _ => {
                    state.on_error = Some(Box::new(callback));
                    return Ok(());
                }
            }
        };
        if let Some(status) = status {
            invoke_isolated(AssertUnwindSafe(move || callback(status)));
        }
        Ok(())
    }

    /// Derive a result that carries `mapper(value)` once this one settles.
    /// Settled synchronously if this result already has its outcome.
    pub fn map<U, F>(&self, mapper: F) -> Result<AsyncResult<U>, SdkError>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let mapped = AsyncResult::new(self.core.pool.clone());
        let on_value = mapped.clone();
        self.on_value(move |value| on_value.fulfill(mapper(value)))?;
        let on_error = mapped.clone();
        self.on_error(move |status| on_error.fail(status))?;
        Ok(mapped)
    }
}

fn dispatch_value<T: Send + 'static>(pool: &WorkerPool, callback: ValueCallback<T>, value: T) {
    pool.enqueue(Job::new(move || async move {
        invoke_isolated(AssertUnwindSafe(move || callback(value)));
    }));
}

fn dispatch_error(pool: &WorkerPool, callback: ErrorCallback, status: Status) {
    pool.enqueue(Job::new(move || async move {
        invoke_isolated(AssertUnwindSafe(move || callback(status)));
    }));
}

type ItemCallback<T> = Arc<dyn Fn(T) + Send + Sync>;
type StreamErrorCallback = Arc<dyn Fn(Status) + Send + Sync>;

struct SubscriptionState<T> {
    buffer: VecDeque<T>,
    terminal: Option<Status>,
    error_delivered: bool,
    on_item: Option<ItemCallback<T>>,
    on_error: Option<StreamErrorCallback>,
    // One drain job at a time keeps callback delivery in receipt order.
    draining: bool,
}

enum Delivery<T> {
    Item(ItemCallback<T>, T),
    Terminal(StreamErrorCallback, Status),
}

struct SubscriptionCore<T> {
    state: Mutex<SubscriptionState<T>>,
    notify: Notify,
    cancelled: AtomicBool,
    pool: WorkerPool,
}

/// Ordered item sequence of one asynchronous subscription.
///
/// Items are delivered FIFO both for awaiting pullers and for callbacks.
/// Cancellation is a cooperative flag: producers observe it and stop, the
/// consumer is never forcibly unblocked.
pub struct AsyncSubscription<T> {
    core: Arc<SubscriptionCore<T>>,
}

impl<T> Clone for AsyncSubscription<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + 'static> AsyncSubscription<T> {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            core: Arc::new(SubscriptionCore {
                state: Mutex::new(SubscriptionState {
                    buffer: VecDeque::new(),
                    terminal: None,
                    error_delivered: false,
                    on_item: None,
                    on_error: None,
                    draining: false,
                }),
                notify: Notify::new(),
                cancelled: AtomicBool::new(false),
                pool,
            }),
        }
    }

    /// Deliver the next item: buffered and drained to the registered
    /// callback in receipt order, or buffered for a puller (waking one
    /// waiter).
    pub fn insert_item(&self, item: T) {
        let mut state = self.core.state.lock().expect("subscription state lock");
        state.buffer.push_back(item);
        if state.on_item.is_some() {
            self.schedule_drain(&mut state);
        } else {
            self.core.notify.notify_one();
        }
    }

    /// Terminate the sequence with a failure. Buffered items still drain
    /// before the failure is surfaced, in both consumption modes.
    pub fn insert_error(&self, status: Status) {
        let mut state = self.core.state.lock().expect("subscription state lock");
        if state.terminal.is_none() {
            state.terminal = Some(status);
        }
        self.core.notify.notify_waiters();
        self.core.notify.notify_one();
        self.schedule_drain(&mut state);
    }

    /// Arrange for one drain job to be running whenever the registered
    /// callbacks have something to consume.
    fn schedule_drain(&self, state: &mut SubscriptionState<T>) {
        if state.draining {
            return;
        }
        let items_waiting = state.on_item.is_some() && !state.buffer.is_empty();
        let error_waiting =
            state.on_error.is_some() && state.terminal.is_some() && !state.error_delivered;
        if !items_waiting && !error_waiting {
            return;
        }
        state.draining = true;
        let subscription = self.clone();
        self.core.pool.enqueue(Job::new(move || async move {
            subscription.drain();
        }));
    }

    /// Deliver buffered items (then a pending terminal error) one at a
    /// time. Runs on a single pool job per subscription, so callbacks see
    /// items strictly in receipt order even on a multi-worker pool.
    fn drain(&self) {
        loop {
            let delivery = {
                let mut state = self.core.state.lock().expect("subscription state lock");
                match Self::next_delivery(&mut state) {
                    Some(delivery) => delivery,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            match delivery {
                Delivery::Item(callback, item) => {
                    invoke_isolated(AssertUnwindSafe(move || callback(item)));
                }
                Delivery::Terminal(callback, status) => {
                    invoke_isolated(AssertUnwindSafe(move || callback(status)));
                }
            }
        }
    }

    fn next_delivery(state: &mut SubscriptionState<T>) -> Option<Delivery<T>> {
        if let Some(callback) = &state.on_item {
            let callback = Arc::clone(callback);
            if let Some(item) = state.buffer.pop_front() {
                return Some(Delivery::Item(callback, item));
            }
        }
        if !state.error_delivered {
            if let (Some(callback), Some(status)) = (&state.on_error, &state.terminal) {
                state.error_delivered = true;
                return Some(Delivery::Terminal(Arc::clone(callback), status.clone()));
            }
        }
        None
    }

    /// Await the next item. Illegal once an item callback is registered.
    pub async fn next(&self) -> Result<T, SdkError> {
        loop {
            let notified = self.core.notify.notified();
            {
                let mut state = self.core.state.lock().expect("subscription state lock");
                if state.on_item.is_some() {
                    return Err(SdkError::Usage(
                        "either pull a subscription or register an on_item callback, not both",
                    ));
                }
                if let Some(item) = state.buffer.pop_front() {
                    return Ok(item);
                }
                if let Some(status) = state.terminal.clone() {
                    return Err(SdkError::from_status(status));
                }
            }
            notified.await;
        }
    }

    /// Register an item callback; the backlog is flushed to it in receipt
    /// order by the drain job.
    pub fn on_item(&self, callback: impl Fn(T) + Send + Sync + 'static) {
        let mut state = self.core.state.lock().expect("subscription state lock");
        state.on_item = Some(Arc::new(callback));
        self.schedule_drain(&mut state);
    }

    /// Register an error callback; invoked immediately (on this task) if
    /// the subscription already terminated with nothing left to drain.
    pub fn on_error(&self, callback: impl Fn(Status) + Send + Sync + 'static) {
        let inline = {
            let mut state = self.core.state.lock().expect("subscription state lock");
            let callback: StreamErrorCallback = Arc::new(callback);
            state.on_error = Some(Arc::clone(&callback));
            if state.terminal.is_some()
                && !state.error_delivered
                && !state.draining
                && (state.on_item.is_none() || state.buffer.is_empty())
            {
                state.error_delivered = true;
                state.terminal.clone().map(|status| (callback, status))
            } else {
                self.schedule_drain(&mut state);
                None
            }
        };
        if let Some((callback, status)) = inline {
            invoke_isolated(AssertUnwindSafe(move || callback(status)));
        }
    }

    /// Cooperatively cancel: producers should observe the flag and stop.
    pub fn cancel(&self) {
        self.core.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.cancelled.load(Ordering::Acquire)
    }
}
