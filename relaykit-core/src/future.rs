//! Single-assignment result cells.
//!
//! A [`Promise`] is the write side: it can be filled exactly once, with either a value or a
//! [`Failure`]. A [`Future`] is the read side bound to the same cell: continuations registered
//! on it run once the promise is filled, on whichever thread fills it, in registration order.
//! If the cell is already filled when a continuation is registered, the continuation runs
//! immediately on the registering thread, unless the filling thread is still running the earlier
//! continuations: then it is queued behind them and run by the filling thread.
//!
//! [`CancelableFuture`] adds [`cancel`](CancelableFuture::cancel): the owner fills the promise
//! with a [`Failure::cancelled`] failure, which in turn fires the failure continuations that
//! propagate cancellation upstream (e.g. aborting a network reply).
//!
//! Nothing in here blocks except [`Future::wait`] and [`Future::wait_timeout`], which exist for
//! callers outside the core that need synchronous semantics. A [`Future`] can also be `.await`ed.
use std::{
    fmt,
    future::Future as StdFuture,
    ops::Deref,
    pin::Pin,
    sync::{Arc, OnceLock},
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::failure::Failure;

type Continuation<T> = Box<dyn FnOnce(&Result<T, Failure>) + Send>;

struct Shared<T> {
    result: OnceLock<Result<T, Failure>>,
    waiters: Mutex<Waiters<T>>,
    filled: Condvar,
}

struct Waiters<T> {
    // Set under the lock right after `result` is written. Registration checks it under the
    // same lock, so a continuation is either taken by `fill` or run by `subscribe`.
    fired: bool,
    // True while `fill` runs continuations. Registrations made meanwhile are queued behind
    // them and run by `fill`, so registration order holds.
    draining: bool,
    continuations: Vec<Continuation<T>>,
    wakers: Vec<Waker>,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Shared {
            result: OnceLock::new(),
            waiters: Mutex::new(Waiters {
                fired: false,
                draining: false,
                continuations: Vec::new(),
                wakers: Vec::new(),
            }),
            filled: Condvar::new(),
        }
    }

    fn fill(&self, result: Result<T, Failure>) -> bool {
        if let Err(rejected) = self.result.set(result) {
            debug!(
                rejected_success = rejected.is_ok(),
                "promise is already filled, second fulfillment ignored"
            );
            return false;
        }

        let (mut continuations, wakers) = {
            let mut waiters = self.waiters.lock();
            waiters.fired = true;
            waiters.draining = true;
            (
                std::mem::take(&mut waiters.continuations),
                std::mem::take(&mut waiters.wakers),
            )
        };
        self.filled.notify_all();

        if let Some(result) = self.result.get() {
            loop {
                for continuation in continuations {
                    continuation(result);
                }
                let mut waiters = self.waiters.lock();
                if waiters.continuations.is_empty() {
                    waiters.draining = false;
                    break;
                }
                continuations = std::mem::take(&mut waiters.continuations);
            }
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    fn subscribe(&self, continuation: Continuation<T>) {
        {
            let mut waiters = self.waiters.lock();
            if !waiters.fired || waiters.draining {
                waiters.continuations.push(continuation);
                return;
            }
        }
        if let Some(result) = self.result.get() {
            continuation(result);
        }
    }
}

/// Write side of a single-assignment result cell.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Promise {
            shared: Arc::new(Shared::new()),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("filled", &self.filled())
            .finish()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn future(&self) -> Future<T> {
        Future {
            shared: self.shared.clone(),
        }
    }

    pub fn filled(&self) -> bool {
        self.shared.result.get().is_some()
    }

    /// Fills the promise with a value. Returns whether this call performed the transition.
    pub fn success(&self, value: T) -> bool {
        self.shared.fill(Ok(value))
    }

    /// Fills the promise with a failure. Returns whether this call performed the transition.
    pub fn failure(&self, failure: Failure) -> bool {
        self.shared.fill(Err(failure))
    }

    pub fn fill(&self, result: Result<T, Failure>) -> bool {
        self.shared.fill(result)
    }
}

/// Read side of a single-assignment result cell.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.result() {
            None => "pending",
            Some(Ok(_)) => "succeeded",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Future").field("state", &state).finish()
    }
}

impl<T> Future<T> {
    pub fn successful(value: T) -> Self {
        let promise = Promise::new();
        promise.success(value);
        promise.future()
    }

    pub fn with_failure(failure: Failure) -> Self {
        let promise = Promise::new();
        promise.failure(failure);
        promise.future()
    }

    pub fn completed(&self) -> bool {
        self.shared.result.get().is_some()
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.result(), Some(Ok(_)))
    }

    pub fn failed(&self) -> bool {
        matches!(self.result(), Some(Err(_)))
    }

    pub fn result(&self) -> Option<&Result<T, Failure>> {
        self.shared.result.get()
    }

    pub fn value(&self) -> Option<&T> {
        self.result().and_then(|r| r.as_ref().ok())
    }

    pub fn failure_reason(&self) -> Option<&Failure> {
        self.result().and_then(|r| r.as_ref().err())
    }
}

impl<T: Send + Sync + 'static> Future<T> {
    pub fn on_result<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&Result<T, Failure>) + Send + 'static,
    {
        self.shared.subscribe(Box::new(f));
        self
    }

    pub fn on_success<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.on_result(move |result| {
            if let Ok(value) = result {
                f(value);
            }
        })
    }

    pub fn on_failure<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&Failure) + Send + 'static,
    {
        self.on_result(move |result| {
            if let Err(failure) = result {
                f(failure);
            }
        })
    }

    pub fn map<U, F>(&self, f: F) -> Future<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        self.and_then(move |value| Ok(f(value)))
    }

    /// Derives a future from this one's value; a failure here or in `f` fails the result.
    pub fn and_then<U, F>(&self, f: F) -> Future<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<U, Failure> + Send + 'static,
    {
        let promise = Promise::new();
        let target = promise.clone();
        self.on_result(move |result| {
            target.fill(match result {
                Ok(value) => f(value),
                Err(failure) => Err(failure.clone()),
            });
        });
        promise.future()
    }
}

impl<T: Clone> Future<T> {
    /// Blocks the calling thread until the promise is filled.
    pub fn wait(&self) -> Result<T, Failure> {
        loop {
            if let Some(result) = self.shared.result.get() {
                return result.clone();
            }
            let mut waiters = self.shared.waiters.lock();
            if !waiters.fired {
                self.shared.filled.wait(&mut waiters);
            }
        }
    }

    /// Like [`Future::wait`] but gives up after `timeout`, returning `None`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, Failure>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.shared.result.get() {
                return Some(result.clone());
            }
            let mut waiters = self.shared.waiters.lock();
            if !waiters.fired
                && self
                    .shared
                    .filled
                    .wait_until(&mut waiters, deadline)
                    .timed_out()
            {
                drop(waiters);
                return self.shared.result.get().cloned();
            }
        }
    }
}

impl<T: Clone> StdFuture for Future<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.shared.result.get() {
            return Poll::Ready(result.clone());
        }
        let mut waiters = self.shared.waiters.lock();
        if !waiters.fired {
            if !waiters.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                waiters.wakers.push(cx.waker().clone());
            }
            return Poll::Pending;
        }
        drop(waiters);
        match self.shared.result.get() {
            Some(result) => Poll::Ready(result.clone()),
            None => Poll::Pending,
        }
    }
}

/// A [`Future`] whose owner may request early termination.
pub struct CancelableFuture<T> {
    promise: Promise<T>,
    future: Future<T>,
}

impl<T> Clone for CancelableFuture<T> {
    fn clone(&self) -> Self {
        CancelableFuture {
            promise: self.promise.clone(),
            future: self.future.clone(),
        }
    }
}

impl<T> fmt::Debug for CancelableFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelableFuture")
            .field(&self.future)
            .finish()
    }
}

impl<T> Deref for CancelableFuture<T> {
    type Target = Future<T>;

    fn deref(&self) -> &Self::Target {
        &self.future
    }
}

impl<T> CancelableFuture<T> {
    pub fn new(promise: Promise<T>) -> Self {
        let future = promise.future();
        CancelableFuture { promise, future }
    }

    pub fn future(&self) -> Future<T> {
        self.future.clone()
    }

    /// Fails the promise with [`Failure::cancelled`] unless it is already filled.
    pub fn cancel(&self) {
        if self.promise.failure(Failure::cancelled()) {
            debug!("future cancelled");
        }
    }
}

impl<T: Send + Sync + 'static> CancelableFuture<T> {
    pub fn map<U, F>(&self, f: F) -> CancelableFuture<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        self.and_then(move |value| Ok(f(value)))
    }

    /// Like [`Future::and_then`]; cancelling the derived future cancels this one.
    pub fn and_then<U, F>(&self, f: F) -> CancelableFuture<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> Result<U, Failure> + Send + 'static,
    {
        let promise = Promise::new();
        let upstream = self.clone();
        promise.future().on_failure(move |_| upstream.cancel());
        let target = promise.clone();
        self.future.on_result(move |result| {
            target.fill(match result {
                Ok(value) => f(value),
                Err(failure) => Err(failure.clone()),
            });
        });
        CancelableFuture::new(promise)
    }
}

impl<T: Clone> StdFuture for CancelableFuture<T> {
    type Output = Result<T, Failure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.future).poll(cx)
    }
}
