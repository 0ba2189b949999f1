//! The generic asynchronous request machinery.
//!
//! Every user-facing operation returns a [`Request<T>`]: a handle to a
//! spawned worker whose outcome is delivered exactly once, either to the
//! completion callback or, after [`Request::cancel`], as an aborted error.
//! Requests form a tree; cancelling a parent cancels every reachable
//! descendant before the parent's own callback fires.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Error, Result};
use crate::http::TransferObserver;

/// Lifecycle of a request, observable through [`Request::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Running,
    Paused,
    Cancelled,
    Done,
}

/// Abort/pause flags shared between a request handle and the transfer it
/// drives. The flags double as the transport observer so cancellation is
/// seen at chunk granularity.
#[derive(Default)]
pub struct ControlFlags {
    aborted: AtomicBool,
    paused: AtomicBool,
}

impl ControlFlags {
    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// Progress events forwarded to interactive consumers.
pub trait ProgressListener: Send + Sync {
    fn download(&self, _total: u64, _now: u64) {}
    fn upload(&self, _total: u64, _now: u64) {}
}

/// Context threaded through provider operations: cancellation flags plus an
/// optional progress listener. Cheap to clone.
#[derive(Clone, Default)]
pub struct RequestContext {
    flags: Arc<ControlFlags>,
    progress: Option<Arc<dyn ProgressListener>>,
}

impl RequestContext {
    pub fn with_progress(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.progress = Some(listener);
        self
    }

    pub fn aborted(&self) -> bool {
        self.flags.aborted()
    }

    /// Early-out helper for suspension points outside the transport.
    pub fn check_aborted(&self) -> Result<()> {
        if self.aborted() {
            Err(Error::aborted())
        } else {
            Ok(())
        }
    }

    /// The transfer observer handed to the HTTP transport.
    pub fn observer(&self) -> Arc<dyn TransferObserver> {
        Arc::new(ContextObserver {
            flags: self.flags.clone(),
            progress: self.progress.clone(),
        })
    }
}

struct ContextObserver {
    flags: Arc<ControlFlags>,
    progress: Option<Arc<dyn ProgressListener>>,
}

impl TransferObserver for ContextObserver {
    fn abort(&self) -> bool {
        self.flags.aborted()
    }

    fn paused(&self) -> bool {
        self.flags.paused()
    }

    fn progress_download(&self, total: u64, now: u64) {
        if let Some(p) = &self.progress {
            p.download(total, now);
        }
    }

    fn progress_upload(&self, total: u64, now: u64) {
        if let Some(p) = &self.progress {
            // Unknown totals are reported as indeterminate (total == now).
            p.upload(if total == 0 { now } else { total }, now);
        }
    }
}

/// Object-safe view of a request used for bookkeeping and child tracking.
pub trait AbstractRequest: Send + Sync {
    fn cancel(&self);
    fn is_done(&self) -> bool;
    /// Receiver that flips to `true` once the request has delivered.
    fn done_receiver(&self) -> watch::Receiver<bool>;
}

/// Awaits delivery of any type-erased request.
pub async fn wait_done(request: &dyn AbstractRequest) {
    let mut rx = request.done_receiver();
    let _ = rx.wait_for(|done| *done).await;
}

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct Lifecycle<T> {
    status: Status,
    result: Option<Result<T>>,
    callback: Option<Callback<T>>,
}

struct Shared<T> {
    flags: Arc<ControlFlags>,
    lifecycle: Mutex<Lifecycle<T>>,
    children: Mutex<Vec<Arc<dyn AbstractRequest>>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl<T: Clone> Shared<T> {
    /// Claims delivery. Exactly one caller ever gets the callback back;
    /// the rest observe an already-terminal lifecycle and do nothing.
    fn claim(&self, outcome: Result<T>, terminal: Status) -> Option<(Callback<T>, Result<T>)> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if matches!(lifecycle.status, Status::Done | Status::Cancelled) {
            return None;
        }
        lifecycle.status = terminal;
        lifecycle.result = Some(outcome);
        let stored = lifecycle
            .result
            .clone()
            .expect("result stored before dispatch");
        lifecycle.callback.take().map(|cb| (cb, stored))
    }
}

/// Handle to an in-flight asynchronous operation producing `Result<T>`.
pub struct Request<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Request<T> {
    /// Spawns the worker for `f` and returns the handle. The callback is
    /// invoked exactly once, with the final result or the aborted error.
    pub fn spawn<F, Fut>(f: F, callback: impl FnOnce(&Result<T>) + Send + 'static) -> Self
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (done_tx, done_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            flags: Arc::new(ControlFlags::default()),
            lifecycle: Mutex::new(Lifecycle {
                status: Status::Running,
                result: None,
                callback: Some(Box::new(callback)),
            }),
            children: Mutex::new(Vec::new()),
            done_tx,
            done_rx,
        });

        let ctx = RequestContext {
            flags: shared.flags.clone(),
            progress: None,
        };
        let worker = f(ctx);

        let request = Self { shared };
        let delivery = request.clone();
        tokio::spawn(async move {
            // Worker panics fold into an internal error instead of leaving
            // waiters hanging.
            let outcome = match AssertUnwindSafe(worker).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(Error::internal("request worker panicked")),
            };
            delivery.deliver(outcome, Status::Done);
        });
        request
    }

    /// Spawns a worker with a progress listener attached to its context.
    pub fn spawn_with_progress<F, Fut>(
        progress: Arc<dyn ProgressListener>,
        f: F,
        callback: impl FnOnce(&Result<T>) + Send + 'static,
    ) -> Self
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::spawn(
            move |ctx: RequestContext| f(ctx.with_progress(progress)),
            callback,
        )
    }

    fn deliver(&self, outcome: Result<T>, terminal: Status) {
        if let Some((callback, result)) = self.shared.claim(outcome, terminal) {
            callback(&result);
            let _ = self.shared.done_tx.send(true);
            debug!(status = ?terminal, "request delivered");
        }
    }

    /// Waits until the request resolves and returns the final outcome.
    pub async fn result(&self) -> Result<T> {
        self.finish().await;
        let lifecycle = self.shared.lifecycle.lock().unwrap();
        lifecycle
            .result
            .clone()
            .expect("finished request holds a result")
    }

    /// Waits until delivery without consuming the result.
    pub async fn finish(&self) {
        let mut rx = self.shared.done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn status(&self) -> Status {
        self.shared.lifecycle.lock().unwrap().status
    }

    /// Cancels this request and its whole subtree. Every descendant is
    /// marked cancelled before this request's own callback observes the
    /// aborted outcome; if the request already resolved this is a no-op.
    pub fn cancel(&self) {
        self.shared.flags.aborted.store(true, Ordering::SeqCst);
        let children: Vec<_> = self.shared.children.lock().unwrap().drain(..).collect();
        for child in children {
            child.cancel();
        }
        self.deliver(Err(Error::aborted()), Status::Cancelled);
    }

    /// Transport-level backpressure; body I/O stalls until [`Request::resume`].
    pub fn pause(&self) {
        self.shared.flags.paused.store(true, Ordering::SeqCst);
        let mut lifecycle = self.shared.lifecycle.lock().unwrap();
        if lifecycle.status == Status::Running {
            lifecycle.status = Status::Paused;
        }
    }

    pub fn resume(&self) {
        self.shared.flags.paused.store(false, Ordering::SeqCst);
        let mut lifecycle = self.shared.lifecycle.lock().unwrap();
        if lifecycle.status == Status::Paused {
            lifecycle.status = Status::Running;
        }
    }

    /// Registers a sub-request under this one. Completion of the child
    /// never completes the parent; cancellation of the parent always
    /// reaches the child, including when it races with this call.
    pub fn attach_child(&self, child: impl AbstractRequest + 'static) {
        let child: Arc<dyn AbstractRequest> = Arc::new(child);
        if self.shared.flags.aborted() {
            child.cancel();
            return;
        }
        self.shared.children.lock().unwrap().push(child.clone());
        if self.shared.flags.aborted() {
            // cancel() may have drained the list between the check and the
            // push; make sure the child still observes it.
            child.cancel();
        }
    }
}

impl<T: Clone + Send + 'static> AbstractRequest for Request<T> {
    fn cancel(&self) {
        Request::cancel(self);
    }

    fn is_done(&self) -> bool {
        matches!(self.status(), Status::Done | Status::Cancelled)
    }

    fn done_receiver(&self) -> watch::Receiver<bool> {
        self.shared.done_rx.clone()
    }
}

/// Exponential backoff with jitter for retryable failures (rate limits,
/// 5xx, "retry shortly").
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1 << attempt.min(8));
        let jitter = rand::rng().random_range(0..=exp.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter)
    }

    /// Sleeps out the backoff for `attempt`, waking early on abort.
    pub async fn wait(&self, attempt: u32, ctx: &RequestContext) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.delay(attempt);
        while tokio::time::Instant::now() < deadline {
            ctx.check_aborted()?;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}
