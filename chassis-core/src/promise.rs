//! Single-assignment completion cell.
//!
//! A `Promise` moves through
//!
//! ```text
//! pending ──set_uncancellable──► uncancellable
//!    │  \                              │
//!    │   cancel ──► cancelled          │
//!    ▼                                 ▼
//! success / failure ◄──────────────────┘
//! ```
//!
//! and never leaves a terminal state. Listeners are drained under the lock
//! and invoked after it is released, on the promise's executor: inline when
//! the completing thread already is that executor (up to a bounded nesting
//! depth), as a task otherwise. Promises with no executor notify on the
//! global fallback executor.
//!
//! Two special kinds exist. A *void* promise is a shared no-op sink: it never
//! completes, and failures reported to it are handed to an optional hook. A
//! *close future* completes exactly once through `set_closed` and ignores the
//! ordinary completion methods.

use crate::error::{ChannelError, Result};
use crate::executor::Executor;
use crate::global::GlobalEventExecutor;
use crate::ids::ChannelId;
use parking_lot::{Condvar, Mutex, RwLock};
use smallvec::SmallVec;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tracing::{error, warn};

/// Inline listener notification nesting limit per thread.
pub const MAX_LISTENER_STACK_DEPTH: usize = 8;

thread_local! {
    static LISTENER_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Completion callback.
pub type Listener = Box<dyn FnOnce(&Promise) + Send + 'static>;

/// Receives failures reported to a void promise.
pub type VoidFailureHook = Box<dyn Fn(ChannelError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseKind {
    Default,
    Void,
    CloseFuture,
}

enum State {
    Pending,
    Uncancellable,
    Success,
    Failure(ChannelError),
    Cancelled,
}

impl State {
    const fn is_done(&self) -> bool {
        matches!(self, State::Success | State::Failure(_) | State::Cancelled)
    }

    fn outcome(&self) -> Option<Result<()>> {
        match self {
            State::Success => Some(Ok(())),
            State::Failure(e) => Some(Err(e.clone())),
            State::Cancelled => Some(Err(ChannelError::Cancelled)),
            State::Pending | State::Uncancellable => None,
        }
    }
}

struct Slot {
    state: State,
    listeners: SmallVec<[Listener; 2]>,
    wakers: SmallVec<[Waker; 1]>,
}

struct Inner {
    channel: Option<ChannelId>,
    kind: PromiseKind,
    executor: RwLock<Option<Executor>>,
    slot: Mutex<Slot>,
    done: Condvar,
    on_void_failure: Option<VoidFailureHook>,
}

/// Shared handle to a completion cell. Clones observe the same state.
#[derive(Clone)]
pub struct Promise {
    inner: Arc<Inner>,
}

impl Promise {
    fn build(
        channel: Option<ChannelId>,
        kind: PromiseKind,
        executor: Option<Executor>,
        on_void_failure: Option<VoidFailureHook>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                channel,
                kind,
                executor: RwLock::new(executor),
                slot: Mutex::new(Slot {
                    state: State::Pending,
                    listeners: SmallVec::new(),
                    wakers: SmallVec::new(),
                }),
                done: Condvar::new(),
                on_void_failure,
            }),
        }
    }

    /// Pending promise for an operation on `channel`.
    pub fn new(channel: ChannelId, executor: Option<Executor>) -> Self {
        Self::build(Some(channel), PromiseKind::Default, executor, None)
    }

    /// Pending promise not tied to any channel.
    pub fn unbound(executor: Option<Executor>) -> Self {
        Self::build(None, PromiseKind::Default, executor, None)
    }

    /// Already-successful promise.
    pub fn succeeded(channel: ChannelId, executor: Option<Executor>) -> Self {
        let promise = Self::new(channel, executor);
        promise.try_success();
        promise
    }

    /// Already-failed promise.
    pub fn failed(channel: ChannelId, executor: Option<Executor>, cause: ChannelError) -> Self {
        let promise = Self::new(channel, executor);
        promise.try_failure(cause);
        promise
    }

    /// Non-failable no-op promise; failures go to `on_failure` if given.
    pub fn void(channel: ChannelId, on_failure: Option<VoidFailureHook>) -> Self {
        Self::build(Some(channel), PromiseKind::Void, None, on_failure)
    }

    /// The close-result future of `channel`.
    pub fn close_future(channel: ChannelId, executor: Option<Executor>) -> Self {
        Self::build(Some(channel), PromiseKind::CloseFuture, executor, None)
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.inner.channel
    }

    pub fn kind(&self) -> PromiseKind {
        self.inner.kind
    }

    pub fn is_void(&self) -> bool {
        self.inner.kind == PromiseKind::Void
    }

    pub fn is_close_future(&self) -> bool {
        self.inner.kind == PromiseKind::CloseFuture
    }

    /// True if both handles refer to the same cell.
    pub fn ptr_eq(a: &Promise, b: &Promise) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Executor listeners are notified on.
    pub fn executor(&self) -> Option<Executor> {
        self.inner.executor.read().clone()
    }

    /// Rebind the notifying executor, e.g. once a channel's loop becomes known.
    pub fn set_executor(&self, executor: Executor) {
        *self.inner.executor.write() = Some(executor);
    }

    /// Complete successfully. False if already done (or void/close future).
    pub fn try_success(&self) -> bool {
        match self.inner.kind {
            PromiseKind::Default => self.transition(false, State::Success),
            PromiseKind::Void | PromiseKind::CloseFuture => false,
        }
    }

    /// Fail with `cause`. False if already done (or void/close future).
    pub fn try_failure(&self, cause: ChannelError) -> bool {
        match self.inner.kind {
            PromiseKind::Default => self.transition(false, State::Failure(cause)),
            PromiseKind::Void => {
                if let Some(hook) = &self.inner.on_void_failure {
                    hook(cause);
                }
                false
            }
            PromiseKind::CloseFuture => false,
        }
    }

    /// Complete a close future. False for other kinds or if already done.
    pub fn set_closed(&self) -> bool {
        self.inner.kind == PromiseKind::CloseFuture && self.transition(false, State::Success)
    }

    /// Forbid cancellation from now on.
    ///
    /// Returns false only if the promise was already cancelled; an already
    /// completed promise stays as it is and reports true.
    pub fn set_uncancellable(&self) -> bool {
        if self.is_void() {
            return true;
        }
        let mut slot = self.inner.slot.lock();
        match slot.state {
            State::Pending => {
                slot.state = State::Uncancellable;
                true
            }
            State::Cancelled => false,
            _ => true,
        }
    }

    /// Cancel if still cancellable.
    pub fn cancel(&self) -> bool {
        match self.inner.kind {
            PromiseKind::Default => self.transition(true, State::Cancelled),
            PromiseKind::Void | PromiseKind::CloseFuture => false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.slot.lock().state.is_done()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.inner.slot.lock().state, State::Success)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.slot.lock().state, State::Cancelled)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self.inner.slot.lock().state, State::Pending)
    }

    /// Failure cause; `Cancelled` for a cancelled promise.
    pub fn cause(&self) -> Option<ChannelError> {
        match &self.inner.slot.lock().state {
            State::Failure(e) => Some(e.clone()),
            State::Cancelled => Some(ChannelError::Cancelled),
            _ => None,
        }
    }

    /// Outcome, or `None` while pending.
    pub fn result(&self) -> Option<Result<()>> {
        self.inner.slot.lock().state.outcome()
    }

    /// Run `listener` once this promise completes.
    ///
    /// Listeners run in registration order. Adding a listener to a completed
    /// promise notifies it right away.
    pub fn add_listener<F>(&self, listener: F) -> &Self
    where
        F: FnOnce(&Promise) + Send + 'static,
    {
        if self.is_void() {
            warn!("[Promise] Listeners added to a void promise are never notified");
            return self;
        }
        let boxed: Listener = Box::new(listener);
        let ready = {
            let mut slot = self.inner.slot.lock();
            if slot.state.is_done() {
                Some(boxed)
            } else {
                slot.listeners.push(boxed);
                None
            }
        };
        if let Some(listener) = ready {
            let mut listeners = SmallVec::new();
            listeners.push(listener);
            self.notify_listeners(listeners);
        }
        self
    }

    /// Block until the promise completes and return its outcome.
    ///
    /// Fails with `BlockingOperation` when called on the executor thread that
    /// would have to complete it.
    pub fn wait(&self) -> Result<()> {
        if let Some(outcome) = self.result() {
            return outcome;
        }
        self.check_blocking()?;
        let mut slot = self.inner.slot.lock();
        while !slot.state.is_done() {
            self.inner.done.wait(&mut slot);
        }
        slot.state.outcome().unwrap_or(Err(ChannelError::Cancelled))
    }

    /// Block for at most `timeout`. True if the promise is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_done() {
            return true;
        }
        if self.check_blocking().is_err() {
            return false;
        }
        let mut slot = self.inner.slot.lock();
        let _ = self
            .inner
            .done
            .wait_while_for(&mut slot, |slot| !slot.state.is_done(), timeout);
        slot.state.is_done()
    }

    fn check_blocking(&self) -> Result<()> {
        if self.is_void() {
            return Err(ChannelError::illegal_state("a void promise never completes"));
        }
        if let Some(executor) = self.executor() {
            if executor.in_event_loop() {
                return Err(ChannelError::BlockingOperation);
            }
        }
        Ok(())
    }

    fn transition(&self, only_if_cancellable: bool, next: State) -> bool {
        let (listeners, wakers) = {
            let mut slot = self.inner.slot.lock();
            let allowed = match slot.state {
                State::Pending => true,
                State::Uncancellable => !only_if_cancellable,
                _ => false,
            };
            if !allowed {
                return false;
            }
            slot.state = next;
            (
                std::mem::take(&mut slot.listeners),
                std::mem::take(&mut slot.wakers),
            )
        };
        self.inner.done.notify_all();
        for waker in wakers {
            waker.wake();
        }
        self.notify_listeners(listeners);
        true
    }

    fn notify_listeners(&self, listeners: SmallVec<[Listener; 2]>) {
        if listeners.is_empty() {
            return;
        }
        let executor = self.executor().unwrap_or_else(GlobalEventExecutor::instance);
        if executor.in_event_loop() {
            let depth = LISTENER_DEPTH.with(Cell::get);
            if depth < MAX_LISTENER_STACK_DEPTH {
                LISTENER_DEPTH.with(|d| d.set(depth + 1));
                self.run_listeners(listeners);
                LISTENER_DEPTH.with(|d| d.set(depth));
                return;
            }
        }
        let promise = self.clone();
        if let Err(e) = executor.execute(Box::new(move || promise.run_listeners(listeners))) {
            error!(
                "[Promise] Failed to submit a listener notification task, listeners dropped: {}",
                e
            );
        }
    }

    fn run_listeners(&self, listeners: SmallVec<[Listener; 2]>) {
        for listener in listeners {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(self))) {
                warn!(
                    "[Promise] A listener raised a panic: {}",
                    ChannelError::from_panic(payload.as_ref())
                );
            }
        }
    }
}

impl Future for Promise {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.is_void() {
            return Poll::Ready(Err(ChannelError::illegal_state(
                "a void promise never completes",
            )));
        }
        let mut slot = self.inner.slot.lock();
        if let Some(outcome) = slot.state.outcome() {
            return Poll::Ready(outcome);
        }
        if !slot.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            slot.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner.slot.lock().state {
            State::Pending => "pending".to_string(),
            State::Uncancellable => "uncancellable".to_string(),
            State::Success => "success".to_string(),
            State::Failure(e) => format!("failure({e})"),
            State::Cancelled => "cancelled".to_string(),
        };
        f.debug_struct("Promise")
            .field("kind", &self.inner.kind)
            .field("channel", &self.inner.channel)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::SingleThreadEventLoop;
    use crate::executor::EventExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pending() -> Promise {
        Promise::new(ChannelId::next(), None)
    }

    #[test]
    fn test_single_assignment() {
        let p = pending();
        assert!(p.try_success());
        assert!(!p.try_failure(ChannelError::Closed));
        assert!(!p.cancel());
        assert!(p.is_success());
        assert!(p.cause().is_none());
    }

    #[test]
    fn test_uncancellable_preserves_outcome() {
        let p = pending();
        assert!(p.set_uncancellable());
        assert!(!p.cancel());
        assert!(!p.is_cancellable());
        assert!(p.try_failure(ChannelError::Closed));
        assert!(!p.cancel());
        assert!(matches!(p.cause(), Some(ChannelError::Closed)));
    }

    #[test]
    fn test_cancel_then_uncancellable() {
        let p = pending();
        assert!(p.cancel());
        assert!(p.is_cancelled());
        assert!(p.is_done());
        assert!(!p.set_uncancellable());
        assert!(matches!(p.wait(), Err(ChannelError::Cancelled)));
    }

    #[test]
    fn test_listeners_run_in_order_on_executor() {
        let event_loop = SingleThreadEventLoop::new("promise-listeners").unwrap();
        let executor: Executor = event_loop.clone();
        let p = Promise::new(ChannelId::next(), Some(executor));

        let (tx, rx) = flume::unbounded();
        for i in 0..3 {
            let tx = tx.clone();
            let el = Arc::clone(&event_loop);
            p.add_listener(move |_| tx.send((i, el.in_event_loop())).unwrap());
        }
        p.try_success();

        let got: Vec<_> = (0..3).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(got, vec![(0, true), (1, true), (2, true)]);
    }

    #[test]
    fn test_listener_added_after_completion() {
        let p = Promise::failed(ChannelId::next(), None, ChannelError::Closed);
        let (tx, rx) = flume::bounded(1);
        p.add_listener(move |f| tx.send(f.is_success()).unwrap());
        assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_void_promise() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        let p = Promise::void(
            ChannelId::next(),
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert!(p.set_uncancellable());
        assert!(!p.try_success());
        assert!(!p.try_failure(ChannelError::Closed));
        assert!(!p.is_done());
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(p.wait().is_err());
    }

    #[test]
    fn test_close_future_only_completes_through_set_closed() {
        let p = Promise::close_future(ChannelId::next(), None);
        assert!(!p.try_success());
        assert!(!p.try_failure(ChannelError::Closed));
        assert!(!p.cancel());
        assert!(p.set_closed());
        assert!(!p.set_closed());
        assert!(p.is_success());
    }

    #[test]
    fn test_wait_across_threads() {
        let p = pending();
        let completer = p.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            completer.try_success();
        });
        assert!(p.wait().is_ok());
        handle.join().unwrap();
        assert!(p.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_on_own_executor_is_rejected() {
        let event_loop = SingleThreadEventLoop::new("promise-blocking").unwrap();
        let executor: Executor = event_loop.clone();
        let p = Promise::new(ChannelId::next(), Some(executor));

        let (tx, rx) = flume::bounded(1);
        let waiter = p.clone();
        event_loop
            .execute(Box::new(move || tx.send(waiter.wait()).unwrap()))
            .unwrap();
        assert!(matches!(
            rx.recv().unwrap(),
            Err(ChannelError::BlockingOperation)
        ));
    }

    #[test]
    fn test_await_as_future() {
        let p = pending();
        let completer = p.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            completer.try_failure(ChannelError::NotYetConnected);
        });
        let outcome = futures::executor::block_on(p);
        assert!(matches!(outcome, Err(ChannelError::NotYetConnected)));
    }
}
