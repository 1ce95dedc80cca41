//! Pipeline nodes and event dispatch.
//!
//! A `HandlerContext` pairs one handler with the executor its callbacks run
//! on. Inbound events walk forward (`next`) to the nearest inbound-capable
//! context, outbound operations walk backward (`prev`) to the nearest
//! outbound-capable one. Delivery is inline when the caller already runs on
//! the target's executor and a queued task otherwise, so each executor sees
//! events in the order they were submitted.
//!
//! Links are `next` strong / `prev` weak: everything is reachable from the
//! head, and a removed context keeps its own links so a traversal already
//! standing on it can carry on.

use crate::channel::{Channel, ChannelInner};
use crate::handler::{Handler, HandlerResult, InboundHandler, OutboundHandler};
use chassis_core::endpoint::Endpoint;
use chassis_core::error::{ChannelError, Result};
use chassis_core::executor::Executor;
use chassis_core::message::Message;
use chassis_core::outbound::OutboundBuffer;
use chassis_core::promise::Promise;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Whether write tasks charge the outbound buffer before the hop.
const WRITE_TASK_ESTIMATE_ENV: &str = "CHASSIS_WRITE_TASK_SIZE_ESTIMATE";
/// Fixed per-task overhead added to the charged size.
const WRITE_TASK_OVERHEAD_ENV: &str = "CHASSIS_WRITE_TASK_OVERHEAD";
const DEFAULT_WRITE_TASK_OVERHEAD: usize = 48;

struct WriteTaskSettings {
    estimate: bool,
    overhead: usize,
}

static WRITE_TASK_SETTINGS: Lazy<WriteTaskSettings> = Lazy::new(|| {
    let estimate = std::env::var(WRITE_TASK_ESTIMATE_ENV)
        .map(|v| !matches!(v.as_str(), "0" | "false" | "no"))
        .unwrap_or(true);
    let overhead = std::env::var(WRITE_TASK_OVERHEAD_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WRITE_TASK_OVERHEAD);
    trace!(
        "[Pipeline] write task size estimate: {}, overhead: {}",
        estimate,
        overhead
    );
    WriteTaskSettings { estimate, overhead }
});

thread_local! {
    /// Number of `exception_caught` callbacks currently on this thread's stack.
    static EXCEPTION_CAUGHT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

pub(crate) struct ContextInner {
    name: String,
    handler: Handler,
    executor: Option<Executor>,
    channel: Weak<ChannelInner>,
    next: RwLock<Option<HandlerContext>>,
    prev: RwLock<Weak<ContextInner>>,
    removed: AtomicBool,
}

/// One node of a channel's pipeline.
#[derive(Clone)]
pub struct HandlerContext {
    inner: Arc<ContextInner>,
}

impl HandlerContext {
    pub(crate) fn new(
        channel: Weak<ChannelInner>,
        name: String,
        handler: Handler,
        executor: Option<Executor>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                name,
                handler,
                executor,
                channel,
                next: RwLock::new(None),
                prev: RwLock::new(Weak::new()),
                removed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn handler(&self) -> &Handler {
        &self.inner.handler
    }

    /// The channel this context belongs to, `None` once it was dropped.
    pub fn channel(&self) -> Option<Channel> {
        self.inner.channel.upgrade().map(Channel::from_inner)
    }

    /// Executor the handler runs on: its own if one was given, the channel's
    /// event loop otherwise (`None` while the channel is unregistered).
    pub fn executor(&self) -> Option<Executor> {
        if let Some(executor) = &self.inner.executor {
            return Some(Arc::clone(executor));
        }
        self.inner
            .channel
            .upgrade()
            .and_then(|channel| channel.current_event_loop())
    }

    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::Acquire)
    }

    /// New promise for an operation on this context's channel.
    pub fn new_promise(&self) -> Promise {
        match self.channel() {
            Some(channel) => Promise::new(channel.id(), self.executor()),
            None => Promise::unbound(self.executor()),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &HandlerContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The executor this context was pinned to, if any.
    pub(crate) fn own_executor(&self) -> Option<Executor> {
        self.inner.executor.clone()
    }

    pub(crate) fn mark_removed(&self) {
        self.inner.removed.store(true, Ordering::Release);
    }

    pub(crate) fn next_ctx(&self) -> Option<HandlerContext> {
        self.inner.next.read().clone()
    }

    pub(crate) fn prev_ctx(&self) -> Option<HandlerContext> {
        self.inner
            .prev
            .read()
            .upgrade()
            .map(|inner| HandlerContext { inner })
    }

    pub(crate) fn set_next(&self, next: Option<&HandlerContext>) {
        *self.inner.next.write() = next.cloned();
    }

    pub(crate) fn set_prev(&self, prev: &HandlerContext) {
        *self.inner.prev.write() = Arc::downgrade(&prev.inner);
    }

    fn find_inbound(&self) -> Option<HandlerContext> {
        let mut ctx = self.next_ctx()?;
        loop {
            if ctx.inner.handler.is_inbound() {
                return Some(ctx);
            }
            ctx = ctx.next_ctx()?;
        }
    }

    fn find_outbound(&self) -> Option<HandlerContext> {
        let mut ctx = self.prev_ctx()?;
        loop {
            if ctx.inner.handler.is_outbound() {
                return Some(ctx);
            }
            ctx = ctx.prev_ctx()?;
        }
    }

    /// Run `f` on this context's executor: inline if already there.
    fn dispatch<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&HandlerContext) + Send + 'static,
    {
        match self.executor() {
            Some(executor) if !executor.in_event_loop() => {
                let ctx = self.clone();
                // Keep the channel alive while the task is queued.
                let channel = self.channel();
                executor.execute(Box::new(move || {
                    f(&ctx);
                    drop(channel);
                }))
            }
            _ => {
                f(self);
                Ok(())
            }
        }
    }

    fn dispatch_inbound<F>(&self, event: &'static str, f: F)
    where
        F: FnOnce(&HandlerContext) + Send + 'static,
    {
        if let Some(next) = self.find_inbound() {
            if let Err(e) = next.dispatch(f) {
                warn!(
                    "[Pipeline] Dropped {} event for handler '{}': {}",
                    event,
                    next.name(),
                    e
                );
            }
        }
    }

    fn dispatch_outbound<F>(&self, promise: &Promise, f: F)
    where
        F: FnOnce(&HandlerContext) + Send + 'static,
    {
        let Some(next) = self.find_outbound() else {
            safe_fail(promise, ChannelError::illegal_state("no outbound handler left in the pipeline"));
            return;
        };
        if let Err(e) = next.dispatch(f) {
            safe_fail(promise, e);
        }
    }

    // ---- handler invocation --------------------------------------------

    fn invoke_inbound<F>(&self, f: F)
    where
        F: FnOnce(&dyn InboundHandler, &HandlerContext) -> HandlerResult,
    {
        let Some(handler) = self.inner.handler.as_inbound() else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| f(handler, self))) {
            Ok(Ok(())) => {}
            Ok(Err(cause)) => self.notify_handler_exception(cause),
            Err(payload) => self.notify_handler_exception(ChannelError::from_panic(payload.as_ref())),
        }
    }

    fn invoke_outbound<F>(&self, promise: &Promise, f: F)
    where
        F: FnOnce(&dyn OutboundHandler, &HandlerContext) -> HandlerResult,
    {
        let Some(handler) = self.inner.handler.as_outbound() else {
            return;
        };
        let cause = match panic::catch_unwind(AssertUnwindSafe(|| f(handler, self))) {
            Ok(Ok(())) => return,
            Ok(Err(cause)) => cause,
            Err(payload) => ChannelError::from_panic(payload.as_ref()),
        };
        safe_fail(promise, cause);
    }

    /// Outbound callbacks without a promise report failures inbound.
    fn invoke_outbound_no_promise<F>(&self, f: F)
    where
        F: FnOnce(&dyn OutboundHandler, &HandlerContext) -> HandlerResult,
    {
        let Some(handler) = self.inner.handler.as_outbound() else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| f(handler, self))) {
            Ok(Ok(())) => {}
            Ok(Err(cause)) => self.notify_handler_exception(cause),
            Err(payload) => self.notify_handler_exception(ChannelError::from_panic(payload.as_ref())),
        }
    }

    fn notify_handler_exception(&self, cause: ChannelError) {
        if EXCEPTION_CAUGHT_DEPTH.with(Cell::get) > 0 {
            warn!(
                "[Pipeline] Handler '{}' failed while handling an exception_caught event: {}",
                self.name(),
                cause
            );
            return;
        }
        self.invoke_exception_caught(cause);
    }

    pub(crate) fn invoke_exception_caught(&self, cause: ChannelError) {
        let Some(handler) = self.inner.handler.as_inbound() else {
            // Outbound-only context: hand the failure to the next inbound one.
            self.fire_exception_caught(cause);
            return;
        };
        let shown = cause.to_string();
        EXCEPTION_CAUGHT_DEPTH.with(|d| d.set(d.get() + 1));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.exception_caught(self, cause)));
        EXCEPTION_CAUGHT_DEPTH.with(|d| d.set(d.get() - 1));
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(payload) => ChannelError::from_panic(payload.as_ref()),
        };
        warn!(
            "[Pipeline] Handler '{}' failed in exception_caught ({}) while handling: {}",
            self.name(),
            failure,
            shown
        );
    }

    pub(crate) fn call_handler_added(&self) -> HandlerResult {
        self.call_lifecycle(|handler, ctx| handler.common().handler_added(ctx))
    }

    pub(crate) fn call_handler_removed(&self) -> HandlerResult {
        self.call_lifecycle(|handler, ctx| handler.common().handler_removed(ctx))
    }

    fn call_lifecycle<F>(&self, f: F) -> HandlerResult
    where
        F: FnOnce(&Handler, &HandlerContext) -> HandlerResult,
    {
        match panic::catch_unwind(AssertUnwindSafe(|| f(&self.inner.handler, self))) {
            Ok(result) => result,
            Err(payload) => Err(ChannelError::from_panic(payload.as_ref())),
        }
    }

    // ---- inbound events ------------------------------------------------

    pub fn fire_channel_registered(&self) -> &Self {
        self.dispatch_inbound("channel_registered", |ctx| {
            ctx.invoke_inbound(|h, ctx| h.channel_registered(ctx));
        });
        self
    }

    pub fn fire_channel_unregistered(&self) -> &Self {
        self.dispatch_inbound("channel_unregistered", |ctx| {
            ctx.invoke_inbound(|h, ctx| h.channel_unregistered(ctx));
        });
        self
    }

    pub fn fire_channel_active(&self) -> &Self {
        self.dispatch_inbound("channel_active", |ctx| {
            ctx.invoke_inbound(|h, ctx| h.channel_active(ctx));
        });
        self
    }

    pub fn fire_channel_inactive(&self) -> &Self {
        self.dispatch_inbound("channel_inactive", |ctx| {
            ctx.invoke_inbound(|h, ctx| h.channel_inactive(ctx));
        });
        self
    }

    pub fn fire_channel_read(&self, msg: Message) -> &Self {
        self.dispatch_inbound("channel_read", move |ctx| {
            ctx.invoke_inbound(move |h, ctx| h.channel_read(ctx, msg));
        });
        self
    }

    pub fn fire_channel_read_complete(&self) -> &Self {
        self.dispatch_inbound("channel_read_complete", |ctx| {
            ctx.invoke_inbound(|h, ctx| h.channel_read_complete(ctx));
        });
        self
    }

    pub fn fire_user_event_triggered(&self, event: Message) -> &Self {
        self.dispatch_inbound("user_event_triggered", move |ctx| {
            ctx.invoke_inbound(move |h, ctx| h.user_event_triggered(ctx, event));
        });
        self
    }

    pub fn fire_channel_writability_changed(&self) -> &Self {
        self.dispatch_inbound("channel_writability_changed", |ctx| {
            ctx.invoke_inbound(|h, ctx| h.channel_writability_changed(ctx));
        });
        self
    }

    pub fn fire_exception_caught(&self, cause: ChannelError) -> &Self {
        self.dispatch_inbound("exception_caught", move |ctx| {
            ctx.invoke_exception_caught(cause);
        });
        self
    }

    // ---- outbound operations -------------------------------------------

    pub fn bind(&self, local: Endpoint) -> Promise {
        let promise = self.new_promise();
        settle(self.bind_with(local, promise.clone()), &promise);
        promise
    }

    pub fn bind_with(&self, local: Endpoint, promise: Promise) -> Result<Promise> {
        if !self.validate_promise(&promise, false)? {
            return Ok(promise);
        }
        let p = promise.clone();
        self.dispatch_outbound(&promise, move |ctx| {
            ctx.invoke_outbound(&p, |h, ctx| h.bind(ctx, local, p.clone()));
        });
        Ok(promise)
    }

    pub fn connect(&self, remote: Endpoint, local: Option<Endpoint>) -> Promise {
        let promise = self.new_promise();
        settle(self.connect_with(remote, local, promise.clone()), &promise);
        promise
    }

    pub fn connect_with(
        &self,
        remote: Endpoint,
        local: Option<Endpoint>,
        promise: Promise,
    ) -> Result<Promise> {
        if !self.validate_promise(&promise, false)? {
            return Ok(promise);
        }
        let p = promise.clone();
        self.dispatch_outbound(&promise, move |ctx| {
            ctx.invoke_outbound(&p, |h, ctx| h.connect(ctx, remote, local, p.clone()));
        });
        Ok(promise)
    }

    pub fn disconnect(&self) -> Promise {
        let promise = self.new_promise();
        settle(self.disconnect_with(promise.clone()), &promise);
        promise
    }

    /// Disconnect, or close for transports without disconnect semantics.
    pub fn disconnect_with(&self, promise: Promise) -> Result<Promise> {
        let has_disconnect = self
            .channel()
            .map_or(true, |channel| channel.metadata().has_disconnect());
        if !has_disconnect {
            return self.close_with(promise);
        }
        if !self.validate_promise(&promise, false)? {
            return Ok(promise);
        }
        let p = promise.clone();
        self.dispatch_outbound(&promise, move |ctx| {
            ctx.invoke_outbound(&p, |h, ctx| h.disconnect(ctx, p.clone()));
        });
        Ok(promise)
    }

    pub fn close(&self) -> Promise {
        let promise = self.new_promise();
        settle(self.close_with(promise.clone()), &promise);
        promise
    }

    pub fn close_with(&self, promise: Promise) -> Result<Promise> {
        if !self.validate_promise(&promise, false)? {
            return Ok(promise);
        }
        let p = promise.clone();
        self.dispatch_outbound(&promise, move |ctx| {
            ctx.invoke_outbound(&p, |h, ctx| h.close(ctx, p.clone()));
        });
        Ok(promise)
    }

    pub fn deregister(&self) -> Promise {
        let promise = self.new_promise();
        settle(self.deregister_with(promise.clone()), &promise);
        promise
    }

    pub fn deregister_with(&self, promise: Promise) -> Result<Promise> {
        if !self.validate_promise(&promise, false)? {
            return Ok(promise);
        }
        let p = promise.clone();
        self.dispatch_outbound(&promise, move |ctx| {
            ctx.invoke_outbound(&p, |h, ctx| h.deregister(ctx, p.clone()));
        });
        Ok(promise)
    }

    /// Ask for more inbound data.
    pub fn read(&self) -> &Self {
        if let Some(next) = self.find_outbound() {
            let dispatched = next.dispatch(|ctx| {
                ctx.invoke_outbound_no_promise(|h, ctx| h.read(ctx));
            });
            if let Err(e) = dispatched {
                warn!("[Pipeline] Dropped read request for '{}': {}", next.name(), e);
            }
        }
        self
    }

    pub fn write(&self, msg: Message) -> Promise {
        let promise = self.new_promise();
        settle(self.write_with(msg, promise.clone()), &promise);
        promise
    }

    /// Write `msg` without flushing. The channel's void promise is accepted
    /// here; a failure then surfaces as `exception_caught`.
    pub fn write_with(&self, msg: Message, promise: Promise) -> Result<Promise> {
        if !self.validate_promise(&promise, true)? {
            return Ok(promise);
        }
        self.write_internal(msg, false, promise.clone());
        Ok(promise)
    }

    pub fn write_and_flush(&self, msg: Message) -> Promise {
        let promise = self.new_promise();
        settle(self.write_and_flush_with(msg, promise.clone()), &promise);
        promise
    }

    pub fn write_and_flush_with(&self, msg: Message, promise: Promise) -> Result<Promise> {
        if !self.validate_promise(&promise, true)? {
            return Ok(promise);
        }
        self.write_internal(msg, true, promise.clone());
        Ok(promise)
    }

    pub fn flush(&self) -> &Self {
        if let Some(next) = self.find_outbound() {
            let dispatched = next.dispatch(|ctx| {
                ctx.invoke_outbound_no_promise(|h, ctx| h.flush(ctx));
            });
            if let Err(e) = dispatched {
                warn!("[Pipeline] Dropped flush for '{}': {}", next.name(), e);
            }
        }
        self
    }

    fn write_internal(&self, msg: Message, flush: bool, promise: Promise) {
        let Some(next) = self.find_outbound() else {
            safe_fail(&promise, ChannelError::illegal_state("no outbound handler left in the pipeline"));
            return;
        };
        match next.executor() {
            Some(executor) if !executor.in_event_loop() => {
                let task = WriteTask::new(next, msg, promise.clone(), flush);
                let submitted = if flush {
                    executor.execute(Box::new(move || task.run()))
                } else {
                    executor.execute_lazy(Box::new(move || task.run()))
                };
                // A rejected task is dropped here, refunding its charge.
                if let Err(e) = submitted {
                    safe_fail(&promise, e);
                }
            }
            _ => {
                next.invoke_write(msg, promise);
                if flush {
                    next.invoke_flush();
                }
            }
        }
    }

    fn invoke_write(&self, msg: Message, promise: Promise) {
        let p = promise.clone();
        self.invoke_outbound(&promise, move |h, ctx| h.write(ctx, msg, p));
    }

    fn invoke_flush(&self) {
        self.invoke_outbound_no_promise(|h, ctx| h.flush(ctx));
    }

    /// Check `promise` before dispatching an operation with it.
    ///
    /// `Ok(false)` means the caller already cancelled it and the operation
    /// must be skipped silently. Void promises pass only when `allow_void`.
    fn validate_promise(&self, promise: &Promise, allow_void: bool) -> Result<bool> {
        if promise.is_done() {
            if promise.is_cancelled() {
                return Ok(false);
            }
            return Err(ChannelError::invalid_argument(format!(
                "promise already completed: {promise:?}"
            )));
        }
        let channel = self.channel().ok_or(ChannelError::Closed)?;
        if promise.channel_id() != Some(channel.id()) {
            return Err(ChannelError::invalid_argument(format!(
                "promise channel does not match: {:?} (expected: {})",
                promise.channel_id(),
                channel.id()
            )));
        }
        if promise.is_close_future() {
            return Err(ChannelError::invalid_argument(
                "the close future cannot be used to complete pipeline operations",
            ));
        }
        if promise.is_void() && !allow_void {
            return Err(ChannelError::invalid_argument(
                "a void promise cannot be used for this operation",
            ));
        }
        Ok(true)
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("name", &self.inner.name)
            .field("handler", &self.inner.handler)
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// A write travelling to a foreign executor.
///
/// The estimated size plus a fixed overhead is charged to the outbound buffer
/// on the submitting thread and released when the task runs (or is dropped
/// without running).
struct WriteTask {
    ctx: HandlerContext,
    msg: Option<Message>,
    promise: Promise,
    flush: bool,
    charged: Option<(Arc<OutboundBuffer>, usize)>,
    _channel: Option<Channel>,
}

impl WriteTask {
    fn new(ctx: HandlerContext, msg: Message, promise: Promise, flush: bool) -> Self {
        let channel = ctx.channel();
        let settings = &*WRITE_TASK_SETTINGS;
        let charged = if settings.estimate {
            channel.as_ref().and_then(|channel| {
                let buffer = channel.outbound_buffer()?;
                let estimate = channel.config().message_size_estimator().size(msg.as_ref());
                let size = usize::try_from(estimate.max(0))
                    .unwrap_or(0)
                    .saturating_add(settings.overhead);
                buffer.increment_pending_outbound_bytes(size);
                Some((buffer, size))
            })
        } else {
            None
        };
        Self {
            ctx,
            msg: Some(msg),
            promise,
            flush,
            charged,
            _channel: channel,
        }
    }

    fn run(mut self) {
        self.refund();
        if let Some(msg) = self.msg.take() {
            self.ctx.invoke_write(msg, self.promise.clone());
            if self.flush {
                self.ctx.invoke_flush();
            }
        }
    }

    fn refund(&mut self) {
        if let Some((buffer, size)) = self.charged.take() {
            buffer.decrement_pending_outbound_bytes(size);
        }
    }
}

impl Drop for WriteTask {
    fn drop(&mut self) {
        self.refund();
    }
}

fn settle(outcome: Result<Promise>, promise: &Promise) {
    if let Err(e) = outcome {
        promise.try_failure(e);
    }
}

fn safe_fail(promise: &Promise, cause: ChannelError) {
    if promise.is_void() {
        // The channel's void promise fires `exception_caught`; the internal one drops it.
        debug!("[Pipeline] Operation failed with a void promise: {}", cause);
        promise.try_failure(cause);
    } else if !promise.try_failure(cause.clone()) {
        warn!(
            "[Pipeline] Failed to fail the promise because it is done already: {:?} ({})",
            promise, cause
        );
    }
}
