//! Internal channel operations.
//!
//! `Unsafe` performs the state transitions behind every outbound operation:
//! registration, bind, connect, disconnect, close, deregister, read, write
//! and flush. Apart from `register`, every method must run on the channel's
//! event loop; the pipeline head is the usual caller.
//!
//! Events that would re-enter the pipeline while a transition is still on the
//! stack (active after bind, inactive after disconnect, the close teardown)
//! are deferred with `invoke_later` instead of being fired inline.

use crate::channel::Channel;
use chassis_core::endpoint::Endpoint;
use chassis_core::error::{ChannelError, Result};
use chassis_core::executor::{Executor, ScheduledTask};
use chassis_core::message::Message;
use chassis_core::outbound::OutboundBuffer;
use chassis_core::promise::Promise;
use parking_lot::Mutex;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A connect the transport has not finished yet.
struct PendingConnect {
    promise: Promise,
    remote: Endpoint,
    timeout: Option<ScheduledTask>,
}

/// Mutable per-channel state owned by the internal operations.
pub(crate) struct UnsafeState {
    /// Cleared when close begins; nothing can be queued afterwards.
    outbound: Mutex<Option<Arc<OutboundBuffer>>>,
    registered: AtomicBool,
    never_registered: AtomicBool,
    in_flush: AtomicBool,
    pending_connect: Mutex<Option<PendingConnect>>,
}

impl UnsafeState {
    pub(crate) fn new(buffer: Arc<OutboundBuffer>) -> Self {
        Self {
            outbound: Mutex::new(Some(buffer)),
            registered: AtomicBool::new(false),
            never_registered: AtomicBool::new(true),
            in_flush: AtomicBool::new(false),
            pending_connect: Mutex::new(None),
        }
    }

    pub(crate) fn outbound_buffer(&self) -> Option<Arc<OutboundBuffer>> {
        self.outbound.lock().clone()
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }
}

/// Marks a flush in progress for as long as it lives.
///
/// Nested flushes find the flag set and back off; the flag is cleared on drop,
/// so a panicking transport cannot leave the channel stuck "in flush".
struct FlushGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlushGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self { flag })
        }
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Borrowed view of a channel's internal operations.
pub struct Unsafe<'a> {
    channel: &'a Channel,
}

impl<'a> Unsafe<'a> {
    pub(crate) fn new(channel: &'a Channel) -> Self {
        Self { channel }
    }

    fn state(&self) -> &UnsafeState {
        &self.channel.inner().state
    }

    /// The outbound buffer, `None` once close has begun.
    pub fn outbound_buffer(&self) -> Option<Arc<OutboundBuffer>> {
        self.state().outbound_buffer()
    }

    /// A void promise whose failures are dropped.
    pub fn void_promise(&self) -> Promise {
        self.channel.unsafe_void_promise()
    }

    /// Bind the channel to `event_loop` and run the registration there.
    ///
    /// Runs inline when called on `event_loop`, as a task otherwise.
    pub fn register(&self, event_loop: Executor, promise: Promise) {
        if self.state().is_registered() {
            safe_set_failure(
                &promise,
                ChannelError::illegal_state("registered to an event loop already"),
            );
            return;
        }
        if !self.channel.transport().is_compatible(event_loop.as_ref()) {
            safe_set_failure(
                &promise,
                ChannelError::IncompatibleEventLoop(event_loop.name().to_string()),
            );
            return;
        }

        self.channel.inner().set_event_loop(Arc::clone(&event_loop));
        self.channel.close_promise().set_executor(Arc::clone(&event_loop));

        if event_loop.in_event_loop() {
            self.register0(promise);
            return;
        }
        let channel = self.channel.clone();
        let task_promise = promise.clone();
        let submitted = event_loop.execute(Box::new(move || {
            channel.unsafe_ops().register0(task_promise);
        }));
        if let Err(e) = submitted {
            warn!(
                "[Channel] Force-closing a channel whose registration task was not accepted by {}: {} ({})",
                event_loop.name(),
                self.channel,
                e
            );
            self.close_forcibly();
            self.channel.close_promise().set_closed();
            safe_set_failure(&promise, e);
        }
    }

    fn register0(&self, promise: Promise) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.try_register0(&promise)));
        let cause = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(payload) => ChannelError::from_panic(payload.as_ref()),
        };
        self.close_forcibly();
        self.channel.close_promise().set_closed();
        safe_set_failure(&promise, cause);
    }

    fn try_register0(&self, promise: &Promise) -> Result<()> {
        if !promise.set_uncancellable() || !self.ensure_open(promise) {
            return Ok(());
        }
        let state = self.state();
        let first_registration = state.never_registered.load(Ordering::Acquire);
        self.channel.transport().do_register(self.channel)?;
        state.never_registered.store(false, Ordering::Release);
        state.registered.store(true, Ordering::Release);
        *self.channel.inner().keep_alive.lock() = Some(self.channel.clone());

        let pipeline = self.channel.pipeline();
        if first_registration {
            pipeline.call_handler_added_for_all_handlers();
        }
        safe_set_success(promise);
        pipeline.fire_channel_registered();

        if self.channel.is_active() {
            if first_registration {
                pipeline.fire_channel_active();
            } else if self.channel.config().auto_read() {
                // Re-registered while still active: reading has to be re-armed.
                self.begin_read();
            }
        }
        Ok(())
    }

    pub fn bind(&self, local: Endpoint, promise: Promise) {
        self.assert_event_loop();
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        if self.channel.config().broadcast()
            && local.socket_addr().is_some_and(|addr| !addr.ip().is_unspecified())
        {
            warn!(
                "[Channel] A broadcast channel bound to a non-wildcard address ({}) may not receive broadcast packets",
                local
            );
        }

        let was_active = self.channel.is_active();
        if let Err(e) = self.channel.transport().do_bind(self.channel, &local) {
            safe_set_failure(&promise, e);
            self.close_if_closed();
            return;
        }
        if !was_active && self.channel.is_active() {
            self.invoke_later(|channel| {
                channel.pipeline().fire_channel_active();
            });
        }
        safe_set_success(&promise);
    }

    /// Connect to `remote`.
    ///
    /// A transport that connects synchronously is active when `do_connect`
    /// returns; otherwise it reports the outcome later through
    /// `finish_connect`, and the connect fails with `ConnectTimeout` if that
    /// does not happen within the configured timeout.
    pub fn connect(&self, remote: Endpoint, local: Option<Endpoint>, promise: Promise) {
        self.assert_event_loop();
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        if self.state().pending_connect.lock().is_some() {
            safe_set_failure(
                &promise,
                ChannelError::illegal_state("a connection attempt is already pending"),
            );
            return;
        }

        let was_active = self.channel.is_active();
        let connected = self
            .channel
            .transport()
            .do_connect(self.channel, &remote, local.as_ref());
        if let Err(e) = connected {
            safe_set_failure(&promise, annotate_connect_error(e, &remote));
            self.close_if_closed();
            return;
        }
        if self.channel.is_active() {
            self.fulfill_connect(&promise, was_active);
            return;
        }

        let timeout = self.schedule_connect_timeout();
        *self.state().pending_connect.lock() = Some(PendingConnect {
            promise,
            remote,
            timeout,
        });
    }

    /// Complete a connect that `do_connect` left pending.
    pub fn finish_connect(&self, outcome: Result<()>) {
        self.assert_event_loop();
        let Some(pending) = self.state().pending_connect.lock().take() else {
            debug!("[Channel] finish_connect without a pending connect on {}", self.channel);
            return;
        };
        if let Some(timeout) = &pending.timeout {
            timeout.cancel();
        }
        match outcome {
            Ok(()) => self.fulfill_connect(&pending.promise, false),
            Err(e) => {
                safe_set_failure(&pending.promise, annotate_connect_error(e, &pending.remote));
                self.close_if_closed();
            }
        }
    }

    fn fulfill_connect(&self, promise: &Promise, was_active: bool) {
        let active = self.channel.is_active();
        let promised = promise.is_void() || promise.try_success();
        if !was_active && active {
            self.channel.pipeline().fire_channel_active();
        }
        if !promised {
            // Cancelled while connecting.
            self.close(self.void_promise());
        }
    }

    fn schedule_connect_timeout(&self) -> Option<ScheduledTask> {
        let timeout = self.channel.config().connect_timeout();
        if timeout.is_zero() {
            return None;
        }
        let event_loop = self.channel.event_loop().ok()?;
        let weak = self.channel.downgrade();
        let scheduled = event_loop.schedule(
            timeout,
            Box::new(move || {
                let Some(channel) = weak.upgrade() else {
                    return;
                };
                let ops = channel.unsafe_ops();
                let pending = ops.state().pending_connect.lock().take();
                if let Some(pending) = pending {
                    let cause = ChannelError::ConnectTimeout(timeout);
                    if pending.promise.try_failure(cause) {
                        ops.close(ops.void_promise());
                    }
                }
            }),
        );
        match scheduled {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("[Channel] Could not schedule the connect timeout of {}: {}", self.channel, e);
                None
            }
        }
    }

    pub fn disconnect(&self, promise: Promise) {
        self.assert_event_loop();
        if !promise.set_uncancellable() {
            return;
        }
        let was_active = self.channel.is_active();
        if let Err(e) = self.channel.transport().do_disconnect(self.channel) {
            safe_set_failure(&promise, e);
            self.close_if_closed();
            return;
        }
        if was_active && !self.channel.is_active() {
            self.invoke_later(|channel| {
                channel.pipeline().fire_channel_inactive();
            });
        }
        safe_set_success(&promise);
        self.close_if_closed();
    }

    pub fn close(&self, promise: Promise) {
        self.assert_event_loop();
        self.close_with(promise, ChannelError::Closed, false);
    }

    /// Close, failing flushed writes with `cause`.
    ///
    /// With `notify` set, releasing the flushed bytes may fire a writability
    /// change.
    pub fn close_with(&self, promise: Promise, cause: ChannelError, notify: bool) {
        if !promise.set_uncancellable() {
            return;
        }

        let Some(buffer) = self.state().outbound.lock().take() else {
            // A close is already under way: join it.
            if !promise.is_void() {
                let close_future = self.channel.close_promise();
                if close_future.is_done() {
                    safe_set_success(&promise);
                } else {
                    close_future.add_listener(move |_| {
                        promise.try_success();
                    });
                }
            }
            return;
        };

        let was_active = self.channel.is_active();
        if let Some(executor) = self.channel.transport().prepare_to_close() {
            let channel = self.channel.clone();
            let (task_promise, task_buffer, task_cause) =
                (promise.clone(), Arc::clone(&buffer), cause.clone());
            let submitted = executor.execute(Box::new(move || {
                let ops = channel.unsafe_ops();
                ops.do_close0(&task_promise);
                ops.invoke_later(move |channel| {
                    task_buffer.fail_flushed(&task_cause, notify);
                    task_buffer.close(&ChannelError::Closed);
                    channel.unsafe_ops().fire_inactive_and_deregister(was_active);
                });
            }));
            match submitted {
                Ok(()) => return,
                Err(e) => warn!(
                    "[Channel] Closing {} on its event loop, the close executor refused: {}",
                    self.channel, e
                ),
            }
        }

        self.do_close0(&promise);
        buffer.fail_flushed(&cause, notify);
        buffer.close(&ChannelError::Closed);
        if self.state().in_flush.load(Ordering::Acquire) {
            self.invoke_later(move |channel| {
                channel.unsafe_ops().fire_inactive_and_deregister(was_active);
            });
        } else {
            self.fire_inactive_and_deregister(was_active);
        }
    }

    fn do_close0(&self, promise: &Promise) {
        let closed = self.channel.transport().do_close(self.channel);
        self.channel.close_promise().set_closed();
        let pending = self.state().pending_connect.lock().take();
        if let Some(pending) = pending {
            if let Some(timeout) = &pending.timeout {
                timeout.cancel();
            }
            pending.promise.try_failure(ChannelError::Closed);
        }
        match closed {
            Ok(()) => safe_set_success(promise),
            Err(e) => safe_set_failure(promise, e),
        }
    }

    fn fire_inactive_and_deregister(&self, was_active: bool) {
        let fire_inactive = was_active && !self.channel.is_active();
        self.deregister_with(self.void_promise(), fire_inactive);
    }

    /// Close the transport without touching the pipeline.
    pub fn close_forcibly(&self) {
        if let Err(e) = self.channel.transport().do_close(self.channel) {
            warn!("[Channel] Failed to close a channel: {}", e);
        }
    }

    pub fn deregister(&self, promise: Promise) {
        self.assert_event_loop();
        self.deregister_with(promise, false);
    }

    /// Deregister from the event loop.
    ///
    /// Always deferred: the caller may be inside a handler that is moving the
    /// channel to another loop, and the transition must not interleave with it.
    fn deregister_with(&self, promise: Promise, fire_inactive: bool) {
        if !promise.set_uncancellable() {
            return;
        }
        if !self.state().is_registered() {
            safe_set_success(&promise);
            return;
        }
        self.invoke_later(move |channel| {
            if let Err(e) = channel.transport().do_deregister(channel) {
                warn!("[Channel] Unexpected failure while deregistering {}: {}", channel, e);
            }
            let pipeline = channel.pipeline();
            if fire_inactive {
                pipeline.fire_channel_inactive();
            }
            let state = &channel.inner().state;
            if state.registered.swap(false, Ordering::AcqRel) {
                pipeline.fire_channel_unregistered();
            }
            let keep_alive = channel.inner().keep_alive.lock().take();
            safe_set_success(&promise);
            drop(keep_alive);
        });
    }

    /// Ask the transport for inbound data.
    pub fn begin_read(&self) {
        self.assert_event_loop();
        if !self.channel.is_active() {
            return;
        }
        if let Err(e) = self.channel.transport().do_begin_read(self.channel) {
            self.invoke_later(move |channel| {
                channel.pipeline().fire_exception_caught(e);
            });
            self.close(self.void_promise());
        }
    }

    /// Queue `msg` in the outbound buffer.
    pub fn write(&self, msg: Message, promise: Promise) {
        self.assert_event_loop();
        let Some(buffer) = self.outbound_buffer() else {
            // Closing: fail right away and drop the message.
            safe_set_failure(&promise, ChannelError::Closed);
            drop(msg);
            return;
        };
        let msg = match self.channel.transport().filter_outbound_message(msg) {
            Ok(msg) => msg,
            Err(e) => {
                safe_set_failure(&promise, e);
                return;
            }
        };
        let estimate = self
            .channel
            .config()
            .message_size_estimator()
            .size(msg.as_ref());
        let size = usize::try_from(estimate.max(0)).unwrap_or(0);
        buffer.add_message(msg, size, promise);
    }

    /// Commit queued writes and try to write them out.
    pub fn flush(&self) {
        self.assert_event_loop();
        let Some(buffer) = self.outbound_buffer() else {
            return;
        };
        buffer.add_flush();
        self.flush0();
    }

    fn flush0(&self) {
        let Some(_guard) = FlushGuard::enter(&self.state().in_flush) else {
            return;
        };
        let Some(buffer) = self.outbound_buffer() else {
            return;
        };
        if buffer.is_empty() {
            return;
        }

        if !self.channel.is_active() {
            if self.channel.is_open() {
                buffer.fail_flushed(&ChannelError::NotYetConnected, true);
            } else {
                buffer.fail_flushed(&ChannelError::Closed, false);
            }
            return;
        }

        if let Err(e) = self.channel.transport().do_write(self.channel, &buffer) {
            if e.is_io() && self.channel.config().auto_close() {
                // An I/O failure leaves the channel unusable; close it rather
                // than report it open.
                self.close_with(self.void_promise(), e, false);
            } else {
                buffer.fail_flushed(&e, true);
            }
        }
    }

    fn ensure_open(&self, promise: &Promise) -> bool {
        if self.channel.is_open() {
            return true;
        }
        safe_set_failure(promise, ChannelError::Closed);
        false
    }

    fn close_if_closed(&self) {
        if !self.channel.is_open() {
            self.close(self.void_promise());
        }
    }

    /// Run `f` as a task on the channel's event loop, or inline when the
    /// channel has none.
    fn invoke_later<F>(&self, f: F)
    where
        F: FnOnce(&Channel) + Send + 'static,
    {
        let channel = self.channel.clone();
        let Some(event_loop) = self.channel.inner().current_event_loop() else {
            f(&channel);
            return;
        };
        if let Err(e) = event_loop.execute(Box::new(move || f(&channel))) {
            warn!(
                "[Channel] Can't invoke task later as the event loop rejected it: {}",
                e
            );
        }
    }

    fn assert_event_loop(&self) {
        debug_assert!(
            !self.state().is_registered()
                || self
                    .channel
                    .inner()
                    .current_event_loop()
                    .map_or(true, |event_loop| event_loop.in_event_loop()),
            "channel operation invoked off its event loop"
        );
    }
}

fn annotate_connect_error(cause: ChannelError, remote: &Endpoint) -> ChannelError {
    match cause {
        ChannelError::Io(e) => ChannelError::from(io::Error::new(e.kind(), format!("{e}: {remote}"))),
        other => other,
    }
}

fn safe_set_success(promise: &Promise) {
    if !promise.is_void() && !promise.try_success() {
        warn!(
            "[Channel] Failed to mark a promise as success because it is done already: {:?}",
            promise
        );
    }
}

fn safe_set_failure(promise: &Promise, cause: ChannelError) {
    if promise.is_void() {
        // Reported through the void promise's hook, if it has one.
        promise.try_failure(cause);
    } else if !promise.try_failure(cause.clone()) {
        warn!(
            "[Channel] Failed to mark a promise as failure because it is done already: {:?} ({})",
            promise, cause
        );
    }
}
