//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use chassis_core::endpoint::Endpoint;
use chassis_core::error::{ChannelError, Result};
use chassis_core::event_loop::SingleThreadEventLoop;
use chassis_core::executor::{EventExecutor, Executor};
use chassis_core::message::Message;
use chassis_core::outbound::OutboundBuffer;
use chassis_transport::channel::Channel;
use chassis_transport::context::HandlerContext;
use chassis_transport::handler::{ChannelHandler, HandlerResult, InboundHandler};
use chassis_transport::transport::{ChannelMetadata, Transport};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn new_loop(name: &str) -> Executor {
    let event_loop: Executor = SingleThreadEventLoop::new(name).unwrap();
    event_loop
}

/// Run `f` on `event_loop` and wait for its result.
pub fn on_loop<T, F>(event_loop: &Executor, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = flume::bounded(1);
    event_loop
        .execute(Box::new(move || {
            let _ = tx.send(f());
        }))
        .unwrap();
    rx.recv_timeout(WAIT).unwrap()
}

/// Wait until every task queued on `event_loop` so far has run.
pub fn drain(event_loop: &Executor) {
    on_loop(event_loop, || ());
}

/// Transport double that records which hooks ran, in order.
pub struct RecordingTransport {
    pub hooks: Mutex<Vec<&'static str>>,
    pub written: Mutex<Vec<Message>>,
    open: AtomicBool,
    active: AtomicBool,
    compatible: AtomicBool,
    /// Become active when bound or connected.
    activate_on_bind: AtomicBool,
    activate_on_connect: AtomicBool,
    has_disconnect: bool,
    fail_write: Mutex<Option<ChannelError>>,
    local: Mutex<Option<Endpoint>>,
    remote: Mutex<Option<Endpoint>>,
    /// Executor handed out by `prepare_to_close`.
    close_on: Mutex<Option<Executor>>,
    /// Names of the threads `do_close` ran on.
    pub close_threads: Mutex<Vec<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            active: AtomicBool::new(false),
            compatible: AtomicBool::new(true),
            activate_on_bind: AtomicBool::new(true),
            activate_on_connect: AtomicBool::new(true),
            has_disconnect: true,
            fail_write: Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            close_on: Mutex::new(None),
            close_threads: Mutex::new(Vec::new()),
        }
    }

    /// Already active before registration (an accepted connection).
    pub fn active() -> Self {
        let transport = Self::new();
        transport.active.store(true, Ordering::Release);
        transport
    }

    pub fn incompatible() -> Self {
        let transport = Self::new();
        transport.compatible.store(false, Ordering::Release);
        transport
    }

    /// Connects never complete on their own.
    pub fn slow_connect() -> Self {
        let transport = Self::new();
        transport.activate_on_connect.store(false, Ordering::Release);
        transport
    }

    pub fn without_disconnect() -> Self {
        Self {
            has_disconnect: false,
            ..Self::active()
        }
    }

    pub fn fail_writes_with(&self, cause: ChannelError) {
        *self.fail_write.lock() = Some(cause);
    }

    /// Run `do_close` on `executor` instead of the channel's loop.
    pub fn close_on(&self, executor: Executor) {
        *self.close_on.lock() = Some(executor);
    }

    pub fn hooks(&self) -> Vec<&'static str> {
        self.hooks.lock().clone()
    }

    pub fn count(&self, hook: &str) -> usize {
        self.hooks.lock().iter().filter(|h| **h == hook).count()
    }

    /// Written messages that are `T`, in write order.
    pub fn written_as<T: Any + Clone>(&self) -> Vec<T> {
        self.written
            .lock()
            .iter()
            .filter_map(|m| m.downcast_ref::<T>().cloned())
            .collect()
    }

    fn record(&self, hook: &'static str) {
        self.hooks.lock().push(hook);
    }
}

impl Transport for RecordingTransport {
    fn metadata(&self) -> ChannelMetadata {
        ChannelMetadata::new(self.has_disconnect)
    }

    fn is_compatible(&self, _event_loop: &dyn EventExecutor) -> bool {
        self.compatible.load(Ordering::Acquire)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.is_open() && self.active.load(Ordering::Acquire)
    }

    fn local_address(&self) -> Option<Endpoint> {
        self.local.lock().clone()
    }

    fn remote_address(&self) -> Option<Endpoint> {
        self.remote.lock().clone()
    }

    fn do_register(&self, _channel: &Channel) -> Result<()> {
        self.record("register");
        Ok(())
    }

    fn do_bind(&self, _channel: &Channel, local: &Endpoint) -> Result<()> {
        self.record("bind");
        *self.local.lock() = Some(local.clone());
        if self.activate_on_bind.load(Ordering::Acquire) {
            self.active.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn do_connect(&self, _channel: &Channel, remote: &Endpoint, _local: Option<&Endpoint>) -> Result<()> {
        self.record("connect");
        *self.remote.lock() = Some(remote.clone());
        if self.activate_on_connect.load(Ordering::Acquire) {
            self.active.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn do_disconnect(&self, _channel: &Channel) -> Result<()> {
        self.record("disconnect");
        self.active.store(false, Ordering::Release);
        Ok(())
    }

    fn do_close(&self, _channel: &Channel) -> Result<()> {
        self.record("close");
        let thread = std::thread::current().name().unwrap_or("?").to_string();
        self.close_threads.lock().push(thread);
        self.active.store(false, Ordering::Release);
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn do_deregister(&self, _channel: &Channel) -> Result<()> {
        self.record("deregister");
        Ok(())
    }

    fn do_begin_read(&self, _channel: &Channel) -> Result<()> {
        self.record("begin_read");
        Ok(())
    }

    fn do_write(&self, _channel: &Channel, buffer: &OutboundBuffer) -> Result<()> {
        self.record("write");
        if let Some(cause) = self.fail_write.lock().clone() {
            return Err(cause);
        }
        while let Some(entry) = buffer.pop_flushed() {
            self.written.lock().push(entry.message);
            entry.promise.try_success();
        }
        Ok(())
    }

    fn prepare_to_close(&self) -> Option<Executor> {
        self.close_on.lock().clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Inbound handler that reports every event it sees, then forwards it.
pub struct EventRecorder {
    events: flume::Sender<String>,
}

impl EventRecorder {
    pub fn new() -> (Self, flume::Receiver<String>) {
        let (tx, rx) = flume::unbounded();
        (Self { events: tx }, rx)
    }

    /// Recorder reporting into an existing channel, for handlers created in
    /// an initializer.
    pub fn with_sender(events: flume::Sender<String>) -> Self {
        Self { events }
    }

    fn note(&self, event: impl Into<String>) {
        let _ = self.events.send(event.into());
    }
}

impl ChannelHandler for EventRecorder {
    fn handler_added(&self, _ctx: &HandlerContext) -> HandlerResult {
        self.note("added");
        Ok(())
    }

    fn handler_removed(&self, _ctx: &HandlerContext) -> HandlerResult {
        self.note("removed");
        Ok(())
    }
}

impl InboundHandler for EventRecorder {
    fn channel_registered(&self, ctx: &HandlerContext) -> HandlerResult {
        self.note("registered");
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &HandlerContext) -> HandlerResult {
        self.note("unregistered");
        ctx.fire_channel_unregistered();
        Ok(())
    }

    fn channel_active(&self, ctx: &HandlerContext) -> HandlerResult {
        self.note("active");
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &HandlerContext) -> HandlerResult {
        self.note("inactive");
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn channel_read(&self, ctx: &HandlerContext, msg: Message) -> HandlerResult {
        match msg.downcast_ref::<&'static str>() {
            Some(text) => self.note(format!("read:{text}")),
            None => self.note("read"),
        }
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn channel_writability_changed(&self, ctx: &HandlerContext) -> HandlerResult {
        self.note("writability");
        ctx.fire_channel_writability_changed();
        Ok(())
    }

    fn exception_caught(&self, ctx: &HandlerContext, cause: ChannelError) -> HandlerResult {
        self.note(format!("exception:{cause}"));
        ctx.fire_exception_caught(cause);
        Ok(())
    }
}

/// Collect events until `until` shows up or the wait runs out.
pub fn events_until(rx: &flume::Receiver<String>, until: &str) -> Vec<String> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.recv_timeout(WAIT) {
        let done = event == until;
        seen.push(event);
        if done {
            break;
        }
    }
    seen
}

/// Events queued right now, without waiting.
pub fn events_now(rx: &flume::Receiver<String>) -> Vec<String> {
    rx.try_iter().collect()
}

pub fn recording_channel(transport: RecordingTransport) -> Channel {
    Channel::new(transport, chassis_core::options::ChannelConfig::default())
}

pub fn transport_of(channel: &Channel) -> &RecordingTransport {
    channel.transport_as::<RecordingTransport>().unwrap()
}

pub fn shutdown(event_loop: &Executor) {
    event_loop.shutdown_gracefully();
    assert!(event_loop.await_termination(WAIT));
}
