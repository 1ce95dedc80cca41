//! Channel handle.
//!
//! A `Channel` is a cheap, clonable handle to one I/O endpoint: its id,
//! configuration, pipeline, transport and registration state. Equality is
//! identity; ordering and hashing use the id.
//!
//! User-facing operations (`bind`, `write`, `close`, ...) enter the pipeline
//! at the tail. The privileged state transitions behind them live in
//! [`Unsafe`](crate::internal::Unsafe), reachable through `unsafe_ops()`.

use crate::internal::{Unsafe, UnsafeState};
use crate::pipeline::Pipeline;
use crate::transport::{ChannelMetadata, Transport};
use chassis_core::endpoint::Endpoint;
use chassis_core::error::{ChannelError, Result};
use chassis_core::executor::Executor;
use chassis_core::ids::ChannelId;
use chassis_core::message::Message;
use chassis_core::options::ChannelConfig;
use chassis_core::outbound::{OutboundBuffer, WritabilityListener};
use chassis_core::promise::{Promise, VoidFailureHook};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tracing::warn;

/// A stored attribute value.
pub type AttrValue = Arc<dyn Any + Send + Sync>;

pub(crate) struct ChannelInner {
    id: ChannelId,
    parent: Option<Weak<ChannelInner>>,
    transport: Box<dyn Transport>,
    config: Arc<ChannelConfig>,
    pipeline: Pipeline,
    event_loop: RwLock<Option<Executor>>,
    pub(crate) state: UnsafeState,
    close_future: Promise,
    void_promise: Promise,
    unsafe_void: Promise,
    local_address: Mutex<Option<Endpoint>>,
    remote_address: Mutex<Option<Endpoint>>,
    attrs: Mutex<HashMap<&'static str, AttrValue>>,
    /// Self-reference held while registered, so a registered channel stays
    /// alive without user handles.
    pub(crate) keep_alive: Mutex<Option<Channel>>,
}

impl ChannelInner {
    pub(crate) fn current_event_loop(&self) -> Option<Executor> {
        self.event_loop.read().clone()
    }

    pub(crate) fn set_event_loop(&self, event_loop: Executor) {
        *self.event_loop.write() = Some(event_loop);
    }
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// New unregistered channel driven by `transport`.
    pub fn new<T: Transport>(transport: T, config: ChannelConfig) -> Self {
        Self::build(None, Box::new(transport), config)
    }

    /// New unregistered channel accepted by (or otherwise owned by) `parent`.
    pub fn with_parent<T: Transport>(parent: &Channel, transport: T, config: ChannelConfig) -> Self {
        Self::build(
            Some(Arc::downgrade(&parent.inner)),
            Box::new(transport),
            config,
        )
    }

    fn build(
        parent: Option<Weak<ChannelInner>>,
        transport: Box<dyn Transport>,
        config: ChannelConfig,
    ) -> Self {
        let id = ChannelId::next();
        let config = Arc::new(config);
        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let on_writability: WritabilityListener = {
                let weak = weak.clone();
                Box::new(move |invoke_later: bool| {
                    if let Some(inner) = weak.upgrade() {
                        Channel::from_inner(inner).writability_changed(invoke_later);
                    }
                })
            };
            let on_void_failure: VoidFailureHook = {
                let weak = weak.clone();
                Box::new(move |cause: ChannelError| {
                    if let Some(inner) = weak.upgrade() {
                        inner.pipeline.fire_exception_caught(cause);
                    }
                })
            };
            let buffer = Arc::new(OutboundBuffer::new(Arc::clone(&config), on_writability));
            ChannelInner {
                id,
                parent,
                transport,
                config: Arc::clone(&config),
                pipeline: Pipeline::new(weak.clone()),
                event_loop: RwLock::new(None),
                state: UnsafeState::new(buffer),
                close_future: Promise::close_future(id, None),
                void_promise: Promise::void(id, Some(on_void_failure)),
                unsafe_void: Promise::void(id, None),
                local_address: Mutex::new(None),
                remote_address: Mutex::new(None),
                attrs: Mutex::new(HashMap::new()),
                keep_alive: Mutex::new(None),
            }
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &ChannelInner {
        &self.inner
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn parent(&self) -> Option<Channel> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Channel::from_inner)
    }

    pub fn metadata(&self) -> ChannelMetadata {
        self.inner.transport.metadata()
    }

    pub fn config(&self) -> &Arc<ChannelConfig> {
        &self.inner.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub fn transport(&self) -> &dyn Transport {
        self.inner.transport.as_ref()
    }

    /// The transport, if it is a `T`.
    pub fn transport_as<T: Transport>(&self) -> Option<&T> {
        self.inner.transport.as_any().downcast_ref::<T>()
    }

    /// The event loop this channel is bound to.
    pub fn event_loop(&self) -> Result<Executor> {
        self.inner
            .current_event_loop()
            .ok_or_else(|| ChannelError::illegal_state("channel not registered to an event loop"))
    }

    /// Privileged state transitions. Call only from the channel's event loop.
    pub fn unsafe_ops(&self) -> Unsafe<'_> {
        Unsafe::new(self)
    }

    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn outbound_buffer(&self) -> Option<Arc<OutboundBuffer>> {
        self.inner.state.outbound_buffer()
    }

    // ---- state ---------------------------------------------------------

    pub fn is_registered(&self) -> bool {
        self.inner.state.is_registered()
    }

    pub fn is_open(&self) -> bool {
        self.inner.transport.is_open()
    }

    pub fn is_active(&self) -> bool {
        self.inner.transport.is_active()
    }

    /// False while the pending outbound bytes are above the high water mark,
    /// and always false once the channel started closing.
    pub fn is_writable(&self) -> bool {
        self.outbound_buffer().is_some_and(|buffer| buffer.is_writable())
    }

    /// Bytes that can still be queued before the channel turns unwritable.
    pub fn bytes_before_unwritable(&self) -> u64 {
        self.outbound_buffer()
            .map_or(0, |buffer| buffer.bytes_before_unwritable())
    }

    /// Bytes that must drain before the channel turns writable again.
    pub fn bytes_before_writable(&self) -> u64 {
        self.outbound_buffer()
            .map_or(u64::MAX, |buffer| buffer.bytes_before_writable())
    }

    pub fn local_address(&self) -> Option<Endpoint> {
        let mut cached = self.inner.local_address.lock();
        if cached.is_none() {
            *cached = self.inner.transport.local_address();
        }
        cached.clone()
    }

    pub fn remote_address(&self) -> Option<Endpoint> {
        let mut cached = self.inner.remote_address.lock();
        if cached.is_none() {
            *cached = self.inner.transport.remote_address();
        }
        cached.clone()
    }

    pub fn invalidate_local_address(&self) {
        self.inner.local_address.lock().take();
    }

    pub fn invalidate_remote_address(&self) {
        self.inner.remote_address.lock().take();
    }

    // ---- promises ------------------------------------------------------

    /// Completes once the channel is closed. Never fails.
    pub fn close_future(&self) -> ChannelFuture {
        ChannelFuture::new(self.clone(), self.inner.close_future.clone())
    }

    /// Shared promise for fire-and-forget writes. Failures reported to it are
    /// fired through the pipeline as exceptions.
    pub fn void_promise(&self) -> Promise {
        self.inner.void_promise.clone()
    }

    pub(crate) fn unsafe_void_promise(&self) -> Promise {
        self.inner.unsafe_void.clone()
    }

    pub(crate) fn close_promise(&self) -> &Promise {
        &self.inner.close_future
    }

    pub fn new_promise(&self) -> Promise {
        Promise::new(self.id(), self.inner.current_event_loop())
    }

    pub fn new_succeeded_future(&self) -> ChannelFuture {
        let promise = Promise::succeeded(self.id(), self.inner.current_event_loop());
        ChannelFuture::new(self.clone(), promise)
    }

    pub fn new_failed_future(&self, cause: ChannelError) -> ChannelFuture {
        let promise = Promise::failed(self.id(), self.inner.current_event_loop(), cause);
        ChannelFuture::new(self.clone(), promise)
    }

    // ---- outbound operations -------------------------------------------

    pub fn bind(&self, local: Endpoint) -> ChannelFuture {
        self.future(self.pipeline().bind(local))
    }

    pub fn connect(&self, remote: Endpoint) -> ChannelFuture {
        self.future(self.pipeline().connect(remote, None))
    }

    pub fn connect_with_local(&self, remote: Endpoint, local: Endpoint) -> ChannelFuture {
        self.future(self.pipeline().connect(remote, Some(local)))
    }

    pub fn disconnect(&self) -> ChannelFuture {
        self.future(self.pipeline().disconnect())
    }

    pub fn close(&self) -> ChannelFuture {
        self.future(self.pipeline().close())
    }

    pub fn deregister(&self) -> ChannelFuture {
        self.future(self.pipeline().deregister())
    }

    pub fn read(&self) -> &Self {
        self.pipeline().read();
        self
    }

    pub fn write(&self, msg: Message) -> ChannelFuture {
        self.future(self.pipeline().write(msg))
    }

    /// Write with a caller-supplied promise.
    pub fn write_with(&self, msg: Message, promise: Promise) -> Result<ChannelFuture> {
        let promise = self.pipeline().write_with(msg, promise)?;
        Ok(self.future(promise))
    }

    pub fn write_and_flush(&self, msg: Message) -> ChannelFuture {
        self.future(self.pipeline().write_and_flush(msg))
    }

    pub fn write_and_flush_with(&self, msg: Message, promise: Promise) -> Result<ChannelFuture> {
        let promise = self.pipeline().write_and_flush_with(msg, promise)?;
        Ok(self.future(promise))
    }

    pub fn flush(&self) -> &Self {
        self.pipeline().flush();
        self
    }

    fn future(&self, promise: Promise) -> ChannelFuture {
        ChannelFuture::new(self.clone(), promise)
    }

    // ---- attributes ----------------------------------------------------

    pub fn attr<T: Any + Send + Sync>(&self, key: &'static str) -> Option<Arc<T>> {
        let value = self.inner.attrs.lock().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Store `value` under `key`, returning the previous value.
    pub fn set_attr<T: Any + Send + Sync>(&self, key: &'static str, value: T) -> Option<AttrValue> {
        self.set_attr_value(key, Arc::new(value))
    }

    pub fn set_attr_value(&self, key: &'static str, value: AttrValue) -> Option<AttrValue> {
        self.inner.attrs.lock().insert(key, value)
    }

    pub fn remove_attr(&self, key: &'static str) -> Option<AttrValue> {
        self.inner.attrs.lock().remove(key)
    }

    pub fn has_attr(&self, key: &'static str) -> bool {
        self.inner.attrs.lock().contains_key(key)
    }

    // ---- internal ------------------------------------------------------

    /// Writability crossed a water mark.
    fn writability_changed(&self, invoke_later: bool) {
        if !invoke_later {
            self.pipeline().fire_channel_writability_changed();
            return;
        }
        match self.inner.current_event_loop() {
            Some(event_loop) => {
                let channel = self.clone();
                let fire = Box::new(move || {
                    channel.pipeline().fire_channel_writability_changed();
                });
                if let Err(e) = event_loop.execute(fire) {
                    warn!(
                        "[Channel] Dropped writability change of {}: {}",
                        self, e
                    );
                }
            }
            None => {
                self.pipeline().fire_channel_writability_changed();
            }
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Channel {}

impl Hash for Channel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl PartialOrd for Channel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Channel {
    fn cmp(&self, other: &Self) -> Ordering {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return Ordering::Equal;
        }
        self.inner.id.cmp(&other.inner.id)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.inner.id.as_short_text();
        match (self.local_address(), self.remote_address()) {
            (Some(local), Some(remote)) => {
                let sep = if self.is_active() { '-' } else { '!' };
                write!(f, "[id: 0x{id}, L:{local} {sep} R:{remote}]")
            }
            (Some(local), None) => write!(f, "[id: 0x{id}, L:{local}]"),
            (None, Some(remote)) => write!(f, "[id: 0x{id}, R:{remote}]"),
            (None, None) => write!(f, "[id: 0x{id}]"),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("registered", &self.is_registered())
            .field("open", &self.is_open())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Non-owning channel handle.
#[derive(Clone, Default)]
pub struct WeakChannel {
    inner: Weak<ChannelInner>,
}

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(Channel::from_inner)
    }
}

impl fmt::Debug for WeakChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakChannel")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// The outcome of an operation on a channel, together with that channel.
#[derive(Clone)]
pub struct ChannelFuture {
    channel: Channel,
    promise: Promise,
}

impl ChannelFuture {
    pub fn new(channel: Channel, promise: Promise) -> Self {
        Self { channel, promise }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn promise(&self) -> &Promise {
        &self.promise
    }

    pub fn into_promise(self) -> Promise {
        self.promise
    }

    /// Block until done and return the outcome as an error if it failed.
    pub fn sync(&self) -> Result<&Self> {
        self.promise.wait()?;
        Ok(self)
    }

    /// Close the channel if this operation fails.
    pub fn add_close_on_failure(&self) -> &Self {
        let channel = self.channel.clone();
        self.promise.add_listener(move |promise| {
            if !promise.is_success() {
                channel.close();
            }
        });
        self
    }
}

impl Deref for ChannelFuture {
    type Target = Promise;

    fn deref(&self) -> &Promise {
        &self.promise
    }
}

impl Future for ChannelFuture {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.promise).poll(cx)
    }
}

impl fmt::Debug for ChannelFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFuture")
            .field("channel", &self.channel.id())
            .field("promise", &self.promise)
            .finish()
    }
}
