//! Channel bootstrapping.
//!
//! `BootstrapBase` holds what every bootstrap needs (group, channel factory,
//! local address, handler, options, attributes) and the registration
//! sequencing shared by bind and connect. `Bootstrap` (clients) and
//! [`ServerBootstrap`](crate::server::ServerBootstrap) compose it and add
//! their own pipeline seeding.
//!
//! Bind and connect never race registration: they are submitted to the
//! channel's loop only once registration succeeded, as a task queued behind
//! the registered event.

use crate::channel::{Channel, ChannelFuture};
use crate::event_loop::EventLoopGroup;
use crate::handler::Handler;
use crate::transport::Transport;
use chassis_core::endpoint::Endpoint;
use chassis_core::error::{ChannelError, Result};
use chassis_core::global::GlobalEventExecutor;
use chassis_core::options::{ChannelConfig, ChannelOption, OptionValue};
use chassis_core::promise::Promise;
use hashbrown::HashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Produces one new, unregistered channel per call.
pub type ChannelFactory = Arc<dyn Fn() -> Result<Channel> + Send + Sync>;

pub(crate) use crate::channel::AttrValue;

/// Option entries in insertion order.
#[derive(Default, Clone)]
pub(crate) struct OptionMap {
    entries: Vec<(ChannelOption, OptionValue)>,
}

impl OptionMap {
    /// Upsert, or remove with `None`.
    pub(crate) fn set(&mut self, option: ChannelOption, value: Option<OptionValue>) {
        let existing = self.entries.iter().position(|(o, _)| *o == option);
        match (existing, value) {
            (Some(i), Some(value)) => self.entries[i].1 = value,
            (None, Some(value)) => self.entries.push((option, value)),
            (Some(i), None) => {
                self.entries.remove(i);
            }
            (None, None) => {}
        }
    }

    pub(crate) fn get(&self, option: ChannelOption) -> Option<&OptionValue> {
        self.entries
            .iter()
            .find(|(o, _)| *o == option)
            .map(|(_, v)| v)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Apply every entry to `channel`'s config; failures are logged.
    pub(crate) fn apply(&self, channel: &Channel) {
        for (option, value) in &self.entries {
            match channel.config().set_option(*option, value.clone()) {
                Ok(true) => {}
                Ok(false) => warn!("[Bootstrap] Unknown channel option '{}' for {}", option, channel),
                Err(e) => warn!(
                    "[Bootstrap] Failed to set channel option '{}' with value {:?} for {}: {}",
                    option, value, channel, e
                ),
            }
        }
    }
}

pub(crate) fn apply_attrs(channel: &Channel, attrs: &HashMap<&'static str, AttrValue>) {
    for (key, value) in attrs {
        channel.set_attr_value(key, Arc::clone(value));
    }
}

/// Set `cell` once; a second attempt fails and keeps the first value.
pub(crate) fn set_once<T>(cell: &OnceCell<T>, value: T, what: &str) -> Result<()> {
    cell.set(value)
        .map_err(|_| ChannelError::illegal_state(format!("{what} set already")))
}

/// Shared bootstrap state and sequencing.
#[derive(Default)]
pub struct BootstrapBase {
    group: OnceCell<Arc<EventLoopGroup>>,
    channel_factory: OnceCell<ChannelFactory>,
    local_address: OnceCell<Endpoint>,
    handler: OnceCell<Handler>,
    options: Mutex<OptionMap>,
    attrs: Mutex<HashMap<&'static str, AttrValue>>,
}

impl BootstrapBase {
    pub fn set_group(&self, group: Arc<EventLoopGroup>) -> Result<()> {
        set_once(&self.group, group, "group")
    }

    pub fn set_channel_factory(&self, factory: ChannelFactory) -> Result<()> {
        set_once(&self.channel_factory, factory, "channel_factory")
    }

    pub fn set_local_address(&self, local: Endpoint) -> Result<()> {
        set_once(&self.local_address, local, "local_address")
    }

    pub fn set_handler(&self, handler: Handler) -> Result<()> {
        set_once(&self.handler, handler, "handler")
    }

    pub fn set_option(&self, option: ChannelOption, value: Option<OptionValue>) {
        self.options.lock().set(option, value);
    }

    pub fn set_attr(&self, key: &'static str, value: Option<AttrValue>) {
        let mut attrs = self.attrs.lock();
        match value {
            Some(value) => {
                attrs.insert(key, value);
            }
            None => {
                attrs.remove(key);
            }
        }
    }

    pub fn group(&self) -> Option<&Arc<EventLoopGroup>> {
        self.group.get()
    }

    pub fn channel_factory(&self) -> Option<&ChannelFactory> {
        self.channel_factory.get()
    }

    pub fn local_address(&self) -> Option<&Endpoint> {
        self.local_address.get()
    }

    pub fn handler(&self) -> Option<&Handler> {
        self.handler.get()
    }

    pub fn option(&self, option: ChannelOption) -> Option<OptionValue> {
        self.options.lock().get(option).cloned()
    }

    pub fn attr(&self, key: &'static str) -> Option<AttrValue> {
        self.attrs.lock().get(key).cloned()
    }

    pub(crate) fn options_snapshot(&self) -> OptionMap {
        self.options.lock().clone()
    }

    pub(crate) fn attrs_snapshot(&self) -> HashMap<&'static str, AttrValue> {
        self.attrs.lock().clone()
    }

    /// Copy of this configuration with independent option and attribute
    /// maps. The group, factory and handler are shared.
    pub fn duplicate(&self) -> Self {
        Self {
            group: self.group.clone(),
            channel_factory: self.channel_factory.clone(),
            local_address: self.local_address.clone(),
            handler: self.handler.clone(),
            options: Mutex::new(self.options_snapshot()),
            attrs: Mutex::new(self.attrs_snapshot()),
        }
    }

    /// Group and channel factory are both required.
    pub fn validate(&self) -> Result<()> {
        if self.group.get().is_none() {
            return Err(ChannelError::illegal_state("group not set"));
        }
        if self.channel_factory.get().is_none() {
            return Err(ChannelError::illegal_state("channel or channel_factory not set"));
        }
        Ok(())
    }

    /// Create a channel, seed it with `init` and register it with the group.
    ///
    /// A seeding failure force-closes the channel and yields a failed future
    /// notified on the global executor, since the channel has no loop yet.
    pub fn init_and_register<F>(&self, init: F) -> Result<ChannelFuture>
    where
        F: FnOnce(&Channel) -> Result<()>,
    {
        let factory = self
            .channel_factory
            .get()
            .ok_or_else(|| ChannelError::illegal_state("channel or channel_factory not set"))?;
        let group = self
            .group
            .get()
            .ok_or_else(|| ChannelError::illegal_state("group not set"))?;

        let channel = factory()?;
        if let Err(e) = init(&channel) {
            channel.unsafe_ops().close_forcibly();
            let failed = Promise::failed(channel.id(), Some(GlobalEventExecutor::instance()), e);
            return Ok(ChannelFuture::new(channel, failed));
        }

        let registration = group.register(&channel);
        if registration.cause().is_some() {
            if channel.is_registered() {
                channel.close();
            } else {
                channel.unsafe_ops().close_forcibly();
            }
        }
        Ok(registration)
    }

    /// Register a new channel and bind it to `local` once registered.
    pub fn do_bind<F>(&self, local: Endpoint, init: F) -> Result<ChannelFuture>
    where
        F: FnOnce(&Channel) -> Result<()>,
    {
        let registration = self.init_and_register(init)?;
        if registration.cause().is_some() {
            return Ok(registration);
        }
        debug!("[Bootstrap] Binding {} to {}", registration.channel(), local);
        Ok(after_registration(&registration, move |channel, promise| {
            channel.pipeline().bind_with(local, promise)
        }))
    }

    /// Register a new channel and connect it to `remote` once registered.
    pub fn do_connect<F>(
        &self,
        remote: Endpoint,
        local: Option<Endpoint>,
        init: F,
    ) -> Result<ChannelFuture>
    where
        F: FnOnce(&Channel) -> Result<()>,
    {
        let registration = self.init_and_register(init)?;
        if registration.cause().is_some() {
            return Ok(registration);
        }
        debug!("[Bootstrap] Connecting {} to {}", registration.channel(), remote);
        Ok(after_registration(&registration, move |channel, promise| {
            channel.pipeline().connect_with(remote, local, promise)
        }))
    }

    pub(crate) fn fmt_fields(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        if let Some(group) = self.group.get() {
            write!(f, "group: {} loops", group.len())?;
            sep = ", ";
        }
        if self.channel_factory.get().is_some() {
            write!(f, "{sep}channel_factory: set")?;
            sep = ", ";
        }
        if let Some(local) = self.local_address.get() {
            write!(f, "{sep}local_address: {local}")?;
            sep = ", ";
        }
        let options = self.options.lock().len();
        if options > 0 {
            write!(f, "{sep}options: {options}")?;
            sep = ", ";
        }
        let attrs = self.attrs.lock().len();
        if attrs > 0 {
            write!(f, "{sep}attrs: {attrs}")?;
            sep = ", ";
        }
        if let Some(handler) = self.handler.get() {
            write!(f, "{sep}handler: {}", handler.type_name())?;
        }
        Ok(())
    }
}

/// Run `op` on the channel's loop once `registration` succeeded.
///
/// The returned future is usable right away. If registration is still
/// pending its notifying executor is switched to the channel's loop once
/// that is known. A failed operation closes the channel.
fn after_registration<F>(registration: &ChannelFuture, op: F) -> ChannelFuture
where
    F: FnOnce(&Channel, Promise) -> Result<Promise> + Send + 'static,
{
    let channel = registration.channel().clone();
    let promise = channel.new_promise();

    if registration.is_done() {
        submit_to_loop(registration.promise().clone(), channel.clone(), promise.clone(), op);
    } else {
        let (pending_channel, pending_promise) = (channel.clone(), promise.clone());
        registration.add_listener(move |outcome| {
            if let Some(cause) = outcome.cause() {
                // No usable loop: fail directly.
                pending_promise.try_failure(cause);
                return;
            }
            if let Ok(event_loop) = pending_channel.event_loop() {
                pending_promise.set_executor(event_loop);
            }
            submit_to_loop(outcome.clone(), pending_channel, pending_promise, op);
        });
    }
    ChannelFuture::new(channel, promise)
}

fn submit_to_loop<F>(registration: Promise, channel: Channel, promise: Promise, op: F)
where
    F: FnOnce(&Channel, Promise) -> Result<Promise> + Send + 'static,
{
    let event_loop = match channel.event_loop() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            promise.try_failure(e);
            return;
        }
    };
    let task_promise = promise.clone();
    let submitted = event_loop.execute(Box::new(move || {
        if !registration.is_success() {
            task_promise.try_failure(registration.cause().unwrap_or(ChannelError::Closed));
            return;
        }
        match op(&channel, task_promise.clone()) {
            Ok(_) => {
                let closing = channel.clone();
                task_promise.add_listener(move |outcome| {
                    if !outcome.is_success() {
                        closing.close();
                    }
                });
            }
            Err(e) => {
                task_promise.try_failure(e);
                channel.close();
            }
        }
    }));
    if let Err(e) = submitted {
        promise.try_failure(e);
    }
}

/// Bootstrap for client channels.
///
/// ```rust,no_run
/// use chassis_core::endpoint::Endpoint;
/// use chassis_transport::bootstrap::Bootstrap;
/// use chassis_transport::event_loop::EventLoopGroup;
/// use chassis_transport::local::LocalTransport;
/// use chassis_transport::initializer::ChannelInitializer;
/// use std::sync::Arc;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let group = Arc::new(EventLoopGroup::new(1)?);
/// let bootstrap = Bootstrap::new();
/// bootstrap
///     .group(group)?
///     .transport(LocalTransport::new)?
///     .handler(ChannelInitializer::handler(|_channel| Ok(())))?;
/// let channel = bootstrap.connect_to(Endpoint::local("echo"))?.sync()?.channel().clone();
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Bootstrap {
    base: BootstrapBase,
    remote_address: Mutex<Option<Endpoint>>,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base(&self) -> &BootstrapBase {
        &self.base
    }

    pub fn group(&self, group: Arc<EventLoopGroup>) -> Result<&Self> {
        self.base.set_group(group)?;
        Ok(self)
    }

    pub fn channel_factory<F>(&self, factory: F) -> Result<&Self>
    where
        F: Fn() -> Result<Channel> + Send + Sync + 'static,
    {
        self.base.set_channel_factory(Arc::new(factory))?;
        Ok(self)
    }

    /// Channel factory building each channel around `new_transport()` with a
    /// default config.
    pub fn transport<T, F>(&self, new_transport: F) -> Result<&Self>
    where
        T: Transport,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.channel_factory(move || Ok(Channel::new(new_transport(), ChannelConfig::default())))
    }

    pub fn local_address(&self, local: Endpoint) -> Result<&Self> {
        self.base.set_local_address(local)?;
        Ok(self)
    }

    pub fn handler(&self, handler: Handler) -> Result<&Self> {
        self.base.set_handler(handler)?;
        Ok(self)
    }

    /// Set an option applied to each new channel; `None` removes it.
    pub fn option(&self, option: ChannelOption, value: Option<OptionValue>) -> &Self {
        self.base.set_option(option, value);
        self
    }

    /// Set an attribute stored on each new channel; `None` removes it.
    pub fn attr<T: Any + Send + Sync>(&self, key: &'static str, value: Option<T>) -> &Self {
        self.base
            .set_attr(key, value.map(|v| Arc::new(v) as AttrValue));
        self
    }

    /// Default remote address for `connect()`.
    pub fn remote_address(&self, remote: Endpoint) -> &Self {
        *self.remote_address.lock() = Some(remote);
        self
    }

    /// Group, channel factory and handler are required.
    pub fn validate(&self) -> Result<()> {
        self.base.validate()?;
        if self.base.handler().is_none() {
            return Err(ChannelError::illegal_state("handler not set"));
        }
        Ok(())
    }

    /// Create and register a channel without binding or connecting it.
    pub fn register(&self) -> Result<ChannelFuture> {
        self.validate()?;
        self.base.init_and_register(|channel| self.init(channel))
    }

    /// Bind to the configured local address.
    pub fn bind(&self) -> Result<ChannelFuture> {
        self.validate()?;
        let local = self
            .base
            .local_address()
            .cloned()
            .ok_or_else(|| ChannelError::illegal_state("local_address not set"))?;
        self.base.do_bind(local, |channel| self.init(channel))
    }

    pub fn bind_to(&self, local: Endpoint) -> Result<ChannelFuture> {
        self.validate()?;
        self.base.do_bind(local, |channel| self.init(channel))
    }

    /// Connect to the configured remote address.
    pub fn connect(&self) -> Result<ChannelFuture> {
        let remote = self
            .remote_address
            .lock()
            .clone()
            .ok_or_else(|| ChannelError::illegal_state("remote_address not set"))?;
        self.connect_to(remote)
    }

    pub fn connect_to(&self, remote: Endpoint) -> Result<ChannelFuture> {
        self.validate()?;
        let local = self.base.local_address().cloned();
        self.base.do_connect(remote, local, |channel| self.init(channel))
    }

    pub fn connect_with_local(&self, remote: Endpoint, local: Endpoint) -> Result<ChannelFuture> {
        self.validate()?;
        self.base
            .do_connect(remote, Some(local), |channel| self.init(channel))
    }

    fn init(&self, channel: &Channel) -> Result<()> {
        if let Some(handler) = self.base.handler() {
            channel.pipeline().add_last("", handler.clone())?;
        }
        self.base.options_snapshot().apply(channel);
        apply_attrs(channel, &self.base.attrs_snapshot());
        Ok(())
    }
}

impl Clone for Bootstrap {
    /// Shallow copy: the group is shared, option and attribute maps are
    /// copied.
    fn clone(&self) -> Self {
        Self {
            base: self.base.duplicate(),
            remote_address: Mutex::new(self.remote_address.lock().clone()),
        }
    }
}

impl fmt::Display for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Bootstrap(")?;
        self.base.fmt_fields(f)?;
        if let Some(remote) = self.remote_address.lock().as_ref() {
            write!(f, ", remote_address: {remote}")?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_map_upserts_and_removes() {
        let mut options = OptionMap::default();
        options.set(ChannelOption::AutoRead, Some(OptionValue::Bool(false)));
        options.set(ChannelOption::AutoClose, Some(OptionValue::Bool(false)));
        options.set(ChannelOption::AutoRead, Some(OptionValue::Bool(true)));
        assert_eq!(options.len(), 2);
        assert_eq!(
            options.get(ChannelOption::AutoRead),
            Some(&OptionValue::Bool(true))
        );

        options.set(ChannelOption::AutoRead, None);
        assert_eq!(options.len(), 1);
        assert!(options.get(ChannelOption::AutoRead).is_none());
        options.set(ChannelOption::Broadcast, None);
        assert_eq!(options.len(), 1);
    }

    #[test]
    fn test_one_shot_setters_keep_first_value() {
        let bootstrap = Bootstrap::new();
        bootstrap.local_address(Endpoint::local("first")).unwrap();
        let err = bootstrap.local_address(Endpoint::local("second")).unwrap_err();
        assert!(err.to_string().contains("local_address set already"));
        assert_eq!(bootstrap.base().local_address(), Some(&Endpoint::local("first")));
    }

    #[test]
    fn test_bind_without_group_fails_before_creating_a_channel() {
        let bootstrap = Bootstrap::new();
        let created = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        bootstrap
            .channel_factory(move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(ChannelError::illegal_state("unused"))
            })
            .unwrap();
        let err = bootstrap.bind_to(Endpoint::local("nowhere")).unwrap_err();
        assert!(err.to_string().contains("group not set"));
        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clone_copies_maps_independently() {
        let bootstrap = Bootstrap::new();
        bootstrap.option(ChannelOption::AutoRead, Some(OptionValue::Bool(false)));
        bootstrap.attr("tenant", Some("a"));

        let copy = bootstrap.clone();
        copy.option(ChannelOption::AutoRead, None);
        copy.attr::<&str>("tenant", None);

        assert!(bootstrap.base().option(ChannelOption::AutoRead).is_some());
        assert!(bootstrap.base().attr("tenant").is_some());
        assert!(copy.base().option(ChannelOption::AutoRead).is_none());
        assert!(copy.base().attr("tenant").is_none());
    }
}
