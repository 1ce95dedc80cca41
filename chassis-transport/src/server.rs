//! Server bootstrap and the acceptor that hands accepted children to the
//! child group.
//!
//! A server transport delivers each accepted child as a `Channel` message
//! through the server channel's pipeline. The acceptor at the end of that
//! pipeline seeds the child with the child handler, options and attributes,
//! and registers it with the child group.

use crate::bootstrap::{apply_attrs, set_once, AttrValue, BootstrapBase, OptionMap};
use crate::channel::{Channel, ChannelFuture};
use crate::context::HandlerContext;
use crate::event_loop::EventLoopGroup;
use crate::handler::{ChannelHandler, Handler, HandlerResult, InboundHandler};
use crate::transport::Transport;
use chassis_core::endpoint::Endpoint;
use chassis_core::error::{ChannelError, Result};
use chassis_core::message::Message;
use chassis_core::options::{ChannelConfig, ChannelOption, OptionValue};
use hashbrown::HashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// How long the acceptor stops reading after an accept failure.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Bootstrap for server channels.
#[derive(Default)]
pub struct ServerBootstrap {
    base: BootstrapBase,
    child_group: OnceCell<Arc<EventLoopGroup>>,
    child_handler: OnceCell<Handler>,
    child_options: Mutex<OptionMap>,
    child_attrs: Mutex<HashMap<&'static str, AttrValue>>,
}

impl ServerBootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base(&self) -> &BootstrapBase {
        &self.base
    }

    /// Group for the server channel. Children use it too unless
    /// `child_group` is set.
    pub fn group(&self, group: Arc<EventLoopGroup>) -> Result<&Self> {
        self.base.set_group(group)?;
        Ok(self)
    }

    pub fn child_group(&self, group: Arc<EventLoopGroup>) -> Result<&Self> {
        set_once(&self.child_group, group, "child_group")?;
        Ok(self)
    }

    pub fn channel_factory<F>(&self, factory: F) -> Result<&Self>
    where
        F: Fn() -> Result<Channel> + Send + Sync + 'static,
    {
        self.base.set_channel_factory(Arc::new(factory))?;
        Ok(self)
    }

    /// Channel factory building each server channel around `new_transport()`.
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

    /// Handler for the server channel itself.
    pub fn handler(&self, handler: Handler) -> Result<&Self> {
        self.base.set_handler(handler)?;
        Ok(self)
    }

    /// Handler installed on every accepted child.
    pub fn child_handler(&self, handler: Handler) -> Result<&Self> {
        set_once(&self.child_handler, handler, "child_handler")?;
        Ok(self)
    }

    pub fn option(&self, option: ChannelOption, value: Option<OptionValue>) -> &Self {
        self.base.set_option(option, value);
        self
    }

    pub fn attr<T: Any + Send + Sync>(&self, key: &'static str, value: Option<T>) -> &Self {
        self.base
            .set_attr(key, value.map(|v| Arc::new(v) as AttrValue));
        self
    }

    /// Option applied to every accepted child; `None` removes it.
    pub fn child_option(&self, option: ChannelOption, value: Option<OptionValue>) -> &Self {
        self.child_options.lock().set(option, value);
        self
    }

    /// Attribute stored on every accepted child; `None` removes it.
    pub fn child_attr<T: Any + Send + Sync>(&self, key: &'static str, value: Option<T>) -> &Self {
        let mut attrs = self.child_attrs.lock();
        match value {
            Some(value) => {
                attrs.insert(key, Arc::new(value) as AttrValue);
            }
            None => {
                attrs.remove(key);
            }
        }
        self
    }

    pub fn configured_child_group(&self) -> Option<&Arc<EventLoopGroup>> {
        self.child_group.get()
    }

    pub fn configured_child_handler(&self) -> Option<&Handler> {
        self.child_handler.get()
    }

    /// Group, channel factory and child handler are required. A missing child
    /// group falls back to the parent group.
    pub fn validate(&self) -> Result<()> {
        self.base.validate()?;
        if self.child_handler.get().is_none() {
            return Err(ChannelError::illegal_state("child_handler not set"));
        }
        if self.child_group.get().is_none() {
            warn!("[Bootstrap] child_group is not set. Using the parent group instead.");
            if let Some(group) = self.base.group() {
                // A concurrent child_group() call may win; either value is fine.
                let _ = self.child_group.set(Arc::clone(group));
            }
        }
        Ok(())
    }

    /// Create and register a server channel without binding it.
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

    fn init(&self, channel: &Channel) -> Result<()> {
        self.base.options_snapshot().apply(channel);
        apply_attrs(channel, &self.base.attrs_snapshot());

        let pipeline = channel.pipeline();
        if let Some(handler) = self.base.handler() {
            pipeline.add_last("", handler.clone())?;
        }
        let child_group = self
            .child_group
            .get()
            .or_else(|| self.base.group())
            .cloned()
            .ok_or_else(|| ChannelError::illegal_state("child_group not set"))?;
        let child_handler = self
            .child_handler
            .get()
            .cloned()
            .ok_or_else(|| ChannelError::illegal_state("child_handler not set"))?;
        let acceptor = Acceptor {
            child_group,
            child_handler,
            child_options: self.child_options.lock().clone(),
            child_attrs: self.child_attrs.lock().clone(),
        };
        pipeline.add_last("", Handler::inbound(acceptor))?;
        Ok(())
    }
}

impl Clone for ServerBootstrap {
    fn clone(&self) -> Self {
        Self {
            base: self.base.duplicate(),
            child_group: self.child_group.clone(),
            child_handler: self.child_handler.clone(),
            child_options: Mutex::new(self.child_options.lock().clone()),
            child_attrs: Mutex::new(self.child_attrs.lock().clone()),
        }
    }
}

impl fmt::Display for ServerBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServerBootstrap(")?;
        self.base.fmt_fields(f)?;
        if let Some(group) = self.child_group.get() {
            write!(f, ", child_group: {} loops", group.len())?;
        }
        let options = self.child_options.lock().len();
        if options > 0 {
            write!(f, ", child_options: {options}")?;
        }
        let attrs = self.child_attrs.lock().len();
        if attrs > 0 {
            write!(f, ", child_attrs: {attrs}")?;
        }
        if let Some(handler) = self.child_handler.get() {
            write!(f, ", child_handler: {}", handler.type_name())?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for ServerBootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Last handler of a server pipeline: seeds and registers accepted children.
pub struct Acceptor {
    child_group: Arc<EventLoopGroup>,
    child_handler: Handler,
    child_options: OptionMap,
    child_attrs: HashMap<&'static str, AttrValue>,
}

impl Acceptor {
    fn accept(&self, child: &Channel) {
        if let Err(e) = child.pipeline().add_last("", self.child_handler.clone()) {
            force_close(child, &e);
            return;
        }
        self.child_options.apply(child);
        apply_attrs(child, &self.child_attrs);

        let registration = self.child_group.register(child);
        let registered = child.clone();
        registration.add_listener(move |outcome| {
            if let Some(cause) = outcome.cause() {
                force_close(&registered, &cause);
            }
        });
    }
}

impl ChannelHandler for Acceptor {}

impl InboundHandler for Acceptor {
    fn channel_read(&self, ctx: &HandlerContext, msg: Message) -> HandlerResult {
        match msg.downcast::<Channel>() {
            Ok(child) => self.accept(&child),
            Err(other) => {
                ctx.fire_channel_read(other);
            }
        }
        Ok(())
    }

    fn exception_caught(&self, ctx: &HandlerContext, cause: ChannelError) -> HandlerResult {
        if let Some(channel) = ctx.channel() {
            let config = channel.config();
            if config.set_auto_read(false) {
                // Stop accepting for a while so the failure does not spin.
                let resume = channel.downgrade();
                let scheduled = channel.event_loop().and_then(|event_loop| {
                    event_loop.schedule(
                        ACCEPT_BACKOFF,
                        Box::new(move || {
                            if let Some(channel) = resume.upgrade() {
                                if !channel.config().set_auto_read(true) {
                                    channel.read();
                                }
                            }
                        }),
                    )
                });
                if let Err(e) = scheduled {
                    warn!("[Bootstrap] Could not schedule auto-read resumption: {}", e);
                    config.set_auto_read(true);
                }
            }
        }
        ctx.fire_exception_caught(cause);
        Ok(())
    }
}

fn force_close(child: &Channel, cause: &ChannelError) {
    child.unsafe_ops().close_forcibly();
    warn!("[Bootstrap] Failed to register an accepted channel {}: {}", child, cause);
}
