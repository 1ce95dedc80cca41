//! Handler capability traits.
//!
//! A handler reacts to inbound events, intercepts outbound operations, or
//! both. Every callback has a default that forwards to the next handler, so
//! implementations only override what they care about.
//!
//! A returned `Err` (or a panic) from an inbound callback is redirected into
//! the pipeline's exception path; from an outbound callback it fails the
//! operation's promise.

use crate::context::HandlerContext;
use chassis_core::endpoint::Endpoint;
use chassis_core::error::{ChannelError, Result};
use chassis_core::message::Message;
use chassis_core::promise::Promise;
use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

pub type HandlerResult = Result<(), ChannelError>;

/// Lifecycle callbacks shared by all handlers.
pub trait ChannelHandler: Send + Sync + 'static {
    /// The handler was installed and the channel is registered.
    fn handler_added(&self, _ctx: &HandlerContext) -> HandlerResult {
        Ok(())
    }

    /// The handler was taken out of the pipeline.
    fn handler_removed(&self, _ctx: &HandlerContext) -> HandlerResult {
        Ok(())
    }
}

pub trait InboundHandler: ChannelHandler {
    fn channel_registered(&self, ctx: &HandlerContext) -> HandlerResult {
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &HandlerContext) -> HandlerResult {
        ctx.fire_channel_unregistered();
        Ok(())
    }

    fn channel_active(&self, ctx: &HandlerContext) -> HandlerResult {
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &HandlerContext) -> HandlerResult {
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn channel_read(&self, ctx: &HandlerContext, msg: Message) -> HandlerResult {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn channel_read_complete(&self, ctx: &HandlerContext) -> HandlerResult {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    fn user_event_triggered(&self, ctx: &HandlerContext, event: Message) -> HandlerResult {
        ctx.fire_user_event_triggered(event);
        Ok(())
    }

    fn channel_writability_changed(&self, ctx: &HandlerContext) -> HandlerResult {
        ctx.fire_channel_writability_changed();
        Ok(())
    }

    fn exception_caught(&self, ctx: &HandlerContext, cause: ChannelError) -> HandlerResult {
        ctx.fire_exception_caught(cause);
        Ok(())
    }
}

pub trait OutboundHandler: ChannelHandler {
    fn bind(&self, ctx: &HandlerContext, local: Endpoint, promise: Promise) -> HandlerResult {
        ctx.bind_with(local, promise)?;
        Ok(())
    }

    fn connect(
        &self,
        ctx: &HandlerContext,
        remote: Endpoint,
        local: Option<Endpoint>,
        promise: Promise,
    ) -> HandlerResult {
        ctx.connect_with(remote, local, promise)?;
        Ok(())
    }

    fn disconnect(&self, ctx: &HandlerContext, promise: Promise) -> HandlerResult {
        ctx.disconnect_with(promise)?;
        Ok(())
    }

    fn close(&self, ctx: &HandlerContext, promise: Promise) -> HandlerResult {
        ctx.close_with(promise)?;
        Ok(())
    }

    fn deregister(&self, ctx: &HandlerContext, promise: Promise) -> HandlerResult {
        ctx.deregister_with(promise)?;
        Ok(())
    }

    fn read(&self, ctx: &HandlerContext) -> HandlerResult {
        ctx.read();
        Ok(())
    }

    fn write(&self, ctx: &HandlerContext, msg: Message, promise: Promise) -> HandlerResult {
        ctx.write_with(msg, promise)?;
        Ok(())
    }

    fn flush(&self, ctx: &HandlerContext) -> HandlerResult {
        ctx.flush();
        Ok(())
    }
}

/// A handler together with its capability flags.
///
/// The capability set is fixed when the value is built; dispatch never asks
/// the handler again.
#[derive(Clone)]
pub struct Handler {
    common: Arc<dyn ChannelHandler>,
    inbound: Option<Arc<dyn InboundHandler>>,
    outbound: Option<Arc<dyn OutboundHandler>>,
    any: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Handler {
    /// Wrap an inbound-only handler.
    pub fn inbound<H: InboundHandler>(handler: H) -> Self {
        let handler = Arc::new(handler);
        Self {
            common: handler.clone(),
            inbound: Some(handler.clone()),
            outbound: None,
            any: handler,
            type_name: short_type_name::<H>(),
        }
    }

    /// Wrap an outbound-only handler.
    pub fn outbound<H: OutboundHandler>(handler: H) -> Self {
        let handler = Arc::new(handler);
        Self {
            common: handler.clone(),
            inbound: None,
            outbound: Some(handler.clone()),
            any: handler,
            type_name: short_type_name::<H>(),
        }
    }

    /// Wrap a handler with both capability sets.
    pub fn duplex<H: InboundHandler + OutboundHandler>(handler: H) -> Self {
        let handler = Arc::new(handler);
        Self {
            common: handler.clone(),
            inbound: Some(handler.clone()),
            outbound: Some(handler.clone()),
            any: handler,
            type_name: short_type_name::<H>(),
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound.is_some()
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    /// Unqualified type name of the wrapped handler.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The wrapped handler, if it is an `H`.
    pub fn downcast<H: Send + Sync + 'static>(&self) -> Option<Arc<H>> {
        Arc::clone(&self.any).downcast::<H>().ok()
    }

    /// True if both values wrap the same handler instance.
    pub fn ptr_eq(a: &Handler, b: &Handler) -> bool {
        Arc::ptr_eq(&a.any, &b.any)
    }

    pub(crate) fn common(&self) -> &dyn ChannelHandler {
        self.common.as_ref()
    }

    pub(crate) fn as_inbound(&self) -> Option<&dyn InboundHandler> {
        self.inbound.as_deref()
    }

    pub(crate) fn as_outbound(&self) -> Option<&dyn OutboundHandler> {
        self.outbound.as_deref()
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("type", &self.type_name)
            .field("inbound", &self.is_inbound())
            .field("outbound", &self.is_outbound())
            .finish()
    }
}

fn short_type_name<H>() -> &'static str {
    let full = type_name::<H>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reader;
    impl ChannelHandler for Reader {}
    impl InboundHandler for Reader {}

    struct Both;
    impl ChannelHandler for Both {}
    impl InboundHandler for Both {}
    impl OutboundHandler for Both {}

    #[test]
    fn test_capabilities_are_fixed_at_construction() {
        let inbound = Handler::inbound(Reader);
        assert!(inbound.is_inbound());
        assert!(!inbound.is_outbound());
        assert_eq!(inbound.type_name(), "Reader");

        let duplex = Handler::duplex(Both);
        assert!(duplex.is_inbound() && duplex.is_outbound());
    }

    #[test]
    fn test_downcast_and_identity() {
        let handler = Handler::inbound(Reader);
        assert!(handler.downcast::<Reader>().is_some());
        assert!(handler.downcast::<Both>().is_none());

        let clone = handler.clone();
        assert!(Handler::ptr_eq(&handler, &clone));
        assert!(!Handler::ptr_eq(&handler, &Handler::inbound(Reader)));
    }
}
