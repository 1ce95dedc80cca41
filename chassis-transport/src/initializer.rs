//! One-shot pipeline seeding.

use crate::channel::Channel;
use crate::context::HandlerContext;
use crate::handler::{ChannelHandler, Handler, HandlerResult, InboundHandler};
use chassis_core::error::{ChannelError, Result};
use tracing::warn;

type InitFn = Box<dyn Fn(&Channel) -> Result<()> + Send + Sync>;

/// Inbound handler that seeds a channel's pipeline once the channel is
/// registered, then takes itself out of the pipeline.
///
/// The same initializer may be installed on many channels (a server's child
/// handler is); `init` runs once per channel.
///
/// ```rust,no_run
/// use chassis_transport::initializer::ChannelInitializer;
///
/// let child_handler = ChannelInitializer::handler(|channel| {
///     channel.pipeline().add_last("decoder", my_decoder())?;
///     Ok(())
/// });
/// # fn my_decoder() -> chassis_transport::handler::Handler { unimplemented!() }
/// ```
pub struct ChannelInitializer {
    init: InitFn,
}

impl ChannelInitializer {
    pub fn new<F>(init: F) -> Self
    where
        F: Fn(&Channel) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            init: Box::new(init),
        }
    }

    /// Shorthand for `Handler::inbound(ChannelInitializer::new(init))`.
    pub fn handler<F>(init: F) -> Handler
    where
        F: Fn(&Channel) -> Result<()> + Send + Sync + 'static,
    {
        Handler::inbound(Self::new(init))
    }
}

impl ChannelHandler for ChannelInitializer {}

impl InboundHandler for ChannelInitializer {
    fn channel_registered(&self, ctx: &HandlerContext) -> HandlerResult {
        let channel = ctx.channel().ok_or(ChannelError::Closed)?;
        let pipeline = channel.pipeline();
        let outcome = (self.init)(&channel);
        pipeline.remove_context(ctx);
        match outcome {
            Ok(()) => {
                ctx.fire_channel_registered();
            }
            Err(e) => {
                warn!("[Pipeline] Failed to initialize a channel. Closing: {} ({})", channel, e);
                channel.close();
            }
        }
        Ok(())
    }

    fn exception_caught(&self, ctx: &HandlerContext, cause: ChannelError) -> HandlerResult {
        warn!(
            "[Pipeline] Failed to initialize a channel. Closing: {}",
            cause
        );
        ctx.close();
        Ok(())
    }
}
