//! Transport hooks.
//!
//! A `Transport` is the I/O half of a channel. The channel's internal
//! operations own every state transition and call into these hooks at fixed
//! points; a hook never fires lifecycle events itself. Inbound data is the
//! exception: a transport hands what it reads to `Pipeline::fire_channel_read`
//! once `do_begin_read` asked for it. Hooks are invoked on the
//! channel's event loop, except `do_close` when `prepare_to_close` hands out a
//! dedicated executor.

use crate::channel::Channel;
use chassis_core::endpoint::Endpoint;
use chassis_core::error::{ChannelError, Result};
use chassis_core::executor::{EventExecutor, Executor};
use chassis_core::message::Message;
use chassis_core::outbound::OutboundBuffer;
use std::any::Any;

/// Static properties of a transport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMetadata {
    has_disconnect: bool,
}

impl ChannelMetadata {
    pub const fn new(has_disconnect: bool) -> Self {
        Self { has_disconnect }
    }

    /// False for transports where disconnect means nothing more than close;
    /// the pipeline then turns every disconnect into a close.
    pub const fn has_disconnect(&self) -> bool {
        self.has_disconnect
    }
}

pub trait Transport: Send + Sync + 'static {
    fn metadata(&self) -> ChannelMetadata;

    /// True if this transport can be driven by `event_loop`.
    fn is_compatible(&self, event_loop: &dyn EventExecutor) -> bool;

    fn is_open(&self) -> bool;

    fn is_active(&self) -> bool;

    fn local_address(&self) -> Option<Endpoint>;

    fn remote_address(&self) -> Option<Endpoint>;

    fn do_register(&self, _channel: &Channel) -> Result<()> {
        Ok(())
    }

    fn do_bind(&self, channel: &Channel, local: &Endpoint) -> Result<()>;

    fn do_connect(
        &self,
        _channel: &Channel,
        remote: &Endpoint,
        _local: Option<&Endpoint>,
    ) -> Result<()> {
        Err(ChannelError::illegal_state(format!(
            "transport cannot connect to {remote}"
        )))
    }

    fn do_disconnect(&self, channel: &Channel) -> Result<()>;

    fn do_close(&self, channel: &Channel) -> Result<()>;

    fn do_deregister(&self, _channel: &Channel) -> Result<()> {
        Ok(())
    }

    /// Start delivering inbound data through the pipeline.
    fn do_begin_read(&self, channel: &Channel) -> Result<()>;

    /// Write as many flushed entries of `buffer` as possible.
    ///
    /// Written entries are taken out with `OutboundBuffer::remove` (or
    /// `pop_flushed`, completing the promise yourself).
    fn do_write(&self, channel: &Channel, buffer: &OutboundBuffer) -> Result<()>;

    /// Convert an outbound message into the representation `do_write` handles.
    fn filter_outbound_message(&self, msg: Message) -> Result<Message> {
        Ok(msg)
    }

    /// Executor on which `do_close` must run instead of the event loop.
    fn prepare_to_close(&self) -> Option<Executor> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}
