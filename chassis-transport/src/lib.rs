//! # Chassis Transport
//!
//! Channels, handler pipelines and bootstraps.
//!
//! ## Overview
//!
//! - **`channel`**: the `Channel` handle, its attributes and `ChannelFuture`
//! - **`pipeline`** / **`context`** / **`handler`**: the ordered handler chain
//!   inbound events and outbound operations travel through
//! - **`transport`**: the hooks an I/O implementation plugs into a channel
//! - **`internal`**: the channel state machine (`Unsafe`), only for transports
//! - **`event_loop`**: event loop groups and registration
//! - **`bootstrap`** / **`server`**: client and server assembly
//! - **`initializer`**: one-shot pipeline seeding
//! - **`local`**: the in-process transport
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chassis_core::prelude::*;
//! use chassis_transport::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let group = Arc::new(EventLoopGroup::new(1)?);
//!
//! let server = ServerBootstrap::new();
//! server
//!     .group(Arc::clone(&group))?
//!     .transport(LocalServerTransport::new)?
//!     .child_handler(ChannelInitializer::handler(|_child| Ok(())))?;
//! server.bind_to(Endpoint::local("quick-start"))?.sync()?;
//!
//! let client = Bootstrap::new();
//! client
//!     .group(Arc::clone(&group))?
//!     .transport(LocalTransport::new)?
//!     .handler(ChannelInitializer::handler(|_channel| Ok(())))?;
//! let channel = client
//!     .connect_to(Endpoint::local("quick-start"))?
//!     .sync()?
//!     .channel()
//!     .clone();
//! channel.write_and_flush(message("hello")).sync()?;
//! channel.close().sync()?;
//!
//! group.shutdown_gracefully();
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod bootstrap;
pub mod channel;
pub mod context;
pub mod event_loop;
pub mod handler;
pub mod initializer;
pub mod internal;
pub mod local;
pub mod pipeline;
pub mod server;
pub mod transport;

pub use channel::{Channel, ChannelFuture, WeakChannel};
pub use pipeline::Pipeline;

pub mod prelude {
    pub use crate::bootstrap::{Bootstrap, ChannelFactory};
    pub use crate::channel::{Channel, ChannelFuture, WeakChannel};
    pub use crate::context::HandlerContext;
    pub use crate::event_loop::{EventLoopExt, EventLoopGroup};
    pub use crate::handler::{
        ChannelHandler, Handler, HandlerResult, InboundHandler, OutboundHandler,
    };
    pub use crate::initializer::ChannelInitializer;
    pub use crate::local::{LocalServerTransport, LocalTransport};
    pub use crate::pipeline::Pipeline;
    pub use crate::server::ServerBootstrap;
    pub use crate::transport::{ChannelMetadata, Transport};
}
