//! # Chassis
//!
//! An event-driven channel engine: channels, handler pipelines, event loops
//! and bootstraps.
//!
//! ## Architecture
//!
//! Chassis is split into layers:
//!
//! - **`chassis-core`**: errors, options, promises, the outbound write queue
//!   and the single-threaded event loop every channel is pinned to
//! - **`chassis-transport`**: the `Channel` handle, its handler `Pipeline`,
//!   event loop groups, `Bootstrap`/`ServerBootstrap` and the in-process
//!   `local://` transport
//! - **`chassis`**: public API surface (this crate)
//!
//! Every channel is registered with exactly one event loop. All of its
//! lifecycle events, handler callbacks and transport hooks run on that
//! loop's thread; calls made from any other thread are handed over as tasks
//! and observed through a `ChannelFuture`.
//!
//! ## Quick Start
//!
//! ### Echo server over the local transport
//!
//! ```rust,no_run
//! use chassis::prelude::*;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl ChannelHandler for Echo {}
//!
//! impl InboundHandler for Echo {
//!     fn channel_read(&self, ctx: &HandlerContext, msg: Message) -> HandlerResult {
//!         ctx.write_and_flush(msg);
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let group = Arc::new(EventLoopGroup::new(2)?);
//!
//! let server = ServerBootstrap::new();
//! server
//!     .group(Arc::clone(&group))?
//!     .transport(LocalServerTransport::new)?
//!     .child_handler(ChannelInitializer::handler(|child| {
//!         child.pipeline().add_last("echo", Handler::inbound(Echo))?;
//!         Ok(())
//!     }))?;
//! let bound = server.bind_to(Endpoint::local("echo"))?;
//! bound.sync()?;
//!
//! // ... connect clients with `Bootstrap` ...
//!
//! bound.channel().close().sync()?;
//! group.shutdown_gracefully();
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading
//!
//! - Handlers are `Send + Sync` and may be shared between pipelines
//! - A handler added with an explicit executor runs on that executor instead
//!   of the channel's loop
//! - Blocking on a future from inside an event loop fails with
//!   `ChannelError::BlockingOperation` instead of deadlocking
//!
//! ## Logging
//!
//! The engine logs through `tracing`. Call [`dev_tracing::init_tracing`] in
//! examples and tests to print events when `RUST_LOG` is set.

#![warn(missing_docs)]
#![cfg_attr(not(test), deny(unsafe_code))]

pub mod dev_tracing;

pub use bytes::Bytes;
pub use chassis_core;
pub use chassis_transport;

pub use chassis_core::{ChannelError, Result};
pub use chassis_transport::{Channel, ChannelFuture, Pipeline, WeakChannel};

/// Everything needed to assemble and run channels.
///
/// ```rust
/// use chassis::prelude::*;
/// ```
pub mod prelude {
    pub use bytes::Bytes;
    pub use chassis_core::prelude::*;
    pub use chassis_transport::prelude::*;
}
