//! Chassis Core
//!
//! This crate contains the building blocks the channel engine runs on:
//! - Error types (`error`)
//! - Channel identity (`ids`) and addressing (`endpoint`)
//! - Pipeline messages and size estimation (`message`)
//! - Channel configuration and typed options (`options`)
//! - Write-buffer water marks (`backpressure`)
//! - The executor contract (`executor`), the single-threaded event loop
//!   (`event_loop`) and the process-wide fallback executor (`global`)
//! - Promises (`promise`) and the outbound write queue (`outbound`)

#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
pub mod backpressure;
pub mod endpoint;
pub mod error;
pub mod event_loop;
pub mod executor;
pub mod global;
pub mod ids;
pub mod message;
pub mod options;
pub mod outbound;
pub mod promise;

pub use error::{ChannelError, Result};

// Optional: a small prelude to make downstream crates ergonomic.
pub mod prelude {
    pub use crate::backpressure::WriteBufferWaterMark;
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{ChannelError, Result};
    pub use crate::event_loop::SingleThreadEventLoop;
    pub use crate::executor::{EventExecutor, Executor, ScheduledTask, Task};
    pub use crate::global::GlobalEventExecutor;
    pub use crate::ids::ChannelId;
    pub use crate::message::{message, Message, MessageSizeEstimator};
    pub use crate::options::{ChannelConfig, ChannelOption, OptionValue};
    pub use crate::outbound::OutboundBuffer;
    pub use crate::promise::Promise;
}
