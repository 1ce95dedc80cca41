//! Local transport echo
//!
//! A server bound to `local://echo` writes every message back to the
//! channel it came from. A client connects, sends a few frames and waits
//! for each echo.
//!
//! # Features Demonstrated
//!
//! - `ServerBootstrap` with a child initializer
//! - `Bootstrap` connecting through the in-process transport
//! - Writing from outside the event loop and waiting on the result
//!
//! # Run
//!
//! ```sh
//! RUST_LOG=info cargo run --example local_echo
//! ```

use chassis::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

struct Echo;

impl ChannelHandler for Echo {}

impl InboundHandler for Echo {
    fn channel_read(&self, ctx: &HandlerContext, msg: Message) -> HandlerResult {
        ctx.write_and_flush(msg);
        Ok(())
    }
}

/// Forwards every `Bytes` frame the client reads to the main thread.
struct Replies {
    tx: flume::Sender<Bytes>,
}

impl ChannelHandler for Replies {}

impl InboundHandler for Replies {
    fn channel_read(&self, _ctx: &HandlerContext, msg: Message) -> HandlerResult {
        match msg.downcast::<Bytes>() {
            Ok(frame) => {
                let _ = self.tx.send(*frame);
                Ok(())
            }
            Err(_) => Err(ChannelError::handler("expected a Bytes frame")),
        }
    }
}

fn main() -> Result<()> {
    chassis::dev_tracing::init_tracing();

    let group = Arc::new(EventLoopGroup::with_name("echo", 2)?);

    let server = ServerBootstrap::new();
    server
        .group(Arc::clone(&group))?
        .transport(LocalServerTransport::new)?
        .child_handler(ChannelInitializer::handler(|child| {
            child.pipeline().add_last("echo", Handler::inbound(Echo))?;
            Ok(())
        }))?;
    let bound = server.bind_to(Endpoint::local("echo"))?;
    bound.sync()?;
    info!("Server bound to {:?}", bound.channel().local_address());

    let (tx, replies) = flume::unbounded();
    let client = Bootstrap::new();
    client
        .group(Arc::clone(&group))?
        .transport(LocalTransport::new)?
        .handler(ChannelInitializer::handler(move |channel| {
            channel
                .pipeline()
                .add_last("replies", Handler::inbound(Replies { tx: tx.clone() }))?;
            Ok(())
        }))?;

    let connected = client.connect_to(Endpoint::local("echo"))?;
    connected.sync()?;
    let channel = connected.channel().clone();
    println!("Connected {} -> {:?}", channel.id(), channel.remote_address());

    for i in 0..5 {
        let frame = Bytes::from(format!("frame #{i}"));
        channel.write_and_flush(message(frame)).sync()?;
        match replies.recv_timeout(Duration::from_secs(5)) {
            Ok(echo) => println!("Echo: {}", String::from_utf8_lossy(&echo)),
            Err(_) => return Err(ChannelError::illegal_state("echo timed out")),
        }
    }

    channel.close().sync()?;
    bound.channel().close().sync()?;
    group.shutdown_gracefully();
    group.await_termination(Duration::from_secs(5));
    println!("Done");
    Ok(())
}
