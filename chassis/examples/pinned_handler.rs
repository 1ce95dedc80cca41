//! Handlers pinned to their own executor
//!
//! A channel's handlers normally run on the channel's event loop. A handler
//! added with an explicit executor runs on that executor instead, and the
//! pipeline hands events across in order.
//!
//! # Run
//!
//! ```sh
//! cargo run --example pinned_handler
//! ```

use chassis::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Reports which thread saw each frame, then passes it on.
struct ThreadLabel {
    label: &'static str,
    log: flume::Sender<String>,
}

impl ChannelHandler for ThreadLabel {}

impl InboundHandler for ThreadLabel {
    fn channel_read(&self, ctx: &HandlerContext, msg: Message) -> HandlerResult {
        let thread = thread::current().name().unwrap_or("unnamed").to_string();
        let _ = self.log.send(format!("{:<8} on {thread}", self.label));
        ctx.fire_channel_read(msg);
        Ok(())
    }
}

fn main() -> Result<()> {
    chassis::dev_tracing::init_tracing();

    let group = Arc::new(EventLoopGroup::with_name("io", 1)?);
    let worker: Executor = SingleThreadEventLoop::new("worker")?;
    let (log, lines) = flume::unbounded();

    let server = ServerBootstrap::new();
    let pinned = Arc::clone(&worker);
    let child_log = log.clone();
    server
        .group(Arc::clone(&group))?
        .transport(LocalServerTransport::new)?
        .child_handler(ChannelInitializer::handler(move |child| {
            child
                .pipeline()
                .add_last(
                    "decode",
                    Handler::inbound(ThreadLabel {
                        label: "decode",
                        log: child_log.clone(),
                    }),
                )?
                .add_last_with_executor(
                    Arc::clone(&pinned),
                    "business",
                    Handler::inbound(ThreadLabel {
                        label: "business",
                        log: child_log.clone(),
                    }),
                )?;
            Ok(())
        }))?;
    let bound = server.bind_to(Endpoint::local("pinned"))?;
    bound.sync()?;

    let client = Bootstrap::new();
    client
        .group(Arc::clone(&group))?
        .transport(LocalTransport::new)?
        .handler(ChannelInitializer::handler(|_channel| Ok(())))?;
    let connected = client.connect_to(Endpoint::local("pinned"))?;
    connected.sync()?;

    for i in 0..3u32 {
        connected
            .channel()
            .write_and_flush(message(Bytes::from(i.to_be_bytes().to_vec())))
            .sync()?;
    }
    for line in lines.iter().take(6) {
        println!("{line}");
    }

    connected.channel().close().sync()?;
    bound.channel().close().sync()?;
    group.shutdown_gracefully();
    worker.shutdown_gracefully();
    group.await_termination(Duration::from_secs(5));
    worker.await_termination(Duration::from_secs(5));
    Ok(())
}
