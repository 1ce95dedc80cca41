//! In-process transport end to end.

mod common;

use chassis_core::endpoint::Endpoint;
use chassis_core::error::ChannelError;
use chassis_core::message::{message, Message};
use chassis_core::options::{ChannelOption, OptionValue};
use chassis_transport::bootstrap::Bootstrap;
use chassis_transport::channel::Channel;
use chassis_transport::context::HandlerContext;
use chassis_transport::event_loop::EventLoopGroup;
use chassis_transport::handler::{ChannelHandler, Handler, HandlerResult, InboundHandler};
use chassis_transport::initializer::ChannelInitializer;
use chassis_transport::local::{LocalServerTransport, LocalTransport};
use chassis_transport::server::ServerBootstrap;
use common::*;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Echo;

impl ChannelHandler for Echo {}

impl InboundHandler for Echo {
    fn channel_read(&self, ctx: &HandlerContext, msg: Message) -> HandlerResult {
        ctx.write_and_flush(msg);
        Ok(())
    }
}

struct Greeter;

impl ChannelHandler for Greeter {}

impl InboundHandler for Greeter {
    fn channel_active(&self, ctx: &HandlerContext) -> HandlerResult {
        ctx.write_and_flush(message("hello"));
        ctx.fire_channel_active();
        Ok(())
    }
}

struct Collector {
    received: flume::Sender<&'static str>,
}

impl ChannelHandler for Collector {}

impl InboundHandler for Collector {
    fn channel_read(&self, _ctx: &HandlerContext, msg: Message) -> HandlerResult {
        if let Some(text) = msg.downcast_ref::<&'static str>() {
            let _ = self.received.send(text);
        }
        Ok(())
    }
}

fn group(name: &str) -> Arc<EventLoopGroup> {
    Arc::new(EventLoopGroup::with_name(name, 2).unwrap())
}

fn serve(group: &Arc<EventLoopGroup>, name: &str, child: Handler) -> Channel {
    let server = ServerBootstrap::new();
    server
        .group(Arc::clone(group))
        .unwrap()
        .transport(LocalServerTransport::new)
        .unwrap()
        .child_handler(child)
        .unwrap();
    let bound = server.bind_to(Endpoint::local(name)).unwrap();
    bound.sync().unwrap();
    bound.channel().clone()
}

fn client(group: &Arc<EventLoopGroup>, auto_read: bool) -> (Bootstrap, flume::Receiver<&'static str>) {
    let (tx, rx) = flume::unbounded();
    let bootstrap = Bootstrap::new();
    bootstrap
        .group(Arc::clone(group))
        .unwrap()
        .transport(LocalTransport::new)
        .unwrap()
        .handler(ChannelInitializer::handler(move |channel| {
            channel.pipeline().add_last(
                "collector",
                Handler::inbound(Collector {
                    received: tx.clone(),
                }),
            )?;
            Ok(())
        }))
        .unwrap();
    bootstrap.option(ChannelOption::AutoRead, Some(OptionValue::Bool(auto_read)));
    (bootstrap, rx)
}

fn echo_handler() -> Handler {
    ChannelInitializer::handler(|channel| {
        channel.pipeline().add_last("echo", Handler::inbound(Echo))?;
        Ok(())
    })
}

fn stop(group: &EventLoopGroup) {
    group.shutdown_gracefully();
    assert!(group.await_termination(WAIT));
}

#[test]
fn test_echo_round_trip() {
    init_tracing();
    let loops = group("local-echo");
    let server = serve(&loops, "echo-round-trip", echo_handler());
    let (bootstrap, received) = client(&loops, true);

    for _ in 0..3 {
        let connected = bootstrap
            .connect_to(Endpoint::local("echo-round-trip"))
            .unwrap();
        connected.sync().unwrap();
        let channel = connected.channel().clone();
        assert!(channel.is_active());
        assert_eq!(
            channel.remote_address(),
            Some(Endpoint::local("echo-round-trip"))
        );
        assert!(matches!(channel.local_address(), Some(Endpoint::Local(name)) if name.starts_with('E')));

        channel.write_and_flush(message("ping")).sync().unwrap();
        channel.write_and_flush(message("pong")).sync().unwrap();
        assert_eq!(received.recv_timeout(WAIT).unwrap(), "ping");
        assert_eq!(received.recv_timeout(WAIT).unwrap(), "pong");

        channel.close().sync().unwrap();
    }

    server.close().sync().unwrap();
    stop(&loops);
}

#[test]
fn test_name_cannot_be_bound_twice() {
    let loops = group("local-twice");
    let first = serve(&loops, "bound-twice", echo_handler());
    assert!(LocalServerTransport::is_bound("bound-twice"));

    let server = ServerBootstrap::new();
    server
        .group(Arc::clone(&loops))
        .unwrap()
        .transport(LocalServerTransport::new)
        .unwrap()
        .child_handler(echo_handler())
        .unwrap();
    let second = server.bind_to(Endpoint::local("bound-twice")).unwrap();
    let cause = second.wait().unwrap_err();
    assert_eq!(cause.io_kind(), Some(io::ErrorKind::AddrInUse));

    first.close().sync().unwrap();
    assert!(!LocalServerTransport::is_bound("bound-twice"));

    // The name is free again.
    let again = serve(&loops, "bound-twice", echo_handler());
    again.close().sync().unwrap();
    stop(&loops);
}

#[test]
fn test_connect_to_unbound_name_is_refused() {
    let loops = group("local-refused");
    let (bootstrap, _received) = client(&loops, true);

    let connected = bootstrap.connect_to(Endpoint::local("nobody-home")).unwrap();
    let cause = connected.wait().unwrap_err();
    assert_eq!(cause.io_kind(), Some(io::ErrorKind::ConnectionRefused));
    assert!(connected.channel().close_future().wait_timeout(WAIT));

    stop(&loops);
}

#[test]
fn test_non_local_address_is_rejected() {
    let loops = group("local-non-local");
    let (bootstrap, _received) = client(&loops, true);

    let tcp: Endpoint = "tcp://127.0.0.1:5555".parse().unwrap();
    let connected = bootstrap.connect_to(tcp).unwrap();
    assert!(matches!(
        connected.wait(),
        Err(ChannelError::InvalidArgument(_))
    ));

    stop(&loops);
}

#[test]
fn test_closing_client_closes_accepted_child() {
    let loops = group("local-close");
    let (tx, events) = flume::unbounded();
    let server = serve(
        &loops,
        "close-propagation",
        ChannelInitializer::handler(move |channel| {
            channel.pipeline().add_last(
                "recorder",
                Handler::inbound(EventRecorder::with_sender(tx.clone())),
            )?;
            Ok(())
        }),
    );
    let (bootstrap, _received) = client(&loops, true);

    let connected = bootstrap
        .connect_to(Endpoint::local("close-propagation"))
        .unwrap();
    connected.sync().unwrap();
    assert!(events_until(&events, "active").contains(&"active".to_string()));

    connected.channel().close().sync().unwrap();
    let seen = events_until(&events, "unregistered");
    assert!(seen.contains(&"inactive".to_string()), "{seen:?}");

    server.close().sync().unwrap();
    stop(&loops);
}

#[test]
fn test_reads_wait_for_read_when_auto_read_is_off() {
    let loops = group("local-manual-read");
    let server = serve(
        &loops,
        "manual-read",
        ChannelInitializer::handler(|channel| {
            channel.pipeline().add_last("greeter", Handler::inbound(Greeter))?;
            Ok(())
        }),
    );
    let (bootstrap, received) = client(&loops, false);

    let connected = bootstrap.connect_to(Endpoint::local("manual-read")).unwrap();
    connected.sync().unwrap();
    let channel = connected.channel().clone();
    let transport = channel.transport_as::<LocalTransport>().unwrap();

    let deadline = Instant::now() + WAIT;
    while transport.pending_inbound() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(transport.pending_inbound(), 1);
    assert!(received.recv_timeout(Duration::from_millis(100)).is_err());

    channel.read();
    assert_eq!(received.recv_timeout(WAIT).unwrap(), "hello");
    assert_eq!(transport.pending_inbound(), 0);

    channel.close().sync().unwrap();
    server.close().sync().unwrap();
    stop(&loops);
}
