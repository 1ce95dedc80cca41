//! Pipeline structure and event dispatch.

mod common;

use chassis_core::error::ChannelError;
use chassis_core::message::{message, Message};
use chassis_core::promise::Promise;
use chassis_transport::context::HandlerContext;
use chassis_transport::event_loop::EventLoopExt;
use chassis_transport::handler::{
    ChannelHandler, Handler, HandlerResult, InboundHandler, OutboundHandler,
};
use common::*;
use std::thread;

/// Notes the messages it sees in both directions.
struct Tagger {
    tag: &'static str,
    log: flume::Sender<String>,
}

impl ChannelHandler for Tagger {}

impl InboundHandler for Tagger {
    fn channel_read(&self, ctx: &HandlerContext, msg: Message) -> HandlerResult {
        let _ = self.log.send(format!("in:{}", self.tag));
        ctx.fire_channel_read(msg);
        Ok(())
    }
}

impl OutboundHandler for Tagger {
    fn write(&self, ctx: &HandlerContext, msg: Message, promise: Promise) -> HandlerResult {
        let _ = self.log.send(format!("out:{}", self.tag));
        ctx.write_with(msg, promise)?;
        Ok(())
    }
}

fn tagger(tag: &'static str, log: &flume::Sender<String>) -> Handler {
    Handler::duplex(Tagger {
        tag,
        log: log.clone(),
    })
}

struct FailingReader {
    log: flume::Sender<String>,
}

impl ChannelHandler for FailingReader {}

impl InboundHandler for FailingReader {
    fn channel_read(&self, _ctx: &HandlerContext, _msg: Message) -> HandlerResult {
        Err(ChannelError::handler("boom"))
    }

    fn exception_caught(&self, _ctx: &HandlerContext, cause: ChannelError) -> HandlerResult {
        let _ = self.log.send(format!("caught:{cause}"));
        Ok(())
    }
}

/// Fails inside `exception_caught` itself.
struct BrokenExceptionHandler;

impl ChannelHandler for BrokenExceptionHandler {}

impl InboundHandler for BrokenExceptionHandler {
    fn channel_read(&self, _ctx: &HandlerContext, _msg: Message) -> HandlerResult {
        Err(ChannelError::handler("first"))
    }

    fn exception_caught(&self, _ctx: &HandlerContext, _cause: ChannelError) -> HandlerResult {
        Err(ChannelError::handler("second"))
    }
}

struct FailingAdd;

impl ChannelHandler for FailingAdd {
    fn handler_added(&self, _ctx: &HandlerContext) -> HandlerResult {
        Err(ChannelError::handler("cannot start"))
    }
}

impl InboundHandler for FailingAdd {}

struct RejectingWriter;

impl ChannelHandler for RejectingWriter {}

impl OutboundHandler for RejectingWriter {
    fn write(&self, _ctx: &HandlerContext, _msg: Message, _promise: Promise) -> HandlerResult {
        Err(ChannelError::handler("no writes here"))
    }
}

struct ThreadReporter {
    log: flume::Sender<String>,
}

impl ChannelHandler for ThreadReporter {}

impl InboundHandler for ThreadReporter {
    fn channel_read(&self, ctx: &HandlerContext, msg: Message) -> HandlerResult {
        let name = thread::current().name().unwrap_or("?").to_string();
        let _ = self.log.send(name);
        ctx.fire_channel_read(msg);
        Ok(())
    }
}

#[test]
fn test_structure_operations() {
    let channel = recording_channel(RecordingTransport::new());
    let (log, _rx) = flume::unbounded();
    let pipeline = channel.pipeline();
    assert!(pipeline.is_empty());

    pipeline
        .add_last("b", tagger("b", &log))
        .unwrap()
        .add_first("a", tagger("a", &log))
        .unwrap()
        .add_after("b", "d", tagger("d", &log))
        .unwrap()
        .add_before("d", "c", tagger("c", &log))
        .unwrap();
    assert_eq!(pipeline.names(), vec!["a", "b", "c", "d"]);
    assert_eq!(pipeline.len(), 4);
    assert_eq!(pipeline.first_context().unwrap().name(), "a");
    assert_eq!(pipeline.last_context().unwrap().name(), "d");

    let duplicate = pipeline.add_last("a", tagger("x", &log));
    assert!(matches!(duplicate, Err(ChannelError::InvalidArgument(_))));

    let missing = pipeline.add_before("nope", "e", tagger("e", &log));
    assert!(missing.is_err());

    let removed = pipeline.remove("b").unwrap();
    assert!(removed.downcast::<Tagger>().is_some());
    assert_eq!(pipeline.names(), vec!["a", "c", "d"]);
    assert!(pipeline.remove("b").is_err());

    let old = pipeline.replace("c", "c2", tagger("c2", &log)).unwrap();
    assert_eq!(old.downcast::<Tagger>().unwrap().tag, "c");
    assert_eq!(pipeline.names(), vec!["a", "c2", "d"]);

    let d = pipeline.get("d").unwrap();
    assert!(pipeline.context_of(&d).is_some());
    pipeline.remove_handler(&d).unwrap();
    assert!(pipeline.context_of(&d).is_none());
}

#[test]
fn test_generated_names_are_unique() {
    let channel = recording_channel(RecordingTransport::new());
    let (log, _rx) = flume::unbounded();
    let pipeline = channel.pipeline();

    pipeline.add_last("", tagger("one", &log)).unwrap();
    pipeline.add_last("", tagger("two", &log)).unwrap();
    assert_eq!(pipeline.names(), vec!["Tagger#0", "Tagger#1"]);
}

#[test]
fn test_handlers_added_before_registration_are_notified_once() {
    let event_loop = new_loop("added-once");
    let channel = recording_channel(RecordingTransport::new());
    let (recorder, events) = EventRecorder::new();
    channel
        .pipeline()
        .add_last("recorder", Handler::inbound(recorder))
        .unwrap();
    assert!(events_now(&events).is_empty());

    event_loop.register(&channel).sync().unwrap();
    assert_eq!(events_until(&events, "registered"), vec!["added", "registered"]);

    channel.deregister().sync().unwrap();
    event_loop.register(&channel).sync().unwrap();
    let again = events_until(&events, "registered");
    assert!(!again.contains(&"added".to_string()), "{again:?}");

    shutdown(&event_loop);
}

#[test]
fn test_failing_handler_added_removes_handler() {
    let event_loop = new_loop("failing-add");
    let channel = recording_channel(RecordingTransport::new());
    let (recorder, events) = EventRecorder::new();
    let pipeline = channel.pipeline();
    pipeline.add_last("fragile", Handler::inbound(FailingAdd)).unwrap();
    pipeline
        .add_last("recorder", Handler::inbound(recorder))
        .unwrap();

    event_loop.register(&channel).sync().unwrap();
    let seen = events_until(&events, "registered");
    let failure = seen
        .iter()
        .find(|e| e.starts_with("exception:"))
        .expect("handler_added failure is fired");
    assert!(failure.contains("fragile.handler_added() has failed; removed"));
    assert_eq!(channel.pipeline().names(), vec!["recorder"]);

    shutdown(&event_loop);
}

#[test]
fn test_inbound_and_outbound_traversal_order() {
    let event_loop = new_loop("traversal");
    let channel = recording_channel(RecordingTransport::active());
    let (log, rx) = flume::unbounded();
    channel
        .pipeline()
        .add_last("a", tagger("a", &log))
        .unwrap()
        .add_last("b", tagger("b", &log))
        .unwrap()
        .add_last("c", tagger("c", &log))
        .unwrap();
    event_loop.register(&channel).sync().unwrap();

    channel.pipeline().fire_channel_read(message("ping"));
    drain(&event_loop);
    assert_eq!(events_now(&rx), vec!["in:a", "in:b", "in:c"]);

    channel.write_and_flush(message("pong")).sync().unwrap();
    assert_eq!(events_now(&rx), vec!["out:c", "out:b", "out:a"]);
    assert_eq!(transport_of(&channel).written_as::<&str>(), vec!["pong"]);

    // A write issued from a context only passes the handlers before it.
    let ctx = channel.pipeline().context("b").unwrap();
    ctx.write_and_flush(message("from-b")).wait().unwrap();
    assert_eq!(events_now(&rx), vec!["out:a"]);

    shutdown(&event_loop);
}

#[test]
fn test_read_failure_is_delivered_to_the_same_handler() {
    let event_loop = new_loop("read-failure");
    let channel = recording_channel(RecordingTransport::active());
    let (log, rx) = flume::unbounded();
    let (recorder, events) = EventRecorder::new();
    channel
        .pipeline()
        .add_last("failing", Handler::inbound(FailingReader { log }))
        .unwrap()
        .add_last("recorder", Handler::inbound(recorder))
        .unwrap();
    event_loop.register(&channel).sync().unwrap();
    events_until(&events, "active");

    channel.pipeline().fire_channel_read(message("ping"));
    drain(&event_loop);

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "caught:Handler error: boom");
    let after = events_now(&events);
    assert!(!after.iter().any(|e| e.starts_with("read")), "{after:?}");

    shutdown(&event_loop);
}

#[test]
fn test_failure_inside_exception_caught_is_only_logged() {
    init_tracing();
    let event_loop = new_loop("nested-exception");
    let channel = recording_channel(RecordingTransport::active());
    let (recorder, events) = EventRecorder::new();
    channel
        .pipeline()
        .add_last("broken", Handler::inbound(BrokenExceptionHandler))
        .unwrap()
        .add_last("recorder", Handler::inbound(recorder))
        .unwrap();
    event_loop.register(&channel).sync().unwrap();
    events_until(&events, "active");

    channel.pipeline().fire_channel_read(message("ping"));
    drain(&event_loop);
    assert!(events_now(&events).is_empty());

    // The pipeline keeps working afterwards.
    channel.pipeline().fire_channel_writability_changed();
    assert_eq!(events_until(&events, "writability"), vec!["writability"]);

    shutdown(&event_loop);
}

#[test]
fn test_outbound_failure_fails_the_promise() {
    let event_loop = new_loop("outbound-failure");
    let channel = recording_channel(RecordingTransport::active());
    channel
        .pipeline()
        .add_last("rejecting", Handler::outbound(RejectingWriter))
        .unwrap();
    event_loop.register(&channel).sync().unwrap();

    let write = channel.write_and_flush(message("ping"));
    assert!(matches!(write.wait(), Err(ChannelError::Handler(_))));
    assert!(transport_of(&channel).written.lock().is_empty());
    assert!(channel.is_open());

    shutdown(&event_loop);
}

#[test]
fn test_promise_validation() {
    let event_loop = new_loop("validation");
    let channel = recording_channel(RecordingTransport::active());
    let other = recording_channel(RecordingTransport::active());
    event_loop.register(&channel).sync().unwrap();

    // Only writes take the void promise.
    let void = channel.pipeline().close_with(channel.void_promise());
    assert!(matches!(void, Err(ChannelError::InvalidArgument(_))));
    assert!(channel.is_open());

    let foreign = channel.write_with(message(1u8), other.new_promise());
    assert!(matches!(foreign, Err(ChannelError::InvalidArgument(_))));

    let done = channel.new_promise();
    done.try_success();
    assert!(channel.write_with(message(1u8), done).is_err());

    // A cancelled promise means the caller withdrew: nothing is written.
    let withdrawn = channel.new_promise();
    assert!(withdrawn.cancel());
    assert!(channel.write_with(message(1u8), withdrawn).is_ok());
    channel.flush();
    drain(&event_loop);
    assert!(transport_of(&channel).written.lock().is_empty());

    // read and flush accept anything.
    channel.read().flush();

    shutdown(&event_loop);
}

#[test]
fn test_void_promise_write_failure_fires_exception() {
    let event_loop = new_loop("void-write");
    let channel = recording_channel(RecordingTransport::active());
    let (recorder, events) = EventRecorder::new();
    channel
        .pipeline()
        .add_last("recorder", Handler::inbound(recorder))
        .unwrap();
    event_loop.register(&channel).sync().unwrap();
    assert_eq!(events_until(&events, "active"), ["added", "registered", "active"]);

    transport_of(&channel).fail_writes_with(ChannelError::handler("disk full"));
    let future = channel
        .write_and_flush_with(message("lost"), channel.void_promise())
        .unwrap();
    assert_eq!(
        events_until(&events, "exception:Handler error: disk full"),
        ["exception:Handler error: disk full"]
    );
    assert!(!future.is_done());
    assert!(channel.is_open());

    shutdown(&event_loop);
}

#[test]
fn test_handler_with_own_executor_runs_there() {
    let channel_loop = new_loop("channel-loop");
    let pinned_loop = new_loop("pinned-loop");
    let channel = recording_channel(RecordingTransport::active());
    let (log, rx) = flume::unbounded();
    channel
        .pipeline()
        .add_last("plain", Handler::inbound(ThreadReporter { log: log.clone() }))
        .unwrap()
        .add_last_with_executor(
            std::sync::Arc::clone(&pinned_loop),
            "pinned",
            Handler::inbound(ThreadReporter { log }),
        )
        .unwrap();
    channel_loop.register(&channel).sync().unwrap();

    channel.pipeline().fire_channel_read(message("ping"));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "channel-loop");
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "pinned-loop");

    shutdown(&channel_loop);
    shutdown(&pinned_loop);
}

#[test]
fn test_replace_keeps_pinned_executor() {
    let channel_loop = new_loop("channel-loop");
    let pinned_loop = new_loop("pinned-loop");
    let channel = recording_channel(RecordingTransport::active());
    let (log, rx) = flume::unbounded();
    channel
        .pipeline()
        .add_last_with_executor(
            std::sync::Arc::clone(&pinned_loop),
            "pinned",
            Handler::inbound(ThreadReporter { log: log.clone() }),
        )
        .unwrap();
    channel_loop.register(&channel).sync().unwrap();

    channel
        .pipeline()
        .replace("pinned", "swapped", Handler::inbound(ThreadReporter { log }))
        .unwrap();
    channel.pipeline().fire_channel_read(message("ping"));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "pinned-loop");

    shutdown(&channel_loop);
    shutdown(&pinned_loop);
}

#[test]
fn test_disconnect_becomes_close_without_disconnect_support() {
    let event_loop = new_loop("disconnect-close");
    let channel = recording_channel(RecordingTransport::without_disconnect());
    event_loop.register(&channel).sync().unwrap();

    channel.disconnect().sync().unwrap();
    assert!(channel.close_future().wait_timeout(WAIT));
    let hooks = transport_of(&channel).hooks();
    assert!(hooks.contains(&"close"));
    assert!(!hooks.contains(&"disconnect"));

    shutdown(&event_loop);
}

#[test]
fn test_disconnect_keeps_channel_open_when_supported() {
    let event_loop = new_loop("disconnect");
    let channel = recording_channel(RecordingTransport::active());
    let (recorder, events) = EventRecorder::new();
    channel
        .pipeline()
        .add_last("recorder", Handler::inbound(recorder))
        .unwrap();
    event_loop.register(&channel).sync().unwrap();
    events_until(&events, "active");

    channel.disconnect().sync().unwrap();
    assert_eq!(events_until(&events, "inactive"), vec!["inactive"]);
    assert!(channel.is_open());
    assert!(!channel.is_active());

    channel.close().sync().unwrap();
    shutdown(&event_loop);
}
