//! Handler pipeline.
//!
//! ```text
//!            inbound events ─────────────────────────────►
//!  [HeadContext] ⇄ [handler a] ⇄ [handler b] ⇄ [TailContext]
//!            ◄───────────────────────────── outbound operations
//! ```
//!
//! The head is outbound-capable and hands every operation to the channel's
//! internal operations; the tail is inbound-capable and swallows (and logs)
//! whatever nobody handled. Structural changes are serialized by a mutation
//! lock; `handler_added`/`handler_removed` run on the handler's executor.
//! Handlers installed before the channel's first registration are only told
//! they were added once that registration happens.

use crate::channel::{Channel, ChannelInner};
use crate::context::HandlerContext;
use crate::handler::{ChannelHandler, Handler, HandlerResult, InboundHandler, OutboundHandler};
use chassis_core::endpoint::Endpoint;
use chassis_core::error::{ChannelError, Result};
use chassis_core::executor::Executor;
use chassis_core::message::Message;
use chassis_core::promise::Promise;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Weak;
use tracing::{debug, warn};

const HEAD_NAME: &str = "HeadContext#0";
const TAIL_NAME: &str = "TailContext#0";

enum Position<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

enum PendingCallback {
    Added(HandlerContext),
    Removed(HandlerContext),
}

pub struct Pipeline {
    channel: Weak<ChannelInner>,
    head: HandlerContext,
    tail: HandlerContext,
    mutation: Mutex<()>,
    /// Callbacks held back until the first registration; `None` afterwards.
    pending: Mutex<Option<Vec<PendingCallback>>>,
}

impl Pipeline {
    pub(crate) fn new(channel: Weak<ChannelInner>) -> Self {
        let head = HandlerContext::new(
            channel.clone(),
            HEAD_NAME.to_string(),
            Handler::outbound(HeadHandler),
            None,
        );
        let tail = HandlerContext::new(
            channel.clone(),
            TAIL_NAME.to_string(),
            Handler::inbound(TailHandler),
            None,
        );
        head.set_next(Some(&tail));
        tail.set_prev(&head);
        Self {
            channel,
            head,
            tail,
            mutation: Mutex::new(()),
            pending: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn channel(&self) -> Option<Channel> {
        self.channel.upgrade().map(Channel::from_inner)
    }

    // ---- structure -----------------------------------------------------

    /// Insert `handler` right after the head. An empty `name` is generated.
    pub fn add_first(&self, name: &str, handler: Handler) -> Result<&Self> {
        self.insert(Position::First, None, name, handler)
    }

    pub fn add_first_with_executor(
        &self,
        executor: Executor,
        name: &str,
        handler: Handler,
    ) -> Result<&Self> {
        self.insert(Position::First, Some(executor), name, handler)
    }

    /// Insert `handler` right before the tail. An empty `name` is generated.
    pub fn add_last(&self, name: &str, handler: Handler) -> Result<&Self> {
        self.insert(Position::Last, None, name, handler)
    }

    pub fn add_last_with_executor(
        &self,
        executor: Executor,
        name: &str,
        handler: Handler,
    ) -> Result<&Self> {
        self.insert(Position::Last, Some(executor), name, handler)
    }

    pub fn add_before(&self, base: &str, name: &str, handler: Handler) -> Result<&Self> {
        self.insert(Position::Before(base), None, name, handler)
    }

    pub fn add_before_with_executor(
        &self,
        executor: Executor,
        base: &str,
        name: &str,
        handler: Handler,
    ) -> Result<&Self> {
        self.insert(Position::Before(base), Some(executor), name, handler)
    }

    pub fn add_after(&self, base: &str, name: &str, handler: Handler) -> Result<&Self> {
        self.insert(Position::After(base), None, name, handler)
    }

    pub fn add_after_with_executor(
        &self,
        executor: Executor,
        base: &str,
        name: &str,
        handler: Handler,
    ) -> Result<&Self> {
        self.insert(Position::After(base), Some(executor), name, handler)
    }

    /// Remove the handler called `name`.
    pub fn remove(&self, name: &str) -> Result<Handler> {
        let ctx = {
            let _guard = self.mutation.lock();
            let ctx = self.find_by_name(name).ok_or_else(|| no_such_handler(name))?;
            unlink(&ctx);
            ctx
        };
        let handler = ctx.handler().clone();
        self.callback_removed(ctx);
        Ok(handler)
    }

    /// Remove `handler` by identity.
    pub fn remove_handler(&self, handler: &Handler) -> Result<Handler> {
        let name = self
            .context_of(handler)
            .map(|ctx| ctx.name().to_string())
            .ok_or_else(|| no_such_handler(handler.type_name()))?;
        self.remove(&name)
    }

    /// Remove the handler owning `ctx`. False if it was already removed.
    pub fn remove_context(&self, ctx: &HandlerContext) -> bool {
        {
            let _guard = self.mutation.lock();
            if ctx.is_removed() || self.is_sentinel(ctx) {
                return false;
            }
            unlink(ctx);
        }
        self.callback_removed(ctx.clone());
        true
    }

    /// Swap the handler called `old_name` for `handler`, returning the old one.
    /// The new handler runs on the old one's executor.
    pub fn replace(&self, old_name: &str, new_name: &str, handler: Handler) -> Result<Handler> {
        let (old, new) = {
            let _guard = self.mutation.lock();
            let old = self
                .find_by_name(old_name)
                .ok_or_else(|| no_such_handler(old_name))?;
            let name = if new_name == old_name {
                new_name.to_string()
            } else {
                self.unique_name(new_name, &handler)?
            };
            let new = HandlerContext::new(self.channel.clone(), name, handler, old.own_executor());
            let prev = old.prev_ctx().unwrap_or_else(|| self.head.clone());
            let next = old.next_ctx().unwrap_or_else(|| self.tail.clone());
            link(&prev, &new, &next);
            old.mark_removed();
            (old, new)
        };
        let replaced = old.handler().clone();
        self.callback_added(new);
        self.callback_removed(old);
        Ok(replaced)
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.context(name).map(|ctx| ctx.handler().clone())
    }

    pub fn context(&self, name: &str) -> Option<HandlerContext> {
        let _guard = self.mutation.lock();
        self.find_by_name(name)
    }

    pub fn context_of(&self, handler: &Handler) -> Option<HandlerContext> {
        let _guard = self.mutation.lock();
        self.user_contexts()
            .into_iter()
            .find(|ctx| Handler::ptr_eq(ctx.handler(), handler))
    }

    /// Names of the installed handlers, head to tail.
    pub fn names(&self) -> Vec<String> {
        let _guard = self.mutation.lock();
        self.user_contexts()
            .iter()
            .map(|ctx| ctx.name().to_string())
            .collect()
    }

    pub fn first(&self) -> Option<Handler> {
        self.first_context().map(|ctx| ctx.handler().clone())
    }

    pub fn first_context(&self) -> Option<HandlerContext> {
        let next = self.head.next_ctx()?;
        (!self.is_sentinel(&next)).then_some(next)
    }

    pub fn last(&self) -> Option<Handler> {
        self.last_context().map(|ctx| ctx.handler().clone())
    }

    pub fn last_context(&self) -> Option<HandlerContext> {
        let prev = self.tail.prev_ctx()?;
        (!self.is_sentinel(&prev)).then_some(prev)
    }

    pub fn len(&self) -> usize {
        let _guard = self.mutation.lock();
        self.user_contexts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_context().is_none()
    }

    fn insert(
        &self,
        position: Position<'_>,
        executor: Option<Executor>,
        name: &str,
        handler: Handler,
    ) -> Result<&Self> {
        let ctx = {
            let _guard = self.mutation.lock();
            let name = self.unique_name(name, &handler)?;
            let ctx = HandlerContext::new(self.channel.clone(), name, handler, executor);
            let (prev, next) = match position {
                Position::First => (
                    self.head.clone(),
                    self.head.next_ctx().unwrap_or_else(|| self.tail.clone()),
                ),
                Position::Last => (
                    self.tail.prev_ctx().unwrap_or_else(|| self.head.clone()),
                    self.tail.clone(),
                ),
                Position::Before(base) => {
                    let base = self.find_by_name(base).ok_or_else(|| no_such_handler(base))?;
                    (base.prev_ctx().unwrap_or_else(|| self.head.clone()), base)
                }
                Position::After(base) => {
                    let base = self.find_by_name(base).ok_or_else(|| no_such_handler(base))?;
                    let next = base.next_ctx().unwrap_or_else(|| self.tail.clone());
                    (base, next)
                }
            };
            link(&prev, &ctx, &next);
            ctx
        };
        self.callback_added(ctx);
        Ok(self)
    }

    fn is_sentinel(&self, ctx: &HandlerContext) -> bool {
        ctx.ptr_eq(&self.head) || ctx.ptr_eq(&self.tail)
    }

    /// Installed contexts, head to tail. Caller holds the mutation lock.
    fn user_contexts(&self) -> Vec<HandlerContext> {
        let mut out = Vec::new();
        let mut cursor = self.head.next_ctx();
        while let Some(ctx) = cursor {
            if ctx.ptr_eq(&self.tail) {
                break;
            }
            cursor = ctx.next_ctx();
            out.push(ctx);
        }
        out
    }

    fn find_by_name(&self, name: &str) -> Option<HandlerContext> {
        self.user_contexts().into_iter().find(|ctx| ctx.name() == name)
    }

    fn unique_name(&self, name: &str, handler: &Handler) -> Result<String> {
        if name.is_empty() {
            let taken = self.user_contexts();
            let generated = (0..)
                .map(|i| format!("{}#{}", handler.type_name(), i))
                .find(|candidate| taken.iter().all(|ctx| ctx.name() != candidate))
                .unwrap_or_else(|| handler.type_name().to_string());
            return Ok(generated);
        }
        if self.find_by_name(name).is_some() {
            return Err(ChannelError::invalid_argument(format!(
                "Duplicate handler name: {name}"
            )));
        }
        Ok(name.to_string())
    }

    // ---- lifecycle callbacks -------------------------------------------

    fn callback_added(&self, ctx: HandlerContext) {
        {
            let mut pending = self.pending.lock();
            if let Some(list) = pending.as_mut() {
                list.push(PendingCallback::Added(ctx));
                return;
            }
        }
        self.call_handler_added(ctx);
    }

    fn callback_removed(&self, ctx: HandlerContext) {
        {
            let mut pending = self.pending.lock();
            if let Some(list) = pending.as_mut() {
                list.push(PendingCallback::Removed(ctx));
                return;
            }
        }
        self.call_handler_removed(ctx);
    }

    /// Deliver the callbacks held back until the first registration.
    pub(crate) fn call_handler_added_for_all_handlers(&self) {
        let Some(pending) = self.pending.lock().take() else {
            return;
        };
        for callback in pending {
            match callback {
                PendingCallback::Added(ctx) => self.call_handler_added(ctx),
                PendingCallback::Removed(ctx) => self.call_handler_removed(ctx),
            }
        }
    }

    fn call_handler_added(&self, ctx: HandlerContext) {
        self.on_context_executor(ctx, |pipeline, ctx| pipeline.call_handler_added0(ctx));
    }

    fn call_handler_removed(&self, ctx: HandlerContext) {
        self.on_context_executor(ctx, |pipeline, ctx| pipeline.call_handler_removed0(ctx));
    }

    fn on_context_executor<F>(&self, ctx: HandlerContext, f: F)
    where
        F: FnOnce(&Pipeline, &HandlerContext) + Send + 'static,
    {
        let channel = self.channel();
        match (ctx.executor(), channel) {
            (Some(executor), Some(channel)) if !executor.in_event_loop() => {
                let name = ctx.name().to_string();
                let task = Box::new(move || f(channel.pipeline(), &ctx));
                if let Err(e) = executor.execute(task) {
                    warn!(
                        "[Pipeline] Could not run lifecycle callback of '{}' on its executor: {}",
                        name, e
                    );
                }
            }
            _ => f(self, &ctx),
        }
    }

    fn call_handler_added0(&self, ctx: &HandlerContext) {
        let Err(cause) = ctx.call_handler_added() else {
            return;
        };
        let removed = {
            let _guard = self.mutation.lock();
            if ctx.is_removed() {
                false
            } else {
                unlink(ctx);
                true
            }
        };
        let error = if removed {
            if let Err(e) = ctx.call_handler_removed() {
                debug!("[Pipeline] handler_removed of '{}' failed too: {}", ctx.name(), e);
            }
            ChannelError::handler(format!(
                "{}.handler_added() has failed; removed: {}",
                ctx.name(),
                cause
            ))
        } else {
            ChannelError::handler(format!(
                "{}.handler_added() has failed; also failed to remove: {}",
                ctx.name(),
                cause
            ))
        };
        self.fire_exception_caught(error);
    }

    fn call_handler_removed0(&self, ctx: &HandlerContext) {
        if let Err(cause) = ctx.call_handler_removed() {
            self.fire_exception_caught(ChannelError::handler(format!(
                "{}.handler_removed() has failed: {}",
                ctx.name(),
                cause
            )));
        }
    }

    // ---- inbound events ------------------------------------------------

    pub fn fire_channel_registered(&self) -> &Self {
        self.head.fire_channel_registered();
        self
    }

    pub fn fire_channel_unregistered(&self) -> &Self {
        self.head.fire_channel_unregistered();
        self
    }

    /// Fire active, then request a read if auto-read is on.
    pub fn fire_channel_active(&self) -> &Self {
        self.head.fire_channel_active();
        self.read_if_auto_read();
        self
    }

    pub fn fire_channel_inactive(&self) -> &Self {
        self.head.fire_channel_inactive();
        self
    }

    pub fn fire_channel_read(&self, msg: Message) -> &Self {
        self.head.fire_channel_read(msg);
        self
    }

    /// Fire read-complete, then request a read if auto-read is on.
    pub fn fire_channel_read_complete(&self) -> &Self {
        self.head.fire_channel_read_complete();
        self.read_if_auto_read();
        self
    }

    pub fn fire_user_event_triggered(&self, event: Message) -> &Self {
        self.head.fire_user_event_triggered(event);
        self
    }

    pub fn fire_channel_writability_changed(&self) -> &Self {
        self.head.fire_channel_writability_changed();
        self
    }

    pub fn fire_exception_caught(&self, cause: ChannelError) -> &Self {
        self.head.fire_exception_caught(cause);
        self
    }

    fn read_if_auto_read(&self) {
        if let Some(channel) = self.channel() {
            if channel.config().auto_read() {
                channel.read();
            }
        }
    }

    // ---- outbound operations -------------------------------------------

    pub fn bind(&self, local: Endpoint) -> Promise {
        self.tail.bind(local)
    }

    pub fn bind_with(&self, local: Endpoint, promise: Promise) -> Result<Promise> {
        self.tail.bind_with(local, promise)
    }

    pub fn connect(&self, remote: Endpoint, local: Option<Endpoint>) -> Promise {
        self.tail.connect(remote, local)
    }

    pub fn connect_with(
        &self,
        remote: Endpoint,
        local: Option<Endpoint>,
        promise: Promise,
    ) -> Result<Promise> {
        self.tail.connect_with(remote, local, promise)
    }

    pub fn disconnect(&self) -> Promise {
        self.tail.disconnect()
    }

    pub fn disconnect_with(&self, promise: Promise) -> Result<Promise> {
        self.tail.disconnect_with(promise)
    }

    pub fn close(&self) -> Promise {
        self.tail.close()
    }

    pub fn close_with(&self, promise: Promise) -> Result<Promise> {
        self.tail.close_with(promise)
    }

    pub fn deregister(&self) -> Promise {
        self.tail.deregister()
    }

    pub fn deregister_with(&self, promise: Promise) -> Result<Promise> {
        self.tail.deregister_with(promise)
    }

    pub fn read(&self) -> &Self {
        self.tail.read();
        self
    }

    pub fn write(&self, msg: Message) -> Promise {
        self.tail.write(msg)
    }

    pub fn write_with(&self, msg: Message, promise: Promise) -> Result<Promise> {
        self.tail.write_with(msg, promise)
    }

    pub fn write_and_flush(&self, msg: Message) -> Promise {
        self.tail.write_and_flush(msg)
    }

    pub fn write_and_flush_with(&self, msg: Message, promise: Promise) -> Result<Promise> {
        self.tail.write_and_flush_with(msg, promise)
    }

    pub fn flush(&self) -> &Self {
        self.tail.flush();
        self
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _guard = self.mutation.lock();
        let mut list = f.debug_list();
        for ctx in self.user_contexts() {
            list.entry(&format_args!("{} = {}", ctx.name(), ctx.handler().type_name()));
        }
        list.finish()
    }
}

/// Splice `ctx` between `prev` and `next`. Forward links are published
/// before the backward ones are updated, so concurrent traversals see either
/// the old or the new chain.
fn link(prev: &HandlerContext, ctx: &HandlerContext, next: &HandlerContext) {
    ctx.set_prev(prev);
    ctx.set_next(Some(next));
    next.set_prev(ctx);
    prev.set_next(Some(ctx));
}

/// Take `ctx` out of the chain. Its own links stay intact.
fn unlink(ctx: &HandlerContext) {
    if let (Some(prev), Some(next)) = (ctx.prev_ctx(), ctx.next_ctx()) {
        prev.set_next(Some(&next));
        next.set_prev(&prev);
    }
    ctx.mark_removed();
}

fn no_such_handler(name: &str) -> ChannelError {
    ChannelError::invalid_argument(format!("No such handler: {name}"))
}

fn channel_of(ctx: &HandlerContext) -> Result<Channel> {
    ctx.channel().ok_or(ChannelError::Closed)
}

/// Outbound end of the pipeline: forwards to the channel's internal operations.
struct HeadHandler;

impl ChannelHandler for HeadHandler {}

impl OutboundHandler for HeadHandler {
    fn bind(&self, ctx: &HandlerContext, local: Endpoint, promise: Promise) -> HandlerResult {
        channel_of(ctx)?.unsafe_ops().bind(local, promise);
        Ok(())
    }

    fn connect(
        &self,
        ctx: &HandlerContext,
        remote: Endpoint,
        local: Option<Endpoint>,
        promise: Promise,
    ) -> HandlerResult {
        channel_of(ctx)?.unsafe_ops().connect(remote, local, promise);
        Ok(())
    }

    fn disconnect(&self, ctx: &HandlerContext, promise: Promise) -> HandlerResult {
        channel_of(ctx)?.unsafe_ops().disconnect(promise);
        Ok(())
    }

    fn close(&self, ctx: &HandlerContext, promise: Promise) -> HandlerResult {
        channel_of(ctx)?.unsafe_ops().close(promise);
        Ok(())
    }

    fn deregister(&self, ctx: &HandlerContext, promise: Promise) -> HandlerResult {
        channel_of(ctx)?.unsafe_ops().deregister(promise);
        Ok(())
    }

    fn read(&self, ctx: &HandlerContext) -> HandlerResult {
        channel_of(ctx)?.unsafe_ops().begin_read();
        Ok(())
    }

    fn write(&self, ctx: &HandlerContext, msg: Message, promise: Promise) -> HandlerResult {
        channel_of(ctx)?.unsafe_ops().write(msg, promise);
        Ok(())
    }

    fn flush(&self, ctx: &HandlerContext) -> HandlerResult {
        channel_of(ctx)?.unsafe_ops().flush();
        Ok(())
    }
}

/// Inbound end of the pipeline: whatever arrives here was not handled.
struct TailHandler;

impl ChannelHandler for TailHandler {}

impl InboundHandler for TailHandler {
    fn channel_registered(&self, _ctx: &HandlerContext) -> HandlerResult {
        Ok(())
    }

    fn channel_unregistered(&self, _ctx: &HandlerContext) -> HandlerResult {
        Ok(())
    }

    fn channel_active(&self, _ctx: &HandlerContext) -> HandlerResult {
        Ok(())
    }

    fn channel_inactive(&self, _ctx: &HandlerContext) -> HandlerResult {
        Ok(())
    }

    fn channel_read(&self, ctx: &HandlerContext, _msg: Message) -> HandlerResult {
        debug!(
            "[Pipeline] Discarded inbound message that reached the tail of the pipeline of {}",
            ctx.channel().map(|c| c.to_string()).unwrap_or_default()
        );
        Ok(())
    }

    fn channel_read_complete(&self, _ctx: &HandlerContext) -> HandlerResult {
        Ok(())
    }

    fn user_event_triggered(&self, _ctx: &HandlerContext, _event: Message) -> HandlerResult {
        Ok(())
    }

    fn channel_writability_changed(&self, _ctx: &HandlerContext) -> HandlerResult {
        Ok(())
    }

    fn exception_caught(&self, ctx: &HandlerContext, cause: ChannelError) -> HandlerResult {
        warn!(
            "[Pipeline] An exception reached the tail of the pipeline of {} without being handled: {}",
            ctx.channel().map(|c| c.to_string()).unwrap_or_default(),
            cause
        );
        Ok(())
    }
}
