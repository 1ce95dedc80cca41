//! Event loop groups and channel registration.
//!
//! A group owns a fixed set of loops and hands them out round-robin; each
//! registered channel stays pinned to the loop it was given until it is
//! deregistered.

use crate::channel::{Channel, ChannelFuture};
use chassis_core::error::{ChannelError, Result};
use chassis_core::event_loop::SingleThreadEventLoop;
use chassis_core::executor::{same_executor, EventExecutor, Executor};
use chassis_core::promise::Promise;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_NAME_PREFIX: &str = "chassis-loop";

/// Registration entry points on any executor handle.
pub trait EventLoopExt {
    /// Register `channel` with this loop.
    fn register(&self, channel: &Channel) -> ChannelFuture;

    /// Register `channel` with this loop, completing `promise`.
    fn register_with(&self, channel: &Channel, promise: Promise) -> Result<ChannelFuture>;
}

impl EventLoopExt for Executor {
    fn register(&self, channel: &Channel) -> ChannelFuture {
        let promise = Promise::new(channel.id(), Some(Arc::clone(self)));
        channel
            .unsafe_ops()
            .register(Arc::clone(self), promise.clone());
        ChannelFuture::new(channel.clone(), promise)
    }

    fn register_with(&self, channel: &Channel, promise: Promise) -> Result<ChannelFuture> {
        if promise.channel_id() != Some(channel.id()) {
            return Err(ChannelError::invalid_argument(
                "registration promise belongs to another channel",
            ));
        }
        channel
            .unsafe_ops()
            .register(Arc::clone(self), promise.clone());
        Ok(ChannelFuture::new(channel.clone(), promise))
    }
}

/// A fixed pool of event loops.
pub struct EventLoopGroup {
    loops: Vec<Executor>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// Spawn `threads` loops; zero means twice the number of CPUs.
    pub fn new(threads: usize) -> io::Result<Self> {
        Self::with_name(DEFAULT_NAME_PREFIX, threads)
    }

    /// Like `new`, naming the worker threads `{prefix}-{index}`.
    pub fn with_name(prefix: &str, threads: usize) -> io::Result<Self> {
        let threads = if threads == 0 {
            num_cpus::get() * 2
        } else {
            threads
        };
        let mut loops: Vec<Executor> = Vec::with_capacity(threads);
        for i in 0..threads {
            match SingleThreadEventLoop::new(format!("{prefix}-{i}")) {
                Ok(event_loop) => loops.push(event_loop),
                Err(e) => {
                    for started in &loops {
                        started.shutdown_gracefully();
                    }
                    return Err(e);
                }
            }
        }
        debug!("[EventLoop] Started group '{}' with {} loops", prefix, threads);
        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// Group over existing executors.
    pub fn from_executors(loops: Vec<Executor>) -> Result<Self> {
        if loops.is_empty() {
            return Err(ChannelError::invalid_argument(
                "an event loop group needs at least one executor",
            ));
        }
        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    /// The loop that owns the next registered channel.
    pub fn next(&self) -> Executor {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        Arc::clone(&self.loops[index])
    }

    pub fn executors(&self) -> &[Executor] {
        &self.loops
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// True if `executor` is one of this group's loops.
    pub fn contains(&self, executor: &Executor) -> bool {
        self.loops.iter().any(|own| same_executor(own, executor))
    }

    /// Register `channel` with the next loop.
    pub fn register(&self, channel: &Channel) -> ChannelFuture {
        self.next().register(channel)
    }

    pub fn shutdown_gracefully(&self) {
        for event_loop in &self.loops {
            event_loop.shutdown_gracefully();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.loops.iter().all(|event_loop| event_loop.is_shutting_down())
    }

    /// Wait until every loop exited, at most `timeout` in total.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.loops.iter().all(|event_loop| {
            let left = deadline.saturating_duration_since(Instant::now());
            event_loop.await_termination(left)
        })
    }
}

impl fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.loops.iter().map(|l| l.name()).collect();
        f.debug_struct("EventLoopGroup").field("loops", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_is_round_robin() {
        let group = EventLoopGroup::with_name("rr", 3).unwrap();
        let picks: Vec<Executor> = (0..6).map(|_| group.next()).collect();
        for i in 0..3 {
            assert!(same_executor(&picks[i], &picks[i + 3]));
        }
        assert!(!same_executor(&picks[0], &picks[1]));
        assert!(group.contains(&picks[2]));

        group.shutdown_gracefully();
        assert!(group.is_shutting_down());
        assert!(group.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_empty_executor_list_is_rejected() {
        assert!(matches!(
            EventLoopGroup::from_executors(Vec::new()),
            Err(ChannelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_zero_threads_uses_cpu_default() {
        let group = EventLoopGroup::with_name("default-size", 0).unwrap();
        assert_eq!(group.len(), num_cpus::get() * 2);
        group.shutdown_gracefully();
        assert!(group.await_termination(Duration::from_secs(5)));
    }
}
