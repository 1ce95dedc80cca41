//! Executor contract.
//!
//! An executor runs submitted tasks to completion, one at a time, on a thread
//! it owns. Everything a channel does after registration is funnelled through
//! its executor, so "am I on the executor thread?" is the question every
//! dispatch path starts with.

use crate::error::Result;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A unit of work submitted to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to an executor.
pub type Executor = Arc<dyn EventExecutor>;

/// Single-threaded task executor.
pub trait EventExecutor: Send + Sync + 'static {
    /// Name used in logs (usually the worker thread's name).
    fn name(&self) -> &str;

    /// True if the calling thread is this executor's worker thread.
    fn in_event_loop(&self) -> bool;

    /// Queue `task` and wake the worker if it is idle.
    ///
    /// Tasks submitted from one thread run in submission order. Returns
    /// `ChannelError::Rejected` once the executor is shutting down.
    fn execute(&self, task: Task) -> Result<()>;

    /// Queue `task` without waking an idle worker.
    ///
    /// Used for work that is always followed by a waking submission (a write
    /// is followed by a flush) or that tolerates the idle tick delay.
    fn execute_lazy(&self, task: Task) -> Result<()> {
        self.execute(task)
    }

    /// Run `task` once after `delay`.
    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledTask>;

    /// Stop accepting tasks; queued tasks still run.
    fn shutdown_gracefully(&self);

    /// True once `shutdown_gracefully` was called.
    fn is_shutting_down(&self) -> bool;

    /// Block until the worker exits or `timeout` passes. True if it exited.
    fn await_termination(&self, timeout: Duration) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// True if both handles point at the same executor instance.
pub fn same_executor(a: &Executor, b: &Executor) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

const WAITING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a delayed task.
#[derive(Clone, Default)]
pub struct ScheduledTask {
    state: Arc<AtomicU8>,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prevent the task from running. False if it already ran.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(WAITING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            || self.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    /// Claim the right to run. Called by the executor when the delay expires.
    pub fn try_fire(&self) -> bool {
        self.state
            .compare_exchange(WAITING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            WAITING => "waiting",
            FIRED => "fired",
            _ => "cancelled",
        };
        f.debug_struct("ScheduledTask").field("state", &state).finish()
    }
}
