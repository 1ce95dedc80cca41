//! Process-wide fallback executor.
//!
//! A channel that never got an event loop (its initialization failed, or it
//! was never registered) still hands out promises, and their listeners must
//! run somewhere. They run here: one lazily started worker thread shared by
//! the whole process. Nothing else should be scheduled on it.

use crate::error::Result;
use crate::event_loop::SingleThreadEventLoop;
use crate::executor::{EventExecutor, Executor, ScheduledTask, Task};
use once_cell::sync::Lazy;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

static GLOBAL: Lazy<Arc<GlobalEventExecutor>> = Lazy::new(|| {
    let inner = SingleThreadEventLoop::new("chassis-global-executor")
        .expect("Failed to spawn global event executor thread");
    Arc::new(GlobalEventExecutor { inner })
});

/// The process-wide fallback executor.
///
/// It is a distinct type so transports can refuse to register channels on it.
pub struct GlobalEventExecutor {
    inner: Arc<SingleThreadEventLoop>,
}

impl GlobalEventExecutor {
    /// Shared handle to the singleton.
    pub fn instance() -> Executor {
        let global: Arc<GlobalEventExecutor> = Arc::clone(&GLOBAL);
        global
    }

    /// True if `executor` is the singleton.
    pub fn is_global(executor: &dyn EventExecutor) -> bool {
        executor.as_any().is::<GlobalEventExecutor>()
    }
}

impl EventExecutor for GlobalEventExecutor {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn in_event_loop(&self) -> bool {
        self.inner.in_event_loop()
    }

    fn execute(&self, task: Task) -> Result<()> {
        self.inner.execute(task)
    }

    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledTask> {
        self.inner.schedule(delay, task)
    }

    fn shutdown_gracefully(&self) {
        debug!("[EventLoop] the global executor ignores shutdown requests");
    }

    fn is_shutting_down(&self) -> bool {
        false
    }

    fn await_termination(&self, _timeout: Duration) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singleton_runs_tasks_and_ignores_shutdown() {
        let global = GlobalEventExecutor::instance();
        assert!(GlobalEventExecutor::is_global(global.as_ref()));
        global.shutdown_gracefully();
        assert!(!global.is_shutting_down());

        let (tx, rx) = flume::bounded(1);
        global.execute(Box::new(move || tx.send(()).unwrap())).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_plain_loop_is_not_global() {
        let event_loop = SingleThreadEventLoop::new("not-global").unwrap();
        assert!(!GlobalEventExecutor::is_global(event_loop.as_ref()));
    }
}
