//! Single-threaded event loop.
//!
//! Each loop owns one named worker thread running a compio runtime. Tasks are
//! queued in one FIFO and run to completion on that thread; delayed tasks are
//! compio timers spawned on the same runtime, so they too only ever run on the
//! worker thread.
//!
//! ```text
//! submitter threads ──execute──► [ FIFO task queue ] ──► worker thread
//!                                      ▲                   (compio runtime)
//!                     wake signal ─────┘                    │
//!                                                           └─ timers (schedule)
//! ```

use crate::error::{ChannelError, Result};
use crate::executor::{EventExecutor, ScheduledTask, Task};
use flume::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// How long an idle loop sleeps before picking up lazily queued tasks.
pub const DEFAULT_IDLE_WAKEUP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Running,
    ShuttingDown,
    Terminated,
}

struct TaskQueue {
    tasks: VecDeque<Task>,
    state: LoopState,
}

struct Shared {
    name: String,
    queue: Mutex<TaskQueue>,
    wake_tx: Sender<()>,
    terminated: Mutex<bool>,
    terminated_cv: Condvar,
}

impl Shared {
    /// Run the tasks queued at entry. Later arrivals wait for the next spin so
    /// that timers get a chance to run under sustained load.
    fn run_pending_tasks(&self) -> usize {
        let batch = self.queue.lock().tasks.len();
        let mut ran = 0;
        for _ in 0..batch {
            let Some(task) = self.queue.lock().tasks.pop_front() else {
                break;
            };
            run_task(&self.name, task);
            ran += 1;
        }
        ran
    }

    fn try_terminate(&self) -> bool {
        let mut queue = self.queue.lock();
        if queue.state == LoopState::ShuttingDown && queue.tasks.is_empty() {
            queue.state = LoopState::Terminated;
            return true;
        }
        false
    }

    fn mark_terminated(&self) {
        let leftover = {
            let mut queue = self.queue.lock();
            queue.state = LoopState::Terminated;
            std::mem::take(&mut queue.tasks)
        };
        if !leftover.is_empty() {
            warn!(
                "[EventLoop] {} dropped {} queued task(s) on termination",
                self.name,
                leftover.len()
            );
        }
        drop(leftover);

        *self.terminated.lock() = true;
        self.terminated_cv.notify_all();
    }
}

/// Run one task, containing any panic it raises.
fn run_task(name: &str, task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        warn!(
            "[EventLoop] {} task raised a panic: {}",
            name,
            ChannelError::from_panic(payload.as_ref())
        );
    }
}

/// Yield once to the runtime so spawned timers can make progress.
#[derive(Default)]
struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

async fn drive(shared: &Shared, wake_rx: Receiver<()>, idle_wakeup: Duration) {
    loop {
        let ran = shared.run_pending_tasks();
        if shared.try_terminate() {
            break;
        }
        if ran > 0 {
            YieldNow::default().await;
            continue;
        }
        // Either a waking submission or the idle tick ends the wait.
        let _ = compio::time::timeout(idle_wakeup, wake_rx.recv_async()).await;
    }
}

fn worker_thread(shared: Arc<Shared>, wake_rx: Receiver<()>, idle_wakeup: Duration) {
    debug!("[EventLoop] {} started", shared.name);
    match compio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(drive(&shared, wake_rx, idle_wakeup)),
        Err(e) => error!("[EventLoop] {} failed to create runtime: {}", shared.name, e),
    }
    shared.mark_terminated();
    debug!("[EventLoop] {} terminated", shared.name);
}

/// Executor backed by one dedicated worker thread.
///
/// # Examples
///
/// ```
/// use chassis_core::event_loop::SingleThreadEventLoop;
/// use chassis_core::executor::EventExecutor;
/// use std::time::Duration;
///
/// let event_loop = SingleThreadEventLoop::new("doc-loop").unwrap();
/// let (tx, rx) = flume::bounded(1);
/// event_loop.execute(Box::new(move || tx.send(42).unwrap())).unwrap();
/// assert_eq!(rx.recv().unwrap(), 42);
///
/// event_loop.shutdown_gracefully();
/// assert!(event_loop.await_termination(Duration::from_secs(5)));
/// ```
pub struct SingleThreadEventLoop {
    shared: Arc<Shared>,
    thread_id: ThreadId,
}

impl SingleThreadEventLoop {
    /// Spawn a loop whose worker thread is called `name`.
    pub fn new(name: impl Into<String>) -> io::Result<Arc<Self>> {
        Self::with_idle_wakeup(name, DEFAULT_IDLE_WAKEUP)
    }

    /// Spawn a loop with a custom idle tick for lazily queued tasks.
    pub fn with_idle_wakeup(name: impl Into<String>, idle_wakeup: Duration) -> io::Result<Arc<Self>> {
        let name = name.into();
        let (wake_tx, wake_rx) = flume::bounded(1);
        let shared = Arc::new(Shared {
            name: name.clone(),
            queue: Mutex::new(TaskQueue {
                tasks: VecDeque::new(),
                state: LoopState::Running,
            }),
            wake_tx,
            terminated: Mutex::new(false),
            terminated_cv: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_thread(worker, wake_rx, idle_wakeup))?;

        Ok(Arc::new(Self {
            shared,
            thread_id: handle.thread().id(),
        }))
    }

    /// Number of tasks waiting in the queue.
    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    pub fn is_terminated(&self) -> bool {
        *self.shared.terminated.lock()
    }

    fn enqueue(&self, task: Task, wakeup: bool) -> Result<()> {
        {
            let mut queue = self.shared.queue.lock();
            if queue.state != LoopState::Running {
                return Err(ChannelError::rejected(format!(
                    "event loop {} is shut down",
                    self.shared.name
                )));
            }
            queue.tasks.push_back(task);
        }
        if wakeup && !self.in_event_loop() {
            // A full signal slot already guarantees a wakeup.
            let _ = self.shared.wake_tx.try_send(());
        }
        Ok(())
    }
}

impl EventExecutor for SingleThreadEventLoop {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn in_event_loop(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn execute(&self, task: Task) -> Result<()> {
        self.enqueue(task, true)
    }

    fn execute_lazy(&self, task: Task) -> Result<()> {
        self.enqueue(task, false)
    }

    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledTask> {
        let handle = ScheduledTask::new();
        let timer = handle.clone();
        let name = self.shared.name.clone();
        self.execute(Box::new(move || {
            compio::runtime::spawn(async move {
                compio::time::sleep(delay).await;
                if timer.try_fire() {
                    run_task(&name, task);
                } else {
                    trace!("[EventLoop] {} skipped a cancelled scheduled task", name);
                }
            })
            .detach();
        }))?;
        Ok(handle)
    }

    fn shutdown_gracefully(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.state != LoopState::Running {
                return;
            }
            queue.state = LoopState::ShuttingDown;
        }
        debug!("[EventLoop] {} shutting down", self.shared.name);
        let _ = self.shared.wake_tx.try_send(());
    }

    fn is_shutting_down(&self) -> bool {
        self.shared.queue.lock().state != LoopState::Running
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let mut terminated = self.shared.terminated.lock();
        if !*terminated {
            let _ = self
                .shared
                .terminated_cv
                .wait_while_for(&mut terminated, |done| !*done, timeout);
        }
        *terminated
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for SingleThreadEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleThreadEventLoop")
            .field("name", &self.shared.name)
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}
