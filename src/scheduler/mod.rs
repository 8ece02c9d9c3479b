//! Streaming threads.
//!
//! A [`Task`] owns one OS thread that repeatedly calls a loop function.
//! Sources and queues run their output on a task; everything downstream of
//! a task executes synchronously in that thread until the next task
//! boundary. A [`DataQueue`] is such a boundary: the upstream thread
//! pushes into it, a task on the other side pops.
//!
//! ```text
//!   [src task] ─push─► transform ─push─► queue ║ [queue task] ─push─► sink
//! ```
//!
//! The loop function returns [`ControlFlow::Break`] to end the task from
//! inside, typically once the element it serves is gone.
//!
//! The task can hold a lock around every iteration. Pads use their stream
//! lock here, so another thread that takes the stream lock knows the loop
//! function is not running.

mod queue;

pub use queue::{DataQueue, LeakyMode, QueueLimits, QueueStats};

use crate::error::{Error, Result};
use std::ops::ControlFlow;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Lifecycle of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Not running; the thread exits at the next check.
    Stopped,
    /// Calling the loop function.
    Started,
    /// Thread alive but parked until started or stopped.
    Paused,
}

type LoopFn = Box<dyn FnMut() -> ControlFlow<()> + Send>;

struct TaskInner {
    name: String,
    state: Mutex<TaskState>,
    cond: Condvar,
    lock: Option<Arc<Mutex<()>>>,
    func: Mutex<Option<LoopFn>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// A restartable loop running on a dedicated thread.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Create a stopped task. No thread exists until [`Task::start`] or
    /// [`Task::pause`].
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        Self::build(name.into(), None, Box::new(func))
    }

    /// Create a stopped task that holds `lock` around every iteration.
    pub fn with_lock<F>(name: impl Into<String>, lock: Arc<Mutex<()>>, func: F) -> Self
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        Self::build(name.into(), Some(lock), Box::new(func))
    }

    fn build(name: String, lock: Option<Arc<Mutex<()>>>, func: LoopFn) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                name,
                state: Mutex::new(TaskState::Stopped),
                cond: Condvar::new(),
                lock,
                func: Mutex::new(Some(func)),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Task name, also used for the thread.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        *self.inner.state.lock().unwrap()
    }

    /// Run the loop function, spawning the thread on first use.
    pub fn start(&self) -> Result<()> {
        self.set_state(TaskState::Started)
    }

    /// Park the thread after the current iteration.
    ///
    /// Does not wait; take the task lock to be sure the loop function is not
    /// running. Safe to call from inside the loop function.
    pub fn pause(&self) -> Result<()> {
        self.set_state(TaskState::Paused)
    }

    /// Ask the thread to exit after the current iteration. Does not wait.
    pub fn stop(&self) {
        *self.inner.state.lock().unwrap() = TaskState::Stopped;
        self.inner.cond.notify_all();
    }

    /// Stop the task and wait for its thread to exit.
    ///
    /// Called from the task's own thread this only stops.
    pub fn join(&self) {
        self.stop();
        let handle = self.inner.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("task {} panicked", self.inner.name);
            }
        }
    }

    fn set_state(&self, new: TaskState) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        *state = new;
        drop(state);
        self.inner.cond.notify_all();
        self.ensure_thread()
    }

    fn ensure_thread(&self) -> Result<()> {
        let mut handle = self.inner.handle.lock().unwrap();
        if handle.is_some() {
            return Ok(());
        }
        let Some(func) = self.inner.func.lock().unwrap().take() else {
            return Err(Error::InvalidArgument(format!(
                "task {} already ran to completion",
                self.inner.name
            )));
        };
        let inner = Arc::clone(&self.inner);
        *handle = Some(
            std::thread::Builder::new()
                .name(self.inner.name.clone())
                .spawn(move || run(inner, func))?,
        );
        Ok(())
    }
}

fn run(inner: Arc<TaskInner>, mut func: LoopFn) {
    tracing::debug!("task {} entering loop", inner.name);
    loop {
        {
            let mut state = inner.state.lock().unwrap();
            while *state == TaskState::Paused {
                state = inner.cond.wait(state).unwrap();
            }
            if *state == TaskState::Stopped {
                break;
            }
        }

        let _guard = inner.lock.as_ref().map(|l| l.lock().unwrap());
        // Re-check: the state may have changed while waiting for the lock.
        if *inner.state.lock().unwrap() != TaskState::Started {
            continue;
        }
        if func().is_break() {
            *inner.state.lock().unwrap() = TaskState::Stopped;
            inner.cond.notify_all();
            break;
        }
    }
    tracing::debug!("task {} left loop", inner.name);
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_start_pause_stop() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = Task::new("counter", move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            ControlFlow::Continue(())
        });
        assert_eq!(task.state(), TaskState::Stopped);

        task.start().unwrap();
        assert!(wait_until(|| count.load(Ordering::SeqCst) > 3));

        task.pause().unwrap();
        assert_eq!(task.state(), TaskState::Paused);
        std::thread::sleep(Duration::from_millis(20));
        let paused_at = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), paused_at);

        task.start().unwrap();
        assert!(wait_until(|| count.load(Ordering::SeqCst) > paused_at));
        task.join();
        assert_eq!(task.state(), TaskState::Stopped);
    }

    #[test]
    fn test_pause_from_inside() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let slot: Arc<Mutex<Option<Task>>> = Arc::new(Mutex::new(None));
        let s = Arc::clone(&slot);
        let task = Task::new("self-pause", move || {
            if c.fetch_add(1, Ordering::SeqCst) == 4
                && let Some(t) = s.lock().unwrap().as_ref()
            {
                t.pause().unwrap();
            }
            ControlFlow::Continue(())
        });
        *slot.lock().unwrap() = Some(task.clone());
        task.start().unwrap();
        assert!(wait_until(|| task.state() == TaskState::Paused));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), 5);
        slot.lock().unwrap().take();
        task.join();
    }

    #[test]
    fn test_lock_excludes_iteration() {
        let lock = Arc::new(Mutex::new(()));
        let running = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&running);
        let task = Task::with_lock("locked", Arc::clone(&lock), move || {
            r.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2));
            r.fetch_sub(1, Ordering::SeqCst);
            ControlFlow::Continue(())
        });
        task.start().unwrap();
        for _ in 0..10 {
            let _guard = lock.lock().unwrap();
            assert_eq!(running.load(Ordering::SeqCst), 0);
        }
        task.join();
    }

    #[test]
    fn test_break_ends_thread() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let task = Task::new("finite", move || {
            if c.fetch_add(1, Ordering::SeqCst) == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        task.start().unwrap();
        assert!(wait_until(|| task.state() == TaskState::Stopped));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        task.join();
    }
}
