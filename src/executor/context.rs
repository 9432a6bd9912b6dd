use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use super::Executor;

type Work = Box<dyn FnOnce() + Send>;

struct State {
    queue: VecDeque<Work>,

    /// Queued and running work items plus live work guards.
    outstanding: usize,

    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn work_finished(&self) {
        let mut state = self.lock();
        state.outstanding -= 1;
        if state.outstanding == 0 {
            self.ready.notify_all();
        }
    }
}

/// A queue of work run by the threads that call [`run`][Self::run].
///
/// Transfer completions posted to the context's [`executor`][Self::executor]
/// run inside `run` and its variants. When a single thread runs the context,
/// completions never run concurrently with each other.
///
/// `run` returns once there is no queued work and no outstanding
/// [`WorkGuard`][super::WorkGuard]. Every submitted transfer holds a guard
/// until its completion is posted, so `run` waits for all in-flight transfers.
///
/// ```
/// use usb_async::{ExecutionContext, Executor};
///
/// let ctx = ExecutionContext::new();
/// ctx.executor().post(|| println!("hello from the context"));
/// assert_eq!(ctx.run(), 1);
/// ```
#[derive(Clone)]
pub struct ExecutionContext {
    shared: Arc<Shared>,
}

impl ExecutionContext {
    /// Create an empty context.
    pub fn new() -> ExecutionContext {
        ExecutionContext {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    outstanding: 0,
                    stopped: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// Get a handle for posting work to this context.
    pub fn executor(&self) -> ContextExecutor {
        ContextExecutor {
            shared: self.shared.clone(),
        }
    }

    /// Wait for the next work item, or `None` if the context ran out of work
    /// or was stopped.
    fn next(&self, block: bool) -> Option<Work> {
        let mut state = self.shared.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(work) = state.queue.pop_front() {
                return Some(work);
            }
            if state.outstanding == 0 || !block {
                return None;
            }
            state = self.shared.ready.wait(state).unwrap();
        }
    }

    fn execute(&self, work: Work) {
        tracing::trace!("running posted work");
        work();
        self.shared.work_finished();
    }

    /// Run work until the context runs out of work or is stopped. Returns the
    /// number of work items run.
    pub fn run(&self) -> usize {
        let mut count = 0;
        while let Some(work) = self.next(true) {
            self.execute(work);
            count += 1;
        }
        tracing::trace!(count, "execution context out of work");
        count
    }

    /// Run at most one work item, waiting for it if work is outstanding.
    /// Returns the number of work items run.
    pub fn run_one(&self) -> usize {
        match self.next(true) {
            Some(work) => {
                self.execute(work);
                1
            }
            None => 0,
        }
    }

    /// Run work that is ready to run without waiting. Returns the number of
    /// work items run.
    pub fn poll(&self) -> usize {
        let mut count = 0;
        while let Some(work) = self.next(false) {
            self.execute(work);
            count += 1;
        }
        count
    }

    /// Make `run` return as soon as possible, even if work is outstanding.
    /// Queued work stays queued.
    pub fn stop(&self) {
        self.shared.lock().stopped = true;
        self.shared.ready.notify_all();
    }

    /// Whether the context was stopped.
    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }

    /// Allow `run` to be called again after [`stop`][Self::stop].
    pub fn restart(&self) {
        self.shared.lock().stopped = false;
    }

    /// Number of queued work items plus outstanding work guards.
    pub fn outstanding_work(&self) -> usize {
        self.shared.lock().outstanding
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ExecutionContext")
            .field("queued", &state.queue.len())
            .field("outstanding", &state.outstanding)
            .field("stopped", &state.stopped)
            .finish()
    }
}

/// Handle for posting work to an [`ExecutionContext`].
#[derive(Clone)]
pub struct ContextExecutor {
    shared: Arc<Shared>,
}

impl ContextExecutor {
    /// Whether both handles post to the same context.
    pub fn same_context(&self, other: &ContextExecutor) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Executor for ContextExecutor {
    fn post<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        state.outstanding += 1;
        state.queue.push_back(Box::new(work));
        drop(state);
        self.shared.ready.notify_one();
    }

    fn on_work_started(&self) {
        self.shared.lock().outstanding += 1;
    }

    fn on_work_finished(&self) {
        self.shared.work_finished();
    }
}

impl Debug for ContextExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextExecutor").finish_non_exhaustive()
    }
}
