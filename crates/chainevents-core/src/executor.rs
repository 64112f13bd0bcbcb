//! Where listener callbacks run.
//!
//! The dispatcher never invokes a callback on its own task. Each delivery is
//! wrapped in a [`Job`] and handed to the engine's [`CallbackExecutor`]
//! through the listener's [`Lane`], which keeps one listener's deliveries in
//! order while different listeners run in parallel.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::sync::lock;

/// A unit of callback work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs callback jobs.
pub trait CallbackExecutor: Send + Sync + 'static {
    fn execute(&self, job: Job);
}

/// Runs every job on tokio's blocking pool.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioExecutor;

impl CallbackExecutor for TokioExecutor {
    fn execute(&self, job: Job) {
        tokio::task::spawn_blocking(job);
    }
}

/// Runs every job immediately on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl CallbackExecutor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

#[derive(Default)]
struct LaneState {
    jobs: VecDeque<Job>,
    running: bool,
}

/// Serial job queue on top of a shared executor.
///
/// At most one job of a lane runs at a time, and jobs run in the order they
/// were submitted. A panicking job is logged and the lane moves on to the
/// next one.
#[derive(Default)]
pub struct Lane {
    state: Mutex<LaneState>,
}

impl Lane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job`; starts a runner on `executor` if none is active.
    pub fn submit(self: &Arc<Self>, executor: &dyn CallbackExecutor, job: Job) {
        {
            let mut state = lock(&self.state);
            state.jobs.push_back(job);
            if state.running {
                return;
            }
            state.running = true;
        }
        let lane = Arc::clone(self);
        executor.execute(Box::new(move || lane.run()));
    }

    fn run(&self) {
        loop {
            let job = {
                let mut state = lock(&self.state);
                match state.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        state.running = false;
                        return;
                    }
                }
            };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                tracing::error!(panic = %panic_message(payload.as_ref()), "lane job panicked");
            }
        }
    }

    /// Jobs waiting to run.
    pub fn queued(&self) -> usize {
        lock(&self.state).jobs.len()
    }
}
