//! Bounded worker pool that runs one task per raster window.
//!
//! A pass dispatches every window onto a dedicated rayon pool, blocks until
//! all tasks finish, and hands back results in window-index order regardless
//! of completion order. A task that errors or panics is logged with its
//! window index and leaves an empty slot; the pass itself only fails when the
//! [`FailurePolicy`] says too many slots are empty.
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use log::{debug, error, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::config::{FailurePolicy, ProcessingConfig};
use crate::error::{Error, Result, TaskFailure};
use crate::progress::ProgressReporter;
use crate::raster::RasterWindow;

/// Results of one pass, indexed like the window list it was given.
#[derive(Debug)]
pub struct PassOutput<T> {
    pub results: Vec<Option<T>>,
    pub failures: Vec<TaskFailure>,
}

impl<T> PassOutput<T> {
    /// Successful results paired with their window index, in index order.
    pub fn completed(self) -> impl Iterator<Item = (usize, T)> {
        self.results
            .into_iter()
            .enumerate()
            .filter_map(|(i, r)| r.map(|v| (i, v)))
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    parallel: bool,
    policy: FailurePolicy,
}

impl WorkerPool {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            workers: config.max_workers.max(1),
            parallel: config.by_block,
            policy: config.failure_policy,
        }
    }

    /// Pool that runs every task inline on the calling thread.
    pub fn sequential() -> Self {
        Self { workers: 1, parallel: false, policy: FailurePolicy::BestEffort }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task` once per window and wait for all of them.
    ///
    /// `task` must not touch shared mutable state; progress is tracked by the
    /// pass itself.
    pub fn run<T, F>(&self, pass: &str, windows: &[RasterWindow], task: F) -> Result<PassOutput<T>>
    where
        T: Send,
        F: Fn(&RasterWindow) -> Result<T> + Sync,
    {
        let total = windows.len();
        let progress = ProgressReporter::new(pass, total);
        debug!("{pass}: {total} windows on {} worker(s)", self.effective_workers());

        let outcomes: Vec<std::result::Result<T, TaskFailure>> = if self.parallel && total > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(self.workers)
                .thread_name(|i| format!("popgrid-worker-{i}"))
                .build()
                .map_err(|e| Error::resource("worker thread pool", e))?;
            pool.install(|| {
                windows
                    .par_iter()
                    .enumerate()
                    .map(|(index, window)| run_task(pass, index, window, &task, &progress))
                    .collect()
            })
        } else {
            windows
                .iter()
                .enumerate()
                .map(|(index, window)| run_task(pass, index, window, &task, &progress))
                .collect()
        };
        progress.finish();

        let mut results = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(value) => results.push(Some(value)),
                Err(failure) => {
                    failures.push(failure);
                    results.push(None);
                }
            }
        }

        if !failures.is_empty() {
            if !self.policy.allows(failures.len(), total) {
                return Err(Error::PartialFailure {
                    pass: pass.to_string(),
                    failed: failures.len(),
                    total,
                });
            }
            warn!(
                "{pass}: {} of {total} windows failed; their regions are skipped",
                failures.len()
            );
        }

        Ok(PassOutput { results, failures })
    }

    fn effective_workers(&self) -> usize {
        if self.parallel {
            self.workers
        } else {
            1
        }
    }
}

fn run_task<T, F>(
    pass: &str,
    index: usize,
    window: &RasterWindow,
    task: &F,
    progress: &ProgressReporter,
) -> std::result::Result<T, TaskFailure>
where
    F: Fn(&RasterWindow) -> Result<T>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(window)));
    let result = match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("task panicked: {}", panic_message(payload.as_ref()))),
    };
    progress.tick();

    result.map_err(|message| {
        error!("{pass}: window {index} at {window:?} failed: {message}");
        TaskFailure { window_index: index, window: *window, message }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
