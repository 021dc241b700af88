//! Throttled progress reporting for one worker-pool pass.
//!
//! Each pass owns its own reporter: a completion counter behind a mutex and
//! a fixed reporting stride of `max(1, total / 20)`.
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::info;

/// One emitted progress line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub done: usize,
    pub total: usize,
    pub percent: f64,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct Counter {
    done: usize,
    finished: bool,
}

#[derive(Debug)]
pub struct ProgressReporter {
    label: String,
    total: usize,
    stride: usize,
    started: Instant,
    counter: Mutex<Counter>,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, total: usize) -> Self {
        Self {
            label: label.into(),
            total,
            stride: (total / 20).max(1),
            started: Instant::now(),
            counter: Mutex::new(Counter::default()),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn done(&self) -> usize {
        self.lock().done
    }

    /// Record one completed task. Returns the update if this completion
    /// crossed a reporting stride or completed the pass.
    pub fn tick(&self) -> Option<ProgressUpdate> {
        let mut counter = self.lock();
        if counter.finished {
            return None;
        }
        counter.done += 1;
        let done = counter.done;
        if done >= self.total {
            counter.finished = true;
        } else if done % self.stride != 0 {
            return None;
        }
        drop(counter);
        Some(self.emit(done))
    }

    /// Emit the final 100% line unless a tick already did.
    pub fn finish(&self) -> Option<ProgressUpdate> {
        let mut counter = self.lock();
        if counter.finished {
            return None;
        }
        counter.finished = true;
        counter.done = self.total;
        drop(counter);
        Some(self.emit(self.total))
    }

    fn emit(&self, done: usize) -> ProgressUpdate {
        let percent = if self.total == 0 {
            100.0
        } else {
            100.0 * done as f64 / self.total as f64
        };
        let elapsed = self.started.elapsed();
        info!(
            "{}: {:.1}% ({}/{}) elapsed {:.1}s",
            self.label,
            percent,
            done,
            self.total,
            elapsed.as_secs_f64()
        );
        ProgressUpdate { done, total: self.total, percent, elapsed }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counter> {
        // A poisoned counter is still a valid count.
        self.counter.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_every_twentieth_and_once_at_completion() {
        let reporter = ProgressReporter::new("stats", 100);
        let updates: Vec<_> = (0..100).filter_map(|_| reporter.tick()).collect();
        assert_eq!(updates.len(), 20);
        assert_eq!(updates[0].done, 5);
        let finals: Vec<_> = updates.iter().filter(|u| u.percent == 100.0).collect();
        assert_eq!(finals.len(), 1);
        assert!(reporter.finish().is_none());
    }

    #[test]
    fn small_passes_report_every_completion() {
        let reporter = ProgressReporter::new("write", 3);
        let done: Vec<_> = (0..3).filter_map(|_| reporter.tick()).map(|u| u.done).collect();
        assert_eq!(done, vec![1, 2, 3]);
    }

    #[test]
    fn uneven_totals_still_end_at_one_hundred_percent() {
        let reporter = ProgressReporter::new("mask", 47);
        let updates: Vec<_> = (0..47).filter_map(|_| reporter.tick()).collect();
        // stride 2: 23 even counts below 47 plus the final line
        assert_eq!(updates.len(), 24);
        assert_eq!(updates.last().map(|u| u.done), Some(47));
    }

    #[test]
    fn finish_covers_passes_with_failed_or_no_ticks() {
        let empty = ProgressReporter::new("empty", 0);
        let update = empty.finish().unwrap();
        assert_eq!(update.percent, 100.0);
        assert!(empty.finish().is_none());

        let partial = ProgressReporter::new("partial", 10);
        partial.tick();
        assert_eq!(partial.finish().map(|u| u.done), Some(10));
        assert!(partial.tick().is_none());
    }
}
