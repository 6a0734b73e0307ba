//! Background task scheduling
//!
//! Every scheduled task runs on its own named thread. Threads sleep on a
//! shutdown channel with `recv_timeout`, so dropping the sender wakes all of
//! them at once. A second channel, whose senders are held by the threads,
//! disconnects once every thread has exited; `await_termination` waits on it.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Runs periodic tasks on background threads
#[derive(Debug)]
pub struct Scheduler {
    name: String,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Scheduler {
    /// Create a scheduler; `name` prefixes its thread names
    pub fn new(name: impl Into<String>) -> Self {
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        let (done_tx, done_rx) = channel::bounded(0);

        Self {
            name: name.into(),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run `task` after `initial_delay`, then `delay` after each run completes
    pub fn schedule_with_fixed_delay<F>(
        &self,
        task_name: &str,
        initial_delay: Duration,
        delay: Duration,
        task: F,
    ) -> Result<()>
    where
        F: Fn() + Send + 'static,
    {
        let name = task_name.to_string();
        self.spawn(task_name, move |shutdown| {
            let mut wait = initial_delay;
            loop {
                match shutdown.recv_timeout(wait) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                run_guarded(&name, &task);
                wait = delay;
            }
        })
    }

    /// Run `task` after `initial_delay`, then every `period` measured from the first run
    ///
    /// A run that overruns its period delays the next one instead of
    /// triggering a burst of catch-up runs.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        task_name: &str,
        initial_delay: Duration,
        period: Duration,
        task: F,
    ) -> Result<()>
    where
        F: Fn() + Send + 'static,
    {
        let name = task_name.to_string();
        self.spawn(task_name, move |shutdown| {
            let mut next = Instant::now() + initial_delay;
            loop {
                let wait = next.saturating_duration_since(Instant::now());
                match shutdown.recv_timeout(wait) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                run_guarded(&name, &task);

                next += period;
                let now = Instant::now();
                while next < now && !period.is_zero() {
                    next += period;
                }
            }
        })
    }

    /// Signal every task to stop after its current run
    pub fn shutdown(&self) {
        if self.shutdown_tx.lock().take().is_some() {
            tracing::debug!(scheduler = %self.name, "scheduler shutting down");
        }
        self.done_tx.lock().take();
    }

    /// Check if `shutdown` has been called
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_tx.lock().is_none()
    }

    /// Wait up to `timeout` for every task thread to exit
    ///
    /// Returns `true` when all threads exited in time. Threads still running
    /// at the deadline are detached and logged.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let terminated = match self.done_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            Ok(()) | Err(RecvTimeoutError::Timeout) => false,
        };

        let mut tasks = self.tasks.lock();
        for (name, handle) in tasks.drain(..) {
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!(scheduler = %self.name, task = %name, "task thread panicked");
                }
            } else {
                tracing::warn!(
                    scheduler = %self.name,
                    task = %name,
                    "task still running after shutdown timeout, detaching"
                );
            }
        }

        terminated
    }

    /// Number of task threads not yet reaped
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    fn spawn<F>(&self, task_name: &str, body: F) -> Result<()>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let done = match self.done_tx.lock().as_ref() {
            Some(done) if !self.is_shutdown() => done.clone(),
            _ => {
                return Err(Error::lifecycle(format!(
                    "Cannot schedule '{}': scheduler is shut down",
                    task_name
                )))
            }
        };
        let shutdown = self.shutdown_rx.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-{}", self.name, task_name))
            .spawn(move || {
                body(shutdown);
                drop(done);
            })?;

        self.tasks.lock().push((task_name.to_string(), handle));
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_guarded<F: Fn()>(name: &str, task: &F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(task = %name, panic = %message, "scheduled task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn wait_for(counter: &AtomicUsize, at_least: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < at_least && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_fixed_delay_runs_repeatedly() {
        let scheduler = Scheduler::new("test");
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        scheduler
            .schedule_with_fixed_delay("tick", Duration::ZERO, Duration::from_millis(2), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        wait_for(&runs, 3);
        scheduler.shutdown();
        assert!(scheduler.await_termination(Duration::from_secs(5)));
        assert!(runs.load(Ordering::SeqCst) >= 3);
        assert_eq!(scheduler.task_count(), 0);

        // No runs after termination
        let after = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(runs.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_fixed_rate_and_initial_delay() {
        let scheduler = Scheduler::new("test");
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        scheduler
            .schedule_at_fixed_rate("rate", Duration::from_millis(1), Duration::from_millis(2), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let idle = Arc::new(AtomicUsize::new(0));
        let counter = idle.clone();
        scheduler
            .schedule_at_fixed_rate("idle", Duration::from_secs(3600), Duration::from_secs(3600), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        wait_for(&runs, 2);
        scheduler.shutdown();
        assert!(scheduler.await_termination(Duration::from_secs(5)));
        assert!(runs.load(Ordering::SeqCst) >= 2);
        // Shutdown interrupts the initial delay
        assert_eq!(idle.load(Ordering::SeqCst), 0);
    }

    #[test_log::test]
    fn test_panicking_task_keeps_running() {
        let scheduler = Scheduler::new("test");
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        scheduler
            .schedule_with_fixed_delay("flaky", Duration::ZERO, Duration::from_millis(1), move || {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
            })
            .unwrap();

        wait_for(&runs, 3);
        scheduler.shutdown();
        assert!(scheduler.await_termination(Duration::from_secs(5)));
        assert!(runs.load(Ordering::SeqCst) >= 3);
    }

    #[test_log::test]
    fn test_await_termination_times_out() {
        let scheduler = Scheduler::new("test");
        let started = Arc::new(AtomicUsize::new(0));

        let counter = started.clone();
        scheduler
            .schedule_with_fixed_delay("slow", Duration::ZERO, Duration::from_secs(3600), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(300));
            })
            .unwrap();

        wait_for(&started, 1);
        scheduler.shutdown();
        assert!(!scheduler.await_termination(Duration::from_millis(10)));
    }

    #[test]
    fn test_schedule_after_shutdown_fails() {
        let scheduler = Scheduler::new("test");
        scheduler.shutdown();
        assert!(scheduler.is_shutdown());

        let err = scheduler
            .schedule_with_fixed_delay("late", Duration::ZERO, Duration::from_millis(1), || {})
            .unwrap_err();
        assert!(err.is_lifecycle_error());

        // Nothing was ever scheduled
        assert!(scheduler.await_termination(Duration::from_millis(10)));
    }
}
