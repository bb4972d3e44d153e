//! Cancellable scheduled tasks on background threads.
//!
//! Every scheduled task is addressable by its `TaskHandle` and must be
//! cancelled on matching-response arrival or instance teardown. Cancellation
//! wakes the worker immediately; a task that has already started running is
//! not interrupted.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct TaskState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Handle to a scheduled task.
#[derive(Debug, Clone)]
#[must_use]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    /// Cancel the task. Idempotent; a task mid-run finishes its current
    /// invocation.
    pub fn cancel(&self) {
        let mut cancelled = self.state.cancelled.lock().expect("timer lock poisoned");
        *cancelled = true;
        self.state.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.cancelled.lock().expect("timer lock poisoned")
    }
}

fn new_state() -> Arc<TaskState> {
    Arc::new(TaskState {
        cancelled: Mutex::new(false),
        wake: Condvar::new(),
    })
}

/// Wait out `delay` on `state`; returns false if cancelled first.
fn sleep_unless_cancelled(state: &TaskState, delay: Duration) -> bool {
    let guard = state.cancelled.lock().expect("timer lock poisoned");
    let (guard, _) = state
        .wake
        .wait_timeout_while(guard, delay, |cancelled| !*cancelled)
        .expect("timer lock poisoned");
    !*guard
}

/// Run `task` once after `delay`, unless cancelled first.
pub fn schedule_once<F>(delay: Duration, task: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    let state = new_state();
    let worker_state = Arc::clone(&state);
    thread::spawn(move || {
        if sleep_unless_cancelled(&worker_state, delay) {
            task();
        }
    });
    TaskHandle { state }
}

/// Run `task` every `period` until it returns false or the handle is
/// cancelled.
pub fn schedule_periodic<F>(period: Duration, mut task: F) -> TaskHandle
where
    F: FnMut() -> bool + Send + 'static,
{
    let state = new_state();
    let worker_state = Arc::clone(&state);
    thread::spawn(move || loop {
        if !sleep_unless_cancelled(&worker_state, period) {
            break;
        }
        if !task() {
            break;
        }
    });
    TaskHandle { state }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn once_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let _h = schedule_once(Duration::from_millis(5), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_once_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let h = schedule_once(Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        h.cancel();
        assert!(h.is_cancelled());
        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn periodic_fires_repeatedly_until_cancelled() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let h = schedule_periodic(Duration::from_millis(5), move || {
            f.fetch_add(1, Ordering::SeqCst);
            true
        });
        thread::sleep(Duration::from_millis(100));
        h.cancel();
        let seen = fired.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected repeated firings, saw {seen}");
        thread::sleep(Duration::from_millis(50));
        // No further firings long after cancellation (allow one in-flight).
        let after = fired.load(Ordering::SeqCst);
        assert!(after <= seen + 1);
    }

    #[test]
    fn periodic_stops_when_task_returns_false() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let _h = schedule_periodic(Duration::from_millis(5), move || {
            f.fetch_add(1, Ordering::SeqCst) < 2
        });
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
