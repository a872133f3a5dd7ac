//! Completion future for one submitted batch of jobs

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug)]
struct CountDown {
    remaining: usize,
    signaled: bool,
    aborted: bool,
}

impl CountDown {
    fn is_settled(&self) -> bool {
        self.signaled || self.aborted
    }
}

/// Shared completion state; the pool's drain thread holds the other reference
#[derive(Debug)]
pub(crate) struct Completion {
    id: Uuid,
    expected: usize,
    state: Mutex<CountDown>,
    done: Condvar,
    notify: Notify,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl Completion {
    fn new(expected: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            expected,
            state: Mutex::new(CountDown {
                remaining: expected,
                signaled: expected == 0,
                aborted: false,
            }),
            done: Condvar::new(),
            notify: Notify::new(),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Count one finished job. Returns true when this was the last one.
    ///
    /// Waiters are not woken here; the caller clears the pool's active slot
    /// first and then calls [`Completion::signal`].
    pub(crate) fn on_job_done(&self, success: bool) -> bool {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut state = self.state.lock();
        state.remaining = state.remaining.saturating_sub(1);
        state.remaining == 0
    }

    /// Wake every waiter once the count reached zero
    pub(crate) fn signal(&self) {
        let mut state = self.state.lock();
        if state.remaining == 0 && !state.signaled {
            state.signaled = true;
            self.done.notify_all();
            self.notify.notify_waiters();
        }
    }

    /// Wake every waiter without completing; the pool was terminated
    pub(crate) fn abort(&self) {
        let mut state = self.state.lock();
        if !state.is_settled() {
            state.aborted = true;
            self.done.notify_all();
            self.notify.notify_waiters();
        }
    }

    fn is_ready(&self) -> bool {
        self.state.lock().signaled
    }

    fn is_settled(&self) -> bool {
        self.state.lock().is_settled()
    }
}

/// Future for the jobs of one `submit()` call.
///
/// Ready once every job has produced a success or error callback.
#[derive(Debug, Clone)]
pub struct AsyncResult {
    inner: Arc<Completion>,
}

impl AsyncResult {
    /// Future expecting `expected_count` job results; zero starts out ready
    pub(crate) fn new(expected_count: usize) -> Self {
        Self {
            inner: Arc::new(Completion::new(expected_count)),
        }
    }

    /// An already completed future for an empty submission
    pub fn ready() -> Self {
        Self::new(0)
    }

    pub(crate) fn completion(&self) -> Arc<Completion> {
        Arc::clone(&self.inner)
    }

    /// Submission id, used in logs
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Number of jobs in the submission
    pub fn expected(&self) -> usize {
        self.inner.expected
    }

    /// Jobs that finished successfully so far
    pub fn succeeded(&self) -> usize {
        self.inner.succeeded.load(Ordering::Relaxed)
    }

    /// Jobs that finished with an error so far
    pub fn failed(&self) -> usize {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Non-blocking poll
    pub fn is_ready(&self) -> bool {
        self.inner.is_ready()
    }

    /// Whether the pool was terminated before every job finished
    pub fn is_aborted(&self) -> bool {
        self.inner.state.lock().aborted
    }

    /// Block until every job finished or `timeout` elapses.
    ///
    /// Returns whether the submission completed; false after a timeout or
    /// when the pool was terminated. `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();

        while !state.is_settled() {
            match deadline {
                Some(deadline) => {
                    if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                        return state.signaled;
                    }
                }
                None => self.inner.done.wait(&mut state),
            }
        }
        state.signaled
    }

    /// Resolve once every job finished or the pool was terminated
    pub async fn completed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.is_settled() {
                return;
            }
            notified.await;
        }
    }
}
