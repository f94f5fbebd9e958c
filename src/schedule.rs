//! The deferred-invocation seam. Promises never run their reactions
//! themselves; they hand them to a [`Schedule`] through a [`Handle`].

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// A probe answering "has a handler been attached since?" for a promise that
/// was rejected while nobody was listening.
pub type RejectionProbe = Box<dyn Fn() -> bool + Send + 'static>;

/// What the host must supply to drive promises.
///
/// `defer` jobs run after the current synchronous work returns, in FIFO
/// order, and all of them before any `defer_after` job whose delay has
/// elapsed.
pub trait Schedule: Send + Sync {
    fn defer(&self, job: Job);

    fn defer_after(&self, delay: Duration, job: Job);

    /// Called when promise `id` is rejected with no reaction attached. Hosts
    /// that do not report unhandled rejections can ignore it.
    fn track_rejection(&self, id: u64, probe: RejectionProbe) {
        let _ = (id, probe);
    }
}

/// A cheap, cloneable reference to a scheduler.
#[derive(Clone)]
pub struct Handle {
    scheduler: Arc<dyn Schedule>,
}

impl Handle {
    /// Wrap any scheduler implementation.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::{Arc, Mutex};
    /// use std::time::Duration;
    /// use promise_loop::{Handle, Job, Promise, Schedule};
    ///
    /// #[derive(Default)]
    /// struct Fifo(Mutex<Vec<Job>>);
    ///
    /// impl Schedule for Fifo {
    ///     fn defer(&self, job: Job) {
    ///         self.0.lock().unwrap().push(job);
    ///     }
    ///     fn defer_after(&self, _delay: Duration, job: Job) {
    ///         self.defer(job);
    ///     }
    /// }
    ///
    /// let fifo = Arc::new(Fifo::default());
    /// let handle = Handle::new(fifo.clone());
    /// let doubled = Promise::<i32, ()>::resolve(&handle, 21).then(|n| Ok(n * 2));
    /// assert!(doubled.is_pending());
    ///
    /// loop {
    ///     let jobs = std::mem::take(&mut *fifo.0.lock().unwrap());
    ///     if jobs.is_empty() {
    ///         break;
    ///     }
    ///     jobs.into_iter().for_each(|job| job());
    /// }
    /// assert_eq!(doubled.outcome(), Some(Ok(42)));
    /// ```
    pub fn new<S: Schedule + 'static>(scheduler: Arc<S>) -> Self {
        Handle { scheduler }
    }

    pub fn defer<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.defer(Box::new(job));
    }

    pub fn defer_after<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.defer_after(delay, Box::new(job));
    }

    pub(crate) fn track_rejection(&self, id: u64, probe: RejectionProbe) {
        self.scheduler.track_rejection(id, probe);
    }
}

impl Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}
