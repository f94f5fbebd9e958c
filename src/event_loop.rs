//! A reference host for promises: a microtask queue drained to empty before
//! each timer, and a timer heap on a virtual or real clock.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{error, trace, warn};

use crate::schedule::{Handle, Job, RejectionProbe, Schedule};
use crate::{lock, Error, Promise};

const DEFAULT_JOB_BUDGET: usize = 100_000;

/// Knobs for an [`EventLoop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    real_time: bool,
    job_budget: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            real_time: false,
            job_budget: DEFAULT_JOB_BUDGET,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep until each timer's deadline instead of jumping a virtual clock.
    pub fn real_time(mut self, real_time: bool) -> Self {
        self.real_time = real_time;
        self
    }

    /// Most microtasks a single drain may run before giving up with
    /// [`Error::JobBudgetExceeded`].
    pub fn job_budget(mut self, limit: usize) -> Self {
        self.job_budget = limit;
        self
    }
}

struct Timer {
    deadline: Duration,
    seq: u64,
    job: Job,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed: the heap pops the earliest deadline, then the earliest registered.
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Tracked {
    id: u64,
    probe: RejectionProbe,
}

struct Shared {
    real_time: bool,
    start: Instant,
    clock: Mutex<Duration>,
    seq: AtomicU64,
    microtasks: Mutex<VecDeque<Job>>,
    timers: Mutex<BinaryHeap<Timer>>,
    rejections: Mutex<Vec<Tracked>>,
    unhandled: AtomicUsize,
    /// Bumped on every `defer`/`defer_after` so a real-time wait wakes up.
    generation: Mutex<u64>,
    new_work: Condvar,
}

impl Shared {
    fn now(&self) -> Duration {
        if self.real_time {
            self.start.elapsed()
        } else {
            *lock(&self.clock)
        }
    }

    fn signal(&self) {
        *lock(&self.generation) += 1;
        self.new_work.notify_all();
    }

    fn generation(&self) -> u64 {
        *lock(&self.generation)
    }

    /// Block until `deadline` or until new work is queued after `seen`.
    fn wait_for_work(&self, seen: u64, deadline: Duration) {
        let Some(timeout) = deadline.checked_sub(self.start.elapsed()) else { return };
        let guard = lock(&self.generation);
        let _ = self
            .new_work
            .wait_timeout_while(guard, timeout, |generation| *generation == seen);
    }
}

impl Schedule for Shared {
    fn defer(&self, job: Job) {
        let mut queue = lock(&self.microtasks);
        queue.push_back(job);
        trace!("microtask queued, {} pending", queue.len());
        drop(queue);
        self.signal();
    }

    fn defer_after(&self, delay: Duration, job: Job) {
        let deadline = self.now().checked_add(delay).unwrap_or(Duration::MAX);
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        trace!("timer {seq} set for {deadline:?}");
        lock(&self.timers).push(Timer { deadline, seq, job });
        self.signal();
    }

    fn track_rejection(&self, id: u64, probe: RejectionProbe) {
        lock(&self.rejections).push(Tracked { id, probe });
    }
}

/// Drives promises on the calling thread.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use promise_loop::{EventLoop, Promise};
///
/// let event_loop = EventLoop::new();
/// let handle = event_loop.handle();
/// let slow = Promise::<&str, &str>::reject_after(&handle, Duration::from_millis(100), "too slow");
/// let fast = Promise::resolve_after(&handle, Duration::from_millis(0), "1st :)");
/// let winner = Promise::race(&handle, [slow, fast]);
///
/// assert_eq!(event_loop.block_on(&winner).unwrap(), Ok("1st :)"));
/// ```
pub struct EventLoop {
    shared: Arc<Shared>,
    handle: Handle,
    config: Config,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let shared = Arc::new(Shared {
            real_time: config.real_time,
            start: Instant::now(),
            clock: Mutex::new(Duration::ZERO),
            seq: AtomicU64::new(0),
            microtasks: Mutex::new(VecDeque::new()),
            timers: Mutex::new(BinaryHeap::new()),
            rejections: Mutex::new(Vec::new()),
            unhandled: AtomicUsize::new(0),
            generation: Mutex::new(0),
            new_work: Condvar::new(),
        });
        let handle = Handle::new(shared.clone());
        EventLoop {
            shared,
            handle,
            config,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Time since the loop was created, on whichever clock it runs.
    pub fn now(&self) -> Duration {
        self.shared.now()
    }

    /// Rejections that were still unhandled after the microtask queue
    /// drained.
    pub fn unhandled_rejections(&self) -> usize {
        self.shared.unhandled.load(AtomicOrdering::Relaxed)
    }

    /// Run microtasks until the queue is empty. Timers are left alone.
    /// Returns the number of jobs run.
    pub fn run_until_stalled(&self) -> Result<usize, Error> {
        let mut ran = 0;
        loop {
            let next = lock(&self.shared.microtasks).pop_front();
            let Some(job) = next else { break };
            if ran == self.config.job_budget {
                lock(&self.shared.microtasks).push_front(job);
                self.report_unhandled();
                return Err(Error::JobBudgetExceeded {
                    limit: self.config.job_budget,
                });
            }
            run_job(job);
            ran += 1;
        }
        self.report_unhandled();
        Ok(ran)
    }

    /// Run until there are neither microtasks nor timers left.
    pub fn run(&self) -> Result<usize, Error> {
        let mut ran = self.run_until_stalled()?;
        while let Some(fired) = self.fire_next_timer() {
            ran += fired + self.run_until_stalled()?;
        }
        Ok(ran)
    }

    /// Run until `promise` settles and return its outcome.
    ///
    /// Fails with [`Error::Stalled`] if the loop runs out of work first.
    pub fn block_on<T, E>(&self, promise: &Promise<T, E>) -> Result<Result<T, E>, Error>
    where
        T: Clone + Send + 'static,
        E: Clone + Send + 'static,
    {
        promise.mark_handled();
        loop {
            self.run_until_stalled()?;
            if let Some(outcome) = promise.outcome() {
                return Ok(outcome);
            }
            if self.fire_next_timer().is_none() {
                return Err(Error::Stalled { id: promise.id() });
            }
        }
    }

    /// Fire the earliest timer, returning how many ran. In real-time mode the
    /// wait for its deadline ends early with `Some(0)` when other work is
    /// queued meanwhile. `None` once there are no timers left.
    fn fire_next_timer(&self) -> Option<usize> {
        if self.shared.real_time {
            loop {
                let seen = self.shared.generation();
                if !lock(&self.shared.microtasks).is_empty() {
                    return Some(0);
                }
                let deadline = lock(&self.shared.timers).peek().map(|timer| timer.deadline)?;
                if deadline <= self.shared.start.elapsed() {
                    break;
                }
                self.shared.wait_for_work(seen, deadline);
            }
        }
        let next = lock(&self.shared.timers).pop();
        let timer = next?;
        if !self.shared.real_time {
            let mut clock = lock(&self.shared.clock);
            *clock = (*clock).max(timer.deadline);
        }
        trace!("timer {} fired at {:?}", timer.seq, self.now());
        run_job(timer.job);
        Some(1)
    }

    fn report_unhandled(&self) {
        let tracked = std::mem::take(&mut *lock(&self.shared.rejections));
        for Tracked { id, probe } in tracked {
            if !probe() {
                warn!("promise #{id} was rejected and no handler was attached");
                self.shared.unhandled.fetch_add(1, AtomicOrdering::Relaxed);
            }
        }
    }
}

fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!("job panicked: {message}");
    }
}
