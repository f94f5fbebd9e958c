use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use log::{debug, trace, warn};

use crate::lock;
use crate::schedule::Handle;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type Reaction<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

/// Where a promise is in its one-way life: `Pending`, then exactly one of
/// `Fulfilled` or `Rejected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

impl<T: Clone, E: Clone> State<T, E> {
    fn outcome(&self) -> Option<Result<T, E>> {
        match self {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }
}

/// What a promise is resolved with: a plain value, or another promise whose
/// outcome it adopts.
pub enum Resolution<T, E> {
    Value(T),
    Adopt(Promise<T, E>),
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Adopt(promise)
    }
}

struct Inner<T, E> {
    state: State<T, E>,
    /// Set by the first resolve/reject. Stays set while adopting.
    resolved: bool,
    handled: bool,
    reactions: Vec<Reaction<T, E>>,
    wakers: Vec<Waker>,
}

/// A one-shot result that is not available yet.
///
/// Clones share the same settlement. Reactions attached with [`then`] and
/// friends always run as deferred jobs on the promise's [`Handle`], never
/// inside the call that attached them.
///
/// # Examples
///
/// ```
/// use promise_loop::{EventLoop, Promise};
///
/// let event_loop = EventLoop::new();
/// let promise = Promise::<i32, String>::new(&event_loop.handle(), |resolver| {
///     resolver.resolve(41);
///     Ok(())
/// })
/// .then(|value| Ok(value + 1));
///
/// assert_eq!(event_loop.block_on(&promise).unwrap(), Ok(42));
/// ```
///
/// [`then`]: Promise::then
pub struct Promise<T, E> {
    id: u64,
    inner: Arc<Mutex<Inner<T, E>>>,
    handle: Handle,
}

/// The settle capability handed to an executor. Only the first call on any
/// clone has an effect.
pub struct Resolver<T, E> {
    id: u64,
    inner: Arc<Mutex<Inner<T, E>>>,
    handle: Handle,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: self.inner.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: self.inner.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<T, E> Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match lock(&self.inner).state {
            State::Pending => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Rejected(_) => "rejected",
        };
        f.debug_struct("Promise").field("id", &self.id).field("state", &state).finish()
    }
}

impl<T, E> Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").field("id", &self.id).finish()
    }
}

fn is_handled<T, E>(inner: &Mutex<Inner<T, E>>) -> bool {
    lock(inner).handled
}

fn settle<T, E>(id: u64, inner: &Arc<Mutex<Inner<T, E>>>, handle: &Handle, outcome: Result<T, E>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    let (reactions, wakers, unhandled) = {
        let mut guard = lock(inner);
        if !matches!(guard.state, State::Pending) {
            return;
        }
        guard.state = match &outcome {
            Ok(value) => State::Fulfilled(value.clone()),
            Err(reason) => State::Rejected(reason.clone()),
        };
        let unhandled = outcome.is_err() && !guard.handled;
        (std::mem::take(&mut guard.reactions), std::mem::take(&mut guard.wakers), unhandled)
    };
    debug!(
        "promise #{id} {} with {} reaction(s)",
        if outcome.is_ok() { "fulfilled" } else { "rejected" },
        reactions.len()
    );
    for reaction in reactions {
        let outcome = outcome.clone();
        handle.defer(move || reaction(outcome));
    }
    for waker in wakers {
        waker.wake();
    }
    if unhandled {
        let weak: Weak<Mutex<Inner<T, E>>> = Arc::downgrade(inner);
        let probe = move || weak.upgrade().map_or(false, |inner| is_handled(&inner));
        handle.track_rejection(id, Box::new(probe));
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Fulfill with `value`. Returns `false` if the promise was already
    /// resolved.
    pub fn resolve(&self, value: T) -> bool {
        self.resolve_with(Resolution::Value(value))
    }

    /// Reject with `reason`. Returns `false` if the promise was already
    /// resolved.
    pub fn reject(&self, reason: E) -> bool {
        if !self.lock_in() {
            return false;
        }
        settle(self.id, &self.inner, &self.handle, Err(reason));
        true
    }

    /// Resolve with a value or adopt another promise's eventual outcome.
    pub fn resolve_with(&self, resolution: Resolution<T, E>) -> bool {
        if !self.lock_in() {
            return false;
        }
        match resolution {
            Resolution::Value(value) => settle(self.id, &self.inner, &self.handle, Ok(value)),
            Resolution::Adopt(source) => self.adopt(source),
        }
        true
    }

    /// Whether a resolve or reject already went through.
    pub fn is_resolved(&self) -> bool {
        lock(&self.inner).resolved
    }

    fn lock_in(&self) -> bool {
        let mut guard = lock(&self.inner);
        if guard.resolved {
            trace!("promise #{} already resolved, ignoring", self.id);
            return false;
        }
        guard.resolved = true;
        true
    }

    fn adopt(&self, source: Promise<T, E>) {
        if Arc::ptr_eq(&self.inner, &source.inner) {
            warn!("promise #{} was resolved with itself and will never settle", self.id);
            return;
        }
        debug!("promise #{} adopts promise #{}", self.id, source.id);
        let (id, inner, handle) = (self.id, self.inner.clone(), self.handle.clone());
        self.handle.defer(move || {
            source.subscribe(move |outcome| settle(id, &inner, &handle, outcome));
        });
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Build a promise by running `executor` right away with its resolver.
    ///
    /// An `Err` from the executor rejects the promise, unless it was already
    /// resolved.
    pub fn new<F>(handle: &Handle, executor: F) -> Self
    where
        F: FnOnce(Resolver<T, E>) -> Result<(), E>,
    {
        let (resolver, promise) = Self::pending(handle);
        if let Err(reason) = executor(resolver.clone()) {
            resolver.reject(reason);
        }
        promise
    }

    /// A pending promise together with the resolver that settles it.
    pub fn pending(handle: &Handle) -> (Resolver<T, E>, Self) {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(Mutex::new(Inner {
            state: State::Pending,
            resolved: false,
            handled: false,
            reactions: Vec::new(),
            wakers: Vec::new(),
        }));
        trace!("promise #{id} created");
        (
            Resolver {
                id,
                inner: inner.clone(),
                handle: handle.clone(),
            },
            Promise {
                id,
                inner,
                handle: handle.clone(),
            },
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The scheduler this promise defers its reactions to.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn state(&self) -> State<T, E> {
        lock(&self.inner).state.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(lock(&self.inner).state, State::Pending)
    }

    /// `Some(Ok(value))` or `Some(Err(reason))` once settled.
    pub fn outcome(&self) -> Option<Result<T, E>> {
        lock(&self.inner).state.outcome()
    }

    /// Run `on_fulfilled` with the value. A rejection passes through.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
    {
        self.chain(move |value| on_fulfilled(value).map(Resolution::Value), Err)
    }

    /// Run whichever handler matches the outcome.
    pub fn then_or_else<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, E> + Send + 'static,
        R: FnOnce(E) -> Result<U, E> + Send + 'static,
    {
        self.chain(
            move |value| on_fulfilled(value).map(Resolution::Value),
            move |reason| on_rejected(reason).map(Resolution::Value),
        )
    }

    /// Like [`then`](Promise::then), but the handler returns a promise whose
    /// outcome the derived promise adopts.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<Promise<U, E>, E> + Send + 'static,
    {
        self.chain(move |value| on_fulfilled(value).map(Resolution::Adopt), Err)
    }

    /// Run `on_rejected` with the reason. A fulfilled value passes through.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Result<T, E> + Send + 'static,
    {
        self.chain(
            |value| Ok(Resolution::Value(value)),
            move |reason| on_rejected(reason).map(Resolution::Value),
        )
    }

    /// Like [`catch`](Promise::catch), recovering with a promise to adopt.
    pub fn or_else<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Result<Promise<T, E>, E> + Send + 'static,
    {
        self.chain(
            |value| Ok(Resolution::Value(value)),
            move |reason| on_rejected(reason).map(Resolution::Adopt),
        )
    }

    fn chain<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + Send + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + Send + 'static,
    {
        let (resolver, derived) = Promise::pending(&self.handle);
        trace!("promise #{} derived from #{}", derived.id, self.id);
        self.subscribe(move |outcome| {
            let next = match outcome {
                Ok(value) => on_fulfilled(value),
                Err(reason) => on_rejected(reason),
            };
            match next {
                Ok(resolution) => resolver.resolve_with(resolution),
                Err(reason) => resolver.reject(reason),
            };
        });
        derived
    }

    /// Attach a raw reaction. It runs as a deferred job once the promise is
    /// settled, or on the next turn if it already is.
    pub(crate) fn subscribe<F>(&self, reaction: F)
    where
        F: FnOnce(Result<T, E>) + Send + 'static,
    {
        let mut guard = lock(&self.inner);
        guard.handled = true;
        let outcome = guard.state.outcome();
        match outcome {
            None => guard.reactions.push(Box::new(reaction)),
            Some(outcome) => {
                drop(guard);
                self.handle.defer(move || reaction(outcome));
            }
        }
    }

    pub(crate) fn mark_handled(&self) {
        lock(&self.inner).handled = true;
    }
}

impl<T, E> Future for Promise<T, E>
where
    T: Clone,
    E: Clone,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = lock(&self.inner);
        guard.handled = true;
        let outcome = guard.state.outcome();
        match outcome {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                if !guard.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    guard.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventLoop;
    use futures::executor::block_on;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn first_settlement_wins() {
        let event_loop = EventLoop::new();
        let promise = Promise::<i32, String>::new(&event_loop.handle(), |resolver| {
            assert!(resolver.resolve(1));
            assert!(!resolver.resolve(2));
            assert!(!resolver.reject("late".into()));
            Ok(())
        });
        assert_eq!(promise.state(), State::Fulfilled(1));
    }

    #[test]
    fn executor_error_rejects() {
        let event_loop = EventLoop::new();
        let promise = Promise::<i32, &str>::new(&event_loop.handle(), |_| Err("thrown"));
        assert_eq!(promise.state(), State::Rejected("thrown"));
    }

    #[test]
    fn executor_error_after_resolve_is_ignored() {
        let event_loop = EventLoop::new();
        let promise = Promise::<i32, &str>::new(&event_loop.handle(), |resolver| {
            resolver.resolve(7);
            Err("too late")
        });
        assert_eq!(promise.state(), State::Fulfilled(7));
    }

    #[test]
    fn handlers_never_run_inside_then() {
        let event_loop = EventLoop::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let settled = Promise::<i32, ()>::resolve(&event_loop.handle(), 1);
        let derived = settled.then(move |value| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(derived.is_pending());
        event_loop.run_until_stalled().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(derived.outcome(), Some(Ok(1)));
    }

    #[test]
    fn reactions_run_once_in_registration_order() {
        let event_loop = EventLoop::new();
        let (resolver, promise) = Promise::<&str, ()>::pending(&event_loop.handle());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let seen = seen.clone();
            promise.then(move |value| {
                seen.lock().unwrap().push(format!("{label}:{value}"));
                Ok(())
            });
        }
        event_loop.run_until_stalled().unwrap();
        assert!(seen.lock().unwrap().is_empty());
        resolver.resolve("x");
        resolver.resolve("y");
        event_loop.run().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a:x", "b:x", "c:x"]);
    }

    #[test]
    fn adopting_locks_in_before_settling() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let (inner, source) = Promise::<i32, String>::pending(&handle);
        let (resolver, outer) = Promise::<i32, String>::pending(&handle);
        assert!(resolver.resolve_with(source.into()));
        assert!(resolver.is_resolved());
        assert!(!resolver.reject("ignored".into()));
        event_loop.run_until_stalled().unwrap();
        assert!(outer.is_pending());
        inner.reject("from source".into());
        assert_eq!(event_loop.block_on(&outer).unwrap(), Err("from source".to_string()));
    }

    #[test]
    fn resolving_with_itself_never_settles() {
        let event_loop = EventLoop::new();
        let (resolver, promise) = Promise::<i32, ()>::pending(&event_loop.handle());
        resolver.resolve_with(Resolution::Adopt(promise.clone()));
        assert_eq!(
            event_loop.block_on(&promise),
            Err(crate::Error::Stalled { id: promise.id() })
        );
    }

    #[test]
    fn unhandled_rejections_are_counted() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let _ignored = Promise::<(), &str>::reject(&handle, "nobody listens");
        let caught = Promise::<(), &str>::reject(&handle, "handled").catch(|_| Ok(()));
        event_loop.run().unwrap();
        assert_eq!(event_loop.unhandled_rejections(), 1);
        assert_eq!(caught.outcome(), Some(Ok(())));
    }

    #[test]
    fn panicking_handler_leaves_derived_pending() {
        let event_loop = EventLoop::new();
        let derived = Promise::<i32, ()>::resolve(&event_loop.handle(), 1)
            .then(|_| -> Result<i32, ()> { panic!("handler bug") });
        event_loop.run().unwrap();
        assert!(derived.is_pending());
    }

    #[test]
    fn await_from_another_thread() {
        let event_loop = EventLoop::with_config(crate::Config::new().real_time(true));
        let handle = event_loop.handle();
        let promise = Promise::<String, String>::resolve_after(
            &handle,
            Duration::from_millis(20),
            "🍓".into(),
        )
        .then(|fruit| Ok(format!("{fruit}!")));
        let waiter = promise.clone();
        let task = thread::spawn(move || block_on(waiter));
        event_loop.run().unwrap();
        assert_eq!(task.join().expect("The waiting thread has panicked"), Ok("🍓!".to_string()));
    }

    #[test]
    fn resolve_from_another_thread() {
        let event_loop = EventLoop::new();
        let (resolver, promise) = Promise::<u32, ()>::pending(&event_loop.handle());
        let doubled = promise.then(|n| Ok(n * 2));
        thread::spawn(move || {
            resolver.resolve(21);
        })
        .join()
        .expect("The resolving thread has panicked");
        assert_eq!(event_loop.block_on(&doubled).unwrap(), Ok(42));
    }
}
