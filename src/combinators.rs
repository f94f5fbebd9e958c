use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::trace;

use crate::lock;
use crate::promise::{Promise, Resolution};
use crate::schedule::Handle;

struct Gather<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// An already fulfilled promise.
    pub fn resolve(handle: &Handle, value: T) -> Self {
        Self::resolve_with(handle, Resolution::Value(value))
    }

    /// A promise resolved with `resolution`; adopting when it is a promise.
    pub fn resolve_with(handle: &Handle, resolution: Resolution<T, E>) -> Self {
        let (resolver, promise) = Self::pending(handle);
        resolver.resolve_with(resolution);
        promise
    }

    /// A new promise that settles however `source` does.
    ///
    /// ```
    /// use promise_loop::{EventLoop, Promise};
    ///
    /// let event_loop = EventLoop::new();
    /// let handle = event_loop.handle();
    /// let nested = Promise::<i32, ()>::from_promise(&handle, Promise::resolve(&handle, 5));
    /// assert_eq!(event_loop.block_on(&nested).unwrap(), Ok(5));
    /// ```
    pub fn from_promise(handle: &Handle, source: Promise<T, E>) -> Self {
        Self::resolve_with(handle, Resolution::Adopt(source))
    }

    /// An already rejected promise.
    pub fn reject(handle: &Handle, reason: E) -> Self {
        let (resolver, promise) = Self::pending(handle);
        resolver.reject(reason);
        promise
    }

    /// Fulfills with `value` once `delay` has passed on the handle's clock.
    pub fn resolve_after(handle: &Handle, delay: Duration, value: T) -> Self {
        let (resolver, promise) = Self::pending(handle);
        handle.defer_after(delay, move || {
            resolver.resolve(value);
        });
        promise
    }

    /// Rejects with `reason` once `delay` has passed on the handle's clock.
    pub fn reject_after(handle: &Handle, delay: Duration, reason: E) -> Self {
        let (resolver, promise) = Self::pending(handle);
        handle.defer_after(delay, move || {
            resolver.reject(reason);
        });
        promise
    }

    /// Fulfills with every input's value, in input order, once all of them
    /// fulfilled. Rejects with the first rejection.
    pub fn all<I>(handle: &Handle, promises: I) -> Promise<Vec<T>, E>
    where
        I: IntoIterator<Item = Promise<T, E>>,
    {
        let promises: Vec<_> = promises.into_iter().collect();
        let (resolver, all) = Promise::pending(handle);
        trace!("promise #{} waits on {} input(s)", all.id(), promises.len());
        if promises.is_empty() {
            resolver.resolve(Vec::new());
            return all;
        }
        let gather = Arc::new(Mutex::new(Gather {
            values: promises.iter().map(|_| None).collect(),
            remaining: promises.len(),
        }));
        for (index, promise) in promises.into_iter().enumerate() {
            let gather = gather.clone();
            let resolver = resolver.clone();
            promise.subscribe(move |outcome| match outcome {
                Ok(value) => {
                    let values = {
                        let mut gather = lock(&gather);
                        gather.values[index] = Some(value);
                        gather.remaining -= 1;
                        if gather.remaining > 0 {
                            return;
                        }
                        gather.values.drain(..).flatten().collect()
                    };
                    resolver.resolve(values);
                }
                Err(reason) => {
                    resolver.reject(reason);
                }
            });
        }
        all
    }

    /// Settles like the first input to settle. Inputs settled in the same
    /// turn win in iteration order. With no inputs it never settles.
    pub fn race<I>(handle: &Handle, promises: I) -> Self
    where
        I: IntoIterator<Item = Promise<T, E>>,
    {
        let (resolver, race) = Self::pending(handle);
        for promise in promises {
            let resolver = resolver.clone();
            promise.subscribe(move |outcome| {
                match outcome {
                    Ok(value) => resolver.resolve(value),
                    Err(reason) => resolver.reject(reason),
                };
            });
        }
        race
    }
}

#[cfg(test)]
mod tests {
    use crate::{EventLoop, Promise, State};
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn all_of_nothing_is_already_fulfilled() {
        let event_loop = EventLoop::new();
        let all = Promise::<i32, String>::all(&event_loop.handle(), Vec::new());
        assert_eq!(all.state(), State::Fulfilled(vec![]));
    }

    #[test]
    fn all_keeps_input_order() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let all = Promise::<i32, String>::all(
            &handle,
            [
                Promise::resolve_after(&handle, ms(30), 1),
                Promise::resolve_after(&handle, ms(10), 2),
                Promise::resolve_after(&handle, ms(20), 3),
            ],
        );
        assert_eq!(event_loop.block_on(&all).unwrap(), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn all_rejects_with_the_first_rejection() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let all = Promise::<i32, String>::all(
            &handle,
            [
                Promise::resolve_after(&handle, ms(50), 1),
                Promise::reject_after(&handle, ms(10), "second".to_string()),
                Promise::reject_after(&handle, ms(20), "third".to_string()),
            ],
        );
        assert_eq!(event_loop.block_on(&all).unwrap(), Err("second".to_string()));
        assert_eq!(event_loop.now(), ms(10));
    }

    #[test]
    fn race_takes_the_earliest_settlement() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let race = Promise::race(
            &handle,
            [
                Promise::resolve_after(&handle, ms(10), "late"),
                Promise::reject_after(&handle, ms(1), "I am a REJECTOR"),
            ],
        );
        assert_eq!(event_loop.block_on(&race).unwrap(), Err("I am a REJECTOR"));
    }

    #[test]
    fn race_ties_go_to_iteration_order() {
        let event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let race = Promise::<&str, &str>::race(
            &handle,
            [Promise::reject(&handle, "first"), Promise::resolve(&handle, "second")],
        );
        assert_eq!(event_loop.block_on(&race).unwrap(), Err("first"));
    }

    #[test]
    fn race_of_nothing_stalls() {
        let event_loop = EventLoop::new();
        let race = Promise::<(), ()>::race(&event_loop.handle(), Vec::new());
        assert_eq!(
            event_loop.block_on(&race),
            Err(crate::Error::Stalled { id: race.id() })
        );
    }
}
