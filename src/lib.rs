//! One-shot promises with deferred reactions.
//!
//! A [`Promise`] settles exactly once, to a value or a reason. Reactions
//! attached with [`Promise::then`], [`Promise::catch`] and friends run as
//! jobs on a [`Schedule`], never inside the call that attached them. The
//! [`EventLoop`] is a ready-made scheduler with a microtask queue and
//! timers.
//!
//! ```
//! use promise_loop::{EventLoop, Promise};
//!
//! let event_loop = EventLoop::new();
//! let handle = event_loop.handle();
//!
//! let sentence = Promise::<String, String>::resolve(&handle, "one   space  between".into())
//!     .then(|s| Ok(s.split_whitespace().collect::<Vec<_>>().join(" ")))
//!     .then(|s| Ok(format!("{s}.")));
//!
//! assert_eq!(event_loop.block_on(&sentence).unwrap(), Ok("one space between.".to_string()));
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

mod combinators;
pub mod event_loop;
pub mod promise;
pub mod schedule;

pub use event_loop::{Config, EventLoop};
pub use promise::{Promise, Resolution, Resolver, State};
pub use schedule::{Handle, Job, RejectionProbe, Schedule};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("promise #{id} is still pending and the event loop has no work left")]
    Stalled { id: u64 },
    #[error("more than {limit} microtasks ran in a single drain")]
    JobBudgetExceeded { limit: usize },
}

// Critical sections only move data in and out, so a poisoned lock still
// holds consistent state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
