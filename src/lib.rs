//! Promises/A+ deferred values for a cooperative, single-threaded event loop.
//!
//! A [`Promise`] is a single-assignment container for the eventual outcome of
//! some computation. It is settled once, either fulfilled with a value or
//! rejected with a reason, and [`Promise::then`] chains new promises onto
//! that outcome. Reactions always run later, from the microtask queue of an
//! [`EventLoop`], never inside the call that registers them.
//!
//! Resolving a promise with another promise, or with any object exposing a
//! callable `then`, makes it adopt that value's outcome. Foreign thenables are
//! treated as untrusted: each gets one `then` lookup, and only the first of
//! its callbacks has any effect.
//!
//! # Examples
//!
//! ```
//! use promise_aplus::{block_on, Promise, Value};
//!
//! let sum = Promise::all(vec![Value::from(1), Promise::resolve(2).into()])
//!     .then(|values| match values.as_array() {
//!         Some([Value::Number(a), Value::Number(b)]) => Ok((a + b).into()),
//!         _ => Err("unexpected".into()),
//!     });
//! assert_eq!(block_on(sum).unwrap(), Ok(Value::from(3)));
//! ```
use thiserror::Error;

pub mod combinators;
pub mod deferred;
pub mod promise;
mod resolution;
pub mod scheduler;
pub mod value;

pub use deferred::{deferred, Deferred};
pub use promise::{Callback, Promise, Reject, Resolve, State};
pub use scheduler::{block_on, queue_microtask, run, set_timeout, Builder, EventLoop};
pub use value::{argument, Function, Object, Property, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("TypeError: Chaining cycle detected for promise")]
    ChainingCycle,
    #[error("TypeError: {0} is not iterable")]
    NotIterable(&'static str),
    #[error("TypeError: {0} is not a function")]
    NotCallable(&'static str),
    #[error("AggregateError: All promises were rejected")]
    Aggregate(Vec<Value>),
    #[error("event loop went idle before the future completed")]
    Stalled,
    #[error("event loop ran more than {0} tasks")]
    BudgetExhausted(usize),
}

impl Error {
    /// The rejection reasons an `Aggregate` error carries, in input order.
    pub fn reasons(&self) -> &[Value] {
        match self {
            Error::Aggregate(reasons) => reasons,
            _ => &[],
        }
    }
}
