use crate::{Promise, Reject, Resolve};

/// A pending promise together with the handles that settle it, for code that
/// needs to drive a promise from outside an executor.
///
/// Every call returns an independent record; nothing is shared between them.
///
/// # Examples
///
/// ```
/// use promise_aplus::{deferred, run, State, Value};
/// let d = deferred();
/// let doubled = d.promise.then(|v| match v {
///     Value::Number(n) => Ok(Value::Number(n * 2.0)),
///     other => Err(other),
/// });
/// d.resolve.call(21);
/// d.reject.call("ignored, already resolved");
/// run().unwrap();
/// assert_eq!(doubled.state(), State::Fulfilled(Value::from(42)));
/// ```
#[derive(Clone, Debug)]
pub struct Deferred {
    pub promise: Promise,
    pub resolve: Resolve,
    pub reject: Reject,
}

impl Deferred {
    pub fn new() -> Self {
        let promise = Promise::pending();
        let (resolve, reject) = promise.resolving_functions();
        Self {
            promise,
            resolve,
            reject,
        }
    }
}

impl Default for Deferred {
    fn default() -> Self {
        Self::new()
    }
}

/// Shorthand for [`Deferred::new`].
pub fn deferred() -> Deferred {
    Deferred::new()
}
