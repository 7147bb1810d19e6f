//! The promise state container and its chaining operators.
//!
//! A `Promise` starts out pending and settles at most once. Reactions
//! registered with [`Promise::then`] are queued per disposition and handed to
//! the event loop, in registration order, when the promise settles. A
//! reaction registered on an already-settled promise is scheduled right away,
//! but still runs on a later turn.
//!
//! # Examples
//!
//! ```
//! use promise_aplus::{run, Promise, State, Value};
//!
//! let promise = Promise::new(|resolve, _reject| {
//!     resolve.call("🍓");
//!     Ok(())
//! });
//! let chained = promise.then(|v| Ok(format!("got {v}").into()));
//! // Handlers never run synchronously.
//! assert!(chained.is_pending());
//! run().unwrap();
//! assert_eq!(chained.state(), State::Fulfilled(Value::from("got 🍓")));
//! ```
use crate::{
    resolution::{resolve_promise, Latch},
    value::debug_once,
    EventLoop, Value,
};
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll, Waker},
};
use tracing::trace;

/// A reaction handler. `Err` is a thrown value and rejects the dependent
/// promise; `Ok` resolves it, adopting the value if it is a thenable.
pub type Callback = Box<dyn FnOnce(Value) -> Result<Value, Value>>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

impl State {
    pub fn is_pending(&self) -> bool {
        matches!(self, State::Pending)
    }
}

#[derive(Clone)]
pub struct Promise {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    id: u64,
    state: State,
    fulfill_reactions: Vec<Reaction>,
    reject_reactions: Vec<Reaction>,
    wakers: Vec<Waker>,
    event_loop: EventLoop,
}

struct Reaction {
    handler: Option<Callback>,
    downstream: Promise,
}

#[derive(Clone, Copy, Debug)]
enum Disposition {
    Fulfilled,
    Rejected,
}

impl Reaction {
    /// Runs on the event loop, never from inside `then` or a settlement.
    fn fire(self, disposition: Disposition, outcome: Value) {
        match (self.handler, disposition) {
            (None, Disposition::Fulfilled) => self.downstream.settle_fulfilled(outcome),
            (None, Disposition::Rejected) => self.downstream.settle_rejected(outcome),
            (Some(handler), _) => match handler(outcome) {
                Ok(value) => resolve_promise(&self.downstream, value),
                Err(thrown) => self.downstream.settle_rejected(thrown),
            },
        }
    }
}

/// Settles a promise through the resolution procedure. Shares a one-shot
/// latch with the matching [`Reject`]: whichever is called first wins, and
/// every later call to either is ignored.
#[derive(Clone, Debug)]
pub struct Resolve {
    promise: Promise,
    latch: Latch,
}

/// Rejects a promise. See [`Resolve`].
#[derive(Clone, Debug)]
pub struct Reject {
    promise: Promise,
    latch: Latch,
}

impl Resolve {
    pub fn call(&self, value: impl Into<Value>) {
        if self.latch.fire() {
            resolve_promise(&self.promise, value.into());
        } else {
            trace!(id = self.promise.id(), "resolve ignored, already resolved");
        }
    }
}

impl Reject {
    pub fn call(&self, reason: impl Into<Value>) {
        if self.latch.fire() {
            self.promise.settle_rejected(reason.into());
        } else {
            trace!(id = self.promise.id(), "reject ignored, already resolved");
        }
    }
}

impl Promise {
    /// Creates a promise and runs `executor` synchronously with its resolving
    /// functions. An `Err` from the executor rejects the promise, unless it
    /// was already resolved.
    pub fn new<E>(executor: E) -> Promise
    where
        E: FnOnce(Resolve, Reject) -> Result<(), Value>,
    {
        let promise = Promise::pending();
        let (resolve, reject) = promise.resolving_functions();
        if let Err(thrown) = executor(resolve, reject.clone()) {
            reject.call(thrown);
        }
        promise
    }

    /// A fresh pending promise bound to the current event loop.
    pub(crate) fn pending() -> Promise {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Promise {
            inner: Rc::new(RefCell::new(Inner {
                id,
                state: State::Pending,
                fulfill_reactions: Vec::new(),
                reject_reactions: Vec::new(),
                wakers: Vec::new(),
                event_loop: EventLoop::current(),
            })),
        }
    }

    pub(crate) fn resolving_functions(&self) -> (Resolve, Reject) {
        let latch = Latch::default();
        (
            Resolve {
                promise: self.clone(),
                latch: latch.clone(),
            },
            Reject {
                promise: self.clone(),
                latch,
            },
        )
    }

    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn state(&self) -> State {
        self.inner.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.borrow().state.is_pending()
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// The loop this promise was created under; its reactions run there.
    pub(crate) fn event_loop(&self) -> EventLoop {
        self.inner.borrow().event_loop.clone()
    }

    pub(crate) fn settle_fulfilled(&self, value: Value) {
        self.settle(State::Fulfilled(value));
    }

    pub(crate) fn settle_rejected(&self, reason: Value) {
        self.settle(State::Rejected(reason));
    }

    fn settle(&self, state: State) {
        let (disposition, outcome) = match &state {
            State::Fulfilled(value) => (Disposition::Fulfilled, value.clone()),
            State::Rejected(reason) => (Disposition::Rejected, reason.clone()),
            State::Pending => return,
        };
        let (reactions, wakers, event_loop) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.state.is_pending() {
                return;
            }
            trace!(id = inner.id, ?disposition, "promise settled");
            inner.state = state;
            let fulfill = std::mem::take(&mut inner.fulfill_reactions);
            let reject = std::mem::take(&mut inner.reject_reactions);
            let reactions = match disposition {
                Disposition::Fulfilled => fulfill,
                Disposition::Rejected => reject,
            };
            (
                reactions,
                std::mem::take(&mut inner.wakers),
                inner.event_loop.clone(),
            )
        };
        for reaction in reactions {
            let outcome = outcome.clone();
            event_loop.queue_microtask(move || reaction.fire(disposition, outcome));
        }
        for waker in wakers {
            waker.wake()
        }
    }

    /// Registers both handlers and returns the dependent promise they settle.
    ///
    /// A missing handler passes the outcome through unchanged.
    pub fn then_with(&self, on_fulfilled: Option<Callback>, on_rejected: Option<Callback>) -> Promise {
        let downstream = Promise::pending();
        let fulfill_reaction = Reaction {
            handler: on_fulfilled,
            downstream: downstream.clone(),
        };
        let reject_reaction = Reaction {
            handler: on_rejected,
            downstream: downstream.clone(),
        };

        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        let (reaction, disposition, outcome) = match &inner.state {
            State::Pending => {
                inner.fulfill_reactions.push(fulfill_reaction);
                inner.reject_reactions.push(reject_reaction);
                return downstream;
            }
            State::Fulfilled(value) => (fulfill_reaction, Disposition::Fulfilled, value.clone()),
            State::Rejected(reason) => (reject_reaction, Disposition::Rejected, reason.clone()),
        };
        trace!(id = inner.id, ?disposition, "reaction scheduled on settled promise");
        inner
            .event_loop
            .queue_microtask(move || reaction.fire(disposition, outcome));
        downstream
    }

    /// Chains `on_fulfilled` onto this promise; a rejection passes through.
    ///
    /// `Promise` is also a [`Future`], so with `futures::FutureExt` in scope
    /// `promise.then(..)` resolves to the by-value combinator from that trait
    /// instead. Call `FutureExt` methods fully qualified in such modules.
    pub fn then<F>(&self, on_fulfilled: F) -> Promise
    where
        F: FnOnce(Value) -> Result<Value, Value> + 'static,
    {
        self.then_with(Some(Box::new(on_fulfilled)), None)
    }

    pub fn then_or_else<F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise
    where
        F: FnOnce(Value) -> Result<Value, Value> + 'static,
        R: FnOnce(Value) -> Result<Value, Value> + 'static,
    {
        self.then_with(Some(Box::new(on_fulfilled)), Some(Box::new(on_rejected)))
    }

    pub fn catch<R>(&self, on_rejected: R) -> Promise
    where
        R: FnOnce(Value) -> Result<Value, Value> + 'static,
    {
        self.then_with(None, Some(Box::new(on_rejected)))
    }

    /// Runs `on_settled` whichever way this promise settles, then passes the
    /// original outcome through.
    ///
    /// If `on_settled` fails, or returns a promise that rejects, the returned
    /// promise rejects with that reason instead. A returned promise is waited
    /// on before the outcome passes through.
    pub fn finally<C>(&self, on_settled: C) -> Promise
    where
        C: Fn() -> Result<Value, Value> + 'static,
    {
        let on_settled: Rc<dyn Fn() -> Result<Value, Value>> = Rc::new(on_settled);
        self.finally_with(Some(on_settled))
    }

    /// [`Promise::finally`] with an optional callback. Without one the
    /// returned promise simply mirrors this one.
    pub fn finally_with(&self, on_settled: Option<Rc<dyn Fn() -> Result<Value, Value>>>) -> Promise {
        let Some(on_settled) = on_settled else {
            return self.then_with(None, None);
        };
        let after_fulfilled = on_settled.clone();
        self.then_or_else(
            move |value| {
                let waited = Promise::resolve(after_fulfilled()?);
                Ok(waited.then(move |_| Ok(value)).into())
            },
            move |reason| {
                let waited = Promise::resolve(on_settled()?);
                Ok(waited.then(move |_| Err(reason)).into())
            },
        )
    }
}

impl Future for Promise {
    type Output = Result<Value, Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.inner.borrow_mut();
        let inner = &mut *guard;
        match &inner.state {
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(reason) => Poll::Ready(Err(reason.clone())),
            State::Pending => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => debug_once(Rc::as_ptr(&self.inner).cast(), f, |f| {
                f.debug_struct("Promise")
                    .field("id", &inner.id)
                    .field("state", &inner.state)
                    .finish()
            }),
            Err(_) => f.write_str("Promise { <borrowed> }"),
        }
    }
}
