//! The promise resolution procedure.
//!
//! Settles a promise with an arbitrary value, adopting the state of promises
//! and foreign thenables along the way.
use crate::{argument, Error, Function, Promise, Value};
use std::{cell::Cell, rc::Rc};
use tracing::{debug, trace};

/// A one-shot flag shared by a pair of resolving callbacks.
#[derive(Clone, Debug, Default)]
pub(crate) struct Latch(Rc<Cell<bool>>);

impl Latch {
    /// Returns `true` for the first call only.
    pub(crate) fn fire(&self) -> bool {
        !self.0.replace(true)
    }
}

/// The foreign thenables currently being adopted on behalf of one promise,
/// innermost first. A thenable that shows up on its own lineage is retried
/// from a fresh microtask, so an endless cycle spends the loop's task budget
/// instead of the stack.
#[derive(Clone, Default)]
struct Lineage(Option<Rc<Link>>);

struct Link {
    thenable: Value,
    parent: Lineage,
}

impl Lineage {
    fn contains(&self, value: &Value) -> bool {
        let mut cursor = &self.0;
        while let Some(link) = cursor {
            if link.thenable.is_same(value) {
                return true;
            }
            cursor = &link.parent.0;
        }
        false
    }

    fn push(&self, thenable: Value) -> Lineage {
        Lineage(Some(Rc::new(Link {
            thenable,
            parent: self.clone(),
        })))
    }
}

pub(crate) fn resolve_promise(promise: &Promise, x: Value) {
    resolve_with(promise, x, &Lineage::default())
}

fn resolve_with(promise: &Promise, x: Value, lineage: &Lineage) {
    match x {
        Value::Promise(ref other) if other.ptr_eq(promise) => {
            debug!(id = promise.id(), "promise resolved with itself");
            promise.settle_rejected(Error::ChainingCycle.into());
        }
        Value::Promise(other) => adopt(promise, &other),
        Value::Object(_) | Value::Function(_) if lineage.contains(&x) => {
            debug!(id = promise.id(), "thenable re-entered its own adoption, deferred");
            let deferred = promise.clone();
            promise
                .event_loop()
                .queue_microtask(move || resolve_promise(&deferred, x));
        }
        Value::Object(_) | Value::Function(_) => {
            let then = match x.get("then") {
                Ok(then) => then,
                Err(thrown) => return promise.settle_rejected(thrown),
            };
            match then {
                Value::Function(then) => call_then(promise, x, &then, lineage),
                _ => promise.settle_fulfilled(x),
            }
        }
        _ => promise.settle_fulfilled(x),
    }
}

/// Follows another promise of this type. Its outcome arrives through a
/// reaction, so the adoption never recurses on the current stack.
fn adopt(promise: &Promise, other: &Promise) {
    let on_fulfilled = promise.clone();
    let on_rejected = promise.clone();
    other.then_with(
        Some(Box::new(move |value| {
            resolve_promise(&on_fulfilled, value);
            Ok(Value::Undefined)
        })),
        Some(Box::new(move |reason| {
            on_rejected.settle_rejected(reason);
            Ok(Value::Undefined)
        })),
    );
}

fn call_then(promise: &Promise, thenable: Value, then: &Function, lineage: &Lineage) {
    let latch = Latch::default();
    let lineage = lineage.push(thenable.clone());

    let resolve = {
        let (promise, latch) = (promise.clone(), latch.clone());
        Function::new(move |_, args| {
            if latch.fire() {
                resolve_with(&promise, argument(args, 0), &lineage);
            } else {
                trace!(id = promise.id(), "thenable resolved twice, ignored");
            }
            Ok(Value::Undefined)
        })
    };
    let reject = {
        let (promise, latch) = (promise.clone(), latch.clone());
        Function::new(move |_, args| {
            if latch.fire() {
                promise.settle_rejected(argument(args, 0));
            } else {
                trace!(id = promise.id(), "thenable rejected after settling, ignored");
            }
            Ok(Value::Undefined)
        })
    };

    if let Err(thrown) = then.call(&thenable, &[resolve.into(), reject.into()]) {
        if latch.fire() {
            promise.settle_rejected(thrown);
        } else {
            trace!(id = promise.id(), %thrown, "then threw after settling, ignored");
        }
    }
}
