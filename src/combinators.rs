//! Promise constructors and combinators.
//!
//! Every combinator takes its input as a [`Value`] and rejects with
//! [`Error::NotIterable`] when it is not an array, so callers never see a
//! synchronous failure. All of them are built from `resolve` and `then`.
use crate::{resolution::resolve_promise, Deferred, Error, Object, Promise, Value};
use std::{cell::RefCell, rc::Rc};

/// Countdown over per-index results, shared by the reactions of one
/// combinator call.
struct Tally {
    slots: Vec<Value>,
    remaining: usize,
}

impl Tally {
    fn new(len: usize) -> Rc<RefCell<Tally>> {
        Rc::new(RefCell::new(Tally {
            slots: vec![Value::Undefined; len],
            remaining: len,
        }))
    }

    /// Records `value` at `index`; returns every slot once the last one is in.
    fn record(tally: &RefCell<Tally>, index: usize, value: Value) -> Option<Vec<Value>> {
        let mut tally = tally.borrow_mut();
        tally.slots[index] = value;
        tally.remaining -= 1;
        (tally.remaining == 0).then(|| std::mem::take(&mut tally.slots))
    }
}

fn items_of(items: Value) -> Result<Rc<[Value]>, Promise> {
    match items {
        Value::Array(items) => Ok(items),
        other => Err(Promise::reject(Error::NotIterable(other.type_name()))),
    }
}

fn settlement(status: &str, key: &str, outcome: Value) -> Value {
    Object::new().with("status", status).with(key, outcome).into()
}

impl Promise {
    /// Returns `value` itself when it is already a promise; otherwise a new
    /// promise resolved with it, adopting it if it is a thenable.
    ///
    /// ```
    /// use promise_aplus::{Promise, State, Value};
    /// let p = Promise::resolve(5);
    /// assert_eq!(p.state(), State::Fulfilled(Value::from(5)));
    /// assert!(Promise::resolve(p.clone()).ptr_eq(&p));
    /// ```
    pub fn resolve(value: impl Into<Value>) -> Promise {
        match value.into() {
            Value::Promise(promise) => promise,
            other => {
                let promise = Promise::pending();
                resolve_promise(&promise, other);
                promise
            }
        }
    }

    pub fn reject(reason: impl Into<Value>) -> Promise {
        let promise = Promise::pending();
        promise.settle_rejected(reason.into());
        promise
    }

    /// Fulfills with every item's value, in input order, or rejects with the
    /// first rejection. Primitive items are copied through as they are.
    pub fn all(items: impl Into<Value>) -> Promise {
        let items = match items_of(items.into()) {
            Ok(items) => items,
            Err(rejected) => return rejected,
        };
        if items.is_empty() {
            return Promise::resolve(Vec::<Value>::new());
        }

        let Deferred { promise, resolve, reject } = Deferred::new();
        let tally = Tally::new(items.len());
        for (index, item) in items.iter().enumerate() {
            match item {
                Value::Promise(_) | Value::Object(_) | Value::Function(_) => {
                    let (tally, resolve, reject) = (tally.clone(), resolve.clone(), reject.clone());
                    Promise::resolve(item.clone()).then_or_else(
                        move |value| {
                            if let Some(values) = Tally::record(&tally, index, value) {
                                resolve.call(values);
                            }
                            Ok(Value::Undefined)
                        },
                        move |reason| {
                            reject.call(reason);
                            Ok(Value::Undefined)
                        },
                    );
                }
                primitive => {
                    if let Some(values) = Tally::record(&tally, index, primitive.clone()) {
                        resolve.call(values);
                    }
                }
            }
        }
        promise
    }

    /// Fulfills, once every item has settled, with one record per item:
    /// `{status: "fulfilled", value}` or `{status: "rejected", reason}`.
    /// Never rejects for a valid input.
    pub fn all_settled(items: impl Into<Value>) -> Promise {
        let items = match items_of(items.into()) {
            Ok(items) => items,
            Err(rejected) => return rejected,
        };
        if items.is_empty() {
            return Promise::resolve(Vec::<Value>::new());
        }

        let Deferred { promise, resolve, .. } = Deferred::new();
        let tally = Tally::new(items.len());
        for (index, item) in items.iter().enumerate() {
            let (on_fulfilled, on_rejected) = (tally.clone(), tally.clone());
            let finish = resolve.clone();
            let also_finish = resolve.clone();
            Promise::resolve(item.clone()).then_or_else(
                move |value| {
                    let record = settlement("fulfilled", "value", value);
                    if let Some(records) = Tally::record(&on_fulfilled, index, record) {
                        finish.call(records);
                    }
                    Ok(Value::Undefined)
                },
                move |reason| {
                    let record = settlement("rejected", "reason", reason);
                    if let Some(records) = Tally::record(&on_rejected, index, record) {
                        also_finish.call(records);
                    }
                    Ok(Value::Undefined)
                },
            );
        }
        promise
    }

    /// Settles the same way as the first item to settle. An empty input
    /// never settles.
    pub fn race(items: impl Into<Value>) -> Promise {
        let items = match items_of(items.into()) {
            Ok(items) => items,
            Err(rejected) => return rejected,
        };

        let Deferred { promise, resolve, reject } = Deferred::new();
        for item in items.iter() {
            let (resolve, reject) = (resolve.clone(), reject.clone());
            Promise::resolve(item.clone()).then_or_else(
                move |value| {
                    resolve.call(value);
                    Ok(Value::Undefined)
                },
                move |reason| {
                    reject.call(reason);
                    Ok(Value::Undefined)
                },
            );
        }
        promise
    }

    /// Fulfills with the first item to fulfill. Rejects with
    /// [`Error::Aggregate`] holding every reason, in input order, only when
    /// all items reject; an empty input rejects right away.
    pub fn any(items: impl Into<Value>) -> Promise {
        let items = match items_of(items.into()) {
            Ok(items) => items,
            Err(rejected) => return rejected,
        };
        if items.is_empty() {
            return Promise::reject(Error::Aggregate(Vec::new()));
        }

        let Deferred { promise, resolve, reject } = Deferred::new();
        let tally = Tally::new(items.len());
        for (index, item) in items.iter().enumerate() {
            let (tally, resolve, reject) = (tally.clone(), resolve.clone(), reject.clone());
            Promise::resolve(item.clone()).then_or_else(
                move |value| {
                    resolve.call(value);
                    Ok(Value::Undefined)
                },
                move |reason| {
                    if let Some(reasons) = Tally::record(&tally, index, reason) {
                        reject.call(Error::Aggregate(reasons));
                    }
                    Ok(Value::Undefined)
                },
            );
        }
        promise
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventLoop, State};

    fn settle(promise: impl FnOnce() -> Promise) -> State {
        let event_loop = EventLoop::new();
        event_loop.enter(|| {
            let promise = promise();
            event_loop.run().unwrap();
            promise.state()
        })
    }

    #[test]
    fn test_resolve_returns_same_promise() {
        let event_loop = EventLoop::new();
        event_loop.enter(|| {
            let p = Promise::pending();
            assert!(Promise::resolve(p.clone()).ptr_eq(&p));
        });
    }

    #[test]
    fn test_reject_is_immediate() {
        let event_loop = EventLoop::new();
        event_loop.enter(|| {
            assert_eq!(Promise::reject("r").state(), State::Rejected("r".into()));
        });
    }

    #[test]
    fn test_non_array_input_rejects() {
        let combinators: [(&str, fn(Value) -> Promise); 4] = [
            ("all", Promise::all),
            ("all_settled", Promise::all_settled),
            ("race", Promise::race),
            ("any", Promise::any),
        ];
        for (name, combinator) in combinators {
            assert_eq!(
                settle(|| combinator(5.into())),
                State::Rejected(Error::NotIterable("number").into()),
                "{name}"
            );
        }
    }

    #[test]
    fn test_all_of_primitives_is_synchronous() {
        let event_loop = EventLoop::new();
        event_loop.enter(|| {
            let all = Promise::all(vec![Value::from(1), "two".into()]);
            assert_eq!(all.state(), State::Fulfilled(vec![Value::from(1), "two".into()].into()));
        });
    }

    #[test]
    fn test_all_keeps_input_order() {
        let state = settle(|| {
            let late = crate::deferred();
            let resolve = late.resolve.clone();
            crate::set_timeout(std::time::Duration::from_millis(5), move || resolve.call("late"));
            Promise::all(vec![Value::from(late.promise), Promise::resolve("early").into(), 3.into()])
        });
        assert_eq!(
            state,
            State::Fulfilled(vec![Value::from("late"), "early".into(), 3.into()].into())
        );
    }

    #[test]
    fn test_any_collects_reasons_by_index() {
        let state = settle(|| {
            let first = crate::deferred();
            let reject = first.reject.clone();
            crate::set_timeout(std::time::Duration::from_millis(5), move || reject.call("a"));
            Promise::any(vec![Value::from(first.promise), Promise::reject("b").into()])
        });
        assert_eq!(
            state,
            State::Rejected(Error::Aggregate(vec!["a".into(), "b".into()]).into())
        );
    }

    #[test]
    fn test_any_fulfills_with_first_fulfillment() {
        let state = settle(|| {
            Promise::any(vec![Value::from(Promise::reject("no")), 7.into(), 8.into()])
        });
        assert_eq!(state, State::Fulfilled(7.into()));
    }

    #[test]
    fn test_race_with_primitive_wins_over_pending() {
        let state = settle(|| Promise::race(vec![Value::from(crate::deferred().promise), "now".into()]));
        assert_eq!(state, State::Fulfilled("now".into()));
    }
}
