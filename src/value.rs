//! The dynamic values promises carry.
//!
//! A promise settles with an opaque outcome, and its resolution procedure has
//! to inspect foreign objects for a callable `then`. This module is the small
//! object model both need: primitives, arrays, property bags with getters,
//! native functions, promises and errors.
use crate::{Error, Promise};
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt,
    rc::Rc,
};

/// Signature of a native function: `(this, args) -> return value`, where
/// `Err` carries the thrown value.
pub type NativeFn = dyn Fn(&Value, &[Value]) -> Result<Value, Value>;

thread_local! {
    /// Addresses of the objects and promises being debug-printed on this thread.
    static PRINTING: RefCell<Vec<*const ()>> = const { RefCell::new(Vec::new()) };
}

/// Runs `body` unless `address` is already being printed further up the
/// stack, in which case it writes `[Circular]`.
pub(crate) fn debug_once(
    address: *const (),
    f: &mut fmt::Formatter<'_>,
    body: impl FnOnce(&mut fmt::Formatter<'_>) -> fmt::Result,
) -> fmt::Result {
    let entered = PRINTING.with(|printing| {
        let mut printing = printing.borrow_mut();
        if printing.contains(&address) {
            return false;
        }
        printing.push(address);
        true
    });
    if !entered {
        return f.write_str("[Circular]");
    }
    let out = body(f);
    PRINTING.with(|printing| printing.borrow_mut().retain(|a| *a != address));
    out
}

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(Rc<[Value]>),
    Object(Object),
    Function(Function),
    Promise(Promise),
    Error(Error),
}

/// A callable value.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Function, Value};
/// let double = Function::new(|_this, args| match args.first() {
///     Some(Value::Number(n)) => Ok(Value::Number(n * 2.0)),
///     _ => Err("not a number".into()),
/// });
/// assert_eq!(double.call(&Value::Undefined, &[21.into()]), Ok(42.into()));
/// ```
#[derive(Clone)]
pub struct Function(Rc<NativeFn>);

impl Function {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value, Value> + 'static,
    {
        Self(Rc::new(f))
    }

    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value, Value> {
        (self.0)(this, args)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.0), Rc::as_ptr(&other.0))
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({:p})", Rc::as_ptr(&self.0) as *const ())
    }
}

#[derive(Clone)]
pub enum Property {
    Data(Value),
    /// Invoked with the owning object as receiver on every read.
    Getter(Function),
}

/// A reference-counted property bag. Clones share the same properties.
///
/// # Examples
///
/// ```
/// use promise_aplus::{Object, Value};
/// let record = Object::new().with("status", "fulfilled").with("value", 1);
/// assert_eq!(record.get("status"), Ok(Value::from("fulfilled")));
/// assert_eq!(record.get("missing"), Ok(Value::Undefined));
/// ```
#[derive(Clone, Default)]
pub struct Object(Rc<RefCell<BTreeMap<String, Property>>>);

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        self.0
            .borrow_mut()
            .insert(key.to_owned(), Property::Data(value.into()));
    }

    pub fn define_getter(&self, key: &str, getter: Function) {
        self.0
            .borrow_mut()
            .insert(key.to_owned(), Property::Getter(getter));
    }

    /// Reads a property, running its getter if it has one. Missing keys read
    /// as `Undefined`.
    pub fn get(&self, key: &str) -> Result<Value, Value> {
        // The getter may touch this object again, so release the borrow first.
        let property = self.0.borrow().get(key).cloned();
        match property {
            None => Ok(Value::Undefined),
            Some(Property::Data(value)) => Ok(value),
            Some(Property::Getter(getter)) => getter.call(&Value::Object(self.clone()), &[]),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().keys().cloned().collect()
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(properties) = self.0.try_borrow() else {
            return f.write_str("Object { <borrowed> }");
        };
        debug_once(Rc::as_ptr(&self.0).cast(), f, |f| {
            let mut map = f.debug_map();
            for (key, property) in properties.iter() {
                match property {
                    Property::Data(value) => map.entry(key, value),
                    Property::Getter(_) => map.entry(key, &format_args!("[Getter]")),
                };
            }
            map.finish()
        })
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Promise(_) => "promise",
            Value::Error(_) => "error",
        }
    }

    /// Identity for reference values, value equality for everything else.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
            _ => self == other,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    /// Property read. Only objects have properties; everything else reads
    /// `Undefined`.
    pub fn get(&self, key: &str) -> Result<Value, Value> {
        match self {
            Value::Object(object) => object.get(key),
            _ => Ok(Value::Undefined),
        }
    }

    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value, Value> {
        match self {
            Value::Function(function) => function.call(this, args),
            other => Err(Error::NotCallable(other.type_name()).into()),
        }
    }

    /// Calls the value with an `Undefined` receiver.
    pub fn invoke(&self, args: &[Value]) -> Result<Value, Value> {
        self.call(&Value::Undefined, args)
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Value::Promise(promise) => Some(promise),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&Error> {
        match self {
            Value::Error(error) => Some(error),
            _ => None,
        }
    }
}

/// The `index`th argument, or `Undefined` when the caller passed fewer.
pub fn argument(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Object(object) => object.fmt(f),
            Value::Function(function) => function.fmt(f),
            Value::Promise(promise) => promise.fmt(f),
            Value::Error(error) => write!(f, "Error({error})"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
            Value::Object(_) => f.write_str("[object Object]"),
            Value::Function(_) => f.write_str("function () { [native code] }"),
            Value::Promise(_) => f.write_str("[object Promise]"),
            Value::Error(error) => write!(f, "{error}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Undefined
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items.into())
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Value::Object(object)
    }
}

impl From<Function> for Value {
    fn from(function: Function) -> Self {
        Value::Function(function)
    }
}

impl From<Promise> for Value {
    fn from(promise: Promise) -> Self {
        Value::Promise(promise)
    }
}

impl From<Error> for Value {
    fn from(error: Error) -> Self {
        Value::Error(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_debug_of_self_referencing_object() {
        let object = Object::new().with("name", "loop");
        object.set("me", object.clone());
        assert_eq!(
            format!("{object:?}"),
            r#"{"me": [Circular], "name": "loop"}"#
        );
    }

    #[test]
    fn test_debug_of_promise_holding_itself() {
        let event_loop = crate::EventLoop::new();
        event_loop.enter(|| {
            let holder = Object::new();
            let promise = Promise::resolve(holder.clone());
            holder.set("promise", promise.clone());
            let printed = format!("{promise:?}");
            assert!(printed.contains("[Circular]"), "{printed}");
        });
    }

    #[test]
    fn test_getter_sees_its_object() {
        let object = Object::new().with("answer", 42);
        object.define_getter("then", Function::new(|this, _| this.get("answer")));
        assert_eq!(object.get("then"), Ok(Value::from(42)));
    }

    #[test]
    fn test_getter_runs_on_every_read() {
        let reads = Rc::new(Cell::new(0));
        let object = Object::new();
        let counter = reads.clone();
        object.define_getter(
            "then",
            Function::new(move |_, _| {
                counter.set(counter.get() + 1);
                Ok(Value::Undefined)
            }),
        );
        let _ = object.get("then");
        let _ = object.get("then");
        assert_eq!(reads.get(), 2);
    }

    #[test]
    fn test_throwing_getter() {
        let object = Object::new();
        object.define_getter("then", Function::new(|_, _| Err("boom".into())));
        assert_eq!(object.get("then"), Err(Value::from("boom")));
    }

    #[test]
    fn test_equality_is_identity_for_objects() {
        let a = Object::new();
        let b = Object::new();
        assert_eq!(Value::from(a.clone()), Value::from(a.clone()));
        assert_ne!(Value::from(a), Value::from(b));
        assert_eq!(
            Value::from(vec![Value::from(1), "x".into()]),
            Value::from(vec![Value::from(1), "x".into()])
        );
    }

    #[test]
    fn test_invoke_non_function() {
        assert_eq!(
            Value::from(3).invoke(&[]),
            Err(Value::Error(Error::NotCallable("number")))
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::from(vec![Value::from(1), "a".into(), Value::Null]).to_string(), "1,a,null");
        assert_eq!(Value::from(Error::ChainingCycle).to_string(), "TypeError: Chaining cycle detected for promise");
    }
}
