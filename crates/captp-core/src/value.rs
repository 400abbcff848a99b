//! The values that travel over a connection.
//!
//! Plain data is copied. Capabilities ([`Remotable`]s and [`Promise`]s) are
//! passed by reference: two `Value`s naming the same capability compare
//! equal, and the engine keys its tables on that identity.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::invocation::Invocation;
use crate::promise::{Promise, WeakPromise};

/// A dynamically typed value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
    Error(ErrorValue),
    Remotable(Remotable),
    Promise(Promise),
}

/// An error passed by copy, usually as a rejection reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl Value {
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Value::Error(ErrorValue {
            name: name.into(),
            message: message.into(),
        })
    }

    /// A `TypeError`, the usual reason for a malformed invocation.
    pub fn type_error(message: impl Into<String>) -> Self {
        Value::error("TypeError", message)
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    pub fn record<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Record(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// A local capability whose behaviour is the closure `f`.
    pub fn far(
        iface: impl Into<String>,
        f: impl Fn(&Invocation) -> Result<Value, Value> + 'static,
    ) -> Self {
        Value::Remotable(Remotable::local(iface, Rc::new(f)))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Value::Promise(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_remotable(&self) -> Option<&Remotable> {
        match self {
            Value::Remotable(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, Value::Promise(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Whether this value is passed by reference.
    pub fn is_capability(&self) -> bool {
        matches!(self, Value::Remotable(_) | Value::Promise(_))
    }

    /// Identity of a capability; `None` for plain data.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Remotable(r) => Some(r.identity()),
            Value::Promise(p) => Some(p.identity()),
            _ => None,
        }
    }

    /// The handler of a remote capability, if this value is one.
    pub(crate) fn handler(&self) -> Option<Rc<dyn Handler>> {
        match self {
            Value::Remotable(r) => r.handler(),
            Value::Promise(p) => p.handler(),
            _ => None,
        }
    }

    /// Hang `attachment` off a capability so it is dropped with it.
    pub(crate) fn attach(&self, attachment: Box<dyn Any>) {
        match self {
            Value::Remotable(r) => r.attach(attachment),
            Value::Promise(p) => p.attach(attachment),
            _ => {}
        }
    }

    /// A non-owning reference to a capability; `None` for plain data.
    pub(crate) fn downgrade(&self) -> Option<WeakValue> {
        match self {
            Value::Remotable(r) => Some(WeakValue::Remotable(Rc::downgrade(&r.inner))),
            Value::Promise(p) => Some(WeakValue::Promise(p.downgrade())),
            _ => None,
        }
    }

    /// Visit every capability reachable through lists and records.
    pub fn visit_capabilities<E>(
        &self,
        f: &mut impl FnMut(&Value) -> Result<(), E>,
    ) -> Result<(), E> {
        match self {
            Value::Remotable(_) | Value::Promise(_) => f(self),
            Value::List(items) => items.iter().try_for_each(|v| v.visit_capabilities(f)),
            Value::Record(entries) => entries.values().try_for_each(|v| v.visit_capabilities(f)),
            _ => Ok(()),
        }
    }
}

#[derive(Clone)]
pub(crate) enum WeakValue {
    Remotable(Weak<RemotableInner>),
    Promise(WeakPromise),
}

impl WeakValue {
    pub(crate) fn upgrade(&self) -> Option<Value> {
        match self {
            WeakValue::Remotable(w) => w.upgrade().map(|inner| Value::Remotable(Remotable { inner })),
            WeakValue::Promise(w) => w.upgrade().map(Value::Promise),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Remotable(a), Value::Remotable(b)) => a.identity() == b.identity(),
            (Value::Promise(a), Value::Promise(b)) => a.identity() == b.identity(),
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
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::List(items) => f.debug_list().entries(items).finish(),
            Value::Record(entries) => f.debug_map().entries(entries).finish(),
            Value::Error(e) => write!(f, "Error({e})"),
            Value::Remotable(r) => write!(f, "[{}]", r.iface()),
            Value::Promise(p) => write!(f, "{p:?}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Promise> for Value {
    fn from(p: Promise) -> Self {
        Value::Promise(p)
    }
}

impl From<Remotable> for Value {
    fn from(r: Remotable) -> Self {
        Value::Remotable(r)
    }
}

/// Behaviour of a local capability.
///
/// The result may itself be a [`Value::Promise`] for work that completes
/// later. An `Err` is a rejection delivered to the caller.
pub trait Exo {
    fn invoke(&self, invocation: &Invocation) -> Result<Value, Value>;
}

impl<F> Exo for F
where
    F: Fn(&Invocation) -> Result<Value, Value>,
{
    fn invoke(&self, invocation: &Invocation) -> Result<Value, Value> {
        self(invocation)
    }
}

/// Routes invocations on a remote capability (a presence, or a promise for a
/// remote result) to wherever it lives.
pub trait Handler {
    fn handle(&self, invocation: Invocation) -> Promise;

    fn as_any(&self) -> &dyn Any;
}

/// A capability passed by reference: either a local object or a presence
/// standing in for an object on the other side.
#[derive(Clone)]
pub struct Remotable {
    inner: Rc<RemotableInner>,
}

pub(crate) struct RemotableInner {
    iface: String,
    target: Target,
    attachments: RefCell<Vec<Box<dyn Any>>>,
}

enum Target {
    Local(Rc<dyn Exo>),
    Presence(Rc<dyn Handler>),
}

impl Remotable {
    pub fn local(iface: impl Into<String>, exo: Rc<dyn Exo>) -> Self {
        Self::with_target(iface.into(), Target::Local(exo))
    }

    pub fn presence(iface: impl Into<String>, handler: Rc<dyn Handler>) -> Self {
        Self::with_target(iface.into(), Target::Presence(handler))
    }

    fn with_target(iface: String, target: Target) -> Self {
        Self {
            inner: Rc::new(RemotableInner {
                iface,
                target,
                attachments: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn iface(&self) -> &str {
        &self.inner.iface
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn is_presence(&self) -> bool {
        matches!(self.inner.target, Target::Presence(_))
    }

    pub fn exo(&self) -> Option<&Rc<dyn Exo>> {
        match &self.inner.target {
            Target::Local(exo) => Some(exo),
            Target::Presence(_) => None,
        }
    }

    pub(crate) fn handler(&self) -> Option<Rc<dyn Handler>> {
        match &self.inner.target {
            Target::Presence(h) => Some(h.clone()),
            Target::Local(_) => None,
        }
    }

    pub(crate) fn attach(&self, attachment: Box<dyn Any>) {
        self.inner.attachments.borrow_mut().push(attachment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(inv: &Invocation) -> Result<Value, Value> {
        Ok(inv.to_value())
    }

    #[test]
    fn capabilities_compare_by_identity() {
        let a = Value::far("Echo", echo);
        let b = Value::far("Echo", echo);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.identity(), a.clone().identity());
    }

    #[test]
    fn data_compares_structurally() {
        let a = Value::record([("x", Value::Int(1)), ("y", Value::list([Value::Null]))]);
        let b = Value::record([("x", Value::Int(1)), ("y", Value::list([Value::Null]))]);
        assert_eq!(a, b);
        assert_ne!(Value::Int(1), Value::Float(1.0));
    }

    #[test]
    fn visit_finds_nested_capabilities() {
        let cap = Value::far("Echo", echo);
        let v = Value::list([
            Value::from("x"),
            Value::record([("inner", Value::list([cap.clone()]))]),
        ]);
        let mut seen = Vec::new();
        v.visit_capabilities(&mut |c| {
            seen.push(c.clone());
            Ok::<_, ()>(())
        })
        .unwrap();
        assert_eq!(seen, vec![cap]);
    }
}
