//! Single-threaded promises with an optional remote handler.
//!
//! A [`Promise`] settles at most once, either directly through its
//! [`Settler`] or by being resolved to another promise, in which case it
//! forwards to that promise from then on. Waiting is done with
//! [`Promise::settled`], which is woken from whatever task settles the
//! chain.
//!
//! A promise for a remote result carries a [`Handler`] so that invocations
//! made while it is still pending are pipelined to the peer instead of
//! waiting for the result to come back.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::task::{Poll, Waker};

use crate::value::{Handler, Value};

/// How a promise settled: `Ok` fulfilled, `Err` rejected with a reason.
pub type Outcome = Result<Value, Value>;

#[derive(Clone)]
pub struct Promise {
    inner: Rc<PromiseInner>,
}

struct PromiseInner {
    state: RefCell<State>,
    handler: Option<Rc<dyn Handler>>,
    attachments: RefCell<Vec<Box<dyn Any>>>,
}

enum State {
    Pending(Vec<Waker>),
    Forwarded(Promise),
    Settled(Outcome),
}

/// A promise reference that does not keep it alive.
#[derive(Clone)]
pub(crate) struct WeakPromise(Weak<PromiseInner>);

impl WeakPromise {
    pub(crate) fn upgrade(&self) -> Option<Promise> {
        self.0.upgrade().map(|inner| Promise { inner })
    }
}

/// The right to settle one [`Promise`].
#[derive(Clone)]
pub struct Settler {
    promise: Promise,
}

impl Promise {
    fn with_state(state: State, handler: Option<Rc<dyn Handler>>) -> Self {
        Self {
            inner: Rc::new(PromiseInner {
                state: RefCell::new(state),
                handler,
                attachments: RefCell::new(Vec::new()),
            }),
        }
    }

    /// A new pending promise and its settler.
    pub fn pending() -> (Promise, Settler) {
        let promise = Self::with_state(State::Pending(Vec::new()), None);
        let settler = Settler {
            promise: promise.clone(),
        };
        (promise, settler)
    }

    /// A pending promise whose invocations are routed to `handler` until it
    /// settles.
    pub fn remote(handler: Rc<dyn Handler>) -> (Promise, Settler) {
        let promise = Self::with_state(State::Pending(Vec::new()), Some(handler));
        let settler = Settler {
            promise: promise.clone(),
        };
        (promise, settler)
    }

    /// A promise for `value`. A promise is returned as is.
    pub fn resolved(value: Value) -> Promise {
        match value {
            Value::Promise(p) => p,
            other => Self::with_state(State::Settled(Ok(other)), None),
        }
    }

    pub fn rejected(reason: Value) -> Promise {
        Self::with_state(State::Settled(Err(reason)), None)
    }

    pub fn from_outcome(outcome: Outcome) -> Promise {
        match outcome {
            Ok(value) => Self::resolved(value),
            Err(reason) => Self::rejected(reason),
        }
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// The promise at the end of the forwarding chain.
    pub fn resolution(&self) -> Promise {
        let mut current = self.clone();
        loop {
            let next = match &*current.inner.state.borrow() {
                State::Forwarded(next) => next.clone(),
                _ => return current.clone(),
            };
            current = next;
        }
    }

    /// The outcome, if the chain has settled.
    pub fn peek(&self) -> Option<Outcome> {
        match &*self.resolution().inner.state.borrow() {
            State::Settled(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.peek().is_none()
    }

    /// Handler of the still-pending end of the chain.
    pub(crate) fn handler(&self) -> Option<Rc<dyn Handler>> {
        let end = self.resolution();
        let pending = matches!(&*end.inner.state.borrow(), State::Pending(_));
        if pending { end.inner.handler.clone() } else { None }
    }

    /// The handler this promise was created with, regardless of state.
    pub(crate) fn own_handler(&self) -> Option<&Rc<dyn Handler>> {
        self.inner.handler.as_ref()
    }

    pub(crate) fn attach(&self, attachment: Box<dyn Any>) {
        self.inner.attachments.borrow_mut().push(attachment);
    }

    pub(crate) fn downgrade(&self) -> WeakPromise {
        WeakPromise(Rc::downgrade(&self.inner))
    }

    /// Wait for the chain to settle.
    pub fn settled(&self) -> impl Future<Output = Outcome> + 'static {
        let promise = self.clone();
        std::future::poll_fn(move |cx| {
            let mut current = promise.clone();
            loop {
                let next = {
                    let mut state = current.inner.state.borrow_mut();
                    match &mut *state {
                        State::Settled(outcome) => return Poll::Ready(outcome.clone()),
                        State::Pending(wakers) => {
                            if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                                wakers.push(cx.waker().clone());
                            }
                            return Poll::Pending;
                        }
                        State::Forwarded(next) => next.clone(),
                    }
                };
                current = next;
            }
        })
    }

    fn transition(&self, next: State) -> bool {
        let wakers = {
            let mut state = self.inner.state.borrow_mut();
            match &mut *state {
                State::Pending(wakers) => {
                    let wakers = std::mem::take(wakers);
                    *state = next;
                    wakers
                }
                _ => return false,
            }
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peek() {
            None => f.write_str("Promise(<pending>)"),
            Some(Ok(v)) => write!(f, "Promise(fulfilled {v:?})"),
            Some(Err(e)) => write!(f, "Promise(rejected {e:?})"),
        }
    }
}

impl Settler {
    pub fn promise(&self) -> &Promise {
        &self.promise
    }

    /// Fulfill with `value`, or follow it if it is a promise. Returns false
    /// if the promise was already resolved.
    pub fn resolve(&self, value: Value) -> bool {
        match value {
            Value::Promise(target) => {
                if target.resolution().ptr_eq(&self.promise) {
                    return self.reject(Value::type_error(
                        "cannot resolve a promise with itself",
                    ));
                }
                self.promise.transition(State::Forwarded(target))
            }
            other => self.promise.transition(State::Settled(Ok(other))),
        }
    }

    pub fn reject(&self, reason: Value) -> bool {
        self.promise.transition(State::Settled(Err(reason)))
    }

    pub fn settle(&self, outcome: Outcome) -> bool {
        match outcome {
            Ok(value) => self.resolve(value),
            Err(reason) => self.reject(reason),
        }
    }
}
