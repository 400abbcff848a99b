//! Eventual send: deliver an [`Invocation`] to a value that may be local,
//! remote, or not yet known.
//!
//! - local capability: invoked immediately
//! - presence, or promise pending on the peer: handed to its handler, which
//!   pipelines the call over the connection
//! - locally pending promise: queued until it settles (needs a
//!   [`tokio::task::LocalSet`])
//! - plain record: property reads only

use crate::invocation::Invocation;
use crate::promise::Promise;
use crate::value::Value;

/// Send `invocation` to `target`, returning a promise for the result.
pub fn send(target: &Value, invocation: Invocation) -> Promise {
    match target {
        Value::Promise(promise) => send_to_promise(promise, invocation),
        Value::Remotable(remotable) => match remotable.handler() {
            Some(handler) => handler.handle(invocation),
            None => match remotable.exo() {
                Some(exo) => Promise::from_outcome(exo.invoke(&invocation)),
                None => Promise::rejected(Value::type_error("remotable has no target")),
            },
        },
        Value::Record(entries) => match &invocation {
            Invocation::Get { prop } => {
                Promise::resolved(entries.get(prop).cloned().unwrap_or_default())
            }
            _ => Promise::rejected(Value::type_error(format!(
                "cannot {} a record",
                invocation.op_name()
            ))),
        },
        other => Promise::rejected(Value::type_error(format!(
            "target {other:?} cannot {}",
            describe(&invocation)
        ))),
    }
}

fn send_to_promise(promise: &Promise, invocation: Invocation) -> Promise {
    if let Some(outcome) = promise.peek() {
        return match outcome {
            Ok(value) => send(&value, invocation),
            Err(reason) => Promise::rejected(reason),
        };
    }
    if let Some(handler) = promise.handler() {
        return handler.handle(invocation);
    }

    let (result, settler) = Promise::pending();
    let waiting = promise.clone();
    tokio::task::spawn_local(async move {
        match waiting.settled().await {
            Ok(value) => settler.resolve(Value::Promise(send(&value, invocation))),
            Err(reason) => settler.reject(reason),
        };
    });
    result
}

fn describe(invocation: &Invocation) -> String {
    match invocation.name() {
        Some(name) => format!("{} {name:?}", invocation.op_name()),
        None => invocation.op_name().to_owned(),
    }
}

/// Shorthand for `send(target, Invocation::get(prop))`.
pub fn get(target: &Value, prop: impl Into<String>) -> Promise {
    send(target, Invocation::get(prop))
}

/// Shorthand for `send(target, Invocation::apply_method(method, args))`.
pub fn call(
    target: &Value,
    method: impl Into<String>,
    args: impl IntoIterator<Item = Value>,
) -> Promise {
    send(target, Invocation::apply_method(method, args))
}
