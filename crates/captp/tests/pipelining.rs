//! Two engines over a loopback channel: bootstrap, calls, pipelining and
//! promise resolution.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use captp::{
    Bootstrap, CapTpOptions, Invocation, Message, MessageKind, Promise, SlotKind, Value, call, get,
};
use common::{loopback, quiesce, settle};
use tokio::task::LocalSet;

fn counter(start: i64) -> Value {
    let count = Rc::new(Cell::new(start));
    Value::far("Counter", move |inv: &Invocation| match inv {
        Invocation::ApplyMethod { method, .. } if method == "incr" => {
            count.set(count.get() + 1);
            Ok(Value::Int(count.get()))
        }
        Invocation::Get { prop } if prop == "value" => Ok(Value::Int(count.get())),
        _ => Err(Value::type_error("Counter does not do that")),
    })
}

fn maker() -> Value {
    Value::far("Maker", |inv: &Invocation| match inv {
        Invocation::ApplyMethod { method, args } if method == "makeCounter" => {
            let start = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(counter(start))
        }
        _ => Err(Value::type_error("Maker does not do that")),
    })
}

fn with_maker() -> ((Bootstrap, CapTpOptions), (Bootstrap, CapTpOptions)) {
    (
        (Bootstrap::default(), CapTpOptions::default()),
        (maker().into(), CapTpOptions::default()),
    )
}

#[tokio::test]
async fn bootstrap_is_a_presence_for_the_peer_root() {
    common::init_tracing();
    LocalSet::new()
        .run_until(async {
            let (left, right) = {
                let (l, r) = with_maker();
                loopback(l, r)
            };
            let root = settle(&left.conn.get_bootstrap()).await.unwrap();
            let presence = root.as_remotable().expect("a presence");
            assert!(presence.is_presence());
            assert_eq!(
                left.conn.get_slot_for_value(&root).map(|s| s.kind()),
                Some(SlotKind::Object)
            );
            assert_eq!(right.conn.export_count(), 1);
            assert_eq!(left.conn.stats().received(MessageKind::Return), 1);
            assert_eq!(right.conn.stats().received(MessageKind::Bootstrap), 1);
        })
        .await;
}

#[tokio::test]
async fn pipelined_calls_match_sequential_calls() {
    LocalSet::new()
        .run_until(async {
            let (left, _right) = {
                let (l, r) = with_maker();
                loopback(l, r)
            };

            // Sequential: wait for every result before using it.
            let root = settle(&left.conn.get_bootstrap()).await.unwrap();
            let made = settle(&call(&root, "makeCounter", [Value::Int(10)]))
                .await
                .unwrap();
            let sequential = settle(&call(&made, "incr", [])).await;

            // Pipelined: send everything before any answer is back.
            let sent_before = left.sent();
            let root = Value::Promise(left.conn.get_bootstrap());
            let made = Value::Promise(call(&root, "makeCounter", [Value::Int(10)]));
            let incr = call(&made, "incr", []);
            assert!(incr.is_pending());
            {
                let wire = left.wire.borrow();
                let pipelined: Vec<&Message> = wire[sent_before..].iter().collect();
                assert_eq!(pipelined.len(), 3);
                for msg in &pipelined[1..] {
                    match msg {
                        Message::Call { target, .. } => {
                            assert_eq!(target.kind(), SlotKind::Question);
                            assert!(target.is_remote());
                        }
                        other => panic!("expected a pipelined call, got {other:?}"),
                    }
                }
            }
            assert_eq!(settle(&incr).await, sequential);
            assert_eq!(sequential, Ok(Value::Int(11)));
        })
        .await;
}

#[tokio::test]
async fn rejections_and_property_reads_cross_the_connection() {
    LocalSet::new()
        .run_until(async {
            let (left, _right) = {
                let (l, r) = with_maker();
                loopback(l, r)
            };
            let root = Value::Promise(left.conn.get_bootstrap());
            let made = Value::Promise(call(&root, "makeCounter", [Value::Int(3)]));
            assert_eq!(settle(&get(&made, "value")).await, Ok(Value::Int(3)));

            match settle(&call(&root, "explode", [])).await {
                Err(Value::Error(err)) => {
                    assert_eq!(err.name, "TypeError");
                    assert_eq!(err.message, "Maker does not do that");
                }
                other => panic!("expected a rejection, got {other:?}"),
            }
        })
        .await;
}

#[tokio::test]
async fn exported_promises_are_resolved_later() {
    LocalSet::new()
        .run_until(async {
            let (pending, settler) = Promise::pending();
            let root = Value::record([("later", Value::Promise(pending))]);
            let (left, right) = loopback(
                (Bootstrap::default(), CapTpOptions::default()),
                (root.into(), CapTpOptions::default()),
            );

            let record = settle(&left.conn.get_bootstrap()).await.unwrap();
            let later = match &record {
                Value::Record(entries) => entries["later"].clone(),
                other => panic!("expected a record, got {other:?}"),
            };
            assert_eq!(
                left.conn.get_slot_for_value(&later).map(|s| s.kind()),
                Some(SlotKind::Promise)
            );
            let later = later.as_promise().expect("a promise").clone();
            quiesce().await;
            assert!(later.is_pending());

            settler.resolve(counter(41));
            let value = settle(&later).await.unwrap();
            assert_eq!(settle(&call(&value, "incr", [])).await, Ok(Value::Int(42)));
            assert_eq!(right.conn.stats().sent(MessageKind::Resolve), 1);
        })
        .await;
}

#[tokio::test]
async fn bootstrap_provider_sees_the_question() {
    LocalSet::new()
        .run_until(async {
            let (left, _right) = loopback(
                (Bootstrap::default(), CapTpOptions::default()),
                (
                    Bootstrap::provider(|question| Value::from(question.to_string())),
                    CapTpOptions::default(),
                ),
            );
            let first = settle(&left.conn.get_bootstrap()).await;
            let second = settle(&left.conn.get_bootstrap()).await;
            assert_eq!(first, Ok(Value::from("q+1")));
            assert_eq!(second, Ok(Value::from("q+2")));
        })
        .await;
}

#[tokio::test]
async fn our_own_exports_come_back_as_themselves() {
    LocalSet::new()
        .run_until(async {
            let echo = Value::far("Echo", |inv: &Invocation| -> Result<Value, Value> {
                Ok(inv.args().first().cloned().unwrap_or_default())
            });
            let (left, _right) = loopback(
                (Bootstrap::default(), CapTpOptions::default()),
                (echo.into(), CapTpOptions::default()),
            );
            let mine = counter(0);
            let root = Value::Promise(left.conn.get_bootstrap());
            let back = settle(&call(&root, "echo", [mine.clone()])).await.unwrap();
            assert_eq!(back, mine);
            assert!(left.conn.is_only_local(&back));
        })
        .await;
}
