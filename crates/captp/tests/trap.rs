//! Synchronous trap calls from a blocking thread into an event loop.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;

use captp::atomics::{AtomicsTrapGuest, AtomicsTrapHost};
use captp::{
    Bootstrap, CapTpError, CapTpOptions, Codec, Invocation, JsonCodec, Promise, Slot, SlotKind,
    TrapTargetError, Value, call,
};
use common::{loopback, pump, raw_sender, settle};
use shm_primitives::{MIN_TRANSFER_BUFFER_LEN, SharedTransferBuffer};
use tokio::sync::mpsc;
use tokio::task::LocalSet;

fn counter() -> Value {
    let count = Rc::new(Cell::new(0i64));
    Value::far("Counter", move |inv: &Invocation| -> Result<Value, Value> {
        count.set(count.get() + 1);
        Ok(Value::Int(count.get() * 10 + inv.args().len() as i64))
    })
}

fn calculator(inv: &Invocation) -> Result<Value, Value> {
    let Invocation::ApplyMethod { method, args } = inv else {
        return Err(Value::type_error("call a method"));
    };
    match method.as_str() {
        "add" => Ok(Value::Int(args.iter().filter_map(Value::as_i64).sum())),
        "repeat" => {
            let text = args.first().and_then(Value::as_str).unwrap_or_default();
            let times = args.get(1).and_then(Value::as_i64).unwrap_or(1).max(0) as usize;
            Ok(Value::from(text.repeat(times)))
        }
        "makeCounter" => Ok(counter()),
        other => Err(Value::error("RangeError", format!("no method {other}"))),
    }
}

/// Runs the host engine on its own thread until the guest hangs up, then
/// reports the host's count for the first exported object.
fn spawn_host(
    buffer: SharedTransferBuffer,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
) -> thread::JoinHandle<u64> {
    thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("host runtime");
        LocalSet::new().block_on(&rt, async move {
            let handler = Rc::new(RefCell::new(None::<Value>));
            let root = handler.clone();
            let conn = captp::CapTp::new(
                "host",
                raw_sender(outbox, None),
                Bootstrap::provider(move |_| root.borrow().clone().unwrap_or_default()),
                CapTpOptions::default().trap_host(AtomicsTrapHost::new(buffer)),
            )
            .expect("host engine");
            *handler.borrow_mut() = Some(conn.make_trap_handler("Calculator", calculator));

            let mut inbox = inbox;
            while let Some(bytes) = inbox.recv().await {
                conn.dispatch(JsonCodec::decode_message(&bytes).expect("guest message"));
            }
            conn.ref_count(Slot::local(SlotKind::Object, 1))
        })
    })
}

#[tokio::test]
async fn trap_call_blocks_until_the_host_replies() {
    common::init_tracing();
    // The smallest buffer forces every reply through many chunks.
    let buffer = SharedTransferBuffer::new(MIN_TRANSFER_BUFFER_LEN).unwrap();
    let (to_host, host_inbox) = mpsc::unbounded_channel();
    let (to_guest, guest_inbox) = mpsc::unbounded_channel();
    let host = spawn_host(buffer.clone(), host_inbox, to_guest);

    let local = LocalSet::new();
    local
        .run_until(async move {
            let conn = captp::CapTp::new(
                "guest",
                raw_sender(to_host, None),
                Value::Undefined,
                CapTpOptions::default().trap_guest(AtomicsTrapGuest::new(buffer)),
            )
            .unwrap();
            tokio::task::spawn_local(pump(guest_inbox, conn.clone()));

            let root = settle(&conn.get_bootstrap()).await.unwrap();
            assert_eq!(
                conn.get_slot_for_value(&root),
                Some(Slot::remote(SlotKind::Trap, 1))
            );
            let calc = conn.trap(&root).unwrap();

            assert_eq!(
                calc.apply_method("add", [Value::Int(2), Value::Int(3)]).unwrap(),
                Value::Int(5)
            );
            assert_eq!(
                calc.apply_method("repeat", [Value::from("é-"), Value::Int(40)])
                    .unwrap(),
                Value::from("é-".repeat(40))
            );
            match calc.apply_method("divide", []) {
                Err(CapTpError::Rejected(Value::Error(err))) => {
                    assert_eq!(err.name, "RangeError");
                    assert_eq!(err.message, "no method divide");
                }
                other => panic!("expected a rejection, got {other:?}"),
            }

            // Capabilities in a trap reply are ordinary imports afterwards.
            let made = calc.apply_method("makeCounter", []).unwrap();
            let import = Slot::remote(SlotKind::Object, 1);
            assert_eq!(conn.get_slot_for_value(&made), Some(import));
            assert_eq!(conn.ref_count(import), 1);
            assert_eq!(
                settle(&call(&made, "incr", [Value::Null])).await,
                Ok(Value::Int(11))
            );

            // The event loop side still answers asynchronous calls on the
            // trap handler too.
            assert_eq!(
                settle(&call(&root, "add", [Value::Int(1), Value::Int(1)])).await,
                Ok(Value::Int(2))
            );
        })
        .await;
    drop(local);

    assert_eq!(host.join().unwrap(), 1);
}

struct Unused;

impl captp::TrapGuest for Unused {
    fn deliver(
        &self,
        _: &captp::TrapRequest<'_>,
    ) -> Result<(bool, captp::CapData), CapTpError> {
        panic!("no trap call should get this far")
    }
}

#[tokio::test]
async fn invalid_trap_targets_fail_without_wire_traffic() {
    LocalSet::new()
        .run_until(async {
            let (guest, _host) = loopback(
                (
                    Bootstrap::default(),
                    CapTpOptions::default().trap_guest(Unused),
                ),
                (
                    Value::far("Plain", calculator).into(),
                    CapTpOptions::default(),
                ),
            );
            let plain = settle(&guest.conn.get_bootstrap()).await.unwrap();
            let sent = guest.sent();

            let err = guest.conn.trap(&plain).err();
            assert!(matches!(
                err,
                Some(CapTpError::InvalidTrapTarget(TrapTargetError::NotTrapHandler))
            ));

            let err = guest
                .conn
                .trap(&Value::Promise(Promise::resolved(Value::Null)))
                .err();
            assert!(matches!(
                err,
                Some(CapTpError::InvalidTrapTarget(TrapTargetError::Promise))
            ));

            let err = guest.conn.trap(&counter()).err();
            assert!(matches!(
                err,
                Some(CapTpError::InvalidTrapTarget(TrapTargetError::NotImported))
            ));
            assert_eq!(guest.sent(), sent);
        })
        .await;
}

#[tokio::test]
async fn trap_requires_a_guest() {
    LocalSet::new()
        .run_until(async {
            let (left, _right) = loopback(
                (Bootstrap::default(), CapTpOptions::default()),
                (Value::Null.into(), CapTpOptions::default()),
            );
            assert!(matches!(
                left.conn.trap(&Value::Null).err(),
                Some(CapTpError::InvalidTrapTarget(TrapTargetError::NoTrapGuest))
            ));
            assert_eq!(left.sent(), 0);
        })
        .await;
}
