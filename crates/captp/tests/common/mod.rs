//! Loopback plumbing shared by the integration tests.
//!
//! Messages go through `JsonCodec` on the way, so every test also checks
//! that what the engine sends survives the wire format.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use captp::{
    Bootstrap, CapTp, CapTpOptions, Codec, JsonCodec, Message, Outcome, Promise, SendError,
};
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Every message one side handed to its raw channel.
pub type Wire = Rc<RefCell<Vec<Message>>>;

pub struct Side {
    pub conn: CapTp,
    pub wire: Wire,
}

impl Side {
    pub fn sent(&self) -> usize {
        self.wire.borrow().len()
    }
}

/// A raw send that encodes onto `tx` and records what it sent.
pub fn raw_sender(
    tx: mpsc::UnboundedSender<Vec<u8>>,
    wire: Option<Wire>,
) -> impl Fn(Message) -> Result<(), SendError> + 'static {
    move |msg| {
        let bytes = JsonCodec::encode_message(&msg).map_err(|e| SendError(e.to_string()))?;
        if let Some(wire) = &wire {
            wire.borrow_mut().push(msg);
        }
        tx.send(bytes)
            .map_err(|_| SendError("peer is gone".to_owned()))
    }
}

/// Feed every message arriving on `rx` to `conn`.
pub async fn pump(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, conn: CapTp) {
    while let Some(bytes) = rx.recv().await {
        let msg = JsonCodec::decode_message(&bytes).expect("peer sent an undecodable message");
        conn.dispatch(msg);
    }
}

/// Two engines talking to each other. Must be called inside a `LocalSet`.
pub fn loopback(
    left: (Bootstrap, CapTpOptions),
    right: (Bootstrap, CapTpOptions),
) -> (Side, Side) {
    let (to_left, left_rx) = mpsc::unbounded_channel();
    let (to_right, right_rx) = mpsc::unbounded_channel();

    let left_wire = Wire::default();
    let right_wire = Wire::default();
    let left_conn = CapTp::new(
        "left",
        raw_sender(to_right, Some(left_wire.clone())),
        left.0,
        left.1,
    )
    .expect("left engine");
    let right_conn = CapTp::new(
        "right",
        raw_sender(to_left, Some(right_wire.clone())),
        right.0,
        right.1,
    )
    .expect("right engine");

    tokio::task::spawn_local(pump(left_rx, left_conn.clone()));
    tokio::task::spawn_local(pump(right_rx, right_conn.clone()));

    (
        Side {
            conn: left_conn,
            wire: left_wire,
        },
        Side {
            conn: right_conn,
            wire: right_wire,
        },
    )
}

/// Wait for `promise`, failing the test if it takes too long.
pub async fn settle(promise: &Promise) -> Outcome {
    tokio::time::timeout(Duration::from_secs(5), promise.settled())
        .await
        .expect("promise did not settle")
}

/// Let queued messages and background tasks run.
pub async fn quiesce() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}
