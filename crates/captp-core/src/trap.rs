//! Synchronous calls.
//!
//! A guest makes a trap call with [`CapTp::trap`]: the call goes out as a
//! `CTP_CALL` with `trap: true`, and the guest then blocks its OS thread in
//! its [`TrapGuest`] until the host has delivered the reply out of band. On
//! the host, once the call settles, the outcome is handed to the
//! [`TrapHost`], which may return a [`TrapProducer`] that the guest drives
//! step by step with `CTP_TRAP_ITERATE` messages.

use std::cell::RefCell;

use futures_util::future::LocalBoxFuture;

use crate::engine::CapTp;
use crate::error::{CapTpError, TrapTargetError};
use crate::invocation::Invocation;
use crate::marshal::{CapData, to_capdata};
use crate::message::Message;
use crate::slot::{Slot, SlotKind};
use crate::value::Value;

/// Iterator protocol used by `CTP_TRAP_ITERATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterMethod {
    /// Produce the next part of the reply.
    Next,
    /// The guest is finished.
    Return,
    /// The guest gave up.
    Throw,
}

impl IterMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            IterMethod::Next => "next",
            IterMethod::Return => "return",
            IterMethod::Throw => "throw",
        }
    }

    /// `[method, args]`, as carried in the message.
    pub fn to_value(self, args: Vec<Value>) -> Value {
        Value::list([Value::from(self.as_str()), Value::List(args)])
    }

    pub fn from_value(value: Value) -> Result<(IterMethod, Vec<Value>), CapTpError> {
        let malformed = || CapTpError::Marshal("malformed trap iteration".to_owned());
        let Value::List(mut items) = value else {
            return Err(malformed());
        };
        if items.len() != 2 {
            return Err(malformed());
        }
        let args = match items.pop() {
            Some(Value::List(args)) => args,
            _ => return Err(malformed()),
        };
        let method = match items.pop().as_ref().and_then(Value::as_str) {
            Some("next") => IterMethod::Next,
            Some("return") => IterMethod::Return,
            Some("throw") => IterMethod::Throw,
            _ => return Err(malformed()),
        };
        Ok((method, args))
    }
}

/// Host side of trap delivery.
pub trait TrapHost {
    /// Start delivering a settled reply. `data` is the marshalled outcome,
    /// in the host's view.
    ///
    /// Returns `None` if the reply was delivered in one shot.
    fn start(&self, is_reject: bool, data: CapData) -> Option<Box<dyn TrapProducer>>;
}

/// Delivers one reply in steps, as the guest asks for them.
pub trait TrapProducer {
    /// Serve one iteration. Resolves to `true` once there is nothing left
    /// to deliver.
    fn step(
        &mut self,
        method: IterMethod,
        args: Vec<Value>,
    ) -> LocalBoxFuture<'_, Result<bool, CapTpError>>;
}

/// Guest side of trap delivery.
pub trait TrapGuest {
    /// Send the call with [`TrapRequest::start`], then block until the reply
    /// has arrived and return it as the host marshalled it.
    fn deliver(&self, request: &TrapRequest<'_>) -> Result<(bool, CapData), CapTpError>;
}

/// One trap call in flight, as seen by the guest.
pub struct TrapRequest<'a> {
    conn: &'a CapTp,
    question_id: Slot,
    target: Slot,
    method: RefCell<Option<CapData>>,
}

impl TrapRequest<'_> {
    pub fn question_id(&self) -> Slot {
        self.question_id
    }

    /// Send the call. Only the first call sends anything.
    pub fn start(&self) -> Result<(), CapTpError> {
        let Some(method) = self.method.borrow_mut().take() else {
            return Ok(());
        };
        self.conn.send(Message::Call {
            epoch: self.conn.epoch(),
            question_id: self.question_id,
            target: self.target,
            method,
            trap: true,
        });
        self.check_connected()
    }

    /// Ask the host to move the reply along.
    pub fn iterate(&self, method: IterMethod, args: Vec<Value>) -> Result<(), CapTpError> {
        let serialized = to_capdata(&*self.conn.inner.marshal, &method.to_value(args))?;
        self.conn.send(Message::TrapIterate {
            epoch: self.conn.epoch(),
            question_id: self.question_id,
            serialized,
        });
        self.check_connected()
    }

    fn started(&self) -> bool {
        self.method.borrow().is_none()
    }

    fn check_connected(&self) -> Result<(), CapTpError> {
        match self.conn.unplugged() {
            Some(reason) => Err(CapTpError::Disconnected(reason)),
            None => Ok(()),
        }
    }
}

/// Synchronous invocations on one trap-handler import.
pub struct Trap<'a> {
    conn: &'a CapTp,
    target: Slot,
}

impl Trap<'_> {
    pub fn target(&self) -> Slot {
        self.target
    }

    pub fn get(&self, prop: impl Into<String>) -> Result<Value, CapTpError> {
        self.invoke(Invocation::get(prop))
    }

    pub fn apply_function(
        &self,
        args: impl IntoIterator<Item = Value>,
    ) -> Result<Value, CapTpError> {
        self.invoke(Invocation::apply_function(args))
    }

    pub fn apply_method(
        &self,
        method: impl Into<String>,
        args: impl IntoIterator<Item = Value>,
    ) -> Result<Value, CapTpError> {
        self.invoke(Invocation::apply_method(method, args))
    }

    /// Make the call and block until the reply is back.
    pub fn invoke(&self, invocation: Invocation) -> Result<Value, CapTpError> {
        let conn = self.conn;
        let guest = conn
            .inner
            .trap_guest
            .clone()
            .ok_or(CapTpError::InvalidTrapTarget(TrapTargetError::NoTrapGuest))?;
        conn.flush_released();
        if let Some(reason) = conn.unplugged() {
            return Err(CapTpError::Disconnected(reason));
        }

        let question_id = conn.next_trap_question();
        let method = conn.serialize(&invocation.to_value())?;
        let request = TrapRequest {
            conn,
            question_id,
            target: self.target,
            method: RefCell::new(Some(method)),
        };
        tracing::debug!(
            our_id = %conn.our_id(),
            question = %question_id,
            target = %self.target,
            op = invocation.op_name(),
            "trap call"
        );
        let (is_reject, mut data) = guest.deliver(&request)?;
        if !request.started() {
            return Err(CapTpError::TrapTransport(
                "trap guest returned without sending the call".to_owned(),
            ));
        }

        for slot in &mut data.slots {
            *slot = slot.flip();
        }
        let value = conn.unserialize(&data)?;
        conn.inner
            .state
            .borrow_mut()
            .refcounts
            .count_message(data.slots.iter().copied().filter(Slot::is_remote));

        if value.is_promise() {
            return Err(CapTpError::TrapReplyPromise);
        }
        if is_reject {
            Err(CapTpError::Rejected(value))
        } else {
            Ok(value)
        }
    }
}

impl CapTp {
    /// Prepare synchronous calls on `target`.
    ///
    /// The target must be an import that the peer created with
    /// `make_trap_handler`, and this side must have a trap guest. Nothing is
    /// sent when these checks fail.
    pub fn trap(&self, target: &Value) -> Result<Trap<'_>, CapTpError> {
        if self.inner.trap_guest.is_none() {
            return Err(TrapTargetError::NoTrapGuest.into());
        }
        if target.is_promise() {
            return Err(TrapTargetError::Promise.into());
        }
        let slot = self
            .get_slot_for_value(target)
            .filter(Slot::is_remote)
            .ok_or(TrapTargetError::NotImported)?;
        if slot.kind() != SlotKind::Trap {
            return Err(TrapTargetError::NotTrapHandler.into());
        }
        Ok(Trap { conn: self, target: slot })
    }

    /// Hand the settled outcome of a trap call to the trap host.
    pub(crate) fn start_trap_reply(
        &self,
        question_id: Slot,
        is_reject: bool,
        data: CapData,
    ) -> Option<Box<dyn TrapProducer>> {
        self.inner
            .state
            .borrow_mut()
            .refcounts
            .count_message(data.slots.iter().copied().filter(Slot::is_local));
        let host = self.inner.trap_host.clone()?;
        tracing::debug!(our_id = %self.inner.our_id, question = %question_id, is_reject, "trap reply ready");
        host.start(is_reject, data)
    }

    /// Serve one `CTP_TRAP_ITERATE` once the previous step has finished.
    /// Returns whether the reply is fully delivered.
    pub(crate) async fn drive_trap(
        &self,
        question_id: Slot,
        previous_done: bool,
        method: IterMethod,
        args: Vec<Value>,
    ) -> Result<bool, CapTpError> {
        if previous_done {
            return Ok(true);
        }
        let producer = self
            .inner
            .state
            .borrow_mut()
            .trap_producers
            .remove(&question_id);
        let Some(mut producer) = producer else {
            return Ok(true);
        };
        let done = producer.step(method, args).await?;
        if !done && method == IterMethod::Next && self.unplugged().is_none() {
            self.inner
                .state
                .borrow_mut()
                .trap_producers
                .insert(question_id, producer);
        }
        Ok(done || method != IterMethod::Next)
    }
}
