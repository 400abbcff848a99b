//! Handling of incoming messages.

use std::rc::Rc;

use crate::engine::{Bootstrap, CapTp};
use crate::error::CapTpError;
use crate::eventual;
use crate::invocation::Invocation;
use crate::marshal::CapData;
use crate::message::{Answer, Message};
use crate::promise::{Outcome, Promise};
use crate::slot::{Slot, SlotKind};
use crate::trap::IterMethod;
use crate::value::Value;

impl CapTp {
    /// Handle one message from the peer.
    ///
    /// Returns `false` if the message was discarded or could not be
    /// handled. Faults are reported through `on_reject`; the connection
    /// keeps accepting messages.
    pub fn dispatch(&self, msg: Message) -> bool {
        if msg.epoch() != self.inner.epoch {
            self.inner.state.borrow_mut().stats.stale_epoch += 1;
            tracing::warn!(
                our_id = %self.inner.our_id,
                kind = %msg.kind(),
                epoch = msg.epoch(),
                expected = self.inner.epoch,
                "discarding message from another epoch"
            );
            return false;
        }
        self.receive(msg.flipped())
    }

    /// `msg` is already in our view.
    fn receive(&self, msg: Message) -> bool {
        let kind = msg.kind();
        {
            let mut st = self.inner.state.borrow_mut();
            if st.unplug.is_some() {
                tracing::trace!(our_id = %self.inner.our_id, %kind, "ignoring message after disconnect");
                return false;
            }
            st.stats.record_recv(kind);
        }
        tracing::debug!(our_id = %self.inner.our_id, %kind, "receive");

        self.flush_released();
        {
            let mut st = self.inner.state.borrow_mut();
            for slot in msg.referenced_slots().filter(Slot::is_remote) {
                st.refcounts.stage(slot);
            }
        }

        match self.handle(msg) {
            Ok(()) => {
                self.inner.state.borrow_mut().refcounts.commit();
                true
            }
            Err(err) => {
                self.inner.state.borrow_mut().refcounts.abort();
                self.report(&err);
                false
            }
        }
    }

    fn handle(&self, msg: Message) -> Result<(), CapTpError> {
        match msg {
            Message::Bootstrap { question_id, .. } => self.handle_bootstrap(question_id),
            Message::Call {
                question_id,
                target,
                method,
                trap,
                ..
            } => self.handle_call(question_id, target, &method, trap),
            Message::Return {
                answer_id, answer, ..
            } => {
                let (is_reject, data) = answer.into_parts();
                self.settle_question(answer_id, is_reject, &data)
            }
            Message::Resolve {
                promise_id,
                resolution,
                ..
            } => {
                let (is_reject, data) = resolution.into_parts();
                self.settle_question(promise_id, is_reject, &data)
            }
            Message::Drop {
                slot_id, dec_refs, ..
            } => self.handle_drop(slot_id, dec_refs),
            Message::TrapIterate {
                question_id,
                serialized,
                ..
            } => self.handle_trap_iterate(question_id, &serialized),
            Message::Disconnect { epoch, reason } => {
                let value = reason.as_ref().map(|data| {
                    self.unserialize(data)
                        .unwrap_or_else(|err| err.to_reason())
                });
                self.disconnect(value, Message::Disconnect { epoch, reason });
                Ok(())
            }
        }
    }

    fn handle_bootstrap(&self, question_id: Slot) -> Result<(), CapTpError> {
        expect_answer_slot(question_id)?;
        let value = match &self.inner.bootstrap {
            Bootstrap::Value(value) => value.clone(),
            Bootstrap::Provider(provide) => provide(question_id),
        };
        self.inner
            .state
            .borrow_mut()
            .answers
            .insert(question_id, value.clone());
        self.when_settled(Promise::resolved(value), move |conn, outcome| {
            conn.send_return(question_id, outcome)
        });
        Ok(())
    }

    fn handle_call(
        &self,
        question_id: Slot,
        target: Slot,
        method: &CapData,
        trap: bool,
    ) -> Result<(), CapTpError> {
        expect_answer_slot(question_id)?;
        let method = self.unserialize(method)?;
        let target_value = self.lookup_target(target)?;

        if trap {
            if self.inner.trap_host.is_none() {
                return Err(CapTpError::NoTrapHost);
            }
            if !self.is_trap_handler(&target_value) {
                // The guest is blocked on this call: it still gets a reply.
                let err = CapTpError::NotTrapHandler(target);
                self.begin_trap_reply(question_id, Promise::rejected(err.to_reason()));
                return Err(err);
            }
        }

        let result = match Invocation::from_value(method) {
            Ok(invocation) => {
                tracing::trace!(
                    our_id = %self.inner.our_id,
                    question = %question_id,
                    target = %target,
                    op = invocation.op_name(),
                    trap,
                    "answering"
                );
                eventual::send(&target_value, invocation)
            }
            Err(reason) => Promise::rejected(reason),
        };

        if trap {
            self.begin_trap_reply(question_id, result);
            return Ok(());
        }
        self.inner
            .state
            .borrow_mut()
            .answers
            .insert(question_id, Value::Promise(result.clone()));
        self.when_settled(result, move |conn, outcome| {
            conn.send_return(question_id, outcome)
        });
        Ok(())
    }

    /// The value a call is addressed to: a cached answer or an export.
    fn lookup_target(&self, target: Slot) -> Result<Value, CapTpError> {
        if !target.is_local() {
            return Err(CapTpError::UnexpectedSlot(target));
        }
        self.slot_to_value(target, None)
    }

    pub(crate) fn send_return(&self, answer_id: Slot, outcome: Outcome) {
        let (is_reject, data) = self.serialize_outcome(outcome);
        self.send(Message::Return {
            epoch: self.inner.epoch,
            answer_id,
            answer: Answer::new(is_reject, data),
        });
    }

    /// Settle one of our questions or imported promises.
    fn settle_question(&self, id: Slot, is_reject: bool, data: &CapData) -> Result<(), CapTpError> {
        if !self.inner.state.borrow().settlers.contains_key(&id) {
            return Err(CapTpError::UnknownQuestion(id));
        }
        let value = self.unserialize(data)?;
        let settler = self
            .inner
            .state
            .borrow_mut()
            .settlers
            .remove(&id)
            .ok_or(CapTpError::UnknownQuestion(id))?;
        tracing::trace!(our_id = %self.inner.our_id, slot = %id, is_reject, "settling");
        if is_reject {
            settler.reject(value);
        } else {
            settler.resolve(value);
        }
        Ok(())
    }

    fn handle_drop(&self, slot: Slot, dec_refs: u64) -> Result<(), CapTpError> {
        if !slot.is_local() {
            return Err(CapTpError::DropNonExport(slot));
        }
        let mut st = self.inner.state.borrow_mut();
        if !st.refcounts.decrement(&slot, dec_refs) {
            tracing::trace!(our_id = %self.inner.our_id, slot = %slot, dec_refs, "partial drop");
            return Ok(());
        }

        let removed = match slot.kind() {
            SlotKind::Question => st.answers.remove(&slot),
            _ => st.tables.delete_export(&slot),
        };
        let Some(value) = removed else {
            return Ok(());
        };
        if let Some(identity) = value.identity()
            && st.export_ids.get(&identity) == Some(&slot)
        {
            st.export_ids.remove(&identity);
        }
        st.stats.gc_dropped += 1;
        drop(st);

        tracing::debug!(our_id = %self.inner.our_id, slot = %slot, "export dropped by peer");
        // The value may hold the last reference to an import of ours.
        drop(value);
        Ok(())
    }

    /// Wait for a trap call's result, then hand it to the trap host.
    fn begin_trap_reply(&self, question_id: Slot, result: Promise) {
        let (step, settler) = Promise::pending();
        self.inner
            .state
            .borrow_mut()
            .trap_steps
            .insert(question_id, step);
        self.when_settled(result, move |conn, outcome| {
            let (is_reject, data) = conn.serialize_outcome(outcome);
            let done = match conn.start_trap_reply(question_id, is_reject, data) {
                Some(producer) if conn.unplugged().is_none() => {
                    conn.inner
                        .state
                        .borrow_mut()
                        .trap_producers
                        .insert(question_id, producer);
                    false
                }
                _ => true,
            };
            settler.resolve(Value::Bool(done));
        });
    }

    fn handle_trap_iterate(&self, question_id: Slot, serialized: &CapData) -> Result<(), CapTpError> {
        if self.inner.trap_host.is_none() {
            return Err(CapTpError::NoTrapHost);
        }
        if !self.inner.state.borrow().trap_steps.contains_key(&question_id) {
            return Err(CapTpError::UnexpectedTrapIteration(question_id));
        }
        let (method, args) = IterMethod::from_value(self.unserialize(serialized)?)?;

        let (step, settler) = Promise::pending();
        let previous = self
            .inner
            .state
            .borrow_mut()
            .trap_steps
            .insert(question_id, step.clone())
            .ok_or(CapTpError::UnexpectedTrapIteration(question_id))?;
        tracing::trace!(our_id = %self.inner.our_id, question = %question_id, method = method.as_str(), "trap iteration");

        let conn = Rc::downgrade(&self.inner);
        tokio::task::spawn_local(async move {
            let previous_done = !matches!(previous.settled().await, Ok(Value::Bool(false)));
            let Some(inner) = conn.upgrade() else {
                return;
            };
            let conn = CapTp { inner };
            let done = match conn.drive_trap(question_id, previous_done, method, args).await {
                Ok(done) => done,
                Err(err) => {
                    conn.report(&err);
                    true
                }
            };
            if done || method != IterMethod::Next {
                let mut st = conn.inner.state.borrow_mut();
                st.trap_producers.remove(&question_id);
                if method != IterMethod::Next
                    && st
                        .trap_steps
                        .get(&question_id)
                        .is_some_and(|current| current.ptr_eq(&step))
                {
                    st.trap_steps.remove(&question_id);
                }
            }
            settler.resolve(Value::Bool(done));
        });
        Ok(())
    }
}

/// Questions the peer asks arrive as `q+` slots.
fn expect_answer_slot(slot: Slot) -> Result<(), CapTpError> {
    if slot.kind() == SlotKind::Question && slot.is_local() {
        Ok(())
    } else {
        Err(CapTpError::UnexpectedSlot(slot))
    }
}
