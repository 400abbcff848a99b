//! One end of a connection: the import/export tables, questions and answers,
//! reference counts, and the glue between values and slots.
//!
//! The engine is single threaded. Nothing here holds a `RefCell` borrow of
//! the state while calling user code, the raw channel, or a settler.
//! Background work (forwarding promise resolutions, waiting for answers)
//! runs on `tokio::task::spawn_local`, so a `CapTp` must be used inside a
//! [`tokio::task::LocalSet`].

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{CapTpError, SendError};
use crate::invocation::Invocation;
use crate::marshal::{CapData, Marshal, to_capdata};
use crate::message::{Message, Resolution};
use crate::options::{CapTpOptions, RejectHook, SlotHook};
use crate::promise::{Outcome, Promise, Settler};
use crate::refcount::RefCounts;
use crate::slot::{Slot, SlotKind};
use crate::stats::Stats;
use crate::tables::{DefaultTables, ImportExportTables, TableOptions};
use crate::trap::{TrapGuest, TrapHost, TrapProducer};
use crate::value::{Exo, Handler, Remotable, Value, WeakValue};

pub type RawSend = Box<dyn Fn(Message) -> Result<(), SendError>>;

/// What a peer gets when it asks for our bootstrap object.
pub enum Bootstrap {
    Value(Value),
    /// Computed per request, from the question it answers.
    Provider(Box<dyn Fn(Slot) -> Value>),
}

impl Bootstrap {
    pub fn provider(f: impl Fn(Slot) -> Value + 'static) -> Self {
        Bootstrap::Provider(Box::new(f))
    }
}

impl From<Value> for Bootstrap {
    fn from(value: Value) -> Self {
        Bootstrap::Value(value)
    }
}

impl Default for Bootstrap {
    fn default() -> Self {
        Bootstrap::Value(Value::Undefined)
    }
}

/// A capability-transport connection.
///
/// Cloning gives another handle to the same connection.
#[derive(Clone)]
pub struct CapTp {
    pub(crate) inner: Rc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) our_id: String,
    pub(crate) epoch: u64,
    pub(crate) raw_send: RawSend,
    pub(crate) bootstrap: Bootstrap,
    pub(crate) marshal: Rc<dyn Marshal>,
    pub(crate) on_reject: Option<RejectHook>,
    pub(crate) export_hook: Option<SlotHook>,
    pub(crate) import_hook: Option<SlotHook>,
    pub(crate) trap_host: Option<Rc<dyn TrapHost>>,
    pub(crate) trap_guest: Option<Rc<dyn TrapGuest>>,
    /// Imports the finalizing map gave up, waiting for their `CTP_DROP`.
    pub(crate) released: Rc<RefCell<Vec<Slot>>>,
    pub(crate) state: RefCell<State>,
}

pub(crate) struct State {
    /// Set once the connection is down, to the reason it went down.
    pub(crate) unplug: Option<Value>,
    pub(crate) tables: Box<dyn ImportExportTables>,
    pub(crate) export_ids: HashMap<usize, Slot>,
    pub(crate) trap_handlers: HashMap<usize, WeakValue>,
    pub(crate) refcounts: RefCounts,
    pub(crate) settlers: HashMap<Slot, Settler>,
    /// Results of the peer's questions, by our `q+` slot.
    pub(crate) answers: HashMap<Slot, Value>,
    pub(crate) last_question: u64,
    /// Per trap question, the step the next iteration must wait for. Each
    /// settles to `true` once the reply is fully delivered.
    pub(crate) trap_steps: HashMap<Slot, Promise>,
    pub(crate) trap_producers: HashMap<Slot, Box<dyn TrapProducer>>,
    pub(crate) stats: Stats,
}

/// Routes invocations on an import, or on a promise for one of our
/// questions, back over the connection.
pub(crate) struct RemoteHandler {
    conn: Weak<Inner>,
    slot: Slot,
}

impl Handler for RemoteHandler {
    fn handle(&self, invocation: Invocation) -> Promise {
        match self.conn.upgrade() {
            Some(inner) => CapTp { inner }.send_question(self.slot, invocation),
            None => Promise::rejected(Value::error("Error", "connection is gone")),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl CapTp {
    /// Create one end of a connection.
    ///
    /// `raw_send` delivers messages to the peer, reliably and in order; the
    /// peer's messages come in through [`dispatch`](Self::dispatch).
    pub fn new(
        our_id: impl Into<String>,
        raw_send: impl Fn(Message) -> Result<(), SendError> + 'static,
        bootstrap: impl Into<Bootstrap>,
        options: CapTpOptions,
    ) -> Result<CapTp, CapTpError> {
        let our_id = our_id.into();
        // A host that is also a guest can deadlock against its own peer.
        if options.trap_host.is_some() && options.trap_guest.is_some() {
            return Err(CapTpError::TrapRoleConflict { our_id });
        }

        let released = Rc::new(RefCell::new(Vec::new()));
        let queue = released.clone();
        let table_options = TableOptions {
            gc_imports: options.gc_imports,
            release_slot: Box::new(move |slot| queue.borrow_mut().push(slot)),
        };
        let tables = match &options.import_export_tables {
            Some(make) => make(table_options),
            None => Box::new(DefaultTables::new(table_options)),
        };

        tracing::debug!(
            our_id = %our_id,
            epoch = options.epoch,
            gc_imports = options.gc_imports,
            trap_host = options.trap_host.is_some(),
            trap_guest = options.trap_guest.is_some(),
            "creating captp connection"
        );

        Ok(CapTp {
            inner: Rc::new(Inner {
                our_id,
                epoch: options.epoch,
                raw_send: Box::new(raw_send),
                bootstrap: bootstrap.into(),
                marshal: options.marshal,
                on_reject: options.on_reject,
                export_hook: options.export_hook,
                import_hook: options.import_hook,
                trap_host: options.trap_host,
                trap_guest: options.trap_guest,
                released,
                state: RefCell::new(State {
                    unplug: None,
                    tables,
                    export_ids: HashMap::new(),
                    trap_handlers: HashMap::new(),
                    refcounts: RefCounts::new(),
                    settlers: HashMap::new(),
                    answers: HashMap::new(),
                    last_question: 0,
                    trap_steps: HashMap::new(),
                    trap_producers: HashMap::new(),
                    stats: Stats::default(),
                }),
            }),
        })
    }

    pub fn our_id(&self) -> &str {
        &self.inner.our_id
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    pub fn stats(&self) -> Stats {
        self.inner.state.borrow().stats.clone()
    }

    /// The reason the connection went down, if it has.
    pub fn unplugged(&self) -> Option<Value> {
        self.inner.state.borrow().unplug.clone()
    }

    /// How many messages naming `slot` this side has counted and not yet
    /// released.
    pub fn ref_count(&self, slot: Slot) -> u64 {
        self.inner.state.borrow().refcounts.get(&slot)
    }

    pub fn export_count(&self) -> usize {
        self.inner.state.borrow().tables.export_count()
    }

    pub fn has_answer(&self, slot: Slot) -> bool {
        self.inner.state.borrow().answers.contains_key(&slot)
    }

    /// Number of import bindings, including ones already collected but not
    /// yet released.
    pub fn import_count(&self) -> usize {
        self.inner.state.borrow().tables.import_count()
    }

    /// Ask the peer for its bootstrap object.
    pub fn get_bootstrap(&self) -> Promise {
        self.flush_released();
        if let Some(reason) = self.unplugged() {
            return Promise::rejected(reason);
        }
        let (question_id, promise) = self.make_question();
        self.send(Message::Bootstrap {
            epoch: self.inner.epoch,
            question_id,
        });
        promise
    }

    /// The slot `value` already has on this connection, without assigning
    /// one.
    pub fn get_slot_for_value(&self, value: &Value) -> Option<Slot> {
        if let Some(slot) = self.remote_slot(value) {
            return Some(slot);
        }
        let identity = value.identity()?;
        self.inner.state.borrow().export_ids.get(&identity).copied()
    }

    /// Whether `value` can be used without the peer: false if it refers to
    /// an import anywhere inside.
    pub fn is_only_local(&self, value: &Value) -> bool {
        value
            .visit_capabilities(&mut |cap| match self.get_slot_for_value(cap) {
                Some(slot) if slot.is_remote() => Err(()),
                _ => Ok(()),
            })
            .is_ok()
    }

    /// A local capability the peer may call synchronously through a trap.
    pub fn make_trap_handler(&self, iface: impl Into<String>, exo: impl Exo + 'static) -> Value {
        let value = Value::Remotable(Remotable::local(iface, Rc::new(exo)));
        if let (Some(identity), Some(weak)) = (value.identity(), value.downgrade()) {
            let mut st = self.inner.state.borrow_mut();
            st.trap_handlers.retain(|_, weak| weak.upgrade().is_some());
            st.trap_handlers.insert(identity, weak);
        }
        value
    }

    pub(crate) fn is_trap_handler(&self, value: &Value) -> bool {
        let Some(identity) = value.identity() else {
            return false;
        };
        let weak = self.inner.state.borrow().trap_handlers.get(&identity).cloned();
        weak.and_then(|w| w.upgrade()).is_some_and(|v| v == *value)
    }

    /// Tear the connection down from this side.
    pub fn abort(&self, reason: Option<Value>) {
        let data = reason.as_ref().map(|r| self.serialize_reason(r));
        let msg = Message::Disconnect {
            epoch: self.inner.epoch,
            reason: data,
        };
        self.disconnect(reason, msg);
    }

    /// Release every import the application no longer references, now.
    /// Returns how many `CTP_DROP`s were sent.
    pub fn collect_garbage(&self) -> usize {
        {
            let mut st = self.inner.state.borrow_mut();
            st.tables.sweep();
            st.trap_handlers.retain(|_, weak| weak.upgrade().is_some());
        }
        self.flush_released()
    }

    /// Send `CTP_DROP` for every import the finalizing map released.
    pub(crate) fn flush_released(&self) -> usize {
        self.inner.state.borrow_mut().tables.flush();
        let released = std::mem::take(&mut *self.inner.released.borrow_mut());
        let count = released.len();
        for slot in released {
            let dec_refs = self.inner.state.borrow_mut().refcounts.take(&slot);
            tracing::debug!(our_id = %self.inner.our_id, slot = %slot, dec_refs, "releasing import");
            self.send(Message::Drop {
                epoch: self.inner.epoch,
                slot_id: slot,
                dec_refs,
            });
        }
        count
    }

    fn remote_slot(&self, value: &Value) -> Option<Slot> {
        let handler = match value {
            Value::Remotable(r) => r.handler(),
            Value::Promise(p) => p.own_handler().cloned(),
            _ => None,
        }?;
        let remote = handler.as_any().downcast_ref::<RemoteHandler>()?;
        std::ptr::eq(remote.conn.as_ptr(), Rc::as_ptr(&self.inner)).then_some(remote.slot)
    }

    /// Allocate a question and the promise for its answer.
    pub(crate) fn make_question(&self) -> (Slot, Promise) {
        let mut st = self.inner.state.borrow_mut();
        st.last_question += 1;
        let slot = Slot::remote(SlotKind::Question, st.last_question);
        let handler = Rc::new(RemoteHandler {
            conn: Rc::downgrade(&self.inner),
            slot,
        });
        let (promise, settler) = Promise::remote(handler);
        st.settlers.insert(slot, settler);
        st.tables.mark_as_imported(slot, Value::Promise(promise.clone()));
        (slot, promise)
    }

    /// Allocate a question number for a trap call. Trap questions have no
    /// settler: the reply comes back through the trap guest.
    pub(crate) fn next_trap_question(&self) -> Slot {
        let mut st = self.inner.state.borrow_mut();
        st.last_question += 1;
        Slot::remote(SlotKind::Question, st.last_question)
    }

    /// Send `invocation` to the peer's `target` as a new question.
    pub(crate) fn send_question(&self, target: Slot, invocation: Invocation) -> Promise {
        self.flush_released();
        if let Some(reason) = self.unplugged() {
            return Promise::rejected(reason);
        }
        let (question_id, promise) = self.make_question();
        let method = match self.serialize(&invocation.to_value()) {
            Ok(method) => method,
            Err(err) => {
                let mut st = self.inner.state.borrow_mut();
                st.settlers.remove(&question_id);
                st.tables.delete_import(&question_id);
                return Promise::rejected(err.to_reason());
            }
        };
        tracing::trace!(
            our_id = %self.inner.our_id,
            question = %question_id,
            target = %target,
            op = invocation.op_name(),
            "asking"
        );
        self.send(Message::Call {
            epoch: self.inner.epoch,
            question_id,
            target,
            method,
            trap: false,
        });
        promise
    }

    pub(crate) fn serialize(&self, value: &Value) -> Result<CapData, CapTpError> {
        let marshal = self.inner.marshal.clone();
        marshal.serialize(value, &mut |v| self.value_to_slot(v))
    }

    pub(crate) fn unserialize(&self, data: &CapData) -> Result<Value, CapTpError> {
        let marshal = self.inner.marshal.clone();
        marshal.unserialize(data, &mut |slot, iface| self.slot_to_value(slot, iface))
    }

    /// Serialize a settled outcome, turning a value that cannot be
    /// serialized into a rejection.
    pub(crate) fn serialize_outcome(&self, outcome: Outcome) -> (bool, CapData) {
        let (is_reject, value) = match outcome {
            Ok(value) => (false, value),
            Err(reason) => (true, reason),
        };
        match self.serialize(&value) {
            Ok(data) => (is_reject, data),
            Err(err) => (true, self.serialize_reason(&err.to_reason())),
        }
    }

    fn serialize_reason(&self, reason: &Value) -> CapData {
        self.serialize(reason)
            .or_else(|err| to_capdata(&*self.inner.marshal, &err.to_reason()))
            .unwrap_or_default()
    }

    fn value_to_slot(&self, value: &Value) -> Result<Slot, CapTpError> {
        if let Some(slot) = self.get_slot_for_value(value) {
            return Ok(slot);
        }
        let identity = value
            .identity()
            .ok_or_else(|| CapTpError::Marshal(format!("{value:?} is not a capability")))?;
        let is_trap_handler = self.is_trap_handler(value);

        let slot = {
            let mut st = self.inner.state.borrow_mut();
            let slot = st.tables.make_slot_for_value(value, is_trap_handler);
            st.tables.mark_as_exported(slot, value.clone());
            st.export_ids.insert(identity, slot);
            slot
        };
        tracing::trace!(our_id = %self.inner.our_id, slot = %slot, "exporting");

        if let Some(hook) = &self.inner.export_hook {
            hook(value, slot);
        }
        if let Value::Promise(promise) = value {
            self.forward_resolution(promise.clone(), slot);
        }
        Ok(slot)
    }

    /// Tell the peer how an exported promise settles.
    fn forward_resolution(&self, promise: Promise, promise_id: Slot) {
        self.spawn_settled(promise, move |conn, outcome| {
            let (is_reject, data) = conn.serialize_outcome(outcome);
            conn.send(Message::Resolve {
                epoch: conn.inner.epoch,
                promise_id,
                resolution: Resolution::new(is_reject, data),
            });
        });
    }

    pub(crate) fn slot_to_value(&self, slot: Slot, iface: Option<&str>) -> Result<Value, CapTpError> {
        if slot.is_local() {
            let st = self.inner.state.borrow();
            let found = match slot.kind() {
                SlotKind::Question => st.answers.get(&slot).cloned(),
                _ => st.tables.get_export(&slot),
            };
            return found.ok_or(CapTpError::UnknownExport(slot));
        }

        let existing = self.inner.state.borrow().tables.get_import(&slot);
        if let Some(value) = existing {
            return Ok(value);
        }

        let handler = Rc::new(RemoteHandler {
            conn: Rc::downgrade(&self.inner),
            slot,
        });
        let (value, settler) = match slot.kind() {
            SlotKind::Object | SlotKind::Trap => {
                let iface = iface.map(str::to_owned).unwrap_or_else(|| {
                    format!("Alleged: Presence {} {slot}", self.inner.our_id)
                });
                (Value::Remotable(Remotable::presence(iface, handler)), None)
            }
            SlotKind::Promise => {
                let (promise, settler) = Promise::remote(handler);
                (Value::Promise(promise), Some(settler))
            }
            SlotKind::Question => return Err(CapTpError::UnexpectedSlot(slot)),
        };
        tracing::trace!(our_id = %self.inner.our_id, slot = %slot, "importing");

        if let Some(hook) = &self.inner.import_hook {
            hook(&value, slot);
        }
        {
            let mut st = self.inner.state.borrow_mut();
            if let Some(settler) = settler {
                st.settlers.insert(slot, settler);
            }
            st.tables.mark_as_imported(slot, value.clone());
        }
        // A dead binding replaced just now must be dropped before this
        // message's references are counted.
        self.flush_released();
        Ok(value)
    }

    /// Hand `msg` to the raw channel and count the references it carries.
    ///
    /// Does nothing once the connection is down. A refused send is reported
    /// and takes the connection down.
    pub(crate) fn send(&self, msg: Message) {
        let kind = msg.kind();
        let slots: Vec<Slot> = msg.referenced_slots().filter(Slot::is_local).collect();
        {
            let mut st = self.inner.state.borrow_mut();
            if st.unplug.is_some() {
                tracing::trace!(our_id = %self.inner.our_id, %kind, "suppressed send after disconnect");
                return;
            }
            st.stats.record_send(kind);
        }
        tracing::debug!(our_id = %self.inner.our_id, %kind, "send");

        match (self.inner.raw_send)(msg) {
            Ok(()) => self.inner.state.borrow_mut().refcounts.count_message(slots),
            Err(err) => {
                let err = CapTpError::from(err);
                self.report(&err);
                self.abort(Some(err.to_reason()));
            }
        }
    }

    pub(crate) fn report(&self, err: &CapTpError) {
        match &self.inner.on_reject {
            Some(hook) => hook(err),
            None => tracing::warn!(our_id = %self.inner.our_id, error = %err, "captp exception"),
        }
    }

    /// Take the connection down: remember why, let the peer know, forget
    /// the imports and reject every open question.
    pub(crate) fn disconnect(&self, reason: Option<Value>, msg: Message) {
        let reason_value = reason.clone().unwrap_or_else(|| {
            Value::error(
                "Error",
                format!("{:?} connection closed", self.inner.our_id),
            )
        });
        let first = {
            let mut st = self.inner.state.borrow_mut();
            let first = st.unplug.is_none();
            if first {
                st.unplug = Some(reason_value.clone());
                st.stats.record_send(msg.kind());
            }
            first
        };
        if first {
            tracing::debug!(our_id = %self.inner.our_id, "disconnecting");
            if let Some(reason) = reason {
                self.report(&CapTpError::Disconnected(reason));
            }
            // Already down; the peer may well be gone too.
            if let Err(err) = (self.inner.raw_send)(msg) {
                tracing::trace!(our_id = %self.inner.our_id, error = %err, "disconnect not delivered");
            }
        }

        let (settlers, steps, producers) = {
            let mut st = self.inner.state.borrow_mut();
            st.tables.did_disconnect();
            (
                std::mem::take(&mut st.settlers),
                std::mem::take(&mut st.trap_steps),
                std::mem::take(&mut st.trap_producers),
            )
        };
        self.inner.released.borrow_mut().clear();
        drop(producers);
        drop(steps);
        for (_, settler) in settlers {
            settler.reject(reason_value.clone());
        }
    }

    /// Run `then` with the outcome of `promise`: right away if it has
    /// settled, otherwise from a local task once it does.
    pub(crate) fn when_settled(&self, promise: Promise, then: impl FnOnce(&CapTp, Outcome) + 'static) {
        match promise.peek() {
            Some(outcome) => then(self, outcome),
            None => self.spawn_settled(promise, then),
        }
    }

    /// Like [`when_settled`](Self::when_settled), but always from a local
    /// task.
    pub(crate) fn spawn_settled(&self, promise: Promise, then: impl FnOnce(&CapTp, Outcome) + 'static) {
        let conn = Rc::downgrade(&self.inner);
        tokio::task::spawn_local(async move {
            let outcome = promise.settled().await;
            if let Some(inner) = conn.upgrade() {
                then(&CapTp { inner }, outcome);
            }
        });
    }
}

impl fmt::Debug for CapTp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapTp")
            .field("our_id", &self.inner.our_id)
            .field("epoch", &self.inner.epoch)
            .finish_non_exhaustive()
    }
}
