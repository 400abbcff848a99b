//! Import and export tables of one connection.
//!
//! The engine keeps its own ref counts, questions and answers; the tables
//! only bind slots to values and choose the slot numbers for new exports.
//! Pass [`CapTpOptions::import_export_tables`](crate::CapTpOptions::import_export_tables)
//! to keep them somewhere else.

use std::collections::HashMap;

use crate::finalize::FinalizingMap;
use crate::slot::{Slot, SlotKind};
use crate::value::Value;

/// What the engine hands to a table factory.
pub struct TableOptions {
    /// Whether imports should be held weakly and released once unused.
    pub gc_imports: bool,
    /// Call with an import's slot once the application no longer holds it.
    /// The engine sends the matching `CTP_DROP` on its next flush.
    pub release_slot: Box<dyn FnMut(Slot)>,
}

pub trait ImportExportTables {
    /// Choose the slot for a value exported for the first time.
    fn make_slot_for_value(&mut self, value: &Value, trap_handler: bool) -> Slot;

    fn get_import(&self, slot: &Slot) -> Option<Value>;

    fn has_import(&self, slot: &Slot) -> bool {
        self.get_import(slot).is_some()
    }

    fn mark_as_imported(&mut self, slot: Slot, value: Value);

    /// Forget an import without releasing it.
    fn delete_import(&mut self, slot: &Slot);

    fn get_export(&self, slot: &Slot) -> Option<Value>;

    fn has_export(&self, slot: &Slot) -> bool {
        self.get_export(slot).is_some()
    }

    fn mark_as_exported(&mut self, slot: Slot, value: Value);

    fn delete_export(&mut self, slot: &Slot) -> Option<Value>;

    fn export_count(&self) -> usize;

    fn import_count(&self) -> usize;

    /// Release imports that died since the last flush.
    fn flush(&mut self) -> usize {
        0
    }

    /// Release every dead import, noticed or not.
    fn sweep(&mut self) -> usize {
        0
    }

    /// The connection is gone; drop imports without releasing them.
    fn did_disconnect(&mut self);
}

/// Builds the tables for a new connection.
pub type TablesFactory = std::rc::Rc<dyn Fn(TableOptions) -> Box<dyn ImportExportTables>>;

/// Exports in a map, imports in a [`FinalizingMap`], slots numbered from 1
/// per kind.
pub struct DefaultTables {
    exports: HashMap<Slot, Value>,
    imports: FinalizingMap<Slot>,
    last_export: u64,
    last_promise: u64,
    last_trap: u64,
}

impl DefaultTables {
    pub fn new(options: TableOptions) -> Self {
        Self {
            exports: HashMap::new(),
            imports: FinalizingMap::new(options.gc_imports, options.release_slot),
            last_export: 0,
            last_promise: 0,
            last_trap: 0,
        }
    }
}

impl ImportExportTables for DefaultTables {
    fn make_slot_for_value(&mut self, value: &Value, trap_handler: bool) -> Slot {
        if trap_handler {
            self.last_trap += 1;
            Slot::local(SlotKind::Trap, self.last_trap)
        } else if value.is_promise() {
            self.last_promise += 1;
            Slot::local(SlotKind::Promise, self.last_promise)
        } else {
            self.last_export += 1;
            Slot::local(SlotKind::Object, self.last_export)
        }
    }

    fn get_import(&self, slot: &Slot) -> Option<Value> {
        self.imports.get(slot)
    }

    fn mark_as_imported(&mut self, slot: Slot, value: Value) {
        self.imports.set(slot, value);
    }

    fn delete_import(&mut self, slot: &Slot) {
        self.imports.delete(slot);
    }

    fn get_export(&self, slot: &Slot) -> Option<Value> {
        self.exports.get(slot).cloned()
    }

    fn mark_as_exported(&mut self, slot: Slot, value: Value) {
        self.exports.insert(slot, value);
    }

    fn delete_export(&mut self, slot: &Slot) -> Option<Value> {
        self.exports.remove(slot)
    }

    fn export_count(&self) -> usize {
        self.exports.len()
    }

    fn import_count(&self) -> usize {
        self.imports.size()
    }

    fn flush(&mut self) -> usize {
        self.imports.flush()
    }

    fn sweep(&mut self) -> usize {
        self.imports.sweep()
    }

    fn did_disconnect(&mut self) {
        self.imports.clear_without_finalizing();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::Invocation;
    use crate::promise::Promise;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn cap() -> Value {
        Value::far("Cap", |_: &Invocation| -> Result<Value, Value> { Ok(Value::Null) })
    }

    fn tables(gc_imports: bool) -> (DefaultTables, Rc<RefCell<Vec<Slot>>>) {
        let released = Rc::new(RefCell::new(Vec::new()));
        let sink = released.clone();
        let tables = DefaultTables::new(TableOptions {
            gc_imports,
            release_slot: Box::new(move |slot| sink.borrow_mut().push(slot)),
        });
        (tables, released)
    }

    #[test]
    fn slots_are_numbered_per_kind() {
        let (mut tables, _) = tables(false);
        let (promise, _settler) = Promise::pending();
        let promise = Value::Promise(promise);
        assert_eq!(
            tables.make_slot_for_value(&cap(), false),
            Slot::local(SlotKind::Object, 1)
        );
        assert_eq!(
            tables.make_slot_for_value(&promise, false),
            Slot::local(SlotKind::Promise, 1)
        );
        assert_eq!(
            tables.make_slot_for_value(&cap(), true),
            Slot::local(SlotKind::Trap, 1)
        );
        assert_eq!(
            tables.make_slot_for_value(&cap(), false),
            Slot::local(SlotKind::Object, 2)
        );
    }

    #[test]
    fn unused_imports_are_released_on_flush() {
        let (mut tables, released) = tables(true);
        let slot = Slot::remote(SlotKind::Object, 4);
        let import = cap();
        tables.mark_as_imported(slot, import.clone());
        assert!(tables.has_import(&slot));

        drop(import);
        assert!(released.borrow().is_empty());
        assert_eq!(tables.flush(), 1);
        assert_eq!(*released.borrow(), vec![slot]);
        assert!(!tables.has_import(&slot));
    }

    #[test]
    fn disconnect_forgets_imports_without_releasing() {
        let (mut tables, released) = tables(true);
        let slot = Slot::remote(SlotKind::Object, 1);
        tables.mark_as_imported(slot, cap());
        tables.did_disconnect();
        assert_eq!(tables.import_count(), 0);
        assert_eq!(tables.flush(), 0);
        assert!(released.borrow().is_empty());
    }

    #[test]
    fn exports_are_deleted_once() {
        let (mut tables, _) = tables(false);
        let slot = Slot::local(SlotKind::Object, 1);
        let value = cap();
        tables.mark_as_exported(slot, value.clone());
        assert_eq!(tables.get_export(&slot), Some(value.clone()));
        assert_eq!(tables.delete_export(&slot), Some(value));
        assert_eq!(tables.delete_export(&slot), None);
        assert_eq!(tables.export_count(), 0);
    }
}
