//! A map whose values may be collected, reporting their keys when they are.
//!
//! With weak values each stored capability carries a [`DropNotice`]; when the
//! last strong reference goes away the notice queues its key, and the next
//! [`FinalizingMap::flush`] calls the release callback for every queued key
//! whose binding is still dead. Release is therefore automatic but deferred
//! to the next flush.
//!
//! Without weak values the map holds everything strongly and never releases.

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::{Rc, Weak};

use crate::value::{Value, WeakValue};

enum Entry {
    Strong(Value),
    Weak(WeakValue),
}

impl Entry {
    fn get(&self) -> Option<Value> {
        match self {
            Entry::Strong(v) => Some(v.clone()),
            Entry::Weak(w) => w.upgrade(),
        }
    }
}

pub struct FinalizingMap<K> {
    entries: HashMap<K, Entry>,
    weak_values: bool,
    dead: Rc<RefCell<Vec<K>>>,
    on_release: Box<dyn FnMut(K)>,
}

/// Queues `key` for release when dropped along with the value it is
/// attached to.
struct DropNotice<K: Copy> {
    key: K,
    dead: Weak<RefCell<Vec<K>>>,
}

impl<K: Copy> Drop for DropNotice<K> {
    fn drop(&mut self) {
        let Some(dead) = self.dead.upgrade() else {
            return;
        };
        // A notice dropped while the queue is being drained is caught by the
        // next sweep instead.
        if let Ok(mut dead) = dead.try_borrow_mut() {
            dead.push(self.key);
        }
    }
}

impl<K> FinalizingMap<K>
where
    K: Copy + Eq + Hash + 'static,
{
    pub fn new(weak_values: bool, on_release: impl FnMut(K) + 'static) -> Self {
        Self {
            entries: HashMap::new(),
            weak_values,
            dead: Rc::new(RefCell::new(Vec::new())),
            on_release: Box::new(on_release),
        }
    }

    pub fn weak_values(&self) -> bool {
        self.weak_values
    }

    /// A strong reference to the live value bound to `key`.
    pub fn get(&self, key: &K) -> Option<Value> {
        self.entries.get(key).and_then(Entry::get)
    }

    pub fn has(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Bind `key` to `value`, releasing any prior binding first.
    pub fn set(&mut self, key: K, value: Value) {
        if self.entries.remove(&key).is_some() {
            (self.on_release)(key);
        }
        let entry = match value.downgrade() {
            Some(weak) if self.weak_values => {
                value.attach(Box::new(DropNotice {
                    key,
                    dead: Rc::downgrade(&self.dead),
                }));
                Entry::Weak(weak)
            }
            _ => Entry::Strong(value),
        };
        self.entries.insert(key, entry);
    }

    /// Forget `key` without releasing it.
    pub fn delete(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear_without_finalizing(&mut self) {
        self.entries.clear();
        self.dead.borrow_mut().clear();
    }

    /// Number of bindings, including dead ones not yet flushed.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Release every queued key whose binding is dead. Returns how many
    /// were released.
    pub fn flush(&mut self) -> usize {
        let queued = std::mem::take(&mut *self.dead.borrow_mut());
        let mut released = 0;
        for key in queued {
            if self.release_if_dead(key) {
                released += 1;
            }
        }
        released
    }

    /// Release every dead binding, queued or not.
    pub fn sweep(&mut self) -> usize {
        self.dead.borrow_mut().clear();
        let dead: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.get().is_none())
            .map(|(key, _)| *key)
            .collect();
        let mut released = 0;
        for key in dead {
            if self.release_if_dead(key) {
                released += 1;
            }
        }
        released
    }

    fn release_if_dead(&mut self, key: K) -> bool {
        let dead = matches!(self.entries.get(&key), Some(entry) if entry.get().is_none());
        if dead {
            self.entries.remove(&key);
            (self.on_release)(key);
        }
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Invocation;

    fn cap() -> Value {
        Value::far("Thing", |_inv: &Invocation| Ok(Value::Undefined))
    }

    fn map(weak: bool) -> (FinalizingMap<u32>, Rc<RefCell<Vec<u32>>>) {
        let released = Rc::new(RefCell::new(Vec::new()));
        let sink = released.clone();
        let map = FinalizingMap::new(weak, move |k| sink.borrow_mut().push(k));
        (map, released)
    }

    #[test]
    fn weak_values_release_after_last_reference() {
        let (mut m, released) = map(true);
        let v = cap();
        m.set(1, v.clone());
        assert_eq!(m.get(&1), Some(v.clone()));
        assert_eq!(m.flush(), 0);

        drop(v);
        assert!(!m.has(&1));
        assert_eq!(m.size(), 1);
        assert_eq!(m.flush(), 1);
        assert_eq!(*released.borrow(), vec![1]);
        assert_eq!(m.size(), 0);
    }

    #[test]
    fn rebinding_releases_the_old_binding_once() {
        let (mut m, released) = map(true);
        let old = cap();
        m.set(7, old.clone());
        drop(old);
        let new = cap();
        m.set(7, new.clone());
        assert_eq!(*released.borrow(), vec![7]);

        // The queued notice from the old value must not release the new one.
        assert_eq!(m.flush(), 0);
        assert_eq!(m.get(&7), Some(new));
        assert_eq!(released.borrow().len(), 1);
    }

    #[test]
    fn strong_map_never_releases() {
        let (mut m, released) = map(false);
        m.set(1, cap());
        assert!(m.has(&1));
        assert_eq!(m.flush(), 0);
        assert_eq!(m.sweep(), 0);
        assert!(released.borrow().is_empty());
    }

    #[test]
    fn clear_and_delete_do_not_release() {
        let (mut m, released) = map(true);
        let a = cap();
        m.set(1, a.clone());
        m.set(2, cap());
        assert!(m.delete(&1));
        m.clear_without_finalizing();
        drop(a);
        assert_eq!(m.flush(), 0);
        assert_eq!(m.size(), 0);
        assert!(released.borrow().is_empty());
    }

    #[test]
    fn sweep_finds_unqueued_dead_entries() {
        let (mut m, released) = map(true);
        let a = cap();
        m.set(3, a.clone());
        drop(a);
        m.dead.borrow_mut().clear();
        assert_eq!(m.flush(), 0);
        assert_eq!(m.sweep(), 1);
        assert_eq!(*released.borrow(), vec![3]);
    }
}
