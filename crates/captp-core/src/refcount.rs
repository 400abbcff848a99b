use std::collections::{BTreeSet, HashMap};

use crate::slot::Slot;

/// Per-slot message counts for distributed GC.
///
/// Slots are staged while a message is built or handled. Staging is a set,
/// so one message counts once per slot however often it names it. The
/// staged slots are counted on [`commit`](Self::commit), once the send has
/// been accepted or the handler has succeeded, and forgotten on
/// [`abort`](Self::abort).
#[derive(Debug, Default)]
pub struct RefCounts {
    counts: HashMap<Slot, u64>,
    staged: BTreeSet<Slot>,
}

impl RefCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, slot: Slot) {
        self.staged.insert(slot);
    }

    pub fn commit(&mut self) {
        for slot in std::mem::take(&mut self.staged) {
            *self.counts.entry(slot).or_insert(0) += 1;
        }
    }

    pub fn abort(&mut self) {
        self.staged.clear();
    }

    /// Count the distinct slots of one message right away, leaving anything
    /// staged alone.
    pub fn count_message(&mut self, slots: impl IntoIterator<Item = Slot>) {
        let distinct: BTreeSet<Slot> = slots.into_iter().collect();
        for slot in distinct {
            *self.counts.entry(slot).or_insert(0) += 1;
        }
    }

    pub fn get(&self, slot: &Slot) -> u64 {
        self.counts.get(slot).copied().unwrap_or(0)
    }

    /// Forget `slot`, returning the count it had.
    pub fn take(&mut self, slot: &Slot) -> u64 {
        self.counts.remove(slot).unwrap_or(0)
    }

    /// Subtract `by` from `slot`. Returns true when the count reached zero,
    /// in which case the slot is forgotten.
    pub fn decrement(&mut self, slot: &Slot, by: u64) -> bool {
        match self.counts.get_mut(slot) {
            Some(count) if *count > by => {
                *count -= by;
                false
            }
            _ => {
                self.counts.remove(slot);
                true
            }
        }
    }

    pub fn clear(&mut self) {
        self.counts.clear();
        self.staged.clear();
    }
}
