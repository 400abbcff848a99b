use std::collections::BTreeMap;

use crate::message::MessageKind;

/// Message and GC counters for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Messages handed to the raw channel, by kind.
    pub send: BTreeMap<MessageKind, u64>,
    /// Messages accepted by `dispatch`, by kind.
    pub recv: BTreeMap<MessageKind, u64>,
    /// Exports (and cached answers) deleted after the peer dropped them.
    pub gc_dropped: u64,
    /// Messages discarded because they carried another epoch.
    pub stale_epoch: u64,
}

impl Default for Stats {
    fn default() -> Self {
        let zeroed = || MessageKind::ALL.iter().map(|&k| (k, 0)).collect();
        Self {
            send: zeroed(),
            recv: zeroed(),
            gc_dropped: 0,
            stale_epoch: 0,
        }
    }
}

impl Stats {
    pub fn sent(&self, kind: MessageKind) -> u64 {
        self.send.get(&kind).copied().unwrap_or(0)
    }

    pub fn received(&self, kind: MessageKind) -> u64 {
        self.recv.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_sent(&self) -> u64 {
        self.send.values().sum()
    }

    pub(crate) fn record_send(&mut self, kind: MessageKind) {
        *self.send.entry(kind).or_insert(0) += 1;
    }

    pub(crate) fn record_recv(&mut self, kind: MessageKind) {
        *self.recv.entry(kind).or_insert(0) += 1;
    }
}
