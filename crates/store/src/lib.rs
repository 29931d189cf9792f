//! Optimistic replica of one day's entry collection, plus the echo
//! correlator that decides what to do with each push notification.
//!
//! The replica keeps an authoritative `Mutex<Vec<Entry>>` and publishes
//! an immutable snapshot through `ArcSwap` after every mutation, with a
//! watch epoch bumped so readers know to re-fetch. Readers never block
//! writers; writers never hold the lock across an await.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use chow_core::{
    round2, round4, sort_entries, totals, ChangeKind, ChangeNotice, Entry, EntryId, EntryStatus,
    Totals,
};
use chow_registry::PendingOps;
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, trace};

/// In-memory list state machine. All mutations follow the same shape:
/// lock, mutate, re-sort, publish snapshot, bump epoch.
pub struct Replica {
    items: Mutex<Vec<Entry>>,
    snap: ArcSwap<Vec<Entry>>,
    epoch: watch::Sender<u64>,
}

impl Replica {
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0u64);
        Self { items: Mutex::new(Vec::new()), snap: ArcSwap::from_pointee(Vec::new()), epoch }
    }

    /// Latest published snapshot, already display-sorted.
    pub fn current(&self) -> Arc<Vec<Entry>> {
        self.snap.load_full()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    pub fn get(&self, id: EntryId) -> Option<Entry> {
        self.items.lock().unwrap().iter().find(|e| e.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn totals(&self) -> Totals {
        totals(&self.items.lock().unwrap())
    }

    fn publish(&self, items: &[Entry]) {
        self.snap.store(Arc::new(items.to_vec()));
        self.epoch.send_modify(|e| *e += 1);
    }

    /// Insert or replace by id, then re-sort. A foreign insert for an id
    /// we already hold is treated as an update so the list never shows
    /// duplicates.
    pub fn upsert_foreign(&self, entry: Entry) {
        let mut items = self.items.lock().unwrap();
        match items.iter_mut().find(|e| e.id == entry.id) {
            Some(slot) => *slot = entry,
            None => items.push(entry),
        }
        sort_entries(&mut items);
        self.publish(&items);
    }

    /// Remove by id, returning the removed entry for restore-on-failure.
    pub fn remove(&self, id: EntryId) -> Option<Entry> {
        let mut items = self.items.lock().unwrap();
        let pos = items.iter().position(|e| e.id == id)?;
        let removed = items.remove(pos);
        self.publish(&items);
        Some(removed)
    }

    /// Append an optimistic row. With `ordering` unset it sorts after
    /// every persisted row, which is where a fresh insert belongs.
    pub fn insert_optimistic(&self, entry: Entry) {
        let mut items = self.items.lock().unwrap();
        items.push(entry);
        sort_entries(&mut items);
        self.publish(&items);
    }

    /// Optimistic quantity edit. Calories follow the per-unit rate when
    /// one is known, and a rate derived on the fly is frozen onto the
    /// entry so later edits scale consistently.
    pub fn apply_qty(&self, id: EntryId, qty: f64) -> bool {
        self.edit(id, |e| {
            if let Some(rate) = e.unit_rate() {
                e.kcal = round2(rate * qty);
                e.kcal_per_unit = Some(round4(rate));
            }
            e.qty = qty;
        })
    }

    pub fn set_status(&self, id: EntryId, status: EntryStatus) -> bool {
        self.edit(id, |e| e.status = status)
    }

    /// Combined qty + status edit used by the eaten/planned toggle.
    pub fn set_qty_status(&self, id: EntryId, qty: f64, status: EntryStatus) -> bool {
        self.edit(id, |e| {
            if let Some(rate) = e.unit_rate() {
                e.kcal = round2(rate * qty);
                e.kcal_per_unit = Some(round4(rate));
            }
            e.qty = qty;
            e.status = status;
        })
    }

    fn edit(&self, id: EntryId, f: impl FnOnce(&mut Entry)) -> bool {
        let mut items = self.items.lock().unwrap();
        let Some(slot) = items.iter_mut().find(|e| e.id == id) else { return false };
        f(slot);
        sort_entries(&mut items);
        self.publish(&items);
        true
    }

    /// Put a removed entry back after a failed delete. No-op if a push
    /// notification already re-delivered it.
    pub fn restore(&self, entry: Entry) -> bool {
        let mut items = self.items.lock().unwrap();
        if items.iter().any(|e| e.id == entry.id) {
            return false;
        }
        items.push(entry);
        sort_entries(&mut items);
        self.publish(&items);
        true
    }

    /// Renumber entries densely in the given sequence. Ids not present
    /// in the replica are skipped.
    pub fn apply_order(&self, ids: &[EntryId]) {
        let mut items = self.items.lock().unwrap();
        for (pos, id) in ids.iter().enumerate() {
            if let Some(e) = items.iter_mut().find(|e| e.id == *id) {
                e.ordering = Some(pos as i64);
            }
        }
        sort_entries(&mut items);
        self.publish(&items);
    }

    /// Replace the whole list with a previously captured snapshot,
    /// verbatim. Used to roll back a failed reorder.
    pub fn replace_all(&self, entries: Vec<Entry>) {
        let mut items = self.items.lock().unwrap();
        *items = entries;
        self.publish(&items);
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

/// What the correlator did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Carried a known op id, or was a delete matching a pending op by
    /// entry id. Acked and dropped.
    EchoAcked,
    /// Touches an entry with a live pending op but carried no matching
    /// op id. Dropped without acking; the direct response wins.
    HeldPending,
    /// Genuinely foreign; merged into the replica.
    ForeignApplied,
    /// Malformed or irrelevant (unknown delete target, insert with no
    /// row). Dropped.
    Ignored,
}

/// Routes validated change notices into the replica, suppressing our
/// own echoes via the pending-op registry.
pub struct Correlator {
    registry: Arc<PendingOps>,
    replica: Arc<Replica>,
}

impl Correlator {
    pub fn new(registry: Arc<PendingOps>, replica: Arc<Replica>) -> Self {
        Self { registry, replica }
    }

    pub fn observe(&self, notice: ChangeNotice) -> Disposition {
        // Step 1: exact echo by op id.
        if let Some(op) = notice.client_op_id {
            if self.registry.has_op(op) {
                self.registry.ack(op);
                counter!("reconcile_echo_suppressed_total", 1u64);
                trace!(op = %op, "echo suppressed by op id");
                return Disposition::EchoAcked;
            }
        }

        let target = match notice.kind {
            ChangeKind::Delete => notice.old_id.or_else(|| notice.entry.as_ref().map(|e| e.id)),
            _ => notice.entry.as_ref().map(|e| e.id),
        };
        let Some(target) = target else { return Disposition::Ignored };

        // Step 2: delete echoes often lose their op id in transit (the
        // old-row image carries only the key). Match by entry id before
        // the held-pending check so the registry is cleared either way.
        if notice.kind == ChangeKind::Delete && self.registry.ack_by_entry(target) {
            counter!("reconcile_echo_suppressed_total", 1u64);
            trace!(entry = %target, "delete echo suppressed by entry id");
            return Disposition::EchoAcked;
        }

        // Step 3: a non-matching notification for an entry we are still
        // writing is held back; the direct response will reconcile.
        if self.registry.has_op_for_entry(target) {
            debug!(entry = %target, "notification held, pending op in flight");
            return Disposition::HeldPending;
        }

        // Step 4: foreign change, merge it.
        match notice.kind {
            ChangeKind::Insert | ChangeKind::Update => match notice.entry {
                Some(entry) => {
                    self.replica.upsert_foreign(entry);
                    counter!("reconcile_foreign_applied_total", 1u64);
                    Disposition::ForeignApplied
                }
                None => Disposition::Ignored,
            },
            ChangeKind::Delete => {
                if self.replica.remove(target).is_some() {
                    counter!("reconcile_foreign_applied_total", 1u64);
                    Disposition::ForeignApplied
                } else {
                    Disposition::Ignored
                }
            }
        }
    }
}
