//! Pending-operation registry: the process-wide table of in-flight
//! mutations used to tell push echoes apart from foreign changes, plus
//! the coarse local-write suppression window used where no operation id
//! can travel end to end.
//!
//! One instance is constructed per open session and injected where
//! needed; the registry is pure in-memory bookkeeping and none of its
//! operations can fail.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use chow_core::{EntryId, OpId, OpKind};
use metrics::counter;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::debug;

pub type IdSet = SmallVec<[EntryId; 4]>;

/// An in-flight mutation. `entry_ids` is every row the write touches in
/// the authority; `saving_ids`, when given, is the narrower subset that
/// should show a saving affordance (a reorder touches every row but only
/// the dragged one shows it).
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub id: OpId,
    pub kind: OpKind,
    pub entry_ids: IdSet,
    pub saving_ids: Option<IdSet>,
    pub started_at: Instant,
}

impl PendingOp {
    pub fn new(id: OpId, kind: OpKind, entry_ids: impl IntoIterator<Item = EntryId>) -> Self {
        Self {
            id,
            kind,
            entry_ids: entry_ids.into_iter().collect(),
            saving_ids: None,
            started_at: Instant::now(),
        }
    }

    /// Restrict the saving affordance to a subset of touched ids.
    pub fn saving(mut self, ids: impl IntoIterator<Item = EntryId>) -> Self {
        self.saving_ids = Some(ids.into_iter().collect());
        self
    }
}

struct Slot {
    op: PendingOp,
    /// Set by `complete`; once passed, the slot is purged so a missed
    /// echo cannot block foreign updates forever.
    linger_until: Option<Instant>,
}

/// Registry of pending operations, keyed by op id.
pub struct PendingOps {
    slots: Mutex<FxHashMap<OpId, Slot>>,
    epoch: watch::Sender<u64>,
    linger: Duration,
}

pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

impl PendingOps {
    pub fn new(linger: Duration) -> Self {
        let (epoch, _) = watch::channel(0u64);
        Self { slots: Mutex::new(FxHashMap::default()), epoch, linger }
    }

    /// Epoch channel bumped on every visible change; UI layers derive
    /// saving indicators by re-querying on each bump.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    fn bump(&self) {
        self.epoch.send_modify(|e| *e += 1);
    }

    /// Drop slots whose linger deadline has passed. Called under the lock
    /// by every public entry point, so expiry needs no background task.
    fn prune(&self, slots: &mut FxHashMap<OpId, Slot>) -> bool {
        let now = Instant::now();
        let before = slots.len();
        slots.retain(|id, s| match s.linger_until {
            Some(t) if t <= now => {
                debug!(op = %id, "pending op lingered out");
                false
            }
            _ => true,
        });
        let removed = before - slots.len();
        if removed > 0 {
            counter!("registry_gc_total", removed as u64);
        }
        removed > 0
    }

    /// Insert or replace an operation by id. Replacing clears any stale
    /// linger deadline left from a completed predecessor.
    pub fn register(&self, op: PendingOp) {
        let mut slots = self.slots.lock().unwrap();
        self.prune(&mut slots);
        debug!(op = %op.id, kind = ?op.kind, touches = op.entry_ids.len(), "op registered");
        slots.insert(op.id, Slot { op, linger_until: None });
        drop(slots);
        self.bump();
    }

    /// The direct response arrived: clear the saving affordance now, but
    /// keep the record briefly so a late echo still matches and is
    /// dropped instead of being merged as a foreign change.
    pub fn complete(&self, id: OpId) {
        let mut slots = self.slots.lock().unwrap();
        self.prune(&mut slots);
        let Some(slot) = slots.get_mut(&id) else { return };
        slot.op.saving_ids = Some(IdSet::new());
        slot.linger_until = Some(Instant::now() + self.linger);
        debug!(op = %id, "op complete, lingering");
        drop(slots);
        self.bump();
    }

    /// Unconditional removal: the echo was matched, or the write failed
    /// and the rollback path must unblock foreign notifications.
    pub fn ack(&self, id: OpId) {
        let mut slots = self.slots.lock().unwrap();
        let pruned = self.prune(&mut slots);
        let removed = slots.remove(&id).is_some();
        drop(slots);
        if removed {
            debug!(op = %id, "op acknowledged");
        }
        if removed || pruned {
            self.bump();
        }
    }

    /// Remove every operation touching the given entry. Used for delete
    /// echoes, which carry only the primary key. Returns whether anything
    /// matched.
    pub fn ack_by_entry(&self, entry_id: EntryId) -> bool {
        let mut slots = self.slots.lock().unwrap();
        self.prune(&mut slots);
        let before = slots.len();
        slots.retain(|_, s| !s.op.entry_ids.contains(&entry_id));
        let matched = slots.len() != before;
        drop(slots);
        if matched {
            debug!(entry = %entry_id, "ops acknowledged by entry");
            self.bump();
        }
        matched
    }

    pub fn has_op(&self, id: OpId) -> bool {
        let mut slots = self.slots.lock().unwrap();
        self.prune(&mut slots);
        slots.contains_key(&id)
    }

    /// True iff any live operation touches this entry; an unmatched
    /// foreign notification for such an entry may still be our own write
    /// in flight and is held back.
    pub fn has_op_for_entry(&self, entry_id: EntryId) -> bool {
        let mut slots = self.slots.lock().unwrap();
        self.prune(&mut slots);
        slots.values().any(|s| s.op.entry_ids.contains(&entry_id))
    }

    /// True iff the entry should show a saving affordance: the saving
    /// subset when one was given (empty after `complete`), otherwise the
    /// full touched set.
    pub fn is_saving(&self, entry_id: EntryId) -> bool {
        let mut slots = self.slots.lock().unwrap();
        self.prune(&mut slots);
        slots.values().any(|s| {
            s.op.saving_ids.as_ref().unwrap_or(&s.op.entry_ids).contains(&entry_id)
        })
    }

    pub fn len(&self) -> usize {
        let mut slots = self.slots.lock().unwrap();
        self.prune(&mut slots);
        slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force expiry of lingered slots; handy for shutdown paths.
    pub fn gc(&self) {
        let mut slots = self.slots.lock().unwrap();
        if self.prune(&mut slots) {
            drop(slots);
            self.bump();
        }
    }
}

impl Default for PendingOps {
    fn default() -> Self {
        Self::new(DEFAULT_LINGER)
    }
}

/// Blunt suppression fallback for collections whose mutation protocol
/// cannot attach an op id to the push notification: any notification
/// arriving within the window after a local write is treated as our own
/// echo. A foreign change inside the window is dropped until the next
/// refresh trigger; that imprecision is accepted.
#[derive(Debug, Default)]
pub struct WritePulse {
    last: Mutex<Option<Instant>>,
}

impl WritePulse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        *self.last.lock().unwrap() = Some(Instant::now());
    }

    pub fn should_ignore(&self, window: Duration) -> bool {
        match *self.last.lock().unwrap() {
            Some(t) => t.elapsed() < window,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn op(touching: &[EntryId]) -> PendingOp {
        PendingOp::new(Uuid::new_v4(), OpKind::UpdateQty, touching.iter().copied())
    }

    #[tokio::test(start_paused = true)]
    async fn register_then_ack_removes() {
        let reg = PendingOps::default();
        let e = Uuid::new_v4();
        let o = op(&[e]);
        let id = o.id;
        reg.register(o);
        assert!(reg.has_op(id));
        assert!(reg.has_op_for_entry(e));
        assert!(reg.is_saving(e));
        reg.ack(id);
        assert!(!reg.has_op(id));
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn complete_clears_saving_but_keeps_op() {
        let reg = PendingOps::default();
        let e = Uuid::new_v4();
        let o = op(&[e]);
        let id = o.id;
        reg.register(o);
        reg.complete(id);
        assert!(!reg.is_saving(e), "saving must clear immediately on complete");
        assert!(reg.has_op(id), "op must linger so the echo still matches");
        assert!(reg.has_op_for_entry(e));
    }

    #[tokio::test(start_paused = true)]
    async fn completed_op_lingers_out() {
        let reg = PendingOps::new(Duration::from_millis(100));
        let o = op(&[Uuid::new_v4()]);
        let id = o.id;
        reg.register(o);
        reg.complete(id);
        tokio::time::advance(Duration::from_millis(101)).await;
        assert!(!reg.has_op(id));
        assert!(reg.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn register_clears_stale_linger() {
        let reg = PendingOps::new(Duration::from_millis(100));
        let e = Uuid::new_v4();
        let first = op(&[e]);
        let id = first.id;
        reg.register(first);
        reg.complete(id);
        // Re-register the same id before the linger fires; the fresh op
        // must not be swept by the stale deadline.
        reg.register(PendingOp::new(id, OpKind::UpdateQty, [e]));
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(reg.has_op(id));
        assert!(reg.is_saving(e));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_by_entry_matches_all_touching_ops() {
        let reg = PendingOps::default();
        let e = Uuid::new_v4();
        let other = Uuid::new_v4();
        let a = op(&[e]);
        let b = op(&[e, other]);
        let c = op(&[other]);
        let c_id = c.id;
        reg.register(a);
        reg.register(b);
        reg.register(c);
        assert!(reg.ack_by_entry(e));
        assert!(!reg.has_op_for_entry(e));
        assert!(reg.has_op(c_id));
        assert!(!reg.ack_by_entry(e), "second ack finds nothing");
    }

    #[tokio::test(start_paused = true)]
    async fn saving_subset_narrows_indicator() {
        let reg = PendingOps::default();
        let dragged = Uuid::new_v4();
        let bystander = Uuid::new_v4();
        let o = PendingOp::new(Uuid::new_v4(), OpKind::Reorder, [dragged, bystander])
            .saving([dragged]);
        reg.register(o);
        assert!(reg.is_saving(dragged));
        assert!(!reg.is_saving(bystander));
        assert!(reg.has_op_for_entry(bystander), "touched set still holds notifications back");
    }

    #[tokio::test(start_paused = true)]
    async fn epoch_bumps_on_changes() {
        let reg = PendingOps::default();
        let rx = reg.subscribe();
        let start = *rx.borrow();
        let o = op(&[Uuid::new_v4()]);
        let id = o.id;
        reg.register(o);
        reg.complete(id);
        reg.ack(id);
        assert!(*rx.borrow() >= start + 3);
    }

    #[tokio::test(start_paused = true)]
    async fn write_pulse_window() {
        let pulse = WritePulse::new();
        assert!(!pulse.should_ignore(Duration::from_millis(400)));
        pulse.mark();
        assert!(pulse.should_ignore(Duration::from_millis(400)));
        tokio::time::advance(Duration::from_millis(401)).await;
        assert!(!pulse.should_ignore(Duration::from_millis(400)));
    }
}
