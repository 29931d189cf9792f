//! Feed engine: the mutation side of one day's entry collection.
//!
//! Every mutation follows the same commit protocol: apply optimistically
//! to the replica, register a pending op, send to the authority, then
//! either `complete` (success; the op lingers briefly to swallow its
//! echo) or `ack` plus rollback (failure). Only the newest in-flight
//! write per entry may roll back; stale failures are acked and otherwise
//! ignored.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chow_authority::{AuthorityError, EntryAuthority};
use chow_core::{
    round2, round4, CatalogItem, Entry, EntryId, EntryStatus, FeedScope, OpId, OpKind, Totals,
};
use chow_registry::{PendingOp, PendingOps, DEFAULT_LINGER};
use chow_store::{Correlator, Replica};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tunables, overridable via `CHOW_*` environment variables.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Quiet period before a quantity edit is committed.
    pub debounce: Duration,
    /// How long a completed op stays registered to catch its echo.
    pub op_linger: Duration,
    /// Coarse suppression window for collections without op ids.
    pub suppress_window: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(600),
            op_linger: DEFAULT_LINGER,
            suppress_window: Duration::from_millis(400),
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        fn ms(var: &str) -> Option<Duration> {
            std::env::var(var).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis)
        }
        let d = Self::default();
        Self {
            debounce: ms("CHOW_DEBOUNCE_MS").unwrap_or(d.debounce),
            op_linger: ms("CHOW_OP_LINGER_MS").unwrap_or(d.op_linger),
            suppress_window: ms("CHOW_SUPPRESS_MS").unwrap_or(d.suppress_window),
        }
    }
}

/// User-facing notices emitted by failed or noteworthy mutations.
#[derive(Debug, Clone)]
pub enum Alert {
    Info(String),
    Error(String),
}

/// Handle to one day's feed. Cheap to clone; all clones share the same
/// replica and registry.
#[derive(Clone)]
pub struct Feed {
    scope: FeedScope,
    registry: Arc<PendingOps>,
    replica: Arc<Replica>,
    correlator: Arc<Correlator>,
    authority: Arc<dyn EntryAuthority>,
    cfg: FeedConfig,
    drag_lock: Arc<AtomicBool>,
    alerts: broadcast::Sender<Alert>,
    /// Newest in-flight toggle per entry; only it may roll back.
    toggles: Arc<Mutex<FxHashMap<EntryId, OpId>>>,
}

impl Feed {
    pub fn new(scope: FeedScope, authority: Arc<dyn EntryAuthority>, cfg: FeedConfig) -> Self {
        let registry = Arc::new(PendingOps::new(cfg.op_linger));
        let replica = Arc::new(Replica::new());
        let correlator = Arc::new(Correlator::new(registry.clone(), replica.clone()));
        let (alerts, _) = broadcast::channel(32);
        Self {
            scope,
            registry,
            replica,
            correlator,
            authority,
            cfg,
            drag_lock: Arc::new(AtomicBool::new(false)),
            alerts,
            toggles: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    pub fn scope(&self) -> FeedScope {
        self.scope
    }

    pub fn registry(&self) -> Arc<PendingOps> {
        self.registry.clone()
    }

    pub fn replica(&self) -> Arc<Replica> {
        self.replica.clone()
    }

    /// Shared correlator, for wiring into a bridge.
    pub fn correlator(&self) -> Arc<Correlator> {
        self.correlator.clone()
    }

    pub fn alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    pub fn entries(&self) -> Arc<Vec<Entry>> {
        self.replica.current()
    }

    pub fn totals(&self) -> Totals {
        self.replica.totals()
    }

    pub fn is_saving(&self, id: EntryId) -> bool {
        self.registry.is_saving(id)
    }

    fn alert_error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        counter!("commit_rollback_total", 1u64);
        let _ = self.alerts.send(Alert::Error(msg));
    }

    /// Authoritative re-read; used on resubscribe and by coarse refresh
    /// consumers. Skipped while a drag is in flight so the fetched order
    /// cannot clobber the in-progress one.
    pub async fn refresh(&self) -> Result<(), AuthorityError> {
        if self.drag_lock.load(Ordering::SeqCst) {
            debug!("refresh skipped, drag in flight");
            return Ok(());
        }
        let rows = self.authority.fetch_all(self.scope).await?;
        info!(rows = rows.len(), "feed refreshed");
        self.replica.replace_all(rows);
        Ok(())
    }

    /// Optimistic insert from a catalog item. The per-unit rate is
    /// frozen at insert time so later catalog edits never rewrite
    /// history. Returns the new entry id, or None if rejected.
    pub async fn insert_from_catalog(&self, item: &CatalogItem, multiplier: f64) -> Option<EntryId> {
        let qty = item.default_qty * multiplier;
        if !qty.is_finite() || qty < 0.0 {
            self.alert_error(format!("invalid quantity for {}", item.name));
            return None;
        }
        let rate = round4(item.kcal_per_unit);
        let entry = Entry {
            id: Uuid::new_v4(),
            name: item.name.clone(),
            unit: item.unit.clone(),
            qty,
            kcal: round2(rate * qty),
            kcal_per_unit: Some(rate),
            status: EntryStatus::Planned,
            created_at: chrono::Utc::now(),
            ordering: None,
        };
        self.insert_entry(entry).await
    }

    pub async fn insert_entry(&self, entry: Entry) -> Option<EntryId> {
        let id = entry.id;
        let op = Uuid::new_v4();
        self.replica.insert_optimistic(entry.clone());
        self.registry.register(PendingOp::new(op, OpKind::Insert, [id]));
        debug!(entry = %id, op = %op, "insert dispatched");
        match self.authority.insert_entry(self.scope, entry, op).await {
            Ok(()) => {
                self.registry.complete(op);
                Some(id)
            }
            Err(err) => {
                warn!(entry = %id, %err, "insert failed, rolling back");
                self.registry.ack(op);
                self.replica.remove(id);
                self.alert_error(format!("could not add entry: {err}"));
                None
            }
        }
    }

    /// Optimistic delete. On failure the removed entry is restored
    /// unless a push notification already brought it back.
    pub async fn delete(&self, id: EntryId) -> bool {
        let Some(removed) = self.replica.remove(id) else { return false };
        let op = Uuid::new_v4();
        self.registry.register(PendingOp::new(op, OpKind::Delete, [id]));
        debug!(entry = %id, op = %op, "delete dispatched");
        match self.authority.delete_entry(id, op).await {
            Ok(()) => {
                self.registry.complete(op);
                true
            }
            Err(err) => {
                warn!(entry = %id, %err, "delete failed, restoring");
                self.registry.ack(op);
                self.replica.restore(removed);
                self.alert_error(format!("could not delete entry: {err}"));
                false
            }
        }
    }

    /// Flip planned/eaten. The quantity committed alongside is the
    /// editor's live value when one exists, else the stored quantity,
    /// else 1 so a zero-quantity row still becomes countable.
    pub async fn toggle_status(&self, id: EntryId, editor: Option<&QtyEditor>) -> bool {
        let Some(prev) = self.replica.get(id) else { return false };
        if let Some(ed) = editor {
            ed.cancel_pending();
        }
        let next = match prev.status {
            EntryStatus::Planned => EntryStatus::Eaten,
            EntryStatus::Eaten => EntryStatus::Planned,
        };
        let qty = editor
            .and_then(|ed| ed.latest_qty())
            .or_else(|| (prev.qty > 0.0).then_some(prev.qty))
            .unwrap_or(1.0);

        self.replica.set_qty_status(id, qty, next);
        let op = Uuid::new_v4();
        self.registry.register(PendingOp::new(op, OpKind::UpdateQtyStatus, [id]));
        self.toggles.lock().unwrap().insert(id, op);
        debug!(entry = %id, op = %op, status = status_str(next), "toggle dispatched");

        match self.authority.update_qty_status(id, qty, next, op).await {
            Ok(()) => {
                self.registry.complete(op);
                true
            }
            Err(err) => {
                self.registry.ack(op);
                // Only the newest toggle for this entry may roll back.
                if self.toggles.lock().unwrap().get(&id) == Some(&op) {
                    warn!(entry = %id, %err, "toggle failed, rolling back");
                    self.replica.upsert_foreign(prev);
                    self.alert_error(format!("could not update entry: {err}"));
                } else {
                    debug!(entry = %id, "stale toggle failure ignored");
                }
                false
            }
        }
    }

    /// Move an entry to `target` in the display order and persist the
    /// full dense renumbering. One drag at a time; the lock also keeps
    /// refreshes from clobbering the optimistic order mid-flight.
    pub async fn reorder(&self, moved: EntryId, target: usize) -> bool {
        if self.drag_lock.swap(true, Ordering::SeqCst) {
            debug!(entry = %moved, "reorder rejected, drag in flight");
            return false;
        }
        let result = self.reorder_inner(moved, target).await;
        self.drag_lock.store(false, Ordering::SeqCst);
        result
    }

    async fn reorder_inner(&self, moved: EntryId, target: usize) -> bool {
        let prev = self.replica.current();
        let mut ids: Vec<EntryId> = prev.iter().map(|e| e.id).collect();
        let Some(pos) = ids.iter().position(|id| *id == moved) else { return false };
        ids.remove(pos);
        ids.insert(target.min(ids.len()), moved);

        self.replica.apply_order(&ids);
        let op = Uuid::new_v4();
        self.registry
            .register(PendingOp::new(op, OpKind::Reorder, ids.iter().copied()).saving([moved]));
        debug!(op = %op, rows = ids.len(), "reorder dispatched");

        match self.authority.reorder_entries(self.scope, &ids, op).await {
            Ok(()) => {
                self.registry.complete(op);
                true
            }
            Err(err) => {
                warn!(%err, "reorder failed, restoring previous order");
                self.registry.ack(op);
                self.replica.replace_all((*prev).clone());
                self.alert_error(format!("could not reorder: {err}"));
                false
            }
        }
    }

    /// Copy another day's rows into this feed under a single op id.
    /// All-or-nothing: any rejection rolls back the whole optimistic
    /// batch.
    pub async fn copy_day(&self, from: FeedScope) -> Result<usize, AuthorityError> {
        let source = self.authority.fetch_all(from).await?;
        if source.is_empty() {
            return Ok(0);
        }
        let now = chrono::Utc::now();
        let copies: Vec<Entry> = source
            .into_iter()
            .map(|e| Entry {
                id: Uuid::new_v4(),
                status: EntryStatus::Planned,
                created_at: now,
                ordering: None,
                ..e
            })
            .collect();
        let ids: Vec<EntryId> = copies.iter().map(|e| e.id).collect();
        for e in &copies {
            self.replica.insert_optimistic(e.clone());
        }
        let op = Uuid::new_v4();
        self.registry.register(PendingOp::new(op, OpKind::Insert, ids.iter().copied()));
        info!(op = %op, rows = ids.len(), "day copy dispatched");

        match self.authority.insert_many(self.scope, copies, op).await {
            Ok(n) => {
                self.registry.complete(op);
                Ok(n)
            }
            Err(err) => {
                warn!(%err, "day copy failed, rolling back");
                self.registry.ack(op);
                for id in ids {
                    self.replica.remove(id);
                }
                self.alert_error(format!("could not copy day: {err}"));
                Err(err)
            }
        }
    }

    /// Debounced quantity editor for one entry. None if the entry is
    /// not in the replica.
    pub fn editor(&self, id: EntryId) -> Option<QtyEditor> {
        let entry = self.replica.get(id)?;
        Some(QtyEditor {
            inner: Arc::new(EditorInner {
                feed: self.clone(),
                id,
                text: Mutex::new(fmt_qty(entry.qty)),
                last_good: Mutex::new((entry.qty > 0.0).then_some(entry.qty)),
                last_op: Mutex::new(None),
                pending: Mutex::new(None),
            }),
        })
    }
}

fn status_str(s: EntryStatus) -> &'static str {
    match s {
        EntryStatus::Planned => "planned",
        EntryStatus::Eaten => "eaten",
    }
}

fn fmt_qty(qty: f64) -> String {
    if qty == qty.trunc() && qty.abs() < 1e15 {
        format!("{}", qty as i64)
    } else {
        format!("{qty}")
    }
}

/// Per-entry quantity editor. Keystrokes apply optimistically at once;
/// the commit to the authority waits for a quiet period, and a blur or
/// toggle forces it immediately.
#[derive(Clone)]
pub struct QtyEditor {
    inner: Arc<EditorInner>,
}

struct EditorInner {
    feed: Feed,
    id: EntryId,
    text: Mutex<String>,
    /// Last value the authority confirmed; rollback target.
    last_good: Mutex<Option<f64>>,
    /// Newest issued commit; only it may roll back or advance last_good.
    last_op: Mutex<Option<OpId>>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl QtyEditor {
    pub fn text(&self) -> String {
        self.inner.text.lock().unwrap().clone()
    }

    /// Current text parsed as a committable quantity.
    pub fn latest_qty(&self) -> Option<f64> {
        let text = self.inner.text.lock().unwrap();
        parse_qty(&text)
    }

    pub fn cancel_pending(&self) {
        if let Some(h) = self.inner.pending.lock().unwrap().take() {
            h.abort();
        }
    }

    /// One keystroke. A valid value lands in the replica immediately
    /// and schedules a debounced commit; invalid input only updates the
    /// text and cancels any scheduled commit.
    pub fn input(&self, text: &str) {
        *self.inner.text.lock().unwrap() = text.to_string();
        let Some(qty) = parse_qty(text) else {
            self.cancel_pending();
            return;
        };
        self.inner.feed.replica.apply_qty(self.inner.id, qty);
        self.cancel_pending();
        let editor = self.clone();
        // Measure the quiet period from the keystroke, not from the
        // task's first poll.
        let deadline = Instant::now() + self.inner.feed.cfg.debounce;
        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            editor.send(qty).await;
        });
        *self.inner.pending.lock().unwrap() = Some(handle);
    }

    /// Commit the current value now (blur, enter, toggle). Invalid text
    /// reverts to the last confirmed value instead of committing.
    pub async fn commit_now(&self) {
        self.cancel_pending();
        match self.latest_qty() {
            Some(qty) => self.send(qty).await,
            None => self.revert(),
        }
    }

    fn revert(&self) {
        let Some(good) = *self.inner.last_good.lock().unwrap() else { return };
        *self.inner.text.lock().unwrap() = fmt_qty(good);
        self.inner.feed.replica.apply_qty(self.inner.id, good);
    }

    async fn send(&self, qty: f64) {
        let inner = &self.inner;
        let op = Uuid::new_v4();
        *inner.last_op.lock().unwrap() = Some(op);
        inner.feed.registry.register(PendingOp::new(op, OpKind::UpdateQty, [inner.id]));
        debug!(entry = %inner.id, op = %op, qty, "qty commit dispatched");

        match inner.feed.authority.update_qty(inner.id, qty, op).await {
            Ok(()) => {
                inner.feed.registry.complete(op);
                if *inner.last_op.lock().unwrap() == Some(op) {
                    *inner.last_good.lock().unwrap() = Some(qty);
                }
            }
            Err(err) => {
                inner.feed.registry.ack(op);
                // A newer commit superseded this one; its outcome wins.
                if *inner.last_op.lock().unwrap() != Some(op) {
                    debug!(entry = %inner.id, op = %op, "stale qty failure ignored");
                    return;
                }
                warn!(entry = %inner.id, %err, "qty commit failed, rolling back");
                self.revert();
                inner.feed.alert_error(format!("could not save quantity: {err}"));
            }
        }
    }
}

fn parse_qty(text: &str) -> Option<f64> {
    let qty = text.trim().parse::<f64>().ok()?;
    (qty.is_finite() && qty > 0.0).then_some(qty)
}
