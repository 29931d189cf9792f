//! The write side: a trait describing the remote authority that owns
//! the durable entry collection, and an in-memory implementation used
//! by tests and the demo binary.
//!
//! The in-memory authority behaves like the real service observed from
//! the client: writes validate and recompute on the server side, every
//! accepted write is broadcast back as a push notification, and the
//! delete notification carries only the old row's primary key.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use async_trait::async_trait;
use chow_core::{
    round2, round4, wire, Entry, EntryId, EntryStatus, FeedScope, OpId,
};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors surfaced by an authority. `Transport` covers everything the
/// network layer can do to us; the rest are semantic rejections.
#[derive(Debug, thiserror::Error)]
pub enum AuthorityError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("entry not found: {0}")]
    NotFound(EntryId),

    #[error("transport: {0}")]
    Transport(String),
}

/// Remote owner of the entry collection. Every mutation carries the op
/// id that the authority stamps onto its push notifications, which is
/// what lets the client tell its own echoes from foreign changes.
#[async_trait]
pub trait EntryAuthority: Send + Sync {
    async fn insert_entry(
        &self,
        scope: FeedScope,
        entry: Entry,
        op: OpId,
    ) -> Result<(), AuthorityError>;

    /// Batch insert sharing one op id, used when copying a whole day.
    async fn insert_many(
        &self,
        scope: FeedScope,
        entries: Vec<Entry>,
        op: OpId,
    ) -> Result<usize, AuthorityError>;

    async fn update_qty(&self, id: EntryId, qty: f64, op: OpId) -> Result<(), AuthorityError>;

    async fn update_qty_status(
        &self,
        id: EntryId,
        qty: f64,
        status: EntryStatus,
        op: OpId,
    ) -> Result<(), AuthorityError>;

    async fn delete_entry(&self, id: EntryId, op: OpId) -> Result<(), AuthorityError>;

    /// Persist a full ordering for the scope. The authority renumbers
    /// densely and notifies once per touched row.
    async fn reorder_entries(
        &self,
        scope: FeedScope,
        ids: &[EntryId],
        op: OpId,
    ) -> Result<(), AuthorityError>;

    /// Authoritative read, used by coarse refresh paths and on
    /// resubscribe.
    async fn fetch_all(&self, scope: FeedScope) -> Result<Vec<Entry>, AuthorityError>;
}

/// In-memory authority with a broadcast channel standing in for the
/// push transport. `fail_next` injects one error into the next mutation
/// for failure-path tests.
pub struct MemoryAuthority {
    days: Mutex<FxHashMap<Uuid, Vec<Entry>>>,
    tx: broadcast::Sender<Value>,
    fail_next: Mutex<Option<AuthorityError>>,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { days: Mutex::new(FxHashMap::default()), tx, fail_next: Mutex::new(None) }
    }

    /// Raw push notifications, exactly as the wire would carry them.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }

    /// The broadcast side of the push channel, for wiring a transport.
    pub fn push_sender(&self) -> broadcast::Sender<Value> {
        self.tx.clone()
    }

    pub fn fail_next(&self, err: AuthorityError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    /// Seed rows without generating notifications.
    pub fn seed(&self, scope: FeedScope, entries: Vec<Entry>) {
        self.days.lock().unwrap().entry(scope.day).or_default().extend(entries);
    }

    fn take_failure(&self) -> Result<(), AuthorityError> {
        match self.fail_next.lock().unwrap().take() {
            Some(err) => {
                warn!(%err, "injected failure");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn push(&self, event: &str, new: Value, old: Value) {
        // No subscribers is fine; the send error only means that.
        let _ = self.tx.send(json!({ "event": event, "new": new, "old": old }));
    }

    fn insert_one(
        &self,
        days: &mut FxHashMap<Uuid, Vec<Entry>>,
        scope: FeedScope,
        mut entry: Entry,
        op: OpId,
    ) -> Result<(), AuthorityError> {
        if !entry.qty.is_finite() || entry.qty < 0.0 {
            return Err(AuthorityError::Validation(format!("qty {} out of range", entry.qty)));
        }
        if entry.name.trim().is_empty() {
            return Err(AuthorityError::Validation("empty name".into()));
        }
        let rows = days.entry(scope.day).or_default();
        if rows.iter().any(|e| e.id == entry.id) {
            return Err(AuthorityError::Rejected(format!("duplicate id {}", entry.id)));
        }
        if entry.ordering.is_none() {
            entry.ordering = Some(rows.len() as i64);
        }
        rows.push(entry.clone());
        debug!(entry = %entry.id, op = %op, "insert accepted");
        self.push("INSERT", wire::row_json(&entry, Some(op)), Value::Null);
        Ok(())
    }

    fn update_row(
        &self,
        id: EntryId,
        op: OpId,
        f: impl FnOnce(&mut Entry),
    ) -> Result<(), AuthorityError> {
        let mut days = self.days.lock().unwrap();
        let row = days
            .values_mut()
            .flat_map(|rows| rows.iter_mut())
            .find(|e| e.id == id)
            .ok_or(AuthorityError::NotFound(id))?;
        f(row);
        let updated = row.clone();
        drop(days);
        debug!(entry = %id, op = %op, "update accepted");
        self.push("UPDATE", wire::row_json(&updated, Some(op)), Value::Null);
        Ok(())
    }
}

impl Default for MemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

fn check_qty(qty: f64) -> Result<(), AuthorityError> {
    if qty.is_finite() && qty > 0.0 {
        Ok(())
    } else {
        Err(AuthorityError::Validation(format!("qty {qty} out of range")))
    }
}

fn recompute(e: &mut Entry, qty: f64) {
    if let Some(rate) = e.unit_rate() {
        e.kcal = round2(rate * qty);
        e.kcal_per_unit = Some(round4(rate));
    }
    e.qty = qty;
}

#[async_trait]
impl EntryAuthority for MemoryAuthority {
    async fn insert_entry(
        &self,
        scope: FeedScope,
        entry: Entry,
        op: OpId,
    ) -> Result<(), AuthorityError> {
        self.take_failure()?;
        let mut days = self.days.lock().unwrap();
        self.insert_one(&mut days, scope, entry, op)
    }

    async fn insert_many(
        &self,
        scope: FeedScope,
        entries: Vec<Entry>,
        op: OpId,
    ) -> Result<usize, AuthorityError> {
        self.take_failure()?;
        let mut days = self.days.lock().unwrap();
        let mut n = 0;
        for entry in entries {
            self.insert_one(&mut days, scope, entry, op)?;
            n += 1;
        }
        Ok(n)
    }

    async fn update_qty(&self, id: EntryId, qty: f64, op: OpId) -> Result<(), AuthorityError> {
        self.take_failure()?;
        check_qty(qty)?;
        self.update_row(id, op, |e| recompute(e, qty))
    }

    async fn update_qty_status(
        &self,
        id: EntryId,
        qty: f64,
        status: EntryStatus,
        op: OpId,
    ) -> Result<(), AuthorityError> {
        self.take_failure()?;
        check_qty(qty)?;
        self.update_row(id, op, |e| {
            recompute(e, qty);
            e.status = status;
        })
    }

    async fn delete_entry(&self, id: EntryId, op: OpId) -> Result<(), AuthorityError> {
        self.take_failure()?;
        let mut days = self.days.lock().unwrap();
        let rows = days
            .values_mut()
            .find(|rows| rows.iter().any(|e| e.id == id))
            .ok_or(AuthorityError::NotFound(id))?;
        rows.retain(|e| e.id != id);
        drop(days);
        debug!(entry = %id, op = %op, "delete accepted");
        // The old-row image carries only the key, like a replica
        // identity of default; the op id does not survive either.
        self.push("DELETE", Value::Null, json!({ "id": id.to_string() }));
        Ok(())
    }

    async fn reorder_entries(
        &self,
        scope: FeedScope,
        ids: &[EntryId],
        op: OpId,
    ) -> Result<(), AuthorityError> {
        self.take_failure()?;
        let mut days = self.days.lock().unwrap();
        let rows = days.entry(scope.day).or_default();
        let mut touched = Vec::with_capacity(ids.len());
        for (pos, id) in ids.iter().enumerate() {
            let row = rows
                .iter_mut()
                .find(|e| e.id == *id)
                .ok_or(AuthorityError::NotFound(*id))?;
            row.ordering = Some(pos as i64);
            touched.push(row.clone());
        }
        drop(days);
        debug!(op = %op, rows = touched.len(), "reorder accepted");
        for row in touched {
            self.push("UPDATE", wire::row_json(&row, Some(op)), Value::Null);
        }
        Ok(())
    }

    async fn fetch_all(&self, scope: FeedScope) -> Result<Vec<Entry>, AuthorityError> {
        self.take_failure()?;
        let days = self.days.lock().unwrap();
        let mut rows = days.get(&scope.day).cloned().unwrap_or_default();
        chow_core::sort_entries(&mut rows);
        Ok(rows)
    }
}
