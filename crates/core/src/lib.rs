//! Chow core types: the day-feed entry model, operation tags, and the
//! normalized change notices the reconciliation engine consumes.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of an entry, assigned by the client on optimistic
/// insert and kept by the authority.
pub type EntryId = Uuid;

/// Client-generated identifier attached to a mutation so its push echo
/// can be recognized later.
pub type OpId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Planned,
    Eaten,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Planned => "planned",
            EntryStatus::Eaten => "eaten",
        }
    }

    /// Anything that is not exactly "eaten" reads as planned.
    pub fn parse(s: &str) -> Self {
        if s == "eaten" { EntryStatus::Eaten } else { EntryStatus::Planned }
    }
}

/// One record of the ordered collection (a food-log row for the day).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub name: String,
    pub unit: String,
    pub qty: f64,
    /// Derived energy snapshot (kcal), kept to two decimals.
    pub kcal: f64,
    /// Frozen per-unit rate (kcal per unit), four decimals. Captured at
    /// entry creation so quantity edits never re-derive from stale
    /// aggregates. Very old rows may lack it.
    pub kcal_per_unit: Option<f64>,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    /// Server-side position within the day (0-based, dense at rest).
    /// `None` means not yet ranked; such rows sort last.
    pub ordering: Option<i64>,
}

impl Entry {
    /// The per-unit rate used for energy recomputes: the frozen snapshot
    /// when present and positive, otherwise derived once from the current
    /// qty/kcal pair.
    pub fn unit_rate(&self) -> Option<f64> {
        match self.kcal_per_unit {
            Some(r) if r.is_finite() && r > 0.0 => Some(r),
            _ => {
                if self.qty > 0.0 && self.kcal.is_finite() && self.kcal > 0.0 {
                    Some(round4(self.kcal / self.qty))
                } else {
                    None
                }
            }
        }
    }
}

/// Round to two decimals (energy snapshots).
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Round to four decimals (per-unit rates).
pub fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Render order: ascending `ordering`, rows without one last, ties broken
/// by creation time so the result is deterministic even transiently.
pub fn sort_entries(items: &mut [Entry]) {
    items.sort_by(|a, b| {
        let ao = a.ordering.unwrap_or(i64::MAX);
        let bo = b.ordering.unwrap_or(i64::MAX);
        ao.cmp(&bo).then(a.created_at.cmp(&b.created_at))
    });
}

/// Planned/eaten energy sums derived from the optimistic state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Totals {
    pub planned: f64,
    pub eaten: f64,
}

impl Totals {
    pub fn total(&self) -> f64 {
        self.planned + self.eaten
    }
}

pub fn totals(items: &[Entry]) -> Totals {
    let mut t = Totals::default();
    for e in items {
        match e.status {
            EntryStatus::Planned => t.planned += e.kcal,
            EntryStatus::Eaten => t.eaten += e.kcal,
        }
    }
    t
}

/// Mutation kinds tracked by the pending-operation registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert,
    UpdateQty,
    UpdateQtyStatus,
    Delete,
    Reorder,
}

/// Scope unit for one replica and one push subscription: a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedScope {
    pub day: Uuid,
}

impl FeedScope {
    pub fn new(day: Uuid) -> Self {
        Self { day }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A push notification after normalization: parsed row (when present),
/// the old row's id, and the carried operation id. Delete broadcasts
/// usually have no op id because the authority can no longer read the
/// deleted row when it composes them.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotice {
    pub kind: ChangeKind,
    pub entry: Option<Entry>,
    pub old_id: Option<EntryId>,
    pub client_op_id: Option<OpId>,
}

/// A catalog item an entry can be created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: Uuid,
    pub name: String,
    pub unit: String,
    pub kcal_per_unit: f64,
    pub default_qty: f64,
}

pub mod wire {
    //! Row codec for the push channel. Writing is exact; parsing is
    //! tolerant (string-or-number scalars, defaulted status) because the
    //! transport does not guarantee well-typed payloads.

    use super::*;
    use serde_json::{json, Value};

    pub fn row_json(e: &Entry, op: Option<OpId>) -> Value {
        json!({
            "id": e.id.to_string(),
            "name": e.name,
            "unit": e.unit,
            "qty": e.qty,
            "kcal_snapshot": e.kcal,
            "kcal_per_unit_snapshot": e.kcal_per_unit,
            "status": e.status.as_str(),
            "created_at": e.created_at.to_rfc3339(),
            "ordering": e.ordering,
            "client_op_id": op.map(|o| o.to_string()),
        })
    }

    fn as_f64(v: Option<&Value>) -> Option<f64> {
        match v {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Parse a broadcast row into an `Entry`. Only the id is mandatory;
    /// everything else falls back to a safe default.
    pub fn parse_row(row: &Value) -> Option<Entry> {
        let obj = row.as_object()?;
        let id = obj.get("id")?.as_str()?.parse::<Uuid>().ok()?;

        let name = obj.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let unit = obj.get("unit").and_then(|v| v.as_str()).unwrap_or("").to_string();

        let qty = match as_f64(obj.get("qty")) {
            Some(q) if q.is_finite() && q > 0.0 => q,
            _ => 0.0,
        };
        let kcal = as_f64(obj.get("kcal_snapshot")).filter(|k| k.is_finite()).unwrap_or(0.0);
        let kcal_per_unit = as_f64(obj.get("kcal_per_unit_snapshot")).filter(|r| r.is_finite());

        let status = obj
            .get("status")
            .and_then(|v| v.as_str())
            .map(EntryStatus::parse)
            .unwrap_or(EntryStatus::Planned);

        let created_at = obj
            .get("created_at")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let ordering = match obj.get("ordering") {
            Some(Value::Number(n)) => n.as_i64(),
            Some(Value::String(s)) => s.parse::<i64>().ok(),
            _ => None,
        };

        Some(Entry { id, name, unit, qty, kcal, kcal_per_unit, status, created_at, ordering })
    }

    /// Extract a usable op id from a broadcast row: non-empty string that
    /// parses as a UUID, anything else reads as absent.
    pub fn row_op_id(row: &Value) -> Option<OpId> {
        row.get("client_op_id")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse::<OpId>().ok())
    }

    pub fn row_id(row: &Value) -> Option<EntryId> {
        row.get("id").and_then(|v| v.as_str()).and_then(|s| s.parse::<EntryId>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(ordering: Option<i64>, created_secs: i64) -> Entry {
        Entry {
            id: Uuid::new_v4(),
            name: "Kibble".into(),
            unit: "cup".into(),
            qty: 2.0,
            kcal: 300.0,
            kcal_per_unit: Some(150.0),
            status: EntryStatus::Planned,
            created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
            ordering,
        }
    }

    #[test]
    fn sorts_by_ordering_with_unranked_last() {
        let a = entry(Some(1), 10);
        let b = entry(Some(0), 20);
        let c = entry(None, 5);
        let mut items = vec![a.clone(), c.clone(), b.clone()];
        sort_entries(&mut items);
        assert_eq!(items[0].id, b.id);
        assert_eq!(items[1].id, a.id);
        assert_eq!(items[2].id, c.id);
    }

    #[test]
    fn unranked_ties_break_on_created_at() {
        let older = entry(None, 1);
        let newer = entry(None, 2);
        let mut items = vec![newer.clone(), older.clone()];
        sort_entries(&mut items);
        assert_eq!(items[0].id, older.id);
        assert_eq!(items[1].id, newer.id);
    }

    #[test]
    fn unit_rate_prefers_frozen_snapshot() {
        let e = entry(None, 0);
        assert_eq!(e.unit_rate(), Some(150.0));
    }

    #[test]
    fn unit_rate_derives_when_snapshot_missing() {
        let mut e = entry(None, 0);
        e.kcal_per_unit = None;
        e.qty = 3.0;
        e.kcal = 100.0;
        assert_eq!(e.unit_rate(), Some(round4(100.0 / 3.0)));
    }

    #[test]
    fn unit_rate_gives_up_without_data() {
        let mut e = entry(None, 0);
        e.kcal_per_unit = None;
        e.kcal = 0.0;
        assert_eq!(e.unit_rate(), None);
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round2(1.236), 1.24);
        assert_eq!(round2(150.0 * 2.0), 300.0);
        assert_eq!(round4(1.0 / 3.0), 0.3333);
    }

    #[test]
    fn totals_split_by_status() {
        let mut a = entry(Some(0), 0);
        let mut b = entry(Some(1), 1);
        a.kcal = 100.0;
        b.kcal = 50.0;
        b.status = EntryStatus::Eaten;
        let t = totals(&[a, b]);
        assert_eq!(t.planned, 100.0);
        assert_eq!(t.eaten, 50.0);
        assert_eq!(t.total(), 150.0);
    }

    #[test]
    fn wire_round_trip_keeps_fields() {
        let e = entry(Some(3), 42);
        let op = Uuid::new_v4();
        let row = wire::row_json(&e, Some(op));
        assert_eq!(wire::row_op_id(&row), Some(op));
        assert_eq!(wire::row_id(&row), Some(e.id));
        let parsed = wire::parse_row(&row).unwrap();
        assert_eq!(parsed, e);
    }

    #[test]
    fn wire_parse_tolerates_string_numbers() {
        let row = serde_json::json!({
            "id": Uuid::new_v4().to_string(),
            "qty": "2.5",
            "kcal_snapshot": "375",
            "status": "eaten",
            "ordering": "1",
        });
        let e = wire::parse_row(&row).unwrap();
        assert_eq!(e.qty, 2.5);
        assert_eq!(e.kcal, 375.0);
        assert_eq!(e.status, EntryStatus::Eaten);
        assert_eq!(e.ordering, Some(1));
        assert_eq!(e.name, "");
    }

    #[test]
    fn wire_parse_rejects_missing_id() {
        assert!(wire::parse_row(&serde_json::json!({"name": "x"})).is_none());
    }

    #[test]
    fn wire_op_id_ignores_blank_and_garbage() {
        assert_eq!(wire::row_op_id(&serde_json::json!({"client_op_id": "  "})), None);
        assert_eq!(wire::row_op_id(&serde_json::json!({"client_op_id": "nope"})), None);
        assert_eq!(wire::row_op_id(&serde_json::json!({})), None);
    }
}
