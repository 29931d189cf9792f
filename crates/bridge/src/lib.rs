//! Subscription bridge: owns the push channel for a feed scope, shields
//! payload parsing, and routes validated notices into the correlator.
//!
//! The bridge never mutates the replica itself and never blocks a
//! mutation path; a dropped or malformed notification degrades to
//! "miss one update until the next refresh", nothing worse.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use chow_core::{ChangeKind, ChangeNotice, FeedScope, wire};
use chow_registry::{PendingOps, WritePulse};
use chow_store::Correlator;
use futures::StreamExt;
use metrics::counter;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Aborts the owned task when cancelled or dropped.
pub struct CancelHandle {
    task: Option<JoinHandle<()>>,
}

impl CancelHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// One live push subscription: raw payloads plus a way to tear it down.
pub struct Subscription {
    pub rx: mpsc::Receiver<Value>,
    pub cancel: CancelHandle,
}

/// Source of push notifications for a scope. Implementations wrap
/// whatever the deployment uses; tests wrap a broadcast channel.
#[async_trait::async_trait]
pub trait PushTransport: Send + Sync {
    async fn subscribe(&self, scope: FeedScope) -> Result<Subscription>;
}

/// Transport over a local broadcast channel, used by tests and the demo
/// binary against the in-memory authority.
pub struct BroadcastTransport {
    tx: tokio::sync::broadcast::Sender<Value>,
}

impl BroadcastTransport {
    pub fn new(tx: tokio::sync::broadcast::Sender<Value>) -> Self {
        Self { tx }
    }
}

#[async_trait::async_trait]
impl PushTransport for BroadcastTransport {
    async fn subscribe(&self, scope: FeedScope) -> Result<Subscription> {
        let mut raw = self.tx.subscribe();
        let cap = std::env::var("CHOW_QUEUE_CAP")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(256);
        let (tx, rx) = mpsc::channel(cap);
        info!(day = %scope.day, "push subscription start");
        let task = tokio::spawn(async move {
            loop {
                match raw.recv().await {
                    Ok(v) => {
                        if tx.send(v).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "push subscription lagged");
                        counter!("bridge_lagged_total", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription { rx, cancel: CancelHandle::new(task) })
    }
}

/// One-shot transport over any payload stream; each subscribe consumes
/// the stream, so it only supports a single subscription.
pub struct StreamTransport {
    stream: std::sync::Mutex<Option<futures::stream::BoxStream<'static, Value>>>,
}

impl StreamTransport {
    pub fn new(stream: impl futures::Stream<Item = Value> + Send + 'static) -> Self {
        Self { stream: std::sync::Mutex::new(Some(stream.boxed())) }
    }
}

#[async_trait::async_trait]
impl PushTransport for StreamTransport {
    async fn subscribe(&self, _scope: FeedScope) -> Result<Subscription> {
        let mut stream = self
            .stream
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("stream already consumed"))?;
        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(async move {
            while let Some(v) = stream.next().await {
                if tx.send(v).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription { rx, cancel: CancelHandle::new(task) })
    }
}

/// Parse gate for raw payloads. Anything that does not look like a
/// change notification is dropped here with a debug log; nothing past
/// this point deals with malformed input.
pub fn validate_payload(payload: &Value) -> Option<ChangeNotice> {
    let kind = match payload.get("event").and_then(|v| v.as_str()) {
        Some(s) if s.eq_ignore_ascii_case("insert") => ChangeKind::Insert,
        Some(s) if s.eq_ignore_ascii_case("update") => ChangeKind::Update,
        Some(s) if s.eq_ignore_ascii_case("delete") => ChangeKind::Delete,
        other => {
            debug!(event = ?other, "payload dropped: unknown event");
            return None;
        }
    };
    let new = payload.get("new").filter(|v| !v.is_null());
    let old = payload.get("old").filter(|v| !v.is_null());
    if new.is_some_and(|v| !v.is_object()) || old.is_some_and(|v| !v.is_object()) {
        debug!("payload dropped: row images not objects");
        return None;
    }

    let entry = new.and_then(wire::parse_row);
    let old_id = old.and_then(wire::row_id);
    let client_op_id = new.and_then(wire::row_op_id).or_else(|| old.and_then(wire::row_op_id));

    match kind {
        ChangeKind::Insert | ChangeKind::Update if entry.is_none() => {
            debug!("payload dropped: no usable new row");
            None
        }
        ChangeKind::Delete if old_id.is_none() && entry.is_none() => {
            debug!("payload dropped: delete without a key");
            None
        }
        _ => Some(ChangeNotice { kind, entry, old_id, client_op_id }),
    }
}

/// Connection lifecycle, published over a watch channel for UI badges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Connecting,
    Live,
    Error,
}

/// Why a consumer asked for the subscription to be torn down and
/// re-established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResubscribeReason {
    /// Credentials rotated; the old channel may silently stop
    /// delivering.
    CredentialRefreshed,
    /// The app came back to the foreground after a suspension.
    ForegroundRegained,
}

pub struct BridgeHandle {
    pub state: watch::Receiver<BridgeState>,
    pub control: mpsc::Sender<ResubscribeReason>,
    pub cancel: CancelHandle,
}

/// Run the fine-grained bridge: every payload is validated and handed
/// to the correlator. On resubscribe a refresh is requested, because
/// notifications sent while the channel was down are gone for good.
pub fn spawn_bridge(
    transport: Arc<dyn PushTransport>,
    scope: FeedScope,
    correlator: Arc<Correlator>,
    refresh_tx: mpsc::Sender<()>,
) -> BridgeHandle {
    let (state_tx, state_rx) = watch::channel(BridgeState::Idle);
    let (control_tx, mut control_rx) = mpsc::channel::<ResubscribeReason>(8);

    let task = tokio::spawn(async move {
        'outer: loop {
            let _ = state_tx.send(BridgeState::Connecting);
            let mut sub = match transport.subscribe(scope).await {
                Ok(sub) => sub,
                Err(err) => {
                    warn!(%err, "subscribe failed");
                    let _ = state_tx.send(BridgeState::Error);
                    // Stay down until a consumer nudges us.
                    match control_rx.recv().await {
                        Some(reason) => {
                            info!(?reason, "retrying subscription");
                            continue 'outer;
                        }
                        None => break 'outer,
                    }
                }
            };
            let _ = state_tx.send(BridgeState::Live);
            info!(day = %scope.day, "bridge live");

            loop {
                tokio::select! {
                    msg = sub.rx.recv() => match msg {
                        Some(payload) => {
                            counter!("bridge_payloads_total", 1u64);
                            if let Some(notice) = validate_payload(&payload) {
                                correlator.observe(notice);
                            } else {
                                counter!("bridge_dropped_total", 1u64);
                            }
                        }
                        None => {
                            warn!("push channel ended, reconnecting");
                            let _ = state_tx.send(BridgeState::Error);
                            continue 'outer;
                        }
                    },
                    reason = control_rx.recv() => match reason {
                        Some(reason) => {
                            info!(?reason, "resubscribing");
                            sub.cancel.cancel();
                            // The gap between channels can swallow
                            // notifications; reconcile via a full read.
                            let _ = refresh_tx.try_send(());
                            continue 'outer;
                        }
                        None => break 'outer,
                    },
                }
            }
        }
        let _ = state_tx.send(BridgeState::Idle);
    });

    BridgeHandle { state: state_rx, control: control_tx, cancel: CancelHandle::new(task) }
}

const COARSE_DEBOUNCE: Duration = Duration::from_millis(250);

/// Coarse bridge for collections whose writes cannot carry an op id end
/// to end. Echo detection falls back to the suppression window, and the
/// reaction to a foreign change is a debounced refresh request rather
/// than a merge.
pub fn spawn_coarse_bridge(
    transport: Arc<dyn PushTransport>,
    scope: FeedScope,
    registry: Arc<PendingOps>,
    pulse: Arc<WritePulse>,
    window: Duration,
    refresh_tx: mpsc::Sender<()>,
) -> BridgeHandle {
    let (state_tx, state_rx) = watch::channel(BridgeState::Idle);
    let (control_tx, mut control_rx) = mpsc::channel::<ResubscribeReason>(8);

    let task = tokio::spawn(async move {
        let mut debounce: Option<JoinHandle<()>> = None;
        'outer: loop {
            let _ = state_tx.send(BridgeState::Connecting);
            let mut sub = match transport.subscribe(scope).await {
                Ok(sub) => sub,
                Err(err) => {
                    warn!(%err, "coarse subscribe failed");
                    let _ = state_tx.send(BridgeState::Error);
                    match control_rx.recv().await {
                        Some(_) => continue 'outer,
                        None => break 'outer,
                    }
                }
            };
            let _ = state_tx.send(BridgeState::Live);

            loop {
                tokio::select! {
                    msg = sub.rx.recv() => match msg {
                        Some(payload) => {
                            let Some(notice) = validate_payload(&payload) else { continue };
                            if let Some(op) = notice.client_op_id {
                                if registry.has_op(op) {
                                    registry.ack(op);
                                    continue;
                                }
                            }
                            if notice.kind == ChangeKind::Delete {
                                let target = notice.old_id
                                    .or_else(|| notice.entry.as_ref().map(|e| e.id));
                                if let Some(id) = target {
                                    if registry.ack_by_entry(id) {
                                        continue;
                                    }
                                }
                            }
                            if pulse.should_ignore(window) {
                                debug!("coarse payload inside write window, dropped");
                                continue;
                            }
                            // Bursty foreign writes collapse into one
                            // refresh.
                            if let Some(h) = debounce.take() {
                                h.abort();
                            }
                            let tx = refresh_tx.clone();
                            debounce = Some(tokio::spawn(async move {
                                sleep(COARSE_DEBOUNCE).await;
                                let _ = tx.try_send(());
                            }));
                        }
                        None => {
                            let _ = state_tx.send(BridgeState::Error);
                            continue 'outer;
                        }
                    },
                    reason = control_rx.recv() => match reason {
                        Some(reason) => {
                            info!(?reason, "coarse resubscribing");
                            sub.cancel.cancel();
                            let _ = refresh_tx.try_send(());
                            continue 'outer;
                        }
                        None => break 'outer,
                    },
                }
            }
        }
        if let Some(h) = debounce.take() {
            h.abort();
        }
        let _ = state_tx.send(BridgeState::Idle);
    });

    BridgeHandle { state: state_rx, control: control_tx, cancel: CancelHandle::new(task) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chow_authority::{EntryAuthority, MemoryAuthority};
    use chow_core::{Entry, EntryStatus, OpKind};
    use chow_registry::PendingOp;
    use chow_store::Replica;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn entry(name: &str) -> Entry {
        Entry {
            id: Uuid::new_v4(),
            name: name.into(),
            unit: "g".into(),
            qty: 100.0,
            kcal: 130.0,
            kcal_per_unit: None,
            status: EntryStatus::Planned,
            created_at: Utc::now(),
            ordering: None,
        }
    }

    #[test]
    fn validate_accepts_wire_shapes() {
        let id = Uuid::new_v4();
        let op = Uuid::new_v4();
        let payload = json!({
            "event": "UPDATE",
            "new": {
                "id": id.to_string(),
                "name": "rice",
                "unit": "g",
                "qty": 200,
                "kcal_snapshot": 260.0,
                "status": "planned",
                "client_op_id": op.to_string(),
            },
            "old": null,
        });
        let notice = validate_payload(&payload).unwrap();
        assert_eq!(notice.kind, ChangeKind::Update);
        assert_eq!(notice.entry.as_ref().map(|e| e.id), Some(id));
        assert_eq!(notice.client_op_id, Some(op));

        let del = json!({ "event": "delete", "new": null, "old": { "id": id.to_string() } });
        let notice = validate_payload(&del).unwrap();
        assert_eq!(notice.kind, ChangeKind::Delete);
        assert_eq!(notice.old_id, Some(id));
        assert_eq!(notice.client_op_id, None);
    }

    #[test]
    fn validate_drops_malformed() {
        assert!(validate_payload(&json!({ "event": "TRUNCATE", "new": null })).is_none());
        assert!(validate_payload(&json!({ "new": {} })).is_none());
        assert!(validate_payload(&json!({ "event": "INSERT", "new": "oops" })).is_none());
        assert!(validate_payload(&json!({ "event": "INSERT", "new": null })).is_none());
        assert!(validate_payload(&json!({ "event": "DELETE", "old": null })).is_none());
        // Row without a parseable id is unusable.
        assert!(validate_payload(&json!({ "event": "INSERT", "new": { "name": "x" } })).is_none());
    }

    #[tokio::test]
    async fn bridge_routes_authority_pushes_into_replica() {
        let auth = Arc::new(MemoryAuthority::new());
        let scope = FeedScope { day: Uuid::new_v4() };
        let registry = Arc::new(PendingOps::default());
        let replica = Arc::new(Replica::new());
        let correlator = Arc::new(Correlator::new(registry.clone(), replica.clone()));
        let transport = Arc::new(BroadcastTransport::new(auth.push_sender()));
        let (refresh_tx, _refresh_rx) = mpsc::channel(4);

        let mut handle = spawn_bridge(transport, scope, correlator, refresh_tx);
        handle
            .state
            .wait_for(|s| *s == BridgeState::Live)
            .await
            .unwrap();

        // Foreign insert arrives via push and lands in the replica.
        let e = entry("soup");
        let mut epochs = replica.subscribe();
        auth.insert_entry(scope, e.clone(), Uuid::new_v4()).await.unwrap();
        epochs.changed().await.unwrap();
        assert_eq!(replica.get(e.id).unwrap().name, "soup");

        // Our own echo is suppressed: register the op first, then write.
        let op = Uuid::new_v4();
        replica.apply_qty(e.id, 250.0);
        registry.register(PendingOp::new(op, OpKind::UpdateQty, [e.id]));
        auth.update_qty(e.id, 250.0, op).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!registry.has_op(op), "echo acked the op");
        assert_eq!(replica.get(e.id).unwrap().qty, 250.0);

        handle.cancel.cancel();
    }

    #[tokio::test]
    async fn resubscribe_requests_refresh() {
        let (tx, _rx) = tokio::sync::broadcast::channel(8);
        let transport = Arc::new(BroadcastTransport::new(tx));
        let scope = FeedScope { day: Uuid::new_v4() };
        let registry = Arc::new(PendingOps::default());
        let replica = Arc::new(Replica::new());
        let correlator = Arc::new(Correlator::new(registry, replica));
        let (refresh_tx, mut refresh_rx) = mpsc::channel(4);

        let mut handle = spawn_bridge(transport, scope, correlator, refresh_tx);
        handle.state.wait_for(|s| *s == BridgeState::Live).await.unwrap();
        handle.control.send(ResubscribeReason::CredentialRefreshed).await.unwrap();
        refresh_rx.recv().await.unwrap();
        handle.state.wait_for(|s| *s == BridgeState::Live).await.unwrap();
        handle.cancel.cancel();
    }

    #[tokio::test]
    async fn coarse_bridge_suppresses_inside_window() {
        let (raw_tx, _raw_rx) = tokio::sync::broadcast::channel(8);
        let transport = Arc::new(BroadcastTransport::new(raw_tx.clone()));
        let scope = FeedScope { day: Uuid::new_v4() };
        let registry = Arc::new(PendingOps::default());
        let pulse = Arc::new(WritePulse::new());
        let (refresh_tx, mut refresh_rx) = mpsc::channel(4);

        let mut handle = spawn_coarse_bridge(
            transport,
            scope,
            registry,
            pulse.clone(),
            Duration::from_millis(400),
            refresh_tx,
        );
        handle.state.wait_for(|s| *s == BridgeState::Live).await.unwrap();

        // A payload right after a local write is treated as our echo.
        pulse.mark();
        let e = entry("rice");
        raw_tx
            .send(json!({ "event": "INSERT", "new": wire::row_json(&e, None), "old": null }))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(refresh_rx.try_recv().is_err(), "no refresh inside the window");

        // Outside the window, a foreign payload triggers a debounced
        // refresh.
        tokio::time::sleep(Duration::from_millis(100)).await;
        raw_tx
            .send(json!({ "event": "INSERT", "new": wire::row_json(&e, None), "old": null }))
            .unwrap();
        tokio::time::timeout(Duration::from_millis(500), refresh_rx.recv())
            .await
            .expect("refresh within debounce horizon")
            .unwrap();

        handle.cancel.cancel();
    }
}
