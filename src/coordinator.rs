use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{
    generate_connection_id, ClientMessage, Outbound, ServerMessage, SyncDataPayload,
};
use crate::registry::{ConnectionHandle, ConnectionRegistry, OutboundSender};
use crate::store::{Conflict, SessionStatus, SyncStore};

/// Shared state handed to every connection task and the sweeper.
#[derive(Clone)]
pub struct SyncState {
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn SyncStore>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    connections: usize,
}

/// GET /health - liveness probe with the live-connection count
pub async fn health_check(State(state): State<SyncState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        connections: state.registry.len(),
    })
}

pub fn router(state: SyncState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// WebSocket upgrade handler
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<SyncState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one connector's WebSocket connection: a writer task drains the
/// outbound channel while this task processes inbound frames in arrival
/// order.
async fn handle_socket(socket: WebSocket, state: SyncState) {
    let connection_id = generate_connection_id();
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let writer_id = connection_id.clone();
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match serde_json::to_string(&out) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!("failed to encode outbound message: {}", err),
            }
        }
        debug!("writer task ended for connection {}", writer_id);
    });

    send(
        &tx,
        ServerMessage::ConnectionEstablished {
            connection_id: connection_id.clone(),
        },
    );
    debug!("connection established: {}", connection_id);

    while let Some(frame) = receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                debug!("socket error on connection {}: {}", connection_id, err);
                break;
            }
        };

        match msg {
            Message::Text(text) => dispatch(&text, &connection_id, &tx, &state).await,
            // Some connector runtimes ship JSON in binary frames.
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => dispatch(&text, &connection_id, &tx, &state).await,
                Err(_) => debug!(
                    "ignoring non-UTF8 binary frame from connection {}",
                    connection_id
                ),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // The sweeper may have won the race; whoever actually removes the entry
    // finalizes its session.
    if let Some(handle) = state.registry.remove(&connection_id) {
        if let Some(session_id) = handle.session_id {
            if let Err(err) = state
                .store
                .finalize_session(&session_id, SessionStatus::Completed)
                .await
            {
                warn!("failed to finalize session {}: {}", session_id, err);
            }
        }
    }
    debug!("connection closed: {}", connection_id);
}

fn send(tx: &OutboundSender, message: ServerMessage) {
    let _ = tx.send(Outbound::now(message));
}

/// Parse an inbound envelope and route it. Malformed input and unknown kinds
/// get exactly one `error` reply to the sender and touch nothing else.
pub async fn dispatch(raw: &str, connection_id: &str, tx: &OutboundSender, state: &SyncState) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            send(
                tx,
                ServerMessage::Error {
                    message: format!("invalid JSON: {}", err),
                },
            );
            return;
        }
    };

    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        send(
            tx,
            ServerMessage::Error {
                message: "message is missing a string \"type\" field".to_string(),
            },
        );
        return;
    };

    match kind.as_str() {
        "sync_start" | "sync_data" | "sync_conflict" | "heartbeat" => {
            match serde_json::from_value::<ClientMessage>(value) {
                Ok(message) => handle_message(message, connection_id, tx, state).await,
                Err(err) => send(
                    tx,
                    ServerMessage::Error {
                        message: format!("malformed {} message: {}", kind, err),
                    },
                ),
            }
        }
        other => {
            warn!(
                "unknown message kind {:?} from connection {}",
                other, connection_id
            );
            send(
                tx,
                ServerMessage::Error {
                    message: format!("unknown message kind: {}", other),
                },
            );
        }
    }
}

async fn handle_message(
    message: ClientMessage,
    connection_id: &str,
    tx: &OutboundSender,
    state: &SyncState,
) {
    match message {
        ClientMessage::SyncStart {
            tenant_id,
            connector_id,
        } => handle_sync_start(tenant_id, connector_id, connection_id, tx, state).await,
        ClientMessage::SyncData { tenant_id, data } => {
            handle_sync_data(tenant_id, data, connection_id, tx, state).await
        }
        ClientMessage::SyncConflict {
            tenant_id,
            table_name,
            record_id,
            source_data,
            target_data,
            conflict_type,
        } => {
            let conflict = Conflict::new(
                tenant_id,
                table_name,
                record_id,
                source_data,
                target_data,
                conflict_type,
            );
            handle_sync_conflict(conflict, connection_id, tx, state).await
        }
        ClientMessage::Heartbeat => {
            state.registry.touch(connection_id);
            send(tx, ServerMessage::HeartbeatAck);
        }
    }
}

async fn handle_sync_start(
    tenant_id: String,
    connector_id: Option<String>,
    connection_id: &str,
    tx: &OutboundSender,
    state: &SyncState,
) {
    // One open session per connection.
    if state.registry.session_of(connection_id).is_some() {
        send(
            tx,
            ServerMessage::SyncError {
                message: "a sync session is already active on this connection".to_string(),
            },
        );
        return;
    }

    let session = match state
        .store
        .create_session(&tenant_id, connector_id.as_deref(), connection_id)
        .await
    {
        Ok(session) => session,
        Err(err) => {
            error!(
                "failed to create session for tenant {} (connection {}): {}",
                tenant_id, connection_id, err
            );
            send(
                tx,
                ServerMessage::SyncError {
                    message: format!("failed to start sync session: {}", err),
                },
            );
            return;
        }
    };

    state.registry.admit(ConnectionHandle {
        connection_id: connection_id.to_string(),
        tenant_id: tenant_id.clone(),
        connector_id: connector_id.clone(),
        session_id: Some(session.id.clone()),
        tx: tx.clone(),
        last_heartbeat: Instant::now(),
    });

    send(
        tx,
        ServerMessage::SyncStarted {
            session_id: session.id.clone(),
        },
    );

    fan_out(
        state,
        &tenant_id,
        ServerMessage::SyncSessionStarted {
            session_id: session.id.clone(),
            tenant_id: tenant_id.clone(),
            connector_id,
        },
        Some(connection_id),
    )
    .await;

    info!(
        "sync session {} started for tenant {} (connection {})",
        session.id, tenant_id, connection_id
    );
}

async fn handle_sync_data(
    tenant_id: String,
    data: SyncDataPayload,
    connection_id: &str,
    tx: &OutboundSender,
    state: &SyncState,
) {
    let SyncDataPayload { table_name, record } = data;
    if table_name.trim().is_empty() {
        send(
            tx,
            ServerMessage::SyncError {
                message: "sync_data requires a table name".to_string(),
            },
        );
        return;
    }

    let stamped = match stamp_record(&tenant_id, record) {
        Ok(record) => record,
        Err(message) => {
            send(tx, ServerMessage::SyncError { message });
            return;
        }
    };

    let applied = match state
        .store
        .upsert_record(&tenant_id, &table_name, stamped)
        .await
    {
        Ok(applied) => applied,
        Err(err) => {
            error!(
                "failed to apply record to {} for tenant {}: {}",
                table_name, tenant_id, err
            );
            send(
                tx,
                ServerMessage::SyncError {
                    message: format!("failed to apply record: {}", err),
                },
            );
            return;
        }
    };

    // Session accounting is advisory; a failure here never aborts the apply.
    if let Some(session_id) = state.registry.session_of(connection_id) {
        match state.store.increment_processed(&session_id).await {
            Ok(count) => debug!("session {} processed {} records", session_id, count),
            Err(err) => warn!(
                "failed to update counter for session {}: {}",
                session_id, err
            ),
        }
    }

    send(
        tx,
        ServerMessage::DataProcessed {
            table_name: table_name.clone(),
            record: applied.clone(),
        },
    );

    fan_out(
        state,
        &tenant_id,
        ServerMessage::DataSynced {
            table_name,
            record: applied,
        },
        Some(connection_id),
    )
    .await;
}

async fn handle_sync_conflict(
    conflict: Conflict,
    connection_id: &str,
    tx: &OutboundSender,
    state: &SyncState,
) {
    if let Err(err) = state.store.record_conflict(&conflict).await {
        error!(
            "failed to record conflict on {} for tenant {}: {}",
            conflict.table_name, conflict.tenant_id, err
        );
        send(
            tx,
            ServerMessage::SyncError {
                message: format!("failed to record conflict: {}", err),
            },
        );
        return;
    }

    info!(
        "conflict {} recorded on {}/{} for tenant {}",
        conflict.id, conflict.table_name, conflict.record_id, conflict.tenant_id
    );

    // Conflicts are informational to the whole tenant, originator included.
    let tenant_id = conflict.tenant_id.clone();
    let conflict_id = conflict.id.clone();
    fan_out(
        state,
        &tenant_id,
        ServerMessage::ConflictDetected { conflict },
        None,
    )
    .await;

    send(tx, ServerMessage::ConflictStored { conflict_id });
}

/// Broadcast through the registry, then finalize the sessions of any
/// connections evicted because their channel was dead.
async fn fan_out(
    state: &SyncState,
    tenant_id: &str,
    message: ServerMessage,
    excluding: Option<&str>,
) -> usize {
    let delivery = state.registry.broadcast(tenant_id, message, excluding);
    for handle in delivery.evicted {
        if let Some(session_id) = handle.session_id {
            if let Err(err) = state
                .store
                .finalize_session(&session_id, SessionStatus::Failed)
                .await
            {
                warn!("failed to finalize session {}: {}", session_id, err);
            }
        }
    }
    delivery.delivered
}

/// Re-stamp an inbound record before persisting: the envelope's tenant
/// overrides whatever tenant the payload claims, a last-modified timestamp is
/// applied, and a record without a usable id gets a fresh one.
fn stamp_record(tenant_id: &str, record: Value) -> Result<Value, String> {
    let needs_id = crate::store::record_id_of(&record).is_none();
    let Value::Object(mut fields) = record else {
        return Err("sync_data record must be a JSON object".to_string());
    };
    if needs_id {
        fields.insert("id".to_string(), json!(Uuid::new_v4().to_string()));
    }
    fields.insert("tenantId".to_string(), json!(tenant_id));
    fields.insert("lastModified".to_string(), json!(Utc::now().to_rfc3339()));
    Ok(Value::Object(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError, SyncSession};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Delegates to a MemoryStore until poisoned, then fails every write.
    struct PoisonedStore {
        inner: MemoryStore,
        poisoned: AtomicBool,
    }

    impl PoisonedStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                poisoned: AtomicBool::new(false),
            }
        }

        fn poison(&self) {
            self.poisoned.store(true, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.poisoned.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("injected store failure".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SyncStore for PoisonedStore {
        async fn create_session(
            &self,
            tenant_id: &str,
            connector_id: Option<&str>,
            connection_id: &str,
        ) -> Result<SyncSession, StoreError> {
            self.check()?;
            self.inner
                .create_session(tenant_id, connector_id, connection_id)
                .await
        }

        async fn increment_processed(&self, session_id: &str) -> Result<u64, StoreError> {
            self.check()?;
            self.inner.increment_processed(session_id).await
        }

        async fn finalize_session(
            &self,
            session_id: &str,
            status: SessionStatus,
        ) -> Result<(), StoreError> {
            self.check()?;
            self.inner.finalize_session(session_id, status).await
        }

        async fn get_session(&self, session_id: &str) -> Result<Option<SyncSession>, StoreError> {
            self.inner.get_session(session_id).await
        }

        async fn upsert_record(
            &self,
            tenant_id: &str,
            table_name: &str,
            record: Value,
        ) -> Result<Value, StoreError> {
            self.check()?;
            self.inner.upsert_record(tenant_id, table_name, record).await
        }

        async fn record_conflict(&self, conflict: &Conflict) -> Result<(), StoreError> {
            self.check()?;
            self.inner.record_conflict(conflict).await
        }
    }

    fn state_with(store: Arc<dyn SyncStore>) -> SyncState {
        SyncState {
            registry: Arc::new(ConnectionRegistry::new()),
            store,
        }
    }

    fn connect() -> (String, OutboundSender, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (generate_connection_id(), tx, rx)
    }

    async fn start_session(
        state: &SyncState,
        connection_id: &str,
        tx: &OutboundSender,
        tenant: &str,
    ) {
        let raw = json!({"type": "sync_start", "tenantId": tenant}).to_string();
        dispatch(&raw, connection_id, tx, state).await;
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(out) = rx.try_recv() {
            messages.push(out.message);
        }
        messages
    }

    #[tokio::test]
    async fn sync_start_opens_session_and_announces_to_peers() {
        let store = Arc::new(MemoryStore::new());
        let state = state_with(store.clone());
        let (a, tx_a, mut rx_a) = connect();
        let (b, tx_b, mut rx_b) = connect();

        start_session(&state, &a, &tx_a, "acme").await;
        let replies = drain(&mut rx_a);
        assert!(matches!(replies.as_slice(), [ServerMessage::SyncStarted { .. }]));

        start_session(&state, &b, &tx_b, "acme").await;
        // B's start is announced to A, not echoed back to B.
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::SyncSessionStarted { .. }]
        ));
        assert!(matches!(
            drain(&mut rx_b).as_slice(),
            [ServerMessage::SyncStarted { .. }]
        ));
        assert_eq!(state.registry.len(), 2);
    }

    #[tokio::test]
    async fn second_sync_start_on_a_connection_is_refused() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let (a, tx_a, mut rx_a) = connect();

        start_session(&state, &a, &tx_a, "acme").await;
        drain(&mut rx_a);
        start_session(&state, &a, &tx_a, "acme").await;
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::SyncError { .. }]
        ));
        assert_eq!(state.registry.len(), 1);
    }

    #[tokio::test]
    async fn failed_session_create_replies_sync_error_and_admits_nothing() {
        let store = Arc::new(PoisonedStore::new());
        store.poison();
        let state = state_with(store);
        let (a, tx_a, mut rx_a) = connect();

        start_session(&state, &a, &tx_a, "acme").await;
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::SyncError { .. }]
        ));
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn sync_data_applies_replies_and_relays_within_the_tenant_only() {
        let store = Arc::new(MemoryStore::new());
        let state = state_with(store.clone());
        let (a, tx_a, mut rx_a) = connect();
        let (b, tx_b, mut rx_b) = connect();
        let (c, tx_c, mut rx_c) = connect();

        start_session(&state, &a, &tx_a, "acme").await;
        start_session(&state, &b, &tx_b, "acme").await;
        start_session(&state, &c, &tx_c, "globex").await;
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        let raw = json!({
            "type": "sync_data",
            "tenantId": "acme",
            "data": {
                "tableName": "contacts",
                "record": { "id": "c-1", "name": "Ada", "tenantId": "globex" },
            },
        })
        .to_string();
        dispatch(&raw, &a, &tx_a, &state).await;

        // Originator: exactly one data_processed carrying the stamped record.
        let replies = drain(&mut rx_a);
        match replies.as_slice() {
            [ServerMessage::DataProcessed { table_name, record }] => {
                assert_eq!(table_name, "contacts");
                // The payload's tenant claim is overridden with the sender's.
                assert_eq!(record["tenantId"], "acme");
                assert!(record["lastModified"].is_string());
            }
            other => panic!("unexpected replies: {:?}", other),
        }

        // Tenant peer: exactly one data_synced with the same record.
        let relayed = drain(&mut rx_b);
        match relayed.as_slice() {
            [ServerMessage::DataSynced { record, .. }] => {
                assert_eq!(record["id"], "c-1");
                assert_eq!(record["tenantId"], "acme");
            }
            other => panic!("unexpected relay: {:?}", other),
        }

        // Other tenant: nothing.
        assert!(drain(&mut rx_c).is_empty());

        // The record landed under the sender's tenant.
        assert!(store.record("acme", "contacts", "c-1").is_some());
        assert!(store.record("globex", "contacts", "c-1").is_none());
    }

    #[tokio::test]
    async fn session_counter_increments_per_applied_record() {
        let store = Arc::new(MemoryStore::new());
        let state = state_with(store.clone());
        let (a, tx_a, mut rx_a) = connect();
        start_session(&state, &a, &tx_a, "acme").await;
        drain(&mut rx_a);
        let session_id = state.registry.session_of(&a).expect("session open");

        let raw = json!({
            "type": "sync_data",
            "tenantId": "acme",
            "data": { "tableName": "contacts", "record": { "id": "c-1" } },
        })
        .to_string();
        dispatch(&raw, &a, &tx_a, &state).await;

        let session = store.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.records_processed, 1);
    }

    #[tokio::test]
    async fn store_failure_on_sync_data_replies_sync_error_and_skips_broadcast() {
        let store = Arc::new(PoisonedStore::new());
        let state = state_with(store.clone());
        let (a, tx_a, mut rx_a) = connect();
        let (b, tx_b, mut rx_b) = connect();
        start_session(&state, &a, &tx_a, "acme").await;
        start_session(&state, &b, &tx_b, "acme").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        store.poison();
        let raw = json!({
            "type": "sync_data",
            "tenantId": "acme",
            "data": { "tableName": "contacts", "record": { "id": "c-1" } },
        })
        .to_string();
        dispatch(&raw, &a, &tx_a, &state).await;

        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::SyncError { .. }]
        ));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn conflict_is_stored_once_and_fanned_out_to_the_whole_tenant() {
        let store = Arc::new(MemoryStore::new());
        let state = state_with(store.clone());
        let (a, tx_a, mut rx_a) = connect();
        let (b, tx_b, mut rx_b) = connect();
        start_session(&state, &a, &tx_a, "acme").await;
        start_session(&state, &b, &tx_b, "acme").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let raw = json!({
            "type": "sync_conflict",
            "tenantId": "acme",
            "tableName": "contacts",
            "recordId": "c-1",
            "sourceData": { "name": "ours" },
            "targetData": { "name": "theirs" },
            "conflictType": "update_conflict",
        })
        .to_string();
        dispatch(&raw, &a, &tx_a, &state).await;

        assert_eq!(store.conflict_count(), 1);

        // Originator sees the tenant-wide event first, then the ack.
        let replies = drain(&mut rx_a);
        match replies.as_slice() {
            [ServerMessage::ConflictDetected { conflict }, ServerMessage::ConflictStored { conflict_id }] =>
            {
                assert_eq!(&conflict.id, conflict_id);
                assert_eq!(conflict.record_id, "c-1");
            }
            other => panic!("unexpected replies: {:?}", other),
        }
        assert!(matches!(
            drain(&mut rx_b).as_slice(),
            [ServerMessage::ConflictDetected { .. }]
        ));
    }

    #[tokio::test]
    async fn malformed_input_gets_exactly_one_error_reply() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let (a, tx_a, mut rx_a) = connect();

        dispatch("not json at all", &a, &tx_a, &state).await;
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::Error { .. }]
        ));

        dispatch(&json!({"no": "type"}).to_string(), &a, &tx_a, &state).await;
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::Error { .. }]
        ));

        dispatch(
            &json!({"type": "upload_cat_picture"}).to_string(),
            &a,
            &tx_a,
            &state,
        )
        .await;
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::Error { .. }]
        ));

        // Known kind, missing fields: still a single error reply.
        dispatch(&json!({"type": "sync_data"}).to_string(), &a, &tx_a, &state).await;
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::Error { .. }]
        ));

        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_is_acked_even_before_registration() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let (a, tx_a, mut rx_a) = connect();
        dispatch(&json!({"type": "heartbeat"}).to_string(), &a, &tx_a, &state).await;
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::HeartbeatAck]
        ));
    }

    #[test]
    fn stamp_record_overrides_tenant_and_fills_missing_id() {
        let stamped = stamp_record("acme", json!({"tenantId": "globex", "name": "Ada"}))
            .expect("object records stamp");
        assert_eq!(stamped["tenantId"], "acme");
        assert!(stamped["id"].is_string());
        assert!(stamped["lastModified"].is_string());

        let stamped = stamp_record("acme", json!({"id": 7})).expect("numeric ids kept");
        assert_eq!(stamped["id"], 7);

        assert!(stamp_record("acme", json!(["not", "an", "object"])).is_err());
    }
}
