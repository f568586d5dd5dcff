use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::Conflict;

/// Payload of a `sync_data` message: the target collection and one record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDataPayload {
    pub table_name: String,
    pub record: Value,
}

/// Messages sent from a connector to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a sync session and register the connection under a tenant
    #[serde(rename_all = "camelCase")]
    SyncStart {
        tenant_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connector_id: Option<String>,
    },
    /// Apply one record to shared storage and relay it to tenant peers
    #[serde(rename_all = "camelCase")]
    SyncData {
        tenant_id: String,
        data: SyncDataPayload,
    },
    /// Report a divergent write between source and target
    #[serde(rename_all = "camelCase")]
    SyncConflict {
        tenant_id: String,
        table_name: String,
        record_id: String,
        source_data: Value,
        target_data: Value,
        conflict_type: String,
    },
    /// Liveness signal; refreshes the connection's heartbeat timestamp
    Heartbeat,
}

/// Messages sent from the coordinator to connectors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once when the socket is accepted
    #[serde(rename_all = "camelCase")]
    ConnectionEstablished { connection_id: String },
    /// Reply to a successful `sync_start`
    #[serde(rename_all = "camelCase")]
    SyncStarted { session_id: String },
    /// Broadcast to tenant peers when one of them opens a session
    #[serde(rename_all = "camelCase")]
    SyncSessionStarted {
        session_id: String,
        tenant_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connector_id: Option<String>,
    },
    /// Reply to `sync_data`: the record as applied, tenant- and time-stamped
    #[serde(rename_all = "camelCase")]
    DataProcessed { table_name: String, record: Value },
    /// Broadcast to tenant peers (excluding the sender) after a record applies
    #[serde(rename_all = "camelCase")]
    DataSynced { table_name: String, record: Value },
    /// Reply to `sync_conflict` with the persisted conflict's id
    #[serde(rename_all = "camelCase")]
    ConflictStored { conflict_id: String },
    /// Broadcast to every connection of the tenant, the originator included
    ConflictDetected { conflict: Conflict },
    /// Reply to `heartbeat`
    HeartbeatAck,
    /// Session or persistence failure, reported to the originator only
    SyncError { message: String },
    /// Malformed or unrecognized envelope
    Error { message: String },
}

/// Envelope written to the socket; every outbound message carries a timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct Outbound {
    #[serde(flatten)]
    pub message: ServerMessage,
    pub timestamp: DateTime<Utc>,
}

impl Outbound {
    pub fn now(message: ServerMessage) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
        }
    }
}

/// Generate a unique connection ID
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}
