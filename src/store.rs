use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("record has no usable id")]
    MissingRecordId,
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Realtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

/// Durable record of one synchronization run tied to a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    pub id: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<String>,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub connection_id: String,
    pub records_processed: u64,
    pub started_at: DateTime<Utc>,
}

impl SyncSession {
    pub fn new(tenant_id: &str, connector_id: Option<&str>, connection_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            connector_id: connector_id.map(str::to_string),
            kind: SessionKind::Realtime,
            status: SessionStatus::Active,
            connection_id: connection_id.to_string(),
            records_processed: 0,
            started_at: Utc::now(),
        }
    }
}

/// A detected divergence between a source-side and target-side version of a
/// record. Never mutated after creation; resolved out of band.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub tenant_id: String,
    pub table_name: String,
    pub record_id: String,
    pub source_data: Value,
    pub target_data: Value,
    pub conflict_type: String,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn new(
        tenant_id: String,
        table_name: String,
        record_id: String,
        source_data: Value,
        target_data: Value,
        conflict_type: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            table_name,
            record_id,
            source_data,
            target_data,
            conflict_type,
            detected_at: Utc::now(),
        }
    }
}

/// Durable storage consumed by the coordinator. Sessions and conflicts are
/// rows of record; tenant records are last-writer-wins upserts.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn create_session(
        &self,
        tenant_id: &str,
        connector_id: Option<&str>,
        connection_id: &str,
    ) -> Result<SyncSession, StoreError>;

    /// Best-effort session accounting; callers log failures and move on.
    async fn increment_processed(&self, session_id: &str) -> Result<u64, StoreError>;

    async fn finalize_session(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SyncSession>, StoreError>;

    /// Upsert keyed by (tenant, table, record id); returns the stored record.
    async fn upsert_record(
        &self,
        tenant_id: &str,
        table_name: &str,
        record: Value,
    ) -> Result<Value, StoreError>;

    async fn record_conflict(&self, conflict: &Conflict) -> Result<(), StoreError>;
}

fn session_key(session_id: &str) -> String {
    format!("sync:session:{}", session_id)
}

fn conflict_key(conflict_id: &str) -> String {
    format!("sync:conflict:{}", conflict_id)
}

fn record_key(tenant_id: &str, table_name: &str, record_id: &str) -> String {
    format!("sync:record:{}:{}:{}", tenant_id, table_name, record_id)
}

pub(crate) fn record_id_of(record: &Value) -> Option<String> {
    match record.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Redis-backed store. Session and conflict keys are written without a TTL:
/// they are the durable rows, archived or resolved out of band.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SyncSession>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(session_key(session_id)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_session(&self, session: &SyncSession) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(session)?;
        conn.set::<_, _, ()>(session_key(&session.id), value)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SyncStore for RedisStore {
    async fn create_session(
        &self,
        tenant_id: &str,
        connector_id: Option<&str>,
        connection_id: &str,
    ) -> Result<SyncSession, StoreError> {
        let session = SyncSession::new(tenant_id, connector_id, connection_id);
        self.save_session(&session).await?;
        Ok(session)
    }

    async fn increment_processed(&self, session_id: &str) -> Result<u64, StoreError> {
        let mut session = self.load_session(session_id).await?.ok_or_else(|| {
            StoreError::Unavailable(format!("session {} not found", session_id))
        })?;
        session.records_processed += 1;
        self.save_session(&session).await?;
        Ok(session.records_processed)
    }

    async fn finalize_session(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        // Missing row: the session was never durably created; nothing to do.
        let Some(mut session) = self.load_session(session_id).await? else {
            return Ok(());
        };
        session.status = status;
        self.save_session(&session).await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SyncSession>, StoreError> {
        self.load_session(session_id).await
    }

    async fn upsert_record(
        &self,
        tenant_id: &str,
        table_name: &str,
        record: Value,
    ) -> Result<Value, StoreError> {
        let record_id = record_id_of(&record).ok_or(StoreError::MissingRecordId)?;
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(&record)?;
        conn.set::<_, _, ()>(record_key(tenant_id, table_name, &record_id), value)
            .await?;
        Ok(record)
    }

    async fn record_conflict(&self, conflict: &Conflict) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(conflict)?;
        conn.set::<_, _, ()>(conflict_key(&conflict.id), value)
            .await?;
        Ok(())
    }
}

/// Simple in-memory store for tests and for exercising the coordinator
/// without a Redis instance.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, SyncSession>>,
    records: RwLock<HashMap<String, Value>>,
    conflicts: RwLock<HashMap<String, Conflict>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tenant_id: &str, table_name: &str, record_id: &str) -> Option<Value> {
        self.records
            .read()
            .get(&record_key(tenant_id, table_name, record_id))
            .cloned()
    }

    pub fn conflict_count(&self) -> usize {
        self.conflicts.read().len()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn create_session(
        &self,
        tenant_id: &str,
        connector_id: Option<&str>,
        connection_id: &str,
    ) -> Result<SyncSession, StoreError> {
        let session = SyncSession::new(tenant_id, connector_id, connection_id);
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn increment_processed(&self, session_id: &str) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(session_id).ok_or_else(|| {
            StoreError::Unavailable(format!("session {} not found", session_id))
        })?;
        session.records_processed += 1;
        Ok(session.records_processed)
    }

    async fn finalize_session(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        if let Some(session) = self.sessions.write().get_mut(session_id) {
            session.status = status;
        }
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SyncSession>, StoreError> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn upsert_record(
        &self,
        tenant_id: &str,
        table_name: &str,
        record: Value,
    ) -> Result<Value, StoreError> {
        let record_id = record_id_of(&record).ok_or(StoreError::MissingRecordId)?;
        self.records
            .write()
            .insert(record_key(tenant_id, table_name, &record_id), record.clone());
        Ok(record)
    }

    async fn record_conflict(&self, conflict: &Conflict) -> Result<(), StoreError> {
        self.conflicts
            .write()
            .insert(conflict.id.clone(), conflict.clone());
        Ok(())
    }
}
