//! Blob storage for task payloads too large for the queue transport.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::BoxFuture;

/// Opaque primary key of an overflow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A spilled payload.
#[derive(Debug, Clone)]
pub struct OverflowRecord {
    pub id: RecordId,
    pub data: Bytes,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("overflow record {0} not found")]
    NotFound(RecordId),

    #[error("overflow store failure: {0}")]
    Backend(String),
}

/// Create/read/delete-by-id access to overflow records.
pub trait OverflowStore: Send + Sync {
    /// Persists `data` and returns the new record's id.
    fn store(&self, data: Bytes) -> BoxFuture<'_, Result<RecordId, StoreError>>;

    /// Fetches a record, failing with [`StoreError::NotFound`] for unknown ids.
    fn load(&self, id: RecordId) -> BoxFuture<'_, Result<OverflowRecord, StoreError>>;

    /// Deletes a record. Deleting an id that no longer exists succeeds.
    fn delete(&self, id: RecordId) -> BoxFuture<'_, Result<(), StoreError>>;
}

/// [`OverflowStore`] kept in process memory.
#[derive(Default)]
pub struct MemoryOverflowStore {
    records: Mutex<HashMap<RecordId, OverflowRecord>>,
}

impl MemoryOverflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<RecordId, OverflowRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.records().contains_key(&id)
    }
}

impl OverflowStore for MemoryOverflowStore {
    fn store(&self, data: Bytes) -> BoxFuture<'_, Result<RecordId, StoreError>> {
        Box::pin(async move {
            let record = OverflowRecord {
                id: RecordId::new(),
                data,
                created_at: Utc::now(),
            };
            let id = record.id;
            self.records().insert(id, record);
            Ok(id)
        })
    }

    fn load(&self, id: RecordId) -> BoxFuture<'_, Result<OverflowRecord, StoreError>> {
        Box::pin(async move {
            self.records()
                .get(&id)
                .cloned()
                .ok_or(StoreError::NotFound(id))
        })
    }

    fn delete(&self, id: RecordId) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            self.records().remove(&id);
            Ok(())
        })
    }
}
