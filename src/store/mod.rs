//! Document storage for circulation records.
//!
//! Records live in named collections of JSON documents. Every stored
//! document carries a version that starts at 1 and is bumped on each
//! update; updates are conditioned on the version the caller read, which
//! is how concurrent writers to the same book counters are detected.
//!
//! Two backends are provided:
//! - [`MemoryStore`] for tests and ephemeral daemons
//! - [`FileStore`] keeping one JSON file per document under a data directory
//!
//! [`Collection`] is the typed view used by the circulation components. It
//! bounds every call with a timeout and turns malformed documents into
//! [`StoreError::Malformed`] instead of defaulting missing fields.

pub mod file;
pub mod memory;

#[cfg(test)]
pub(crate) mod testing;

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Errors returned by document stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Write conflict on {collection}/{id}")]
    Conflict { collection: String, id: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed {collection} document {id}: {source}")]
    Malformed {
        collection: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid document id: {0:?}")]
    InvalidId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn conflict(collection: &str, id: &str) -> Self {
        Self::Conflict {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A document together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub version: u64,
    pub document: T,
}

/// Raw JSON document store.
///
/// `create` fails with [`StoreError::Conflict`] when the id is taken and
/// `update` fails with it when `expected_version` is stale.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Stored<Value>>;

    /// Documents whose top-level `field` equals `value`.
    async fn query(&self, collection: &str, field: &str, value: &Value)
        -> Result<Vec<Stored<Value>>>;

    async fn list(&self, collection: &str) -> Result<Vec<Stored<Value>>>;

    async fn create(&self, collection: &str, id: &str, document: Value) -> Result<u64>;

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        document: Value,
    ) -> Result<u64>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;
}

/// A record type persisted in its own collection.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    /// Collection name.
    const COLLECTION: &'static str;

    fn document_id(&self) -> &str;
}

/// Typed, timeout-bounded access to one collection.
pub struct Collection<T> {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            timeout: self.timeout,
            _record: PhantomData,
        }
    }
}

impl<T: Document> Collection<T> {
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            _record: PhantomData,
        }
    }

    pub async fn get(&self, id: &str) -> Result<Stored<T>> {
        let raw = self.bounded(self.store.get(T::COLLECTION, id)).await?;
        decode(id, raw)
    }

    /// Like [`get`](Self::get) but maps a missing document to `None`.
    pub async fn find(&self, id: &str) -> Result<Option<Stored<T>>> {
        match self.get(id).await {
            Ok(stored) => Ok(Some(stored)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn query(&self, field: &str, value: impl Into<Value>) -> Result<Vec<Stored<T>>> {
        let value = value.into();
        let raw = self
            .bounded(self.store.query(T::COLLECTION, field, &value))
            .await?;
        decode_all(raw)
    }

    pub async fn list(&self) -> Result<Vec<Stored<T>>> {
        let raw = self.bounded(self.store.list(T::COLLECTION)).await?;
        decode_all(raw)
    }

    /// Insert a new document, returning its initial version.
    pub async fn create(&self, document: &T) -> Result<u64> {
        let id = document.document_id();
        let value = encode(id, document)?;
        self.bounded(self.store.create(T::COLLECTION, id, value)).await
    }

    /// Replace a document if it is still at `expected_version`.
    pub async fn update(&self, document: &T, expected_version: u64) -> Result<u64> {
        let id = document.document_id();
        let value = encode(id, document)?;
        self.bounded(self.store.update(T::COLLECTION, id, expected_version, value))
            .await
    }

    async fn bounded<R>(&self, call: impl Future<Output = Result<R>>) -> Result<R> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "{} call timed out after {}ms",
                T::COLLECTION,
                self.timeout.as_millis()
            ))),
        }
    }
}

fn encode<T: Document>(id: &str, document: &T) -> Result<Value> {
    serde_json::to_value(document).map_err(|source| StoreError::Malformed {
        collection: T::COLLECTION.to_string(),
        id: id.to_string(),
        source,
    })
}

fn decode<T: Document>(id: &str, raw: Stored<Value>) -> Result<Stored<T>> {
    let document = serde_json::from_value(raw.document).map_err(|source| StoreError::Malformed {
        collection: T::COLLECTION.to_string(),
        id: id.to_string(),
        source,
    })?;
    Ok(Stored {
        version: raw.version,
        document,
    })
}

fn decode_all<T: Document>(raw: Vec<Stored<Value>>) -> Result<Vec<Stored<T>>> {
    raw.into_iter()
        .map(|stored| {
            let id = stored
                .document
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string();
            decode(&id, stored)
        })
        .collect()
}
