//! Fault-injecting store for exercising retry and compensation paths.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{DocumentStore, MemoryStore, Result, StoreError, Stored};

#[derive(Debug, Default)]
struct Faults {
    latency: Duration,
    /// Remaining failing creates per collection.
    creates: HashMap<String, usize>,
    /// Remaining unavailable updates per collection.
    updates: HashMap<String, usize>,
    /// Remaining conflicting updates per collection.
    conflicts: HashMap<String, usize>,
    /// Remaining updates that land but report unavailable.
    lost_acks: HashMap<String, usize>,
    /// Version conflicts raised by the underlying store.
    observed_conflicts: usize,
}

/// Wraps a [`MemoryStore`] and fails selected calls.
#[derive(Debug, Default)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    faults: Mutex<Faults>,
}

fn take(budget: &mut HashMap<String, usize>, collection: &str) -> bool {
    match budget.get_mut(collection) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

impl FaultyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        self.faults.lock().unwrap().latency = latency;
    }

    pub(crate) fn fail_creates(&self, collection: &str, times: usize) {
        self.faults
            .lock()
            .unwrap()
            .creates
            .insert(collection.to_string(), times);
    }

    pub(crate) fn fail_updates(&self, collection: &str, times: usize) {
        self.faults
            .lock()
            .unwrap()
            .updates
            .insert(collection.to_string(), times);
    }

    pub(crate) fn conflict_updates(&self, collection: &str, times: usize) {
        self.faults
            .lock()
            .unwrap()
            .conflicts
            .insert(collection.to_string(), times);
    }

    /// Apply the next `times` updates but answer them as unavailable.
    pub(crate) fn lose_update_acks(&self, collection: &str, times: usize) {
        self.faults
            .lock()
            .unwrap()
            .lost_acks
            .insert(collection.to_string(), times);
    }

    /// Real (not injected) version conflicts seen so far.
    pub(crate) fn observed_conflicts(&self) -> usize {
        self.faults.lock().unwrap().observed_conflicts
    }

    fn observe<T>(&self, result: &Result<T>) {
        if matches!(result, Err(StoreError::Conflict { .. })) {
            self.faults.lock().unwrap().observed_conflicts += 1;
        }
    }

    async fn delay(&self) {
        let latency = self.faults.lock().unwrap().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl DocumentStore for FaultyStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Stored<Value>> {
        self.delay().await;
        self.inner.get(collection, id).await
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Stored<Value>>> {
        self.delay().await;
        self.inner.query(collection, field, value).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<Stored<Value>>> {
        self.delay().await;
        self.inner.list(collection).await
    }

    async fn create(&self, collection: &str, id: &str, document: Value) -> Result<u64> {
        self.delay().await;
        if take(&mut self.faults.lock().unwrap().creates, collection) {
            return Err(StoreError::Unavailable(format!("injected create failure in {collection}")));
        }
        let result = self.inner.create(collection, id, document).await;
        self.observe(&result);
        result
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        expected_version: u64,
        document: Value,
    ) -> Result<u64> {
        self.delay().await;
        let lose_ack = {
            let mut faults = self.faults.lock().unwrap();
            if take(&mut faults.conflicts, collection) {
                return Err(StoreError::conflict(collection, id));
            }
            if take(&mut faults.updates, collection) {
                return Err(StoreError::Unavailable(format!(
                    "injected update failure in {collection}"
                )));
            }
            take(&mut faults.lost_acks, collection)
        };
        let result = self
            .inner
            .update(collection, id, expected_version, document)
            .await;
        self.observe(&result);
        match result {
            Ok(_) if lose_ack => Err(StoreError::Unavailable(format!(
                "injected lost acknowledgement in {collection}"
            ))),
            other => other,
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.delay().await;
        self.inner.delete(collection, id).await
    }
}
