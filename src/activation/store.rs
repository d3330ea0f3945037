//! Activation code storage
//!
//! The production store is a remote structured database reached over the
//! network; this module defines the narrow interface the service needs and
//! an in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use super::code::ActivationCode;

/// Failure talking to the code store
#[derive(Debug, Clone, thiserror::Error)]
#[error("Code store error: {0}")]
pub struct CodeStoreError(pub String);

/// Remote key/value store of activation codes, keyed by [`super::email_key`]
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Write a record, overwriting any previous one
    async fn set(&self, key: &str, record: &ActivationCode) -> Result<(), CodeStoreError>;

    /// Read a record
    async fn get(&self, key: &str) -> Result<Option<ActivationCode>, CodeStoreError>;

    /// Partial update flipping the used flag, applied only while the record
    /// is unused and still holds `expected_code`. Returns whether it applied.
    async fn mark_used(
        &self,
        key: &str,
        expected_code: &str,
        used_at: i64,
    ) -> Result<bool, CodeStoreError>;

    /// All records with their keys
    async fn list(&self) -> Result<Vec<(String, ActivationCode)>, CodeStoreError>;

    /// Apply a batch of writes in one call; `None` deletes the key
    async fn update_many(
        &self,
        updates: HashMap<String, Option<ActivationCode>>,
    ) -> Result<(), CodeStoreError>;
}

/// In-memory code store
#[derive(Debug, Default)]
pub struct MemoryCodeStore {
    records: RwLock<BTreeMap<String, ActivationCode>>,
}

impl MemoryCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CodeStore for MemoryCodeStore {
    async fn set(&self, key: &str, record: &ActivationCode) -> Result<(), CodeStoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<ActivationCode>, CodeStoreError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(key).cloned())
    }

    async fn mark_used(
        &self,
        key: &str,
        expected_code: &str,
        used_at: i64,
    ) -> Result<bool, CodeStoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(key) {
            Some(record) if !record.used && record.code == expected_code => {
                record.used = true;
                record.used_at = Some(used_at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CodeStoreError(format!("no record at {}", key))),
        }
    }

    async fn list(&self) -> Result<Vec<(String, ActivationCode)>, CodeStoreError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }

    async fn update_many(
        &self,
        updates: HashMap<String, Option<ActivationCode>>,
    ) -> Result<(), CodeStoreError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let count = updates.len();
        for (key, value) in updates {
            match value {
                Some(record) => {
                    records.insert(key, record);
                }
                None => {
                    records.remove(&key);
                }
            }
        }
        debug!(count = count, "Applied batched code store update");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: &str) -> ActivationCode {
        ActivationCode::issue(code.to_string(), "a@test.com", "Ann", 0)
    }

    #[tokio::test]
    async fn test_memory_store_operations() {
        let store = MemoryCodeStore::new();
        assert!(store.get("k").await.unwrap().is_none());

        store.set("k", &record("11111")).await.unwrap();
        store.set("k", &record("22222")).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().code, "22222");

        assert!(!store.mark_used("k", "11111", 42).await.unwrap());
        assert!(store.mark_used("k", "22222", 42).await.unwrap());
        let used = store.get("k").await.unwrap().unwrap();
        assert!(used.used);
        assert_eq!(used.used_at, Some(42));
        assert!(!store.mark_used("k", "22222", 43).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().used_at, Some(42));
        assert!(store.mark_used("missing", "22222", 1).await.is_err());

        let mut batch = HashMap::new();
        batch.insert("k".to_string(), None);
        batch.insert("j".to_string(), Some(record("33333")));
        store.update_many(batch).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "j");
    }
}
