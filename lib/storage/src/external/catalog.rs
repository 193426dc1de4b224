//! `MetaCatalog` (spec.md §6.2): the hierarchical key/value store a query
//! node's coordinator-facing state is persisted into. Only the interface is
//! in scope; `InMemoryCatalog` is a reference implementation for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::errors::StorageResult;

#[async_trait]
pub trait MetaCatalog: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Splits `items` into chunks of at most `max_per_txn` and writes each
    /// chunk as one call to `put`; atomicity is only guaranteed within a
    /// single chunk (spec.md §6.2 "the caller splits into partial batches
    /// preserving atomicity per batch only").
    async fn batch_save(
        &self,
        items: Vec<(String, Vec<u8>)>,
        max_per_txn: usize,
    ) -> StorageResult<()> {
        for chunk in items.chunks(max_per_txn.max(1)) {
            for (key, value) in chunk {
                self.put(key, value.clone()).await?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCatalog {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaCatalog for InMemoryCatalog {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_save_splits_at_max_per_txn() {
        let catalog = InMemoryCatalog::new();
        let items: Vec<_> = (0..5)
            .map(|i| (format!("k{i}"), vec![i as u8]))
            .collect();
        catalog.batch_save(items, 2).await.unwrap();
        for i in 0..5 {
            assert_eq!(
                catalog.get(&format!("k{i}")).await.unwrap(),
                Some(vec![i as u8])
            );
        }
    }
}
