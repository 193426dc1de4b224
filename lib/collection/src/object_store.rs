//! Object storage abstraction (spec.md §1, §4.4): fetches sealed-segment
//! binlogs by path. Only the interface is in scope; `InMemoryObjectStore` is
//! a reference implementation for `SegmentLoader` tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::errors::{CollectionError, CollectionResult};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, path: &str) -> CollectionResult<Vec<u8>>;

    async fn object_size(&self, path: &str) -> CollectionResult<usize> {
        Ok(self.get_object(path).await?.len())
    }
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: impl Into<String>, bytes: Vec<u8>) {
        self.objects.write().insert(path.into(), bytes);
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get_object(&self, path: &str) -> CollectionResult<Vec<u8>> {
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| CollectionError::not_found(format!("object {path}")))
    }
}
