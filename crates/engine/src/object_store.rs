//! Payload storage next to the vector index
//!
//! The index only knows labels and vectors; record payloads go to an
//! [`ObjectStore`] keyed by the same id. Writes arrive from the ordered
//! commit path, reads from request threads.

use dashmap::DashMap;
use serde_json::Value;

use vdb_core::StorageError;

/// Document store keyed by record id
pub trait ObjectStore: Send + Sync {
    /// Store or overwrite one document
    fn put(&self, id: u64, document: &Value) -> Result<(), StorageError>;

    /// Fetch a document; `NotFound` when absent
    fn get(&self, id: u64) -> Result<Value, StorageError>;

    /// Store equal-length columns of ids and documents
    fn put_batch(&self, ids: &[u64], documents: &[Value]) -> Result<(), StorageError> {
        if ids.len() != documents.len() {
            return Err(StorageError::Backend(format!(
                "put_batch got {} ids and {} documents",
                ids.len(),
                documents.len()
            )));
        }
        for (id, document) in ids.iter().zip(documents) {
            self.put(*id, document)?;
        }
        Ok(())
    }

    /// Number of stored documents
    fn len(&self) -> usize;

    /// True if nothing is stored
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local store
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    docs: DashMap<u64, Value>,
}

impl InMemoryObjectStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put(&self, id: u64, document: &Value) -> Result<(), StorageError> {
        self.docs.insert(id, document.clone());
        Ok(())
    }

    fn get(&self, id: u64) -> Result<Value, StorageError> {
        self.docs
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::NotFound(id))
    }

    fn len(&self) -> usize {
        self.docs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_then_get() {
        let store = InMemoryObjectStore::new();
        store.put(1, &json!({"title": "a"})).unwrap();
        assert_eq!(store.get(1).unwrap(), json!({"title": "a"}));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_missing_is_not_found() {
        let store = InMemoryObjectStore::new();
        assert!(matches!(store.get(9), Err(StorageError::NotFound(9))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_overwrites() {
        let store = InMemoryObjectStore::new();
        store.put(1, &json!(1)).unwrap();
        store.put(1, &json!(2)).unwrap();
        assert_eq!(store.get(1).unwrap(), json!(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_put_batch_arity() {
        let store = InMemoryObjectStore::new();
        assert!(store.put_batch(&[1, 2], &[json!(1)]).is_err());
        assert!(store.is_empty());

        store.put_batch(&[1, 2], &[json!("x"), json!("y")]).unwrap();
        assert_eq!(store.get(2).unwrap(), json!("y"));
    }
}
