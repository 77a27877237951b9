//! In-process vector index with injectable failures, used to exercise the
//! synchronizer without a live index service.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use lakehouse_shared::{IndexDocument, LakehouseError, Result};

use crate::VectorIndex;

#[derive(Debug, Default)]
struct State {
    documents: BTreeMap<String, IndexDocument>,
    failing_ids: BTreeSet<String>,
    upsert_calls: usize,
    delete_calls: usize,
}

/// A [`VectorIndex`] holding documents in memory.
#[derive(Debug, Default)]
pub struct MemoryVectorIndex {
    state: Mutex<State>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation on `id` fail with `IndexUnavailable` until cleared.
    pub fn fail_on(&self, id: &str) {
        self.lock().failing_ids.insert(id.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failing_ids.clear();
    }

    pub fn get(&self, id: &str) -> Option<IndexDocument> {
        self.lock().documents.get(id).cloned()
    }

    /// Ids currently indexed, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.lock().documents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total `(upsert, delete)` calls that reached the index.
    pub fn call_counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.upsert_calls, state.delete_calls)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // Every mutation is a single map operation, so a poisoned state is still whole.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, document: &IndexDocument) -> Result<()> {
        let mut state = self.lock();
        if state.failing_ids.contains(&document.id) {
            return Err(LakehouseError::index("upsert", format!("{}: injected failure", document.id)));
        }
        state.upsert_calls += 1;
        state.documents.insert(document.id.clone(), document.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.failing_ids.contains(id) {
            return Err(LakehouseError::index("delete", format!("{id}: injected failure")));
        }
        state.delete_calls += 1;
        state.documents.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lakehouse_shared::Metadata;

    use super::*;

    fn doc(id: &str) -> IndexDocument {
        IndexDocument {
            id: id.into(),
            content: format!("content of {id}"),
            metadata: Metadata::new(),
            fingerprint: format!("fp-{id}"),
        }
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_id() {
        let index = MemoryVectorIndex::new();
        index.upsert(&doc("a")).await.unwrap();
        index.upsert(&doc("a")).await.unwrap();
        index.upsert(&doc("b")).await.unwrap();
        assert_eq!(index.ids(), vec!["a", "b"]);

        index.delete("a").await.unwrap();
        index.delete("missing").await.unwrap();
        assert_eq!(index.ids(), vec!["b"]);
        assert_eq!(index.call_counts(), (3, 2));
    }

    #[tokio::test]
    async fn injected_failures() {
        let index = MemoryVectorIndex::new();
        index.fail_on("a");
        assert!(index.upsert(&doc("a")).await.is_err());
        assert!(index.is_empty());

        index.clear_failures();
        index.upsert(&doc("a")).await.unwrap();
        assert_eq!(index.get("a").unwrap().fingerprint, "fp-a");
    }
}
