//! Client side of the external vector index.
//!
//! The pipeline only needs two operations: upsert a curated document by id
//! and delete by id. Embedding and chunking happen behind the index endpoint.

mod http;
mod memory;

use async_trait::async_trait;
use lakehouse_shared::{IndexDocument, Result};

pub use http::{HttpIndexOptions, HttpVectorIndex};
pub use memory::MemoryVectorIndex;

/// A retrieval index keyed by record id.
///
/// Both operations must be idempotent: upserting the same document twice or
/// deleting an absent id succeeds without side effects.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, document: &IndexDocument) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}
