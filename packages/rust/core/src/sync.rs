//! Keeps the external vector index in line with the curated layer.
//!
//! The index snapshot in storage records what the index has acknowledged.
//! A delta is the difference between that snapshot and the curated rows,
//! plus anything promoted after the persisted watermark.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use lakehouse_index::VectorIndex;
use lakehouse_shared::{IndexDelta, IndexDocument, Record, Result, Stage};
use lakehouse_storage::Storage;

use crate::pipeline::with_timeout;

/// Name of the persisted watermark for the curated → index sync.
pub const CURATED_INDEX_WATERMARK: &str = "curated_index";

/// Counts of acknowledged operations from one [`Synchronizer::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub upserted: usize,
    pub deleted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark: Option<DateTime<Utc>>,
}

/// Pushes curated changes into a [`VectorIndex`].
pub struct Synchronizer<'a> {
    storage: &'a Storage,
    index: &'a dyn VectorIndex,
    io_timeout: Duration,
}

impl<'a> Synchronizer<'a> {
    pub fn new(storage: &'a Storage, index: &'a dyn VectorIndex, io_timeout: Duration) -> Self {
        Self {
            storage,
            index,
            io_timeout,
        }
    }

    /// Operations needed to bring the index up to date.
    ///
    /// A curated record is upserted when the index holds a different
    /// fingerprint for it (or none), or when it was promoted after
    /// `since_watermark`. Without a watermark the snapshot alone decides.
    /// Ids the index holds that are no longer curated are deleted.
    pub async fn compute_delta(&self, since_watermark: Option<DateTime<Utc>>) -> Result<IndexDelta> {
        let curated = with_timeout(
            self.io_timeout,
            "list_records",
            self.storage.list_records(Stage::Curated),
        )
        .await?;
        let snapshot = with_timeout(
            self.io_timeout,
            "load_index_snapshot",
            self.storage.load_index_snapshot(),
        )
        .await?;

        Ok(diff_against_snapshot(&curated, &snapshot, since_watermark))
    }

    /// Push `delta` to the index.
    ///
    /// Each acknowledged operation is recorded in the snapshot as it lands, so
    /// a failure part-way leaves the finished work in place. The watermark only
    /// advances once every operation succeeded.
    #[instrument(skip_all, fields(upserts = delta.upserts.len(), deletes = delta.deletes.len()))]
    pub async fn apply(&self, delta: &IndexDelta) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        for document in &delta.upserts {
            with_timeout(self.io_timeout, "index upsert", self.index.upsert(document)).await?;
            with_timeout(
                self.io_timeout,
                "record_indexed",
                self.storage.record_indexed(&document.id, &document.fingerprint),
            )
            .await?;
            report.upserted += 1;
        }

        for id in &delta.deletes {
            with_timeout(self.io_timeout, "index delete", self.index.delete(id)).await?;
            with_timeout(
                self.io_timeout,
                "record_unindexed",
                self.storage.record_unindexed(id),
            )
            .await?;
            report.deleted += 1;
        }

        if let Some(watermark) = delta.high_watermark {
            with_timeout(
                self.io_timeout,
                "set_sync_watermark",
                self.storage.set_sync_watermark(CURATED_INDEX_WATERMARK, watermark),
            )
            .await?;
            report.watermark = Some(watermark);
        }

        info!(
            upserted = report.upserted,
            deleted = report.deleted,
            "index sync applied"
        );
        Ok(report)
    }

    /// Compute and apply a delta from the persisted watermark.
    pub async fn sync(&self) -> Result<SyncReport> {
        let since = with_timeout(
            self.io_timeout,
            "sync_watermark",
            self.storage.sync_watermark(CURATED_INDEX_WATERMARK),
        )
        .await?;
        let delta = self.compute_delta(since).await?;

        if delta.is_empty() {
            info!("index already up to date");
        }
        self.apply(&delta).await
    }
}

fn diff_against_snapshot(
    curated: &[Record],
    snapshot: &HashMap<String, String>,
    since_watermark: Option<DateTime<Utc>>,
) -> IndexDelta {
    let mut upserts: Vec<IndexDocument> = curated
        .iter()
        .filter(|record| {
            let stale = snapshot.get(&record.id) != Some(&record.fingerprint);
            let promoted_since = since_watermark.is_some_and(|w| record.stage_updated_at > w);
            stale || promoted_since
        })
        .map(|record| IndexDocument {
            id: record.id.clone(),
            content: record.content.clone(),
            metadata: record.metadata.clone(),
            fingerprint: record.fingerprint.clone(),
        })
        .collect();
    upserts.sort_by(|a, b| a.id.cmp(&b.id));

    let live: BTreeSet<&str> = curated.iter().map(|r| r.id.as_str()).collect();
    let deletes: BTreeSet<String> = snapshot
        .keys()
        .filter(|id| !live.contains(id.as_str()))
        .cloned()
        .collect();

    let newest = curated.iter().map(|r| r.stage_updated_at).max();
    let high_watermark = match (since_watermark, newest) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };

    IndexDelta {
        upserts,
        deletes,
        high_watermark,
    }
}
