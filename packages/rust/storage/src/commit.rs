//! Atomic stage promotion.
//!
//! A commit writes the target batch, its records, the lineage entry, the new
//! fingerprints and the stage watermark inside one transaction. Readers see
//! either all of it or none of it.

use lakehouse_shared::{Batch, LakehouseError, LineageEntry, Result};

use crate::dedup::merge_fingerprints;
use crate::lineage::append_lineage_on;
use crate::{Storage, StoredBatch, bump_watermark, db_err, stored_batch_on, write_batch};

/// Everything written by one successful stage transition.
#[derive(Debug, Clone)]
pub struct StageCommit<'a> {
    /// Promoted batch; `batch.target_stage` is the stage written.
    pub batch: &'a Batch,
    /// Digest of the source batch this one was produced from.
    pub input_digest: &'a str,
    pub lineage: &'a LineageEntry,
    /// Fingerprints to merge into the target stage's dedup set.
    pub new_fingerprints: &'a [String],
    /// Dedup set version observed before processing.
    pub expected_version: u64,
}

/// Result of [`Storage::commit_stage`].
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Written; carries the lineage entry with its assigned sequence.
    Committed(LineageEntry),
    /// The same input was already committed under this batch id.
    AlreadyCommitted(StoredBatch),
}

impl Storage {
    /// Promote a batch into its target stage.
    ///
    /// Re-submitting a committed batch id with the same input digest is a
    /// no-op. A different digest is a [`LakehouseError::ConsistencyViolation`].
    /// A dedup set changed since `expected_version` is a
    /// [`LakehouseError::Conflict`]. Both leave storage untouched.
    pub async fn commit_stage(&self, commit: StageCommit<'_>) -> Result<CommitOutcome> {
        self.check_writable()?;
        let batch = commit.batch;
        let stage = batch.target_stage;
        let label = self.label(stage);

        let tx = self.conn.transaction().await.map_err(db_err("commit_stage"))?;

        if let Some(existing) = stored_batch_on(&tx, label, batch.batch_id).await? {
            if existing.input_digest.as_deref() == Some(commit.input_digest) {
                tracing::info!(%stage, batch_id = batch.batch_id, "batch already committed, skipping");
                return Ok(CommitOutcome::AlreadyCommitted(existing));
            }
            return Err(LakehouseError::ConsistencyViolation {
                batch_id: batch.batch_id,
                stage,
                details: format!(
                    "input digest {} does not match committed digest {}",
                    commit.input_digest,
                    existing.input_digest.as_deref().unwrap_or("<none>")
                ),
            });
        }

        merge_fingerprints(
            &tx,
            stage,
            label,
            batch.batch_id,
            commit.new_fingerprints,
            commit.expected_version,
        )
        .await?;
        write_batch(&tx, label, batch, Some(commit.input_digest)).await?;
        bump_watermark(&tx, label, batch.batch_id).await?;
        let sequence = append_lineage_on(
            &tx,
            commit.lineage,
            self.label(commit.lineage.stage_from),
            label,
        )
        .await?;

        tx.commit().await.map_err(db_err("commit_stage"))?;

        tracing::info!(
            %stage,
            batch_id = batch.batch_id,
            records = batch.len(),
            sequence,
            "batch committed"
        );

        let mut entry = commit.lineage.clone();
        entry.sequence = sequence;
        Ok(CommitOutcome::Committed(entry))
    }
}
