//! libSQL storage layer for every pipeline stage.
//!
//! The [`Storage`] struct wraps a libSQL database holding batch payloads,
//! per-stage record tables, the dedup set, lineage and index sync state.
//!
//! **Access rules:**
//! - Pipeline runs: read-write via [`Storage::open`], one writer per stage
//!   (the run lock is held by the scheduler)
//! - Downstream readers (question answering, stats): [`Storage::open_readonly`]

mod commit;
mod dedup;
mod index_state;
mod lineage;
mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use lakehouse_shared::{Batch, LakehouseError, Metadata, Record, Result, Stage, StageNames};
use libsql::{Connection, Database, params};
use serde::Serialize;

pub use commit::{CommitOutcome, StageCommit};
pub use dedup::FingerprintSet;
pub use lineage::{LineageCursor, LineageFilter, LineageTotals};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    stage_names: StageNames,
}

/// Commit metadata for a stored batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBatch {
    pub batch_id: u64,
    pub record_count: usize,
    /// Digest of the source batch it was promoted from (`None` for landed raw batches).
    pub input_digest: Option<String>,
    pub written_at: DateTime<Utc>,
}

/// Content statistics for one stage's records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStats {
    pub stage: Stage,
    pub record_count: u64,
    pub batch_count: u64,
    pub avg_content_length: f64,
    pub min_content_length: u64,
    pub max_content_length: u64,
}

/// Map a libSQL failure during `operation` to a retryable storage error.
pub(crate) fn db_err(operation: &'static str) -> impl FnOnce(libsql::Error) -> LakehouseError {
    move |e| LakehouseError::storage(operation, e)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LakehouseError::Serialization(format!("invalid timestamp '{raw}': {e}")))
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LakehouseError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err("open"))?;

        let conn = db.connect().map_err(db_err("connect"))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            stage_names: StageNames::default(),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err("open"))?;

        let conn = db.connect().map_err(db_err("connect"))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            stage_names: StageNames::default(),
        })
    }

    /// Use custom storage labels for the stages.
    pub fn with_stage_names(mut self, names: StageNames) -> Result<Self> {
        names.validate()?;
        self.stage_names = names;
        Ok(self)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LakehouseError::storage(format!("migration v{}", migration.version), e)
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LakehouseError::storage(
                "write",
                "database is opened in read-only mode",
            ));
        }
        Ok(())
    }

    /// Storage label for a stage.
    pub(crate) fn label(&self, stage: Stage) -> &str {
        self.stage_names.label(stage)
    }

    /// Inverse of [`Storage::label`].
    pub(crate) fn stage_for_label(&self, label: &str) -> Result<Stage> {
        Stage::ALL
            .into_iter()
            .find(|s| self.label(*s) == label)
            .ok_or_else(|| LakehouseError::Serialization(format!("unknown stage label '{label}'")))
    }

    // -----------------------------------------------------------------------
    // Document store: get / put / list batches
    // -----------------------------------------------------------------------

    /// Load a stored batch, if present.
    pub async fn get_batch(&self, stage: Stage, batch_id: u64) -> Result<Option<Batch>> {
        let mut rows = self
            .conn
            .query(
                "SELECT payload FROM batches WHERE stage = ?1 AND batch_id = ?2",
                params![self.label(stage), batch_id as i64],
            )
            .await
            .map_err(db_err("get_batch"))?;

        match rows.next().await.map_err(db_err("get_batch"))? {
            Some(row) => {
                let payload: Vec<u8> = row.get(0).map_err(db_err("get_batch"))?;
                Ok(Some(serde_json::from_slice(&payload)?))
            }
            None => Ok(None),
        }
    }

    /// Write a batch directly at `stage` (used to land scraped RAW batches).
    ///
    /// Replaces any payload and record rows previously stored under the same
    /// id. Promotion into later stages goes through [`Storage::commit_stage`]
    /// instead.
    pub async fn put_batch(&self, stage: Stage, batch: &Batch) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(db_err("put_batch"))?;
        tx.execute(
            "DELETE FROM records WHERE stage = ?1 AND batch_id = ?2",
            params![self.label(stage), batch.batch_id as i64],
        )
        .await
        .map_err(db_err("put_batch"))?;
        write_batch(&tx, self.label(stage), batch, None).await?;
        bump_watermark(&tx, self.label(stage), batch.batch_id).await?;
        tx.commit().await.map_err(db_err("put_batch"))?;

        tracing::debug!(%stage, batch_id = batch.batch_id, records = batch.len(), "batch stored");
        Ok(())
    }

    /// Ids of all batches stored at `stage`, ascending.
    pub async fn list_batches(&self, stage: Stage) -> Result<Vec<u64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT batch_id FROM batches WHERE stage = ?1 ORDER BY batch_id",
                params![self.label(stage)],
            )
            .await
            .map_err(db_err("list_batches"))?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err("list_batches"))? {
            ids.push(row.get::<i64>(0).map_err(db_err("list_batches"))? as u64);
        }
        Ok(ids)
    }

    /// Next unused batch id for `stage`.
    pub async fn next_batch_id(&self, stage: Stage) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(MAX(batch_id), 0) FROM batches WHERE stage = ?1",
                params![self.label(stage)],
            )
            .await
            .map_err(db_err("next_batch_id"))?;

        let max = match rows.next().await.map_err(db_err("next_batch_id"))? {
            Some(row) => row.get::<i64>(0).map_err(db_err("next_batch_id"))?,
            None => 0,
        };
        Ok(max as u64 + 1)
    }

    /// Commit metadata of a stored batch, if present.
    pub async fn stored_batch(&self, stage: Stage, batch_id: u64) -> Result<Option<StoredBatch>> {
        stored_batch_on(&self.conn, self.label(stage), batch_id).await
    }

    /// Highest batch id committed at `stage`.
    pub async fn watermark(&self, stage: Stage) -> Result<Option<u64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT batch_id FROM stage_watermarks WHERE stage = ?1",
                params![self.label(stage)],
            )
            .await
            .map_err(db_err("watermark"))?;

        match rows.next().await.map_err(db_err("watermark"))? {
            Some(row) => Ok(Some(row.get::<i64>(0).map_err(db_err("watermark"))? as u64)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Stage records
    // -----------------------------------------------------------------------

    /// All records currently at `stage`, ordered by id.
    pub async fn list_records(&self, stage: Stage) -> Result<Vec<Record>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, source_url, content, metadata_json, fingerprint, ingested_at, stage_updated_at
                 FROM records WHERE stage = ?1 ORDER BY id",
                params![self.label(stage)],
            )
            .await
            .map_err(db_err("list_records"))?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err("list_records"))? {
            results.push(row_to_record(&row, stage)?);
        }
        Ok(results)
    }

    /// Remove one record from `stage`. Returns whether a row was deleted.
    ///
    /// The batch payload is left untouched; it is the audit copy of what was
    /// committed.
    pub async fn delete_record(&self, stage: Stage, id: &str) -> Result<bool> {
        self.check_writable()?;
        let deleted = self
            .conn
            .execute(
                "DELETE FROM records WHERE stage = ?1 AND id = ?2",
                params![self.label(stage), id],
            )
            .await
            .map_err(db_err("delete_record"))?;
        Ok(deleted > 0)
    }

    /// Record counts and content-length statistics for `stage`.
    pub async fn stage_stats(&self, stage: Stage) -> Result<StageStats> {
        let label = self.label(stage);
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*),
                        COALESCE(AVG(LENGTH(content)), 0.0),
                        COALESCE(MIN(LENGTH(content)), 0),
                        COALESCE(MAX(LENGTH(content)), 0),
                        (SELECT COUNT(*) FROM batches WHERE stage = ?1)
                 FROM records WHERE stage = ?1",
                params![label],
            )
            .await
            .map_err(db_err("stage_stats"))?;

        let row = rows
            .next()
            .await
            .map_err(db_err("stage_stats"))?
            .ok_or_else(|| LakehouseError::storage("stage_stats", "aggregate returned no row"))?;

        Ok(StageStats {
            stage,
            record_count: row.get::<i64>(0).map_err(db_err("stage_stats"))? as u64,
            avg_content_length: row.get::<f64>(1).map_err(db_err("stage_stats"))?,
            min_content_length: row.get::<i64>(2).map_err(db_err("stage_stats"))? as u64,
            max_content_length: row.get::<i64>(3).map_err(db_err("stage_stats"))? as u64,
            batch_count: row.get::<i64>(4).map_err(db_err("stage_stats"))? as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside a transaction)
// ---------------------------------------------------------------------------

/// Store a batch payload and upsert its records.
pub(crate) async fn write_batch(
    conn: &Connection,
    label: &str,
    batch: &Batch,
    input_digest: Option<&str>,
) -> Result<()> {
    let payload = serde_json::to_vec(batch)?;
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO batches (stage, batch_id, payload, record_count, input_digest, written_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(stage, batch_id) DO UPDATE SET
           payload = excluded.payload,
           record_count = excluded.record_count,
           input_digest = excluded.input_digest,
           written_at = excluded.written_at",
        params![
            label,
            batch.batch_id as i64,
            payload,
            batch.len() as i64,
            input_digest,
            now.as_str(),
        ],
    )
    .await
    .map_err(db_err("write_batch"))?;

    for record in &batch.records {
        let metadata_json = serde_json::to_string(&record.metadata)?;
        conn.execute(
            "INSERT INTO records (stage, id, batch_id, source_url, content, metadata_json, fingerprint, ingested_at, stage_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(stage, id) DO UPDATE SET
               batch_id = excluded.batch_id,
               source_url = excluded.source_url,
               content = excluded.content,
               metadata_json = excluded.metadata_json,
               fingerprint = excluded.fingerprint,
               ingested_at = excluded.ingested_at,
               stage_updated_at = excluded.stage_updated_at",
            params![
                label,
                record.id.as_str(),
                batch.batch_id as i64,
                record.source_url.as_str(),
                record.content.as_str(),
                metadata_json,
                record.fingerprint.as_str(),
                record.ingested_at.to_rfc3339(),
                record.stage_updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(db_err("write_batch"))?;
    }
    Ok(())
}

/// Raise the stage watermark to at least `batch_id`.
pub(crate) async fn bump_watermark(conn: &Connection, label: &str, batch_id: u64) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO stage_watermarks (stage, batch_id, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(stage) DO UPDATE SET
           batch_id = MAX(stage_watermarks.batch_id, excluded.batch_id),
           updated_at = excluded.updated_at",
        params![label, batch_id as i64, now.as_str()],
    )
    .await
    .map_err(db_err("bump_watermark"))?;
    Ok(())
}

pub(crate) async fn stored_batch_on(
    conn: &Connection,
    label: &str,
    batch_id: u64,
) -> Result<Option<StoredBatch>> {
    let mut rows = conn
        .query(
            "SELECT record_count, input_digest, written_at FROM batches
             WHERE stage = ?1 AND batch_id = ?2",
            params![label, batch_id as i64],
        )
        .await
        .map_err(db_err("stored_batch"))?;

    match rows.next().await.map_err(db_err("stored_batch"))? {
        Some(row) => {
            let written_at: String = row.get(2).map_err(db_err("stored_batch"))?;
            Ok(Some(StoredBatch {
                batch_id,
                record_count: row.get::<i64>(0).map_err(db_err("stored_batch"))? as usize,
                input_digest: row.get::<String>(1).ok(),
                written_at: parse_timestamp(&written_at)?,
            }))
        }
        None => Ok(None),
    }
}

/// Convert a `records` row to a [`Record`].
fn row_to_record(row: &libsql::Row, stage: Stage) -> Result<Record> {
    let metadata_json: String = row.get(3).map_err(db_err("row_to_record"))?;
    let metadata: Metadata = serde_json::from_str(&metadata_json)?;
    let ingested_at: String = row.get(5).map_err(db_err("row_to_record"))?;
    let stage_updated_at: String = row.get(6).map_err(db_err("row_to_record"))?;

    Ok(Record {
        id: row.get(0).map_err(db_err("row_to_record"))?,
        source_url: row.get(1).map_err(db_err("row_to_record"))?,
        stage,
        content: row.get(2).map_err(db_err("row_to_record"))?,
        metadata,
        fingerprint: row.get(4).map_err(db_err("row_to_record"))?,
        ingested_at: parse_timestamp(&ingested_at)?,
        stage_updated_at: parse_timestamp(&stage_updated_at)?,
    })
}
