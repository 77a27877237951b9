//! Append-only lineage log.
//!
//! Entries are keyed by an autoincrement `sequence` and never updated or
//! deleted. Queries are lazy range scans over `sequence`, fetched one page at
//! a time.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use lakehouse_shared::{LakehouseError, LineageEntry, Result, Stage, TransitionOutcome};
use libsql::{Connection, params};
use serde::Serialize;

use crate::{Storage, db_err, parse_timestamp};

const DEFAULT_PAGE_SIZE: usize = 256;

/// Filters for [`Storage::query_lineage`]. All bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineageFilter {
    pub stage_to: Option<Stage>,
    pub outcome: Option<TransitionOutcome>,
    pub min_batch_id: Option<u64>,
    pub max_batch_id: Option<u64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Stop after this many entries.
    pub limit: Option<usize>,
}

/// Aggregate lineage counters for one target stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LineageTotals {
    pub stage_to: Option<Stage>,
    pub committed_batches: u64,
    pub rejected_batches: u64,
    pub rejected_records: u64,
    pub collapsed_records: u64,
}

/// Lazy cursor over lineage entries in sequence order.
pub struct LineageCursor<'a> {
    storage: &'a Storage,
    filter: LineageFilter,
    after_sequence: u64,
    buffer: VecDeque<LineageEntry>,
    yielded: usize,
    page_size: usize,
    exhausted: bool,
}

impl<'a> LineageCursor<'a> {
    /// Fetch the next matching entry, loading another page when needed.
    pub async fn next(&mut self) -> Result<Option<LineageEntry>> {
        if self.filter.limit.is_some_and(|limit| self.yielded >= limit) {
            return Ok(None);
        }

        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }

        match self.buffer.pop_front() {
            Some(entry) => {
                self.yielded += 1;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Drain the cursor into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<LineageEntry>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let f = &self.filter;
        let stage_to = f.stage_to.map(|s| self.storage.label(s).to_string());
        let page = match f.limit {
            Some(limit) => self.page_size.min(limit - self.yielded),
            None => self.page_size,
        };

        let mut rows = self
            .storage
            .conn
            .query(
                "SELECT sequence, batch_id, stage_from, stage_to, input_count, output_count,
                        rejected_count, dedup_collapsed_count, batch_fingerprint, outcome,
                        rejection_reasons_json, recorded_at
                 FROM lineage
                 WHERE sequence > ?1
                   AND (?2 IS NULL OR stage_to = ?2)
                   AND (?3 IS NULL OR outcome = ?3)
                   AND (?4 IS NULL OR batch_id >= ?4)
                   AND (?5 IS NULL OR batch_id <= ?5)
                   AND (?6 IS NULL OR recorded_at_us >= ?6)
                   AND (?7 IS NULL OR recorded_at_us <= ?7)
                 ORDER BY sequence
                 LIMIT ?8",
                params![
                    self.after_sequence as i64,
                    stage_to,
                    f.outcome.map(|o| o.as_str()),
                    f.min_batch_id.map(|b| b as i64),
                    f.max_batch_id.map(|b| b as i64),
                    f.since.map(|t| t.timestamp_micros()),
                    f.until.map(|t| t.timestamp_micros()),
                    page as i64,
                ],
            )
            .await
            .map_err(db_err("query_lineage"))?;

        let mut fetched = 0;
        while let Some(row) = rows.next().await.map_err(db_err("query_lineage"))? {
            let entry = row_to_entry(self.storage, &row)?;
            self.after_sequence = entry.sequence;
            self.buffer.push_back(entry);
            fetched += 1;
        }

        if fetched < page {
            self.exhausted = true;
        }
        Ok(())
    }
}

impl Storage {
    /// Append a lineage entry on its own and return its sequence number.
    pub async fn append_lineage(&self, entry: &LineageEntry) -> Result<u64> {
        self.check_writable()?;
        let sequence = append_lineage_on(
            &self.conn,
            entry,
            self.label(entry.stage_from),
            self.label(entry.stage_to),
        )
        .await?;

        tracing::debug!(sequence, batch_id = entry.batch_id, outcome = entry.outcome.as_str(), "lineage appended");
        Ok(sequence)
    }

    /// Lazily scan lineage entries matching `filter`, oldest first.
    pub fn query_lineage(&self, filter: LineageFilter) -> LineageCursor<'_> {
        LineageCursor {
            storage: self,
            filter,
            after_sequence: 0,
            buffer: VecDeque::new(),
            yielded: 0,
            page_size: DEFAULT_PAGE_SIZE,
            exhausted: false,
        }
    }

    /// The most recently appended entry for `batch_id`, at any stage.
    pub async fn latest_lineage(&self, batch_id: u64) -> Result<Option<LineageEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sequence, batch_id, stage_from, stage_to, input_count, output_count,
                        rejected_count, dedup_collapsed_count, batch_fingerprint, outcome,
                        rejection_reasons_json, recorded_at
                 FROM lineage
                 WHERE batch_id = ?1
                 ORDER BY sequence DESC
                 LIMIT 1",
                params![batch_id as i64],
            )
            .await
            .map_err(db_err("latest_lineage"))?;

        match rows.next().await.map_err(db_err("latest_lineage"))? {
            Some(row) => Ok(Some(row_to_entry(self, &row)?)),
            None => Ok(None),
        }
    }

    /// Rejection and collapse totals grouped by target stage.
    pub async fn lineage_totals(&self) -> Result<Vec<LineageTotals>> {
        let mut rows = self
            .conn
            .query(
                "SELECT stage_to,
                        SUM(CASE WHEN outcome = 'committed' THEN 1 ELSE 0 END),
                        SUM(CASE WHEN outcome = 'rejected' THEN 1 ELSE 0 END),
                        SUM(rejected_count),
                        SUM(dedup_collapsed_count)
                 FROM lineage GROUP BY stage_to",
                params![],
            )
            .await
            .map_err(db_err("lineage_totals"))?;

        let mut totals = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err("lineage_totals"))? {
            let label: String = row.get(0).map_err(db_err("lineage_totals"))?;
            totals.push(LineageTotals {
                stage_to: self.stage_for_label(&label).ok(),
                committed_batches: row.get::<i64>(1).map_err(db_err("lineage_totals"))? as u64,
                rejected_batches: row.get::<i64>(2).map_err(db_err("lineage_totals"))? as u64,
                rejected_records: row.get::<i64>(3).map_err(db_err("lineage_totals"))? as u64,
                collapsed_records: row.get::<i64>(4).map_err(db_err("lineage_totals"))? as u64,
            });
        }
        totals.sort_by_key(|t| t.stage_to);
        Ok(totals)
    }
}

pub(crate) async fn append_lineage_on(
    conn: &Connection,
    entry: &LineageEntry,
    from_label: &str,
    to_label: &str,
) -> Result<u64> {
    let reasons = serde_json::to_string(&entry.rejection_reasons)?;
    let mut rows = conn
        .query(
            "INSERT INTO lineage (batch_id, stage_from, stage_to, input_count, output_count,
                                  rejected_count, dedup_collapsed_count, batch_fingerprint, outcome,
                                  rejection_reasons_json, recorded_at, recorded_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             RETURNING sequence",
            params![
                entry.batch_id as i64,
                from_label,
                to_label,
                entry.input_count as i64,
                entry.output_count as i64,
                entry.rejected_count as i64,
                entry.dedup_collapsed_count as i64,
                entry.batch_fingerprint.as_str(),
                entry.outcome.as_str(),
                reasons,
                entry.timestamp.to_rfc3339(),
                entry.timestamp.timestamp_micros(),
            ],
        )
        .await
        .map_err(db_err("append_lineage"))?;

    let row = rows
        .next()
        .await
        .map_err(db_err("append_lineage"))?
        .ok_or_else(|| LakehouseError::storage("append_lineage", "no sequence returned"))?;
    Ok(row.get::<i64>(0).map_err(db_err("append_lineage"))? as u64)
}

fn row_to_entry(storage: &Storage, row: &libsql::Row) -> Result<LineageEntry> {
    let stage_from: String = row.get(2).map_err(db_err("row_to_entry"))?;
    let stage_to: String = row.get(3).map_err(db_err("row_to_entry"))?;
    let outcome: String = row.get(9).map_err(db_err("row_to_entry"))?;
    let reasons_json: String = row.get(10).map_err(db_err("row_to_entry"))?;
    let recorded_at: String = row.get(11).map_err(db_err("row_to_entry"))?;
    let rejection_reasons: BTreeMap<String, usize> = serde_json::from_str(&reasons_json)?;

    Ok(LineageEntry {
        sequence: row.get::<i64>(0).map_err(db_err("row_to_entry"))? as u64,
        batch_id: row.get::<i64>(1).map_err(db_err("row_to_entry"))? as u64,
        stage_from: storage.stage_for_label(&stage_from)?,
        stage_to: storage.stage_for_label(&stage_to)?,
        input_count: row.get::<i64>(4).map_err(db_err("row_to_entry"))? as usize,
        output_count: row.get::<i64>(5).map_err(db_err("row_to_entry"))? as usize,
        rejected_count: row.get::<i64>(6).map_err(db_err("row_to_entry"))? as usize,
        dedup_collapsed_count: row.get::<i64>(7).map_err(db_err("row_to_entry"))? as usize,
        batch_fingerprint: row.get(8).map_err(db_err("row_to_entry"))?,
        outcome: outcome.parse()?,
        rejection_reasons,
        timestamp: parse_timestamp(&recorded_at)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::test_support::test_storage;

    fn entry(batch_id: u64, stage_to: Stage, outcome: TransitionOutcome, at: DateTime<Utc>) -> LineageEntry {
        LineageEntry {
            sequence: 0,
            batch_id,
            stage_from: Stage::Raw,
            stage_to,
            input_count: 10,
            output_count: 8,
            rejected_count: 2,
            dedup_collapsed_count: 1,
            batch_fingerprint: format!("digest-{batch_id}"),
            outcome,
            rejection_reasons: BTreeMap::from([("below_minimum_length".to_string(), 2)]),
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn append_assigns_increasing_sequences() {
        let storage = test_storage().await;
        let now = Utc::now();
        let s1 = storage
            .append_lineage(&entry(1, Stage::Cleaned, TransitionOutcome::Committed, now))
            .await
            .unwrap();
        let s2 = storage
            .append_lineage(&entry(2, Stage::Cleaned, TransitionOutcome::Rejected, now))
            .await
            .unwrap();
        assert!(s2 > s1);

        let all = storage.query_lineage(LineageFilter::default()).collect_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].sequence, s1);
        assert_eq!(all[0].rejection_reasons["below_minimum_length"], 2);
        assert_eq!(all[0].timestamp, now);
        assert_eq!(all[1].outcome, TransitionOutcome::Rejected);
    }

    #[tokio::test]
    async fn filters_narrow_the_scan() {
        let storage = test_storage().await;
        let base = Utc::now();
        for id in 1..=6 {
            let stage = if id % 2 == 0 { Stage::Curated } else { Stage::Cleaned };
            let outcome = if id == 5 { TransitionOutcome::Rejected } else { TransitionOutcome::Committed };
            storage
                .append_lineage(&entry(id, stage, outcome, base + Duration::seconds(id as i64)))
                .await
                .unwrap();
        }

        let curated = storage
            .query_lineage(LineageFilter {
                stage_to: Some(Stage::Curated),
                ..Default::default()
            })
            .collect_all()
            .await
            .unwrap();
        assert_eq!(curated.iter().map(|e| e.batch_id).collect::<Vec<_>>(), vec![2, 4, 6]);

        let rejected = storage
            .query_lineage(LineageFilter {
                outcome: Some(TransitionOutcome::Rejected),
                ..Default::default()
            })
            .collect_all()
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].batch_id, 5);

        let window = storage
            .query_lineage(LineageFilter {
                since: Some(base + Duration::seconds(2)),
                until: Some(base + Duration::seconds(4)),
                ..Default::default()
            })
            .collect_all()
            .await
            .unwrap();
        assert_eq!(window.iter().map(|e| e.batch_id).collect::<Vec<_>>(), vec![2, 3, 4]);

        let range = storage
            .query_lineage(LineageFilter {
                min_batch_id: Some(3),
                max_batch_id: Some(5),
                limit: Some(2),
                ..Default::default()
            })
            .collect_all()
            .await
            .unwrap();
        assert_eq!(range.iter().map(|e| e.batch_id).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn cursor_pages_lazily() {
        let storage = test_storage().await;
        let now = Utc::now();
        for id in 1..=5 {
            storage
                .append_lineage(&entry(id, Stage::Cleaned, TransitionOutcome::Committed, now))
                .await
                .unwrap();
        }

        let mut cursor = storage.query_lineage(LineageFilter::default());
        cursor.page_size = 2;
        let mut seen = Vec::new();
        while let Some(e) = cursor.next().await.unwrap() {
            seen.push(e.batch_id);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_entry_per_batch() {
        let storage = test_storage().await;
        let now = Utc::now();
        assert!(storage.latest_lineage(1).await.unwrap().is_none());

        storage
            .append_lineage(&entry(1, Stage::Cleaned, TransitionOutcome::Committed, now))
            .await
            .unwrap();
        let last = storage
            .append_lineage(&entry(1, Stage::Curated, TransitionOutcome::Rejected, now))
            .await
            .unwrap();
        storage
            .append_lineage(&entry(2, Stage::Cleaned, TransitionOutcome::Committed, now))
            .await
            .unwrap();

        let latest = storage.latest_lineage(1).await.unwrap().unwrap();
        assert_eq!(latest.sequence, last);
        assert_eq!(latest.stage_to, Stage::Curated);
        assert_eq!(latest.outcome, TransitionOutcome::Rejected);
    }

    #[tokio::test]
    async fn totals_group_by_target_stage() {
        let storage = test_storage().await;
        let now = Utc::now();
        storage
            .append_lineage(&entry(1, Stage::Cleaned, TransitionOutcome::Committed, now))
            .await
            .unwrap();
        storage
            .append_lineage(&entry(2, Stage::Cleaned, TransitionOutcome::Rejected, now))
            .await
            .unwrap();

        let totals = storage.lineage_totals().await.unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].stage_to, Some(Stage::Cleaned));
        assert_eq!(totals[0].committed_batches, 1);
        assert_eq!(totals[0].rejected_batches, 1);
        assert_eq!(totals[0].rejected_records, 4);
        assert_eq!(totals[0].collapsed_records, 2);
    }
}
