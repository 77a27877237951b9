//! Landing scraped documents as RAW batches.
//!
//! The scraper drops one JSON object per page (`{url, title, content}`) into
//! a directory. Every `*.json` file becomes one RAW record; the batch gets
//! the next free RAW batch id.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use lakehouse_shared::{Batch, FingerprintRules, LakehouseError, Metadata, Record, Result, Stage};
use lakehouse_storage::Storage;

/// One scraped page as written by the scraper.
#[derive(Debug, Deserialize)]
struct ScrapedDocument {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

/// What an ingest landed.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub batch_id: u64,
    pub records: usize,
    /// Files that were unreadable, malformed, or had no content.
    pub skipped: Vec<PathBuf>,
}

/// Read every `*.json` document in `dir` into RAW records, in file-name order.
///
/// Returns the records and the files that were skipped.
pub fn read_documents(
    dir: &Path,
    rules: &FingerprintRules,
    now: DateTime<Utc>,
) -> Result<(Vec<Record>, Vec<PathBuf>)> {
    let entries = std::fs::read_dir(dir).map_err(|e| LakehouseError::io(dir, e))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut records = Vec::with_capacity(paths.len());
    let mut skipped = Vec::new();

    for path in paths {
        match read_document(&path, rules, now) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {
                debug!(path = %path.display(), "document has no content, skipping");
                skipped.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable document, skipping");
                skipped.push(path);
            }
        }
    }

    Ok((records, skipped))
}

fn read_document(path: &Path, rules: &FingerprintRules, now: DateTime<Utc>) -> Result<Option<Record>> {
    let raw = std::fs::read_to_string(path).map_err(|e| LakehouseError::io(path, e))?;
    let doc: ScrapedDocument = serde_json::from_str(&raw)?;

    let content = match doc.content.as_deref().map(str::trim) {
        Some(c) if !c.is_empty() => c.to_string(),
        _ => return Ok(None),
    };

    let object_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut metadata = Metadata::new();
    metadata.insert("source".into(), object_name.into());
    if let Some(title) = doc.title {
        metadata.insert("title".into(), title.into());
    }

    let url = doc.url.trim().to_string();
    Ok(Some(Record {
        id: Record::derive_id(&url),
        fingerprint: lakehouse_transform::fingerprint(&content, rules),
        source_url: url,
        stage: Stage::Raw,
        content,
        metadata,
        ingested_at: now,
        stage_updated_at: now,
    }))
}

/// Land the documents in `dir` as the next RAW batch.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub async fn ingest_dir(storage: &Storage, dir: &Path, rules: &FingerprintRules) -> Result<IngestReport> {
    let (records, skipped) = read_documents(dir, rules, Utc::now())?;
    if records.is_empty() {
        return Err(LakehouseError::validation(format!(
            "no ingestible documents in {}",
            dir.display()
        )));
    }

    let batch_id = storage.next_batch_id(Stage::Raw).await?;
    let batch = Batch::new(batch_id, Stage::Raw, Stage::Raw, records);
    storage.put_batch(Stage::Raw, &batch).await?;

    info!(batch_id, records = batch.len(), skipped = skipped.len(), "raw batch landed");

    Ok(IngestReport {
        batch_id,
        records: batch.len(),
        skipped,
    })
}
