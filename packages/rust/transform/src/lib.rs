//! Pure stage transforms: RAW → CLEANED and CLEANED → CURATED.
//!
//! A transform maps an input [`Batch`] to a new batch plus an explicit list of
//! [`Rejection`]s. It performs no I/O and reads no clock: the timestamp to
//! stamp onto promoted records comes from [`TransformContext`], so the same
//! input always yields the same output.

mod cleanup;
pub mod fingerprint;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;

use lakehouse_shared::{
    Batch, FingerprintRules, LakehouseError, PipelineConfig, Record, Rejection, RejectionReason,
    Result, Stage,
};

pub use fingerprint::fingerprint;

/// Inputs a transform may depend on besides the batch itself.
#[derive(Debug, Clone)]
pub struct TransformContext {
    /// Minimum cleaned content length, in characters.
    pub min_content_length: usize,
    pub fingerprint: FingerprintRules,
    /// Value written to `stage_updated_at` on promoted records.
    pub now: DateTime<Utc>,
}

impl TransformContext {
    pub fn new(config: &PipelineConfig, now: DateTime<Utc>) -> Self {
        Self {
            min_content_length: config.min_content_length,
            fingerprint: config.fingerprint,
            now,
        }
    }
}

/// A transformed batch plus every record the transform dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub batch: Batch,
    pub rejections: Vec<Rejection>,
}

/// Transform `batch` from `stage_from` into `stage_to`.
///
/// Only adjacent forward transitions are defined. Per-record failures never
/// abort the batch; they come back as `transform_failure` rejections.
pub fn transform(
    batch: &Batch,
    stage_from: Stage,
    stage_to: Stage,
    ctx: &TransformContext,
) -> Result<TransformOutput> {
    let step: fn(&Record, &TransformContext) -> RecordResult = match (stage_from, stage_to) {
        (Stage::Raw, Stage::Cleaned) => clean_record,
        (Stage::Cleaned, Stage::Curated) => curate_record,
        _ => {
            return Err(LakehouseError::validation(format!(
                "no transform defined for {stage_from} -> {stage_to}"
            )));
        }
    };

    let mut records = Vec::with_capacity(batch.len());
    let mut rejections = Vec::new();
    let mut seen_urls: HashSet<String> = HashSet::new();

    for record in &batch.records {
        if record.stage != stage_from {
            rejections.push(rejection_from_error(
                record,
                LakehouseError::Transform {
                    record_id: record.id.clone(),
                    message: format!("record is at {}, expected {stage_from}", record.stage),
                },
            ));
            continue;
        }

        match step(record, ctx) {
            RecordResult::Kept(out) => {
                // The first copy of a URL wins, as later copies would share its id.
                if stage_to == Stage::Cleaned && !seen_urls.insert(out.source_url.clone()) {
                    rejections.push(Rejection {
                        record_id: out.id,
                        reason: RejectionReason::DuplicateSourceUrl,
                        detail: Some(out.source_url),
                    });
                    continue;
                }
                records.push(out);
            }
            RecordResult::Dropped(reason) => rejections.push(Rejection {
                record_id: record.id.clone(),
                reason,
                detail: None,
            }),
            RecordResult::Failed(err) => rejections.push(rejection_from_error(record, err)),
        }
    }

    debug!(
        batch_id = batch.batch_id,
        %stage_from,
        %stage_to,
        kept = records.len(),
        rejected = rejections.len(),
        "batch transformed"
    );

    Ok(TransformOutput {
        batch: Batch::new(batch.batch_id, stage_from, stage_to, records),
        rejections,
    })
}

enum RecordResult {
    Kept(Record),
    Dropped(RejectionReason),
    Failed(LakehouseError),
}

fn rejection_from_error(record: &Record, err: LakehouseError) -> Rejection {
    Rejection {
        record_id: record.id.clone(),
        reason: RejectionReason::TransformFailure,
        detail: Some(err.to_string()),
    }
}

fn parse_source_url(record: &Record) -> std::result::Result<Url, LakehouseError> {
    Url::parse(&record.source_url).map_err(|e| LakehouseError::Transform {
        record_id: record.id.clone(),
        message: format!("invalid source_url '{}': {e}", record.source_url),
    })
}

// ---------------------------------------------------------------------------
// RAW → CLEANED
// ---------------------------------------------------------------------------

fn clean_record(record: &Record, ctx: &TransformContext) -> RecordResult {
    if let Err(e) = parse_source_url(record) {
        return RecordResult::Failed(e);
    }

    let content = cleanup::clean_pipeline(&record.content);
    if content.chars().count() < ctx.min_content_length {
        return RecordResult::Dropped(RejectionReason::BelowMinimumLength);
    }

    RecordResult::Kept(promote(record, Stage::Cleaned, content, ctx))
}

// ---------------------------------------------------------------------------
// CLEANED → CURATED
// ---------------------------------------------------------------------------

fn curate_record(record: &Record, ctx: &TransformContext) -> RecordResult {
    let url = match parse_source_url(record) {
        Ok(url) => url,
        Err(e) => return RecordResult::Failed(e),
    };

    let content = cleanup::curate_pipeline(&record.content);
    if content.is_empty() {
        return RecordResult::Dropped(RejectionReason::EmptyAfterNormalization);
    }

    let mut out = promote(record, Stage::Curated, content, ctx);
    let content_length = out.content_len();
    let word_count = out.content.split_whitespace().count();
    out.metadata
        .insert("content_length".into(), content_length.into());
    out.metadata.insert("word_count".into(), word_count.into());
    if let Some(host) = url.host_str() {
        out.metadata
            .insert("source_domain".into(), host.to_string().into());
    }

    RecordResult::Kept(out)
}

/// Copy `record` into `stage` with new content and a fresh fingerprint.
fn promote(record: &Record, stage: Stage, content: String, ctx: &TransformContext) -> Record {
    Record {
        id: record.id.clone(),
        source_url: record.source_url.clone(),
        stage,
        fingerprint: fingerprint(&content, &ctx.fingerprint),
        content,
        metadata: record.metadata.clone(),
        ingested_at: record.ingested_at,
        stage_updated_at: ctx.now,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
