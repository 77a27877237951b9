//! Core domain types for the staged pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LakehouseError;

/// Metadata key under which collapsed duplicates are recorded.
pub const ALTERNATE_SOURCES_KEY: &str = "alternate_sources";

/// Record metadata: string keys to JSON scalars (plus `alternate_sources`).
pub type Metadata = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A quality tier in the medallion layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Raw,
    Cleaned,
    Curated,
}

impl Stage {
    /// All stages in promotion order.
    pub const ALL: [Stage; 3] = [Stage::Raw, Stage::Cleaned, Stage::Curated];

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Cleaned => "cleaned",
            Self::Curated => "curated",
        }
    }

    /// The stage records are promoted into, if any.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Raw => Some(Self::Cleaned),
            Self::Cleaned => Some(Self::Curated),
            Self::Curated => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = LakehouseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "bronze" => Ok(Self::Raw),
            "cleaned" | "silver" => Ok(Self::Cleaned),
            "curated" | "gold" => Ok(Self::Curated),
            other => Err(LakehouseError::validation(format!("unknown stage '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One scraped-and-processed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier, derived from the source URL at ingestion.
    pub id: String,
    /// Page the content was scraped from.
    pub source_url: String,
    /// Stage this copy of the record belongs to.
    pub stage: Stage,
    /// Text payload.
    pub content: String,
    /// Scalar metadata plus merged alternate sources.
    #[serde(default)]
    pub metadata: Metadata,
    /// Content hash used for dedup; recomputed whenever `content` changes.
    pub fingerprint: String,
    /// When the document entered the RAW stage.
    pub ingested_at: DateTime<Utc>,
    /// When the record last moved between stages.
    pub stage_updated_at: DateTime<Utc>,
}

impl Record {
    /// Derive the stable record id for a source URL.
    pub fn derive_id(source_url: &str) -> String {
        let digest = Sha256::digest(source_url.trim().as_bytes());
        digest[..16].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Number of characters in the content payload.
    pub fn content_len(&self) -> usize {
        self.content.chars().count()
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// An ordered set of records produced together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    /// Monotonic sequence number per stage.
    pub batch_id: u64,
    pub source_stage: Stage,
    pub target_stage: Stage,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(batch_id: u64, source_stage: Stage, target_stage: Stage, records: Vec<Record>) -> Self {
        Self {
            batch_id,
            source_stage,
            target_stage,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Digest over each record's id, source URL, content and metadata, in
    /// batch order.
    ///
    /// Two submissions of the same `batch_id` are "the same batch" iff their
    /// digests match. Fingerprints and timestamps are derived or incidental
    /// and left out.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for record in &self.records {
            hasher.update(record.id.as_bytes());
            hasher.update([0]);
            hasher.update(record.source_url.as_bytes());
            hasher.update([0]);
            hasher.update(record.content.as_bytes());
            hasher.update([0]);
            for (key, value) in &record.metadata {
                hasher.update(key.as_bytes());
                hasher.update([1]);
                hasher.update(value.to_string().as_bytes());
                hasher.update([2]);
            }
            hasher.update([0xff]);
        }
        format!("{:x}", hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Rejections and quality verdicts
// ---------------------------------------------------------------------------

/// Why a record was dropped by a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    BelowMinimumLength,
    EmptyAfterNormalization,
    DuplicateSourceUrl,
    TransformFailure,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BelowMinimumLength => "below_minimum_length",
            Self::EmptyAfterNormalization => "empty_after_normalization",
            Self::DuplicateSourceUrl => "duplicate_source_url",
            Self::TransformFailure => "transform_failure",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An explicit per-record rejection reported to the quality gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub record_id: String,
    pub reason: RejectionReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Batch-level reason for a failed gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateFailure {
    BatchTooSmall,
    RejectionRateExceeded,
    DuplicateRateExceeded,
}

impl GateFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BatchTooSmall => "batch_too_small",
            Self::RejectionRateExceeded => "rejection_rate_exceeded",
            Self::DuplicateRateExceeded => "duplicate_rate_exceeded",
        }
    }
}

impl fmt::Display for GateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-batch result of the quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub input_count: usize,
    pub accepted_count: usize,
    pub rejected_count: usize,
    pub collapsed_count: usize,
    pub rejection_reasons: BTreeMap<String, usize>,
    pub overall_pass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<GateFailure>,
}

// ---------------------------------------------------------------------------
// Lineage
// ---------------------------------------------------------------------------

/// Result of one stage transition as recorded in lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Committed,
    Rejected,
}

impl TransitionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for TransitionOutcome {
    type Err = LakehouseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "committed" => Ok(Self::Committed),
            "rejected" => Ok(Self::Rejected),
            other => Err(LakehouseError::validation(format!("unknown outcome '{other}'"))),
        }
    }
}

/// Immutable audit record of one stage transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    /// Log position, assigned by the recorder on append (0 before that).
    #[serde(default)]
    pub sequence: u64,
    pub batch_id: u64,
    pub stage_from: Stage,
    pub stage_to: Stage,
    pub input_count: usize,
    pub output_count: usize,
    pub rejected_count: usize,
    pub dedup_collapsed_count: usize,
    /// Digest of the input batch ([`Batch::digest`]).
    pub batch_fingerprint: String,
    pub outcome: TransitionOutcome,
    #[serde(default)]
    pub rejection_reasons: BTreeMap<String, usize>,
    pub timestamp: DateTime<Utc>,
}

impl LineageEntry {
    /// One-line human summary for the scheduler.
    pub fn summary(&self) -> String {
        format!(
            "batch {} {} -> {} {}: in={} out={} rejected={} collapsed={}",
            self.batch_id,
            self.stage_from,
            self.stage_to,
            self.outcome.as_str(),
            self.input_count,
            self.output_count,
            self.rejected_count,
            self.dedup_collapsed_count,
        )
    }
}

// ---------------------------------------------------------------------------
// Index delta
// ---------------------------------------------------------------------------

/// A curated record to be (re-)embedded and indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub fingerprint: String,
}

/// Operations needed to bring the vector index in line with the curated layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexDelta {
    /// Documents to upsert, ordered by id.
    pub upserts: Vec<IndexDocument>,
    /// Record ids to delete.
    pub deletes: BTreeSet<String>,
    /// Newest `stage_updated_at` seen while computing the delta.
    pub high_watermark: Option<DateTime<Utc>>,
}

impl IndexDelta {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    pub fn upsert_ids(&self) -> BTreeSet<&str> {
        self.upserts.iter().map(|d| d.id.as_str()).collect()
    }
}
