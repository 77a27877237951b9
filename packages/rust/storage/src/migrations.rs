//! SQL migration definitions for the lakehouse database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: batches, records, watermarks, dedup set, lineage, index sync",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Opaque batch payloads, one per (stage, batch_id)
CREATE TABLE IF NOT EXISTS batches (
    stage        TEXT NOT NULL,
    batch_id     INTEGER NOT NULL,
    payload      BLOB NOT NULL,
    record_count INTEGER NOT NULL,
    input_digest TEXT,
    written_at   TEXT NOT NULL,
    PRIMARY KEY (stage, batch_id)
);

-- Queryable view of every stage's records; the curated rows form the curated layer
CREATE TABLE IF NOT EXISTS records (
    stage            TEXT NOT NULL,
    id               TEXT NOT NULL,
    batch_id         INTEGER NOT NULL,
    source_url       TEXT NOT NULL,
    content          TEXT NOT NULL,
    metadata_json    TEXT NOT NULL,
    fingerprint      TEXT NOT NULL,
    ingested_at      TEXT NOT NULL,
    stage_updated_at TEXT NOT NULL,
    PRIMARY KEY (stage, id)
);

CREATE INDEX IF NOT EXISTS idx_records_fingerprint ON records(stage, fingerprint);

-- Highest committed batch id per stage
CREATE TABLE IF NOT EXISTS stage_watermarks (
    stage      TEXT PRIMARY KEY,
    batch_id   INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

-- Persisted dedup set, versioned per stage
CREATE TABLE IF NOT EXISTS dedup_fingerprints (
    stage       TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    batch_id    INTEGER NOT NULL,
    PRIMARY KEY (stage, fingerprint)
);

CREATE TABLE IF NOT EXISTS dedup_versions (
    stage   TEXT PRIMARY KEY,
    version INTEGER NOT NULL
);

-- Append-only lineage log
CREATE TABLE IF NOT EXISTS lineage (
    sequence               INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id               INTEGER NOT NULL,
    stage_from             TEXT NOT NULL,
    stage_to               TEXT NOT NULL,
    input_count            INTEGER NOT NULL,
    output_count           INTEGER NOT NULL,
    rejected_count         INTEGER NOT NULL,
    dedup_collapsed_count  INTEGER NOT NULL,
    batch_fingerprint      TEXT NOT NULL,
    outcome                TEXT NOT NULL,
    rejection_reasons_json TEXT NOT NULL,
    recorded_at            TEXT NOT NULL,
    recorded_at_us         INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lineage_stage_to ON lineage(stage_to, sequence);
CREATE INDEX IF NOT EXISTS idx_lineage_batch ON lineage(batch_id);

-- Last state acknowledged by the vector index, per record
CREATE TABLE IF NOT EXISTS index_snapshot (
    record_id   TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    synced_at   TEXT NOT NULL
);

-- Named sync watermarks
CREATE TABLE IF NOT EXISTS sync_state (
    name       TEXT PRIMARY KEY,
    watermark  TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
