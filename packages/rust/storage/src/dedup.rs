//! Persisted dedup set, one per stage.
//!
//! Each stage's fingerprint set carries a version that is bumped by every
//! commit that adds to it. A run reads the set once, before processing, and
//! its commit only succeeds if the version is unchanged.

use std::collections::HashSet;

use lakehouse_shared::{LakehouseError, Result, Stage};
use libsql::{Connection, params};

use crate::{Storage, db_err};

/// Snapshot of a stage's dedup set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FingerprintSet {
    pub version: u64,
    pub fingerprints: HashSet<String>,
}

impl FingerprintSet {
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.fingerprints.contains(fingerprint)
    }
}

impl Storage {
    /// Read the dedup set and its version for `stage`.
    pub async fn load_fingerprints(&self, stage: Stage) -> Result<FingerprintSet> {
        let label = self.label(stage);
        let version = dedup_version_on(&self.conn, label).await?;

        let mut rows = self
            .conn
            .query(
                "SELECT fingerprint FROM dedup_fingerprints WHERE stage = ?1",
                params![label],
            )
            .await
            .map_err(db_err("load_fingerprints"))?;

        let mut fingerprints = HashSet::new();
        while let Some(row) = rows.next().await.map_err(db_err("load_fingerprints"))? {
            fingerprints.insert(row.get::<String>(0).map_err(db_err("load_fingerprints"))?);
        }

        Ok(FingerprintSet {
            version,
            fingerprints,
        })
    }
}

pub(crate) async fn dedup_version_on(conn: &Connection, label: &str) -> Result<u64> {
    let mut rows = conn
        .query(
            "SELECT version FROM dedup_versions WHERE stage = ?1",
            params![label],
        )
        .await
        .map_err(db_err("dedup_version"))?;

    match rows.next().await.map_err(db_err("dedup_version"))? {
        Some(row) => Ok(row.get::<i64>(0).map_err(db_err("dedup_version"))? as u64),
        None => Ok(0),
    }
}

/// Add fingerprints to the set after checking the version, then bump it.
pub(crate) async fn merge_fingerprints(
    conn: &Connection,
    stage: Stage,
    label: &str,
    batch_id: u64,
    fingerprints: &[String],
    expected_version: u64,
) -> Result<u64> {
    let current = dedup_version_on(conn, label).await?;
    if current != expected_version {
        return Err(LakehouseError::Conflict {
            stage,
            expected: expected_version,
        });
    }

    for fingerprint in fingerprints {
        conn.execute(
            "INSERT OR IGNORE INTO dedup_fingerprints (stage, fingerprint, batch_id) VALUES (?1, ?2, ?3)",
            params![label, fingerprint.as_str(), batch_id as i64],
        )
        .await
        .map_err(db_err("merge_fingerprints"))?;
    }

    let next = current + 1;
    conn.execute(
        "INSERT INTO dedup_versions (stage, version) VALUES (?1, ?2)
         ON CONFLICT(stage) DO UPDATE SET version = excluded.version",
        params![label, next as i64],
    )
    .await
    .map_err(db_err("merge_fingerprints"))?;

    Ok(next)
}

#[cfg(test)]
mod tests {
    use crate::test_support::test_storage;

    use super::*;

    #[tokio::test]
    async fn empty_set_has_version_zero() {
        let storage = test_storage().await;
        let set = storage.load_fingerprints(Stage::Cleaned).await.unwrap();
        assert_eq!(set.version, 0);
        assert!(set.fingerprints.is_empty());
    }

    #[tokio::test]
    async fn merge_bumps_version_and_detects_stale_writer() {
        let storage = test_storage().await;
        let label = storage.label(Stage::Cleaned).to_string();
        let fps = vec!["f1".to_string(), "f2".to_string()];

        let v = merge_fingerprints(&storage.conn, Stage::Cleaned, &label, 1, &fps, 0)
            .await
            .unwrap();
        assert_eq!(v, 1);

        let set = storage.load_fingerprints(Stage::Cleaned).await.unwrap();
        assert_eq!(set.version, 1);
        assert!(set.contains("f1") && set.contains("f2"));

        let err = merge_fingerprints(&storage.conn, Stage::Cleaned, &label, 2, &fps, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, LakehouseError::Conflict { expected: 0, .. }));
        assert!(err.is_retryable());

        // Other stages are versioned independently.
        let curated = storage.load_fingerprints(Stage::Curated).await.unwrap();
        assert_eq!(curated.version, 0);
    }
}
