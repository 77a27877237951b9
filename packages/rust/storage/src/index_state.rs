//! What the vector index has acknowledged so far.
//!
//! `index_snapshot` holds one row per record the index currently serves,
//! with the fingerprint it was indexed at. `sync_state` holds named
//! watermarks over the curated layer's `stage_updated_at`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lakehouse_shared::Result;
use libsql::params;

use crate::{Storage, db_err, parse_timestamp};

impl Storage {
    /// Record id → fingerprint last acknowledged by the index.
    pub async fn load_index_snapshot(&self) -> Result<HashMap<String, String>> {
        let mut rows = self
            .conn
            .query("SELECT record_id, fingerprint FROM index_snapshot", params![])
            .await
            .map_err(db_err("load_index_snapshot"))?;

        let mut snapshot = HashMap::new();
        while let Some(row) = rows.next().await.map_err(db_err("load_index_snapshot"))? {
            snapshot.insert(
                row.get::<String>(0).map_err(db_err("load_index_snapshot"))?,
                row.get::<String>(1).map_err(db_err("load_index_snapshot"))?,
            );
        }
        Ok(snapshot)
    }

    /// Note an acknowledged upsert.
    pub async fn record_indexed(&self, record_id: &str, fingerprint: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO index_snapshot (record_id, fingerprint, synced_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(record_id) DO UPDATE SET
                   fingerprint = excluded.fingerprint,
                   synced_at = excluded.synced_at",
                params![record_id, fingerprint, now.as_str()],
            )
            .await
            .map_err(db_err("record_indexed"))?;
        Ok(())
    }

    /// Note an acknowledged delete.
    pub async fn record_unindexed(&self, record_id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM index_snapshot WHERE record_id = ?1",
                params![record_id],
            )
            .await
            .map_err(db_err("record_unindexed"))?;
        Ok(())
    }

    /// Load a named sync watermark.
    pub async fn sync_watermark(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT watermark FROM sync_state WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(db_err("sync_watermark"))?;

        match rows.next().await.map_err(db_err("sync_watermark"))? {
            Some(row) => {
                let raw: String = row.get(0).map_err(db_err("sync_watermark"))?;
                Ok(Some(parse_timestamp(&raw)?))
            }
            None => Ok(None),
        }
    }

    /// Persist a named sync watermark.
    pub async fn set_sync_watermark(&self, name: &str, watermark: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO sync_state (name, watermark, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET
                   watermark = excluded.watermark,
                   updated_at = excluded.updated_at",
                params![name, watermark.to_rfc3339(), now.as_str()],
            )
            .await
            .map_err(db_err("set_sync_watermark"))?;
        Ok(())
    }
}
