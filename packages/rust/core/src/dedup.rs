//! Fingerprint-based duplicate collapsing.

use std::collections::{HashMap, HashSet};

use lakehouse_shared::{ALTERNATE_SOURCES_KEY, Batch, FingerprintRules, Record};
use serde_json::{Value, json};

/// A deduplicated batch plus what the commit needs to know about it.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutput {
    pub batch: Batch,
    /// Records dropped as duplicates, within the batch or against `known`.
    pub collapsed_count: usize,
    /// Fingerprints of the kept records, in batch order.
    pub fingerprints: Vec<String>,
}

/// Drop records whose content fingerprint was already seen.
///
/// A record is a duplicate if its fingerprint is in `known` (the target
/// stage's persisted set) or belongs to an earlier record of the same batch.
/// The first record in batch order wins. Intra-batch duplicates are folded
/// into the winner's `alternate_sources`; cross-batch duplicates are only
/// counted, as their winner is already committed.
pub fn dedupe(batch: Batch, known: &HashSet<String>, rules: &FingerprintRules) -> DedupOutput {
    let Batch {
        batch_id,
        source_stage,
        target_stage,
        records,
    } = batch;

    let mut kept: Vec<Record> = Vec::with_capacity(records.len());
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut collapsed_count = 0;

    for mut record in records {
        let fp = lakehouse_transform::fingerprint(&record.content, rules);
        record.fingerprint = fp.clone();

        if known.contains(&fp) {
            tracing::debug!(id = %record.id, fingerprint = %fp, "duplicate of committed record");
            collapsed_count += 1;
            continue;
        }

        match position.get(&fp) {
            Some(&idx) => {
                merge_alternate(&mut kept[idx], record);
                collapsed_count += 1;
            }
            None => {
                position.insert(fp, kept.len());
                kept.push(record);
            }
        }
    }

    let fingerprints = kept.iter().map(|r| r.fingerprint.clone()).collect();

    DedupOutput {
        batch: Batch::new(batch_id, source_stage, target_stage, kept),
        collapsed_count,
        fingerprints,
    }
}

/// Record `dup` (and anything it had already absorbed) on `winner`.
fn merge_alternate(winner: &mut Record, mut dup: Record) {
    let inherited = match dup.metadata.remove(ALTERNATE_SOURCES_KEY) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };

    let entry = json!({
        "source_url": dup.source_url,
        "id": dup.id,
        "metadata": dup.metadata,
    });

    let slot = winner
        .metadata
        .entry(ALTERNATE_SOURCES_KEY.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    if let Value::Array(list) = slot {
        list.push(entry);
        list.extend(inherited);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use lakehouse_shared::{Metadata, Stage};

    use super::*;

    fn record(url: &str, content: &str) -> Record {
        Record {
            id: Record::derive_id(url),
            source_url: url.into(),
            stage: Stage::Cleaned,
            content: content.into(),
            metadata: Metadata::from([("title".to_string(), json!(url))]),
            fingerprint: String::new(),
            ingested_at: Utc::now(),
            stage_updated_at: Utc::now(),
        }
    }

    fn batch(records: Vec<Record>) -> Batch {
        Batch::new(1, Stage::Raw, Stage::Cleaned, records)
    }

    #[test]
    fn collapses_intra_batch_duplicate() {
        let rules = FingerprintRules::default();
        let input = batch(vec![
            record("https://a.example/1", "same text"),
            record("https://b.example/1", "same text"),
            record("https://c.example/1", "other text"),
        ]);

        let out = dedupe(input, &HashSet::new(), &rules);

        assert_eq!(out.batch.len(), 2);
        assert_eq!(out.collapsed_count, 1);
        assert_eq!(out.fingerprints.len(), 2);
        assert_ne!(out.fingerprints[0], out.fingerprints[1]);

        let winner = &out.batch.records[0];
        assert_eq!(winner.source_url, "https://a.example/1");
        let alternates = winner.metadata[ALTERNATE_SOURCES_KEY].as_array().unwrap();
        assert_eq!(alternates.len(), 1);
        assert_eq!(alternates[0]["source_url"], "https://b.example/1");
        assert_eq!(alternates[0]["metadata"]["title"], "https://b.example/1");
        assert!(!out.batch.records[1].metadata.contains_key(ALTERNATE_SOURCES_KEY));
    }

    #[test]
    fn drops_records_already_committed() {
        let rules = FingerprintRules::default();
        let known: HashSet<String> =
            [lakehouse_transform::fingerprint("seen before", &rules)].into();
        let input = batch(vec![
            record("https://a.example/1", "seen before"),
            record("https://b.example/1", "brand new"),
        ]);

        let out = dedupe(input, &known, &rules);

        assert_eq!(out.batch.len(), 1);
        assert_eq!(out.batch.records[0].content, "brand new");
        assert_eq!(out.collapsed_count, 1);
        assert!(!out.batch.records[0].metadata.contains_key(ALTERNATE_SOURCES_KEY));
    }

    #[test]
    fn alternates_are_flattened() {
        let rules = FingerprintRules::default();
        let mut carrier = record("https://b.example/1", "same text");
        carrier.metadata.insert(
            ALTERNATE_SOURCES_KEY.into(),
            json!([{ "source_url": "https://z.example/1", "id": "z", "metadata": {} }]),
        );
        let input = batch(vec![record("https://a.example/1", "same text"), carrier]);

        let out = dedupe(input, &HashSet::new(), &rules);

        let alternates = out.batch.records[0].metadata[ALTERNATE_SOURCES_KEY]
            .as_array()
            .unwrap();
        let urls: Vec<&str> = alternates
            .iter()
            .map(|a| a["source_url"].as_str().unwrap())
            .collect();
        assert_eq!(urls, vec!["https://b.example/1", "https://z.example/1"]);
        assert!(alternates[0]["metadata"].get(ALTERNATE_SOURCES_KEY).is_none());
    }

    #[test]
    fn whitespace_variants_collapse_case_variants_do_not() {
        let rules = FingerprintRules::default();
        let input = batch(vec![
            record("https://a.example/1", "Alpha  beta"),
            record("https://b.example/1", "Alpha beta"),
            record("https://c.example/1", "alpha beta"),
        ]);

        let out = dedupe(input, &HashSet::new(), &rules);
        assert_eq!(out.batch.len(), 2);
        assert_eq!(out.collapsed_count, 1);
    }
}
