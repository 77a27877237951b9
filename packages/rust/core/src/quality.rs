//! Batch-level quality gate.
//!
//! Rules are checked in order and the first failing one decides the verdict:
//!
//! 1. fewer accepted records than `min_batch_size` → `batch_too_small`
//! 2. `(input - accepted) / input` above `max_rejection_rate` → `rejection_rate_exceeded`
//! 3. dedup collapses / input above `max_duplicate_rate` → `duplicate_rate_exceeded`
//!
//! Rule 2 counts every record that did not make it through, whether the
//! transform rejected it or dedup collapsed it. Rule 3 only bites when the
//! duplicate threshold is the tighter of the two. A rate equal to its
//! threshold passes.

use std::collections::BTreeMap;

use lakehouse_shared::{Batch, GateFailure, QualityThresholds, QualityVerdict, Rejection};

/// Judge one transition.
///
/// `before` is the batch handed to the transform, `after` is what survived
/// both the transform and dedup.
pub fn evaluate(
    before: &Batch,
    after: &Batch,
    rejections: &[Rejection],
    collapsed: usize,
    thresholds: &QualityThresholds,
) -> QualityVerdict {
    let input_count = before.len();
    let accepted_count = after.len();
    let rejected_count = rejections.len();

    let mut rejection_reasons: BTreeMap<String, usize> = BTreeMap::new();
    for rejection in rejections {
        *rejection_reasons
            .entry(rejection.reason.as_str().to_string())
            .or_default() += 1;
    }

    let dropped = input_count.saturating_sub(accepted_count);

    let failure = if accepted_count < thresholds.min_batch_size {
        Some(GateFailure::BatchTooSmall)
    } else if rate(dropped, input_count) > thresholds.max_rejection_rate {
        Some(GateFailure::RejectionRateExceeded)
    } else if rate(collapsed, input_count) > thresholds.max_duplicate_rate {
        Some(GateFailure::DuplicateRateExceeded)
    } else {
        None
    };

    QualityVerdict {
        input_count,
        accepted_count,
        rejected_count,
        collapsed_count: collapsed,
        rejection_reasons,
        overall_pass: failure.is_none(),
        failure,
    }
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use lakehouse_shared::{Metadata, Record, RejectionReason, Stage};

    use super::*;

    fn batch(n: usize) -> Batch {
        let records = (0..n)
            .map(|i| Record {
                id: format!("r{i}"),
                source_url: format!("https://example.com/{i}"),
                stage: Stage::Cleaned,
                content: format!("record {i}"),
                metadata: Metadata::new(),
                fingerprint: format!("fp{i}"),
                ingested_at: Utc::now(),
                stage_updated_at: Utc::now(),
            })
            .collect();
        Batch::new(1, Stage::Raw, Stage::Cleaned, records)
    }

    fn rejections(n: usize, reason: RejectionReason) -> Vec<Rejection> {
        (0..n)
            .map(|i| Rejection {
                record_id: format!("x{i}"),
                reason,
                detail: None,
            })
            .collect()
    }

    fn thresholds() -> QualityThresholds {
        QualityThresholds {
            max_rejection_rate: 0.2,
            max_duplicate_rate: 0.5,
            min_batch_size: 1,
        }
    }

    #[test]
    fn rejection_rate_at_threshold_passes() {
        let verdict = evaluate(
            &batch(10),
            &batch(8),
            &rejections(2, RejectionReason::BelowMinimumLength),
            0,
            &thresholds(),
        );
        assert!(verdict.overall_pass);
        assert_eq!(verdict.failure, None);
        assert_eq!(verdict.rejected_count, 2);
        assert_eq!(verdict.rejection_reasons["below_minimum_length"], 2);
    }

    #[test]
    fn rejection_rate_above_threshold_fails() {
        let verdict = evaluate(
            &batch(10),
            &batch(7),
            &rejections(3, RejectionReason::BelowMinimumLength),
            0,
            &thresholds(),
        );
        assert!(!verdict.overall_pass);
        assert_eq!(verdict.failure, Some(GateFailure::RejectionRateExceeded));
    }

    #[test]
    fn collapses_count_toward_rejection_rate() {
        let verdict = evaluate(
            &batch(10),
            &batch(7),
            &rejections(2, RejectionReason::BelowMinimumLength),
            1,
            &thresholds(),
        );
        assert!(!verdict.overall_pass);
        assert_eq!(verdict.failure, Some(GateFailure::RejectionRateExceeded));
        assert_eq!(verdict.rejected_count, 2);
        assert_eq!(verdict.collapsed_count, 1);

        let only_collapses = evaluate(&batch(10), &batch(7), &[], 3, &thresholds());
        assert_eq!(only_collapses.failure, Some(GateFailure::RejectionRateExceeded));
    }

    #[test]
    fn duplicate_rate_is_judged_when_tighter() {
        let t = QualityThresholds {
            max_rejection_rate: 0.8,
            max_duplicate_rate: 0.5,
            min_batch_size: 1,
        };
        let ok = evaluate(&batch(10), &batch(5), &[], 5, &t);
        assert!(ok.overall_pass);

        let too_many = evaluate(&batch(10), &batch(4), &[], 6, &t);
        assert_eq!(too_many.failure, Some(GateFailure::DuplicateRateExceeded));
        assert_eq!(too_many.rejected_count, 0);
        assert_eq!(too_many.collapsed_count, 6);
    }

    #[test]
    fn batch_size_is_checked_first() {
        let verdict = evaluate(
            &batch(4),
            &batch(0),
            &rejections(4, RejectionReason::EmptyAfterNormalization),
            0,
            &thresholds(),
        );
        assert_eq!(verdict.failure, Some(GateFailure::BatchTooSmall));
    }

    #[test]
    fn empty_batch_allowed_when_min_size_is_zero() {
        let mut t = thresholds();
        t.min_batch_size = 0;
        let verdict = evaluate(&batch(0), &batch(0), &[], 0, &t);
        assert!(verdict.overall_pass);
    }

    #[test]
    fn reasons_are_counted_per_kind() {
        let mut all = rejections(1, RejectionReason::TransformFailure);
        all.extend(rejections(2, RejectionReason::DuplicateSourceUrl));
        let mut t = thresholds();
        t.max_rejection_rate = 1.0;
        let verdict = evaluate(&batch(10), &batch(7), &all, 0, &t);
        assert_eq!(verdict.rejection_reasons.len(), 2);
        assert_eq!(verdict.rejection_reasons["duplicate_source_url"], 2);
        assert_eq!(verdict.rejection_reasons["transform_failure"], 1);
    }
}
