//! Batch promotion: RAW → CLEANED → CURATED.
//!
//! Each step moves one batch through `Fetched → Transformed → Gated` and ends
//! in `Committed` or `Rejected`. Cancellation is honoured up to the moment
//! before anything is written; a step that got that far runs to completion.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use lakehouse_shared::{
    Batch, LakehouseError, LineageEntry, PipelineConfig, QualityVerdict, Result, Stage,
    TransitionOutcome,
};
use lakehouse_storage::{CommitOutcome, LineageFilter, StageCommit, Storage};
use lakehouse_transform::TransformContext;

use crate::dedup::dedupe;
use crate::quality::evaluate;

// ---------------------------------------------------------------------------
// Step and run reports
// ---------------------------------------------------------------------------

/// Where a step currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Fetched,
    Transformed,
    Gated,
    Committed,
    Rejected,
}

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Committed,
    /// Already committed with the same input; nothing was written.
    Replayed,
    Rejected,
}

/// Outcome of one stage transition.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub batch_id: u64,
    pub stage_from: Stage,
    pub stage_to: Stage,
    pub status: StepStatus,
    /// `None` for replayed steps.
    pub verdict: Option<QualityVerdict>,
    /// The lineage entry written (or, on replay, the one written originally).
    pub lineage: Option<LineageEntry>,
}

/// Terminal status handed back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Committed,
    Rejected,
    FailedRetryable,
    FailedFatal,
}

impl RunStatus {
    /// Classify an error that aborted a run.
    pub fn for_error(err: &LakehouseError) -> Self {
        if err.is_retryable() {
            Self::FailedRetryable
        } else {
            Self::FailedFatal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Rejected => "rejected",
            Self::FailedRetryable => "failed-retryable",
            Self::FailedFatal => "failed-fatal",
        }
    }
}

/// Result of running one RAW batch through every stage.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub batch_id: u64,
    pub status: RunStatus,
    pub steps: Vec<StepReport>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunReport {
    /// Lineage view of the whole run: first step's input, last step's output,
    /// summed rejections and collapses.
    pub fn summary(&self) -> Option<LineageEntry> {
        let entries: Vec<&LineageEntry> =
            self.steps.iter().filter_map(|s| s.lineage.as_ref()).collect();
        let first = entries.first()?;
        let last = entries.last()?;

        let mut rejection_reasons = first.rejection_reasons.clone();
        for entry in &entries[1..] {
            for (reason, count) in &entry.rejection_reasons {
                *rejection_reasons.entry(reason.clone()).or_default() += count;
            }
        }

        Some(LineageEntry {
            sequence: last.sequence,
            batch_id: self.batch_id,
            stage_from: first.stage_from,
            stage_to: last.stage_to,
            input_count: first.input_count,
            output_count: last.output_count,
            rejected_count: entries.iter().map(|e| e.rejected_count).sum(),
            dedup_collapsed_count: entries.iter().map(|e| e.dedup_collapsed_count).sum(),
            batch_fingerprint: first.batch_fingerprint.clone(),
            outcome: last.outcome,
            rejection_reasons,
            timestamp: last.timestamp,
        })
    }

    /// Human-readable line for the scheduler.
    pub fn summary_line(&self) -> String {
        match self.summary() {
            Some(entry) => entry.summary(),
            None => format!("batch {}: no transitions recorded", self.batch_id),
        }
    }

    /// Turn a rejected run into a [`LakehouseError::QualityGateFailure`].
    pub fn ensure_committed(&self) -> Result<()> {
        if self.status != RunStatus::Rejected {
            return Ok(());
        }
        let step = self.steps.iter().find(|s| s.status == StepStatus::Rejected);
        let (stage_from, stage_to, reason) = match step {
            Some(s) => (
                s.stage_from,
                s.stage_to,
                s.verdict
                    .as_ref()
                    .and_then(|v| v.failure)
                    .map_or("rejected", |f| f.as_str())
                    .to_string(),
            ),
            None => (Stage::Raw, Stage::Curated, "rejected".to_string()),
        };
        Err(LakehouseError::QualityGateFailure {
            batch_id: self.batch_id,
            stage_from,
            stage_to,
            reason,
        })
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a step enters a new state.
    fn step_state(&self, batch_id: u64, stage_to: Stage, state: StepState);
    /// Called when a step finishes.
    fn step_done(&self, report: &StepReport);
    /// Called when a run completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn step_state(&self, _batch_id: u64, _stage_to: Stage, _state: StepState) {}
    fn step_done(&self, _report: &StepReport) {}
    fn done(&self, _report: &RunReport) {}
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Drives RAW batches through the stages against one [`Storage`].
pub struct Coordinator<'a> {
    storage: &'a Storage,
    config: PipelineConfig,
    progress: &'a dyn ProgressReporter,
    cancel: CancellationToken,
}

/// Output of one step: the report plus the batch the next step starts from.
struct StepOutput {
    report: StepReport,
    batch: Option<Batch>,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        storage: &'a Storage,
        config: PipelineConfig,
        progress: &'a dyn ProgressReporter,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            storage,
            config,
            progress,
            cancel: CancellationToken::new(),
        })
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one RAW batch through every stage.
    ///
    /// A gate rejection is a normal outcome (`RunStatus::Rejected`); errors
    /// are reserved for failures the scheduler must classify with
    /// [`RunStatus::for_error`].
    #[instrument(skip_all, fields(batch_id = batch_id))]
    pub async fn run_batch(&self, batch_id: u64) -> Result<RunReport> {
        let start = Instant::now();
        info!(batch_id, "starting pipeline run");

        let mut current = self
            .bounded("get_batch", self.storage.get_batch(Stage::Raw, batch_id))
            .await?
            .ok_or_else(|| LakehouseError::validation(format!("raw batch {batch_id} not found")))?;

        let mut steps = Vec::new();
        let mut status = RunStatus::Committed;
        let mut stage = Stage::Raw;

        while let Some(next) = stage.next() {
            let out = self.run_step(&current, stage, next).await?;
            self.progress.step_done(&out.report);
            let rejected = out.report.status == StepStatus::Rejected;
            steps.push(out.report);

            match out.batch {
                Some(batch) if !rejected => current = batch,
                _ => {
                    status = RunStatus::Rejected;
                    break;
                }
            }
            stage = next;
        }

        let report = RunReport {
            batch_id,
            status,
            steps,
            elapsed: start.elapsed(),
        };

        self.progress.done(&report);
        info!(
            batch_id,
            status = report.status.as_str(),
            elapsed_ms = report.elapsed.as_millis(),
            summary = %report.summary_line(),
            "pipeline run complete"
        );
        Ok(report)
    }

    /// Run every RAW batch that has not reached CURATED yet, oldest first.
    ///
    /// A batch whose last transition was rejected is skipped while the input
    /// of that transition is unchanged, unless `retry_rejected` is set.
    ///
    /// Stops at the first error; reports of finished runs are lost with it,
    /// but their lineage is already durable.
    pub async fn run_pending(&self, retry_rejected: bool) -> Result<Vec<RunReport>> {
        let raw_ids = self
            .bounded("list_batches", self.storage.list_batches(Stage::Raw))
            .await?;

        let mut reports = Vec::new();
        for batch_id in raw_ids {
            let done = self
                .bounded("stored_batch", self.storage.stored_batch(Stage::Curated, batch_id))
                .await?;
            if done.is_some() {
                continue;
            }
            if !retry_rejected && self.rejected_unchanged(batch_id).await? {
                debug!(batch_id, "skipping batch rejected with unchanged input");
                continue;
            }
            reports.push(self.run_batch(batch_id).await?);
        }
        Ok(reports)
    }

    /// Whether the latest transition of `batch_id` was rejected and its input
    /// batch still has the digest that was judged.
    async fn rejected_unchanged(&self, batch_id: u64) -> Result<bool> {
        let Some(last) = self
            .bounded("latest_lineage", self.storage.latest_lineage(batch_id))
            .await?
        else {
            return Ok(false);
        };
        if last.outcome != TransitionOutcome::Rejected {
            return Ok(false);
        }

        let input = self
            .bounded("get_batch", self.storage.get_batch(last.stage_from, batch_id))
            .await?;
        Ok(input.is_some_and(|batch| batch.digest() == last.batch_fingerprint))
    }

    #[instrument(skip_all, fields(batch_id = input.batch_id, stage_from = %stage_from, stage_to = %stage_to))]
    async fn run_step(&self, input: &Batch, stage_from: Stage, stage_to: Stage) -> Result<StepOutput> {
        let batch_id = input.batch_id;
        self.check_cancelled("transform")?;
        self.progress.step_state(batch_id, stage_to, StepState::Fetched);

        let input_digest = input.digest();
        if let Some(out) = self.replay(input, &input_digest, stage_from, stage_to).await? {
            return Ok(out);
        }

        let known = self
            .bounded("load_fingerprints", self.storage.load_fingerprints(stage_to))
            .await?;

        // --- Transform ---
        let ctx = TransformContext::new(&self.config, Utc::now());
        let transformed = lakehouse_transform::transform(input, stage_from, stage_to, &ctx)?;
        self.progress.step_state(batch_id, stage_to, StepState::Transformed);

        // --- Dedup + gate ---
        let deduped = dedupe(transformed.batch, &known.fingerprints, &self.config.fingerprint);
        let verdict = evaluate(
            input,
            &deduped.batch,
            &transformed.rejections,
            deduped.collapsed_count,
            &self.config.thresholds,
        );
        self.progress.step_state(batch_id, stage_to, StepState::Gated);

        self.check_cancelled("commit")?;

        let outcome = if verdict.overall_pass {
            TransitionOutcome::Committed
        } else {
            TransitionOutcome::Rejected
        };
        let entry = LineageEntry {
            sequence: 0,
            batch_id,
            stage_from,
            stage_to,
            input_count: verdict.input_count,
            output_count: if verdict.overall_pass { verdict.accepted_count } else { 0 },
            rejected_count: verdict.rejected_count,
            dedup_collapsed_count: verdict.collapsed_count,
            batch_fingerprint: input_digest.clone(),
            outcome,
            rejection_reasons: verdict.rejection_reasons.clone(),
            timestamp: Utc::now(),
        };

        if !verdict.overall_pass {
            let sequence = self
                .bounded("append_lineage", self.storage.append_lineage(&entry))
                .await?;
            warn!(
                batch_id,
                %stage_to,
                failure = verdict.failure.map(|f| f.as_str()),
                rejected = verdict.rejected_count,
                collapsed = verdict.collapsed_count,
                "quality gate rejected batch"
            );
            self.progress.step_state(batch_id, stage_to, StepState::Rejected);
            return Ok(StepOutput {
                report: StepReport {
                    batch_id,
                    stage_from,
                    stage_to,
                    status: StepStatus::Rejected,
                    verdict: Some(verdict),
                    lineage: Some(LineageEntry { sequence, ..entry }),
                },
                batch: None,
            });
        }

        // --- Commit ---
        let promoted = deduped.batch;
        let commit = StageCommit {
            batch: &promoted,
            input_digest: &input_digest,
            lineage: &entry,
            new_fingerprints: &deduped.fingerprints,
            expected_version: known.version,
        };
        let (status, lineage) = match self
            .bounded("commit_stage", self.storage.commit_stage(commit))
            .await?
        {
            CommitOutcome::Committed(entry) => (StepStatus::Committed, Some(entry)),
            CommitOutcome::AlreadyCommitted(_) => (
                StepStatus::Replayed,
                self.committed_lineage(batch_id, stage_to).await?,
            ),
        };
        self.progress.step_state(batch_id, stage_to, StepState::Committed);

        info!(
            batch_id,
            %stage_to,
            accepted = verdict.accepted_count,
            rejected = verdict.rejected_count,
            collapsed = verdict.collapsed_count,
            "stage promoted"
        );

        Ok(StepOutput {
            report: StepReport {
                batch_id,
                stage_from,
                stage_to,
                status,
                verdict: Some(verdict),
                lineage,
            },
            batch: Some(promoted),
        })
    }

    /// Detect a step whose target batch is already committed.
    async fn replay(
        &self,
        input: &Batch,
        input_digest: &str,
        stage_from: Stage,
        stage_to: Stage,
    ) -> Result<Option<StepOutput>> {
        let batch_id = input.batch_id;
        let Some(stored) = self
            .bounded("stored_batch", self.storage.stored_batch(stage_to, batch_id))
            .await?
        else {
            return Ok(None);
        };

        if stored.input_digest.as_deref() != Some(input_digest) {
            return Err(LakehouseError::ConsistencyViolation {
                batch_id,
                stage: stage_to,
                details: format!(
                    "input digest {input_digest} does not match committed digest {}",
                    stored.input_digest.as_deref().unwrap_or("<none>")
                ),
            });
        }

        let batch = self
            .bounded("get_batch", self.storage.get_batch(stage_to, batch_id))
            .await?;
        let lineage = self.committed_lineage(batch_id, stage_to).await?;
        info!(batch_id, %stage_to, "step already committed, replaying");
        self.progress.step_state(batch_id, stage_to, StepState::Committed);

        Ok(Some(StepOutput {
            report: StepReport {
                batch_id,
                stage_from,
                stage_to,
                status: StepStatus::Replayed,
                verdict: None,
                lineage,
            },
            batch,
        }))
    }

    /// The lineage entry of the original commit of `(stage_to, batch_id)`.
    async fn committed_lineage(&self, batch_id: u64, stage_to: Stage) -> Result<Option<LineageEntry>> {
        let filter = LineageFilter {
            stage_to: Some(stage_to),
            outcome: Some(TransitionOutcome::Committed),
            min_batch_id: Some(batch_id),
            max_batch_id: Some(batch_id),
            limit: Some(1),
            ..Default::default()
        };
        let mut cursor = self.storage.query_lineage(filter);
        self.bounded("query_lineage", cursor.next()).await
    }

    fn check_cancelled(&self, boundary: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            info!(boundary, "run cancelled");
            return Err(LakehouseError::Cancelled {
                boundary: boundary.to_string(),
            });
        }
        Ok(())
    }

    async fn bounded<T>(&self, operation: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_timeout(self.config.io_timeout, operation, fut).await
    }
}

/// Run `fut`, mapping an elapsed timeout to a retryable storage error.
pub async fn with_timeout<T>(
    timeout: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(LakehouseError::storage(
            operation,
            format!("timed out after {}ms", timeout.as_millis()),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use lakehouse_shared::{GateFailure, Metadata, QualityThresholds, Record};
    use uuid::Uuid;

    use super::*;

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("lakehouse_core_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn raw(url: &str, content: &str) -> Record {
        let now = Utc::now();
        Record {
            id: Record::derive_id(url),
            source_url: url.into(),
            stage: Stage::Raw,
            content: content.into(),
            metadata: Metadata::new(),
            fingerprint: String::new(),
            ingested_at: now,
            stage_updated_at: now,
        }
    }

    /// Five records: one too short, two that only differ by case.
    fn scenario_batch(batch_id: u64) -> Batch {
        Batch::new(
            batch_id,
            Stage::Raw,
            Stage::Raw,
            vec![
                raw("https://docs.example.com/a", "<p>Rust pipelines move records through stages, with care.</p>"),
                raw("https://docs.example.com/b", "RUST PIPELINES move records through stages, with care."),
                raw("https://docs.example.com/c", "Quality gates keep bad batches out of the curated layer."),
                raw("https://docs.example.com/d", "Lineage entries make every promotion auditable later on."),
                raw("https://docs.example.com/e", "<b>tiny</b>"),
            ],
        )
    }

    /// Passes the scenario: 5 → 4 (rate 0.2), then 4 → 3 (rate 0.25).
    fn config() -> PipelineConfig {
        PipelineConfig {
            min_content_length: 20,
            thresholds: QualityThresholds {
                max_rejection_rate: 0.25,
                max_duplicate_rate: 0.5,
                min_batch_size: 1,
            },
            ..PipelineConfig::default()
        }
    }

    async fn lineage_of(storage: &Storage) -> Vec<LineageEntry> {
        storage
            .query_lineage(LineageFilter::default())
            .collect_all()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn end_to_end_scenario() {
        let storage = test_storage().await;
        storage.put_batch(Stage::Raw, &scenario_batch(1)).await.unwrap();

        let coordinator = Coordinator::new(&storage, config(), &SilentProgress).unwrap();
        let report = coordinator.run_batch(1).await.unwrap();

        assert_eq!(report.status, RunStatus::Committed);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(storage.list_records(Stage::Cleaned).await.unwrap().len(), 4);
        assert_eq!(storage.list_records(Stage::Curated).await.unwrap().len(), 3);

        let summary = report.summary().unwrap();
        assert_eq!(summary.input_count, 5);
        assert_eq!(summary.output_count, 3);
        assert_eq!(summary.rejected_count, 1);
        assert_eq!(summary.dedup_collapsed_count, 1);
        assert_eq!(
            report.summary_line(),
            "batch 1 raw -> curated committed: in=5 out=3 rejected=1 collapsed=1"
        );
        assert!(report.ensure_committed().is_ok());

        let curated = storage.get_batch(Stage::Curated, 1).await.unwrap().unwrap();
        let winner = &curated.records[0];
        assert_eq!(winner.content, "rust pipelines move records through stages, with care.");
        let alternates = winner.metadata["alternate_sources"].as_array().unwrap();
        assert_eq!(alternates[0]["source_url"], "https://docs.example.com/b");
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let storage = test_storage().await;
        storage.put_batch(Stage::Raw, &scenario_batch(1)).await.unwrap();
        let coordinator = Coordinator::new(&storage, config(), &SilentProgress).unwrap();

        let first = coordinator.run_batch(1).await.unwrap();
        let second = coordinator.run_batch(1).await.unwrap();

        assert!(second.steps.iter().all(|s| s.status == StepStatus::Replayed));
        assert_eq!(second.status, RunStatus::Committed);
        assert_eq!(first.summary_line(), second.summary_line());

        let lineage = storage
            .query_lineage(LineageFilter::default())
            .collect_all()
            .await
            .unwrap();
        assert_eq!(lineage.len(), 2);
        assert_eq!(storage.load_fingerprints(Stage::Cleaned).await.unwrap().version, 1);
        assert_eq!(storage.list_records(Stage::Curated).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_gate_writes_lineage_only() {
        let storage = test_storage().await;
        storage.put_batch(Stage::Raw, &scenario_batch(1)).await.unwrap();

        let strict = PipelineConfig {
            thresholds: QualityThresholds {
                max_rejection_rate: 0.1,
                ..QualityThresholds::default()
            },
            ..config()
        };
        let coordinator = Coordinator::new(&storage, strict, &SilentProgress).unwrap();
        let report = coordinator.run_batch(1).await.unwrap();

        assert_eq!(report.status, RunStatus::Rejected);
        assert_eq!(report.steps.len(), 1);
        assert!(storage.get_batch(Stage::Cleaned, 1).await.unwrap().is_none());
        assert!(storage.list_records(Stage::Cleaned).await.unwrap().is_empty());
        assert!(storage.load_fingerprints(Stage::Cleaned).await.unwrap().fingerprints.is_empty());
        assert_eq!(storage.watermark(Stage::Cleaned).await.unwrap(), None);

        let lineage = storage
            .query_lineage(LineageFilter::default())
            .collect_all()
            .await
            .unwrap();
        assert_eq!(lineage.len(), 1);
        assert_eq!(lineage[0].outcome, TransitionOutcome::Rejected);
        assert_eq!(lineage[0].output_count, 0);

        let err = report.ensure_committed().unwrap_err();
        assert!(matches!(err, LakehouseError::QualityGateFailure { .. }));
        assert!(err.to_string().contains("rejection_rate_exceeded"));
        assert_eq!(RunStatus::for_error(&err), RunStatus::FailedRetryable);
    }

    #[tokio::test]
    async fn changed_input_for_committed_batch_is_fatal() {
        let storage = test_storage().await;
        storage.put_batch(Stage::Raw, &scenario_batch(1)).await.unwrap();
        let coordinator = Coordinator::new(&storage, config(), &SilentProgress).unwrap();
        coordinator.run_batch(1).await.unwrap();

        let mut changed = scenario_batch(1);
        changed.records[2].content = "Quality gates were rewritten after the first commit happened.".into();
        storage.put_batch(Stage::Raw, &changed).await.unwrap();

        let err = coordinator.run_batch(1).await.unwrap_err();
        assert!(matches!(err, LakehouseError::ConsistencyViolation { stage: Stage::Cleaned, .. }));
        assert_eq!(RunStatus::for_error(&err), RunStatus::FailedFatal);
    }

    #[tokio::test]
    async fn changed_metadata_for_committed_batch_is_fatal() {
        let storage = test_storage().await;
        storage.put_batch(Stage::Raw, &scenario_batch(1)).await.unwrap();
        let coordinator = Coordinator::new(&storage, config(), &SilentProgress).unwrap();
        coordinator.run_batch(1).await.unwrap();

        let mut retitled = scenario_batch(1);
        retitled.records[0]
            .metadata
            .insert("title".into(), serde_json::json!("Pipelines, revised"));
        storage.put_batch(Stage::Raw, &retitled).await.unwrap();

        let err = coordinator.run_batch(1).await.unwrap_err();
        assert!(matches!(err, LakehouseError::ConsistencyViolation { stage: Stage::Cleaned, .. }));
    }

    /// Cancels the run as soon as the cleaned step has been gated.
    struct CancelAtGate {
        token: CancellationToken,
        seen: Mutex<Vec<StepState>>,
    }

    impl ProgressReporter for CancelAtGate {
        fn step_state(&self, _batch_id: u64, _stage_to: Stage, state: StepState) {
            self.seen.lock().unwrap().push(state);
            if state == StepState::Gated {
                self.token.cancel();
            }
        }
        fn step_done(&self, _report: &StepReport) {}
        fn done(&self, _report: &RunReport) {}
    }

    #[tokio::test]
    async fn cancellation_before_commit_writes_nothing() {
        let storage = test_storage().await;
        storage.put_batch(Stage::Raw, &scenario_batch(1)).await.unwrap();

        let token = CancellationToken::new();
        let progress = CancelAtGate {
            token: token.clone(),
            seen: Mutex::new(Vec::new()),
        };
        let coordinator = Coordinator::new(&storage, config(), &progress)
            .unwrap()
            .with_cancellation(token);

        let err = coordinator.run_batch(1).await.unwrap_err();
        assert!(matches!(err, LakehouseError::Cancelled { ref boundary } if boundary == "commit"));
        assert!(err.is_retryable());

        assert!(storage.get_batch(Stage::Cleaned, 1).await.unwrap().is_none());
        assert!(storage.query_lineage(LineageFilter::default()).collect_all().await.unwrap().is_empty());
        assert_eq!(storage.load_fingerprints(Stage::Cleaned).await.unwrap().version, 0);
        assert_eq!(
            *progress.seen.lock().unwrap(),
            vec![StepState::Fetched, StepState::Transformed, StepState::Gated]
        );
    }

    #[tokio::test]
    async fn cross_batch_duplicates_are_collapsed() {
        let storage = test_storage().await;
        storage.put_batch(Stage::Raw, &scenario_batch(1)).await.unwrap();

        let repeat = Batch::new(
            2,
            Stage::Raw,
            Stage::Raw,
            vec![
                raw("https://mirror.example.com/c", "Quality gates keep bad batches out of the curated layer."),
                raw("https://docs.example.com/f", "Fresh content arrives with the second batch of the day."),
            ],
        );
        storage.put_batch(Stage::Raw, &repeat).await.unwrap();

        // Batch 2 loses half its records to the collapse.
        let lenient = PipelineConfig {
            thresholds: QualityThresholds {
                max_rejection_rate: 0.5,
                ..config().thresholds
            },
            ..config()
        };
        let coordinator = Coordinator::new(&storage, lenient, &SilentProgress).unwrap();
        let reports = coordinator.run_pending(false).await.unwrap();
        assert_eq!(reports.len(), 2);

        let second = reports[1].summary().unwrap();
        assert_eq!(second.input_count, 2);
        assert_eq!(second.output_count, 1);
        assert_eq!(second.dedup_collapsed_count, 1);
        assert_eq!(storage.list_records(Stage::Curated).await.unwrap().len(), 4);

        assert!(coordinator.run_pending(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn curated_gate_failure_keeps_cleaned_commit_only() {
        let storage = test_storage().await;
        storage.put_batch(Stage::Raw, &scenario_batch(1)).await.unwrap();

        // The curated step collapses 1 of 4 records: within the rejection
        // rate, above the duplicate rate.
        let strict_duplicates = PipelineConfig {
            thresholds: QualityThresholds {
                max_duplicate_rate: 0.1,
                ..config().thresholds
            },
            ..config()
        };
        let coordinator = Coordinator::new(&storage, strict_duplicates, &SilentProgress).unwrap();
        let report = coordinator.run_batch(1).await.unwrap();

        assert_eq!(report.status, RunStatus::Rejected);
        let statuses: Vec<StepStatus> = report.steps.iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![StepStatus::Committed, StepStatus::Rejected]);
        let curated_verdict = report.steps[1].verdict.as_ref().unwrap();
        assert_eq!(curated_verdict.failure, Some(GateFailure::DuplicateRateExceeded));

        assert_eq!(storage.list_records(Stage::Cleaned).await.unwrap().len(), 4);
        assert!(storage.list_records(Stage::Curated).await.unwrap().is_empty());
        assert!(storage.get_batch(Stage::Curated, 1).await.unwrap().is_none());
        let curated_set = storage.load_fingerprints(Stage::Curated).await.unwrap();
        assert!(curated_set.fingerprints.is_empty());
        assert_eq!(curated_set.version, 0);
        assert_eq!(storage.watermark(Stage::Curated).await.unwrap(), None);

        let lineage = lineage_of(&storage).await;
        assert_eq!(lineage.len(), 2);
        assert_eq!(
            (lineage[0].stage_to, lineage[0].outcome),
            (Stage::Cleaned, TransitionOutcome::Committed)
        );
        assert_eq!(
            (lineage[1].stage_to, lineage[1].outcome),
            (Stage::Curated, TransitionOutcome::Rejected)
        );
        assert_eq!(lineage[1].input_count, 4);
        assert_eq!(lineage[1].output_count, 0);
        assert_eq!(lineage[1].dedup_collapsed_count, 1);

        let err = report.ensure_committed().unwrap_err();
        assert!(err.to_string().contains("duplicate_rate_exceeded"));

        let again = coordinator.run_batch(1).await.unwrap();
        let statuses: Vec<StepStatus> = again.steps.iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![StepStatus::Replayed, StepStatus::Rejected]);
        assert_eq!(again.status, RunStatus::Rejected);
        assert!(storage.list_records(Stage::Curated).await.unwrap().is_empty());

        let lineage = lineage_of(&storage).await;
        assert_eq!(lineage.len(), 3);
        assert_eq!(lineage[2].outcome, TransitionOutcome::Rejected);
        assert_eq!(lineage[2].batch_fingerprint, lineage[1].batch_fingerprint);
    }

    #[tokio::test]
    async fn rejected_batch_waits_until_its_input_changes() {
        let storage = test_storage().await;
        storage.put_batch(Stage::Raw, &scenario_batch(1)).await.unwrap();

        // Everything in batch 2 was already cleaned by batch 1.
        let repeat = Batch::new(
            2,
            Stage::Raw,
            Stage::Raw,
            vec![
                raw("https://mirror.example.com/c", "Quality gates keep bad batches out of the curated layer."),
                raw("https://mirror.example.com/d", "Lineage entries make every promotion auditable later on."),
            ],
        );
        storage.put_batch(Stage::Raw, &repeat).await.unwrap();

        let coordinator = Coordinator::new(&storage, config(), &SilentProgress).unwrap();
        let reports = coordinator.run_pending(false).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].status, RunStatus::Committed);
        assert_eq!(reports[1].status, RunStatus::Rejected);
        assert_eq!(lineage_of(&storage).await.len(), 3);

        assert!(coordinator.run_pending(false).await.unwrap().is_empty());
        assert_eq!(lineage_of(&storage).await.len(), 3);

        let retried = coordinator.run_pending(true).await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].batch_id, 2);
        assert_eq!(retried[0].status, RunStatus::Rejected);
        assert_eq!(lineage_of(&storage).await.len(), 4);

        let corrected = Batch::new(
            2,
            Stage::Raw,
            Stage::Raw,
            vec![raw("https://docs.example.com/g", "A corrected batch brings genuinely new material along.")],
        );
        storage.put_batch(Stage::Raw, &corrected).await.unwrap();

        let reports = coordinator.run_pending(false).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, RunStatus::Committed);
        assert_eq!(storage.list_records(Stage::Curated).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn missing_raw_batch_is_a_validation_error() {
        let storage = test_storage().await;
        let coordinator = Coordinator::new(&storage, config(), &SilentProgress).unwrap();
        let err = coordinator.run_batch(42).await.unwrap_err();
        assert!(matches!(err, LakehouseError::Validation { .. }));
    }

    #[tokio::test]
    async fn elapsed_timeout_is_retryable() {
        let err = with_timeout(Duration::from_millis(5), "slow_op", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, LakehouseError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, LakehouseError::StorageUnavailable { ref operation, .. } if operation == "slow_op"));
        assert!(err.is_retryable());
    }
}
