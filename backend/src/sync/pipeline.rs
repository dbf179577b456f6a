//! The streaming submission pipeline.
//!
//! One pipeline instance serves one request: it validates rows from the
//! resume cursor onward and, when the caller has confirmed execution, writes
//! accepted rows to the remote platform. Outcomes are pushed as
//! `ProgressEvent`s onto a bounded channel in strict row order; the HTTP
//! layer drains that channel into the NDJSON response body. A full channel
//! blocks the pipeline (backpressure), and a closed one — the consumer went
//! away — aborts the remaining rows without undoing committed writes.

use crate::kobo::{RecordSink, WriteError};
use crate::sync::field_index::FieldIndex;
use crate::sync::payload::{to_flat, to_nested};
use crate::sync::validate::{validate_row, RejectionReason, RowPlan};
use crate::sync::SyncMode;
use chrono::Utc;
use common::events::ProgressEvent;
use log::{info, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Update calls are fanned out in small concurrent batches; results are
/// joined before the batch's events go out, so row order is preserved.
const UPDATE_BATCH_SIZE: usize = 5;

/// Everything a run needs, assembled by the HTTP handler before the stream
/// starts. Nothing here is shared across requests.
pub struct PipelineRun {
    pub mode: SyncMode,
    /// False means preview: validate only, halt at the first rejection.
    pub confirmed: bool,
    /// Resume cursor — rows already handled by a previous preview pass.
    pub skip_rows: usize,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub index: FieldIndex,
}

/// Counters accumulated over one run; the terminal success event is rendered
/// from this.
#[derive(Debug, Default)]
pub struct PipelineState {
    pub processed: usize,
    pub success: usize,
    pub duplicate_or_missing: usize,
    pub malformed: usize,
    pub empty: usize,
    pub invalid_data: usize,
    pub write_failures: usize,
    pub err_detail: Vec<String>,
}

impl PipelineState {
    fn record_rejection(&mut self, row_no: usize, reason: &RejectionReason) {
        match reason {
            RejectionReason::EmptyIdentifier => self.empty += 1,
            RejectionReason::MalformedIdentifier(_) => self.malformed += 1,
            RejectionReason::DuplicateIdentifier(_) | RejectionReason::NotFound(_) => {
                self.duplicate_or_missing += 1
            }
            RejectionReason::TypeMismatch { .. }
            | RejectionReason::InvalidChoice { .. }
            | RejectionReason::NoMappedData => self.invalid_data += 1,
        }
        self.err_detail.push(format!("Row {}: {}", row_no, reason));
    }

    fn record_write_failure(&mut self, row_no: usize, err: &WriteError) {
        self.write_failures += 1;
        self.err_detail.push(format!("Row {}: {}", row_no, err));
    }

    fn summary(&self, mode: SyncMode) -> String {
        match mode {
            SyncMode::Clone => format!(
                "Clone complete: {} created, {} duplicate, {} malformed, {} empty, {} rejected, {} failed writes.",
                self.success,
                self.duplicate_or_missing,
                self.malformed,
                self.empty,
                self.invalid_data,
                self.write_failures
            ),
            SyncMode::Update => format!(
                "Update complete: {} updated, {} not found, {} malformed, {} empty, {} rejected, {} failed writes.",
                self.success,
                self.duplicate_or_missing,
                self.malformed,
                self.empty,
                self.invalid_data,
                self.write_failures
            ),
        }
    }
}

/// Outcome of one row in execution mode, resolved before its events are
/// emitted.
enum RowResult {
    Committed,
    Rejected(RejectionReason),
    WriteFailed(WriteError),
}

/// Drives one run to completion. Returns the final state for logging; all
/// caller-visible output goes through `tx`.
pub async fn run_pipeline(
    run: PipelineRun,
    sink: Arc<dyn RecordSink>,
    tx: mpsc::Sender<ProgressEvent>,
) -> PipelineState {
    let mut state = PipelineState::default();
    let plan = RowPlan::build(&run.columns, &run.index, run.mode);

    // Point-in-time snapshot, taken once. Ids created by anyone else while
    // the run is in flight stay invisible to the duplicate/existence checks.
    let existing_ids = if plan.id_column.is_some() {
        match sink.existing_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("existing-id pre-fetch failed: {}", e);
                if run.mode == SyncMode::Update {
                    let sent = emit(
                        &tx,
                        ProgressEvent::Warning {
                            message: format!("Pre-fetch error: {}", e),
                            current: None,
                            total: None,
                        },
                    )
                    .await;
                    if !sent {
                        return state;
                    }
                }
                HashSet::new()
            }
        }
    } else {
        HashSet::new()
    };

    let completed = if run.confirmed {
        match run.mode {
            SyncMode::Clone => {
                run_clone(&run, &plan, &existing_ids, sink.as_ref(), &tx, &mut state).await
            }
            SyncMode::Update => {
                run_update(&run, &plan, &existing_ids, sink.as_ref(), &tx, &mut state).await
            }
        }
    } else {
        run_preview(&run, &plan, &existing_ids, &tx, &mut state).await
    };

    if completed {
        info!("{}", state.summary(run.mode));
    } else {
        warn!(
            "stream consumer disconnected after {} rows; remaining rows abandoned",
            state.processed
        );
    }
    state
}

async fn emit(tx: &mpsc::Sender<ProgressEvent>, event: ProgressEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Preview pass: no writes ever. Halts at the first rejected row so the
/// caller can fix it and resubmit with an advanced cursor; a clean pass over
/// the final row reports validation complete instead.
async fn run_preview(
    run: &PipelineRun,
    plan: &RowPlan<'_>,
    existing_ids: &HashSet<String>,
    tx: &mpsc::Sender<ProgressEvent>,
    state: &mut PipelineState,
) -> bool {
    let total = run.rows.len();
    for (i, row) in run.rows.iter().enumerate().skip(run.skip_rows) {
        let row_no = i + 1;
        state.processed += 1;
        match validate_row(plan, existing_ids, row) {
            Ok(_) => {
                let event = ProgressEvent::Progress {
                    current: row_no,
                    total,
                    success: 0,
                    is_validation_complete: row_no == total,
                };
                if !emit(tx, event).await {
                    return false;
                }
            }
            Err(reason) => {
                state.record_rejection(row_no, &reason);
                let warning = ProgressEvent::Warning {
                    message: format!("Row {}: {}", row_no, reason),
                    current: Some(row_no),
                    total: Some(total),
                };
                if !emit(tx, warning).await {
                    return false;
                }
                let summary = ProgressEvent::Success {
                    message: format!(
                        "Validation stopped at row {}. Fix the issue and resubmit.",
                        row_no
                    ),
                    err_detail: state.err_detail.clone(),
                };
                return emit(tx, summary).await;
            }
        }
    }

    let summary = ProgressEvent::Success {
        message: "Validation complete. Resubmit with confirmation to apply.".to_string(),
        err_detail: Vec::new(),
    };
    emit(tx, summary).await
}

/// Confirmed clone: one submission POST per accepted row, sequential.
async fn run_clone(
    run: &PipelineRun,
    plan: &RowPlan<'_>,
    existing_ids: &HashSet<String>,
    sink: &dyn RecordSink,
    tx: &mpsc::Sender<ProgressEvent>,
    state: &mut PipelineState,
) -> bool {
    let total = run.rows.len();
    for (i, row) in run.rows.iter().enumerate().skip(run.skip_rows) {
        let row_no = i + 1;
        state.processed += 1;
        match validate_row(plan, existing_ids, row) {
            Err(reason) => {
                state.record_rejection(row_no, &reason);
                let warning = ProgressEvent::Warning {
                    message: format!("Row {}: {}", row_no, reason),
                    current: Some(row_no),
                    total: Some(total),
                };
                if !emit(tx, warning).await {
                    return false;
                }
            }
            Ok(accepted) => {
                let mut submission = to_nested(accepted.pairs);
                let now = Utc::now().to_rfc3339();
                if run.index.has_start {
                    submission.insert("start".to_string(), Value::String(now.clone()));
                }
                if run.index.has_end {
                    submission.insert("end".to_string(), Value::String(now));
                }
                match sink.create_record(submission).await {
                    Ok(()) => state.success += 1,
                    Err(err) => {
                        state.record_write_failure(row_no, &err);
                        let event = match err {
                            WriteError::Remote { body, .. } => ProgressEvent::Error {
                                message: format!("Row {} failed server-side: {}", row_no, body),
                                current: Some(row_no),
                                total: Some(total),
                            },
                            WriteError::Network(e) => ProgressEvent::Warning {
                                message: format!("Network error on row {}: {}", row_no, e),
                                current: Some(row_no),
                                total: Some(total),
                            },
                        };
                        if !emit(tx, event).await {
                            return false;
                        }
                    }
                }
            }
        }
        let progress = ProgressEvent::Progress {
            current: row_no,
            total,
            success: state.success,
            is_validation_complete: false,
        };
        if !emit(tx, progress).await {
            return false;
        }
    }

    let summary = ProgressEvent::Success {
        message: state.summary(SyncMode::Clone),
        err_detail: state.err_detail.clone(),
    };
    emit(tx, summary).await
}

/// Confirmed update: bulk patches dispatched in batches of
/// `UPDATE_BATCH_SIZE`, joined before the batch's events are emitted.
async fn run_update(
    run: &PipelineRun,
    plan: &RowPlan<'_>,
    existing_ids: &HashSet<String>,
    sink: &dyn RecordSink,
    tx: &mpsc::Sender<ProgressEvent>,
    state: &mut PipelineState,
) -> bool {
    let total = run.rows.len();
    let pending: Vec<(usize, &Vec<String>)> =
        run.rows.iter().enumerate().skip(run.skip_rows).collect();

    for batch in pending.chunks(UPDATE_BATCH_SIZE) {
        let futures = batch.iter().map(|&(i, row)| async move {
            let row_no = i + 1;
            let result = match validate_row(plan, existing_ids, row) {
                Err(reason) => RowResult::Rejected(reason),
                Ok(accepted) => {
                    // Shape-validated, so the parse only fails on a bug.
                    let id = accepted
                        .record_id
                        .as_deref()
                        .and_then(|s| s.parse::<i64>().ok());
                    match id {
                        Some(id) => match sink.patch_record(id, to_flat(accepted.pairs)).await {
                            Ok(()) => RowResult::Committed,
                            Err(err) => RowResult::WriteFailed(err),
                        },
                        None => RowResult::Rejected(RejectionReason::MalformedIdentifier(
                            accepted.record_id.unwrap_or_default(),
                        )),
                    }
                }
            };
            (row_no, result)
        });
        let results = futures_util::future::join_all(futures).await;

        let mut last_row_no = 0;
        for (row_no, result) in results {
            state.processed += 1;
            last_row_no = row_no;
            match result {
                RowResult::Committed => state.success += 1,
                RowResult::Rejected(reason) => {
                    state.record_rejection(row_no, &reason);
                    let warning = ProgressEvent::Warning {
                        message: format!("Row {}: {}", row_no, reason),
                        current: Some(row_no),
                        total: Some(total),
                    };
                    if !emit(tx, warning).await {
                        return false;
                    }
                }
                RowResult::WriteFailed(err) => {
                    state.record_write_failure(row_no, &err);
                    let event = match err {
                        WriteError::Remote { body, .. } => ProgressEvent::Error {
                            message: format!("Row {} failed: {}", row_no, body),
                            current: Some(row_no),
                            total: Some(total),
                        },
                        WriteError::Network(e) => ProgressEvent::Warning {
                            message: format!("Network error on row {}: {}", row_no, e),
                            current: Some(row_no),
                            total: Some(total),
                        },
                    };
                    if !emit(tx, event).await {
                        return false;
                    }
                }
            }
        }

        if last_row_no > 0 {
            let progress = ProgressEvent::Progress {
                current: last_row_no,
                total,
                success: state.success,
                is_validation_complete: false,
            };
            if !emit(tx, progress).await {
                return false;
            }
        }
    }

    let summary = ProgressEvent::Success {
        message: state.summary(SyncMode::Update),
        err_detail: state.err_detail.clone(),
    };
    emit(tx, summary).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kobo::{AssetSchema, ChoiceItem, FetchError, SurveyItem};
    use async_trait::async_trait;
    use serde_json::Map;
    use std::sync::Mutex;

    /// In-memory sink recording every write; optionally fails chosen ids.
    #[derive(Default)]
    struct StubSink {
        existing: HashSet<String>,
        fail_remote_ids: HashSet<i64>,
        created: Mutex<Vec<Map<String, Value>>>,
        patched: Mutex<Vec<(i64, Map<String, Value>)>>,
    }

    #[async_trait]
    impl RecordSink for StubSink {
        async fn existing_ids(&self) -> Result<HashSet<String>, FetchError> {
            Ok(self.existing.clone())
        }

        async fn create_record(&self, submission: Map<String, Value>) -> Result<(), WriteError> {
            self.created.lock().unwrap().push(submission);
            Ok(())
        }

        async fn patch_record(
            &self,
            record_id: i64,
            data: Map<String, Value>,
        ) -> Result<(), WriteError> {
            if self.fail_remote_ids.contains(&record_id) {
                return Err(WriteError::Remote {
                    status: 400,
                    body: "bad record".to_string(),
                });
            }
            self.patched.lock().unwrap().push((record_id, data));
            Ok(())
        }
    }

    fn schema_with_id_fields() -> AssetSchema {
        AssetSchema {
            survey: vec![
                SurveyItem {
                    kind: Some("start".into()),
                    name: Some("start".into()),
                    select_from_list_name: None,
                },
                SurveyItem {
                    kind: Some("end".into()),
                    name: Some("end".into()),
                    select_from_list_name: None,
                },
                SurveyItem {
                    kind: Some("text".into()),
                    name: Some("remarks".into()),
                    select_from_list_name: None,
                },
                SurveyItem {
                    kind: Some("integer".into()),
                    name: Some("age".into()),
                    select_from_list_name: None,
                },
            ],
            choices: Vec::<ChoiceItem>::new(),
        }
    }

    fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
        data.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    async fn run_and_collect(
        run: PipelineRun,
        sink: Arc<StubSink>,
    ) -> (PipelineState, Vec<ProgressEvent>) {
        // Capacity beyond any test's event count, so the run never blocks on
        // a consumer.
        let (tx, mut rx) = mpsc::channel(256);
        let state = run_pipeline(run, sink, tx).await;
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        (state, events)
    }

    fn clone_run(
        columns: Vec<String>,
        table: Vec<Vec<String>>,
        confirmed: bool,
        skip_rows: usize,
    ) -> PipelineRun {
        let index = FieldIndex::build(&schema_with_id_fields(), SyncMode::Clone);
        PipelineRun {
            mode: SyncMode::Clone,
            confirmed,
            skip_rows,
            columns,
            rows: table,
            index,
        }
    }

    fn update_run(
        columns: Vec<String>,
        table: Vec<Vec<String>>,
        skip_rows: usize,
    ) -> PipelineRun {
        let index = FieldIndex::build(&schema_with_id_fields(), SyncMode::Update);
        PipelineRun {
            mode: SyncMode::Update,
            confirmed: true,
            skip_rows,
            columns,
            rows: table,
            index,
        }
    }

    #[tokio::test]
    async fn preview_halts_at_first_rejection_with_one_warning_and_no_writes() {
        let table = rows(&[
            &["1234567", "a"],
            &["1234568", "b"],
            &["12", "c"],
            &["1234569", "d"],
            &["1234570", "e"],
        ]);
        let run = clone_run(cols(&["_id", "remarks"]), table, false, 0);
        let sink = Arc::new(StubSink::default());
        let (_, events) = run_and_collect(run, sink.clone()).await;

        let warnings: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Warning { .. }))
            .collect();
        assert_eq!(warnings.len(), 1);
        match warnings[0] {
            ProgressEvent::Warning { message, current, .. } => {
                assert!(message.starts_with("Row 3:"));
                assert_eq!(*current, Some(3));
            }
            _ => unreachable!(),
        }
        // Two clean rows, one warning, one terminal summary. Nothing after.
        assert!(matches!(events.last(), Some(ProgressEvent::Success { .. })));
        assert_eq!(events.len(), 4);
        assert!(sink.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn clean_preview_reports_validation_complete() {
        let table = rows(&[&["x"], &["y"]]);
        let run = clone_run(cols(&["remarks"]), table, false, 0);
        let (_, events) = run_and_collect(run, Arc::new(StubSink::default())).await;

        let last_progress = events
            .iter()
            .rev()
            .find_map(|e| match e {
                ProgressEvent::Progress {
                    is_validation_complete,
                    current,
                    ..
                } => Some((*is_validation_complete, *current)),
                _ => None,
            })
            .unwrap();
        assert_eq!(last_progress, (true, 2));
        assert!(matches!(events.last(), Some(ProgressEvent::Success { .. })));
    }

    #[tokio::test]
    async fn clone_execution_writes_accepted_rows_and_stamps_timestamps() {
        let table = rows(&[&["hello", "10.0"], &["", ""], &["world", "oops"]]);
        let run = clone_run(cols(&["remarks", "age"]), table, true, 0);
        let sink = Arc::new(StubSink::default());
        let (state, events) = run_and_collect(run, sink.clone()).await;

        assert_eq!(state.success, 1);
        assert_eq!(state.empty, 0);
        assert_eq!(state.invalid_data, 2); // NoMappedData + TypeMismatch
        let created = sink.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["remarks"], Value::String("hello".into()));
        assert_eq!(created[0]["age"], Value::String("10".into()));
        // Survey declares start/end, so the submission instant is stamped.
        assert!(created[0].contains_key("start"));
        assert!(created[0].contains_key("end"));

        match events.last() {
            Some(ProgressEvent::Success { err_detail, .. }) => {
                assert_eq!(err_detail.len(), 2);
                assert!(err_detail[0].starts_with("Row 2:"));
                assert!(err_detail[1].starts_with("Row 3:"));
            }
            other => panic!("expected terminal success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn snapshot_is_not_updated_mid_run() {
        // 1234567 is in the pre-run snapshot: both occurrences reject. The
        // repeated 7654321 is not: both occurrences pass the duplicate check.
        let table = rows(&[
            &["1234567", "a"],
            &["7654321", "b"],
            &["7654321", "c"],
            &["1234567", "d"],
        ]);
        let run = clone_run(cols(&["_id", "remarks"]), table, true, 0);
        let sink = Arc::new(StubSink {
            existing: ["1234567".to_string()].into_iter().collect(),
            ..StubSink::default()
        });
        let (state, _) = run_and_collect(run, sink.clone()).await;

        assert_eq!(state.duplicate_or_missing, 2);
        assert_eq!(state.success, 2);
        assert_eq!(sink.created.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_patches_in_row_order_and_survives_remote_failures() {
        let table = rows(&[
            &["1234567", "1"],
            &["1234568", "2"],
            &["1234569", "3"],
            &["9999999", "4"],
        ]);
        let run = update_run(cols(&["_id", "age"]), table, 0);
        let sink = Arc::new(StubSink {
            existing: ["1234567", "1234568", "1234569"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            fail_remote_ids: [1234568].into_iter().collect(),
            ..StubSink::default()
        });
        let (state, events) = run_and_collect(run, sink.clone()).await;

        assert_eq!(state.success, 2);
        assert_eq!(state.write_failures, 1);
        assert_eq!(state.duplicate_or_missing, 1); // 9999999 not found

        let patched = sink.patched.lock().unwrap();
        let ids: Vec<i64> = patched.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1234567, 1234569]);
        assert_eq!(patched[0].1["age"], Value::String("1".into()));

        let has_error = events.iter().any(|e| {
            matches!(e, ProgressEvent::Error { message, .. } if message.starts_with("Row 2"))
        });
        assert!(has_error);
        assert!(matches!(events.last(), Some(ProgressEvent::Success { .. })));
    }

    #[tokio::test]
    async fn resumed_run_matches_tail_of_full_run() {
        let table = rows(&[
            &["bad-row", "x"],
            &["1234568", "2"],
            &["1234569", "3"],
        ]);
        let existing: HashSet<String> = ["1234568", "1234569"]
            .into_iter()
            .map(str::to_string)
            .collect();

        let full_sink = Arc::new(StubSink {
            existing: existing.clone(),
            ..StubSink::default()
        });
        let full = update_run(cols(&["_id", "age"]), table.clone(), 0);
        let (full_state, _) = run_and_collect(full, full_sink.clone()).await;

        let resumed_sink = Arc::new(StubSink {
            existing,
            ..StubSink::default()
        });
        let resumed = update_run(cols(&["_id", "age"]), table, 1);
        let (resumed_state, _) = run_and_collect(resumed, resumed_sink.clone()).await;

        // Rows 2..3 resolve identically whether or not row 1 was reprocessed.
        assert_eq!(full_state.success, 2);
        assert_eq!(resumed_state.success, 2);
        assert_eq!(
            *full_sink.patched.lock().unwrap(),
            *resumed_sink.patched.lock().unwrap()
        );
        assert_eq!(full_state.malformed, 1);
        assert_eq!(resumed_state.malformed, 0);
    }

    #[tokio::test]
    async fn progress_events_arrive_in_increasing_row_order() {
        let table = rows(&[&["a"], &["b"], &["c"], &["d"], &["e"], &["f"], &["g"]]);
        let run = clone_run(cols(&["remarks"]), table, true, 0);
        let (_, events) = run_and_collect(run, Arc::new(StubSink::default())).await;

        let currents: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Progress { current, .. } => Some(*current),
                _ => None,
            })
            .collect();
        assert_eq!(currents, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn dropped_receiver_aborts_the_run() {
        let table = rows(&[&["a"], &["b"], &["c"]]);
        let run = clone_run(cols(&["remarks"]), table, true, 0);
        let sink = Arc::new(StubSink::default());

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let state = run_pipeline(run, sink.clone(), tx).await;

        // The first row may have been written before the closed channel was
        // noticed; nothing beyond it is.
        assert!(state.processed <= 1 || sink.created.lock().unwrap().len() <= 1);
        assert!(sink.created.lock().unwrap().len() <= 1);
    }
}
