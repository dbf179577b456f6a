//! Wire model for the NDJSON progress stream.
//!
//! Every line of a clone/update response body is one serialized
//! `ProgressEvent`. The `status` tag and field names are part of the public
//! contract consumed by the frontend page, so changes here are breaking.

use serde::{Deserialize, Serialize};

/// One record of the streamed operation feed.
///
/// Emitted strictly in row order by the submission pipeline. A run that was
/// not cancelled always ends with exactly one `Success` event carrying the
/// final summary and the accumulated rejection messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProgressEvent {
    /// Row-level progress, sent after each row (or batch) is fully resolved.
    Progress {
        /// Rows processed so far, counted from the start of the table
        /// (resume cursor included).
        current: usize,
        /// Total rows in the table.
        total: usize,
        /// Rows committed to the remote platform so far.
        success: usize,
        /// True only on the final progress event of a clean preview pass.
        is_validation_complete: bool,
    },
    /// A row-local rejection or transport failure; the run continues.
    Warning {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        current: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<usize>,
    },
    /// A remote-side failure for one row; the run continues.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        current: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<usize>,
    },
    /// Terminal summary, emitted exactly once per non-cancelled run.
    Success {
        message: String,
        err_detail: Vec<String>,
    },
}
