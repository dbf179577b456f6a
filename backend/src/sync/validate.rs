//! Pure per-row validation and cell coercion. No I/O happens here: the
//! existence snapshot and field index are taken as read-only inputs and a row
//! either becomes an accepted `path → value` payload or the first rejection
//! encountered.

use crate::sync::field_index::{FieldIndex, FieldKind, SurveyField};
use crate::sync::SyncMode;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::HashSet;
use thiserror::Error;

/// The closed set of row-local rejections. Display strings are what the
/// caller sees on the stream, so they name the offending value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("ID is empty.")]
    EmptyIdentifier,

    #[error("ID '{0}' is not a valid record ID.")]
    MalformedIdentifier(String),

    #[error("ID {0} already exists.")]
    DuplicateIdentifier(String),

    #[error("ID {0} not found on the server.")]
    NotFound(String),

    #[error("Column '{column}': '{value}' is not a valid {expected}.")]
    TypeMismatch {
        column: String,
        value: String,
        expected: &'static str,
    },

    #[error("Column '{column}': '{value}' is not one of the allowed choices [{allowed}].")]
    InvalidChoice {
        column: String,
        value: String,
        allowed: String,
    },

    #[error("No mapped data in row.")]
    NoMappedData,
}

/// A row that passed validation: its normalized record id (when the run is
/// keyed by one) and the coerced `path → value` pairs in column order.
#[derive(Debug, Clone)]
pub struct AcceptedRow {
    pub record_id: Option<String>,
    pub pairs: Vec<(String, String)>,
}

/// Per-run resolution of the table header against the field index, computed
/// once so row validation is a plain loop over pre-resolved columns.
pub struct RowPlan<'a> {
    pub mode: SyncMode,
    pub id_column: Option<usize>,
    mapped: Vec<(usize, String, &'a SurveyField)>,
}

impl<'a> RowPlan<'a> {
    pub fn build(columns: &[String], index: &'a FieldIndex, mode: SyncMode) -> Self {
        let id_column = columns
            .iter()
            .position(|c| c.trim().eq_ignore_ascii_case("_id"));
        let mapped = columns
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != id_column)
            .filter_map(|(i, col)| {
                index
                    .resolve(col)
                    .map(|field| (i, col.trim().to_string(), field))
            })
            .collect();
        RowPlan {
            mode,
            id_column,
            mapped,
        }
    }
}

/// Truncates a numeric-as-float identifier at its decimal point and trims
/// whitespace. Idempotent: the result contains neither dots nor edge spaces.
pub fn normalize_record_id(raw: &str) -> String {
    raw.trim()
        .split('.')
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

/// Shape check for remote record ids: digits only, 7 or 8 of them.
pub fn is_valid_record_id(id: &str) -> bool {
    (7..=8).contains(&id.len()) && id.chars().all(|c| c.is_ascii_digit())
}

/// Validates one row. Short-circuits on the first failure; identifier checks
/// run before any cell coercion.
pub fn validate_row(
    plan: &RowPlan<'_>,
    existing_ids: &HashSet<String>,
    row: &[String],
) -> Result<AcceptedRow, RejectionReason> {
    let record_id = match plan.id_column {
        Some(col) => Some(validate_identifier(
            row.get(col).map(String::as_str).unwrap_or(""),
            plan.mode,
            existing_ids,
        )?),
        None => None,
    };

    let mut pairs = Vec::new();
    for (col_idx, col_name, field) in &plan.mapped {
        let cell = row.get(*col_idx).map(String::as_str).unwrap_or("");
        let cell = cell.trim();
        if cell.is_empty() {
            continue;
        }
        let value = coerce_cell(col_name, cell, field)?;
        pairs.push((field.path.clone(), value));
    }

    if pairs.is_empty() {
        return Err(RejectionReason::NoMappedData);
    }

    Ok(AcceptedRow { record_id, pairs })
}

fn validate_identifier(
    raw: &str,
    mode: SyncMode,
    existing_ids: &HashSet<String>,
) -> Result<String, RejectionReason> {
    let id = normalize_record_id(raw);
    let lowered = id.to_lowercase();
    if id.is_empty() || matches!(lowered.as_str(), "nan" | "null" | "none") {
        return Err(RejectionReason::EmptyIdentifier);
    }
    if !is_valid_record_id(&id) {
        return Err(RejectionReason::MalformedIdentifier(id));
    }
    match mode {
        SyncMode::Update if !existing_ids.contains(&id) => Err(RejectionReason::NotFound(id)),
        SyncMode::Clone if existing_ids.contains(&id) => {
            Err(RejectionReason::DuplicateIdentifier(id))
        }
        _ => Ok(id),
    }
}

fn coerce_cell(
    column: &str,
    cell: &str,
    field: &SurveyField,
) -> Result<String, RejectionReason> {
    match field.kind {
        FieldKind::Integer => {
            let parsed: Option<f64> = cell.parse().ok().filter(|n: &f64| n.is_finite());
            match parsed {
                Some(n) if n.fract() == 0.0 => Ok(format!("{}", n as i64)),
                _ => Err(RejectionReason::TypeMismatch {
                    column: column.to_string(),
                    value: cell.to_string(),
                    expected: "whole number",
                }),
            }
        }
        FieldKind::Decimal => match cell.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(cell.to_string()),
            _ => Err(RejectionReason::TypeMismatch {
                column: column.to_string(),
                value: cell.to_string(),
                expected: "number",
            }),
        },
        FieldKind::Date => match parse_date(cell) {
            Some(date) => Ok(date.format("%Y-%m-%d").to_string()),
            None => Err(RejectionReason::TypeMismatch {
                column: column.to_string(),
                value: cell.to_string(),
                expected: "date",
            }),
        },
        FieldKind::SelectOne => {
            let allowed = field.allowed_choices.as_deref().unwrap_or_default();
            if allowed.iter().any(|c| c == cell) {
                Ok(cell.to_string())
            } else {
                Err(RejectionReason::InvalidChoice {
                    column: column.to_string(),
                    value: cell.to_string(),
                    allowed: allowed.join(", "),
                })
            }
        }
        FieldKind::SelectMultiple => {
            let allowed = field.allowed_choices.as_deref().unwrap_or_default();
            let mut tokens = Vec::new();
            for token in cell
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|t| !t.is_empty())
            {
                if !allowed.iter().any(|c| c == token) {
                    return Err(RejectionReason::InvalidChoice {
                        column: column.to_string(),
                        value: token.to_string(),
                        allowed: allowed.join(", "),
                    });
                }
                tokens.push(token);
            }
            Ok(tokens.join(" "))
        }
        FieldKind::Text | FieldKind::Other => Ok(cell.to_string()),
    }
}

fn parse_date(cell: &str) -> Option<NaiveDate> {
    const FORMATS: [&str; 5] = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"];
    for format in FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(cell, format) {
            return Some(date);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(cell) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(cell, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.date());
    }
    None
}
