//! Column-name → survey-field resolution.
//!
//! Built once per run from the fetched asset schema by replaying the survey
//! declarations with a group-name stack: entering a group pushes its name,
//! leaving pops it, and a leaf's full path is the stack plus its own name
//! joined with `/`. Both the bare leaf name and the full path are registered
//! (lower-cased) so a CSV column may use either spelling.

use crate::kobo::AssetSchema;
use crate::sync::SyncMode;
use std::collections::HashMap;

/// Declared type of a survey leaf, as far as cell coercion cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Decimal,
    Date,
    SelectOne,
    SelectMultiple,
    Other,
}

impl FieldKind {
    fn from_survey_type(kind: &str) -> Self {
        match kind {
            "text" => FieldKind::Text,
            "integer" => FieldKind::Integer,
            "decimal" => FieldKind::Decimal,
            "date" => FieldKind::Date,
            "select_one" => FieldKind::SelectOne,
            "select_multiple" => FieldKind::SelectMultiple,
            _ => FieldKind::Other,
        }
    }
}

/// One indexable survey leaf.
#[derive(Clone, Debug)]
pub struct SurveyField {
    /// Slash-delimited full path, group names included.
    pub path: String,
    pub kind: FieldKind,
    /// Allowed value tokens for select fields, in choice-list order. A select
    /// field whose list name resolves to nothing gets an empty set, which
    /// rejects every value — the stringency is intended.
    pub allowed_choices: Option<Vec<String>>,
}

/// Immutable lookup from lower-cased column name to survey field.
pub struct FieldIndex {
    fields: HashMap<String, SurveyField>,
    /// The survey declares automatic `start` / `end` timestamp fields; clone
    /// stamps the submission instant into them.
    pub has_start: bool,
    pub has_end: bool,
}

/// Table columns that never map to survey fields and are exempt from the
/// strict unresolved-column check.
const META_COLUMNS: [&str; 4] = ["start", "end", "_id", "username"];

fn is_excluded(kind: &str, mode: SyncMode) -> bool {
    matches!(kind, "calculate" | "note" | "deviceid")
        || (mode == SyncMode::Update && matches!(kind, "start" | "end"))
}

impl FieldIndex {
    pub fn build(schema: &AssetSchema, mode: SyncMode) -> Self {
        let mut choice_lists: HashMap<&str, Vec<String>> = HashMap::new();
        for choice in &schema.choices {
            if let (Some(list), Some(name)) = (&choice.list_name, &choice.name) {
                choice_lists.entry(list.as_str()).or_default().push(name.clone());
            }
        }

        let mut fields = HashMap::new();
        let mut group_stack: Vec<&str> = Vec::new();
        let mut has_start = false;
        let mut has_end = false;

        for item in &schema.survey {
            let kind_str = item.kind.as_deref().unwrap_or("");
            match kind_str {
                "begin_group" => {
                    if let Some(name) = item.name.as_deref() {
                        group_stack.push(name);
                    }
                }
                "end_group" => {
                    group_stack.pop();
                }
                "start" => has_start = true,
                "end" => has_end = true,
                _ => {}
            }
            if matches!(kind_str, "begin_group" | "end_group") || is_excluded(kind_str, mode) {
                continue;
            }
            let Some(name) = item.name.as_deref() else {
                continue;
            };

            let path = group_stack
                .iter()
                .copied()
                .chain(std::iter::once(name))
                .collect::<Vec<_>>()
                .join("/");
            let kind = FieldKind::from_survey_type(kind_str);
            let allowed_choices = match kind {
                FieldKind::SelectOne | FieldKind::SelectMultiple => Some(
                    item.select_from_list_name
                        .as_deref()
                        .and_then(|list| choice_lists.get(list).cloned())
                        .unwrap_or_default(),
                ),
                _ => None,
            };

            let field = SurveyField {
                path: path.clone(),
                kind,
                allowed_choices,
            };
            fields.insert(name.to_lowercase(), field.clone());
            fields.insert(path.to_lowercase(), field);
        }

        FieldIndex {
            fields,
            has_start,
            has_end,
        }
    }

    /// Resolves a table column (case-insensitively, whitespace-trimmed) to
    /// its survey field, or `None` for unrecognized columns.
    pub fn resolve(&self, column: &str) -> Option<&SurveyField> {
        self.fields.get(&column.trim().to_lowercase())
    }

    /// Columns that are neither meta columns nor resolvable in the index.
    /// Strict runs fail fast when this list is non-empty.
    pub fn unresolved_columns(&self, columns: &[String]) -> Vec<String> {
        columns
            .iter()
            .filter(|col| {
                let key = col.trim().to_lowercase();
                !META_COLUMNS.contains(&key.as_str()) && !self.fields.contains_key(&key)
            })
            .cloned()
            .collect()
    }
}
