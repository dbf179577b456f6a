//! The field-mapping, validation and submission core.
//!
//! Everything in this module is driven by one request and dropped when its
//! progress stream closes: the field index and existence snapshot are built
//! once per run and never shared across requests.

pub mod field_index;
pub mod payload;
pub mod pipeline;
pub mod validate;

/// Which of the two operations a run performs. The mode decides which survey
/// kinds are indexable, how the `_id` column is interpreted and which write
/// endpoint accepted rows go to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    /// Create new remote records from rows.
    Clone,
    /// Bulk-patch existing remote records by `_id`.
    Update,
}
