//! # Update Service
//!
//! Bulk-patches existing remote records from the rows of an uploaded CSV,
//! keyed by the mandatory `_id` column:
//!
//! - `POST /api/update/start`: same multipart form as the clone service.
//!   Every row's `_id` is normalized and shape-checked, then matched against
//!   a one-time snapshot of the asset's existing record ids; rows whose id is
//!   unknown are skipped as not found. Confirmed runs dispatch one bulk-patch
//!   call per accepted row, fanned out in small concurrent batches.

mod start;

use actix_web::web::{post, scope};
use actix_web::Scope;

const API_PATH: &str = "/api/update";

/// Configures and returns the Actix scope for update routes.
pub fn configure_routes() -> Scope {
    scope(API_PATH).route("/start", post().to(start::process))
}
