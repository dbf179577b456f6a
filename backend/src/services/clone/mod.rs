//! # Clone Service
//!
//! Creates new remote records from the rows of an uploaded CSV. The single
//! endpoint streams per-row outcomes back as NDJSON while the run progresses:
//!
//! - `POST /api/clone/start`: multipart form with `server_url`, `token`,
//!   `target_asset_id` (or `asset_id`), `confirmed`, `skip_rows`, `strict`
//!   and the CSV `file`. An unconfirmed request is a preview pass — rows are
//!   validated against the target survey, nothing is written, and the run
//!   halts at the first rejected row. A confirmed request submits every
//!   accepted row as a new record; when the CSV carries an `_id` column, ids
//!   already present on the asset are skipped as duplicates.

mod start;

use actix_web::web::{post, scope};
use actix_web::Scope;

const API_PATH: &str = "/api/clone";

/// Configures and returns the Actix scope for clone routes.
pub fn configure_routes() -> Scope {
    scope(API_PATH).route("/start", post().to(start::process))
}
