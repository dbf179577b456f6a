//! Shared request orchestration for the clone and update endpoints.
//!
//! Request-fatal checks (config shape, CSV readability, schema fetch, strict
//! column resolution) all happen here, before the response status is
//! committed: each failure returns a single JSON error object with a non-200
//! status. Once everything load-bearing is in hand, the pipeline is spawned
//! and its bounded event channel becomes the NDJSON response body. The
//! channel is the cancellation signal: a client that goes away drops the
//! body, which drops the receiver, which stops the pipeline.

use crate::kobo::{FetchError, KoboClient, METADATA_TIMEOUT, WRITE_TIMEOUT};
use crate::services::form::read_sync_form;
use crate::services::table::parse_table;
use crate::sync::field_index::FieldIndex;
use crate::sync::pipeline::{run_pipeline, PipelineRun};
use crate::sync::SyncMode;
use actix_multipart::Multipart;
use actix_web::web::Bytes;
use actix_web::HttpResponse;
use common::events::ProgressEvent;
use common::requests::SyncConfig;
use futures_util::Stream;
use log::info;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Small on purpose: a consumer that stops reading should stall the
/// pipeline after a few rows, not after the whole table.
const EVENT_CHANNEL_CAPACITY: usize = 16;

fn reject(status_builder: fn() -> actix_web::HttpResponseBuilder, message: &str) -> HttpResponse {
    let mut builder = status_builder();
    builder.json(json!({ "status": "error", "message": message }))
}

fn fetch_error_response(err: FetchError) -> HttpResponse {
    let message = err.to_string();
    match err {
        FetchError::Auth => reject(HttpResponse::Unauthorized, &message),
        FetchError::NotFound => reject(HttpResponse::NotFound, &message),
        FetchError::Connect => reject(HttpResponse::BadRequest, &message),
        FetchError::Api(..) | FetchError::Parse(_) | FetchError::Client(_) => {
            reject(HttpResponse::InternalServerError, &message)
        }
    }
}

/// Runs all request-fatal preconditions, then answers with the progress
/// stream of a freshly spawned pipeline.
pub(crate) async fn start_sync(payload: Multipart, mode: SyncMode) -> HttpResponse {
    let form = match read_sync_form(payload).await {
        Ok(form) => form,
        Err(e) => return reject(HttpResponse::BadRequest, &e),
    };
    let config = match SyncConfig::new(&form.server_url, &form.token, &form.asset_id) {
        Ok(config) => config,
        Err(e) => return reject(HttpResponse::BadRequest, &e),
    };
    let table = match parse_table(&form.file) {
        Ok(table) => table,
        Err(e) => return reject(HttpResponse::BadRequest, &e),
    };
    if mode == SyncMode::Update && table.column_index("_id").is_none() {
        return reject(HttpResponse::BadRequest, "CSV missing '_id' column.");
    }

    let schema_client = match KoboClient::new(&config, METADATA_TIMEOUT) {
        Ok(client) => client,
        Err(e) => return reject(HttpResponse::InternalServerError, &e.to_string()),
    };
    let schema = match schema_client.fetch_schema().await {
        Ok(schema) => schema,
        Err(e) => return fetch_error_response(e),
    };
    let index = FieldIndex::build(&schema, mode);

    if form.strict {
        let unresolved = index.unresolved_columns(&table.columns);
        if !unresolved.is_empty() {
            let message = format!(
                "CSV columns not found in the survey: {}.",
                unresolved.join(", ")
            );
            return reject(HttpResponse::BadRequest, &message);
        }
    }

    let writer = match KoboClient::new(&config, WRITE_TIMEOUT) {
        Ok(client) => client,
        Err(e) => return reject(HttpResponse::InternalServerError, &e.to_string()),
    };

    info!(
        "starting {:?} run: asset={} rows={} confirmed={} skip_rows={}",
        mode,
        config.asset_id,
        table.rows.len(),
        form.confirmed,
        form.skip_rows
    );

    let run = PipelineRun {
        mode,
        confirmed: form.confirmed,
        skip_rows: form.skip_rows,
        columns: table.columns,
        rows: table.rows,
        index,
    };
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        run_pipeline(run, Arc::new(writer), tx).await;
    });

    HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .streaming(event_stream(rx))
}

/// Adapts the pipeline's event channel into a body stream, one JSON line per
/// event. The stream ends when the pipeline drops its sender.
fn event_stream(
    rx: mpsc::Receiver<ProgressEvent>,
) -> impl Stream<Item = Result<Bytes, actix_web::Error>> {
    futures_util::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let item = serde_json::to_string(&event)
            .map(|line| Bytes::from(line + "\n"))
            .map_err(actix_web::error::ErrorInternalServerError);
        Some((item, rx))
    })
}
