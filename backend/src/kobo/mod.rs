//! HTTP client for the KoboToolbox v2 API.
//!
//! One run holds two clients built from the same [`SyncConfig`]: a short-lived
//! one for the schema read (30 s) and a long-lived one for record writes and
//! the existing-id listing (120 s, the server can be slow under load).
//!
//! Write operations sit behind the [`RecordSink`] trait so the submission
//! pipeline can be exercised against an in-memory stub in tests.

use async_trait::async_trait;
use common::requests::SyncConfig;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Bound for schema and metadata reads.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound for per-record writes.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(120);

/// Page size for the one-time existing-id listing. Assets beyond this many
/// records would need paging, which the listing endpoint supports but this
/// tool has never required.
const EXISTING_ID_LIMIT: &str = "10000";

/// Failures of the read-side API calls. All of them are request-fatal: the
/// schema is load-bearing for every subsequent row.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid API Token.")]
    Auth,

    #[error("Asset ID not found on this server.")]
    NotFound,

    #[error("Could not connect to server. Check your Server URL.")]
    Connect,

    #[error("Server returned {0}: {1}")]
    Api(u16, String),

    #[error("Unexpected response shape: {0}")]
    Parse(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Failures of a single record write. Row-local: counted and reported on the
/// stream, never fatal to the run.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("server returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),
}

/// One declaration from the asset's `content.survey` list, in document order.
#[derive(Debug, Clone, Deserialize)]
pub struct SurveyItem {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
    pub select_from_list_name: Option<String>,
}

/// One entry from the asset's `content.choices` list.
#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceItem {
    pub list_name: Option<String>,
    pub name: Option<String>,
}

/// The parts of an asset definition this tool consumes.
#[derive(Debug, Clone, Default)]
pub struct AssetSchema {
    pub survey: Vec<SurveyItem>,
    pub choices: Vec<ChoiceItem>,
}

/// Destination for accepted rows. Implemented by [`KoboClient`] for real runs
/// and by test stubs in the pipeline's unit tests.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Point-in-time listing of all record ids currently on the asset.
    async fn existing_ids(&self) -> Result<HashSet<String>, FetchError>;

    /// Creates one new submission from an assembled (possibly nested) payload.
    async fn create_record(&self, submission: Map<String, Value>) -> Result<(), WriteError>;

    /// Bulk-patches exactly one existing record with a flat path→value map.
    async fn patch_record(&self, record_id: i64, data: Map<String, Value>)
        -> Result<(), WriteError>;
}

pub struct KoboClient {
    http: reqwest::Client,
    server_url: String,
    asset_id: String,
    token: String,
    legacy_kc: bool,
}

impl KoboClient {
    pub fn new(config: &SyncConfig, timeout: Duration) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self {
            http,
            server_url: config.server_url.clone(),
            asset_id: config.asset_id.clone(),
            token: config.token.clone(),
            legacy_kc: config.is_legacy_kc(),
        })
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.token)
    }

    fn data_url(&self) -> String {
        format!(
            "{}/api/v2/assets/{}/data",
            self.server_url, self.asset_id
        )
    }

    /// Reads the asset definition: the ordered survey declarations and the
    /// choice lists. No retries; any failure aborts the whole operation.
    pub async fn fetch_schema(&self) -> Result<AssetSchema, FetchError> {
        let url = format!("{}/api/v2/assets/{}/", self.server_url, self.asset_id);
        let resp = self
            .http
            .get(&url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|_| FetchError::Connect)?;

        match resp.status().as_u16() {
            401 | 403 => return Err(FetchError::Auth),
            404 => return Err(FetchError::NotFound),
            s if !(200..300).contains(&s) => {
                let body = resp.text().await.unwrap_or_default();
                return Err(FetchError::Api(s, truncate(&body, 100)));
            }
            _ => {}
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        let survey = body
            .pointer("/content/survey")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        let choices = body
            .pointer("/content/choices")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        Ok(AssetSchema {
            survey: serde_json::from_value(survey).map_err(|e| FetchError::Parse(e.to_string()))?,
            choices: serde_json::from_value(choices)
                .map_err(|e| FetchError::Parse(e.to_string()))?,
        })
    }
}

#[derive(Deserialize)]
struct DataPage {
    #[serde(default)]
    results: Vec<Value>,
}

#[async_trait]
impl RecordSink for KoboClient {
    async fn existing_ids(&self) -> Result<HashSet<String>, FetchError> {
        let url = format!("{}/", self.data_url());
        let resp = self
            .http
            .get(&url)
            .query(&[("fields", r#"["_id"]"#), ("limit", EXISTING_ID_LIMIT)])
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            // Listing is a metadata read; use the short bound even on the
            // write client.
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(|_| FetchError::Connect)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Api(status, truncate(&body, 100)));
        }

        let page: DataPage = resp
            .json()
            .await
            .map_err(|e| FetchError::Parse(e.to_string()))?;
        let mut ids = HashSet::with_capacity(page.results.len());
        for item in page.results {
            match item.get("_id") {
                Some(Value::Number(n)) => {
                    ids.insert(n.to_string());
                }
                Some(Value::String(s)) => {
                    ids.insert(s.clone());
                }
                _ => {}
            }
        }
        Ok(ids)
    }

    async fn create_record(&self, mut submission: Map<String, Value>) -> Result<(), WriteError> {
        submission.insert(
            "meta".to_string(),
            json!({ "instanceID": format!("uuid:{}", Uuid::new_v4()) }),
        );
        let (url, payload) = if self.legacy_kc {
            (
                format!("{}/submission", self.server_url),
                json!({ "id": self.asset_id, "submission": Value::Object(submission) }),
            )
        } else {
            (
                format!(
                    "{}/api/v2/assets/{}/submissions/",
                    self.server_url, self.asset_id
                ),
                Value::Object(submission),
            )
        };

        let resp = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| WriteError::Network(e.to_string()))?;

        match resp.status().as_u16() {
            200 | 201 | 202 => Ok(()),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(WriteError::Remote {
                    status,
                    body: truncate(&body, 100),
                })
            }
        }
    }

    async fn patch_record(
        &self,
        record_id: i64,
        data: Map<String, Value>,
    ) -> Result<(), WriteError> {
        let url = format!("{}/bulk/", self.data_url());
        let payload = json!({
            "payload": { "submission_ids": [record_id], "data": Value::Object(data) }
        });

        let resp = self
            .http
            .patch(&url)
            .header("Authorization", self.auth_header())
            .header("Accept", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| WriteError::Network(e.to_string()))?;

        match resp.status().as_u16() {
            200 | 201 => Ok(()),
            status => {
                let body = resp.text().await.unwrap_or_default();
                Err(WriteError::Remote {
                    status,
                    body: truncate(&body, 50),
                })
            }
        }
    }
}

/// Clips server bodies quoted back to the stream; keeps char boundaries.
fn truncate(s: &str, max: usize) -> String {
    s.char_indices()
        .nth(max)
        .map(|(idx, _)| s[..idx].to_string())
        .unwrap_or_else(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("abcdef", 4), "abcd");
        assert_eq!(truncate("ab", 4), "ab");
        assert_eq!(truncate("ééééé", 3), "ééé");
    }

    #[test]
    fn survey_items_deserialize_from_asset_json() {
        let raw = serde_json::json!([
            {"type": "begin_group", "name": "household"},
            {"type": "select_one", "name": "region", "select_from_list_name": "regions"},
            {"type": "end_group"}
        ]);
        let items: Vec<SurveyItem> = serde_json::from_value(raw).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].kind.as_deref(), Some("select_one"));
        assert_eq!(items[1].select_from_list_name.as_deref(), Some("regions"));
        assert!(items[2].name.is_none());
    }
}
