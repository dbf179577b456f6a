//! Request-level configuration shared by the clone and update operations.

use serde::{Deserialize, Serialize};

/// Validated connection settings for one sync run: where to talk to, with
/// which credential, about which asset.
///
/// Construction through [`SyncConfig::new`] is the only path; a value of this
/// type always holds a normalized server URL, a plausible token and a
/// well-formed asset id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    pub server_url: String,
    pub token: String,
    pub asset_id: String,
}

impl SyncConfig {
    /// Normalizes and validates raw form inputs.
    ///
    /// Rules mirror what the hosted tool has always enforced: the URL gets an
    /// `https://` prefix and loses trailing slashes, the token must be at
    /// least 10 characters, the asset id at least 5 alphanumeric characters.
    pub fn new(server_url: &str, token: &str, asset_id: &str) -> Result<Self, String> {
        let server_url = normalize_server_url(server_url);
        if server_url.is_empty() {
            return Err("Server URL is required.".to_string());
        }
        let token = token.trim();
        if token.len() < 10 {
            return Err("API token appears too short.".to_string());
        }
        let asset_id = asset_id.trim();
        if asset_id.len() < 5 {
            return Err("Asset ID appears too short.".to_string());
        }
        if !asset_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err("Asset ID must be alphanumeric characters only.".to_string());
        }
        Ok(Self {
            server_url,
            token: token.to_string(),
            asset_id: asset_id.to_string(),
        })
    }

    /// Legacy self-hosted kc instances take submissions on a different
    /// endpoint with a wrapped payload.
    pub fn is_legacy_kc(&self) -> bool {
        self.server_url.contains("kobo-kc") || self.server_url.contains("savethechildren")
    }
}

/// Lower-cases, prepends `https://` when no scheme is present and strips
/// trailing slashes. An empty or whitespace-only input stays empty.
pub fn normalize_server_url(raw: &str) -> String {
    let v = raw.trim().to_lowercase();
    if v.is_empty() {
        return v;
    }
    let v = if v.starts_with("http://") || v.starts_with("https://") {
        v
    } else {
        format!("https://{}", v)
    };
    v.trim_end_matches('/').to_string()
}
