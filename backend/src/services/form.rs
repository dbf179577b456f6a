//! Multipart extraction for the clone and update endpoints.
//!
//! Both operations post the same `multipart/form-data` shape: text fields
//! with connection settings and run flags, plus one `file` part carrying the
//! CSV bytes. Fields may arrive in any order.

use actix_multipart::Multipart;
use futures_util::StreamExt;

/// Raw form inputs, prior to [`common::requests::SyncConfig`] validation.
#[derive(Default)]
pub struct SyncForm {
    pub server_url: String,
    pub token: String,
    pub asset_id: String,
    /// False requests a preview pass: validation only, no writes.
    pub confirmed: bool,
    /// Resume cursor — rows already handled by a previous preview.
    pub skip_rows: usize,
    /// Fail fast on table columns the survey does not know.
    pub strict: bool,
    pub file: Vec<u8>,
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

pub async fn read_sync_form(mut payload: Multipart) -> Result<SyncForm, String> {
    let mut form = SyncForm::default();
    let mut saw_file = false;

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| format!("Upload error: {}", e))?;
        let name = field
            .content_disposition()
            .and_then(|cd| cd.get_name().map(|n| n.to_string()))
            .unwrap_or_default();

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| format!("Upload error: {}", e))?;
            bytes.extend_from_slice(&chunk);
        }

        if name == "file" {
            form.file = bytes;
            saw_file = true;
            continue;
        }

        let value = String::from_utf8(bytes)
            .map_err(|_| format!("Form field '{}' is not valid UTF-8.", name))?;
        match name.as_str() {
            "server_url" => form.server_url = value,
            "token" => form.token = value,
            // Clone historically posts `target_asset_id`; accept both.
            "asset_id" | "target_asset_id" => form.asset_id = value,
            "confirmed" => form.confirmed = parse_flag(&value),
            "strict" => form.strict = parse_flag(&value),
            "skip_rows" => {
                form.skip_rows = value
                    .trim()
                    .parse()
                    .map_err(|_| "skip_rows must be a non-negative integer.".to_string())?;
            }
            _ => {}
        }
    }

    if !saw_file {
        return Err("Missing file".to_string());
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing_accepts_common_truthy_spellings() {
        assert!(parse_flag("true"));
        assert!(parse_flag(" TRUE "));
        assert!(parse_flag("1"));
        assert!(parse_flag("yes"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }
}
