//! API key resolution.
//!
//! The key comes from `TD_AUTH_KEY` when set, else from the credentials file
//! the auth CLI (an external collaborator) writes under the user config
//! directory. The core only reads it.

use directories::ProjectDirs;
use serde::Deserialize;

/// Environment override for the API key.
pub const ENV_AUTH_KEY: &str = "TD_AUTH_KEY";

/// File the auth CLI writes inside the user config dir.
pub const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Deserialize)]
struct Credentials {
    api_key: String,
}

/// Resolve the API key, if any.
#[must_use]
pub fn load_api_key() -> Option<String> {
    if let Ok(key) = std::env::var(ENV_AUTH_KEY) {
        let key = key.trim().to_string();
        if !key.is_empty() {
            return Some(key);
        }
    }
    let dirs = ProjectDirs::from("", "", "td")?;
    let path = dirs.config_dir().join(CREDENTIALS_FILE);
    let raw = std::fs::read_to_string(path).ok()?;
    let creds: Credentials = serde_json::from_str(&raw).ok()?;
    if creds.api_key.is_empty() {
        None
    } else {
        Some(creds.api_key)
    }
}
