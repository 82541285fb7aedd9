//! # Site Secrets
//!
//! The secrets file is a JSON object installed by a separate site package:
//! `clientCredentials` for the client, plus named string keys it can have
//! payloads signed with. The file may appear or change while the service
//! runs, so it is read on every request and never cached.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use std::path::PathBuf;
use tracing::{debug, error, warn};

type HmacSha256 = Hmac<Sha256>;

/// Body of a `sign` request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    pub payload: SignPayload,
    /// Field of the secrets file holding the key.
    pub key_name: String,
}

/// One string, or several signed one after the other.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SignPayload {
    One(String),
    Many(Vec<String>),
}

impl SignPayload {
    pub fn parts(&self) -> Vec<&[u8]> {
        match self {
            Self::One(part) => vec![part.as_bytes()],
            Self::Many(parts) => parts.iter().map(String::as_bytes).collect(),
        }
    }
}

/// Access to the secrets file.
#[derive(Debug, Clone, Default)]
pub struct SecretsFile {
    path: Option<PathBuf>,
}

impl SecretsFile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// The file's fields, or `None` when it is not configured, unreadable
    /// or not a JSON object.
    pub fn load(&self) -> Option<Map<String, Value>> {
        let Some(path) = &self.path else {
            error!("The path for the secrets file is not configured");
            return None;
        };
        debug!(path = %path.display(), "Reading secrets file");

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unable to read secrets file");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(Value::Object(fields)) => Some(fields),
            Ok(_) => {
                warn!(path = %path.display(), "Secrets file is not a JSON object");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unable to parse secrets file");
                None
            }
        }
    }

    /// `clientCredentials` from the file, or null.
    pub fn client_credentials(&self) -> Value {
        self.load()
            .and_then(|mut secrets| secrets.remove("clientCredentials"))
            .unwrap_or(Value::Null)
    }

    /// Hex HMAC-SHA256 of `request.payload` keyed with the secret named
    /// `request.key_name`. `None` when there is no such secret.
    pub fn sign(&self, request: &SignRequest) -> Option<String> {
        let secrets = self.load()?;
        match secrets.get(&request.key_name).and_then(Value::as_str) {
            Some(key) if !key.is_empty() => hmac_sha256_hex(key.as_bytes(), &request.payload.parts()),
            _ => {
                error!(
                    key_name = %request.key_name,
                    "Attempted to sign with a key that is not in the secrets file"
                );
                None
            }
        }
    }
}

/// Digest of `parts` fed in order, as lowercase hex.
pub fn hmac_sha256_hex(key: &[u8], parts: &[&[u8]]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    for part in parts {
        mac.update(part);
    }
    Some(hex::encode(mac.finalize().into_bytes()))
}
