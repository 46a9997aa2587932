use crate::error::{ExchangeError, ExchangeResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Default signature validity window in milliseconds.
pub const DEFAULT_WINDOW_MS: u64 = 5000;

/// API credentials for one account. The secret is the base64-encoded
/// ED25519 seed; the key is the base64-encoded verifying key the exchange
/// knows the account by.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    #[must_use]
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.api_key.trim().is_empty() || self.api_secret.trim().is_empty()
    }

    /// Opaque cache identity derived from the public key. Never derived
    /// from the secret so that logs and cache keys stay harmless.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.api_key.as_bytes());
        hex::encode(&digest[..8])
    }

    fn signing_key(&self) -> ExchangeResult<SigningKey> {
        let bytes = BASE64
            .decode(self.api_secret.trim())
            .map_err(|e| ExchangeError::Signing(format!("secret is not valid base64: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ExchangeError::Signing("secret must decode to 32 bytes".to_string()))?;
        Ok(SigningKey::from_bytes(&seed))
    }
}

/// Header set attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub api_key: String,
    pub signature: String,
    pub timestamp: i64,
    pub window: u64,
}

/// Canonical signing payload: the instruction name, the sorted request
/// parameters, then timestamp and window.
#[must_use]
pub fn signing_payload(
    instruction: &str,
    params: &BTreeMap<String, String>,
    timestamp: i64,
    window: u64,
) -> String {
    let mut payload = format!("instruction={instruction}");
    for (k, v) in params {
        payload.push('&');
        payload.push_str(k);
        payload.push('=');
        payload.push_str(v);
    }
    payload.push_str(&format!("&timestamp={timestamp}&window={window}"));
    payload
}

/// Signs one request. Each call signs exactly once; retries must re-sign
/// with a fresh timestamp.
pub fn sign_request(
    credentials: &Credentials,
    instruction: &str,
    params: &BTreeMap<String, String>,
    timestamp: i64,
) -> ExchangeResult<SignedHeaders> {
    let key = credentials.signing_key()?;
    let payload = signing_payload(instruction, params, timestamp, DEFAULT_WINDOW_MS);
    let signature = key.sign(payload.as_bytes());

    Ok(SignedHeaders {
        api_key: credentials.api_key.clone(),
        signature: BASE64.encode(signature.to_bytes()),
        timestamp,
        window: DEFAULT_WINDOW_MS,
    })
}
