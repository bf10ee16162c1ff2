//! HMAC-SHA256 authentication for the Bitget API.
//!
//! Bitget signs requests with base64-encoded HMAC-SHA256 over:
//! `timestamp + method + request_path(+ "?" + query) + body`
//!
//! # Security
//!
//! - Credentials are loaded from environment variables
//! - Secrets are held behind [`secrecy`] and never logged
//!
//! # Example
//!
//! ```ignore
//! use palisade_bitget::auth::{BitgetAuth, BitgetAuthConfig};
//!
//! let auth = BitgetAuth::from_env(&BitgetAuthConfig::default())?;
//! let headers = auth.sign("GET", "/api/v2/mix/position/all-position", "productType=USDT-FUTURES", "");
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use palisade_core::GatewayError;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Configuration
// =============================================================================

/// Environment variable names the credentials are read from.
#[derive(Debug, Clone)]
pub struct BitgetAuthConfig {
    /// Environment variable for the API key.
    pub api_key_env: String,

    /// Environment variable for the API secret.
    pub api_secret_env: String,

    /// Environment variable for the API passphrase.
    pub passphrase_env: String,
}

impl Default for BitgetAuthConfig {
    fn default() -> Self {
        Self {
            api_key_env: "BITGET_API_KEY".to_string(),
            api_secret_env: "BITGET_API_SECRET".to_string(),
            passphrase_env: "BITGET_PASSPHRASE".to_string(),
        }
    }
}

impl BitgetAuthConfig {
    /// Sets custom environment variable names.
    #[must_use]
    pub fn with_env_vars(
        mut self,
        api_key_env: impl Into<String>,
        api_secret_env: impl Into<String>,
        passphrase_env: impl Into<String>,
    ) -> Self {
        self.api_key_env = api_key_env.into();
        self.api_secret_env = api_secret_env.into();
        self.passphrase_env = passphrase_env.into();
        self
    }
}

// =============================================================================
// Signed Headers
// =============================================================================

/// Headers required for authenticated Bitget requests.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    /// ACCESS-KEY header.
    pub access_key: String,

    /// ACCESS-SIGN header (base64 HMAC-SHA256).
    pub signature: String,

    /// ACCESS-TIMESTAMP header (Unix milliseconds).
    pub timestamp: String,

    /// ACCESS-PASSPHRASE header.
    pub passphrase: String,
}

impl SignedHeaders {
    /// Returns headers as tuples for reqwest.
    #[must_use]
    pub fn as_tuples(&self) -> [(&'static str, &str); 4] {
        [
            ("ACCESS-KEY", &self.access_key),
            ("ACCESS-SIGN", &self.signature),
            ("ACCESS-TIMESTAMP", &self.timestamp),
            ("ACCESS-PASSPHRASE", &self.passphrase),
        ]
    }
}

// =============================================================================
// BitgetAuth
// =============================================================================

/// HMAC-SHA256 signer for Bitget API requests.
pub struct BitgetAuth {
    api_key: String,
    api_secret: SecretString,
    passphrase: SecretString,
}

impl BitgetAuth {
    /// Creates an authenticator from explicit credentials.
    #[must_use]
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: SecretString::from(api_secret.into()),
            passphrase: SecretString::from(passphrase.into()),
        }
    }

    /// Loads credentials from the configured environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Configuration`] if any variable is unset.
    pub fn from_env(config: &BitgetAuthConfig) -> Result<Self, GatewayError> {
        let read = |name: &str| {
            std::env::var(name)
                .map_err(|_| GatewayError::Configuration(format!("{name} is not set")))
        };

        Ok(Self::new(
            read(&config.api_key_env)?,
            read(&config.api_secret_env)?,
            read(&config.passphrase_env)?,
        ))
    }

    /// Signs one request with the current timestamp.
    ///
    /// `query` is the raw query string without the leading `?`; pass `""`
    /// when there is none. `body` is the exact JSON that will be sent.
    #[must_use]
    pub fn sign(&self, method: &str, path: &str, query: &str, body: &str) -> SignedHeaders {
        let timestamp = current_timestamp_millis().to_string();
        self.sign_at(&timestamp, method, path, query, body)
    }

    /// Signs with an explicit timestamp. Split out for deterministic tests.
    #[must_use]
    pub fn sign_at(
        &self,
        timestamp: &str,
        method: &str,
        path: &str,
        query: &str,
        body: &str,
    ) -> SignedHeaders {
        let request_path = if query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{query}")
        };
        let prehash = format!("{timestamp}{}{request_path}{body}", method.to_uppercase());

        let mut mac = HmacSha256::new_from_slice(self.api_secret.expose_secret().as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(prehash.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        SignedHeaders {
            access_key: self.api_key.clone(),
            signature,
            timestamp: timestamp.to_string(),
            passphrase: self.passphrase.expose_secret().to_string(),
        }
    }
}

impl std::fmt::Debug for BitgetAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitgetAuth")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

fn current_timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
