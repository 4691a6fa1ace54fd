//! Exchange credentials and bearer-token signing
//!
//! Private endpoints take an HS256 JWT carrying the access key, a random
//! nonce, issue/expiry times and, when the call has parameters, the SHA-512
//! hash of its query string.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use sha2::{Digest, Sha256, Sha512};

use crate::error::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

/// Token lifetime in seconds
const TOKEN_TTL_SECS: i64 = 30;

/// API key pair for one exchange account
#[derive(Clone)]
pub struct Credentials {
    access_key: String,
    secret_key: SecretString,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: SecretString::from(secret_key.into()),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Resolves a bot's credential reference to a key pair
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, credential_ref: &str) -> Result<Credentials, ExchangeError>;
}

#[derive(Serialize)]
struct Header {
    alg: &'static str,
    typ: &'static str,
}

#[derive(Serialize)]
struct Claims<'a> {
    access_key: &'a str,
    nonce: String,
    iat: i64,
    exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_hash_alg: Option<&'static str>,
}

/// Join parameters into the unencoded `k=v&k=v` form that gets hashed
pub fn query_string(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Hex SHA-512 of a query string
pub fn query_hash(query: &str) -> String {
    hex::encode(Sha512::digest(query.as_bytes()))
}

/// Signs bearer tokens for one set of credentials
pub struct TokenSigner<'a> {
    credentials: &'a Credentials,
}

impl<'a> TokenSigner<'a> {
    pub fn new(credentials: &'a Credentials) -> Self {
        Self { credentials }
    }

    /// Build a signed token; `query` is the parameter string, if any
    pub fn token(&self, query: Option<&str>, now_secs: i64) -> Result<String, ExchangeError> {
        let header = Header {
            alg: "HS256",
            typ: "JWT",
        };
        let claims = Claims {
            access_key: self.credentials.access_key(),
            nonce: uuid::Uuid::new_v4().to_string(),
            iat: now_secs,
            exp: now_secs + TOKEN_TTL_SECS,
            query_hash: query.filter(|q| !q.is_empty()).map(query_hash),
            query_hash_alg: query.filter(|q| !q.is_empty()).map(|_| "SHA512"),
        };

        let signing_input = format!("{}.{}", encode_part(&header)?, encode_part(&claims)?);

        let mut mac =
            HmacSha256::new_from_slice(self.credentials.secret_key.expose_secret().as_bytes())
                .map_err(|e| ExchangeError::Signing(e.to_string()))?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature}"))
    }

    /// `Authorization` header value
    pub fn bearer(&self, query: Option<&str>, now_secs: i64) -> Result<String, ExchangeError> {
        Ok(format!("Bearer {}", self.token(query, now_secs)?))
    }
}

fn encode_part<T: Serialize>(value: &T) -> Result<String, ExchangeError> {
    let bytes = serde_json::to_vec(value).map_err(|e| ExchangeError::Signing(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}
