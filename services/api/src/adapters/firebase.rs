//! services/api/src/adapters/firebase.rs
//!
//! Bearer token verification. `FirebaseTokenVerifier` checks Firebase ID tokens
//! against Google's published signing certificates; `MockTokenVerifier` accepts
//! the fixed tokens of the seeded mock accounts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use curriculum_portal_core::ports::{PortError, PortResult, TokenVerifier, VerifiedIdentity};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use super::memory::MOCK_USERS;

const FIREBASE_CERTS_URL: &str =
    "https://www.googleapis.com/robot/v1/metadata/x509/securetoken@system.gserviceaccount.com";
const FIREBASE_ISSUER_PREFIX: &str = "https://securetoken.google.com/";

/// Lower bound on how long fetched keys are trusted.
const MIN_CACHE_TTL_SECS: i64 = 300;
/// Used when the certificate response has no usable `Cache-Control`.
const DEFAULT_CACHE_TTL_SECS: i64 = 3600;

struct CachedKeys {
    /// Key id to PEM-encoded public key.
    keys: HashMap<String, String>,
    expires_at: DateTime<Utc>,
}

/// The claims this service reads from a Firebase ID token.
#[derive(Debug, Clone, Deserialize)]
struct FirebaseClaims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Verifies Firebase ID tokens (RS256) for one project.
pub struct FirebaseTokenVerifier {
    project_id: String,
    http_client: Client,
    cached_keys: Arc<RwLock<Option<CachedKeys>>>,
}

impl FirebaseTokenVerifier {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            http_client: Client::new(),
            cached_keys: Arc::new(RwLock::new(None)),
        }
    }

    async fn public_key(&self, kid: &str) -> PortResult<String> {
        if let Some(key) = self.cached_key(kid).await {
            debug!(kid, "Using cached Firebase public key");
            return Ok(key);
        }

        self.refresh_keys().await?;
        self.cached_key(kid).await.ok_or_else(|| {
            debug!(kid, "Firebase public key not found for kid");
            PortError::Unauthorized
        })
    }

    async fn cached_key(&self, kid: &str) -> Option<String> {
        let cache = self.cached_keys.read().await;
        cache
            .as_ref()
            .filter(|cached| cached.expires_at > Utc::now())
            .and_then(|cached| cached.keys.get(kid).cloned())
    }

    async fn refresh_keys(&self) -> PortResult<()> {
        info!("Fetching Firebase public keys from Google");

        let response = self
            .http_client
            .get(FIREBASE_CERTS_URL)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to fetch Firebase public keys");
                PortError::Unavailable(format!("Failed to fetch Firebase public keys: {e}"))
            })?;

        let cache_ttl = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_max_age)
            .unwrap_or(DEFAULT_CACHE_TTL_SECS)
            .max(MIN_CACHE_TTL_SECS);

        let certs: HashMap<String, String> = response.json().await.map_err(|e| {
            warn!(error = %e, "Failed to parse Firebase public keys response");
            PortError::Unexpected(format!("Failed to parse Firebase public keys: {e}"))
        })?;

        let keys = convert_certs_to_keys(certs)?;
        let expires_at = Utc::now() + Duration::seconds(cache_ttl);
        info!(num_keys = keys.len(), cache_ttl_secs = cache_ttl, "Firebase public keys cached");

        *self.cached_keys.write().await = Some(CachedKeys { keys, expires_at });
        Ok(())
    }
}

#[async_trait]
impl TokenVerifier for FirebaseTokenVerifier {
    async fn verify(&self, token: &str) -> PortResult<VerifiedIdentity> {
        let header = decode_header(token).map_err(|e| {
            debug!(error = %e, "Failed to decode token header");
            PortError::Unauthorized
        })?;
        let kid = header.kid.ok_or_else(|| {
            debug!("Token missing key id");
            PortError::Unauthorized
        })?;

        let pem = self.public_key(&kid).await?;
        let decoding_key = DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| {
            warn!(error = %e, kid = %kid, "Failed to create decoding key from PEM");
            PortError::Unexpected(format!("Invalid public key: {e}"))
        })?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.project_id]);
        validation.set_issuer(&[format!("{FIREBASE_ISSUER_PREFIX}{}", self.project_id)]);

        let claims = decode::<FirebaseClaims>(token, &decoding_key, &validation)
            .map_err(|e| {
                match e.kind() {
                    ErrorKind::ExpiredSignature => debug!("Token expired"),
                    other => debug!(error = ?other, "Token validation failed"),
                }
                PortError::Unauthorized
            })?
            .claims;

        debug!(uid = %claims.sub, "Token verified");
        Ok(VerifiedIdentity {
            uid: claims.sub,
            email: claims.email,
            name: claims.name,
        })
    }
}

fn convert_certs_to_keys(certs: HashMap<String, String>) -> PortResult<HashMap<String, String>> {
    let mut keys = HashMap::with_capacity(certs.len());
    for (kid, cert_pem) in certs {
        match public_key_pem(&cert_pem) {
            Ok(pem) => {
                keys.insert(kid, pem);
            }
            Err(e) => warn!(kid = %kid, error = %e, "Failed to extract public key from certificate"),
        }
    }

    if keys.is_empty() {
        return Err(PortError::Unexpected("No valid Firebase public keys found".to_string()));
    }
    Ok(keys)
}

/// `"public, max-age=3600, must-revalidate"` -> `3600`
fn parse_max_age(cache_control: &str) -> Option<i64> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|s| s.strip_prefix("max-age="))
        .and_then(|s| s.parse().ok())
}

/// Re-encodes the subject public key of an X.509 certificate as a PEM block.
fn public_key_pem(cert_pem: &str) -> PortResult<String> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| PortError::Unexpected(format!("Failed to parse X.509 PEM: {e}")))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| PortError::Unexpected(format!("Failed to parse X.509 certificate: {e}")))?;

    let encoded = STANDARD.encode(cert.public_key().raw);
    let body = encoded
        .as_bytes()
        .chunks(64)
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(format!("-----BEGIN PUBLIC KEY-----\n{body}\n-----END PUBLIC KEY-----"))
}

//=========================================================================================
// Mock Verifier
//=========================================================================================

/// Accepts only the fixed tokens of the mock accounts.
#[derive(Debug, Clone)]
pub struct MockTokenVerifier {
    tokens: HashMap<String, VerifiedIdentity>,
}

impl Default for MockTokenVerifier {
    fn default() -> Self {
        let tokens = MOCK_USERS
            .iter()
            .map(|user| {
                (
                    user.token.to_string(),
                    VerifiedIdentity {
                        uid: user.uid.to_string(),
                        email: Some(user.email.to_string()),
                        name: Some(user.full_name.to_string()),
                    },
                )
            })
            .collect();
        Self { tokens }
    }
}

impl MockTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token for an extra identity, e.g. a user who has not registered yet.
    pub fn with_token(mut self, token: &str, identity: VerifiedIdentity) -> Self {
        self.tokens.insert(token.to_string(), identity);
        self
    }
}

#[async_trait]
impl TokenVerifier for MockTokenVerifier {
    async fn verify(&self, token: &str) -> PortResult<VerifiedIdentity> {
        self.tokens.get(token).cloned().ok_or(PortError::Unauthorized)
    }
}
