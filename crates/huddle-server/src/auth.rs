//! Bearer JWT verification for XRPC routes.
//!
//! Callers authenticate with a short-lived service JWT issued for this
//! service. The issuer's signing key is looked up through a
//! [`SigningKeyResolver`], the signature and expiry are checked, the audience
//! must be this service's DID and, when the token names a method (`lxm`), it
//! must be the method being called.

use crate::error::ApiError;
use crate::handlers::AppState;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Bearer authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization` header.
    #[error("authorization header missing")]
    MissingAuthorization,

    /// The `Authorization` header is not a bearer token.
    #[error("authorization is not a bearer token")]
    NotBearer,

    /// The token could not be parsed.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// No signing key is available for the issuer.
    #[error("no signing key for {0}")]
    KeyUnavailable(String),

    /// The signature does not match the issuer's key.
    #[error("signature verification failed")]
    BadSignature,

    /// The claims were rejected (expired, wrong audience, missing claim).
    #[error("claims rejected: {0}")]
    Rejected(String),

    /// The token was issued for another method.
    #[error("token is bound to {found}, not {expected}")]
    MethodMismatch {
        /// Method being called.
        expected: String,
        /// Method named in the token.
        found: String,
    },
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature => Self::BadSignature,
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => Self::Malformed(err.to_string()),
            _ => Self::Rejected(err.to_string()),
        }
    }
}

/// Claims of an inter-service JWT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceClaims {
    /// Calling identity.
    pub iss: String,
    /// Intended service.
    pub aud: String,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
    /// Issued at, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Method the token is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lxm: Option<String>,
}

#[derive(Deserialize)]
struct Issuer {
    iss: String,
}

/// Looks up the key an issuer signs service tokens with.
#[async_trait]
pub trait SigningKeyResolver: Send + Sync {
    /// Return the verification key for `issuer`.
    ///
    /// `force_refresh` asks the resolver to bypass any cache; it is set when
    /// a previously resolved key failed to verify a signature.
    async fn signing_key(
        &self,
        issuer: &str,
        algorithm: Algorithm,
        force_refresh: bool,
    ) -> Result<DecodingKey, AuthError>;
}

/// Resolver returning one shared HMAC secret for every issuer.
pub struct StaticKeyResolver {
    key: Option<DecodingKey>,
}

impl StaticKeyResolver {
    /// Verify every issuer with `secret`.
    #[must_use]
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            key: Some(DecodingKey::from_secret(secret)),
        }
    }

    /// Resolver that knows no keys; every bearer token is rejected.
    #[must_use]
    pub fn disabled() -> Self {
        Self { key: None }
    }
}

#[async_trait]
impl SigningKeyResolver for StaticKeyResolver {
    async fn signing_key(
        &self,
        issuer: &str,
        algorithm: Algorithm,
        _force_refresh: bool,
    ) -> Result<DecodingKey, AuthError> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| AuthError::KeyUnavailable(issuer.to_string()))?;

        match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(key.clone()),
            other => Err(AuthError::KeyUnavailable(format!("{issuer} ({other:?})"))),
        }
    }
}

/// Verifies bearer JWTs addressed to this service.
pub struct JwtVerifier {
    audience: String,
    resolver: Arc<dyn SigningKeyResolver>,
}

impl JwtVerifier {
    /// Verify tokens addressed to `audience` using keys from `resolver`.
    pub fn new(audience: impl Into<String>, resolver: Arc<dyn SigningKeyResolver>) -> Self {
        Self {
            audience: audience.into(),
            resolver,
        }
    }

    /// Verify `jwt` for a call to `method`, returning its claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed, its issuer's key cannot be
    /// resolved, the signature or claims do not check out, or it is bound to
    /// another method.
    pub async fn verify(&self, jwt: &str, method: &str) -> Result<ServiceClaims, AuthError> {
        let header = decode_header(jwt)?;
        let issuer = peek_issuer(jwt, header.alg)?;

        let claims = match self.verify_with_key(jwt, &issuer, header.alg, false).await {
            Err(AuthError::BadSignature) => {
                debug!(issuer = %issuer, "Signature mismatch, refreshing signing key");
                self.verify_with_key(jwt, &issuer, header.alg, true).await?
            }
            result => result?,
        };

        if let Some(lxm) = &claims.lxm {
            if lxm != method {
                return Err(AuthError::MethodMismatch {
                    expected: method.to_string(),
                    found: lxm.clone(),
                });
            }
        }

        Ok(claims)
    }

    async fn verify_with_key(
        &self,
        jwt: &str,
        issuer: &str,
        algorithm: Algorithm,
        force_refresh: bool,
    ) -> Result<ServiceClaims, AuthError> {
        let key = self
            .resolver
            .signing_key(issuer, algorithm, force_refresh)
            .await?;

        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);

        Ok(decode::<ServiceClaims>(jwt, &key, &validation)?.claims)
    }
}

/// Read `iss` without checking anything else.
fn peek_issuer(jwt: &str, algorithm: Algorithm) -> Result<String, AuthError> {
    let mut validation = Validation::new(algorithm);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<Issuer>(jwt, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| AuthError::Malformed(e.to_string()))?;
    Ok(data.claims.iss)
}

/// Extract the token from `Authorization: Bearer <token>`.
///
/// # Errors
///
/// Returns an error if the header is missing or not a bearer token.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuthorization)?;
    value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::NotBearer)
}

/// An XRPC caller whose bearer token checked out.
#[derive(Debug, Clone)]
pub struct AuthedCaller {
    /// Caller identity (the token's issuer).
    pub did: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthedCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let method = parts.uri.path().strip_prefix("/xrpc/").unwrap_or_default();
        let jwt = bearer_token(&parts.headers)?;
        let claims = state.verifier.verify(jwt, method).await?;

        Ok(Self { did: claims.iss })
    }
}
