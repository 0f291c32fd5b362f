//! JWT Authentication
//!
//! Validates JWTs from an external auth provider (e.g. a Telegram WebApp
//! backend). The server never issues tokens.
//!
//! Identity rule for every request that names a user:
//! - auth configured: a valid token is required, its `sub` is the user id,
//!   and any declared `userId` must equal it;
//! - auth not configured: the declared id is trusted as-is (an upstream
//!   gateway is assumed to have authenticated it).

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::ledger::balance::UserId;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format (preferred for external providers).
    pub public_key_pem: Option<String>,
    /// HS256 secret (fallback for simple setups).
    pub secret: Option<String>,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

/// Standard JWT claims we expect from auth providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the user id.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer (auth provider).
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
}

impl TokenClaims {
    /// The authenticated user.
    pub fn user_id(&self) -> UserId {
        UserId::new(self.sub.clone())
    }
}

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Auth is configured but the request carried no token.
    #[error("missing token")]
    MissingToken,
    /// Neither a token nor a user id was supplied.
    #[error("missing user id")]
    MissingUserId,
    /// Declared user id differs from the token subject.
    #[error("user id does not match token subject")]
    UserMismatch,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

/// Token validator with the key and rules prepared once.
#[derive(Clone)]
pub struct Authenticator {
    verifier: Option<(DecodingKey, Validation)>,
    skip_expiry: bool,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl Authenticator {
    /// Prepare a validator. Fails only on an unparsable public key.
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let key = if let Some(ref pem) = config.public_key_pem {
            let key = DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
            Some((key, Algorithm::RS256))
        } else {
            config
                .secret
                .as_ref()
                .map(|secret| (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256))
        };

        let verifier = key.map(|(key, algorithm)| {
            let mut validation = Validation::new(algorithm);
            validation.required_spec_claims = HashSet::new();
            if let Some(ref issuer) = config.issuer {
                validation.set_issuer(&[issuer]);
            }
            match config.audience {
                Some(ref audience) => validation.set_audience(&[audience]),
                None => validation.validate_aud = false,
            }
            if config.skip_expiry {
                validation.validate_exp = false;
            }
            (key, validation)
        });

        Ok(Self { verifier, skip_expiry: config.skip_expiry })
    }

    /// Accept every declared id. For deployments behind an authenticating gateway.
    pub fn disabled() -> Self {
        Self { verifier: None, skip_expiry: false }
    }

    /// Whether tokens are checked.
    pub fn is_configured(&self) -> bool {
        self.verifier.is_some()
    }

    /// Validate a JWT and extract its claims.
    pub fn validate(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let (key, validation) = self.verifier.as_ref().ok_or(AuthError::NotConfigured)?;
        let claims = decode::<TokenClaims>(token, key, validation)
            .map_err(map_jwt_error)?
            .claims;

        if claims.sub.is_empty() {
            return Err(AuthError::MissingClaim("sub".into()));
        }

        // Expiry is optional in the claims; enforce it when present
        if !self.skip_expiry && claims.exp > 0 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            if now > claims.exp {
                return Err(AuthError::Expired);
            }
        }

        Ok(claims)
    }

    /// Resolve the user a request acts for.
    pub fn authorize(&self, declared: Option<&str>, token: Option<&str>) -> Result<UserId, AuthError> {
        if !self.is_configured() {
            let declared = declared.filter(|id| !id.is_empty()).ok_or(AuthError::MissingUserId)?;
            warn!(user = declared, "Trusting declared user id without token validation");
            return Ok(UserId::new(declared));
        }

        let token = token.filter(|t| !t.is_empty()).ok_or(AuthError::MissingToken)?;
        let claims = self.validate(token)?;
        match declared {
            Some(id) if !id.is_empty() && id != claims.sub => Err(AuthError::UserMismatch),
            _ => Ok(claims.user_id()),
        }
    }
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
