//! Authentication and authorization filter.
//!
//! Credential verification is delegated: the filter extracts a `Bearer` or
//! `Basic` credential and hands it to the [`TokenValidator`] capability, then
//! consults the [`RevocationSet`]. Revocation-set failures fail closed: a
//! request whose revocation status cannot be determined is rejected. Calls
//! from internal services carry `X-User-ID` instead of a credential and are
//! resolved against the [`SessionStore`].
//!
//! Admin paths (`/api/admin/`) additionally require an `ADMIN` or
//! `ROLE_ADMIN` role, case-insensitive.

use crate::context::{Identity, RequestContext};
use crate::models::error::GatewayError;
use crate::models::settings::JwtSettings;
use actix_web::HttpRequest;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Paths that skip authentication entirely (exact-prefix match).
pub const AUTH_SKIP_PATHS: &[&str] = &[
    "/api/auth/login",
    "/api/auth/register",
    "/api/auth/refresh",
    "/api/public/",
    "/api/health",
    "/actuator/health",
    "/swagger-ui/",
    "/v3/api-docs/",
];

const ADMIN_PATH_PREFIX: &str = "/api/admin/";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credential: {0}")]
    Invalid(String),

    #[error("auth backend unavailable: {0}")]
    Unavailable(String),
}

/// A validated credential: the identity plus the token id used for
/// revocation checks.
#[derive(Debug, Clone)]
pub struct ValidatedToken {
    pub identity: Identity,
    pub token_id: Option<String>,
}

/// Token validation capability. The identity service owns credentials; the
/// gateway only consumes this contract.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, credential: &str) -> Result<ValidatedToken, AuthError>;
}

/// Revoked-token lookup keyed by token id. Failures here fail closed.
#[async_trait]
pub trait RevocationSet: Send + Sync {
    async fn is_revoked(&self, token_id: &str) -> Result<bool, AuthError>;
}

/// Server-issued session lookup for internal `X-User-ID` calls.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn lookup(&self, user_id: &str) -> Result<Option<Identity>, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
    #[serde(default)]
    iat: Option<usize>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    aud: Option<String>,
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    jti: Option<String>,
}

/// JWT-backed token validator.
pub struct JwtTokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtTokenValidator {
    pub fn new(settings: &JwtSettings) -> Self {
        let algorithms: Vec<Algorithm> = settings
            .algorithms
            .iter()
            .filter_map(|a| a.parse().ok())
            .collect();
        let algorithms = if algorithms.is_empty() {
            vec![Algorithm::HS256]
        } else {
            algorithms
        };

        let mut validation = Validation::new(algorithms[0]);
        validation.algorithms = algorithms;
        if let Some(issuer) = &settings.issuer {
            validation.set_issuer(&[issuer]);
        }
        if !settings.audiences.is_empty() {
            validation.set_audience(&settings.audiences);
        }

        Self {
            decoding_key: DecodingKey::from_secret(settings.secret.as_ref()),
            validation,
        }
    }
}

#[async_trait]
impl TokenValidator for JwtTokenValidator {
    async fn validate(&self, credential: &str) -> Result<ValidatedToken, AuthError> {
        let data = decode::<Claims>(credential, &self.decoding_key, &self.validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;

        let claims = data.claims;
        Ok(ValidatedToken {
            identity: Identity {
                user_id: claims.sub,
                tenant_id: claims.tenant_id,
                roles: claims.roles.unwrap_or_default(),
                client_id: claims.client_id,
            },
            token_id: claims.jti,
        })
    }
}

/// In-process revocation set; the production deployment points this at the
/// identity service's revocation feed.
#[derive(Default)]
pub struct MemoryRevocationSet {
    revoked: DashMap<String, ()>,
}

impl MemoryRevocationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self, token_id: impl Into<String>) {
        self.revoked.insert(token_id.into(), ());
    }
}

#[async_trait]
impl RevocationSet for MemoryRevocationSet {
    async fn is_revoked(&self, token_id: &str) -> Result<bool, AuthError> {
        Ok(self.revoked.contains_key(token_id))
    }
}

/// In-process session records for internal-service calls.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Identity>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: Identity) {
        self.sessions.insert(identity.user_id.clone(), identity);
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn lookup(&self, user_id: &str) -> Result<Option<Identity>, AuthError> {
        Ok(self.sessions.get(user_id).map(|s| s.clone()))
    }
}

pub struct AuthVerifier {
    validator: Arc<dyn TokenValidator>,
    revocations: Arc<dyn RevocationSet>,
    sessions: Arc<dyn SessionStore>,
    skip_paths: Vec<String>,
    header: String,
    prefix: String,
}

impl AuthVerifier {
    pub fn new(
        validator: Arc<dyn TokenValidator>,
        revocations: Arc<dyn RevocationSet>,
        sessions: Arc<dyn SessionStore>,
        extra_skip_paths: &[String],
        settings: &JwtSettings,
    ) -> Self {
        let mut skip_paths: Vec<String> =
            AUTH_SKIP_PATHS.iter().map(|p| p.to_string()).collect();
        skip_paths.extend(extra_skip_paths.iter().cloned());

        Self {
            validator,
            revocations,
            sessions,
            skip_paths,
            header: settings.header.clone(),
            prefix: settings.prefix.clone(),
        }
    }

    /// Authenticates the request and tags the context with its identity.
    pub async fn verify(
        &self,
        req: &HttpRequest,
        ctx: &mut RequestContext,
    ) -> Result<(), GatewayError> {
        if self.is_whitelisted(&ctx.path) {
            debug!("path {} bypasses authentication", ctx.path);
            return Ok(());
        }

        let header_value = req
            .headers()
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok());

        let identity = match header_value {
            Some(value) => self.authenticate_credential(value).await?,
            None => self.authenticate_internal(req).await?,
        };

        ctx.with_identity(identity);

        if ctx.path.starts_with(ADMIN_PATH_PREFIX) {
            let is_admin = ctx
                .identity
                .as_ref()
                .map(|id| id.is_admin())
                .unwrap_or(false);
            if !is_admin {
                return Err(GatewayError::Forbidden {
                    message: "admin role required".to_string(),
                });
            }
        }

        Ok(())
    }

    fn is_whitelisted(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    async fn authenticate_credential(&self, value: &str) -> Result<Identity, GatewayError> {
        let bearer_prefix = format!("{} ", self.prefix);

        let credential = if let Some(token) = value.strip_prefix(&bearer_prefix) {
            token.to_string()
        } else if let Some(encoded) = value.strip_prefix("Basic ") {
            // Decoded `user:pass` goes to the validator as an opaque
            // credential; verification stays with the identity service.
            let decoded = BASE64
                .decode(encoded.trim())
                .map_err(|_| GatewayError::Unauthorized {
                    message: "malformed basic credentials".to_string(),
                })?;
            String::from_utf8(decoded).map_err(|_| GatewayError::Unauthorized {
                message: "malformed basic credentials".to_string(),
            })?
        } else {
            return Err(GatewayError::Unauthorized {
                message: format!("authorization header must use the {} scheme", self.prefix),
            });
        };

        let validated = match self.validator.validate(&credential).await {
            Ok(validated) => validated,
            Err(AuthError::Invalid(reason)) => {
                debug!("token rejected: {}", reason);
                return Err(GatewayError::Unauthorized {
                    message: "invalid or expired token".to_string(),
                });
            }
            Err(AuthError::Unavailable(reason)) => {
                warn!("token validator unavailable: {}", reason);
                return Err(GatewayError::Unauthorized {
                    message: "credential verification unavailable".to_string(),
                });
            }
        };

        if let Some(token_id) = &validated.token_id {
            // Fail closed: unknown revocation status rejects the request.
            let revoked = self
                .revocations
                .is_revoked(token_id)
                .await
                .map_err(|e| {
                    warn!("revocation lookup failed: {}", e);
                    GatewayError::Unauthorized {
                        message: "credential verification unavailable".to_string(),
                    }
                })?;
            if revoked {
                return Err(GatewayError::Unauthorized {
                    message: "token has been revoked".to_string(),
                });
            }
        }

        Ok(validated.identity)
    }

    /// Internal-service call: no credential, but a server-issued session
    /// referenced by `X-User-ID`.
    async fn authenticate_internal(&self, req: &HttpRequest) -> Result<Identity, GatewayError> {
        let Some(user_id) = req
            .headers()
            .get("X-User-ID")
            .and_then(|v| v.to_str().ok())
        else {
            return Err(GatewayError::Unauthorized {
                message: "missing authorization header".to_string(),
            });
        };

        match self.sessions.lookup(user_id).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => Err(GatewayError::Unauthorized {
                message: "unknown session".to_string(),
            }),
            Err(e) => {
                warn!("session lookup failed: {}", e);
                Err(GatewayError::Unauthorized {
                    message: "credential verification unavailable".to_string(),
                })
            }
        }
    }
}

/// Builds a signed token for tests.
pub fn create_test_token(
    user_id: &str,
    roles: &[&str],
    tenant_id: Option<&str>,
    secret: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs() as usize;

    let claims = Claims {
        sub: user_id.to_string(),
        exp: now + 3600,
        iat: Some(now),
        iss: None,
        aud: None,
        roles: Some(roles.iter().map(|r| r.to_string()).collect()),
        tenant_id: tenant_id.map(|t| t.to_string()),
        client_id: None,
        jti: Some(format!("{}-token", user_id)),
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )
}
