//! Authentication middleware: Bearer, Basic, API-key, and JWT variants.
//!
//! On success the principal lands in the context (plus the `user` /
//! `user_id` attributes); on failure the request fails with Unauthorized
//! and the response carries a `WWW-Authenticate` challenge.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use tracing::debug;

use weft_core::error::Error;
use weft_core::message::Context;
use weft_core::middleware::{Entry, PRIORITY_AUTH};

use crate::principal::Principal;

/// Validates an opaque bearer token into a principal.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Principal, Error>;
}

/// Verifies a username/password pair.
pub trait CredentialsVerifier: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> Option<Principal>;
}

fn reject(ctx: &mut Context, challenge: &str, reason: String) {
    debug!(target: "weft::auth", endpoint = %ctx.request().endpoint, %reason, "authentication failed");
    ctx.response_mut()
        .headers
        .set("WWW-Authenticate", challenge.to_string());
    ctx.fail(Error::Unauthorized(reason));
}

/// Bearer-token authentication with a pluggable validator.
pub fn bearer_auth(validator: Arc<dyn TokenValidator>) -> Entry {
    Entry::new("auth", PRIORITY_AUTH, move |mut ctx, next| {
        let validator = validator.clone();
        Box::pin(async move {
            let token = ctx
                .request()
                .headers
                .get("Authorization")
                .and_then(|h| h.strip_prefix("Bearer "))
                .map(|t| t.trim().to_string());
            let Some(token) = token else {
                reject(&mut ctx, "Bearer", "missing bearer token".into());
                return ctx;
            };
            match validator.validate(&token) {
                Ok(principal) => {
                    principal.store(&mut ctx);
                    next.run(ctx).await
                }
                Err(e) => {
                    reject(&mut ctx, "Bearer", e.message().to_string());
                    ctx
                }
            }
        })
    })
}

/// HTTP Basic authentication.
pub fn basic_auth(verifier: Arc<dyn CredentialsVerifier>) -> Entry {
    Entry::new("auth", PRIORITY_AUTH, move |mut ctx, next| {
        let verifier = verifier.clone();
        Box::pin(async move {
            let decoded = ctx
                .request()
                .headers
                .get("Authorization")
                .and_then(|h| h.strip_prefix("Basic "))
                .and_then(|b64| base64::engine::general_purpose::STANDARD.decode(b64.trim()).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());
            let Some(decoded) = decoded else {
                reject(&mut ctx, "Basic", "missing basic credentials".into());
                return ctx;
            };
            let Some((username, password)) = decoded.split_once(':') else {
                reject(&mut ctx, "Basic", "malformed basic credentials".into());
                return ctx;
            };
            match verifier.verify(username, password) {
                Some(principal) => {
                    principal.store(&mut ctx);
                    next.run(ctx).await
                }
                None => {
                    reject(&mut ctx, "Basic", "invalid credentials".into());
                    ctx
                }
            }
        })
    })
}

/// API-key authentication against a static key table.
pub fn api_key_auth(keys: HashMap<String, Principal>) -> Entry {
    api_key_auth_with_header(keys, "X-API-Key")
}

pub fn api_key_auth_with_header(
    keys: HashMap<String, Principal>,
    header_name: &'static str,
) -> Entry {
    let keys = Arc::new(keys);
    Entry::new("auth", PRIORITY_AUTH, move |mut ctx, next| {
        let keys = keys.clone();
        Box::pin(async move {
            let principal = ctx
                .request()
                .headers
                .get(header_name)
                .and_then(|key| keys.get(key))
                .cloned();
            match principal {
                Some(principal) => {
                    principal.store(&mut ctx);
                    next.run(ctx).await
                }
                None => {
                    reject(&mut ctx, "ApiKey", "missing or unknown API key".into());
                    ctx
                }
            }
        })
    })
}

/// Settings for HMAC-signed JWT validation.
#[derive(Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

impl JwtConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            issuer: None,
            audience: None,
        }
    }
}

/// Validates HS256 JWTs into principals: `sub` becomes the id, `roles` and
/// `permissions` arrays map directly, remaining claims land in attributes.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(config: JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<Principal, Error> {
        let data = decode::<serde_json::Value>(token, &self.key, &self.validation)
            .map_err(|e| Error::Unauthorized(format!("invalid token: {e}")))?;
        let claims = data.claims;

        let sub = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Unauthorized("token missing sub claim".into()))?;
        let mut principal = Principal::new(sub);

        if let Some(roles) = claims.get("roles").and_then(|v| v.as_array()) {
            for role in roles.iter().filter_map(|r| r.as_str()) {
                principal.roles.insert(role.to_string());
            }
        }
        if let Some(permissions) = claims.get("permissions").and_then(|v| v.as_array()) {
            for permission in permissions.iter().filter_map(|p| p.as_str()) {
                principal.permissions.insert(permission.to_string());
            }
        }
        if let Some(object) = claims.as_object() {
            for (key, value) in object {
                if !matches!(key.as_str(), "sub" | "roles" | "permissions") {
                    principal.attributes.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(principal)
    }
}

/// JWT authentication middleware.
pub fn jwt_auth(config: JwtConfig) -> Entry {
    bearer_auth(Arc::new(JwtValidator::new(config)))
}
