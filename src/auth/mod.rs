//! Authentication & Authorization
//! JWT claim validation at the transport edge, permission checks in the engine

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: String,
    pub permissions: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub account_id: Uuid,
    pub username: String,
    pub role: String,
    pub permissions: HashSet<String>,
}

impl AuthContext {
    pub fn new(account_id: Uuid, username: &str, permissions: &[&str]) -> Self {
        Self {
            account_id,
            username: username.to_string(),
            role: "user".to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission) || self.permissions.contains(permissions::ADMIN_FULL)
    }

    pub fn is_admin(&self) -> bool {
        self.permissions.contains(permissions::ADMIN_FULL)
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Token expired")]
    TokenExpired,
}

pub struct AuthService {
    decoding_key: DecodingKey,
}

impl AuthService {
    pub fn new(jwt_secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
        }
    }

    /// Validate token signature and expiry
    pub fn validate_token_claims(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            })?;

        Ok(token_data.claims)
    }

    pub fn claims_to_context(&self, claims: Claims) -> Result<AuthContext, AuthError> {
        let account_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AuthError::InvalidToken("Invalid UUID in subject".into()))?;

        Ok(AuthContext {
            account_id,
            username: claims.username,
            role: claims.role,
            permissions: claims.permissions.into_iter().collect(),
        })
    }

    pub fn authenticate(&self, token: &str) -> Result<AuthContext, AuthError> {
        let claims = self.validate_token_claims(token)?;
        self.claims_to_context(claims)
    }
}

pub mod permissions {
    pub const TRADES_EXECUTE: &str = "trades:execute";
    pub const STOCKS_CREATE: &str = "stocks:create";
    pub const BUYBACK_CREATE: &str = "buyback:create";
    pub const ADMIN_FULL: &str = "admin:full";
}
