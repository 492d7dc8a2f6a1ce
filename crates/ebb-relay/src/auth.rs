use std::collections::HashMap;

use axum::http::HeaderMap;

use crate::error::AppError;

/// Opaque identity behind a bearer token; owns the scopes it pushes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    pub identity: String,
}

/// Bearer tokens issued out of band, mapped to identities from configuration
#[derive(Clone)]
pub struct StaticTokenAuth {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuth {
    pub const fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn verify(&self, token: &str) -> Result<AuthenticatedIdentity, AppError> {
        self.tokens
            .get(token)
            .map(|identity| AuthenticatedIdentity {
                identity: identity.clone(),
            })
            .ok_or_else(|| AppError::unauthorized("Bearer token is not recognized"))
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}
