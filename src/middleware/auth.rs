//! JWT bearer-token extractors for protected routes.
//!
//! `AuthUser` accepts any valid token; `AdminUser` additionally requires
//! the `admin` role. Both pull the decoding key from application state.

use crate::error::{AppError, AuthError};
use crate::state::AppState;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

impl Claims {
    /// The authenticated user's id. Tokens carry it as the subject claim.
    pub fn user_id(&self) -> Result<Uuid, AppError> {
        Uuid::parse_str(&self.sub).map_err(|_| {
            AppError::auth(AuthError::InvalidToken {
                message: "token subject is not a valid user id".to_string(),
            })
        })
    }

    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[derive(Debug, Clone)]
pub struct AuthUser(pub Claims);

#[derive(Debug, Clone)]
pub struct AdminUser(pub Claims);

fn decode_bearer(parts: &Parts, secret: &str) -> Result<Claims, AppError> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::auth(AuthError::MissingToken))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::auth(AuthError::MissingToken))?;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| {
        AppError::auth(AuthError::InvalidToken {
            message: e.to_string(),
        })
    })?;

    Ok(data.claims)
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let claims = decode_bearer(parts, &state.jwt_secret)?;
        Ok(AuthUser(claims))
    }
}

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let claims = decode_bearer(parts, &state.jwt_secret)?;
        if !claims.is_admin() {
            return Err(AppError::auth(AuthError::Forbidden {
                required_role: "admin".to_string(),
            }));
        }
        Ok(AdminUser(claims))
    }
}
