use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    typed_header::TypedHeaderRejection,
    TypedHeader,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

/// Identity is issued elsewhere; this service only checks the signature and
/// uses `sub` as the rider's user id.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

fn decode_claims(secret: &str, token: &str) -> Result<Claims, AppError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::Unauthenticated("invalid or expired token".to_string()))
}

// ============================================================================
// Middleware
// ============================================================================

/// Rejects the request with 401 unless it carries a valid bearer token.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let TypedHeader(Authorization(bearer)) =
        bearer.map_err(|_| AppError::Unauthenticated("missing bearer token".to_string()))?;

    let claims = decode_claims(&state.auth.secret, bearer.token())?;
    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

/// Public routes: a token is optional, but a bad one is still refused.
pub async fn optional_auth(
    State(state): State<AppState>,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Ok(TypedHeader(Authorization(bearer))) = bearer {
        let claims = decode_claims(&state.auth.secret, bearer.token())?;
        req.extensions_mut().insert(claims);
    }
    Ok(next.run(req).await)
}

// ============================================================================
// Extractors
// ============================================================================

/// The authenticated rider's user id.
#[derive(Debug, Clone)]
pub struct Caller(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .map(|claims| Caller(claims.sub.clone()))
            .ok_or_else(|| AppError::Unauthenticated("authentication required".to_string()))
    }
}

/// The rider's user id when the request was authenticated.
#[derive(Debug, Clone)]
pub struct MaybeCaller(pub Option<String>);

impl MaybeCaller {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for MaybeCaller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeCaller(
            parts.extensions.get::<Claims>().map(|claims| claims.sub.clone()),
        ))
    }
}
