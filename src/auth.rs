//! Caller identity
//!
//! Authentication happens upstream. The gateway forwards the authenticated
//! account id in `X-User-Id`; handlers take a [`Caller`] to require it.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::debug;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated user id of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub Uuid);

#[derive(Debug, PartialEq, Eq)]
pub enum AuthRejection {
    Missing,
    Malformed,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let message = match self {
            Self::Missing => "missing X-User-Id header",
            Self::Malformed => "X-User-Id is not a valid user id",
        };
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": message, "kind": "unauthenticated" })),
        )
            .into_response()
    }
}

/// Extract the caller id from request headers.
pub fn caller_from_headers(headers: &HeaderMap) -> Result<Uuid, AuthRejection> {
    let raw = headers
        .get(USER_ID_HEADER)
        .ok_or(AuthRejection::Missing)?
        .to_str()
        .map_err(|_| AuthRejection::Malformed)?;

    Uuid::parse_str(raw.trim()).map_err(|e| {
        debug!("Rejected user id '{}': {}", raw, e);
        AuthRejection::Malformed
    })
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        caller_from_headers(&parts.headers).map(Caller)
    }
}
