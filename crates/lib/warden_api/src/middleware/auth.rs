//! Bearer token extraction and access token verification.

use axum::http::header::AUTHORIZATION;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::AppState;
use crate::error::AppError;

/// Verified subject, stored in request extensions.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub Uuid);

/// Axum middleware: verifies `Authorization: Bearer <token>` and injects
/// [`AuthenticatedUser`].
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    let user_id = state.auth.rotation().verify_access_token(token)?;
    request.extensions_mut().insert(AuthenticatedUser(user_id));

    Ok(next.run(request).await)
}
