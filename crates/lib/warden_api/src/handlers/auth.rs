//! Authentication request handlers.

use axum::extract::{FromRequest, State};
use axum::http::StatusCode;
use axum::{Extension, Json};

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{
    CredentialsRequest, LogoutResponse, RefreshRequest, TokenResponse, UserIdResponse,
};

/// JSON body whose rejections render as [`AppError::Validation`].
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// `POST /auth/signup`: register a username and password.
pub async fn signup_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CredentialsRequest>,
) -> AppResult<(StatusCode, Json<UserIdResponse>)> {
    let user_id = state.auth.sign_up(&body.username, &body.password).await?;
    Ok((StatusCode::CREATED, Json(UserIdResponse { user_id })))
}

/// `POST /auth/login`: exchange credentials for a new token family.
pub async fn login_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CredentialsRequest>,
) -> AppResult<Json<TokenResponse>> {
    let pair = state.auth.login(&body.username, &body.password).await?;
    Ok(Json(pair.into()))
}

/// `POST /auth/refresh`: rotate the current refresh token.
pub async fn refresh_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RefreshRequest>,
) -> AppResult<Json<TokenResponse>> {
    let pair = state.auth.rotation().rotate(&body.refresh_token).await?;
    Ok(Json(pair.into()))
}

/// `POST /auth/logout`: invalidate every refresh token of the caller.
pub async fn logout_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
) -> AppResult<Json<LogoutResponse>> {
    state.auth.rotation().invalidate(user_id).await?;
    Ok(Json(LogoutResponse { success: true }))
}

/// `GET /auth/me`: identity of the bearer.
pub async fn me_handler(
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
) -> Json<UserIdResponse> {
    Json(UserIdResponse { user_id })
}
