//! Per-peer admission control.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::AppState;
use crate::error::AppError;

/// Axum middleware: rejects the request with 429 when the peer's bucket
/// is empty.
pub async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let client = peer.ip().to_string();
    if !state.limiter.allow(&client).await {
        debug!(%client, path = %request.uri().path(), "rate limited");
        return Err(AppError::TooManyRequests);
    }
    Ok(next.run(request).await)
}
