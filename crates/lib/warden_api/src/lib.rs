//! # warden_api
//!
//! HTTP API library for Warden.
//!
//! A thin delivery layer over [`warden_core`]: every request passes the
//! per-client rate limiter first, then reaches a JSON handler.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;
use warden_core::auth::service::AuthService;
use warden_core::rate_limit::RateLimiter;

use crate::handlers::{auth, health};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Credential and token flows.
    pub auth: Arc<AuthService>,
    /// Admission gate consulted before any handler runs.
    pub limiter: RateLimiter,
}

/// Builds the Axum router with all routes and shared state.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// rate limiter keys clients by peer address.
pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/auth/signup", post(auth::signup_handler))
        .route("/auth/login", post(auth::login_handler))
        .route("/auth/refresh", post(auth::refresh_handler));

    let protected = Router::new()
        .route("/auth/logout", post(auth::logout_handler))
        .route("/auth/me", get(auth::me_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
